//! Deterministic cloud resource naming
//!
//! Every externally visible name is a pure function of the cloud
//! configuration so that bootstrap and reconciliation can recompute them
//! instead of storing them as a source of truth. Re-running any step with the
//! same inputs always addresses the same cloud resources.

/// FNV-1a offset basis (64-bit)
const FNV64_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
/// FNV-1a prime (64-bit)
const FNV64_PRIME: u64 = 0x0000_0100_0000_01b3;
/// FNV-1a offset basis (32-bit)
const FNV32_OFFSET: u32 = 0x811c_9dc5;
/// FNV-1a prime (32-bit)
const FNV32_PRIME: u32 = 0x0100_0193;

/// Seed string hashed together with the cluster name to derive the public IP
/// label
const PUBLIC_IP_SEED: &str = "azk-publicip";

/// 64-bit FNV-1a hash of the input
pub fn fnv64a(input: &str) -> u64 {
    input.bytes().fold(FNV64_OFFSET, |hash, byte| {
        (hash ^ u64::from(byte)).wrapping_mul(FNV64_PRIME)
    })
}

/// 32-bit FNV-1a hash of the input
pub fn fnv32a(input: &str) -> u32 {
    input.bytes().fold(FNV32_OFFSET, |hash, byte| {
        (hash ^ u32::from(byte)).wrapping_mul(FNV32_PRIME)
    })
}

/// Cluster name: hex FNV-64 of `<subscriptionId>/<resourceGroup>`
pub fn cluster_name(subscription_id: &str, group_name: &str) -> String {
    format!("{:x}", fnv64a(&format!("{subscription_id}/{group_name}")))
}

/// Public IP DNS label: `<dnsPrefix><hex FNV-32 of "azk-publicip-<clusterName>">`
pub fn public_ip_name(dns_prefix: &str, cluster_name: &str) -> String {
    let hash = fnv32a(&format!("{PUBLIC_IP_SEED}-{cluster_name}"));
    format!("{dns_prefix}{hash:x}")
}

/// Public DNS name: `<label>.<location>.cloudapp.azure.com` (lowercased)
pub fn public_dns_name(public_ip_name: &str, group_location: &str) -> String {
    format!(
        "{}.{}.cloudapp.azure.com",
        public_ip_name.to_lowercase(),
        group_location.to_lowercase()
    )
}

/// Internal DNS name: `<label>.internal` (lowercased)
pub fn internal_dns_name(public_ip_name: &str) -> String {
    format!("{}.internal", public_ip_name.to_lowercase())
}

/// NodeSet name for a pool generation:
/// `<poolName>-<hex FNV-64 of "<poolName>/<kubernetesVersion>">`
///
/// A different desired version always yields a different name, which is what
/// makes worker upgrades generational rather than in-place.
pub fn node_set_name(pool_name: &str, kubernetes_version: &str) -> String {
    let hash = fnv64a(&format!("{pool_name}/{kubernetes_version}"));
    format!("{pool_name}-{hash:x}")
}
