//! Cluster Custom Resource Definition
//!
//! A `Cluster` is the cluster-wide identity record: cloud placement and
//! credentials plus every secret generated at bootstrap (CA material,
//! kubeconfigs, discovery hashes, DNS names). The bootstrap engine creates
//! it; the Cluster reconciler only finalizes it and runs cloud teardown on
//! deletion.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{CloudConfig, ProvisioningState, VmStatus};

/// Specification for a Cluster
///
/// Secret fields are populated exactly once by the bootstrap engine; once
/// `status.provisioningState` reaches `Succeeded` they are immutable.
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "engine.azk.io",
    version = "v1alpha1",
    kind = "Cluster",
    plural = "clusters",
    status = "ClusterStatus",
    namespaced,
    printcolumn = r#"{"name":"State","type":"string","jsonPath":".status.provisioningState"}"#,
    printcolumn = r#"{"name":"PublicDNS","type":"string","jsonPath":".spec.publicDnsName"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSpec {
    /// Cloud placement and service-principal credentials
    #[serde(flatten)]
    pub cloud_config: CloudConfig,

    /// User-chosen DNS prefix for the public IP label
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub dns_prefix: String,

    /// Derived cluster name (hex FNV-64 of subscription/group)
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub cluster_name: String,

    /// Kubernetes version installed on the first control-plane node
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub bootstrap_kubernetes_version: String,

    /// VM SKU of the bootstrap scale set
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub bootstrap_vm_sku_type: String,

    /// Cluster CA certificate (PEM)
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub ca_certificate: String,

    /// Cluster CA private key (PEM)
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub ca_certificate_key: String,

    /// Service-account signing key (PEM)
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub service_account_key: String,

    /// Service-account public key (PEM)
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub service_account_pub: String,

    /// Front-proxy CA certificate (PEM)
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub front_proxy_ca_certificate: String,

    /// Front-proxy CA private key (PEM)
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub front_proxy_ca_certificate_key: String,

    /// etcd CA certificate (PEM)
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub etcd_ca_certificate: String,

    /// etcd CA private key (PEM)
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub etcd_ca_certificate_key: String,

    /// Admin kubeconfig pointing at the internal endpoint
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub admin_kube_config: String,

    /// Customer-facing kubeconfig pointing at `<publicDns>:443`
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub customer_kube_config: String,

    /// SPKI pins of the cluster CA, presented by joining nodes
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub discovery_hashes: Vec<String>,

    /// Public DNS name of the API server
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub public_dns_name: String,

    /// Public IP address behind the public DNS name
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub public_ip_address: String,

    /// Internal DNS name resolved via /etc/hosts pinning on members
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub internal_dns_name: String,

    /// Cloud-provider config JSON written to /etc/kubernetes/azure.json
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub azure_cloud_provider_config: String,
}

impl ClusterSpec {
    /// Returns true when cloud credentials are usable
    pub fn is_valid(&self) -> bool {
        self.cloud_config.is_valid()
    }

    /// Returns true once bootstrap has populated the PKI secrets
    pub fn has_pki(&self) -> bool {
        !self.ca_certificate.is_empty()
    }
}

/// Status for a Cluster
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterStatus {
    /// Current provisioning state; `Succeeded` is terminal until deletion
    #[serde(default)]
    pub provisioning_state: ProvisioningState,

    /// VMs observed in the bootstrap scale set
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub node_status: Vec<VmStatus>,
}

impl Cluster {
    /// Returns true when the cluster has converged and dependents may proceed
    pub fn is_provisioned(&self) -> bool {
        self.status
            .as_ref()
            .map(|s| s.provisioning_state.is_succeeded())
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_spec() -> ClusterSpec {
        ClusterSpec {
            cloud_config: CloudConfig {
                cloud_name: CloudConfig::AZURE_PUBLIC_CLOUD.to_string(),
                subscription_id: "sub".to_string(),
                client_id: "client".to_string(),
                client_secret: "secret".to_string(),
                tenant_id: "tenant".to_string(),
                group_name: "group".to_string(),
                group_location: "westus2".to_string(),
                user_agent: "azk".to_string(),
            },
            dns_prefix: "myprefix".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn cloud_config_flattens_into_spec_json() {
        let json = serde_json::to_value(sample_spec()).unwrap();
        // CloudConfig fields appear inline, not nested
        assert_eq!(json["subscriptionId"], "sub");
        assert_eq!(json["groupName"], "group");
        assert_eq!(json["dnsPrefix"], "myprefix");
        assert!(json.get("cloudConfig").is_none());
    }

    #[test]
    fn secrets_are_omitted_until_populated() {
        let json = serde_json::to_value(sample_spec()).unwrap();
        assert!(json.get("caCertificate").is_none());
        assert!(json.get("discoveryHashes").is_none());

        let mut spec = sample_spec();
        spec.ca_certificate = "PEM".to_string();
        let json = serde_json::to_value(spec).unwrap();
        assert_eq!(json["caCertificate"], "PEM");
    }

    #[test]
    fn provisioned_requires_succeeded_status() {
        let mut cluster = Cluster::new("c1", sample_spec());
        assert!(!cluster.is_provisioned());

        cluster.status = Some(ClusterStatus {
            provisioning_state: ProvisioningState::Updating,
            node_status: Vec::new(),
        });
        assert!(!cluster.is_provisioned());

        cluster.status = Some(ClusterStatus {
            provisioning_state: ProvisioningState::Succeeded,
            node_status: Vec::new(),
        });
        assert!(cluster.is_provisioned());
    }

    #[test]
    fn has_pki_reflects_bootstrap_progress() {
        let mut spec = sample_spec();
        assert!(!spec.has_pki());
        spec.ca_certificate = "PEM".to_string();
        assert!(spec.has_pki());
    }
}
