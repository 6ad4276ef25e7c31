//! Bootstrap engine
//!
//! Turns a cloud configuration into a running single-node control plane: it
//! derives the deterministic cluster identity, generates the PKI and
//! kubeconfigs, renders the first master's cloud-init payload, and drives the
//! cloud driver through base infrastructure (resource group, vnet, both load
//! balancers) and the initial one-node master scale set.
//!
//! Every step is a create-or-update and re-runs safely. PKI material is
//! generated exactly once: a spec whose `caCertificate` is already populated
//! is never regenerated, so re-running bootstrap converges on the same cloud
//! state with the same secrets.

pub mod cloudinit;
pub mod scripts;
pub mod token;

use std::sync::Arc;

use tracing::info;

use crate::cloud::{CloudBuilder, VmssParams};
use crate::crd::{CloudConfig, ClusterSpec};
use crate::pki::{self, PkiParams, PkiProvider};
use crate::{names, Error, Result};
use cloudinit::CloudInit;
use scripts::CniFlavor;

/// Backend pool on the public load balancer joined by masters
pub const PUBLIC_LB_BACKEND_POOL: &str = "master-backEndPool";

/// Backend pool on the internal load balancer joined by masters
pub const INTERNAL_LB_BACKEND_POOL: &str = "master-internal-backEndPool";

/// Inbound NAT pool mapping 2200-2210 onto member ssh
pub const NAT_SSH_POOL: &str = "natSSHPool";

/// Path every member's startup script is written to and executed from
pub const STARTUP_SCRIPT_PATH: &str = "/etc/kubernetes/init-azure-bootstrap.sh";

/// Builds cluster specs and drives initial infrastructure creation
pub struct BootstrapEngine {
    pki: Arc<dyn PkiProvider>,
    cloud: Arc<dyn CloudBuilder>,
    cni: CniFlavor,
}

impl BootstrapEngine {
    /// Create an engine over the given PKI provider and cloud builder
    pub fn new(pki: Arc<dyn PkiProvider>, cloud: Arc<dyn CloudBuilder>) -> Self {
        Self {
            pki,
            cloud,
            cni: CniFlavor::default(),
        }
    }

    /// Select the CNI applied after `kubeadm init`
    pub fn with_cni(mut self, cni: CniFlavor) -> Self {
        self.cni = cni;
        self
    }

    /// Build a complete cluster spec from scratch
    pub fn create_spec(
        &self,
        cloud_config: &CloudConfig,
        dns_prefix: &str,
        vm_sku_type: &str,
        kubernetes_version: &str,
    ) -> Result<ClusterSpec> {
        if !cloud_config.is_valid() {
            return Err(Error::validation("cloud configuration is missing credentials"));
        }

        let mut spec = ClusterSpec {
            cloud_config: cloud_config.clone(),
            dns_prefix: dns_prefix.to_string(),
            bootstrap_kubernetes_version: kubernetes_version.to_string(),
            bootstrap_vm_sku_type: vm_sku_type.to_string(),
            ..Default::default()
        };
        self.complete_spec(&mut spec)?;
        Ok(spec)
    }

    /// Fill every derivable field that is still empty.
    ///
    /// Names are recomputed from the cloud configuration (they are pure
    /// functions of it); secrets are only generated when absent.
    pub fn complete_spec(&self, spec: &mut ClusterSpec) -> Result<()> {
        if spec.cluster_name.is_empty() {
            spec.cluster_name = names::cluster_name(
                &spec.cloud_config.subscription_id,
                &spec.cloud_config.group_name,
            );
        }

        let ip_label = names::public_ip_name(&spec.dns_prefix, &spec.cluster_name);
        if spec.public_dns_name.is_empty() {
            spec.public_dns_name =
                names::public_dns_name(&ip_label, &spec.cloud_config.group_location);
        }
        if spec.internal_dns_name.is_empty() {
            spec.internal_dns_name = names::internal_dns_name(&ip_label);
        }

        if !spec.has_pki() {
            info!(cluster = %spec.cluster_name, "generating cluster PKI");
            let bundle = self.pki.create_pki(&PkiParams {
                cluster_name: spec.cluster_name.clone(),
                public_dns_name: spec.public_dns_name.clone(),
                internal_dns_name: spec.internal_dns_name.clone(),
            })?;

            spec.ca_certificate = bundle.ca.cert_pem;
            spec.ca_certificate_key = bundle.ca.key_pem;
            spec.front_proxy_ca_certificate = bundle.front_proxy_ca.cert_pem;
            spec.front_proxy_ca_certificate_key = bundle.front_proxy_ca.key_pem;
            spec.etcd_ca_certificate = bundle.etcd_ca.cert_pem;
            spec.etcd_ca_certificate_key = bundle.etcd_ca.key_pem;
            spec.service_account_key = bundle.service_account_key_pem;
            spec.service_account_pub = bundle.service_account_pub_pem;
            spec.admin_kube_config = bundle.admin_kubeconfig;
            spec.customer_kube_config = bundle.customer_kubeconfig;
        }

        if spec.discovery_hashes.is_empty() {
            spec.discovery_hashes = pki::discovery_hashes(&spec.admin_kube_config)?;
        }

        if spec.azure_cloud_provider_config.is_empty() {
            spec.azure_cloud_provider_config = cloud_provider_config(&spec.cloud_config);
        }

        Ok(())
    }

    /// Create base infrastructure and the initial one-node master scale set
    pub async fn bootstrap(&self, spec: &mut ClusterSpec) -> Result<()> {
        self.create_base_infrastructure(spec).await?;
        self.create_infrastructure(spec).await
    }

    /// Resource group, vnet + subnets, and both load balancers
    pub async fn create_base_infrastructure(&self, spec: &mut ClusterSpec) -> Result<()> {
        let driver = self.cloud.driver(&spec.cloud_config);

        info!(group = %spec.cloud_config.group_name, "creating resource group");
        driver.create_or_update_resource_group().await?;

        info!(vnet = crate::VNET_NAME, "creating virtual network");
        driver
            .create_virtual_network_and_subnets(crate::VNET_NAME)
            .await?;

        info!(lb = crate::INTERNAL_LB_NAME, "creating internal load balancer");
        driver
            .create_internal_load_balancer(
                crate::VNET_NAME,
                crate::MASTER_SUBNET_NAME,
                crate::INTERNAL_LB_NAME,
            )
            .await?;

        let ip_label = names::public_ip_name(&spec.dns_prefix, &spec.cluster_name);
        info!(lb = crate::PUBLIC_LB_NAME, ip = %ip_label, "creating public load balancer");
        driver
            .create_public_load_balancer(crate::PUBLIC_LB_NAME, &ip_label)
            .await?;

        let address = driver.get_public_ip_address(&ip_label).await?;
        info!(ip = %ip_label, address = %address, "established public IP");
        spec.public_ip_address = address;

        Ok(())
    }

    /// The one-node master scale set running `kubeadm init`
    pub async fn create_infrastructure(&self, spec: &ClusterSpec) -> Result<()> {
        let driver = self.cloud.driver(&spec.cloud_config);

        let vm_sku_type = if spec.bootstrap_vm_sku_type.is_empty() {
            crate::DEFAULT_VM_SKU.to_string()
        } else {
            spec.bootstrap_vm_sku_type.clone()
        };

        let startup_script = scripts::bootstrap_startup_script(
            &spec.bootstrap_kubernetes_version,
            &spec.public_dns_name,
            &spec.internal_dns_name,
            self.cni,
        );

        let (backend_pool_ids, nat_pool_ids) = master_vmss_pools(&spec.cloud_config);

        info!(vmss = crate::MASTER_VMSS_NAME, "creating bootstrap scale set");
        driver
            .create_or_update_vmss(&VmssParams {
                name: crate::MASTER_VMSS_NAME.to_string(),
                subnet_id: spec
                    .cloud_config
                    .subnet_id(crate::VNET_NAME, crate::MASTER_SUBNET_NAME),
                backend_pool_ids,
                nat_pool_ids,
                custom_data: master_custom_data(spec, &startup_script),
                vm_sku_type,
                capacity: 1,
            })
            .await?;

        Ok(())
    }

    /// Tear down the resource group and everything in it
    pub async fn cleanup_infrastructure(&self, config: &CloudConfig) -> Result<()> {
        let driver = self.cloud.driver(config);
        info!(group = %config.group_name, "deleting resource group");
        driver.delete_resource_group().await
    }
}

/// Backend pool and NAT pool ids joined by master scale-set members
pub fn master_vmss_pools(config: &CloudConfig) -> (Vec<String>, Vec<String>) {
    (
        vec![
            config.backend_pool_id(crate::PUBLIC_LB_NAME, PUBLIC_LB_BACKEND_POOL),
            config.backend_pool_id(crate::INTERNAL_LB_NAME, INTERNAL_LB_BACKEND_POOL),
        ],
        vec![config.nat_pool_id(crate::PUBLIC_LB_NAME, NAT_SSH_POOL)],
    )
}

/// Cloud-provider config JSON written to `/etc/kubernetes/azure.json`
pub fn cloud_provider_config(config: &CloudConfig) -> String {
    let value = serde_json::json!({
        "cloud": CloudConfig::AZURE_PUBLIC_CLOUD,
        "tenantId": config.tenant_id,
        "subscriptionId": config.subscription_id,
        "aadClientId": config.client_id,
        "aadClientSecret": config.client_secret,
        "resourceGroup": config.group_name,
        "location": config.group_location,
        "vmType": "vmss",
        "subnetName": crate::AGENT_SUBNET_NAME,
        "securityGroupName": "azk-nsg",
        "vnetName": crate::VNET_NAME,
        "vnetResourceGroup": config.group_name,
        "routeTableName": "azk-routetable",
        "primaryAvailabilitySetName": "",
        "primaryScaleSetName": "",
        "cloudProviderBackoff": true,
        "cloudProviderBackoffRetries": 6,
        "cloudProviderBackoffExponent": 1.5,
        "cloudProviderBackoffDuration": 5,
        "cloudProviderBackoffJitter": 1.0,
        "cloudProviderRatelimit": true,
        "cloudProviderRateLimitQPS": 3.0,
        "cloudProviderRateLimitBucket": 10,
        "useManagedIdentityExtension": false,
        "userAssignedIdentityID": "",
        "useInstanceMetadata": true,
        "loadBalancerSku": "Standard",
        "excludeMasterFromStandardLB": true,
        "maximumLoadBalancerRuleCount": 250
    });
    serde_json::to_string_pretty(&value).expect("static json serializes")
}

/// PKI material pinned onto every master, path -> PEM contents
pub fn pki_files(spec: &ClusterSpec) -> Vec<(String, String)> {
    vec![
        ("/etc/kubernetes/pki/ca.crt".to_string(), spec.ca_certificate.clone()),
        ("/etc/kubernetes/pki/ca.key".to_string(), spec.ca_certificate_key.clone()),
        ("/etc/kubernetes/pki/sa.key".to_string(), spec.service_account_key.clone()),
        ("/etc/kubernetes/pki/sa.pub".to_string(), spec.service_account_pub.clone()),
        (
            "/etc/kubernetes/pki/front-proxy-ca.crt".to_string(),
            spec.front_proxy_ca_certificate.clone(),
        ),
        (
            "/etc/kubernetes/pki/front-proxy-ca.key".to_string(),
            spec.front_proxy_ca_certificate_key.clone(),
        ),
        ("/etc/kubernetes/pki/etcd/ca.crt".to_string(), spec.etcd_ca_certificate.clone()),
        ("/etc/kubernetes/pki/etcd/ca.key".to_string(), spec.etcd_ca_certificate_key.clone()),
        ("/etc/kubernetes/azure.json".to_string(), spec.azure_cloud_provider_config.clone()),
    ]
}

/// Encoded cloud-init for a master: full PKI plus the startup script
pub fn master_custom_data(spec: &ClusterSpec, startup_script: &str) -> String {
    let mut payload = CloudInit::new();
    for (path, contents) in pki_files(spec) {
        payload = payload.data_file(path, contents);
    }
    payload.script_file(STARTUP_SCRIPT_PATH, startup_script).encode()
}

/// Encoded cloud-init for a worker: cloud-provider config plus the startup
/// script; workers never receive CA keys
pub fn worker_custom_data(spec: &ClusterSpec, startup_script: &str) -> String {
    CloudInit::new()
        .data_file("/etc/kubernetes/azure.json", &spec.azure_cloud_provider_config)
        .script_file(STARTUP_SCRIPT_PATH, startup_script)
        .encode()
}
