//! Shared types used across the engine CRDs

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Provisioning state of an engine resource.
///
/// Stored as a plain string on the wire (`""`, `"Updating"`, `"Scaling"`,
/// `"Succeeded"`) for compatibility with the cloud's own provisioning-state
/// vocabulary; modeled as a sum type everywhere else.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ProvisioningState {
    /// Not yet reconciled
    #[default]
    #[serde(rename = "")]
    Empty,
    /// Create or upgrade in flight
    Updating,
    /// Replica-count change in flight
    Scaling,
    /// Converged onto the desired state
    Succeeded,
}

impl ProvisioningState {
    /// Returns true once the resource has converged
    pub fn is_succeeded(&self) -> bool {
        matches!(self, ProvisioningState::Succeeded)
    }
}

impl std::fmt::Display for ProvisioningState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ProvisioningState::Empty => "",
            ProvisioningState::Updating => "Updating",
            ProvisioningState::Scaling => "Scaling",
            ProvisioningState::Succeeded => "Succeeded",
        };
        write!(f, "{s}")
    }
}

/// Identity of one VM inside a scale set
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct VmStatus {
    /// OS-level computer name, which is also the guest-cluster node name
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub vm_computer_name: String,

    /// Scale-set instance id, used for per-instance cloud operations
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub vm_instance_id: String,
}

/// Credentials and placement for one cloud subscription + resource group.
///
/// Carried on `Cluster.spec` and handed to the cloud driver builder; every
/// cloud-touching code path gates on [`CloudConfig::is_valid`] first.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CloudConfig {
    /// Cloud environment name (e.g. `AzurePublicCloud`)
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub cloud_name: String,

    /// Subscription hosting every cluster resource
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub subscription_id: String,

    /// Service-principal client id
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub client_id: String,

    /// Service-principal client secret
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub client_secret: String,

    /// AAD tenant of the service principal
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub tenant_id: String,

    /// Resource group containing all cluster resources
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub group_name: String,

    /// Location of the resource group
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub group_location: String,

    /// User agent stamped on every cloud call
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub user_agent: String,
}

impl CloudConfig {
    /// Name of the Azure public cloud environment
    pub const AZURE_PUBLIC_CLOUD: &'static str = "AzurePublicCloud";

    /// Returns true when enough fields are present to authenticate
    pub fn is_valid(&self) -> bool {
        !self.cloud_name.is_empty()
            && !self.subscription_id.is_empty()
            && !self.client_id.is_empty()
            && !self.client_secret.is_empty()
            && !self.tenant_id.is_empty()
    }

    /// ARM provider prefix for this subscription + group
    pub fn provider_prefix(&self) -> String {
        format!(
            "/subscriptions/{}/resourceGroups/{}/providers",
            self.subscription_id, self.group_name
        )
    }

    /// Fully qualified subnet id inside the cluster vnet
    pub fn subnet_id(&self, vnet_name: &str, subnet_name: &str) -> String {
        format!(
            "{}/Microsoft.Network/virtualNetworks/{}/subnets/{}",
            self.provider_prefix(),
            vnet_name,
            subnet_name
        )
    }

    /// Fully qualified backend address pool id on a load balancer
    pub fn backend_pool_id(&self, lb_name: &str, pool_name: &str) -> String {
        format!(
            "{}/Microsoft.Network/loadBalancers/{}/backendAddressPools/{}",
            self.provider_prefix(),
            lb_name,
            pool_name
        )
    }

    /// Fully qualified inbound NAT pool id on a load balancer
    pub fn nat_pool_id(&self, lb_name: &str, pool_name: &str) -> String {
        format!(
            "{}/Microsoft.Network/loadBalancers/{}/inboundNatPools/{}",
            self.provider_prefix(),
            lb_name,
            pool_name
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_config() -> CloudConfig {
        CloudConfig {
            cloud_name: CloudConfig::AZURE_PUBLIC_CLOUD.to_string(),
            subscription_id: "sub-1234".to_string(),
            client_id: "client".to_string(),
            client_secret: "secret".to_string(),
            tenant_id: "tenant".to_string(),
            group_name: "my-group".to_string(),
            group_location: "westus2".to_string(),
            user_agent: "azk".to_string(),
        }
    }

    #[test]
    fn provisioning_state_round_trips_as_strings() {
        for (state, wire) in [
            (ProvisioningState::Empty, "\"\""),
            (ProvisioningState::Updating, "\"Updating\""),
            (ProvisioningState::Scaling, "\"Scaling\""),
            (ProvisioningState::Succeeded, "\"Succeeded\""),
        ] {
            let json = serde_json::to_string(&state).unwrap();
            assert_eq!(json, wire);
            let parsed: ProvisioningState = serde_json::from_str(&json).unwrap();
            assert_eq!(parsed, state);
        }
    }

    #[test]
    fn default_state_is_empty() {
        assert_eq!(ProvisioningState::default(), ProvisioningState::Empty);
        assert!(!ProvisioningState::default().is_succeeded());
        assert!(ProvisioningState::Succeeded.is_succeeded());
    }

    #[test]
    fn cloud_config_validity_requires_credentials() {
        assert!(sample_config().is_valid());

        let mut missing_secret = sample_config();
        missing_secret.client_secret.clear();
        assert!(!missing_secret.is_valid());

        assert!(!CloudConfig::default().is_valid());
    }

    #[test]
    fn resource_ids_follow_arm_layout() {
        let config = sample_config();
        assert_eq!(
            config.subnet_id("azk-vnet", "master-subnet"),
            "/subscriptions/sub-1234/resourceGroups/my-group/providers\
             /Microsoft.Network/virtualNetworks/azk-vnet/subnets/master-subnet"
        );
        assert!(config
            .backend_pool_id("azk-lb", "master-backEndPool")
            .ends_with("/loadBalancers/azk-lb/backendAddressPools/master-backEndPool"));
        assert!(config
            .nat_pool_id("azk-lb", "natSSHPool")
            .ends_with("/loadBalancers/azk-lb/inboundNatPools/natSSHPool"));
    }
}
