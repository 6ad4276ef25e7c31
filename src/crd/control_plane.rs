//! ControlPlane Custom Resource Definition
//!
//! One `ControlPlane` per cluster namespace. The reconciler drives the
//! control-plane scale set to three replicas at the desired Kubernetes
//! version and performs strictly sequential in-place upgrades.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{ProvisioningState, VmStatus};

/// Specification for a ControlPlane
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "engine.azk.io",
    version = "v1alpha1",
    kind = "ControlPlane",
    plural = "controlplanes",
    status = "ControlPlaneStatus",
    namespaced,
    printcolumn = r#"{"name":"Version","type":"string","jsonPath":".status.kubernetesVersion"}"#,
    printcolumn = r#"{"name":"State","type":"string","jsonPath":".status.provisioningState"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ControlPlaneSpec {
    /// Desired Kubernetes version (`x.y.z`, `stable`, or `latest`)
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub kubernetes_version: String,

    /// VM SKU of the control-plane scale set
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub vm_sku_type: String,
}

/// Status for a ControlPlane
///
/// When `kubernetesVersion` equals the spec version and the state is
/// `Succeeded`, the control-plane scale set has exactly three Ready nodes at
/// that version.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ControlPlaneStatus {
    /// Observed Kubernetes version across all instances
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub kubernetes_version: String,

    /// Current provisioning state
    #[serde(default)]
    pub provisioning_state: ProvisioningState,

    /// VMs observed in the control-plane scale set
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub node_status: Vec<VmStatus>,
}

impl ControlPlane {
    /// Returns true when the observed version matches the desired one
    pub fn at_desired_version(&self) -> bool {
        self.status
            .as_ref()
            .map(|s| s.kubernetes_version == self.spec.kubernetes_version)
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_convergence_is_observable() {
        let mut cp = ControlPlane::new(
            "cp",
            ControlPlaneSpec {
                kubernetes_version: "1.18.0".to_string(),
                vm_sku_type: String::new(),
            },
        );
        assert!(!cp.at_desired_version());

        cp.status = Some(ControlPlaneStatus {
            kubernetes_version: "1.18.0".to_string(),
            provisioning_state: ProvisioningState::Succeeded,
            node_status: Vec::new(),
        });
        assert!(cp.at_desired_version());

        cp.spec.kubernetes_version = "1.18.3".to_string();
        assert!(!cp.at_desired_version(), "version bump reopens the gap");
    }

    #[test]
    fn status_serializes_in_camel_case() {
        let status = ControlPlaneStatus {
            kubernetes_version: "1.18.0".to_string(),
            provisioning_state: ProvisioningState::Succeeded,
            node_status: vec![VmStatus {
                vm_computer_name: "azk-master-vmss000000".to_string(),
                vm_instance_id: "0".to_string(),
            }],
        };
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["kubernetesVersion"], "1.18.0");
        assert_eq!(json["provisioningState"], "Succeeded");
        assert_eq!(json["nodeStatus"][0]["vmComputerName"], "azk-master-vmss000000");
        assert_eq!(json["nodeStatus"][0]["vmInstanceId"], "0");
    }
}
