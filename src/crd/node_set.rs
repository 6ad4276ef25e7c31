//! NodeSet Custom Resource Definition
//!
//! A `NodeSet` is one generation of a worker pool and owns one worker scale
//! set. Its spec is immutable in the version dimension: a new desired version
//! means a new NodeSet with a new name, never a mutation of this one.
//! Replica count is mutable in place.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{ProvisioningState, VmStatus};

/// Finalizer guarding cordon/drain and scale-set deletion
pub const NODE_SET_FINALIZER: &str = "nodesets.finalizers.engine.azk.io";

/// Specification for a NodeSet; copied from the owning NodePool
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "engine.azk.io",
    version = "v1alpha1",
    kind = "NodeSet",
    plural = "nodesets",
    status = "NodeSetStatus",
    namespaced,
    printcolumn = r#"{"name":"Version","type":"string","jsonPath":".status.kubernetesVersion"}"#,
    printcolumn = r#"{"name":"Replicas","type":"integer","jsonPath":".status.replicas"}"#,
    printcolumn = r#"{"name":"State","type":"string","jsonPath":".status.provisioningState"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct NodeSetSpec {
    /// Kubernetes version installed on every member
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub kubernetes_version: String,

    /// Desired member count
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,

    /// VM SKU of the scale set
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub vm_sku_type: String,
}

/// Status for a NodeSet
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NodeSetStatus {
    /// Member count at the last convergence
    #[serde(default)]
    pub replicas: i32,

    /// Observed Kubernetes version
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub kubernetes_version: String,

    /// Current provisioning state
    #[serde(default)]
    pub provisioning_state: ProvisioningState,

    /// Guest kubeconfig cached for cordon/drain during deletion, when the
    /// parent Cluster may already be unreachable through other means
    #[serde(default, skip_serializing_if = "String::is_empty", rename = "kubeConfig")]
    pub kubeconfig: String,

    /// VMs observed in the scale set
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub node_status: Vec<VmStatus>,
}

impl NodeSet {
    /// Name of the worker scale set owned by this NodeSet
    pub fn vmss_name(&self) -> String {
        format!("{}-agentvmss", self.metadata.name.as_deref().unwrap_or_default())
    }

    /// Desired replica count, defaulting to zero when unset
    pub fn desired_replicas(&self) -> i32 {
        self.spec.replicas.unwrap_or_default()
    }
}
