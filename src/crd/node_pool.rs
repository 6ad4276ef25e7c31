//! NodePool Custom Resource Definition
//!
//! A `NodePool` is a purely generational resource: it owns no cloud
//! resources itself and translates into exactly one live `NodeSet` keyed by
//! `(poolName, kubernetesVersion)`. A version bump produces a new generation;
//! the stale generation is garbage-collected once the new one converges.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::ProvisioningState;
use crate::names;

/// Specification for a NodePool
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "engine.azk.io",
    version = "v1alpha1",
    kind = "NodePool",
    plural = "nodepools",
    status = "NodePoolStatus",
    namespaced,
    printcolumn = r#"{"name":"Version","type":"string","jsonPath":".status.kubernetesVersion"}"#,
    printcolumn = r#"{"name":"Replicas","type":"integer","jsonPath":".status.vmReplicas"}"#,
    printcolumn = r#"{"name":"State","type":"string","jsonPath":".status.provisioningState"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct NodePoolSpec {
    /// Desired Kubernetes version of the worker nodes
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub kubernetes_version: String,

    /// Desired worker count
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,

    /// VM SKU of the worker scale set
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub vm_sku_type: String,
}

/// Status for a NodePool, mirrored from its current NodeSet
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NodePoolStatus {
    /// Name of the current NodeSet generation
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub node_set_name: String,

    /// Replica count reported by the current NodeSet
    #[serde(default)]
    pub replicas: i32,

    /// VMs actually present in the current NodeSet's scale set
    #[serde(default)]
    pub vm_replicas: i32,

    /// Kubernetes version reported by the current NodeSet
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub kubernetes_version: String,

    /// Provisioning state reported by the current NodeSet
    #[serde(default)]
    pub provisioning_state: ProvisioningState,
}

impl NodePool {
    /// Name of the NodeSet generation for the currently desired version
    pub fn child_name(&self) -> String {
        names::node_set_name(
            self.metadata.name.as_deref().unwrap_or_default(),
            &self.spec.kubernetes_version,
        )
    }
}
