//! Custom Resource Definitions for the engine API group `engine.azk.io/v1alpha1`

mod cluster;
mod control_plane;
mod node_pool;
mod node_set;
mod types;

pub use cluster::{Cluster, ClusterSpec, ClusterStatus};
pub use control_plane::{ControlPlane, ControlPlaneSpec, ControlPlaneStatus};
pub use node_pool::{NodePool, NodePoolSpec, NodePoolStatus};
pub use node_set::{NodeSet, NodeSetSpec, NodeSetStatus, NODE_SET_FINALIZER};
pub use types::{CloudConfig, ProvisioningState, VmStatus};

/// Finalizer guarding cloud teardown of the whole resource group
pub const CLUSTER_FINALIZER: &str = "cluster.finalizers.engine.azk.io";
