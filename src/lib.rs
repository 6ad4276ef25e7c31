//! azk - cluster-provisioning control plane for managed Kubernetes on Azure
//!
//! azk creates and continuously reconciles managed Kubernetes clusters. A
//! user submits three declarative resources - `Cluster`, `ControlPlane`,
//! `NodePool` - and the engine converges cloud resources and the guest
//! cluster onto that state: it generates a PKI, bootstraps the first
//! control-plane node, scales the control plane to three replicas behind two
//! load balancers, joins additional nodes with short-lived tokens, provisions
//! worker node pools as scale sets, and performs rolling upgrades, scale
//! in/out, and teardown.
//!
//! The controllers run *inside the guest cluster itself*: they read their own
//! desired state from the guest API and drive the cloud through the
//! [`cloud::CloudDriver`] contract.
//!
//! # Modules
//!
//! - [`crd`] - Custom Resource Definitions (Cluster, ControlPlane, NodePool, NodeSet)
//! - [`controller`] - Kubernetes controller reconciliation logic
//! - [`cloud`] - Cloud driver contract and the simulated in-memory driver
//! - [`pki`] - Cluster PKI generation and CA discovery hashes
//! - [`guest`] - Guest-cluster administration (node readiness, cordon/drain)
//! - [`bootstrap`] - Bootstrap engine, cloud-init payloads, token issuing
//! - [`names`] - Deterministic cloud resource naming
//! - [`version`] - Kubernetes release channel resolution
//! - [`error`] - Error types for the engine

#![deny(missing_docs)]

pub mod bootstrap;
pub mod cloud;
pub mod controller;
pub mod crd;
pub mod error;
pub mod guest;
pub mod names;
pub mod pki;
pub mod version;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// API group for all engine custom resources
pub const API_GROUP: &str = "engine.azk.io";

/// API version for all engine custom resources
pub const API_VERSION: &str = "v1alpha1";

/// Name of the control-plane scale set; contractual across bootstrap and the
/// ControlPlane reconciler
pub const MASTER_VMSS_NAME: &str = "azk-master-vmss";

/// Name of the cluster virtual network
pub const VNET_NAME: &str = "azk-vnet";

/// Subnet hosting control-plane instances (10.0.0.0/16)
pub const MASTER_SUBNET_NAME: &str = "master-subnet";

/// Subnet hosting worker instances (10.1.0.0/16)
pub const AGENT_SUBNET_NAME: &str = "agent-subnet";

/// Name of the public load balancer fronting the API server
pub const PUBLIC_LB_NAME: &str = "azk-lb";

/// Name of the internal load balancer at 10.0.0.100
pub const INTERNAL_LB_NAME: &str = "azk-internal-lb";

/// Static frontend address of the internal load balancer
pub const INTERNAL_LB_ADDRESS: &str = "10.0.0.100";

/// VM SKU used when a spec leaves the SKU empty
pub const DEFAULT_VM_SKU: &str = "Standard_DS2_v2";
