//! Cloud driver contract
//!
//! The engine never talks to the cloud's REST protocols directly. Everything
//! it needs is expressed through the [`CloudDriver`] trait: idempotent
//! create-or-update of the base infrastructure inventory, scale-set
//! operations, and per-instance run-command execution. Long-running cloud
//! operations complete before a call returns; calls are cancel-safe because
//! every step re-enters through a CreateOrUpdate.
//!
//! The SDK-backed implementation is an embedding concern. This crate ships
//! the contract plus [`sim::SimCloud`], an in-memory driver used by the test
//! suite and for local dry-runs.
//!
//! # Cloud inventory (contractual names)
//!
//! - Virtual network `azk-vnet` (10.0.0.0/8) with `master-subnet`
//!   (10.0.0.0/16, NSG `azk-master-nsg` allowing inbound tcp/22) and
//!   `agent-subnet` (10.1.0.0/16, route table `azk-routetable` attached).
//! - Public LB `azk-lb`: HTTPS probe `/healthz:6443`, rule 6443->6443,
//!   inbound NAT pool `natSSHPool` 2200-2210 -> 22.
//! - Internal LB `azk-internal-lb`: TCP probe 6443, rule 6443->6443, static
//!   frontend 10.0.0.100.
//! - Scale sets: Ubuntu 18.04-LTS, 64 GiB Premium LRS OS disk, automatic
//!   upgrade mode, zone-balanced when the region advertises zones.

pub mod sim;

use async_trait::async_trait;

#[cfg(test)]
use mockall::automock;

use crate::crd::{CloudConfig, VmStatus};
use crate::Result;

/// Everything needed to create or update one scale set
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct VmssParams {
    /// Scale-set name (also the computer-name prefix of its members)
    pub name: String,
    /// Fully qualified subnet id the members attach to
    pub subnet_id: String,
    /// Load-balancer backend pools the members join
    pub backend_pool_ids: Vec<String>,
    /// Inbound NAT pools the members join
    pub nat_pool_ids: Vec<String>,
    /// Base64-encoded cloud-init payload
    pub custom_data: String,
    /// VM SKU
    pub vm_sku_type: String,
    /// Member count
    pub capacity: i32,
}

/// Idempotent cloud operations against one resource group.
///
/// A driver handle is scoped to the subscription + resource group of the
/// [`CloudConfig`] it was built from. Every mutation is a create-or-update
/// and re-runs safely; transient failures surface as [`crate::Error::Cloud`]
/// and are retried by the calling reconciler.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait CloudDriver: Send + Sync {
    /// Upsert the resource group
    async fn create_or_update_resource_group(&self) -> Result<()>;

    /// Delete the resource group and everything in it
    async fn delete_resource_group(&self) -> Result<()>;

    /// Upsert the vnet with master/agent subnets, NSGs, and the route table
    async fn create_virtual_network_and_subnets(&self, vnet_name: &str) -> Result<()>;

    /// Upsert the internal load balancer with its static frontend
    async fn create_internal_load_balancer(
        &self,
        vnet_name: &str,
        subnet_name: &str,
        lb_name: &str,
    ) -> Result<()>;

    /// Upsert the public load balancer and its public IP
    async fn create_public_load_balancer(&self, lb_name: &str, public_ip_name: &str) -> Result<()>;

    /// Resolve the address of a public IP; the IP must already exist
    async fn get_public_ip_address(&self, public_ip_name: &str) -> Result<String>;

    /// Upsert a scale set to the given parameters
    async fn create_or_update_vmss(&self, params: &VmssParams) -> Result<()>;

    /// Change a scale set's capacity, refreshing its cloud-init payload so
    /// new members join with a fresh bootstrap token
    async fn scale_vmss(&self, vmss_name: &str, custom_data: &str, capacity: i32) -> Result<()>;

    /// Delete a scale set and all of its members
    async fn delete_vmss(&self, vmss_name: &str) -> Result<()>;

    /// Delete a single member by instance id
    async fn delete_vmss_instance(&self, vmss_name: &str, instance_id: &str) -> Result<()>;

    /// List scale-set members; `None` when the scale set does not exist
    async fn list_vmss_instances(&self, vmss_name: &str) -> Result<Option<Vec<VmStatus>>>;

    /// Run a shell script on one member and wait for it to complete
    async fn run_shell_script(
        &self,
        vmss_name: &str,
        instance_id: &str,
        script: &str,
    ) -> Result<()>;
}

/// Builds driver handles per cloud configuration.
///
/// Cloud clients are lightweight, constructed per reconcile; the builder is
/// the only process-wide cloud state.
#[cfg_attr(test, automock)]
pub trait CloudBuilder: Send + Sync {
    /// Build a driver scoped to the given configuration
    fn driver(&self, config: &CloudConfig) -> std::sync::Arc<dyn CloudDriver>;
}
