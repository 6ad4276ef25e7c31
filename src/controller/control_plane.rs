//! ControlPlane controller
//!
//! Drives the master scale set to three replicas at the desired Kubernetes
//! version. Initial provisioning renders a fresh join payload (new bootstrap
//! token, current etcd endpoints) and pushes the scale set to capacity 3;
//! upgrades run a shell script on one instance at a time through the cloud's
//! run-command channel, waiting for each node to report the new kubelet
//! version before touching the next. Sequential upgrades are what preserve
//! etcd quorum: at no point are two members down at once.

use std::sync::Arc;

use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use kube::{Resource, ResourceExt};
use tracing::{error, info, instrument};

use super::api::reasons;
use super::{action_for, guarded, surface_fatal, Context, REQUEUE_DEPENDENCY};
use crate::bootstrap::{self, scripts};
use crate::cloud::{CloudDriver, VmssParams};
use crate::crd::{ControlPlane, ProvisioningState, VmStatus};
use crate::{version, Error, Result, MASTER_VMSS_NAME};

/// Control-plane replica count; fixed for etcd quorum
const CONTROL_PLANE_REPLICAS: i32 = 3;

/// Reconcile a ControlPlane resource
#[instrument(skip(control_plane, ctx), fields(controlplane = %control_plane.name_any()))]
pub async fn reconcile(control_plane: Arc<ControlPlane>, ctx: Arc<Context>) -> Result<Action> {
    let name = control_plane.name_any();
    let result = guarded(&name, reconcile_inner(control_plane.clone(), ctx.clone())).await;
    if let Err(e) = &result {
        surface_fatal(&ctx, &control_plane.object_ref(&()), e).await;
    }
    result
}

async fn reconcile_inner(control_plane: Arc<ControlPlane>, ctx: Arc<Context>) -> Result<Action> {
    let namespace = control_plane.namespace().unwrap_or_default();

    let desired_version = version::resolve(&control_plane.spec.kubernetes_version).await?;
    let observed = control_plane.status.clone().unwrap_or_default();

    if observed.kubernetes_version == desired_version
        && observed.provisioning_state.is_succeeded()
    {
        return Ok(Action::await_change());
    }

    let cluster = ctx.api.find_cluster(&namespace).await?;
    if !cluster.is_provisioned() {
        // Wait for the cluster to initialize.
        return Ok(Action::requeue(REQUEUE_DEPENDENCY));
    }

    let driver = ctx.cloud.driver(&cluster.spec.cloud_config);

    let mut instance = (*control_plane).clone();
    let status = instance.status.get_or_insert_with(Default::default);
    if let Some(vms) = driver.list_vmss_instances(MASTER_VMSS_NAME).await? {
        status.node_status = vms;
    }

    info!(
        current = %status.kubernetes_version,
        expected = %desired_version,
        "updating control plane"
    );

    status.provisioning_state = ProvisioningState::Updating;
    ctx.api.update_control_plane_status(&instance).await?;

    // A fresh token every turn: the 1 h TTL is shorter than worst-case
    // provisioning, so tokens never outlive the reconcile that minted them.
    let bootstrap_token = ctx.tokens.mint().await?;

    let status = instance.status.get_or_insert_with(Default::default);
    let etcd_endpoints = etcd_endpoints(&status.node_status);
    let discovery_hash = cluster
        .spec
        .discovery_hashes
        .first()
        .ok_or_else(|| Error::validation("cluster has no discovery hashes"))?;

    let startup_script = scripts::control_plane_startup_script(
        &desired_version,
        &cluster.spec.public_ip_address,
        &cluster.spec.internal_dns_name,
        &bootstrap_token,
        discovery_hash,
        &etcd_endpoints,
    );

    let vm_sku_type = if instance.spec.vm_sku_type.is_empty() {
        crate::DEFAULT_VM_SKU.to_string()
    } else {
        instance.spec.vm_sku_type.clone()
    };

    let (backend_pool_ids, nat_pool_ids) = bootstrap::master_vmss_pools(&cluster.spec.cloud_config);

    info!(vmss = MASTER_VMSS_NAME, "creating or updating control-plane scale set");
    driver
        .create_or_update_vmss(&VmssParams {
            name: MASTER_VMSS_NAME.to_string(),
            subnet_id: cluster
                .spec
                .cloud_config
                .subnet_id(crate::VNET_NAME, crate::MASTER_SUBNET_NAME),
            backend_pool_ids,
            nat_pool_ids,
            custom_data: bootstrap::master_custom_data(&cluster.spec, &startup_script),
            vm_sku_type,
            capacity: CONTROL_PLANE_REPLICAS,
        })
        .await?;

    let status = instance.status.get_or_insert_with(Default::default);
    if !status.kubernetes_version.is_empty() && status.kubernetes_version != desired_version {
        let members = status.node_status.clone();
        upgrade_members(&ctx, driver.as_ref(), &members, &desired_version).await?;
    }

    ctx.guest
        .wait_for_nodes_ready(MASTER_VMSS_NAME, CONTROL_PLANE_REPLICAS as usize)
        .await?;

    let status = instance.status.get_or_insert_with(Default::default);
    status.kubernetes_version = desired_version;
    status.provisioning_state = ProvisioningState::Succeeded;
    ctx.api.update_control_plane_status(&instance).await?;

    ctx.events
        .publish(
            &control_plane.object_ref(&()),
            EventType::Normal,
            reasons::CREATED,
            "Control Plane",
        )
        .await;

    Ok(Action::await_change())
}

/// Comma-joined client endpoints of the current etcd members
fn etcd_endpoints(node_status: &[VmStatus]) -> String {
    node_status
        .iter()
        .map(|vm| format!("https://{}:2379", vm.vm_computer_name))
        .collect::<Vec<_>>()
        .join(",")
}

/// Upgrade members one at a time, stopping at the first failure.
///
/// A failed member leaves the controller parked on it: the next reconcile
/// skips already-upgraded members (their kubelet reports the new version)
/// and resumes exactly where it stopped.
async fn upgrade_members(
    ctx: &Context,
    driver: &dyn CloudDriver,
    members: &[VmStatus],
    desired_version: &str,
) -> Result<()> {
    for member in members {
        if ctx
            .guest
            .is_node_at_version(&member.vm_computer_name, desired_version)
            .await?
        {
            info!(vm = %member.vm_computer_name, "node already at expected version");
            continue;
        }

        info!(
            vm = %member.vm_computer_name,
            version = desired_version,
            "upgrading control-plane member"
        );
        driver
            .run_shell_script(
                MASTER_VMSS_NAME,
                &member.vm_instance_id,
                &scripts::upgrade_script(desired_version),
            )
            .await?;

        ctx.guest
            .wait_for_node_version(&member.vm_computer_name, desired_version)
            .await?;

        info!(vm = %member.vm_computer_name, "member upgraded");
    }
    Ok(())
}

/// Error policy for the ControlPlane controller
pub fn error_policy(control_plane: Arc<ControlPlane>, error: &Error, _ctx: Arc<Context>) -> Action {
    error!(
        controlplane = %control_plane.name_any(),
        error = %error,
        "control-plane reconciliation failed"
    );
    action_for(error)
}
