//! NodeSet controller
//!
//! Owns one worker scale set per NodeSet generation. Creation renders a
//! worker join payload with a fresh bootstrap token; scaling mutates
//! capacity in place, cordoning and draining members that fall off the end;
//! deletion runs behind a finalizer that drains every member and must see
//! the scale-set delete succeed before the finalizer is released.

use std::sync::Arc;

use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use kube::{Resource, ResourceExt};
use tracing::{error, info, instrument, warn};

use super::api::reasons;
use super::{action_for, guarded, surface_fatal, Context, REQUEUE_DEPENDENCY, REQUEUE_NOW};
use crate::bootstrap::{self, scripts};
use crate::cloud::{CloudDriver, VmssParams};
use crate::crd::{Cluster, NodeSet, ProvisioningState, VmStatus, NODE_SET_FINALIZER};
use crate::{version, Error, Result};

/// Reconcile a NodeSet resource
#[instrument(skip(node_set, ctx), fields(nodeset = %node_set.name_any()))]
pub async fn reconcile(node_set: Arc<NodeSet>, ctx: Arc<Context>) -> Result<Action> {
    let name = node_set.name_any();
    let result = guarded(&name, reconcile_inner(node_set.clone(), ctx.clone())).await;
    if let Err(e) = &result {
        surface_fatal(&ctx, &node_set.object_ref(&()), e).await;
    }
    result
}

async fn reconcile_inner(node_set: Arc<NodeSet>, ctx: Arc<Context>) -> Result<Action> {
    let namespace = node_set.namespace().unwrap_or_default();
    let has_finalizer = node_set.finalizers().iter().any(|f| f == NODE_SET_FINALIZER);

    if node_set.metadata.deletion_timestamp.is_some() {
        if has_finalizer {
            finalize(&node_set, &ctx, &namespace).await?;
        }
        return Ok(Action::await_change());
    }

    if !has_finalizer {
        let mut updated = (*node_set).clone();
        updated
            .metadata
            .finalizers
            .get_or_insert_with(Vec::new)
            .push(NODE_SET_FINALIZER.to_string());
        ctx.api.update_node_set(&updated).await?;
        return Ok(Action::requeue(REQUEUE_NOW));
    }

    let cluster = ctx.api.find_cluster(&namespace).await?;
    if !cluster.is_provisioned() {
        // Wait for the cluster to initialize.
        return Ok(Action::requeue(REQUEUE_DEPENDENCY));
    }

    let desired_version = version::resolve(&node_set.spec.kubernetes_version).await?;
    let driver = ctx.cloud.driver(&cluster.spec.cloud_config);
    let vmss_name = node_set.vmss_name();

    let mut instance = (*node_set).clone();
    let replicas = instance.desired_replicas();

    let Some(vms) = driver.list_vmss_instances(&vmss_name).await? else {
        return create_node_set(&mut instance, &ctx, &cluster, driver.as_ref(), &desired_version)
            .await;
    };
    let status = instance.status.get_or_insert_with(Default::default);
    status.node_status = sorted_by_instance_id(vms);

    if replicas != status.node_status.len() as i32 {
        return scale_node_set(&mut instance, &ctx, &cluster, driver.as_ref(), &desired_version)
            .await;
    }

    ctx.guest
        .wait_for_nodes_ready(&node_set.name_any(), replicas.max(0) as usize)
        .await?;

    let status = instance.status.get_or_insert_with(Default::default);
    status.kubernetes_version = desired_version;
    status.provisioning_state = ProvisioningState::Succeeded;
    status.kubeconfig = cluster.spec.customer_kube_config.clone();
    status.replicas = status.node_status.len() as i32;
    ctx.api.update_node_set_status(&instance).await?;

    Ok(Action::await_change())
}

/// Finalizer path: drain every member, delete the scale set, release the
/// finalizer.
///
/// Drain failures are logged and ignored (the scale-set delete evicts
/// forcefully), but the finalizer is only removed once `delete_vmss` has
/// returned success.
async fn finalize(node_set: &NodeSet, ctx: &Context, namespace: &str) -> Result<()> {
    let vmss_name = node_set.vmss_name();

    match ctx.api.find_cluster(namespace).await {
        Ok(cluster) if cluster.spec.is_valid() => {
            let status = node_set.status.clone().unwrap_or_default();
            for vm in &status.node_status {
                if let Err(e) = ctx
                    .guest
                    .cordon_drain_and_delete(&status.kubeconfig, &vm.vm_computer_name)
                    .await
                {
                    warn!(vm = %vm.vm_computer_name, error = %e, "drain failed, continuing");
                }
            }

            info!(vmss = %vmss_name, "deleting nodeset scale set");
            ctx.cloud
                .driver(&cluster.spec.cloud_config)
                .delete_vmss(&vmss_name)
                .await?;
        }
        Ok(_) => {
            warn!(vmss = %vmss_name, "cloud configuration invalid, skipping scale-set delete");
        }
        Err(_) => {
            // The cluster object is already gone; there is nothing left to
            // drain against or delete with.
            warn!(vmss = %vmss_name, "no cluster found, skipping scale-set delete");
        }
    }

    let mut updated = node_set.clone();
    if let Some(finalizers) = updated.metadata.finalizers.as_mut() {
        finalizers.retain(|f| f != NODE_SET_FINALIZER);
    }
    ctx.api.update_node_set(&updated).await
}

/// Create path: fresh token, worker join payload, scale set at the desired
/// capacity
async fn create_node_set(
    instance: &mut NodeSet,
    ctx: &Context,
    cluster: &Cluster,
    driver: &dyn CloudDriver,
    desired_version: &str,
) -> Result<Action> {
    let vmss_name = instance.vmss_name();

    let status = instance.status.get_or_insert_with(Default::default);
    status.provisioning_state = ProvisioningState::Updating;
    ctx.api.update_node_set_status(instance).await?;

    let custom_data = render_custom_data(ctx, cluster, desired_version).await?;

    let vm_sku_type = if instance.spec.vm_sku_type.is_empty() {
        crate::DEFAULT_VM_SKU.to_string()
    } else {
        instance.spec.vm_sku_type.clone()
    };

    info!(vmss = %vmss_name, replicas = instance.desired_replicas(), "creating nodeset scale set");
    driver
        .create_or_update_vmss(&VmssParams {
            name: vmss_name.clone(),
            subnet_id: cluster
                .spec
                .cloud_config
                .subnet_id(crate::VNET_NAME, crate::AGENT_SUBNET_NAME),
            backend_pool_ids: Vec::new(),
            nat_pool_ids: Vec::new(),
            custom_data,
            vm_sku_type,
            capacity: instance.desired_replicas(),
        })
        .await?;

    ctx.events
        .publish(
            &instance.object_ref(&()),
            EventType::Normal,
            reasons::CREATED,
            &vmss_name,
        )
        .await;
    Ok(Action::requeue(REQUEUE_NOW))
}

/// Scale path: drain members beyond the target count, delete them by
/// instance id, then push the new capacity with a fresh join payload
async fn scale_node_set(
    instance: &mut NodeSet,
    ctx: &Context,
    cluster: &Cluster,
    driver: &dyn CloudDriver,
    desired_version: &str,
) -> Result<Action> {
    let vmss_name = instance.vmss_name();
    let replicas = instance.desired_replicas();

    let status = instance.status.get_or_insert_with(Default::default);
    let current = status.node_status.len();
    status.provisioning_state = ProvisioningState::Scaling;
    ctx.api.update_node_set_status(instance).await?;

    let status = instance.status.get_or_insert_with(Default::default);
    let kubeconfig = status.kubeconfig.clone();
    let excess: Vec<VmStatus> = status
        .node_status
        .iter()
        .skip(replicas.max(0) as usize)
        .cloned()
        .collect();

    for vm in &excess {
        ctx.guest
            .cordon_drain_and_delete(&kubeconfig, &vm.vm_computer_name)
            .await?;

        info!(vmss = %vmss_name, instance_id = %vm.vm_instance_id, "scaling down");
        driver
            .delete_vmss_instance(&vmss_name, &vm.vm_instance_id)
            .await?;
    }

    let custom_data = render_custom_data(ctx, cluster, desired_version).await?;
    driver.scale_vmss(&vmss_name, &custom_data, replicas).await?;

    ctx.events
        .publish(
            &instance.object_ref(&()),
            EventType::Normal,
            reasons::SCALED,
            &format!("{current} to {replicas}"),
        )
        .await;
    Ok(Action::requeue(REQUEUE_NOW))
}

/// Render the worker cloud-init payload with a token minted this turn
async fn render_custom_data(
    ctx: &Context,
    cluster: &Cluster,
    desired_version: &str,
) -> Result<String> {
    let bootstrap_token = ctx.tokens.mint().await?;
    let discovery_hash = cluster
        .spec
        .discovery_hashes
        .first()
        .ok_or_else(|| Error::validation("cluster has no discovery hashes"))?;

    let startup_script = scripts::node_startup_script(
        desired_version,
        &cluster.spec.internal_dns_name,
        &bootstrap_token,
        discovery_hash,
    );
    Ok(bootstrap::worker_custom_data(&cluster.spec, &startup_script))
}

/// Order members by numeric instance id so scale-down always keeps the same
/// first N regardless of how the cloud happened to list them
fn sorted_by_instance_id(mut vms: Vec<VmStatus>) -> Vec<VmStatus> {
    vms.sort_by(|a, b| {
        match (
            a.vm_instance_id.parse::<u64>(),
            b.vm_instance_id.parse::<u64>(),
        ) {
            (Ok(x), Ok(y)) => x.cmp(&y),
            _ => a.vm_instance_id.cmp(&b.vm_instance_id),
        }
    });
    vms
}

/// Error policy for the NodeSet controller
pub fn error_policy(node_set: Arc<NodeSet>, error: &Error, _ctx: Arc<Context>) -> Action {
    error!(
        nodeset = %node_set.name_any(),
        error = %error,
        "nodeset reconciliation failed"
    );
    action_for(error)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bootstrap::token::MockTokenIssuer;
    use crate::cloud::{MockCloudBuilder, MockCloudDriver};
    use crate::controller::api::{MockEngineApi, MockEventPublisher};
    use crate::crd::{CloudConfig, ClusterSpec, ClusterStatus, NodeSetSpec, NodeSetStatus};
    use crate::guest::MockGuestClusterAdmin;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;

    fn provisioned_cluster() -> Cluster {
        let mut cluster = Cluster::new(
            "c1",
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
                internal_dns_name: "pub.internal".to_string(),
                discovery_hashes: vec!["sha256:deadbeef".to_string()],
                azure_cloud_provider_config: "{}".to_string(),
                customer_kube_config: "apiVersion: v1".to_string(),
                ..Default::default()
            },
        );
        cluster.metadata.namespace = Some("default".to_string());
        cluster.status = Some(ClusterStatus {
            provisioning_state: ProvisioningState::Succeeded,
            node_status: Vec::new(),
        });
        cluster
    }

    fn node_set(replicas: i32) -> NodeSet {
        let mut set = NodeSet::new(
            "np1-abc123",
            NodeSetSpec {
                kubernetes_version: "1.18.0".to_string(),
                replicas: Some(replicas),
                vm_sku_type: String::new(),
            },
        );
        set.metadata.namespace = Some("default".to_string());
        set.metadata.finalizers = Some(vec![NODE_SET_FINALIZER.to_string()]);
        set
    }

    fn workers(count: usize) -> Vec<VmStatus> {
        (0..count)
            .map(|i| VmStatus {
                vm_computer_name: format!("np1-abc123-agentvmss{i:06}"),
                vm_instance_id: i.to_string(),
            })
            .collect()
    }

    fn quiet_events() -> Arc<MockEventPublisher> {
        let mut events = MockEventPublisher::new();
        events.expect_publish().returning(|_, _, _, _| ());
        Arc::new(events)
    }

    struct Mocks {
        api: MockEngineApi,
        driver: MockCloudDriver,
        guest: MockGuestClusterAdmin,
        tokens: MockTokenIssuer,
    }

    impl Mocks {
        fn new() -> Self {
            Self {
                api: MockEngineApi::new(),
                driver: MockCloudDriver::new(),
                guest: MockGuestClusterAdmin::new(),
                tokens: MockTokenIssuer::new(),
            }
        }

        fn into_context(self) -> Arc<Context> {
            let driver = Arc::new(self.driver);
            let mut cloud = MockCloudBuilder::new();
            cloud
                .expect_driver()
                .returning(move |_| -> Arc<dyn CloudDriver> { driver.clone() });
            Arc::new(Context::with_collaborators(
                Arc::new(self.api),
                quiet_events(),
                Arc::new(cloud),
                Arc::new(self.guest),
                Arc::new(self.tokens),
            ))
        }
    }

    #[tokio::test]
    async fn adds_finalizer_first() {
        let mut set = node_set(2);
        set.metadata.finalizers = None;

        let mut mocks = Mocks::new();
        mocks
            .api
            .expect_update_node_set()
            .withf(|s: &NodeSet| s.finalizers().iter().any(|f| f == NODE_SET_FINALIZER))
            .times(1)
            .returning(|_| Ok(()));

        let action = reconcile(Arc::new(set), mocks.into_context()).await.unwrap();
        assert_eq!(action, Action::requeue(REQUEUE_NOW));
    }

    #[tokio::test]
    async fn creates_the_scale_set_with_fresh_token() {
        let mut mocks = Mocks::new();
        mocks
            .api
            .expect_find_cluster()
            .returning(|_| Ok(provisioned_cluster()));
        mocks
            .api
            .expect_update_node_set_status()
            .returning(|_| Ok(()));
        mocks.driver.expect_list_vmss_instances().returning(|_| Ok(None));
        mocks
            .tokens
            .expect_mint()
            .times(1)
            .returning(|| Ok("abcdef.0123456789abcdef".to_string()));
        mocks
            .driver
            .expect_create_or_update_vmss()
            .withf(|params: &VmssParams| {
                params.name == "np1-abc123-agentvmss"
                    && params.capacity == 2
                    && params.backend_pool_ids.is_empty()
                    && params.nat_pool_ids.is_empty()
                    && params.subnet_id.ends_with("/subnets/agent-subnet")
            })
            .times(1)
            .returning(|_| Ok(()));

        let action = reconcile(Arc::new(node_set(2)), mocks.into_context())
            .await
            .unwrap();
        assert_eq!(action, Action::requeue(REQUEUE_NOW));
    }

    #[tokio::test]
    async fn converges_and_caches_the_kubeconfig() {
        let mut mocks = Mocks::new();
        mocks
            .api
            .expect_find_cluster()
            .returning(|_| Ok(provisioned_cluster()));
        mocks
            .driver
            .expect_list_vmss_instances()
            .returning(|_| Ok(Some(workers(2))));
        mocks
            .guest
            .expect_wait_for_nodes_ready()
            .withf(|prefix: &str, count: &usize| prefix == "np1-abc123" && *count == 2)
            .returning(|_, _| Ok(()));
        mocks
            .api
            .expect_update_node_set_status()
            .withf(|set: &NodeSet| {
                let status = set.status.as_ref().unwrap();
                status.provisioning_state == ProvisioningState::Succeeded
                    && status.kubernetes_version == "1.18.0"
                    && status.kubeconfig == "apiVersion: v1"
                    && status.replicas == 2
            })
            .times(1)
            .returning(|_| Ok(()));

        let action = reconcile(Arc::new(node_set(2)), mocks.into_context())
            .await
            .unwrap();
        assert_eq!(action, Action::await_change());
    }

    #[tokio::test]
    async fn scale_down_drains_the_tail_members() {
        let mut set = node_set(1);
        set.status = Some(NodeSetStatus {
            replicas: 3,
            kubernetes_version: "1.18.0".to_string(),
            provisioning_state: ProvisioningState::Succeeded,
            kubeconfig: "apiVersion: v1".to_string(),
            node_status: workers(3),
        });

        let mut mocks = Mocks::new();
        mocks
            .api
            .expect_find_cluster()
            .returning(|_| Ok(provisioned_cluster()));
        mocks
            .api
            .expect_update_node_set_status()
            .returning(|_| Ok(()));
        // The cloud lists members out of order; indexes >= 1 are retired.
        mocks.driver.expect_list_vmss_instances().returning(|_| {
            let mut vms = workers(3);
            vms.reverse();
            Ok(Some(vms))
        });
        mocks
            .guest
            .expect_cordon_drain_and_delete()
            .withf(|_: &str, name: &str| {
                name.ends_with("000001") || name.ends_with("000002")
            })
            .times(2)
            .returning(|_, _| Ok(()));
        mocks
            .driver
            .expect_delete_vmss_instance()
            .withf(|_: &str, id: &str| id == "1" || id == "2")
            .times(2)
            .returning(|_, _| Ok(()));
        mocks
            .tokens
            .expect_mint()
            .returning(|| Ok("abcdef.0123456789abcdef".to_string()));
        mocks
            .driver
            .expect_scale_vmss()
            .withf(|name: &str, _: &str, capacity: &i32| {
                name == "np1-abc123-agentvmss" && *capacity == 1
            })
            .times(1)
            .returning(|_, _, _| Ok(()));

        let action = reconcile(Arc::new(set), mocks.into_context()).await.unwrap();
        assert_eq!(action, Action::requeue(REQUEUE_NOW));
    }

    #[tokio::test]
    async fn finalizer_released_only_after_vmss_delete_succeeds() {
        let mut set = node_set(2);
        set.metadata.deletion_timestamp = Some(Time(chrono::Utc::now()));
        set.status = Some(NodeSetStatus {
            node_status: workers(2),
            kubeconfig: "apiVersion: v1".to_string(),
            ..Default::default()
        });

        let mut mocks = Mocks::new();
        mocks
            .api
            .expect_find_cluster()
            .returning(|_| Ok(provisioned_cluster()));
        mocks
            .guest
            .expect_cordon_drain_and_delete()
            .returning(|_, _| Ok(()));
        mocks
            .driver
            .expect_delete_vmss()
            .returning(|_| Err(Error::cloud("503")));
        // No update_node_set expectation: the finalizer must survive.

        let err = reconcile(Arc::new(set), mocks.into_context())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Cloud(_)));
    }

    #[tokio::test]
    async fn drain_failures_do_not_block_deletion() {
        let mut set = node_set(2);
        set.metadata.deletion_timestamp = Some(Time(chrono::Utc::now()));
        set.status = Some(NodeSetStatus {
            node_status: workers(2),
            kubeconfig: "apiVersion: v1".to_string(),
            ..Default::default()
        });

        let mut mocks = Mocks::new();
        mocks
            .api
            .expect_find_cluster()
            .returning(|_| Ok(provisioned_cluster()));
        mocks
            .guest
            .expect_cordon_drain_and_delete()
            .returning(|_, _| Err(Error::cloud("node unreachable")));
        mocks.driver.expect_delete_vmss().times(1).returning(|_| Ok(()));
        mocks
            .api
            .expect_update_node_set()
            .withf(|s: &NodeSet| !s.finalizers().iter().any(|f| f == NODE_SET_FINALIZER))
            .times(1)
            .returning(|_| Ok(()));

        let action = reconcile(Arc::new(set), mocks.into_context()).await.unwrap();
        assert_eq!(action, Action::await_change());
    }

    #[tokio::test]
    async fn waits_for_cluster_before_touching_the_cloud() {
        let mut mocks = Mocks::new();
        mocks.api.expect_find_cluster().returning(|_| {
            let mut cluster = provisioned_cluster();
            cluster.status = None;
            Ok(cluster)
        });

        let action = reconcile(Arc::new(node_set(2)), mocks.into_context())
            .await
            .unwrap();
        assert_eq!(action, Action::requeue(REQUEUE_DEPENDENCY));
    }

    #[test]
    fn instance_id_ordering_is_numeric_and_stable() {
        let vms = vec![
            VmStatus {
                vm_computer_name: "w10".to_string(),
                vm_instance_id: "10".to_string(),
            },
            VmStatus {
                vm_computer_name: "w2".to_string(),
                vm_instance_id: "2".to_string(),
            },
            VmStatus {
                vm_computer_name: "w0".to_string(),
                vm_instance_id: "0".to_string(),
            },
        ];
        let sorted = sorted_by_instance_id(vms);
        let ids: Vec<_> = sorted.iter().map(|v| v.vm_instance_id.as_str()).collect();
        assert_eq!(ids, vec!["0", "2", "10"]);
    }
}
