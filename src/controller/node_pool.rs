//! NodePool controller
//!
//! A purely generational controller: it owns no cloud resources and
//! translates a pool into exactly one live NodeSet named by
//! `(poolName, kubernetesVersion)`. A version bump hashes to a new name and
//! therefore a new NodeSet; once the new generation reports a full replica
//! count, every other NodeSet in the namespace owned by this pool is
//! deleted and drains itself through its own finalizer.

use std::sync::Arc;

use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use kube::{Resource, ResourceExt};
use tracing::{error, info, instrument};

use super::api::reasons;
use super::{action_for, guarded, surface_fatal, Context, REQUEUE_NOW};
use crate::crd::{NodePool, NodeSet, NodeSetSpec};
use crate::{Error, Result};

/// Reconcile a NodePool resource
#[instrument(skip(node_pool, ctx), fields(nodepool = %node_pool.name_any()))]
pub async fn reconcile(node_pool: Arc<NodePool>, ctx: Arc<Context>) -> Result<Action> {
    let name = node_pool.name_any();
    let result = guarded(&name, reconcile_inner(node_pool.clone(), ctx.clone())).await;
    if let Err(e) = &result {
        surface_fatal(&ctx, &node_pool.object_ref(&()), e).await;
    }
    result
}

async fn reconcile_inner(node_pool: Arc<NodePool>, ctx: Arc<Context>) -> Result<Action> {
    let namespace = node_pool.namespace().unwrap_or_default();
    let child_name = node_pool.child_name();

    let desired = desired_node_set(&node_pool, &child_name, &namespace);

    let found = match ctx.api.get_node_set(&namespace, &child_name).await? {
        None => {
            info!(nodeset = %child_name, "creating nodeset");
            ctx.api.create_node_set(&desired).await?;
            ctx.events
                .publish(
                    &node_pool.object_ref(&()),
                    EventType::Normal,
                    reasons::CREATED,
                    &child_name,
                )
                .await;
            return Ok(Action::requeue(REQUEUE_NOW));
        }
        Some(mut found) => {
            if found.spec != desired.spec {
                info!(nodeset = %child_name, "updating nodeset spec");
                found.spec = desired.spec.clone();
                ctx.api.update_node_set(&found).await?;
            }
            found
        }
    };

    // The current generation has fully converged: retire every other one.
    let realized = found.status.as_ref().map(|s| s.node_status.len()).unwrap_or(0) as i32;
    if node_pool.spec.replicas == Some(realized) {
        collect_stale_generations(&ctx, &namespace, &child_name).await?;
    }

    let mut pool = (*node_pool).clone();
    let status = pool.status.get_or_insert_with(Default::default);
    let found_status = found.status.clone().unwrap_or_default();
    status.node_set_name = child_name;
    status.replicas = found_status.replicas;
    status.vm_replicas = realized;
    status.kubernetes_version = found_status.kubernetes_version;
    status.provisioning_state = found_status.provisioning_state;
    ctx.api.update_node_pool_status(&pool).await?;

    Ok(Action::await_change())
}

/// Build the desired NodeSet for the pool's current generation, owned by the
/// pool so cascade deletion works
fn desired_node_set(node_pool: &NodePool, child_name: &str, namespace: &str) -> NodeSet {
    let mut node_set = NodeSet::new(
        child_name,
        NodeSetSpec {
            kubernetes_version: node_pool.spec.kubernetes_version.clone(),
            replicas: node_pool.spec.replicas,
            vm_sku_type: node_pool.spec.vm_sku_type.clone(),
        },
    );
    node_set.metadata.namespace = Some(namespace.to_string());
    if let Some(owner_ref) = node_pool.controller_owner_ref(&()) {
        node_set.metadata.owner_references = Some(vec![owner_ref]);
    }
    node_set
}

/// Delete every NodeSet in the namespace that is not the current generation
async fn collect_stale_generations(
    ctx: &Context,
    namespace: &str,
    current_name: &str,
) -> Result<()> {
    for node_set in ctx.api.list_node_sets(namespace).await? {
        let name = node_set.name_any();
        if name == current_name {
            continue;
        }
        info!(nodeset = %name, "deleting unreferenced nodeset");
        ctx.api.delete_node_set(namespace, &name).await?;
    }
    Ok(())
}

/// Error policy for the NodePool controller
pub fn error_policy(node_pool: Arc<NodePool>, error: &Error, _ctx: Arc<Context>) -> Action {
    error!(
        nodepool = %node_pool.name_any(),
        error = %error,
        "nodepool reconciliation failed"
    );
    action_for(error)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bootstrap::token::MockTokenIssuer;
    use crate::cloud::MockCloudBuilder;
    use crate::controller::api::{MockEngineApi, MockEventPublisher};
    use crate::crd::{NodePoolSpec, NodeSetStatus, ProvisioningState, VmStatus};
    use crate::guest::MockGuestClusterAdmin;

    fn pool(version: &str, replicas: i32) -> NodePool {
        let mut pool = NodePool::new(
            "np1",
            NodePoolSpec {
                kubernetes_version: version.to_string(),
                replicas: Some(replicas),
                vm_sku_type: String::new(),
            },
        );
        pool.metadata.namespace = Some("default".to_string());
        pool.metadata.uid = Some("uid-np1".to_string());
        pool
    }

    fn converged_child(pool: &NodePool) -> NodeSet {
        let namespace = pool.namespace().unwrap();
        let mut child = desired_node_set(pool, &pool.child_name(), &namespace);
        child.status = Some(NodeSetStatus {
            replicas: pool.spec.replicas.unwrap(),
            kubernetes_version: pool.spec.kubernetes_version.clone(),
            provisioning_state: ProvisioningState::Succeeded,
            kubeconfig: String::new(),
            node_status: (0..pool.spec.replicas.unwrap())
                .map(|i| VmStatus {
                    vm_computer_name: format!("agent{i:06}"),
                    vm_instance_id: i.to_string(),
                })
                .collect(),
        });
        child
    }

    fn quiet_events() -> Arc<MockEventPublisher> {
        let mut events = MockEventPublisher::new();
        events.expect_publish().returning(|_, _, _, _| ());
        Arc::new(events)
    }

    fn context(api: MockEngineApi) -> Arc<Context> {
        Arc::new(Context::with_collaborators(
            Arc::new(api),
            quiet_events(),
            Arc::new(MockCloudBuilder::new()),
            Arc::new(MockGuestClusterAdmin::new()),
            Arc::new(MockTokenIssuer::new()),
        ))
    }

    #[tokio::test]
    async fn creates_the_missing_generation() {
        let pool = pool("1.18.0", 2);
        let expected_name = pool.child_name();

        let mut api = MockEngineApi::new();
        api.expect_get_node_set().returning(|_, _| Ok(None));
        let name = expected_name.clone();
        api.expect_create_node_set()
            .withf(move |set: &NodeSet| {
                set.name_any() == name
                    && set.spec.replicas == Some(2)
                    && set
                        .metadata
                        .owner_references
                        .as_ref()
                        .map(|refs| refs.iter().any(|r| r.kind == "NodePool" && r.controller == Some(true)))
                        .unwrap_or(false)
            })
            .times(1)
            .returning(|_| Ok(()));

        let action = reconcile(Arc::new(pool), context(api)).await.unwrap();
        assert_eq!(action, Action::requeue(REQUEUE_NOW));
    }

    #[tokio::test]
    async fn updates_spec_in_place_for_replica_changes() {
        let pool = pool("1.18.0", 5);
        let mut stale_child = converged_child(&pool);
        // The child still runs the old replica count: spec lags at 2, and
        // only 2 VMs exist, so no garbage collection happens this turn.
        stale_child.spec.replicas = Some(2);
        stale_child.status.as_mut().unwrap().node_status.truncate(2);
        let stale = stale_child.clone();

        let mut api = MockEngineApi::new();
        api.expect_get_node_set()
            .returning(move |_, _| Ok(Some(stale.clone())));
        api.expect_update_node_set()
            .withf(|set: &NodeSet| set.spec.replicas == Some(5))
            .times(1)
            .returning(|_| Ok(()));
        api.expect_update_node_pool_status().returning(|_| Ok(()));

        let action = reconcile(Arc::new(pool), context(api)).await.unwrap();
        assert_eq!(action, Action::await_change());
    }

    #[tokio::test]
    async fn collects_stale_generations_once_converged() {
        let pool = pool("1.18.3", 2);
        let current = converged_child(&pool);
        let current_name = current.name_any();

        let mut old = NodeSet::new("np1-oldhash", NodeSetSpec::default());
        old.metadata.namespace = Some("default".to_string());

        let mut api = MockEngineApi::new();
        let child = current.clone();
        api.expect_get_node_set()
            .returning(move |_, _| Ok(Some(child.clone())));
        let listed = vec![current.clone(), old.clone()];
        api.expect_list_node_sets()
            .returning(move |_| Ok(listed.clone()));
        api.expect_delete_node_set()
            .withf(move |_: &str, name: &str| name == "np1-oldhash")
            .times(1)
            .returning(|_, _| Ok(()));
        api.expect_update_node_pool_status()
            .withf(move |p: &NodePool| {
                let status = p.status.as_ref().unwrap();
                status.node_set_name == current_name
                    && status.vm_replicas == 2
                    && status.provisioning_state == ProvisioningState::Succeeded
            })
            .times(1)
            .returning(|_| Ok(()));

        let action = reconcile(Arc::new(pool), context(api)).await.unwrap();
        assert_eq!(action, Action::await_change());
    }

    #[tokio::test]
    async fn keeps_old_generation_until_new_one_converges() {
        let pool = pool("1.18.3", 2);
        let mut child = converged_child(&pool);
        // Only one VM realized so far.
        child.status.as_mut().unwrap().node_status.pop();

        let mut api = MockEngineApi::new();
        let listed_child = child.clone();
        api.expect_get_node_set()
            .returning(move |_, _| Ok(Some(listed_child.clone())));
        // No list/delete expectations: GC must not run yet.
        api.expect_update_node_pool_status().returning(|_| Ok(()));

        let action = reconcile(Arc::new(pool), context(api)).await.unwrap();
        assert_eq!(action, Action::await_change());
    }
}
