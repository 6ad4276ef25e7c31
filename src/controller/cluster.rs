//! Cluster controller
//!
//! The Cluster resource is created by the bootstrap CLI with its secrets
//! already populated, so this controller owns only the edges of the
//! lifecycle: it guards the object with a finalizer, marks it `Succeeded`,
//! and on deletion tears down the whole cloud resource group before letting
//! the object go. `Succeeded` is terminal; it is never rewritten except by
//! deletion.

use std::sync::Arc;

use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use kube::{Resource, ResourceExt};
use tracing::{error, info, instrument};

use super::api::reasons;
use super::{action_for, guarded, surface_fatal, Context, REQUEUE_NOW};
use crate::crd::{Cluster, ProvisioningState, CLUSTER_FINALIZER};
use crate::{Error, Result};

/// Reconcile a Cluster resource
#[instrument(skip(cluster, ctx), fields(cluster = %cluster.name_any()))]
pub async fn reconcile(cluster: Arc<Cluster>, ctx: Arc<Context>) -> Result<Action> {
    let name = cluster.name_any();
    let result = guarded(&name, reconcile_inner(cluster.clone(), ctx.clone())).await;
    if let Err(e) = &result {
        surface_fatal(&ctx, &cluster.object_ref(&()), e).await;
    }
    result
}

async fn reconcile_inner(cluster: Arc<Cluster>, ctx: Arc<Context>) -> Result<Action> {
    let has_finalizer = cluster.finalizers().iter().any(|f| f == CLUSTER_FINALIZER);

    if cluster.metadata.deletion_timestamp.is_some() {
        if has_finalizer {
            if cluster.spec.is_valid() {
                info!("deleting cloud infrastructure");
                ctx.cloud
                    .driver(&cluster.spec.cloud_config)
                    .delete_resource_group()
                    .await?;
                info!("successfully deleted cloud infrastructure");
            }

            let mut updated = (*cluster).clone();
            if let Some(finalizers) = updated.metadata.finalizers.as_mut() {
                finalizers.retain(|f| f != CLUSTER_FINALIZER);
            }
            ctx.api.update_cluster(&updated).await?;
        }
        return Ok(Action::await_change());
    }

    if !has_finalizer {
        let mut updated = (*cluster).clone();
        updated
            .metadata
            .finalizers
            .get_or_insert_with(Vec::new)
            .push(CLUSTER_FINALIZER.to_string());
        ctx.api.update_cluster(&updated).await?;
        return Ok(Action::requeue(REQUEUE_NOW));
    }

    // Succeeded is terminal until deletion; never rewrite it.
    if cluster.is_provisioned() {
        return Ok(Action::await_change());
    }

    let mut updated = (*cluster).clone();
    updated.status.get_or_insert_with(Default::default).provisioning_state =
        ProvisioningState::Succeeded;
    ctx.api.update_cluster_status(&updated).await?;

    ctx.events
        .publish(
            &cluster.object_ref(&()),
            EventType::Normal,
            reasons::CREATED,
            &format!("Completed cluster setup {}", cluster.name_any()),
        )
        .await;

    Ok(Action::await_change())
}

/// Error policy for the Cluster controller
pub fn error_policy(cluster: Arc<Cluster>, error: &Error, _ctx: Arc<Context>) -> Action {
    error!(cluster = %cluster.name_any(), error = %error, "cluster reconciliation failed");
    action_for(error)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bootstrap::token::MockTokenIssuer;
    use crate::cloud::{MockCloudBuilder, MockCloudDriver};
    use crate::controller::api::{MockEngineApi, MockEventPublisher};
    use crate::crd::{CloudConfig, ClusterSpec, ClusterStatus};
    use crate::guest::MockGuestClusterAdmin;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;

    fn sample_cluster(name: &str) -> Cluster {
        let mut cluster = Cluster::new(
            name,
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
                ..Default::default()
            },
        );
        cluster.metadata.namespace = Some("default".to_string());
        cluster
    }

    fn with_finalizer(mut cluster: Cluster) -> Cluster {
        cluster.metadata.finalizers = Some(vec![CLUSTER_FINALIZER.to_string()]);
        cluster
    }

    fn deleting(mut cluster: Cluster) -> Cluster {
        cluster.metadata.deletion_timestamp = Some(Time(chrono::Utc::now()));
        cluster
    }

    fn quiet_events() -> Arc<MockEventPublisher> {
        let mut events = MockEventPublisher::new();
        events.expect_publish().returning(|_, _, _, _| ());
        Arc::new(events)
    }

    fn context(api: MockEngineApi, driver: MockCloudDriver) -> Arc<Context> {
        let driver = Arc::new(driver);
        let mut cloud = MockCloudBuilder::new();
        cloud
            .expect_driver()
            .returning(move |_| -> Arc<dyn crate::cloud::CloudDriver> { driver.clone() });
        Arc::new(Context::with_collaborators(
            Arc::new(api),
            quiet_events(),
            Arc::new(cloud),
            Arc::new(MockGuestClusterAdmin::new()),
            Arc::new(MockTokenIssuer::new()),
        ))
    }

    #[tokio::test]
    async fn adds_finalizer_first() {
        let mut api = MockEngineApi::new();
        api.expect_update_cluster()
            .withf(|c: &Cluster| {
                c.finalizers().iter().any(|f| f == CLUSTER_FINALIZER)
            })
            .returning(|_| Ok(()));

        let ctx = context(api, MockCloudDriver::new());
        let action = reconcile(Arc::new(sample_cluster("c1")), ctx).await.unwrap();
        assert_eq!(action, Action::requeue(REQUEUE_NOW));
    }

    #[tokio::test]
    async fn marks_succeeded_once() {
        let mut api = MockEngineApi::new();
        api.expect_update_cluster_status()
            .withf(|c: &Cluster| c.is_provisioned())
            .times(1)
            .returning(|_| Ok(()));

        let ctx = context(api, MockCloudDriver::new());
        let cluster = with_finalizer(sample_cluster("c1"));
        let action = reconcile(Arc::new(cluster), ctx).await.unwrap();
        assert_eq!(action, Action::await_change());
    }

    #[tokio::test]
    async fn succeeded_is_never_rewritten() {
        // No update expectations at all: a Succeeded cluster is a no-op.
        let api = MockEngineApi::new();
        let ctx = context(api, MockCloudDriver::new());

        let mut cluster = with_finalizer(sample_cluster("c1"));
        cluster.status = Some(ClusterStatus {
            provisioning_state: ProvisioningState::Succeeded,
            node_status: Vec::new(),
        });

        let action = reconcile(Arc::new(cluster), ctx).await.unwrap();
        assert_eq!(action, Action::await_change());
    }

    #[tokio::test]
    async fn deletion_tears_down_then_releases_finalizer() {
        let mut driver = MockCloudDriver::new();
        driver
            .expect_delete_resource_group()
            .times(1)
            .returning(|| Ok(()));

        let mut api = MockEngineApi::new();
        api.expect_update_cluster()
            .withf(|c: &Cluster| !c.finalizers().iter().any(|f| f == CLUSTER_FINALIZER))
            .times(1)
            .returning(|_| Ok(()));

        let ctx = context(api, driver);
        let cluster = deleting(with_finalizer(sample_cluster("c1")));
        let action = reconcile(Arc::new(cluster), ctx).await.unwrap();
        assert_eq!(action, Action::await_change());
    }

    #[tokio::test]
    async fn finalizer_survives_failed_teardown() {
        let mut driver = MockCloudDriver::new();
        driver
            .expect_delete_resource_group()
            .returning(|| Err(Error::cloud("503")));

        // No update_cluster expectation: the finalizer must stay.
        let api = MockEngineApi::new();
        let ctx = context(api, driver);

        let cluster = deleting(with_finalizer(sample_cluster("c1")));
        let err = reconcile(Arc::new(cluster), ctx).await.unwrap_err();
        assert!(matches!(err, Error::Cloud(_)));
    }

    #[tokio::test]
    async fn deletion_without_finalizer_is_a_no_op() {
        let api = MockEngineApi::new();
        let ctx = context(api, MockCloudDriver::new());
        let cluster = deleting(sample_cluster("c1"));
        let action = reconcile(Arc::new(cluster), ctx).await.unwrap();
        assert_eq!(action, Action::await_change());
    }
}
