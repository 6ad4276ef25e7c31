//! Kubernetes controller reconciliation logic
//!
//! Four controllers cooperate to converge a cluster: `Cluster` (identity +
//! teardown), `ControlPlane` (master scale set, rolling upgrades),
//! `NodePool` (generational translation to NodeSets), and `NodeSet` (worker
//! scale set lifecycle). Each is a free `reconcile`/`error_policy` pair over
//! `Arc<Resource>` and a shared [`Context`], in the controller-runtime
//! pattern: observe, diff, converge, requeue.
//!
//! Ordering across objects is enforced by gating, not locking: ControlPlane
//! and NodeSet no-op until their namespace's Cluster reports `Succeeded`.

pub mod api;
pub mod cluster;
pub mod control_plane;
pub mod node_pool;
pub mod node_set;

use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use kube::Client;
use tracing::error;

pub use api::{EngineApi, EventPublisher, KubeEngineApi, KubeEventPublisher};

use crate::bootstrap::token::{GuestTokenIssuer, TokenIssuer};
use crate::cloud::CloudBuilder;
use crate::guest::{GuestClusterAdmin, KubeGuestAdmin};
use crate::{Error, Result};

/// Requeue delay after updating an object (finalizers, child creation)
pub(crate) const REQUEUE_NOW: Duration = Duration::from_secs(1);

/// Requeue delay while waiting on a dependency
pub(crate) const REQUEUE_DEPENDENCY: Duration = Duration::from_secs(10);

/// Shared collaborators for every reconciler.
///
/// All fields are trait objects so tests can substitute mocks for the guest
/// API, the cloud, the guest-cluster admin, and the token issuer.
pub struct Context {
    /// Engine-resource CRUD in the guest cluster
    pub api: Arc<dyn EngineApi>,
    /// Event publisher
    pub events: Arc<dyn EventPublisher>,
    /// Cloud driver builder
    pub cloud: Arc<dyn CloudBuilder>,
    /// Node-level guest-cluster operations
    pub guest: Arc<dyn GuestClusterAdmin>,
    /// Bootstrap token issuer
    pub tokens: Arc<dyn TokenIssuer>,
}

impl Context {
    /// Production context: kube-backed collaborators plus the given cloud
    /// builder
    pub fn new(client: Client, cloud: Arc<dyn CloudBuilder>) -> Self {
        Self {
            api: Arc::new(KubeEngineApi::new(client.clone())),
            events: Arc::new(KubeEventPublisher::new(client.clone(), "azk-engine")),
            cloud,
            guest: Arc::new(KubeGuestAdmin::new(client.clone())),
            tokens: Arc::new(GuestTokenIssuer::new(client)),
        }
    }

    /// Context with explicit collaborators, primarily for tests
    pub fn with_collaborators(
        api: Arc<dyn EngineApi>,
        events: Arc<dyn EventPublisher>,
        cloud: Arc<dyn CloudBuilder>,
        guest: Arc<dyn GuestClusterAdmin>,
        tokens: Arc<dyn TokenIssuer>,
    ) -> Self {
        Self {
            api,
            events,
            cloud,
            guest,
            tokens,
        }
    }
}

/// Map an error onto the retry policy: transient errors requeue with their
/// class delay, fatal errors park the object until its spec changes
pub(crate) fn action_for(error: &Error) -> Action {
    match error.requeue_after() {
        Some(delay) => Action::requeue(delay),
        None => Action::await_change(),
    }
}

/// Run a reconcile body with panic containment.
///
/// A panic is logged with its payload and turned into a requeue, so one bad
/// object cannot take the controller down; the next tick retries.
pub(crate) async fn guarded<F>(resource: &str, body: F) -> Result<Action>
where
    F: std::future::Future<Output = Result<Action>>,
{
    match std::panic::AssertUnwindSafe(body).catch_unwind().await {
        Ok(outcome) => outcome,
        Err(payload) => {
            let message = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            error!(resource, panic = %message, "panic during reconcile");
            Ok(Action::requeue(REQUEUE_DEPENDENCY))
        }
    }
}

/// Surface a fatal error as a Warning event; transient errors stay quiet and
/// retry through the requeue policy
pub(crate) async fn surface_fatal(ctx: &Context, resource_ref: &ObjectReference, error: &Error) {
    if error.requeue_after().is_none() {
        ctx.events
            .publish(resource_ref, EventType::Warning, api::reasons::ERROR, &error.to_string())
            .await;
    }
}
