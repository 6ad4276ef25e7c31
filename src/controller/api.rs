//! Guest-cluster API surface used by the reconcilers
//!
//! All engine-resource CRUD goes through the [`EngineApi`] trait and all
//! event emission through [`EventPublisher`], so reconcilers stay testable
//! with mocks while production wires the real kube client.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::{Client, ResourceExt};
use serde::Serialize;
use tracing::warn;

#[cfg(test)]
use mockall::automock;

use crate::crd::{Cluster, ControlPlane, NodePool, NodeSet};
use crate::{Error, Result};

/// Field manager stamped on engine writes
const FIELD_MANAGER: &str = "azk-engine";

/// CRUD against the engine's own resources in the guest cluster
#[cfg_attr(test, automock)]
#[async_trait]
pub trait EngineApi: Send + Sync {
    /// The namespace's one Cluster.
    ///
    /// Zero or multiple clusters is a precondition failure: dependents wait
    /// until exactly one exists.
    async fn find_cluster(&self, namespace: &str) -> Result<Cluster>;

    /// Replace a Cluster (metadata updates such as finalizers)
    async fn update_cluster(&self, cluster: &Cluster) -> Result<()>;

    /// Merge-patch a Cluster's status subresource
    async fn update_cluster_status(&self, cluster: &Cluster) -> Result<()>;

    /// Merge-patch a ControlPlane's status subresource
    async fn update_control_plane_status(&self, control_plane: &ControlPlane) -> Result<()>;

    /// Fetch a NodeSet, `None` when absent
    async fn get_node_set(&self, namespace: &str, name: &str) -> Result<Option<NodeSet>>;

    /// Create a NodeSet
    async fn create_node_set(&self, node_set: &NodeSet) -> Result<()>;

    /// Replace a NodeSet (spec or metadata updates)
    async fn update_node_set(&self, node_set: &NodeSet) -> Result<()>;

    /// Merge-patch a NodeSet's status subresource
    async fn update_node_set_status(&self, node_set: &NodeSet) -> Result<()>;

    /// All NodeSets in a namespace
    async fn list_node_sets(&self, namespace: &str) -> Result<Vec<NodeSet>>;

    /// Delete a NodeSet; absent NodeSets are not an error
    async fn delete_node_set(&self, namespace: &str, name: &str) -> Result<()>;

    /// Merge-patch a NodePool's status subresource
    async fn update_node_pool_status(&self, node_pool: &NodePool) -> Result<()>;
}

/// Publishes Kubernetes Events on engine resources.
///
/// Fire-and-forget: failures are logged and never break reconciliation.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publish an event on the given resource
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        note: &str,
    );
}

/// Production [`EngineApi`] over the in-cluster client
pub struct KubeEngineApi {
    client: Client,
}

impl KubeEngineApi {
    /// Create the API surface over the given client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    async fn patch_status<K>(&self, api: Api<K>, name: &str, status: &impl Serialize) -> Result<()>
    where
        K: kube::Resource + Clone + serde::de::DeserializeOwned + std::fmt::Debug,
    {
        let patch = serde_json::json!({ "status": status });
        api.patch_status(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }
}

#[async_trait]
impl EngineApi for KubeEngineApi {
    async fn find_cluster(&self, namespace: &str) -> Result<Cluster> {
        let api: Api<Cluster> = Api::namespaced(self.client.clone(), namespace);
        let mut clusters = api.list(&ListParams::default()).await?.items;
        match clusters.len() {
            0 => Err(Error::precondition(format!("no clusters defined in {namespace}"))),
            1 => Ok(clusters.remove(0)),
            n => Err(Error::precondition(format!(
                "{n} clusters defined in {namespace}, expected exactly one"
            ))),
        }
    }

    async fn update_cluster(&self, cluster: &Cluster) -> Result<()> {
        let namespace = cluster.namespace().unwrap_or_default();
        let api: Api<Cluster> = Api::namespaced(self.client.clone(), &namespace);
        api.replace(&cluster.name_any(), &PostParams::default(), cluster)
            .await?;
        Ok(())
    }

    async fn update_cluster_status(&self, cluster: &Cluster) -> Result<()> {
        let namespace = cluster.namespace().unwrap_or_default();
        let api: Api<Cluster> = Api::namespaced(self.client.clone(), &namespace);
        self.patch_status(api, &cluster.name_any(), &cluster.status).await
    }

    async fn update_control_plane_status(&self, control_plane: &ControlPlane) -> Result<()> {
        let namespace = control_plane.namespace().unwrap_or_default();
        let api: Api<ControlPlane> = Api::namespaced(self.client.clone(), &namespace);
        self.patch_status(api, &control_plane.name_any(), &control_plane.status)
            .await
    }

    async fn get_node_set(&self, namespace: &str, name: &str) -> Result<Option<NodeSet>> {
        let api: Api<NodeSet> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn create_node_set(&self, node_set: &NodeSet) -> Result<()> {
        let namespace = node_set.namespace().unwrap_or_default();
        let api: Api<NodeSet> = Api::namespaced(self.client.clone(), &namespace);
        api.create(&PostParams::default(), node_set).await?;
        Ok(())
    }

    async fn update_node_set(&self, node_set: &NodeSet) -> Result<()> {
        let namespace = node_set.namespace().unwrap_or_default();
        let api: Api<NodeSet> = Api::namespaced(self.client.clone(), &namespace);
        api.replace(&node_set.name_any(), &PostParams::default(), node_set)
            .await?;
        Ok(())
    }

    async fn update_node_set_status(&self, node_set: &NodeSet) -> Result<()> {
        let namespace = node_set.namespace().unwrap_or_default();
        let api: Api<NodeSet> = Api::namespaced(self.client.clone(), &namespace);
        self.patch_status(api, &node_set.name_any(), &node_set.status).await
    }

    async fn list_node_sets(&self, namespace: &str) -> Result<Vec<NodeSet>> {
        let api: Api<NodeSet> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.list(&ListParams::default()).await?.items)
    }

    async fn delete_node_set(&self, namespace: &str, name: &str) -> Result<()> {
        let api: Api<NodeSet> = Api::namespaced(self.client.clone(), namespace);
        match api.delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn update_node_pool_status(&self, node_pool: &NodePool) -> Result<()> {
        let namespace = node_pool.namespace().unwrap_or_default();
        let api: Api<NodePool> = Api::namespaced(self.client.clone(), &namespace);
        self.patch_status(api, &node_pool.name_any(), &node_pool.status)
            .await
    }
}

/// Production publisher wrapping `kube::runtime::events::Recorder`
pub struct KubeEventPublisher {
    recorder: Recorder,
}

impl KubeEventPublisher {
    /// Create a publisher reporting as the given controller
    pub fn new(client: Client, controller_name: &str) -> Self {
        let reporter = Reporter {
            controller: controller_name.to_string(),
            instance: None,
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }
}

#[async_trait]
impl EventPublisher for KubeEventPublisher {
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        note: &str,
    ) {
        let event = Event {
            type_,
            reason: reason.to_string(),
            note: Some(note.to_string()),
            action: "Reconcile".to_string(),
            secondary: None,
        };
        if let Err(e) = self.recorder.publish(&event, resource_ref).await {
            warn!(reason, error = %e, "failed to publish event");
        }
    }
}

/// Well-known event reason strings
pub mod reasons {
    /// A cloud resource was created or updated
    pub const CREATED: &str = "Created";
    /// A scale set changed capacity
    pub const SCALED: &str = "Scaled";
    /// A reconcile failed fatally
    pub const ERROR: &str = "Error";
}
