//! Guest-cluster administration
//!
//! The engine runs inside the cluster it manages. This module is its window
//! into that cluster's node inventory: readiness polling during provisioning,
//! kubelet-version queries during upgrades, and cordon/drain/delete when
//! members are scaled in or a whole worker generation is retired.

use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Node, Pod};
use kube::api::{Api, DeleteParams, DynamicObject, EvictParams, ListParams, Patch, PatchParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::discovery::ApiResource;
use kube::{Client, Config, ResourceExt};
use tracing::{info, warn};

#[cfg(test)]
use mockall::automock;

use crate::{Error, Result};

/// Poll interval while waiting on node state
const NODE_POLL_INTERVAL: Duration = Duration::from_secs(3);

/// Poll attempts while waiting on node state (100 x 3 s = 300 s)
const NODE_POLL_ATTEMPTS: u32 = 100;

/// Node-level operations against the guest cluster
#[cfg_attr(test, automock)]
#[async_trait]
pub trait GuestClusterAdmin: Send + Sync {
    /// Wait until `count` nodes whose names contain `name_prefix` are Ready
    async fn wait_for_nodes_ready(&self, name_prefix: &str, count: usize) -> Result<()>;

    /// Returns true when the node reports the given kubelet version
    async fn is_node_at_version(&self, node_name: &str, version: &str) -> Result<bool>;

    /// Wait until the node reports the given kubelet version
    async fn wait_for_node_version(&self, node_name: &str, version: &str) -> Result<()>;

    /// Cordon the node, evict its drainable pods, and delete it.
    ///
    /// Uses the supplied kubeconfig so a NodeSet can still drain through its
    /// cached credentials during deletion. An empty kubeconfig skips the
    /// drain entirely; the cloud-side scale-set delete evicts forcefully.
    async fn cordon_drain_and_delete(&self, kubeconfig: &str, node_name: &str) -> Result<()>;

    /// Server-side apply a set of YAML manifests using the given kubeconfig
    async fn apply_manifests(&self, kubeconfig: &str, manifests: &[String]) -> Result<()>;
}

/// Split an apiVersion into group and version components
pub fn parse_api_version(api_version: &str) -> (&str, &str) {
    match api_version.rsplit_once('/') {
        Some((group, version)) => (group, version),
        // Core API (e.g. "v1")
        None => ("", api_version),
    }
}

/// Naive plural of a Kubernetes kind, sufficient for the resources the
/// engine applies
pub fn pluralize_kind(kind: &str) -> String {
    let lower = kind.to_lowercase();
    if lower.ends_with('s') {
        format!("{lower}es")
    } else if let Some(stem) = lower.strip_suffix('y') {
        format!("{stem}ies")
    } else {
        format!("{lower}s")
    }
}

/// Returns true when the node has a Ready=True condition
pub fn node_is_ready(node: &Node) -> bool {
    node.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .map(|conditions| {
            conditions
                .iter()
                .any(|c| c.type_ == "Ready" && c.status == "True")
        })
        .unwrap_or(false)
}

/// Returns true when the node's kubelet reports the given version
pub fn kubelet_at_version(node: &Node, version: &str) -> bool {
    let reported = node
        .status
        .as_ref()
        .and_then(|s| s.node_info.as_ref())
        .map(|info| info.kubelet_version.as_str())
        .unwrap_or_default();
    reported.trim_start_matches('v') == version.trim_start_matches('v')
}

/// Returns true when the pod should be evicted during a drain.
///
/// Mirror pods and daemonset members stay: the former are not evictable and
/// the latter are rescheduled onto the node immediately anyway.
pub fn pod_is_drainable(pod: &Pod) -> bool {
    let is_mirror = pod
        .metadata
        .annotations
        .as_ref()
        .map(|a| a.contains_key("kubernetes.io/config.mirror"))
        .unwrap_or(false);
    if is_mirror {
        return false;
    }

    let daemonset_owned = pod
        .metadata
        .owner_references
        .as_ref()
        .map(|refs| refs.iter().any(|r| r.kind == "DaemonSet"))
        .unwrap_or(false);
    !daemonset_owned
}

/// Kube-backed guest administration
pub struct KubeGuestAdmin {
    client: Client,
}

impl KubeGuestAdmin {
    /// Create an admin over the in-cluster client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    async fn client_from_kubeconfig(kubeconfig: &str) -> Result<Client> {
        let parsed = Kubeconfig::from_yaml(kubeconfig)
            .map_err(|e| Error::serialization(format!("invalid kubeconfig: {e}")))?;
        let config = Config::from_custom_kubeconfig(parsed, &KubeConfigOptions::default())
            .await
            .map_err(|e| Error::serialization(format!("invalid kubeconfig: {e}")))?;
        Client::try_from(config)
            .map_err(|e| Error::serialization(format!("kubeconfig client setup failed: {e}")))
    }

    async fn ready_count(&self, name_prefix: &str) -> Result<usize> {
        let nodes: Api<Node> = Api::all(self.client.clone());
        let list = nodes.list(&ListParams::default()).await?;
        Ok(list
            .items
            .iter()
            .filter(|node| {
                node.metadata
                    .name
                    .as_deref()
                    .map(|name| name.contains(name_prefix))
                    .unwrap_or(false)
                    && node_is_ready(node)
            })
            .count())
    }
}

#[async_trait]
impl GuestClusterAdmin for KubeGuestAdmin {
    async fn wait_for_nodes_ready(&self, name_prefix: &str, count: usize) -> Result<()> {
        for _ in 0..NODE_POLL_ATTEMPTS {
            let found = self.ready_count(name_prefix).await?;
            if found >= count {
                return Ok(());
            }
            tokio::time::sleep(NODE_POLL_INTERVAL).await;
        }
        Err(Error::precondition(format!(
            "expected {count} Ready nodes matching {name_prefix}"
        )))
    }

    async fn is_node_at_version(&self, node_name: &str, version: &str) -> Result<bool> {
        let nodes: Api<Node> = Api::all(self.client.clone());
        match nodes.get_opt(node_name).await? {
            Some(node) => Ok(kubelet_at_version(&node, version)),
            None => Ok(false),
        }
    }

    async fn wait_for_node_version(&self, node_name: &str, version: &str) -> Result<()> {
        for _ in 0..NODE_POLL_ATTEMPTS {
            if self.is_node_at_version(node_name, version).await? {
                return Ok(());
            }
            tokio::time::sleep(NODE_POLL_INTERVAL).await;
        }
        Err(Error::precondition(format!(
            "node {node_name} did not reach version {version}"
        )))
    }

    async fn cordon_drain_and_delete(&self, kubeconfig: &str, node_name: &str) -> Result<()> {
        if kubeconfig.is_empty() {
            // Nothing to drain with; the scale-set delete evicts forcefully.
            return Ok(());
        }

        let client = Self::client_from_kubeconfig(kubeconfig).await?;
        let nodes: Api<Node> = Api::all(client.clone());

        info!(node = node_name, "cordoning node");
        let cordon = serde_json::json!({"spec": {"unschedulable": true}});
        nodes
            .patch(node_name, &PatchParams::default(), &Patch::Merge(&cordon))
            .await?;

        let all_pods: Api<Pod> = Api::all(client.clone());
        let on_node = all_pods
            .list(&ListParams::default().fields(&format!("spec.nodeName={node_name}")))
            .await?;

        for pod in on_node.items.iter().filter(|p| pod_is_drainable(p)) {
            let (Some(name), Some(namespace)) =
                (pod.metadata.name.as_deref(), pod.metadata.namespace.as_deref())
            else {
                continue;
            };
            let pods: Api<Pod> = Api::namespaced(client.clone(), namespace);
            if let Err(e) = pods.evict(name, &EvictParams::default()).await {
                // Eviction failures do not block the drain; deletion of the
                // underlying VM is the source of truth.
                warn!(pod = name, namespace, error = %e, "pod eviction failed");
            }
        }

        info!(node = node_name, "deleting node");
        match nodes.delete(node_name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn apply_manifests(&self, kubeconfig: &str, manifests: &[String]) -> Result<()> {
        let client = if kubeconfig.is_empty() {
            self.client.clone()
        } else {
            Self::client_from_kubeconfig(kubeconfig).await?
        };

        for manifest in manifests {
            let object: DynamicObject = serde_yaml::from_str(manifest)
                .map_err(|e| Error::serialization(format!("invalid manifest: {e}")))?;
            let types = object
                .types
                .clone()
                .ok_or_else(|| Error::serialization("manifest is missing apiVersion/kind"))?;

            let (group, version) = parse_api_version(&types.api_version);
            let resource = ApiResource {
                group: group.to_string(),
                version: version.to_string(),
                api_version: types.api_version.clone(),
                kind: types.kind.clone(),
                plural: pluralize_kind(&types.kind),
            };

            let name = object.name_any();
            let api: Api<DynamicObject> = match object.namespace() {
                Some(namespace) => {
                    Api::namespaced_with(client.clone(), &namespace, &resource)
                }
                None => Api::all_with(client.clone(), &resource),
            };
            api.patch(
                &name,
                &PatchParams::apply("azk-engine").force(),
                &Patch::Apply(&object),
            )
            .await?;

            info!(kind = %types.kind, name = %name, "applied manifest");
        }

        Ok(())
    }
}
