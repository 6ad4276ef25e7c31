//! Minimal kubeconfig document model
//!
//! Enough of the kubeconfig v1 format to emit the component kubeconfigs at
//! bootstrap and to read the cluster CA back out when computing discovery
//! hashes. Field names follow the kubeconfig wire format exactly.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};

/// A kubeconfig document
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct KubeConfig {
    /// Always `v1`
    #[serde(rename = "apiVersion")]
    pub api_version: String,
    /// Always `Config`
    pub kind: String,
    /// Named cluster endpoints
    #[serde(default)]
    pub clusters: Vec<NamedCluster>,
    /// Named user credentials
    #[serde(default)]
    pub users: Vec<NamedUser>,
    /// Named cluster/user pairings
    #[serde(default)]
    pub contexts: Vec<NamedContext>,
    /// Context selected by default
    #[serde(rename = "current-context", default)]
    pub current_context: String,
}

/// A named cluster entry
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct NamedCluster {
    /// Cluster name
    pub name: String,
    /// Endpoint and trust anchor
    pub cluster: ClusterEndpoint,
}

/// Endpoint and CA material of a cluster
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct ClusterEndpoint {
    /// API server URL
    pub server: String,
    /// Base64-encoded CA certificate bundle
    #[serde(
        rename = "certificate-authority-data",
        default,
        skip_serializing_if = "String::is_empty"
    )]
    pub certificate_authority_data: String,
}

/// A named user entry
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct NamedUser {
    /// User name
    pub name: String,
    /// Client credentials
    pub user: UserCredentials,
}

/// Client certificate credentials of a user
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct UserCredentials {
    /// Base64-encoded client certificate
    #[serde(
        rename = "client-certificate-data",
        default,
        skip_serializing_if = "String::is_empty"
    )]
    pub client_certificate_data: String,
    /// Base64-encoded client key
    #[serde(
        rename = "client-key-data",
        default,
        skip_serializing_if = "String::is_empty"
    )]
    pub client_key_data: String,
}

/// A named context entry
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct NamedContext {
    /// Context name
    pub name: String,
    /// Cluster/user pairing
    pub context: ContextRef,
}

/// Cluster and user referenced by a context
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct ContextRef {
    /// Cluster name
    pub cluster: String,
    /// User name
    pub user: String,
}

impl KubeConfig {
    /// Build a single-context kubeconfig with embedded client certificates
    pub fn with_client_cert(
        cluster_name: &str,
        server: &str,
        ca_cert_pem: &str,
        user_name: &str,
        client_cert_pem: &str,
        client_key_pem: &str,
    ) -> Self {
        let context_name = format!("{user_name}@{cluster_name}");
        KubeConfig {
            api_version: "v1".to_string(),
            kind: "Config".to_string(),
            clusters: vec![NamedCluster {
                name: cluster_name.to_string(),
                cluster: ClusterEndpoint {
                    server: server.to_string(),
                    certificate_authority_data: STANDARD.encode(ca_cert_pem),
                },
            }],
            users: vec![NamedUser {
                name: user_name.to_string(),
                user: UserCredentials {
                    client_certificate_data: STANDARD.encode(client_cert_pem),
                    client_key_data: STANDARD.encode(client_key_pem),
                },
            }],
            contexts: vec![NamedContext {
                name: context_name.clone(),
                context: ContextRef {
                    cluster: cluster_name.to_string(),
                    user: user_name.to_string(),
                },
            }],
            current_context: context_name,
        }
    }

    /// Render to YAML
    pub fn to_yaml(&self) -> Result<String, serde_yaml::Error> {
        serde_yaml::to_string(self)
    }
}
