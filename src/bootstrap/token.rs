//! Bootstrap token minting
//!
//! Joining nodes authenticate with a kubeadm bootstrap token of the form
//! `<6 char id>.<16 char secret>` over the charset `[a-z0-9]`. The issuer
//! generates the token and materializes it in the guest cluster as a Secret
//! of type `bootstrap.kubernetes.io/token` with a one-hour TTL.
//!
//! Tokens are minted fresh by every reconcile that needs one and never
//! reused across reconciles: the TTL is shorter than worst-case cloud
//! provisioning, so a cached token could expire before a member presents it.

use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use k8s_openapi::api::core::v1::Secret;
use kube::api::{Api, PostParams};
use kube::Client;
use tracing::info;

#[cfg(test)]
use mockall::automock;

use crate::{Error, Result};

/// Token id length (before the dot)
const TOKEN_ID_LEN: usize = 6;

/// Token secret length (after the dot)
const TOKEN_SECRET_LEN: usize = 16;

/// Charset for both token halves
const TOKEN_CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

/// Token lifetime
const TOKEN_TTL_SECS: i64 = 3600;

/// Group granted to joining nodes
const TOKEN_GROUPS: &str = "system:bootstrappers:kubeadm:default-node-token";

/// Mints bootstrap tokens in the guest cluster
#[cfg_attr(test, automock)]
#[async_trait]
pub trait TokenIssuer: Send + Sync {
    /// Generate a fresh token, publish it to the guest cluster, return it
    async fn mint(&self) -> Result<String>;
}

/// Random string over the token charset, via rejection sampling so every
/// character is uniformly distributed
fn random_token_chars(len: usize) -> Result<String> {
    let mut out = String::with_capacity(len);
    // Largest multiple of the charset size below 256
    let limit = 256 - (256 % TOKEN_CHARSET.len());
    while out.len() < len {
        let mut buf = [0u8; 64];
        aws_lc_rs::rand::fill(&mut buf)
            .map_err(|_| Error::token("random generation failed"))?;
        for byte in buf {
            if out.len() == len {
                break;
            }
            if (byte as usize) < limit {
                out.push(TOKEN_CHARSET[byte as usize % TOKEN_CHARSET.len()] as char);
            }
        }
    }
    Ok(out)
}

/// Generate a `<id>.<secret>` bootstrap token
pub fn generate_token() -> Result<String> {
    Ok(format!(
        "{}.{}",
        random_token_chars(TOKEN_ID_LEN)?,
        random_token_chars(TOKEN_SECRET_LEN)?
    ))
}

/// Returns true when the string is a well-formed bootstrap token
pub fn is_valid_token(token: &str) -> bool {
    let Some((id, secret)) = token.split_once('.') else {
        return false;
    };
    id.len() == TOKEN_ID_LEN
        && secret.len() == TOKEN_SECRET_LEN
        && id.bytes().chain(secret.bytes()).all(|b| TOKEN_CHARSET.contains(&b))
}

/// Build the token Secret as kubeadm expects it
pub fn token_secret(token: &str) -> Result<Secret> {
    let (id, secret) = token
        .split_once('.')
        .ok_or_else(|| Error::token("malformed bootstrap token"))?;
    if !is_valid_token(token) {
        return Err(Error::token("malformed bootstrap token"));
    }

    let expiration = (Utc::now() + chrono::Duration::seconds(TOKEN_TTL_SECS))
        .to_rfc3339_opts(SecondsFormat::Secs, true);

    let mut secret_obj = Secret::default();
    secret_obj.metadata.name = Some(format!("bootstrap-token-{id}"));
    secret_obj.metadata.namespace = Some("kube-system".to_string());
    secret_obj.type_ = Some("bootstrap.kubernetes.io/token".to_string());
    secret_obj.string_data = Some(
        [
            ("token-id".to_string(), id.to_string()),
            ("token-secret".to_string(), secret.to_string()),
            ("expiration".to_string(), expiration),
            ("usage-bootstrap-authentication".to_string(), "true".to_string()),
            ("usage-bootstrap-signing".to_string(), "true".to_string()),
            ("auth-extra-groups".to_string(), TOKEN_GROUPS.to_string()),
        ]
        .into_iter()
        .collect(),
    );
    Ok(secret_obj)
}

/// Issuer publishing tokens through the in-cluster client
pub struct GuestTokenIssuer {
    client: Client,
}

impl GuestTokenIssuer {
    /// Create an issuer over the in-cluster client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl TokenIssuer for GuestTokenIssuer {
    async fn mint(&self) -> Result<String> {
        let token = generate_token()?;
        let secret = token_secret(&token)?;

        let secrets: Api<Secret> = Api::namespaced(self.client.clone(), "kube-system");
        secrets
            .create(&PostParams::default(), &secret)
            .await
            .map_err(|e| Error::token(format!("failed to publish bootstrap token: {e}")))?;

        info!(
            secret = secret.metadata.name.as_deref().unwrap_or_default(),
            "minted bootstrap token"
        );
        Ok(token)
    }
}
