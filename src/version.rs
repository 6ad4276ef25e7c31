//! Kubernetes release channel resolution
//!
//! Specs may name a version either exactly (`1.18.0`) or by channel
//! (`stable`, `latest`). Channels are resolved against the Kubernetes
//! release bucket and normalized by stripping the leading `v`.

use tracing::debug;

use crate::{Error, Result};

/// Base URL of the Kubernetes release channel files
const RELEASE_BUCKET: &str = "https://storage.googleapis.com/kubernetes-release/release";

/// Resolve a version spec to a concrete `x.y.z` version.
///
/// Exact versions pass through unchanged (minus any leading `v`); `stable`
/// and `latest` are fetched from the release bucket. Resolution failures are
/// transient: the caller requeues and retries.
pub async fn resolve(version: &str) -> Result<String> {
    if version != "stable" && version != "latest" {
        return Ok(version.trim_start_matches('v').to_string());
    }

    let url = format!("{RELEASE_BUCKET}/{version}.txt");
    debug!(channel = version, url = %url, "resolving kubernetes version channel");

    let body = reqwest::get(&url)
        .await
        .map_err(|e| Error::cloud(format!("version channel fetch failed: {e}")))?
        .error_for_status()
        .map_err(|e| Error::cloud(format!("version channel fetch failed: {e}")))?
        .text()
        .await
        .map_err(|e| Error::cloud(format!("version channel read failed: {e}")))?;

    let resolved = body.trim().trim_start_matches('v').to_string();
    if resolved.is_empty() {
        return Err(Error::cloud(format!("channel {version} resolved to an empty version")));
    }

    debug!(channel = version, resolved = %resolved, "resolved kubernetes version");
    Ok(resolved)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn exact_versions_pass_through() {
        assert_eq!(resolve("1.18.0").await.unwrap(), "1.18.0");
        assert_eq!(resolve("1.18.3").await.unwrap(), "1.18.3");
    }

    #[tokio::test]
    async fn leading_v_is_stripped() {
        assert_eq!(resolve("v1.18.0").await.unwrap(), "1.18.0");
    }
}
