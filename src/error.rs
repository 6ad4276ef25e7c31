//! Error types for the azk engine

use std::time::Duration;

use thiserror::Error;

/// Main error type for engine operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Guest-cluster Kubernetes API error
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// Transient cloud failure (5xx, timeout, throttling)
    #[error("cloud error: {0}")]
    Cloud(String),

    /// Bootstrap token minting failure
    #[error("token error: {0}")]
    Token(String),

    /// A dependency is not ready yet (e.g. parent Cluster not Succeeded)
    #[error("precondition not met: {0}")]
    Precondition(String),

    /// PKI generation or discovery-hash failure
    #[error("pki error: {0}")]
    Pki(#[from] crate::pki::PkiError),

    /// Validation error for CRD specs or cloud configuration
    #[error("validation error: {0}")]
    Validation(String),

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl Error {
    /// Create a transient cloud error with the given message
    pub fn cloud(msg: impl Into<String>) -> Self {
        Self::Cloud(msg.into())
    }

    /// Create a token minting error with the given message
    pub fn token(msg: impl Into<String>) -> Self {
        Self::Token(msg.into())
    }

    /// Create a precondition error with the given message
    pub fn precondition(msg: impl Into<String>) -> Self {
        Self::Precondition(msg.into())
    }

    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }

    /// Returns true for an optimistic-concurrency conflict on the guest API.
    ///
    /// Conflicts are resolved by re-fetching and retrying on the next
    /// reconcile turn.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Kube(kube::Error::Api(ae)) if ae.code == 409)
    }

    /// Requeue delay for recoverable errors.
    ///
    /// `None` marks the error as fatal: the reconciler surfaces it via a
    /// Warning event and leaves the object for operator inspection.
    pub fn requeue_after(&self) -> Option<Duration> {
        match self {
            Error::Precondition(_) => Some(Duration::from_secs(10)),
            Error::Cloud(_) | Error::Token(_) => Some(Duration::from_secs(30)),
            Error::Kube(_) => Some(Duration::from_secs(10)),
            Error::Pki(_) | Error::Validation(_) | Error::Serialization(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constructors_accept_str_and_string() {
        let err = Error::cloud(format!("vmss {} returned 503", "azk-master-vmss"));
        assert!(err.to_string().contains("azk-master-vmss"));

        let err = Error::precondition("cluster not yet Succeeded");
        assert!(err.to_string().contains("precondition"));
    }

    #[test]
    fn transient_errors_requeue() {
        assert_eq!(
            Error::cloud("503").requeue_after(),
            Some(Duration::from_secs(30))
        );
        assert_eq!(
            Error::token("secret create failed").requeue_after(),
            Some(Duration::from_secs(30))
        );
        assert_eq!(
            Error::precondition("waiting on cluster").requeue_after(),
            Some(Duration::from_secs(10))
        );
    }

    #[test]
    fn fatal_errors_do_not_requeue() {
        assert_eq!(Error::validation("bad cloud config").requeue_after(), None);
        assert_eq!(Error::serialization("bad yaml").requeue_after(), None);
    }

    #[test]
    fn errors_are_categorized_for_controller_handling() {
        fn handling(err: &Error) -> &'static str {
            match err.requeue_after() {
                Some(_) => "retry",
                None => "surface_event",
            }
        }

        assert_eq!(handling(&Error::cloud("timeout")), "retry");
        assert_eq!(handling(&Error::validation("bad spec")), "surface_event");
    }
}
