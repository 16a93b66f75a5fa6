//! Central error types for the net-attach-def controller
//!
//! Uses `thiserror` for ergonomic, type-safe error handling with
//! automatic `Display` and `Error` trait implementations.

use std::time::Duration;

use thiserror::Error;

/// Central error type for the controller
#[derive(Error, Debug)]
pub enum Error {
    /// Kubernetes API error from kube-rs
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    /// Configuration error (flags, kubeconfig, listener setup)
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Malformed network selection annotation
    #[error("Invalid network selection: {0}")]
    InvalidSelection(String),

    /// Service carries no network selection annotation
    #[error("no network annotations on service {namespace}/{name}")]
    MissingNetworkAnnotation { namespace: String, name: String },

    /// Service selects more than one network
    #[error(
        "multiple network selections in the service spec are not supported: {namespace}/{name} selects {count} networks"
    )]
    MultipleNetworkSelections {
        namespace: String,
        name: String,
        count: usize,
    },

    /// Service has no pod selector
    #[error("service {namespace}/{name} has no pod selector")]
    MissingSelector { namespace: String, name: String },

    /// Resource not found in the local cache
    #[error("Resource not found: {kind}/{name} in namespace {namespace}")]
    NotFound {
        kind: String,
        name: String,
        namespace: String,
    },

    /// Service key that is not of the form `namespace/name`
    #[error("Invalid resource key: {0}")]
    InvalidKey(String),

    /// Caches did not report their initial list in time
    #[error("timed out after {0:?} waiting for caches to sync")]
    CacheSyncTimeout(Duration),
}

/// Result type alias for controller operations
pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    /// Check if this error type should trigger a retry
    pub fn is_retriable(&self) -> bool {
        matches!(self, Error::KubeError(_))
    }

    /// Stale keys and not-yet-created objects, logged at debug level only
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::NotFound { .. } => true,
            Error::KubeError(kube::Error::Api(e)) => e.code == 404,
            _ => false,
        }
    }

    pub(crate) fn not_found(kind: &str, namespace: &str, name: &str) -> Self {
        Error::NotFound {
            kind: kind.to_string(),
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }
}
