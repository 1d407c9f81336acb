use common::ResourceKey;
use std::time::Duration;
use thiserror::Error;

/// Errors returned by the cluster API collaborator
///
/// The reconciler treats every variant as a reconcile failure except where
/// it deliberately degrades (missing service or secret data excludes one
/// route or certificate).
#[derive(Error, Debug, Clone)]
pub enum ClusterError {
    #[error("{kind} {key} not found")]
    NotFound { kind: &'static str, key: String },

    #[error("invalid {kind} {key}: {reason}")]
    InvalidData {
        kind: &'static str,
        key: String,
        reason: String,
    },

    #[error("cluster API call '{operation}' timed out after {timeout:?}")]
    Timeout {
        operation: &'static str,
        timeout: Duration,
    },

    #[error("cluster API error: {0}")]
    Api(String),

    #[error("watch stream closed")]
    WatchClosed,
}

impl ClusterError {
    pub fn not_found(kind: &'static str, key: impl ToString) -> Self {
        ClusterError::NotFound {
            kind,
            key: key.to_string(),
        }
    }

    pub fn invalid(kind: &'static str, key: impl ToString, reason: impl Into<String>) -> Self {
        ClusterError::InvalidData {
            kind,
            key: key.to_string(),
            reason: reason.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, ClusterError::NotFound { .. })
    }
}

/// Reconciliation failure, reported back to the queue for retry
#[derive(Error, Debug)]
pub enum ReconcileError {
    #[error("failed to list routing resources: {0}")]
    List(#[source] ClusterError),

    #[error("failed to resolve backend service {service}: {source}")]
    Backend {
        service: String,
        #[source]
        source: ClusterError,
    },

    #[error("failed to update status of {key}: {source}")]
    Status {
        key: ResourceKey,
        #[source]
        source: ClusterError,
    },
}

/// Certificate material that cannot be turned into a signing key
#[derive(Error, Debug)]
pub enum TlsError {
    #[error("no certificate found in PEM data")]
    NoCertificate,

    #[error("no private key found in PEM data")]
    NoPrivateKey,

    #[error("private key does not match certificate")]
    KeyMismatch,

    #[error("invalid PEM data: {0}")]
    Pem(#[from] std::io::Error),

    #[error("TLS error: {0}")]
    Rustls(#[from] rustls::Error),
}

/// Failures while forwarding a request to a backend
#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("backend service unavailable: {0}")]
    BackendUnavailable(#[source] ClusterError),

    #[error("backend request failed: {0}")]
    Upstream(String),

    #[error("backend did not respond within {0:?}")]
    UpstreamTimeout(Duration),

    #[error("invalid backend request: {0}")]
    InvalidRequest(String),
}

/// Invalid controller configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("invalid value for {var}: {reason}")]
    InvalidValue { var: &'static str, reason: String },
}

/// Top-level Portico errors
#[derive(Error, Debug)]
pub enum PorticoError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Cluster(#[from] ClusterError),

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
