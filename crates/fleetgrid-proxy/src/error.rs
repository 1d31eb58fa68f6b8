//! Error types for route management and config pushes.

use fleetgrid_state::StateError;

pub type ProxyResult<T> = Result<T, ProxyError>;

#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("route conflict: {0}")]
    RouteConflict(String),

    #[error("state error: {0}")]
    State(#[from] StateError),

    #[error("config serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Failure reported by a [`ConfigSink`](crate::ConfigSink).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PushError {
    #[error("router unreachable: {0}")]
    Network(String),

    #[error("router rejected config with status {status}: {body}")]
    Status { status: u16, body: String },
}

impl PushError {
    /// Worth retrying: network errors and 429/502/503/504.
    pub fn is_transient(&self) -> bool {
        match self {
            PushError::Network(_) => true,
            PushError::Status { status, .. } => matches!(status, 429 | 502 | 503 | 504),
        }
    }

    /// The router understood the request and refused the config.
    pub fn is_rejection(&self) -> bool {
        matches!(self, PushError::Status { status, .. } if (400..500).contains(status) && *status != 429)
    }
}
