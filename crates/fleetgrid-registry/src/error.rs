//! Error types for the registry and resolver.

use fleetgrid_state::StateError;

/// Result type alias for registry and resolver operations.
pub type ResolveResult<T> = Result<T, ResolveError>;

#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    #[error("server not found: {0}")]
    UnknownServer(String),

    #[error("app not found in catalog: {0}")]
    UnknownApp(String),

    #[error("state error: {0}")]
    State(#[from] StateError),
}
