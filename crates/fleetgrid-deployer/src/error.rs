//! Deployer error types.

use thiserror::Error;

use fleetgrid_channel::ChannelError;
use fleetgrid_proxy::ProxyError;
use fleetgrid_registry::ResolveError;
use fleetgrid_state::{DeploymentStatus, StateError};

/// Coarse classification callers use to decide how to report a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Rejected before anything was changed.
    Validation,
    /// The agent is offline, went away, or could not carry out the command.
    AgentUnavailable,
    /// The agent did not answer in time. Never retried automatically.
    Timeout,
    /// The router did not accept the new configuration.
    RouterPush,
    Internal,
}

/// Errors that can occur during deployment operations.
#[derive(Debug, Error)]
pub enum DeployError {
    #[error("app not found in catalog: {0}")]
    UnknownApp(String),

    #[error("deployment not found: {0}")]
    UnknownDeployment(String),

    #[error("server not found: {0}")]
    UnknownServer(String),

    #[error("invalid version '{version}' for {app}: {reason}")]
    InvalidVersion {
        app: String,
        version: String,
        reason: String,
    },

    #[error("{app} is already deployed on server {server_id}")]
    AlreadyDeployed { app: String, server_id: String },

    #[error("{app} is a singleton and already runs on server {server_id}")]
    SingletonExists { app: String, server_id: String },

    #[error("{app} conflicts with {other} on server {server_id}")]
    Conflict {
        app: String,
        other: String,
        server_id: String,
    },

    #[error("{app} needs port {port} on server {server_id}, already claimed by deployment {owner}")]
    PortConflict {
        app: String,
        server_id: String,
        port: u16,
        owner: String,
    },

    #[error("dependencies of {app} not satisfied: {}", errors.join("; "))]
    Dependencies { app: String, errors: Vec<String> },

    #[error("{app} requires config field '{field}'")]
    MissingConfig { app: String, field: String },

    #[error("{app} is mandatory on the core server and cannot be uninstalled")]
    Mandatory { app: String },

    #[error("deployment {deployment_id} is {status}")]
    InvalidState {
        deployment_id: String,
        status: DeploymentStatus,
    },

    #[error("agent for server {0} is not connected")]
    AgentUnavailable(String),

    #[error("router rejected configuration for deployment {0}")]
    RouterPush(String),

    #[error("render error: {0}")]
    Render(String),

    /// A step failed after the deployment was touched.
    #[error("{action} of deployment {deployment_id} failed: {source}")]
    Failed {
        action: &'static str,
        deployment_id: String,
        #[source]
        source: Box<DeployError>,
    },

    #[error("command error: {0}")]
    Channel(#[from] ChannelError),

    #[error("route error: {0}")]
    Route(#[from] ProxyError),

    #[error("resolve error: {0}")]
    Resolve(#[from] ResolveError),

    #[error("state store error: {0}")]
    State(#[from] StateError),
}

impl DeployError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            DeployError::UnknownApp(_)
            | DeployError::UnknownDeployment(_)
            | DeployError::UnknownServer(_)
            | DeployError::InvalidVersion { .. }
            | DeployError::AlreadyDeployed { .. }
            | DeployError::SingletonExists { .. }
            | DeployError::Conflict { .. }
            | DeployError::PortConflict { .. }
            | DeployError::Dependencies { .. }
            | DeployError::MissingConfig { .. }
            | DeployError::Mandatory { .. }
            | DeployError::InvalidState { .. }
            | DeployError::Route(ProxyError::RouteConflict(_)) => ErrorKind::Validation,
            DeployError::Resolve(ResolveError::UnknownServer(_) | ResolveError::UnknownApp(_)) => {
                ErrorKind::Validation
            }
            DeployError::AgentUnavailable(_) => ErrorKind::AgentUnavailable,
            DeployError::Channel(e) => match e {
                ChannelError::Timeout { .. } => ErrorKind::Timeout,
                ChannelError::NotConnected(_)
                | ChannelError::Disconnected { .. }
                | ChannelError::CommandFailed { .. } => ErrorKind::AgentUnavailable,
                ChannelError::AuthFailed(_) | ChannelError::State(_) => ErrorKind::Internal,
            },
            DeployError::RouterPush(_) => ErrorKind::RouterPush,
            DeployError::Failed { source, .. } => source.kind(),
            DeployError::Render(_)
            | DeployError::Route(_)
            | DeployError::Resolve(_)
            | DeployError::State(_) => ErrorKind::Internal,
        }
    }

    pub(crate) fn during(self, action: &'static str, deployment_id: &str) -> Self {
        DeployError::Failed {
            action,
            deployment_id: deployment_id.to_string(),
            source: Box::new(self),
        }
    }
}

pub type DeployResult<T> = Result<T, DeployError>;
