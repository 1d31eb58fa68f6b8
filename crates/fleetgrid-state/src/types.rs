//! Domain types for the Fleetgrid state store.
//!
//! These types represent the persisted state of servers, deployments,
//! services, routes, secrets and the command log. All types are
//! serializable to/from JSON for storage in redb tables.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use fleet_core::{ConfigMap, Protocol};

/// Unique identifier for a deployment.
pub type DeploymentId = String;

/// Unique identifier for a managed server (one agent per server).
pub type ServerId = String;

/// Unique identifier for a dispatched command.
pub type CommandId = String;

/// Secret fields of a deployment: field name → value.
pub type SecretMap = BTreeMap<String, String>;

/// Current unix time in seconds.
pub fn epoch_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

// ── Server ────────────────────────────────────────────────────────

/// A managed host running an agent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerRecord {
    pub id: ServerId,
    pub name: String,
    /// Address other servers use to reach services on this host.
    pub host: String,
    /// The core server hosts mandatory apps.
    #[serde(default)]
    pub is_core: bool,
    /// SHA-256 hex digest of the agent token.
    pub token_hash: Option<String>,
    #[serde(default)]
    pub online: bool,
    /// Unix timestamp of the last message from the agent.
    pub last_seen: u64,
    /// Last metrics payload from a status report.
    pub metrics: Option<serde_json::Value>,
    pub created_at: u64,
}

// ── Deployment ────────────────────────────────────────────────────

/// Lifecycle status of a deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentStatus {
    Pending,
    Installing,
    Configuring,
    Running,
    Stopped,
    Uninstalling,
    Error,
}

impl DeploymentStatus {
    /// Statuses that only exist while a saga or command is in flight.
    pub const TRANSIENT: [DeploymentStatus; 3] = [
        DeploymentStatus::Installing,
        DeploymentStatus::Configuring,
        DeploymentStatus::Uninstalling,
    ];

    pub fn is_transient(self) -> bool {
        Self::TRANSIENT.contains(&self)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DeploymentStatus::Pending => "pending",
            DeploymentStatus::Installing => "installing",
            DeploymentStatus::Configuring => "configuring",
            DeploymentStatus::Running => "running",
            DeploymentStatus::Stopped => "stopped",
            DeploymentStatus::Uninstalling => "uninstalling",
            DeploymentStatus::Error => "error",
        }
    }
}

impl fmt::Display for DeploymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An app installed (or being installed) on a server.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Deployment {
    pub id: DeploymentId,
    pub server_id: ServerId,
    pub app_name: String,
    pub version: String,
    /// Non-secret resolved configuration.
    pub config: ConfigMap,
    pub group_id: Option<String>,
    pub status: DeploymentStatus,
    pub status_message: Option<String>,
    pub created_at: u64,
    pub updated_at: u64,
}

// ── Service ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceStatus {
    Available,
    Unavailable,
}

/// Where a named service provided by a deployment can be reached.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServiceRecord {
    pub deployment_id: DeploymentId,
    pub service_name: String,
    pub server_id: ServerId,
    pub host: String,
    pub port: u16,
    pub protocol: Protocol,
    pub status: ServiceStatus,
    pub registered_at: u64,
    pub updated_at: u64,
}

// ── Routes ────────────────────────────────────────────────────────

/// Web UI route for a deployment (one per deployment).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProxyRoute {
    pub deployment_id: DeploymentId,
    pub path: String,
    pub upstream_host: String,
    pub upstream_port: u16,
    pub active: bool,
    pub created_at: u64,
}

/// Router entry for a provided service.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServiceRoute {
    pub deployment_id: DeploymentId,
    pub service_name: String,
    pub protocol: Protocol,
    /// Path prefix for HTTP routes.
    pub path: Option<String>,
    /// Router listen port for TCP routes.
    pub external_port: Option<u16>,
    pub upstream_host: String,
    pub upstream_port: u16,
    pub active: bool,
    pub created_at: u64,
}

// ── Command log ───────────────────────────────────────────────────

/// Action an agent is asked to perform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandAction {
    Install,
    Configure,
    Start,
    Stop,
    Restart,
    Uninstall,
    StatusCheck,
}

impl CommandAction {
    pub fn as_str(self) -> &'static str {
        match self {
            CommandAction::Install => "install",
            CommandAction::Configure => "configure",
            CommandAction::Start => "start",
            CommandAction::Stop => "stop",
            CommandAction::Restart => "restart",
            CommandAction::Uninstall => "uninstall",
            CommandAction::StatusCheck => "status_check",
        }
    }
}

impl fmt::Display for CommandAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandStatus {
    Pending,
    Acknowledged,
    Completed,
    Failed,
    Timeout,
}

impl CommandStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            CommandStatus::Completed | CommandStatus::Failed | CommandStatus::Timeout
        )
    }
}

/// Persistent record of a command sent to an agent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CommandRecord {
    pub id: CommandId,
    pub server_id: ServerId,
    pub deployment_id: Option<DeploymentId>,
    pub action: CommandAction,
    pub status: CommandStatus,
    pub message: Option<String>,
    pub created_at: u64,
    pub acknowledged_at: Option<u64>,
    pub completed_at: Option<u64>,
}

impl ServiceRecord {
    /// Build the composite key for the services table.
    pub fn table_key(&self) -> String {
        service_key(&self.deployment_id, &self.service_name)
    }

    pub fn is_available(&self) -> bool {
        self.status == ServiceStatus::Available
    }
}

impl ServiceRoute {
    /// Build the composite key for the service routes table.
    pub fn table_key(&self) -> String {
        service_key(&self.deployment_id, &self.service_name)
    }
}

/// Composite `{deployment_id}:{service_name}` key.
pub fn service_key(deployment_id: &str, service_name: &str) -> String {
    format!("{deployment_id}:{service_name}")
}
