//! Side collaborators of the deployer: audit trail and proxy HA.

use async_trait::async_trait;
use serde_json::Value;
use tracing::info;

use fleetgrid_state::Deployment;

/// Append-only record of operator-visible actions. Fire-and-forget.
pub trait AuditLog: Send + Sync {
    fn log(&self, action: &str, resource_type: &str, resource_id: &str, details: Value);
}

/// Emits audit entries as `tracing` events on the `audit` target.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingAuditLog;

impl AuditLog for TracingAuditLog {
    fn log(&self, action: &str, resource_type: &str, resource_id: &str, details: Value) {
        info!(
            target: "audit",
            %action,
            %resource_type,
            %resource_id,
            %details,
            "audit"
        );
    }
}

/// Notified when the fleet's reverse proxy itself gets deployed.
#[async_trait]
pub trait ProxyHaCoordinator: Send + Sync {
    async fn register_proxy(&self, deployment: &Deployment) -> anyhow::Result<()>;
}
