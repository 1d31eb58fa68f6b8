//! Deployment health monitor: periodic stuck-deployment reaper.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use fleet_core::MutexManager;
use fleetgrid_state::{
    CommandStatus, DeploymentId, DeploymentStatus, StateResult, StateStore, epoch_secs,
};

#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub interval: Duration,
    /// A transient deployment idle for longer than this is failed.
    pub stuck_threshold: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            stuck_threshold: Duration::from_secs(15 * 60),
        }
    }
}

/// One deployment failed by a scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReapedDeployment {
    pub deployment_id: DeploymentId,
    /// Status it was stuck in.
    pub status: DeploymentStatus,
    pub stuck_for: Duration,
    pub commands_timed_out: u32,
}

pub struct DeploymentHealthMonitor {
    store: StateStore,
    locks: Arc<MutexManager>,
    config: MonitorConfig,
}

impl DeploymentHealthMonitor {
    pub fn new(store: StateStore, locks: Arc<MutexManager>) -> Self {
        Self {
            store,
            locks,
            config: MonitorConfig::default(),
        }
    }

    pub fn with_config(mut self, config: MonitorConfig) -> Self {
        self.config = config;
        self
    }

    /// Scan every `interval` until `shutdown` flips.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval = ?self.config.interval,
            threshold = ?self.config.stuck_threshold,
            "deployment health monitor started"
        );
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.config.interval) => {
                    match self.reap_stuck(epoch_secs()).await {
                        Ok(reaped) if !reaped.is_empty() => {
                            warn!(count = reaped.len(), "stuck deployments failed");
                        }
                        Ok(_) => debug!("no stuck deployments"),
                        Err(e) => error!(error = %e, "stuck deployment scan failed"),
                    }
                }
                _ = shutdown.changed() => {
                    info!("deployment health monitor stopping");
                    break;
                }
            }
        }
    }

    /// Fail every transient deployment idle for longer than the threshold,
    /// judged at unix time `now`.
    pub async fn reap_stuck(&self, now: u64) -> StateResult<Vec<ReapedDeployment>> {
        let threshold = self.config.stuck_threshold.as_secs();
        let mut reaped = Vec::new();

        for candidate in self.store.list_transient_deployments()? {
            if now.saturating_sub(candidate.updated_at) <= threshold {
                continue;
            }

            let _guard = self.locks.lock_deployment(&candidate.id).await;
            // Re-read: the saga may have moved it while we waited.
            let Some(current) = self.store.get_deployment(&candidate.id)? else {
                continue;
            };
            let idle = now.saturating_sub(current.updated_at);
            if !current.status.is_transient() || idle <= threshold {
                continue;
            }

            let minutes = idle / 60;
            let message = format!("stuck in {} for {minutes} minutes", current.status);
            self.store.update_deployment_status(
                &current.id,
                DeploymentStatus::Error,
                Some(message.clone()),
            )?;

            let mut commands_timed_out = 0;
            for command in self.store.list_commands_for_deployment(&current.id)? {
                if command.status.is_terminal() {
                    continue;
                }
                self.store.update_command_status(
                    &command.id,
                    CommandStatus::Timeout,
                    Some(message.clone()),
                )?;
                commands_timed_out += 1;
            }

            warn!(
                deployment_id = %current.id,
                status = %current.status,
                minutes,
                commands_timed_out,
                "stuck deployment marked error"
            );
            reaped.push(ReapedDeployment {
                deployment_id: current.id,
                status: current.status,
                stuck_for: Duration::from_secs(idle),
                commands_timed_out,
            });
        }
        Ok(reaped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleetgrid_state::{CommandAction, CommandRecord, Deployment};

    const NOW: u64 = 1_700_000_000;

    fn deployment(id: &str, status: DeploymentStatus, idle_minutes: u64) -> Deployment {
        Deployment {
            id: id.into(),
            server_id: "srv-1".into(),
            app_name: format!("app-{id}"),
            version: "1.0.0".into(),
            config: Default::default(),
            group_id: None,
            status,
            status_message: None,
            created_at: NOW - idle_minutes * 60,
            updated_at: NOW - idle_minutes * 60,
        }
    }

    fn command(id: &str, deployment_id: &str, status: CommandStatus) -> CommandRecord {
        CommandRecord {
            id: id.into(),
            server_id: "srv-1".into(),
            deployment_id: Some(deployment_id.into()),
            action: CommandAction::Install,
            status,
            message: None,
            created_at: NOW - 1200,
            acknowledged_at: None,
            completed_at: None,
        }
    }

    fn monitor(store: &StateStore) -> DeploymentHealthMonitor {
        DeploymentHealthMonitor::new(store.clone(), Arc::new(MutexManager::new()))
    }

    #[tokio::test]
    async fn twenty_minutes_is_stuck_ten_is_not() {
        let store = StateStore::open_in_memory().unwrap();
        store
            .put_deployment(&deployment("old", DeploymentStatus::Installing, 20))
            .unwrap();
        store
            .put_deployment(&deployment("young", DeploymentStatus::Installing, 10))
            .unwrap();
        store
            .put_deployment(&deployment("idle", DeploymentStatus::Running, 600))
            .unwrap();
        store
            .put_command(&command("c-pending", "old", CommandStatus::Pending))
            .unwrap();
        store
            .put_command(&command("c-acked", "old", CommandStatus::Acknowledged))
            .unwrap();
        store
            .put_command(&command("c-done", "old", CommandStatus::Completed))
            .unwrap();

        let reaped = monitor(&store).reap_stuck(NOW).await.unwrap();
        assert_eq!(reaped.len(), 1);
        assert_eq!(reaped[0].deployment_id, "old");
        assert_eq!(reaped[0].status, DeploymentStatus::Installing);
        assert_eq!(reaped[0].commands_timed_out, 2);

        let old = store.get_deployment("old").unwrap().unwrap();
        assert_eq!(old.status, DeploymentStatus::Error);
        assert_eq!(
            old.status_message.as_deref(),
            Some("stuck in installing for 20 minutes")
        );
        assert_eq!(
            store.get_command("c-pending").unwrap().unwrap().status,
            CommandStatus::Timeout
        );
        assert_eq!(
            store.get_command("c-done").unwrap().unwrap().status,
            CommandStatus::Completed
        );

        assert_eq!(
            store.get_deployment("young").unwrap().unwrap().status,
            DeploymentStatus::Installing
        );
        assert_eq!(
            store.get_deployment("idle").unwrap().unwrap().status,
            DeploymentStatus::Running
        );
    }

    #[tokio::test]
    async fn every_transient_status_is_covered() {
        let store = StateStore::open_in_memory().unwrap();
        store
            .put_deployment(&deployment("cfg", DeploymentStatus::Configuring, 16))
            .unwrap();
        store
            .put_deployment(&deployment("rm", DeploymentStatus::Uninstalling, 45))
            .unwrap();

        let mut reaped = monitor(&store).reap_stuck(NOW).await.unwrap();
        reaped.sort_by(|a, b| a.deployment_id.cmp(&b.deployment_id));
        assert_eq!(reaped.len(), 2);
        assert_eq!(reaped[0].status, DeploymentStatus::Configuring);
        assert_eq!(reaped[1].stuck_for, Duration::from_secs(45 * 60));

        // A second scan finds nothing left.
        assert!(monitor(&store).reap_stuck(NOW).await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn run_scans_on_interval_and_stops() {
        let store = StateStore::open_in_memory().unwrap();
        let now = epoch_secs();
        let mut stuck = deployment("old", DeploymentStatus::Installing, 0);
        stuck.updated_at = now - 30 * 60;
        store.put_deployment(&stuck).unwrap();

        let monitor = Arc::new(monitor(&store).with_config(MonitorConfig {
            interval: Duration::from_secs(60),
            ..MonitorConfig::default()
        }));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = {
            let monitor = monitor.clone();
            tokio::spawn(async move { monitor.run(shutdown_rx).await })
        };

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(
            store.get_deployment("old").unwrap().unwrap().status,
            DeploymentStatus::Installing
        );

        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(
            store.get_deployment("old").unwrap().unwrap().status,
            DeploymentStatus::Error
        );

        shutdown_tx.send(true).unwrap();
        task.await.unwrap();
    }
}
