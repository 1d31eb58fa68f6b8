//! Agent connection registry.
//!
//! Tracks at most one live connection per server. The transport hands each
//! authenticated connection to [`CommandChannel::connect`] and gets back an
//! [`AgentSession`]: a send queue to drain onto the wire. When the channel
//! drops a connection (replacement, heartbeat timeout, shutdown) the queue
//! closes and the transport must close the socket.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use fleet_core::MutexManager;
use fleetgrid_state::{
    CommandAction, CommandStatus, DeploymentStatus, ServerId, StateStore,
};

use crate::dispatch::PendingCommand;
use crate::error::ChannelResult;
use crate::protocol::{ACK_TIMEOUT, AgentMessage, AppReport, ControlMessage, ReportedStatus};

/// Timing knobs for the channel.
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    pub ack_timeout: Duration,
    pub heartbeat_interval: Duration,
    /// A connection silent for longer than this is dropped.
    pub heartbeat_timeout: Duration,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            ack_timeout: ACK_TIMEOUT,
            heartbeat_interval: Duration::from_secs(30),
            heartbeat_timeout: Duration::from_secs(90),
        }
    }
}

/// Observable channel lifecycle events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    Connected {
        server_id: ServerId,
    },
    Disconnected {
        server_id: ServerId,
    },
    CommandFinished {
        command_id: String,
        server_id: ServerId,
        deployment_id: Option<String>,
        action: CommandAction,
        status: CommandStatus,
    },
}

/// The transport's handle on one live connection.
pub struct AgentSession {
    pub server_id: ServerId,
    pub conn_id: u64,
    /// Messages to write to the agent. `None` means the channel dropped
    /// this connection.
    pub outbound: mpsc::UnboundedReceiver<ControlMessage>,
}

pub(crate) struct AgentConnection {
    pub(crate) conn_id: u64,
    pub(crate) sender: mpsc::UnboundedSender<ControlMessage>,
    last_seen: Arc<Mutex<Instant>>,
    heartbeat: JoinHandle<()>,
}

pub(crate) struct Inner {
    pub(crate) store: StateStore,
    pub(crate) locks: Arc<MutexManager>,
    pub(crate) config: ChannelConfig,
    pub(crate) connections: Mutex<HashMap<ServerId, AgentConnection>>,
    pub(crate) pending: Mutex<HashMap<String, PendingCommand>>,
    pub(crate) events: broadcast::Sender<ChannelEvent>,
    next_conn_id: AtomicU64,
}

/// Connection registry plus command dispatcher. Cheap to clone.
#[derive(Clone)]
pub struct CommandChannel {
    pub(crate) inner: Arc<Inner>,
}

impl CommandChannel {
    pub fn new(store: StateStore, locks: Arc<MutexManager>, config: ChannelConfig) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            inner: Arc::new(Inner {
                store,
                locks,
                config,
                connections: Mutex::new(HashMap::new()),
                pending: Mutex::new(HashMap::new()),
                events,
                next_conn_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn store(&self) -> &StateStore {
        &self.inner.store
    }

    pub fn locks(&self) -> &Arc<MutexManager> {
        &self.inner.locks
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChannelEvent> {
        self.inner.events.subscribe()
    }

    pub(crate) fn emit(&self, event: ChannelEvent) {
        // No receivers is fine.
        let _ = self.inner.events.send(event);
    }

    pub(crate) fn connections(
        &self,
    ) -> std::sync::MutexGuard<'_, HashMap<ServerId, AgentConnection>> {
        self.inner
            .connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_connected(&self, server_id: &str) -> bool {
        self.connections().contains_key(server_id)
    }

    pub fn connected_servers(&self) -> Vec<ServerId> {
        let mut servers: Vec<ServerId> = self.connections().keys().cloned().collect();
        servers.sort();
        servers
    }

    /// Queue a message on a server's live connection.
    pub(crate) fn send_to(&self, server_id: &str, message: ControlMessage) -> bool {
        match self.connections().get(server_id) {
            Some(conn) => conn.sender.send(message).is_ok(),
            None => false,
        }
    }

    // ── Connection lifecycle ───────────────────────────────────────

    /// Register an authenticated connection for `server_id`.
    ///
    /// Runs under the server's lock. An existing connection is dropped
    /// first (heartbeat stopped, send queue closed); commands already in
    /// flight for the server stay pending for the new connection.
    pub async fn connect(&self, server_id: &str) -> ChannelResult<AgentSession> {
        let _guard = self.inner.locks.lock_server(server_id).await;

        if let Some(old) = self.connections().remove(server_id) {
            old.heartbeat.abort();
            warn!(%server_id, old_conn = old.conn_id, "replacing existing agent connection");
        }

        let conn_id = self.inner.next_conn_id.fetch_add(1, Ordering::Relaxed);
        let (sender, outbound) = mpsc::unbounded_channel();
        let last_seen = Arc::new(Mutex::new(Instant::now()));
        let heartbeat = self.spawn_heartbeat(server_id, conn_id, sender.clone(), last_seen.clone());
        self.connections().insert(
            server_id.to_string(),
            AgentConnection {
                conn_id,
                sender: sender.clone(),
                last_seen,
                heartbeat,
            },
        );

        if let Err(e) = self.inner.store.set_server_online(server_id, true) {
            warn!(%server_id, error = %e, "failed to mark server online");
        }
        info!(%server_id, conn_id, "agent connected");
        self.emit(ChannelEvent::Connected {
            server_id: server_id.to_string(),
        });
        let _ = sender.send(ControlMessage::StatusRequest);

        Ok(AgentSession {
            server_id: server_id.to_string(),
            conn_id,
            outbound,
        })
    }

    /// Tear down `conn_id` for `server_id`.
    ///
    /// A disconnect from a connection that was already replaced is ignored
    /// and returns `false`. Otherwise every pending command of the server is
    /// rejected and the server is marked offline.
    pub async fn disconnect(&self, server_id: &str, conn_id: u64) -> bool {
        let orphaned = {
            let _guard = self.inner.locks.lock_server(server_id).await;
            let removed = {
                let mut connections = self.connections();
                match connections.get(server_id) {
                    Some(conn) if conn.conn_id == conn_id => connections.remove(server_id),
                    _ => None,
                }
            };
            let Some(conn) = removed else {
                debug!(%server_id, conn_id, "ignoring disconnect from stale connection");
                return false;
            };
            conn.heartbeat.abort();

            if let Err(e) = self.inner.store.set_server_online(server_id, false) {
                warn!(%server_id, error = %e, "failed to mark server offline");
            }
            info!(%server_id, conn_id, "agent disconnected");
            self.take_pending_for_server(server_id)
        };

        self.reject_disconnected(server_id, orphaned);
        self.emit(ChannelEvent::Disconnected {
            server_id: server_id.to_string(),
        });
        self.inner.locks.cleanup_server_mutex(server_id);
        true
    }

    /// Drop every live connection (graceful shutdown).
    pub async fn close_all(&self) -> usize {
        let live: Vec<(ServerId, u64)> = self
            .connections()
            .iter()
            .map(|(id, conn)| (id.clone(), conn.conn_id))
            .collect();
        let mut closed = 0;
        for (server_id, conn_id) in live {
            if self.disconnect(&server_id, conn_id).await {
                closed += 1;
            }
        }
        info!(closed, "all agent connections closed");
        closed
    }

    fn spawn_heartbeat(
        &self,
        server_id: &str,
        conn_id: u64,
        sender: mpsc::UnboundedSender<ControlMessage>,
        last_seen: Arc<Mutex<Instant>>,
    ) -> JoinHandle<()> {
        let channel = self.clone();
        let server_id = server_id.to_string();
        let interval = self.inner.config.heartbeat_interval;
        let timeout = self.inner.config.heartbeat_timeout;
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                let silent_for = last_seen
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .elapsed();
                if silent_for > timeout {
                    warn!(%server_id, conn_id, ?silent_for, "agent heartbeat timed out");
                    // Disconnect aborts this task's handle, so run it elsewhere.
                    tokio::spawn(async move {
                        channel.disconnect(&server_id, conn_id).await;
                    });
                    return;
                }
                if sender.send(ControlMessage::Ping).is_err() {
                    return;
                }
            }
        })
    }

    // ── Inbound ────────────────────────────────────────────────────

    /// Dispatch one message received on connection `conn_id` of `server_id`.
    pub async fn handle_message(&self, server_id: &str, conn_id: u64, message: AgentMessage) {
        self.touch(server_id, conn_id);
        match message {
            AgentMessage::Auth { .. } => {
                debug!(%server_id, "ignoring repeated auth frame");
            }
            AgentMessage::CommandAck { command_id, .. } => {
                self.on_ack(&command_id);
            }
            AgentMessage::CommandResult {
                command_id,
                status,
                message,
            } => {
                self.on_result(&command_id, status, message).await;
            }
            AgentMessage::Status { metrics, apps } => {
                self.on_status(server_id, metrics, apps).await;
            }
            AgentMessage::Pong => {}
        }
    }

    fn touch(&self, server_id: &str, conn_id: u64) {
        if let Some(conn) = self.connections().get(server_id)
            && conn.conn_id == conn_id
        {
            *conn.last_seen.lock().unwrap_or_else(PoisonError::into_inner) = Instant::now();
        }
    }

    /// Apply an agent status report.
    ///
    /// Deployments in a transient status are owned by an in-flight saga or
    /// command and are never overwritten here.
    async fn on_status(
        &self,
        server_id: &str,
        metrics: Option<serde_json::Value>,
        apps: Vec<AppReport>,
    ) {
        let store = &self.inner.store;
        if let Err(e) = store.record_server_metrics(server_id, metrics) {
            warn!(%server_id, error = %e, "failed to record server metrics");
        }

        for report in apps {
            let reported = match report.status {
                ReportedStatus::Running => DeploymentStatus::Running,
                ReportedStatus::Stopped => DeploymentStatus::Stopped,
                ReportedStatus::Error => DeploymentStatus::Error,
                ReportedStatus::Unknown => continue,
            };
            let deployment = match store.find_deployment(server_id, &report.app_name) {
                Ok(Some(d)) => d,
                Ok(None) => continue,
                Err(e) => {
                    warn!(%server_id, app = %report.app_name, error = %e, "status lookup failed");
                    continue;
                }
            };

            self.inner
                .locks
                .with_deployment_lock(&deployment.id, || async {
                    let current = match store.get_deployment(&deployment.id) {
                        Ok(Some(d)) => d,
                        _ => return,
                    };
                    if current.status.is_transient() || current.status == reported {
                        return;
                    }
                    match store.update_deployment_status(&current.id, reported, None) {
                        Ok(_) => debug!(
                            deployment_id = %current.id,
                            from = %current.status,
                            to = %reported,
                            "deployment status reconciled from agent report"
                        ),
                        Err(e) => warn!(deployment_id = %current.id, error = %e, "status update failed"),
                    }
                })
                .await;
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use fleetgrid_state::{Deployment, ServerRecord};

    pub(crate) fn setup(config: ChannelConfig) -> CommandChannel {
        let store = StateStore::open_in_memory().unwrap();
        for id in ["srv-1", "srv-2"] {
            store
                .put_server(&ServerRecord {
                    id: id.into(),
                    name: id.into(),
                    host: "10.0.0.2".into(),
                    is_core: false,
                    token_hash: None,
                    online: false,
                    last_seen: 0,
                    metrics: None,
                    created_at: 0,
                })
                .unwrap();
        }
        CommandChannel::new(store, Arc::new(MutexManager::new()), config)
    }

    pub(crate) fn put_deployment(channel: &CommandChannel, id: &str, status: DeploymentStatus) {
        channel
            .store()
            .put_deployment(&Deployment {
                id: id.into(),
                server_id: "srv-1".into(),
                app_name: format!("app-{id}"),
                version: "1.0.0".into(),
                config: Default::default(),
                group_id: None,
                status,
                status_message: None,
                created_at: 0,
                updated_at: 0,
            })
            .unwrap();
    }

    #[tokio::test]
    async fn connect_marks_online_and_requests_status() {
        let channel = setup(ChannelConfig::default());
        let mut events = channel.subscribe();

        let mut session = channel.connect("srv-1").await.unwrap();
        assert!(channel.is_connected("srv-1"));
        assert!(channel.store().get_server("srv-1").unwrap().unwrap().online);
        assert_eq!(session.outbound.recv().await, Some(ControlMessage::StatusRequest));
        assert_eq!(
            events.recv().await.unwrap(),
            ChannelEvent::Connected {
                server_id: "srv-1".into()
            }
        );
    }

    #[tokio::test]
    async fn reconnect_replaces_old_connection() {
        let channel = setup(ChannelConfig::default());
        let mut first = channel.connect("srv-1").await.unwrap();
        let second = channel.connect("srv-1").await.unwrap();
        assert_ne!(first.conn_id, second.conn_id);

        // The old queue drains and then reports closed.
        assert_eq!(first.outbound.recv().await, Some(ControlMessage::StatusRequest));
        assert_eq!(first.outbound.recv().await, None);

        // A late disconnect from the replaced connection is a no-op.
        assert!(!channel.disconnect("srv-1", first.conn_id).await);
        assert!(channel.is_connected("srv-1"));
        assert_eq!(channel.connected_servers(), vec!["srv-1".to_string()]);

        assert!(channel.disconnect("srv-1", second.conn_id).await);
        assert!(!channel.is_connected("srv-1"));
        assert!(!channel.store().get_server("srv-1").unwrap().unwrap().online);
    }

    #[tokio::test]
    async fn racing_connects_leave_exactly_one() {
        let channel = setup(ChannelConfig::default());
        let (a, b) = tokio::join!(channel.connect("srv-1"), channel.connect("srv-1"));
        let (mut a, mut b) = (a.unwrap(), b.unwrap());

        let mut closed = 0;
        for session in [&mut a, &mut b] {
            assert_eq!(session.outbound.recv().await, Some(ControlMessage::StatusRequest));
            let next = tokio::time::timeout(Duration::from_millis(50), session.outbound.recv()).await;
            if matches!(next, Ok(None)) {
                closed += 1;
            }
        }
        assert_eq!(closed, 1);
        assert_eq!(channel.connected_servers().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn silent_connection_is_dropped() {
        let channel = setup(ChannelConfig {
            heartbeat_interval: Duration::from_secs(10),
            heartbeat_timeout: Duration::from_secs(25),
            ..ChannelConfig::default()
        });
        let mut session = channel.connect("srv-1").await.unwrap();
        assert_eq!(session.outbound.recv().await, Some(ControlMessage::StatusRequest));
        assert_eq!(session.outbound.recv().await, Some(ControlMessage::Ping));

        // Answering keeps it alive past the timeout.
        tokio::time::sleep(Duration::from_secs(5)).await;
        channel
            .handle_message("srv-1", session.conn_id, AgentMessage::Pong)
            .await;
        tokio::time::sleep(Duration::from_secs(20)).await;
        assert!(channel.is_connected("srv-1"));

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(!channel.is_connected("srv-1"));
        while let Some(msg) = session.outbound.recv().await {
            assert_eq!(msg, ControlMessage::Ping);
        }
    }

    #[tokio::test]
    async fn status_report_skips_transient_deployments() {
        let channel = setup(ChannelConfig::default());
        put_deployment(&channel, "busy", DeploymentStatus::Installing);
        put_deployment(&channel, "idle", DeploymentStatus::Running);
        let session = channel.connect("srv-1").await.unwrap();

        channel
            .handle_message(
                "srv-1",
                session.conn_id,
                AgentMessage::Status {
                    metrics: Some(serde_json::json!({"load": 0.3})),
                    apps: vec![
                        AppReport {
                            app_name: "app-busy".into(),
                            status: ReportedStatus::Stopped,
                        },
                        AppReport {
                            app_name: "app-idle".into(),
                            status: ReportedStatus::Stopped,
                        },
                    ],
                },
            )
            .await;

        let store = channel.store();
        assert_eq!(
            store.get_deployment("busy").unwrap().unwrap().status,
            DeploymentStatus::Installing
        );
        assert_eq!(
            store.get_deployment("idle").unwrap().unwrap().status,
            DeploymentStatus::Stopped
        );
        assert!(store.get_server("srv-1").unwrap().unwrap().metrics.is_some());
    }

    #[tokio::test]
    async fn close_all_disconnects_everyone() {
        let channel = setup(ChannelConfig::default());
        let _a = channel.connect("srv-1").await.unwrap();
        let _b = channel.connect("srv-2").await.unwrap();
        assert_eq!(channel.close_all().await, 2);
        assert!(channel.connected_servers().is_empty());
    }
}
