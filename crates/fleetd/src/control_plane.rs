//! Control plane assembly.
//!
//! Builds every subsystem from a [`FleetdConfig`], serves the HTTP surface
//! (agent WebSocket + health) and runs the shutdown drain:
//!
//! 1. Flip the draining flag (health answers 503)
//! 2. Close every agent connection, failing their pending commands
//! 3. Stop the stuck-deployment reaper
//! 4. Let the HTTP server finish

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use serde_json::json;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use fleet_core::{AppCatalog, MutexManager};
use fleetgrid_channel::CommandChannel;
use fleetgrid_deployer::{Deployer, EnvFileRenderer};
use fleetgrid_health::DeploymentHealthMonitor;
use fleetgrid_proxy::{AdminApiSink, ConfigGenerator, ProxyController, RouteTable};
use fleetgrid_registry::{DependencyResolver, ServiceRegistry};
use fleetgrid_state::{ServerRecord, StateStore, epoch_secs};

use crate::agent_ws;
use crate::config::FleetdConfig;

/// Shared state for HTTP handlers.
#[derive(Clone)]
pub struct AppState {
    pub channel: CommandChannel,
    pub draining: Arc<AtomicBool>,
}

pub struct ControlPlane {
    config: FleetdConfig,
    store: StateStore,
    channel: CommandChannel,
    deployer: Arc<Deployer>,
    monitor: Arc<DeploymentHealthMonitor>,
    draining: Arc<AtomicBool>,
}

impl ControlPlane {
    /// Open the on-disk store under `data_dir` and assemble.
    pub fn open(config: FleetdConfig) -> anyhow::Result<Self> {
        std::fs::create_dir_all(&config.data_dir)?;
        let db_path = config.data_dir.join("fleetgrid.redb");
        let store = StateStore::open(&db_path)?;
        info!(path = ?db_path, "state store opened");
        Self::with_store(config, store)
    }

    pub fn with_store(config: FleetdConfig, store: StateStore) -> anyhow::Result<Self> {
        seed_servers(&config, &store)?;

        let catalog = if config.catalog_dir.is_dir() {
            AppCatalog::load_dir(&config.catalog_dir)?
        } else {
            warn!(dir = ?config.catalog_dir, "catalog directory missing, starting with no apps");
            AppCatalog::new()
        };

        let locks = Arc::new(MutexManager::new());
        let channel = CommandChannel::new(store.clone(), locks.clone(), config.channel_config());

        let registry = ServiceRegistry::new(store.clone(), config.control_plane.server_id.clone());
        let resolver = DependencyResolver::new(registry, Arc::new(catalog));

        let mut generator = ConfigGenerator::new(
            RouteTable::new(store.clone()),
            config.proxy.control_plane_upstream.clone(),
        );
        if let Some(ui) = &config.proxy.ui_upstream {
            generator = generator.with_ui_upstream(ui.clone());
        }
        if let Some(ca) = &config.proxy.ca_addr {
            generator = generator.with_ca_addr(ca.clone());
        }
        let sink = AdminApiSink::new(config.proxy.admin_addr.clone())
            .with_path(config.proxy.admin_path.clone());
        let proxy = Arc::new(ProxyController::new(generator, Arc::new(sink)));

        let renderer =
            EnvFileRenderer::new().with_output_dir(config.data_dir.join("deployments"));
        let deployer = Deployer::new(resolver, channel.clone(), proxy)
            .with_renderer(Arc::new(renderer));

        let monitor = DeploymentHealthMonitor::new(store.clone(), locks)
            .with_config(config.monitor_config());

        Ok(Self {
            config,
            store,
            channel,
            deployer: Arc::new(deployer),
            monitor: Arc::new(monitor),
            draining: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub fn channel(&self) -> &CommandChannel {
        &self.channel
    }

    pub fn deployer(&self) -> &Arc<Deployer> {
        &self.deployer
    }

    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::SeqCst)
    }

    pub fn router(&self) -> Router {
        let state = AppState {
            channel: self.channel.clone(),
            draining: self.draining.clone(),
        };
        Router::new()
            .route("/health", get(health))
            .route("/agent/ws", get(agent_ws::upgrade))
            .with_state(state)
    }

    pub fn spawn_monitor(&self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let monitor = self.monitor.clone();
        tokio::spawn(async move { monitor.run(shutdown).await })
    }

    /// Refuse new work, drop every agent, stop background loops.
    pub async fn drain(&self, shutdown_tx: &watch::Sender<bool>) {
        if self.draining.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("draining control plane");
        let closed = self.channel.close_all().await;
        info!(closed, "agent connections closed");
        let _ = shutdown_tx.send(true);
    }

    /// Serve until `signal` resolves, then drain.
    pub async fn run(self, signal: impl Future<Output = ()> + Send + 'static) -> anyhow::Result<()> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let monitor_handle = self.spawn_monitor(shutdown_rx);

        let listener = tokio::net::TcpListener::bind(self.config.listen).await?;
        info!(addr = %self.config.listen, "control plane listening");

        let router = self.router();
        let plane = Arc::new(self);
        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                signal.await;
                info!("shutdown signal received");
                plane.drain(&shutdown_tx).await;
            })
            .await?;

        let _ = monitor_handle.await;
        info!("control plane stopped");
        Ok(())
    }
}

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    if state.draining.load(Ordering::SeqCst) {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            axum::Json(json!({ "status": "draining" })),
        );
    }
    (
        StatusCode::OK,
        axum::Json(json!({
            "status": "ok",
            "agents": state.channel.connected_servers().len(),
        })),
    )
}

/// Upsert the control-plane host and configured servers, keeping runtime
/// fields of records that already exist.
fn seed_servers(config: &FleetdConfig, store: &StateStore) -> anyhow::Result<()> {
    let now = epoch_secs();
    let core_id = config.core_server_id();
    let mut seeds = vec![(
        config.control_plane.server_id.clone(),
        config.control_plane.server_id.clone(),
        config.control_plane.host.clone(),
        None,
    )];
    for seed in &config.servers {
        seeds.push((
            seed.id.clone(),
            seed.name.clone().unwrap_or_else(|| seed.id.clone()),
            seed.host.clone(),
            seed.token_hash.clone(),
        ));
    }

    for (id, name, host, token_hash) in seeds {
        let existing = store.get_server(&id)?;
        let record = ServerRecord {
            is_core: id == core_id,
            token_hash: token_hash.or_else(|| existing.as_ref().and_then(|s| s.token_hash.clone())),
            online: false,
            last_seen: existing.as_ref().map_or(0, |s| s.last_seen),
            metrics: existing.as_ref().and_then(|s| s.metrics.clone()),
            created_at: existing.as_ref().map_or(now, |s| s.created_at),
            id,
            name,
            host,
        };
        store.put_server(&record)?;
    }
    Ok(())
}
