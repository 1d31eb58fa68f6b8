//! Deployer: install, configure, start, stop, restart and uninstall.
//!
//! Install is a saga. Every mutation after the provisional deployment row
//! registers its undo on a [`CompensationStack`]; any failure unwinds the
//! stack and returns the original error.
//!
//! Locking: the install precondition checks and the provisional persist
//! run under the target server's mutex. Status changes of an existing
//! deployment run under its deployment mutex, which is never held while
//! waiting for an agent result (the result path takes the same mutex).

use std::sync::Arc;

use serde_json::json;
use tracing::{debug, info, warn};
use uuid::Uuid;

use fleet_core::{AppCatalog, AppManifest, ConfigMap, MutexManager};
use fleetgrid_channel::CommandChannel;
use fleetgrid_proxy::{ProxyController, RouteTable, Upstream};
use fleetgrid_registry::{DependencyResolver, LOOPBACK, ServiceRegistry};
use fleetgrid_state::{
    CommandAction, Deployment, DeploymentStatus, SecretMap, ServerRecord, StateStore, epoch_secs,
};

use crate::error::{DeployError, DeployResult};
use crate::hooks::{AuditLog, ProxyHaCoordinator, TracingAuditLog};
use crate::render::{ConfigRenderer, EnvFileRenderer};
use crate::saga::{CompensationStack, InstallPhase};
use crate::secrets;

/// Parameters of an install.
#[derive(Debug, Clone)]
pub struct InstallRequest {
    pub server_id: String,
    pub app_name: String,
    pub config: ConfigMap,
    /// Defaults to the catalog version.
    pub version: Option<String>,
    pub group_id: Option<String>,
}

impl InstallRequest {
    pub fn new(server_id: impl Into<String>, app_name: impl Into<String>) -> Self {
        Self {
            server_id: server_id.into(),
            app_name: app_name.into(),
            config: ConfigMap::new(),
            version: None,
            group_id: None,
        }
    }

    pub fn with_config(mut self, config: ConfigMap) -> Self {
        self.config = config;
        self
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    pub fn with_group(mut self, group_id: impl Into<String>) -> Self {
        self.group_id = Some(group_id.into());
        self
    }
}

pub struct Deployer {
    store: StateStore,
    resolver: DependencyResolver,
    registry: ServiceRegistry,
    routes: RouteTable,
    proxy: Arc<ProxyController>,
    channel: CommandChannel,
    locks: Arc<MutexManager>,
    renderer: Arc<dyn ConfigRenderer>,
    audit: Arc<dyn AuditLog>,
    ha: Option<Arc<dyn ProxyHaCoordinator>>,
}

impl Deployer {
    /// Build a deployer over the resolver's store and the proxy's route table.
    pub fn new(
        resolver: DependencyResolver,
        channel: CommandChannel,
        proxy: Arc<ProxyController>,
    ) -> Self {
        let registry = resolver.registry().clone();
        Self {
            store: registry.store().clone(),
            routes: proxy.generator().routes().clone(),
            locks: channel.locks().clone(),
            registry,
            resolver,
            proxy,
            channel,
            renderer: Arc::new(EnvFileRenderer::new()),
            audit: Arc::new(TracingAuditLog),
            ha: None,
        }
    }

    pub fn with_renderer(mut self, renderer: Arc<dyn ConfigRenderer>) -> Self {
        self.renderer = renderer;
        self
    }

    pub fn with_audit(mut self, audit: Arc<dyn AuditLog>) -> Self {
        self.audit = audit;
        self
    }

    pub fn with_ha_coordinator(mut self, ha: Arc<dyn ProxyHaCoordinator>) -> Self {
        self.ha = Some(ha);
        self
    }

    fn catalog(&self) -> &AppCatalog {
        self.resolver.catalog()
    }

    fn load(&self, deployment_id: &str) -> DeployResult<Deployment> {
        self.store
            .get_deployment(deployment_id)?
            .ok_or_else(|| DeployError::UnknownDeployment(deployment_id.to_string()))
    }

    fn manifest_for(&self, deployment: &Deployment) -> DeployResult<AppManifest> {
        self.catalog()
            .get(&deployment.app_name)
            .cloned()
            .ok_or_else(|| DeployError::UnknownApp(deployment.app_name.clone()))
    }

    fn require_agent(&self, server_id: &str) -> DeployResult<()> {
        if self.channel.is_connected(server_id) {
            Ok(())
        } else {
            Err(DeployError::AgentUnavailable(server_id.to_string()))
        }
    }

    fn require_settled(deployment: &Deployment) -> DeployResult<()> {
        if deployment.status.is_transient() {
            return Err(DeployError::InvalidState {
                deployment_id: deployment.id.clone(),
                status: deployment.status,
            });
        }
        Ok(())
    }

    async fn set_status(&self, deployment_id: &str, status: DeploymentStatus, message: Option<String>) {
        let _guard = self.locks.lock_deployment(deployment_id).await;
        if let Err(e) = self.store.update_deployment_status(deployment_id, status, message) {
            warn!(%deployment_id, %status, error = %e, "failed to update deployment status");
        }
    }

    // ── Install ────────────────────────────────────────────────────

    pub async fn install(&self, request: InstallRequest) -> DeployResult<Deployment> {
        let server_id = request.server_id.as_str();
        let app_name = request.app_name.as_str();
        self.require_agent(server_id)?;

        let manifest = self
            .catalog()
            .get(app_name)
            .cloned()
            .ok_or_else(|| DeployError::UnknownApp(app_name.to_string()))?;
        let version = match &request.version {
            Some(v) => {
                semver::Version::parse(v).map_err(|e| DeployError::InvalidVersion {
                    app: app_name.to_string(),
                    version: v.clone(),
                    reason: e.to_string(),
                })?;
                v.clone()
            }
            None => manifest.app.version.clone(),
        };

        let (server, deployment, secrets) = {
            let _guard = self.locks.lock_server(server_id).await;
            let server = self
                .store
                .get_server(server_id)?
                .ok_or_else(|| DeployError::UnknownServer(server_id.to_string()))?;
            self.check_preconditions(&manifest, server_id)?;

            let report = self.resolver.validate(&manifest, server_id)?;
            for warning in &report.warnings {
                warn!(app = %app_name, %server_id, %warning, "dependency warning");
            }
            if !report.valid {
                return Err(DeployError::Dependencies {
                    app: app_name.to_string(),
                    errors: report.errors,
                });
            }

            let mut config = self.resolver.resolve(&manifest, server_id, &request.config)?;
            secrets::fill_generated(&manifest, &mut config)?;
            if let Some(field) = secrets::missing_required(&manifest, &config) {
                return Err(DeployError::MissingConfig {
                    app: app_name.to_string(),
                    field: field.to_string(),
                });
            }
            let (config, secrets) = secrets::split_secrets(&manifest, config);

            let now = epoch_secs();
            let deployment = Deployment {
                id: Uuid::new_v4().to_string(),
                server_id: server_id.to_string(),
                app_name: app_name.to_string(),
                version,
                config,
                group_id: request.group_id.clone(),
                status: DeploymentStatus::Installing,
                status_message: None,
                created_at: now,
                updated_at: now,
            };
            let singleton = manifest.app.singleton;
            self.store.transaction_async(|txn| -> DeployResult<()> {
                // Writers are serialized, so this sees every committed install.
                if singleton
                    && let Some(existing) = txn
                        .list_deployments()?
                        .into_iter()
                        .find(|d| d.app_name == deployment.app_name)
                {
                    return Err(DeployError::SingletonExists {
                        app: deployment.app_name.clone(),
                        server_id: existing.server_id,
                    });
                }
                txn.put_deployment(&deployment)?;
                txn.put_secrets(&deployment.id, &secrets)?;
                Ok(())
            })
            .await?;
            (server, deployment, secrets)
        };
        info!(
            deployment_id = %deployment.id,
            app = %app_name,
            %server_id,
            version = %deployment.version,
            "install started"
        );

        let mut saga = CompensationStack::new(format!("install {app_name} on {server_id}"));
        saga.advance(InstallPhase::Provisioned);
        {
            let store = self.store.clone();
            let id = deployment.id.clone();
            saga.push("delete deployment record", move || async move {
                store
                    .transaction_async(|txn| -> DeployResult<bool> { Ok(txn.purge_deployment(&id)?) })
                    .await?;
                Ok(())
            });
        }

        match self
            .install_steps(&manifest, &server, &deployment, &secrets, &mut saga)
            .await
        {
            Ok(installed) => {
                saga.commit();
                self.audit.log(
                    "install",
                    "deployment",
                    &installed.id,
                    json!({"app": app_name, "serverId": server_id, "version": installed.version}),
                );
                info!(deployment_id = %installed.id, app = %app_name, %server_id, "install complete");
                if manifest.app.proxy
                    && let Some(ha) = &self.ha
                    && let Err(e) = ha.register_proxy(&installed).await
                {
                    warn!(deployment_id = %installed.id, error = %e, "proxy HA registration failed");
                }
                Ok(installed)
            }
            Err(e) => {
                warn!(
                    deployment_id = %deployment.id,
                    phase = %saga.phase(),
                    error = %e,
                    "install failed, rolling back"
                );
                let report = saga.unwind().await;
                if !report.failed.is_empty() {
                    warn!(
                        deployment_id = %deployment.id,
                        failed = ?report.failed,
                        "rollback left work undone"
                    );
                }
                self.audit.log(
                    "install_failed",
                    "deployment",
                    &deployment.id,
                    json!({"app": app_name, "serverId": server_id, "error": e.to_string()}),
                );
                Err(e.during("install", &deployment.id))
            }
        }
    }

    fn check_preconditions(&self, manifest: &AppManifest, server_id: &str) -> DeployResult<()> {
        let app = manifest.name();
        if self.store.find_deployment(server_id, app)?.is_some() {
            return Err(DeployError::AlreadyDeployed {
                app: app.to_string(),
                server_id: server_id.to_string(),
            });
        }
        if manifest.app.singleton
            && let Some(existing) = self.store.list_deployments_for_app(app)?.into_iter().next()
        {
            return Err(DeployError::SingletonExists {
                app: app.to_string(),
                server_id: existing.server_id,
            });
        }
        for other in self.store.list_deployments_for_server(server_id)? {
            let declared = manifest.app.conflicts.contains(&other.app_name);
            let reverse = self
                .catalog()
                .get(&other.app_name)
                .is_some_and(|m| m.app.conflicts.iter().any(|c| c == app));
            if declared || reverse {
                return Err(DeployError::Conflict {
                    app: app.to_string(),
                    other: other.app_name,
                    server_id: server_id.to_string(),
                });
            }
        }

        let mut ports: Vec<u16> = manifest.provides.iter().map(|p| p.port).collect();
        if let Some(web) = &manifest.web_ui {
            ports.push(web.port);
        }
        ports.sort_unstable();
        ports.dedup();
        if let Some(taken) = self
            .registry
            .check_port_conflicts(server_id, &ports)?
            .into_iter()
            .next()
        {
            return Err(DeployError::PortConflict {
                app: app.to_string(),
                server_id: server_id.to_string(),
                port: taken.port,
                owner: taken.deployment_id,
            });
        }
        Ok(())
    }

    async fn install_steps(
        &self,
        manifest: &AppManifest,
        server: &ServerRecord,
        deployment: &Deployment,
        secrets: &SecretMap,
        saga: &mut CompensationStack,
    ) -> DeployResult<Deployment> {
        let id = deployment.id.as_str();

        let artifacts = self
            .renderer
            .render(deployment, manifest, &deployment.config, secrets)?;
        {
            let renderer = self.renderer.clone();
            let id = id.to_string();
            saga.push("discard rendered artifacts", move || async move { renderer.discard(&id) });
        }

        self.channel
            .send_command_and_wait(
                &server.id,
                CommandAction::Install,
                &deployment.app_name,
                Some(id),
                artifacts.payload(deployment),
            )
            .await?;
        saga.advance(InstallPhase::AgentAcked);
        {
            let channel = self.channel.clone();
            let server_id = server.id.clone();
            let app = deployment.app_name.clone();
            let id = id.to_string();
            saga.push("uninstall from agent", move || async move {
                channel
                    .send_command(
                        &server_id,
                        CommandAction::Uninstall,
                        &app,
                        Some(&id),
                        json!({"deploymentId": id}),
                    )
                    .await?;
                Ok(())
            });
        }
        {
            // Runs after the route compensations below.
            let proxy = self.proxy.clone();
            let id = id.to_string();
            saga.push("reload proxy", move || async move {
                if proxy.push_config().await {
                    Ok(())
                } else {
                    Err(DeployError::RouterPush(id))
                }
            });
        }

        let upstream = Upstream {
            host: if server.id == self.registry.local_server_id() {
                LOOPBACK.to_string()
            } else {
                server.host.clone()
            },
        };

        if !manifest.provides.is_empty() {
            for provision in &manifest.provides {
                self.registry.register_service(id, &server.id, provision)?;
            }
            self.routes
                .register_service_routes(id, &upstream, &manifest.provides)?;
            let registry = self.registry.clone();
            let routes = self.routes.clone();
            let id = id.to_string();
            saga.push("unregister services and routes", move || async move {
                registry.unregister_services(&id)?;
                routes.unregister_service_routes(&id)?;
                Ok(())
            });
        }

        if let Some(web_ui) = &manifest.web_ui {
            self.routes.register_web_route(id, &upstream, web_ui)?;
            let routes = self.routes.clone();
            let id = id.to_string();
            saga.push("unregister web route", move || async move {
                routes.unregister_web_route(&id)?;
                Ok(())
            });
        }
        saga.advance(InstallPhase::RoutesRegistered);

        self.routes.set_active(id, true)?;
        if !self.proxy.push_config().await {
            return Err(DeployError::RouterPush(id.to_string()));
        }
        saga.advance(InstallPhase::Live);

        self.load(id)
    }

    // ── Configure ──────────────────────────────────────────────────

    /// Merge `new_config` over the deployment's config and push it to the
    /// agent. The command's outcome arrives through the result path.
    pub async fn configure(
        &self,
        deployment_id: &str,
        new_config: ConfigMap,
    ) -> DeployResult<Deployment> {
        let _guard = self.locks.lock_deployment(deployment_id).await;
        let current = self.load(deployment_id)?;
        Self::require_settled(&current)?;
        self.require_agent(&current.server_id)?;
        let manifest = self.manifest_for(&current)?;

        let existing_secrets = self.store.get_secrets(deployment_id)?;
        let mut merged = secrets::merge_secrets(&current.config, &existing_secrets);
        merged.extend(new_config);
        if let Some(field) = secrets::missing_required(&manifest, &merged) {
            return Err(DeployError::MissingConfig {
                app: current.app_name.clone(),
                field: field.to_string(),
            });
        }
        let (config, secrets) = secrets::split_secrets(&manifest, merged);

        let updated = Deployment {
            config,
            status: DeploymentStatus::Configuring,
            status_message: None,
            updated_at: epoch_secs(),
            ..current
        };
        let artifacts = self
            .renderer
            .render(&updated, &manifest, &updated.config, &secrets)?;
        self.store
            .transaction_async(|txn| -> DeployResult<()> {
                txn.put_deployment(&updated)?;
                txn.put_secrets(deployment_id, &secrets)?;
                Ok(())
            })
            .await?;

        if let Err(e) = self
            .channel
            .send_command(
                &updated.server_id,
                CommandAction::Configure,
                &updated.app_name,
                Some(deployment_id),
                artifacts.payload(&updated),
            )
            .await
        {
            self.store.update_deployment_status(
                deployment_id,
                DeploymentStatus::Error,
                Some(e.to_string()),
            )?;
            return Err(DeployError::from(e).during("configure", deployment_id));
        }

        debug!(
            %deployment_id,
            fields = updated.config.len() + secrets.len(),
            "configure dispatched"
        );
        self.audit.log(
            "configure",
            "deployment",
            deployment_id,
            json!({"app": updated.app_name, "serverId": updated.server_id}),
        );
        Ok(updated)
    }

    // ── Start / stop / restart ─────────────────────────────────────

    pub async fn start(&self, deployment_id: &str) -> DeployResult<Deployment> {
        let _guard = self.locks.lock_deployment(deployment_id).await;
        let deployment = self.load(deployment_id)?;
        Self::require_settled(&deployment)?;
        self.require_agent(&deployment.server_id)?;

        let services = self.store.list_services_for_deployment(deployment_id)?;
        let snapshot = self.routes.set_active(deployment_id, true)?;
        self.registry.set_availability(deployment_id, true)?;

        let outcome = if self.proxy.push_config().await {
            self.channel
                .send_command(
                    &deployment.server_id,
                    CommandAction::Start,
                    &deployment.app_name,
                    Some(deployment_id),
                    json!({}),
                )
                .await
                .map(|_| ())
                .map_err(DeployError::from)
        } else {
            Err(DeployError::RouterPush(deployment_id.to_string()))
        };

        if let Err(e) = outcome {
            warn!(%deployment_id, error = %e, "start failed, reverting routes");
            if let Err(revert) = self.routes.restore(&snapshot) {
                warn!(%deployment_id, error = %revert, "failed to restore route flags");
            }
            for service in &services {
                if let Err(revert) = self.store.put_service(service) {
                    warn!(%deployment_id, error = %revert, "failed to restore service status");
                }
            }
            return Err(e.during("start", deployment_id));
        }

        info!(%deployment_id, app = %deployment.app_name, "start dispatched");
        self.audit.log("start", "deployment", deployment_id, json!({"app": deployment.app_name}));
        Ok(deployment)
    }

    pub async fn stop(&self, deployment_id: &str) -> DeployResult<Deployment> {
        let _guard = self.locks.lock_deployment(deployment_id).await;
        let deployment = self.load(deployment_id)?;
        Self::require_settled(&deployment)?;
        self.require_agent(&deployment.server_id)?;

        self.routes.set_active(deployment_id, false)?;
        self.registry.set_availability(deployment_id, false)?;
        if !self.proxy.push_config().await {
            warn!(%deployment_id, "proxy push failed during stop, stopping anyway");
        }

        self.channel
            .send_command(
                &deployment.server_id,
                CommandAction::Stop,
                &deployment.app_name,
                Some(deployment_id),
                json!({}),
            )
            .await
            .map_err(|e| DeployError::from(e).during("stop", deployment_id))?;

        info!(%deployment_id, app = %deployment.app_name, "stop dispatched");
        self.audit.log("stop", "deployment", deployment_id, json!({"app": deployment.app_name}));
        Ok(deployment)
    }

    pub async fn restart(&self, deployment_id: &str) -> DeployResult<Deployment> {
        let deployment = self.load(deployment_id)?;
        Self::require_settled(&deployment)?;
        self.require_agent(&deployment.server_id)?;
        self.channel
            .send_command(
                &deployment.server_id,
                CommandAction::Restart,
                &deployment.app_name,
                Some(deployment_id),
                json!({}),
            )
            .await
            .map_err(|e| DeployError::from(e).during("restart", deployment_id))?;
        self.audit.log("restart", "deployment", deployment_id, json!({"app": deployment.app_name}));
        Ok(deployment)
    }

    // ── Uninstall ──────────────────────────────────────────────────

    pub async fn uninstall(&self, deployment_id: &str) -> DeployResult<()> {
        let deployment = {
            let _guard = self.locks.lock_deployment(deployment_id).await;
            let deployment = self.load(deployment_id)?;
            Self::require_settled(&deployment)?;

            let mandatory = self
                .catalog()
                .get(&deployment.app_name)
                .is_some_and(|m| m.app.mandatory);
            if mandatory {
                let on_core = self
                    .store
                    .get_server(&deployment.server_id)?
                    .is_some_and(|s| s.is_core);
                if on_core {
                    return Err(DeployError::Mandatory {
                        app: deployment.app_name,
                    });
                }
            }
            self.require_agent(&deployment.server_id)?;

            self.store
                .update_deployment_status(deployment_id, DeploymentStatus::Uninstalling, None)?
                .ok_or_else(|| DeployError::UnknownDeployment(deployment_id.to_string()))?
        };

        if let Err(e) = self
            .channel
            .send_command_and_wait(
                &deployment.server_id,
                CommandAction::Uninstall,
                &deployment.app_name,
                Some(deployment_id),
                json!({"deploymentId": deployment_id}),
            )
            .await
        {
            self.set_status(deployment_id, DeploymentStatus::Error, Some(e.to_string()))
                .await;
            return Err(DeployError::from(e).during("uninstall", deployment_id));
        }

        if let Err(e) = self.routes.unregister(deployment_id) {
            warn!(%deployment_id, error = %e, "failed to unregister routes");
        }
        {
            let _guard = self.locks.lock_deployment(deployment_id).await;
            self.store
                .transaction_async(|txn| -> DeployResult<bool> { Ok(txn.purge_deployment(deployment_id)?) })
                .await
                .map_err(|e| e.during("uninstall", deployment_id))?;
        }
        if let Err(e) = self.renderer.discard(deployment_id) {
            warn!(%deployment_id, error = %e, "failed to discard rendered artifacts");
        }
        self.locks.cleanup_deployment_mutex(deployment_id);

        if !self.proxy.push_config().await {
            warn!(%deployment_id, "proxy reload failed after uninstall");
        }
        info!(%deployment_id, app = %deployment.app_name, "uninstall complete");
        self.audit.log(
            "uninstall",
            "deployment",
            deployment_id,
            json!({"app": deployment.app_name, "serverId": deployment.server_id}),
        );
        Ok(())
    }
}
