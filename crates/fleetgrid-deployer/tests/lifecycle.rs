//! Deployer lifecycle tests against an in-process agent and a recording
//! router sink.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use fleet_core::{AppCatalog, AppManifest, ConfigMap, MutexManager};
use fleetgrid_channel::{AgentMessage, ChannelConfig, CommandChannel, ControlMessage, ResultStatus};
use fleetgrid_deployer::{DeployError, Deployer, ErrorKind, InstallRequest};
use fleetgrid_proxy::{ConfigGenerator, ConfigSink, ProxyController, PushError, RouteTable, RouterConfig};
use fleetgrid_registry::{DependencyResolver, ServiceRegistry};
use fleetgrid_state::{
    CommandAction, DeploymentStatus, ServerRecord, ServiceStatus, StateStore,
};

const POSTGRES: &str = r#"
[app]
name = "postgres"
version = "16.1.0"

[[provides]]
name = "db"
port = 5432
protocol = "tcp"
external_port = 15432

[[config]]
name = "password"
generated = "password"
"#;

const GITEA: &str = r#"
[app]
name = "gitea"
version = "1.21.0"
conflicts = ["forgejo"]

[[provides]]
name = "git-web"
port = 3000

[[requires]]
service = "db"
inject = { db_host = { from = "host" }, db_port = { from = "port" }, db_password = { from = "config", field = "password" } }

[[config]]
name = "db_password"
secret = true

[[config]]
name = "title"
default = "Gitea"

[web_ui]
path = "/gitea"
port = 3000
"#;

const FORGEJO: &str = r#"
[app]
name = "forgejo"
version = "7.0.0"
"#;

const POOLER: &str = r#"
[app]
name = "pooler"
version = "1.22.0"

[[provides]]
name = "pool"
port = 5432
protocol = "tcp"
"#;

const ROUTER: &str = r#"
[app]
name = "router"
version = "2.11.0"
singleton = true
mandatory = true
proxy = true
"#;

#[derive(Default)]
struct RecordingSink {
    pushes: Mutex<Vec<RouterConfig>>,
    reject: AtomicBool,
}

impl RecordingSink {
    fn last(&self) -> Option<RouterConfig> {
        self.pushes.lock().unwrap().last().cloned()
    }
}

#[async_trait]
impl ConfigSink for RecordingSink {
    async fn push(&self, config: &RouterConfig) -> Result<(), PushError> {
        if self.reject.load(Ordering::SeqCst) {
            return Err(PushError::Status {
                status: 400,
                body: "invalid config".into(),
            });
        }
        self.pushes.lock().unwrap().push(config.clone());
        Ok(())
    }
}

struct Harness {
    store: StateStore,
    channel: CommandChannel,
    sink: Arc<RecordingSink>,
    deployer: Deployer,
}

fn server(id: &str, host: &str, is_core: bool) -> ServerRecord {
    ServerRecord {
        id: id.into(),
        name: id.into(),
        host: host.into(),
        is_core,
        token_hash: None,
        online: false,
        last_seen: 0,
        metrics: None,
        created_at: 0,
    }
}

fn harness() -> Harness {
    let store = StateStore::open_in_memory().unwrap();
    store.put_server(&server("core", "10.0.0.1", true)).unwrap();
    store.put_server(&server("srv-1", "10.0.0.2", false)).unwrap();
    store.put_server(&server("srv-2", "10.0.0.3", false)).unwrap();

    let mut catalog = AppCatalog::new();
    for text in [POSTGRES, GITEA, FORGEJO, POOLER, ROUTER] {
        catalog.insert(AppManifest::parse(text).unwrap());
    }

    let registry = ServiceRegistry::new(store.clone(), "core");
    let resolver = DependencyResolver::new(registry, Arc::new(catalog));
    let channel = CommandChannel::new(
        store.clone(),
        Arc::new(MutexManager::new()),
        ChannelConfig::default(),
    );
    let sink = Arc::new(RecordingSink::default());
    let generator = ConfigGenerator::new(RouteTable::new(store.clone()), "127.0.0.1:8080");
    let proxy = Arc::new(ProxyController::new(generator, sink.clone()));
    let deployer = Deployer::new(resolver, channel.clone(), proxy);

    Harness {
        store,
        channel,
        sink,
        deployer,
    }
}

/// Connect an agent for `server_id` that acks every command and fails the
/// actions in `fail`. Returns the actions it received, in order.
async fn spawn_agent(
    channel: &CommandChannel,
    server_id: &str,
    fail: Vec<CommandAction>,
) -> Arc<Mutex<Vec<CommandAction>>> {
    let mut session = channel.connect(server_id).await.unwrap();
    let conn_id = session.conn_id;
    let received = Arc::new(Mutex::new(Vec::new()));
    let log = received.clone();
    let channel = channel.clone();
    let server_id = server_id.to_string();
    tokio::spawn(async move {
        while let Some(msg) = session.outbound.recv().await {
            let ControlMessage::Command { id, action, .. } = msg else {
                continue;
            };
            log.lock().unwrap().push(action);
            channel
                .handle_message(
                    &server_id,
                    conn_id,
                    AgentMessage::CommandAck {
                        command_id: id.clone(),
                        received_at: None,
                    },
                )
                .await;
            let failed = fail.contains(&action);
            channel
                .handle_message(
                    &server_id,
                    conn_id,
                    AgentMessage::CommandResult {
                        command_id: id,
                        status: if failed {
                            ResultStatus::Failure
                        } else {
                            ResultStatus::Success
                        },
                        message: failed.then(|| format!("{action} failed")),
                    },
                )
                .await;
        }
    });
    received
}

async fn wait_for_status(store: &StateStore, deployment_id: &str, status: DeploymentStatus) {
    for _ in 0..200 {
        let current = store.get_deployment(deployment_id).unwrap().map(|d| d.status);
        if current == Some(status) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("deployment {deployment_id} never reached {status}");
}

#[tokio::test]
async fn install_goes_live_with_services_and_routes() {
    let h = harness();
    let received = spawn_agent(&h.channel, "srv-1", vec![]).await;

    let deployment = h
        .deployer
        .install(InstallRequest::new("srv-1", "postgres"))
        .await
        .unwrap();
    assert_eq!(deployment.status, DeploymentStatus::Running);
    assert_eq!(deployment.version, "16.1.0");

    let secrets = h.store.get_secrets(&deployment.id).unwrap();
    assert_eq!(secrets["password"].len(), 32);
    assert!(!deployment.config.contains_key("password"));

    let service = h.store.get_service(&deployment.id, "db").unwrap().unwrap();
    assert_eq!(service.host, "10.0.0.2");
    assert_eq!(service.status, ServiceStatus::Available);

    let config = h.sink.last().unwrap();
    assert_eq!(config.tcp.len(), 1);
    assert_eq!(config.tcp[0].listen_port, 15432);
    assert_eq!(config.tcp[0].upstream, "10.0.0.2:5432");
    assert_eq!(*received.lock().unwrap(), vec![CommandAction::Install]);
}

#[tokio::test]
async fn dependent_install_receives_injected_values() {
    let h = harness();
    spawn_agent(&h.channel, "srv-1", vec![]).await;

    let db = h
        .deployer
        .install(InstallRequest::new("srv-1", "postgres"))
        .await
        .unwrap();
    let mut user = ConfigMap::new();
    user.insert("title".into(), Value::from("Team Git"));
    let gitea = h
        .deployer
        .install(InstallRequest::new("srv-1", "gitea").with_config(user))
        .await
        .unwrap();

    assert_eq!(gitea.config["db_host"], "127.0.0.1");
    assert_eq!(gitea.config["db_port"], 5432);
    assert_eq!(gitea.config["title"], "Team Git");
    let db_secrets = h.store.get_secrets(&db.id).unwrap();
    let gitea_secrets = h.store.get_secrets(&gitea.id).unwrap();
    assert_eq!(gitea_secrets["db_password"], db_secrets["password"]);

    let config = h.sink.last().unwrap();
    let paths: Vec<&str> = config.http.iter().map(|r| r.path.as_str()).collect();
    assert!(paths.contains(&"/gitea"));
    assert!(paths.contains(&"/git-web"));
}

#[tokio::test]
async fn missing_dependency_is_rejected_without_mutation() {
    let h = harness();
    let received = spawn_agent(&h.channel, "srv-1", vec![]).await;

    let err = h
        .deployer
        .install(InstallRequest::new("srv-1", "gitea"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
    let DeployError::Dependencies { errors, .. } = err else {
        panic!("expected dependency error, got {err}");
    };
    assert_eq!(errors, vec!["Required service 'db' not found on any server".to_string()]);

    assert!(h.store.list_deployments().unwrap().is_empty());
    assert!(received.lock().unwrap().is_empty());
}

#[tokio::test]
async fn offline_agent_is_rejected() {
    let h = harness();
    let err = h
        .deployer
        .install(InstallRequest::new("srv-2", "postgres"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::AgentUnavailable);
    assert!(h.store.list_deployments().unwrap().is_empty());
}

#[tokio::test]
async fn agent_failure_rolls_back_row_and_secrets() {
    let h = harness();
    let received = spawn_agent(&h.channel, "srv-1", vec![CommandAction::Install]).await;

    let err = h
        .deployer
        .install(InstallRequest::new("srv-1", "postgres"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::AgentUnavailable);
    assert!(err.to_string().contains("install of deployment"));

    assert!(h.store.list_deployments().unwrap().is_empty());
    assert!(h.store.list_services().unwrap().is_empty());
    // The agent never installed, so there is nothing to uninstall there.
    assert_eq!(*received.lock().unwrap(), vec![CommandAction::Install]);
}

#[tokio::test]
async fn agent_disconnect_mid_install_rolls_back() {
    let h = harness();
    let mut session = h.channel.connect("srv-1").await.unwrap();
    let conn_id = session.conn_id;
    let channel = h.channel.clone();
    tokio::spawn(async move {
        while let Some(msg) = session.outbound.recv().await {
            let ControlMessage::Command { id, .. } = msg else {
                continue;
            };
            channel
                .handle_message(
                    "srv-1",
                    conn_id,
                    AgentMessage::CommandAck {
                        command_id: id,
                        received_at: None,
                    },
                )
                .await;
            channel.disconnect("srv-1", conn_id).await;
            break;
        }
    });

    let err = h
        .deployer
        .install(InstallRequest::new("srv-1", "postgres"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::AgentUnavailable);
    let DeployError::Failed { deployment_id, .. } = &err else {
        panic!("expected a wrapped failure, got {err:?}");
    };

    assert!(h.store.get_deployment(deployment_id).unwrap().is_none());
    assert!(h.store.get_secrets(deployment_id).unwrap().is_empty());
    assert!(h.store.list_deployments().unwrap().is_empty());
    assert!(h.store.list_services().unwrap().is_empty());
    assert!(h.store.list_service_routes().unwrap().is_empty());
    assert!(!h.channel.is_connected("srv-1"));
}

#[tokio::test]
async fn second_app_on_a_claimed_port_is_rejected() {
    let h = harness();
    let received = spawn_agent(&h.channel, "srv-1", vec![]).await;
    spawn_agent(&h.channel, "srv-2", vec![]).await;

    h.deployer
        .install(InstallRequest::new("srv-1", "postgres"))
        .await
        .unwrap();
    let pushes = h.sink.pushes.lock().unwrap().len();

    let err = h
        .deployer
        .install(InstallRequest::new("srv-1", "pooler"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
    assert!(matches!(err, DeployError::PortConflict { port: 5432, ref server_id, .. } if server_id == "srv-1"));

    assert!(h.store.find_deployment("srv-1", "pooler").unwrap().is_none());
    assert_eq!(h.store.list_deployments().unwrap().len(), 1);
    let services = h.store.list_services().unwrap();
    assert_eq!(services.len(), 1);
    assert_eq!(services[0].service_name, "db");
    assert_eq!(h.store.list_service_routes().unwrap().len(), 1);
    assert_eq!(h.sink.pushes.lock().unwrap().len(), pushes);
    assert_eq!(*received.lock().unwrap(), vec![CommandAction::Install]);

    // The same port on another server is free.
    h.deployer
        .install(InstallRequest::new("srv-2", "pooler"))
        .await
        .unwrap();
}

#[tokio::test]
async fn router_rejection_unwinds_everything() {
    let h = harness();
    let received = spawn_agent(&h.channel, "srv-1", vec![]).await;
    h.sink.reject.store(true, Ordering::SeqCst);

    let err = h
        .deployer
        .install(InstallRequest::new("srv-1", "postgres"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::RouterPush);

    let deployments = h.store.list_deployments().unwrap();
    assert!(deployments.is_empty());
    assert!(h.store.list_services().unwrap().is_empty());
    assert!(h.store.list_service_routes().unwrap().is_empty());

    // The agent-side install is undone too.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(
        *received.lock().unwrap(),
        vec![CommandAction::Install, CommandAction::Uninstall]
    );
}

#[tokio::test]
async fn singleton_and_conflicts_are_enforced() {
    let h = harness();
    spawn_agent(&h.channel, "srv-1", vec![]).await;
    spawn_agent(&h.channel, "core", vec![]).await;

    h.deployer
        .install(InstallRequest::new("srv-1", "router"))
        .await
        .unwrap();
    let err = h
        .deployer
        .install(InstallRequest::new("core", "router"))
        .await
        .unwrap_err();
    assert!(matches!(err, DeployError::SingletonExists { ref server_id, .. } if server_id == "srv-1"));

    let err = h
        .deployer
        .install(InstallRequest::new("srv-1", "router"))
        .await
        .unwrap_err();
    assert!(matches!(err, DeployError::AlreadyDeployed { .. }));

    h.deployer
        .install(InstallRequest::new("core", "forgejo"))
        .await
        .unwrap();
    h.deployer
        .install(InstallRequest::new("core", "postgres"))
        .await
        .unwrap();
    let err = h
        .deployer
        .install(InstallRequest::new("core", "gitea"))
        .await
        .unwrap_err();
    assert!(matches!(err, DeployError::Conflict { ref other, .. } if other == "forgejo"));
    assert_eq!(h.store.list_deployments().unwrap().len(), 3);
}

#[tokio::test]
async fn invalid_version_is_rejected() {
    let h = harness();
    spawn_agent(&h.channel, "srv-1", vec![]).await;
    let err = h
        .deployer
        .install(InstallRequest::new("srv-1", "postgres").with_version("latest"))
        .await
        .unwrap_err();
    assert!(matches!(err, DeployError::InvalidVersion { .. }));
}

#[tokio::test]
async fn stop_and_start_flip_routes_and_availability() {
    let h = harness();
    spawn_agent(&h.channel, "srv-1", vec![]).await;
    let db = h
        .deployer
        .install(InstallRequest::new("srv-1", "postgres"))
        .await
        .unwrap();

    h.deployer.stop(&db.id).await.unwrap();
    wait_for_status(&h.store, &db.id, DeploymentStatus::Stopped).await;
    assert!(h.sink.last().unwrap().tcp.is_empty());
    assert_eq!(
        h.store.get_service(&db.id, "db").unwrap().unwrap().status,
        ServiceStatus::Unavailable
    );

    h.deployer.start(&db.id).await.unwrap();
    wait_for_status(&h.store, &db.id, DeploymentStatus::Running).await;
    assert_eq!(h.sink.last().unwrap().tcp.len(), 1);
    assert_eq!(
        h.store.get_service(&db.id, "db").unwrap().unwrap().status,
        ServiceStatus::Available
    );
}

#[tokio::test]
async fn start_reverts_flags_when_router_rejects() {
    let h = harness();
    let received = spawn_agent(&h.channel, "srv-1", vec![]).await;
    let db = h
        .deployer
        .install(InstallRequest::new("srv-1", "postgres"))
        .await
        .unwrap();
    h.deployer.stop(&db.id).await.unwrap();
    wait_for_status(&h.store, &db.id, DeploymentStatus::Stopped).await;

    h.sink.reject.store(true, Ordering::SeqCst);
    let err = h.deployer.start(&db.id).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::RouterPush);

    let routes = h.store.list_service_routes_for_deployment(&db.id).unwrap();
    assert!(routes.iter().all(|r| !r.active));
    assert_eq!(
        h.store.get_service(&db.id, "db").unwrap().unwrap().status,
        ServiceStatus::Unavailable
    );
    assert!(!received.lock().unwrap().contains(&CommandAction::Start));
}

#[tokio::test]
async fn configure_merges_and_keeps_secrets() {
    let h = harness();
    spawn_agent(&h.channel, "srv-1", vec![]).await;
    h.deployer
        .install(InstallRequest::new("srv-1", "postgres"))
        .await
        .unwrap();
    let gitea = h
        .deployer
        .install(InstallRequest::new("srv-1", "gitea"))
        .await
        .unwrap();
    let password = h.store.get_secrets(&gitea.id).unwrap()["db_password"].clone();

    let mut change = ConfigMap::new();
    change.insert("title".into(), Value::from("Renamed"));
    let updated = h.deployer.configure(&gitea.id, change).await.unwrap();
    assert_eq!(updated.status, DeploymentStatus::Configuring);
    assert_eq!(updated.config["title"], "Renamed");
    assert_eq!(updated.config["db_host"], "127.0.0.1");

    wait_for_status(&h.store, &gitea.id, DeploymentStatus::Running).await;
    assert_eq!(h.store.get_secrets(&gitea.id).unwrap()["db_password"], password);
}

#[tokio::test]
async fn uninstall_purges_state_and_honours_mandatory_guard() {
    let h = harness();
    spawn_agent(&h.channel, "srv-1", vec![]).await;
    spawn_agent(&h.channel, "core", vec![]).await;

    let router = h
        .deployer
        .install(InstallRequest::new("core", "router"))
        .await
        .unwrap();
    let err = h.deployer.uninstall(&router.id).await.unwrap_err();
    assert!(matches!(err, DeployError::Mandatory { .. }));
    assert!(h.store.get_deployment(&router.id).unwrap().is_some());

    let db = h
        .deployer
        .install(InstallRequest::new("srv-1", "postgres"))
        .await
        .unwrap();
    h.deployer.uninstall(&db.id).await.unwrap();
    assert!(h.store.get_deployment(&db.id).unwrap().is_none());
    assert!(h.store.get_secrets(&db.id).unwrap().is_empty());
    assert!(h.store.list_services_for_deployment(&db.id).unwrap().is_empty());
    assert!(h.sink.last().unwrap().tcp.is_empty());
}

#[tokio::test]
async fn failed_uninstall_marks_error() {
    let h = harness();
    spawn_agent(&h.channel, "srv-1", vec![CommandAction::Uninstall]).await;
    let db = h
        .deployer
        .install(InstallRequest::new("srv-1", "postgres"))
        .await
        .unwrap();

    let err = h.deployer.uninstall(&db.id).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::AgentUnavailable);
    let row = h.store.get_deployment(&db.id).unwrap().unwrap();
    assert_eq!(row.status, DeploymentStatus::Error);
}
