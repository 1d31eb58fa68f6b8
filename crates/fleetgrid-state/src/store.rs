//! StateStore: redb-backed state persistence for Fleetgrid.
//!
//! Provides typed CRUD operations over servers, deployments, secrets,
//! services, routes, and the command log. All values are JSON-serialized
//! into redb's `&[u8]` value columns. The store supports both on-disk and
//! in-memory backends (the latter for testing).
//!
//! Multi-record writes go through [`StateStore::transaction`], which runs a
//! closure against a single write transaction and commits only if the
//! closure returns `Ok`. [`StateStore::transaction_async`] is the same for
//! async callers.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use redb::{Database, ReadableDatabase, ReadableTable, WriteTransaction};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::runtime::{Handle, RuntimeFlavor};
use tracing::{debug, warn};

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

const DEFAULT_WRITE_ATTEMPTS: u32 = 5;
const BUSY_BACKOFF: Duration = Duration::from_millis(10);

fn encode<T: Serialize>(value: &T) -> StateResult<Vec<u8>> {
    serde_json::to_vec(value).map_err(map_err!(Serialize))
}

enum WriteAttempt<T> {
    Committed(T),
    Busy(String),
}

async fn retry_busy<T, E, F>(attempts: u32, mut write: F) -> Result<T, E>
where
    E: From<StateError>,
    F: FnMut() -> Result<WriteAttempt<T>, E>,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        match write()? {
            WriteAttempt::Committed(out) => return Ok(out),
            WriteAttempt::Busy(reason) if attempt < attempts => {
                warn!(attempt, %reason, "store busy, retrying write");
                tokio::time::sleep(BUSY_BACKOFF * attempt).await;
            }
            WriteAttempt::Busy(reason) => return Err(StateError::Busy(reason).into()),
        }
    }
}

fn blocking_backoff(delay: Duration) {
    match Handle::try_current() {
        Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => {
            tokio::task::block_in_place(|| std::thread::sleep(delay));
        }
        _ => std::thread::sleep(delay),
    }
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> StateResult<T> {
    serde_json::from_slice(bytes).map_err(map_err!(Deserialize))
}

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
    write_attempts: u32,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self {
            db: Arc::new(db),
            write_attempts: DEFAULT_WRITE_ATTEMPTS,
        };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self {
            db: Arc::new(db),
            write_attempts: DEFAULT_WRITE_ATTEMPTS,
        };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    /// Bound the number of attempts for a write that keeps failing to
    /// begin or commit.
    pub fn with_write_attempts(mut self, attempts: u32) -> Self {
        self.write_attempts = attempts.max(1);
        self
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        for table in ALL_TABLES {
            txn.open_table(table).map_err(map_err!(Table))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Transactions ───────────────────────────────────────────────

    /// Run `f` inside one write transaction.
    ///
    /// All writes made through the [`StoreTxn`] become visible together when
    /// `f` returns `Ok`; none of them do when it returns `Err`. Failures to
    /// begin or commit are retried with linear backoff, re-running `f`.
    /// The closure may return any error type that state errors convert into.
    ///
    /// On a multi-threaded runtime the backoff hands the worker off with
    /// [`tokio::task::block_in_place`]. Async callers should prefer
    /// [`StateStore::transaction_async`].
    pub fn transaction<T, E, F>(&self, f: F) -> Result<T, E>
    where
        E: From<StateError>,
        F: Fn(&StoreTxn<'_>) -> Result<T, E>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.try_write(&f)? {
                WriteAttempt::Committed(out) => return Ok(out),
                WriteAttempt::Busy(reason) if attempt < self.write_attempts => {
                    warn!(attempt, %reason, "store busy, retrying write");
                    blocking_backoff(BUSY_BACKOFF * attempt);
                }
                WriteAttempt::Busy(reason) => return Err(StateError::Busy(reason).into()),
            }
        }
    }

    /// [`StateStore::transaction`] for async callers: the busy backoff
    /// yields to the runtime instead of parking the thread.
    pub async fn transaction_async<T, E, F>(&self, f: F) -> Result<T, E>
    where
        E: From<StateError>,
        F: Fn(&StoreTxn<'_>) -> Result<T, E>,
    {
        retry_busy(self.write_attempts, || self.try_write(&f)).await
    }

    /// One begin/run/commit cycle.
    fn try_write<T, E, F>(&self, f: &F) -> Result<WriteAttempt<T>, E>
    where
        E: From<StateError>,
        F: Fn(&StoreTxn<'_>) -> Result<T, E>,
    {
        let txn = match self.db.begin_write() {
            Ok(txn) => txn,
            Err(e) => return Ok(WriteAttempt::Busy(e.to_string())),
        };
        // Dropping an uncommitted WriteTransaction aborts it.
        let out = f(&StoreTxn { txn: &txn })?;
        match txn.commit() {
            Ok(()) => Ok(WriteAttempt::Committed(out)),
            Err(e) => Ok(WriteAttempt::Busy(e.to_string())),
        }
    }

    fn read<T: DeserializeOwned>(&self, def: JsonTable, key: &str) -> StateResult<Option<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(def).map_err(map_err!(Table))?;
        match table.get(key).map_err(map_err!(Read))? {
            Some(guard) => Ok(Some(decode(guard.value())?)),
            None => Ok(None),
        }
    }

    /// Every value whose key starts with `prefix` (all values for `""`).
    fn scan<T: DeserializeOwned>(&self, def: JsonTable, prefix: &str) -> StateResult<Vec<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(def).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            if key.value().starts_with(prefix) {
                results.push(decode(value.value())?);
            }
        }
        Ok(results)
    }

    // ── Servers ────────────────────────────────────────────────────

    pub fn put_server(&self, server: &ServerRecord) -> StateResult<()> {
        self.transaction(|txn| txn.put_server(server))
    }

    pub fn get_server(&self, server_id: &str) -> StateResult<Option<ServerRecord>> {
        self.read(SERVERS, server_id)
    }

    pub fn list_servers(&self) -> StateResult<Vec<ServerRecord>> {
        self.scan(SERVERS, "")
    }

    pub fn delete_server(&self, server_id: &str) -> StateResult<bool> {
        self.transaction(|txn| txn.remove(SERVERS, server_id))
    }

    /// The server flagged as core, if any.
    pub fn core_server(&self) -> StateResult<Option<ServerRecord>> {
        Ok(self.list_servers()?.into_iter().find(|s| s.is_core))
    }

    /// Flip a server's online flag and bump `last_seen`.
    pub fn set_server_online(&self, server_id: &str, online: bool) -> StateResult<()> {
        self.transaction(|txn| {
            let mut server: ServerRecord = txn
                .get(SERVERS, server_id)?
                .ok_or_else(|| StateError::NotFound(format!("server {server_id}")))?;
            server.online = online;
            server.last_seen = epoch_secs();
            txn.put_server(&server)
        })
    }

    /// Store the metrics from an agent status report.
    pub fn record_server_metrics(
        &self,
        server_id: &str,
        metrics: Option<serde_json::Value>,
    ) -> StateResult<()> {
        self.transaction(|txn| {
            let Some(mut server) = txn.get::<ServerRecord>(SERVERS, server_id)? else {
                return Ok(());
            };
            server.last_seen = epoch_secs();
            if metrics.is_some() {
                server.metrics = metrics.clone();
            }
            txn.put_server(&server)
        })
    }

    // ── Deployments ────────────────────────────────────────────────

    pub fn put_deployment(&self, deployment: &Deployment) -> StateResult<()> {
        self.transaction(|txn| txn.put_deployment(deployment))
    }

    pub fn get_deployment(&self, deployment_id: &str) -> StateResult<Option<Deployment>> {
        self.read(DEPLOYMENTS, deployment_id)
    }

    pub fn list_deployments(&self) -> StateResult<Vec<Deployment>> {
        self.scan(DEPLOYMENTS, "")
    }

    pub fn list_deployments_for_server(&self, server_id: &str) -> StateResult<Vec<Deployment>> {
        let mut deployments: Vec<Deployment> = self
            .list_deployments()?
            .into_iter()
            .filter(|d| d.server_id == server_id)
            .collect();
        deployments.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(deployments)
    }

    /// Deployments of an app across all servers, newest first.
    pub fn list_deployments_for_app(&self, app_name: &str) -> StateResult<Vec<Deployment>> {
        let mut deployments: Vec<Deployment> = self
            .list_deployments()?
            .into_iter()
            .filter(|d| d.app_name == app_name)
            .collect();
        deployments.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(a.id.cmp(&b.id)));
        Ok(deployments)
    }

    /// The deployment of `app_name` on `server_id`, if one exists.
    pub fn find_deployment(&self, server_id: &str, app_name: &str) -> StateResult<Option<Deployment>> {
        Ok(self
            .list_deployments()?
            .into_iter()
            .find(|d| d.server_id == server_id && d.app_name == app_name))
    }

    /// Deployments sitting in a transient status.
    pub fn list_transient_deployments(&self) -> StateResult<Vec<Deployment>> {
        Ok(self
            .list_deployments()?
            .into_iter()
            .filter(|d| d.status.is_transient())
            .collect())
    }

    /// Set status + message and bump `updated_at`. Returns the updated record.
    pub fn update_deployment_status(
        &self,
        deployment_id: &str,
        status: DeploymentStatus,
        message: Option<String>,
    ) -> StateResult<Option<Deployment>> {
        self.transaction(|txn| txn.update_deployment_status(deployment_id, status, message.clone()))
    }

    pub fn delete_deployment(&self, deployment_id: &str) -> StateResult<bool> {
        self.transaction(|txn| txn.remove(DEPLOYMENTS, deployment_id))
    }

    // ── Secrets ────────────────────────────────────────────────────

    pub fn put_secrets(&self, deployment_id: &str, secrets: &SecretMap) -> StateResult<()> {
        self.transaction(|txn| txn.put_secrets(deployment_id, secrets))
    }

    pub fn get_secrets(&self, deployment_id: &str) -> StateResult<SecretMap> {
        Ok(self.read(SECRETS, deployment_id)?.unwrap_or_default())
    }

    // ── Services ───────────────────────────────────────────────────

    pub fn put_service(&self, service: &ServiceRecord) -> StateResult<()> {
        self.transaction(|txn| txn.put_service(service))
    }

    pub fn get_service(
        &self,
        deployment_id: &str,
        service_name: &str,
    ) -> StateResult<Option<ServiceRecord>> {
        self.read(SERVICES, &service_key(deployment_id, service_name))
    }

    pub fn list_services(&self) -> StateResult<Vec<ServiceRecord>> {
        self.scan(SERVICES, "")
    }

    pub fn list_services_for_deployment(
        &self,
        deployment_id: &str,
    ) -> StateResult<Vec<ServiceRecord>> {
        self.scan(SERVICES, &format!("{deployment_id}:"))
    }

    /// Set the status of every service a deployment provides.
    pub fn set_services_status(&self, deployment_id: &str, status: ServiceStatus) -> StateResult<u32> {
        let prefix = format!("{deployment_id}:");
        self.transaction(|txn| {
            let services: Vec<ServiceRecord> = txn.scan(SERVICES, &prefix)?;
            let now = epoch_secs();
            let mut changed = 0;
            for mut service in services {
                if service.status != status {
                    service.status = status;
                    service.updated_at = now;
                    txn.put_service(&service)?;
                    changed += 1;
                }
            }
            Ok(changed)
        })
    }

    pub fn delete_services_for_deployment(&self, deployment_id: &str) -> StateResult<u32> {
        self.transaction(|txn| txn.delete_services_for_deployment(deployment_id))
    }

    // ── Routes ─────────────────────────────────────────────────────

    pub fn put_proxy_route(&self, route: &ProxyRoute) -> StateResult<()> {
        self.transaction(|txn| txn.put_proxy_route(route))
    }

    pub fn get_proxy_route(&self, deployment_id: &str) -> StateResult<Option<ProxyRoute>> {
        self.read(PROXY_ROUTES, deployment_id)
    }

    pub fn list_proxy_routes(&self) -> StateResult<Vec<ProxyRoute>> {
        self.scan(PROXY_ROUTES, "")
    }

    pub fn delete_proxy_route(&self, deployment_id: &str) -> StateResult<bool> {
        self.transaction(|txn| txn.remove(PROXY_ROUTES, deployment_id))
    }

    pub fn put_service_route(&self, route: &ServiceRoute) -> StateResult<()> {
        self.transaction(|txn| txn.put_service_route(route))
    }

    pub fn list_service_routes(&self) -> StateResult<Vec<ServiceRoute>> {
        self.scan(SERVICE_ROUTES, "")
    }

    pub fn list_service_routes_for_deployment(
        &self,
        deployment_id: &str,
    ) -> StateResult<Vec<ServiceRoute>> {
        self.scan(SERVICE_ROUTES, &format!("{deployment_id}:"))
    }

    pub fn delete_service_routes_for_deployment(&self, deployment_id: &str) -> StateResult<u32> {
        self.transaction(|txn| txn.remove_prefix(SERVICE_ROUTES, &format!("{deployment_id}:")))
    }

    // ── Command log ────────────────────────────────────────────────

    pub fn put_command(&self, command: &CommandRecord) -> StateResult<()> {
        self.transaction(|txn| txn.put_command(command))
    }

    pub fn get_command(&self, command_id: &str) -> StateResult<Option<CommandRecord>> {
        self.read(COMMANDS, command_id)
    }

    /// Commands targeting a deployment, oldest first.
    pub fn list_commands_for_deployment(&self, deployment_id: &str) -> StateResult<Vec<CommandRecord>> {
        let mut commands: Vec<CommandRecord> = self
            .scan::<CommandRecord>(COMMANDS, "")?
            .into_iter()
            .filter(|c| c.deployment_id.as_deref() == Some(deployment_id))
            .collect();
        commands.sort_by_key(|c| c.created_at);
        Ok(commands)
    }

    /// Move a command to a new status. Terminal records are left untouched.
    pub fn update_command_status(
        &self,
        command_id: &str,
        status: CommandStatus,
        message: Option<String>,
    ) -> StateResult<Option<CommandRecord>> {
        self.transaction(|txn| {
            let Some(mut command) = txn.get::<CommandRecord>(COMMANDS, command_id)? else {
                return Ok(None);
            };
            if command.status.is_terminal() {
                return Ok(Some(command));
            }
            let now = epoch_secs();
            command.status = status;
            match status {
                CommandStatus::Acknowledged => command.acknowledged_at = Some(now),
                s if s.is_terminal() => command.completed_at = Some(now),
                _ => {}
            }
            if message.is_some() {
                command.message = message.clone();
            }
            txn.put_command(&command)?;
            Ok(Some(command))
        })
    }
}

/// A write transaction handed to [`StateStore::transaction`] closures.
pub struct StoreTxn<'a> {
    txn: &'a WriteTransaction,
}

impl StoreTxn<'_> {
    fn put<T: Serialize>(&self, def: JsonTable, key: &str, value: &T) -> StateResult<()> {
        let bytes = encode(value)?;
        let mut table = self.txn.open_table(def).map_err(map_err!(Table))?;
        table
            .insert(key, bytes.as_slice())
            .map_err(map_err!(Write))?;
        Ok(())
    }

    fn get<T: DeserializeOwned>(&self, def: JsonTable, key: &str) -> StateResult<Option<T>> {
        let table = self.txn.open_table(def).map_err(map_err!(Table))?;
        match table.get(key).map_err(map_err!(Read))? {
            Some(guard) => Ok(Some(decode(guard.value())?)),
            None => Ok(None),
        }
    }

    fn scan<T: DeserializeOwned>(&self, def: JsonTable, prefix: &str) -> StateResult<Vec<T>> {
        let table = self.txn.open_table(def).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            if key.value().starts_with(prefix) {
                results.push(decode(value.value())?);
            }
        }
        Ok(results)
    }

    fn remove(&self, def: JsonTable, key: &str) -> StateResult<bool> {
        let mut table = self.txn.open_table(def).map_err(map_err!(Table))?;
        let existed = table.remove(key).map_err(map_err!(Write))?.is_some();
        Ok(existed)
    }

    fn remove_prefix(&self, def: JsonTable, prefix: &str) -> StateResult<u32> {
        let mut table = self.txn.open_table(def).map_err(map_err!(Table))?;
        let keys: Vec<String> = table
            .iter()
            .map_err(map_err!(Read))?
            .filter_map(|entry| {
                let (key, _) = entry.ok()?;
                let k = key.value().to_string();
                k.starts_with(prefix).then_some(k)
            })
            .collect();
        for key in &keys {
            table.remove(key.as_str()).map_err(map_err!(Write))?;
        }
        Ok(keys.len() as u32)
    }

    // ── Typed helpers ──────────────────────────────────────────────

    pub fn put_server(&self, server: &ServerRecord) -> StateResult<()> {
        self.put(SERVERS, &server.id, server)
    }

    pub fn get_deployment(&self, deployment_id: &str) -> StateResult<Option<Deployment>> {
        self.get(DEPLOYMENTS, deployment_id)
    }

    pub fn list_deployments(&self) -> StateResult<Vec<Deployment>> {
        self.scan(DEPLOYMENTS, "")
    }

    pub fn put_deployment(&self, deployment: &Deployment) -> StateResult<()> {
        self.put(DEPLOYMENTS, &deployment.id, deployment)?;
        debug!(deployment_id = %deployment.id, status = %deployment.status, "deployment stored");
        Ok(())
    }

    pub fn delete_deployment(&self, deployment_id: &str) -> StateResult<bool> {
        self.remove(DEPLOYMENTS, deployment_id)
    }

    pub fn update_deployment_status(
        &self,
        deployment_id: &str,
        status: DeploymentStatus,
        message: Option<String>,
    ) -> StateResult<Option<Deployment>> {
        let Some(mut deployment) = self.get_deployment(deployment_id)? else {
            return Ok(None);
        };
        deployment.status = status;
        deployment.status_message = message;
        deployment.updated_at = epoch_secs();
        self.put_deployment(&deployment)?;
        Ok(Some(deployment))
    }

    pub fn put_secrets(&self, deployment_id: &str, secrets: &SecretMap) -> StateResult<()> {
        self.put(SECRETS, deployment_id, secrets)
    }

    pub fn delete_secrets(&self, deployment_id: &str) -> StateResult<bool> {
        self.remove(SECRETS, deployment_id)
    }

    pub fn put_service(&self, service: &ServiceRecord) -> StateResult<()> {
        self.put(SERVICES, &service.table_key(), service)
    }

    pub fn delete_services_for_deployment(&self, deployment_id: &str) -> StateResult<u32> {
        self.remove_prefix(SERVICES, &format!("{deployment_id}:"))
    }

    pub fn put_proxy_route(&self, route: &ProxyRoute) -> StateResult<()> {
        self.put(PROXY_ROUTES, &route.deployment_id, route)
    }

    pub fn list_proxy_routes(&self) -> StateResult<Vec<ProxyRoute>> {
        self.scan(PROXY_ROUTES, "")
    }

    pub fn delete_proxy_route(&self, deployment_id: &str) -> StateResult<bool> {
        self.remove(PROXY_ROUTES, deployment_id)
    }

    pub fn put_service_route(&self, route: &ServiceRoute) -> StateResult<()> {
        self.put(SERVICE_ROUTES, &route.table_key(), route)
    }

    pub fn list_service_routes(&self) -> StateResult<Vec<ServiceRoute>> {
        self.scan(SERVICE_ROUTES, "")
    }

    pub fn delete_service_routes_for_deployment(&self, deployment_id: &str) -> StateResult<u32> {
        self.remove_prefix(SERVICE_ROUTES, &format!("{deployment_id}:"))
    }

    pub fn put_command(&self, command: &CommandRecord) -> StateResult<()> {
        self.put(COMMANDS, &command.id, command)
    }

    /// Remove a deployment together with its secrets, services and routes.
    pub fn purge_deployment(&self, deployment_id: &str) -> StateResult<bool> {
        self.delete_services_for_deployment(deployment_id)?;
        self.delete_service_routes_for_deployment(deployment_id)?;
        self.delete_proxy_route(deployment_id)?;
        self.delete_secrets(deployment_id)?;
        self.delete_deployment(deployment_id)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use super::*;
    use fleet_core::Protocol;

    fn test_deployment(id: &str, server: &str, app: &str) -> Deployment {
        Deployment {
            id: id.to_string(),
            server_id: server.to_string(),
            app_name: app.to_string(),
            version: "1.0.0".to_string(),
            config: Default::default(),
            group_id: None,
            status: DeploymentStatus::Pending,
            status_message: None,
            created_at: 1000,
            updated_at: 1000,
        }
    }

    fn test_service(deployment_id: &str, name: &str, port: u16) -> ServiceRecord {
        ServiceRecord {
            deployment_id: deployment_id.to_string(),
            service_name: name.to_string(),
            server_id: "srv-1".to_string(),
            host: "127.0.0.1".to_string(),
            port,
            protocol: Protocol::Tcp,
            status: ServiceStatus::Available,
            registered_at: 1000,
            updated_at: 1000,
        }
    }

    fn test_server(id: &str) -> ServerRecord {
        ServerRecord {
            id: id.to_string(),
            name: id.to_string(),
            host: "10.0.0.5".to_string(),
            is_core: false,
            token_hash: None,
            online: false,
            last_seen: 0,
            metrics: None,
            created_at: 1000,
        }
    }

    #[test]
    fn deployment_put_and_get() {
        let store = StateStore::open_in_memory().unwrap();
        let dep = test_deployment("dep-1", "srv-1", "postgres");
        store.put_deployment(&dep).unwrap();

        let got = store.get_deployment("dep-1").unwrap().unwrap();
        assert_eq!(got, dep);
        assert!(store.get_deployment("missing").unwrap().is_none());
    }

    #[test]
    fn find_deployment_by_server_and_app() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_deployment(&test_deployment("a", "srv-1", "postgres")).unwrap();
        store.put_deployment(&test_deployment("b", "srv-2", "postgres")).unwrap();

        let found = store.find_deployment("srv-2", "postgres").unwrap().unwrap();
        assert_eq!(found.id, "b");
        assert!(store.find_deployment("srv-3", "postgres").unwrap().is_none());
        assert_eq!(store.list_deployments_for_app("postgres").unwrap().len(), 2);
        assert_eq!(store.list_deployments_for_server("srv-1").unwrap().len(), 1);
    }

    #[test]
    fn update_status_bumps_timestamp() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_deployment(&test_deployment("dep-1", "srv-1", "app")).unwrap();

        let updated = store
            .update_deployment_status("dep-1", DeploymentStatus::Error, Some("boom".into()))
            .unwrap()
            .unwrap();
        assert_eq!(updated.status, DeploymentStatus::Error);
        assert_eq!(updated.status_message.as_deref(), Some("boom"));
        assert!(updated.updated_at > 1000);

        assert!(
            store
                .update_deployment_status("missing", DeploymentStatus::Running, None)
                .unwrap()
                .is_none()
        );
    }

    #[test]
    fn transaction_commits_all_writes() {
        let store = StateStore::open_in_memory().unwrap();
        store
            .transaction(|txn| -> StateResult<()> {
                txn.put_deployment(&test_deployment("dep-1", "srv-1", "app"))?;
                txn.put_service(&test_service("dep-1", "db", 5432))?;
                Ok(())
            })
            .unwrap();

        assert!(store.get_deployment("dep-1").unwrap().is_some());
        assert!(store.get_service("dep-1", "db").unwrap().is_some());
    }

    #[test]
    fn transaction_rolls_back_on_error() {
        let store = StateStore::open_in_memory().unwrap();
        let result: StateResult<()> = store.transaction(|txn| {
            txn.put_deployment(&test_deployment("dep-1", "srv-1", "app"))?;
            txn.put_service(&test_service("dep-1", "db", 5432))?;
            Err(StateError::Conflict("abort".into()))
        });

        assert!(matches!(result, Err(StateError::Conflict(_))));
        assert!(store.get_deployment("dep-1").unwrap().is_none());
        assert!(store.list_services().unwrap().is_empty());
    }

    #[test]
    fn purge_deployment_removes_dependents_only() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_deployment(&test_deployment("dep-1", "srv-1", "a")).unwrap();
        store.put_deployment(&test_deployment("dep-10", "srv-1", "b")).unwrap();
        store.put_service(&test_service("dep-1", "db", 5432)).unwrap();
        store.put_service(&test_service("dep-1", "admin", 8080)).unwrap();
        store.put_service(&test_service("dep-10", "db", 5433)).unwrap();
        let mut secrets = SecretMap::new();
        secrets.insert("password".into(), "s3cret".into());
        store.put_secrets("dep-1", &secrets).unwrap();

        let existed = store.transaction(|txn| txn.purge_deployment("dep-1")).unwrap();
        assert!(existed);

        assert!(store.get_deployment("dep-1").unwrap().is_none());
        assert!(store.list_services_for_deployment("dep-1").unwrap().is_empty());
        assert!(store.get_secrets("dep-1").unwrap().is_empty());
        // Prefix "dep-1:" must not match "dep-10:".
        assert_eq!(store.list_services_for_deployment("dep-10").unwrap().len(), 1);
    }

    #[test]
    fn set_services_status_counts_changes() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_service(&test_service("dep-1", "db", 5432)).unwrap();
        store.put_service(&test_service("dep-1", "admin", 8080)).unwrap();

        let changed = store
            .set_services_status("dep-1", ServiceStatus::Unavailable)
            .unwrap();
        assert_eq!(changed, 2);
        let again = store
            .set_services_status("dep-1", ServiceStatus::Unavailable)
            .unwrap();
        assert_eq!(again, 0);
        assert!(!store.get_service("dep-1", "db").unwrap().unwrap().is_available());
    }

    #[test]
    fn server_online_flag() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_server(&test_server("srv-1")).unwrap();
        store.set_server_online("srv-1", true).unwrap();

        let server = store.get_server("srv-1").unwrap().unwrap();
        assert!(server.online);
        assert!(server.last_seen > 0);

        let err = store.set_server_online("ghost", true).unwrap_err();
        assert!(matches!(err, StateError::NotFound(_)));
    }

    #[test]
    fn command_status_transitions_stop_at_terminal() {
        let store = StateStore::open_in_memory().unwrap();
        let cmd = CommandRecord {
            id: "cmd-1".into(),
            server_id: "srv-1".into(),
            deployment_id: Some("dep-1".into()),
            action: CommandAction::Install,
            status: CommandStatus::Pending,
            message: None,
            created_at: 1000,
            acknowledged_at: None,
            completed_at: None,
        };
        store.put_command(&cmd).unwrap();

        let acked = store
            .update_command_status("cmd-1", CommandStatus::Acknowledged, None)
            .unwrap()
            .unwrap();
        assert!(acked.acknowledged_at.is_some());

        store
            .update_command_status("cmd-1", CommandStatus::Timeout, Some("late".into()))
            .unwrap();
        let after = store
            .update_command_status("cmd-1", CommandStatus::Completed, None)
            .unwrap()
            .unwrap();
        assert_eq!(after.status, CommandStatus::Timeout);
        assert_eq!(store.list_commands_for_deployment("dep-1").unwrap().len(), 1);
    }

    #[test]
    fn persistence_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fleet.redb");

        {
            let store = StateStore::open(&path).unwrap();
            store.put_deployment(&test_deployment("dep-1", "srv-1", "app")).unwrap();
        }

        let store = StateStore::open(&path).unwrap();
        assert!(store.get_deployment("dep-1").unwrap().is_some());
    }

    #[test]
    fn empty_store_operations() {
        let store = StateStore::open_in_memory().unwrap();
        assert!(store.list_deployments().unwrap().is_empty());
        assert!(store.list_servers().unwrap().is_empty());
        assert!(store.core_server().unwrap().is_none());
        assert!(!store.delete_deployment("nope").unwrap());
        assert_eq!(store.delete_services_for_deployment("nope").unwrap(), 0);
    }

    #[tokio::test]
    async fn async_transaction_commits_all_or_nothing() {
        let store = StateStore::open_in_memory().unwrap();
        store
            .transaction_async(|txn| -> StateResult<()> {
                txn.put_deployment(&test_deployment("dep-1", "srv-1", "app"))?;
                txn.put_service(&test_service("dep-1", "db", 5432))?;
                Ok(())
            })
            .await
            .unwrap();
        assert_eq!(store.list_services().unwrap().len(), 1);

        let err = store
            .transaction_async(|txn| -> StateResult<()> {
                txn.put_deployment(&test_deployment("dep-2", "srv-1", "other"))?;
                Err(StateError::NotFound("dep-3".into()))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, StateError::NotFound(_)));
        assert!(store.get_deployment("dep-2").unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn busy_retry_yields_to_other_tasks() {
        let ran = Arc::new(AtomicBool::new(false));
        let flag = ran.clone();
        tokio::spawn(async move { flag.store(true, Ordering::SeqCst) });

        // On a current-thread runtime the spawned task only runs if the
        // backoff awaits.
        let mut calls = 0;
        let seen = retry_busy(3, || -> StateResult<WriteAttempt<bool>> {
            calls += 1;
            if calls == 1 {
                Ok(WriteAttempt::Busy("database locked".into()))
            } else {
                Ok(WriteAttempt::Committed(ran.load(Ordering::SeqCst)))
            }
        })
        .await
        .unwrap();
        assert!(seen);
        assert_eq!(calls, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn busy_retry_gives_up_after_the_last_attempt() {
        let mut calls = 0;
        let err = retry_busy(3, || -> StateResult<WriteAttempt<()>> {
            calls += 1;
            Ok(WriteAttempt::Busy(format!("locked {calls}")))
        })
        .await
        .unwrap_err();
        assert!(matches!(err, StateError::Busy(reason) if reason == "locked 3"));
        assert_eq!(calls, 3);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn blocking_backoff_is_safe_on_runtime_workers() {
        let started = std::time::Instant::now();
        blocking_backoff(Duration::from_millis(5));
        assert!(started.elapsed() >= Duration::from_millis(5));

        tokio::task::spawn_blocking(|| blocking_backoff(Duration::from_millis(1)))
            .await
            .unwrap();
    }
}
