//! Service registry: tracks which deployment provides which service, and
//! where it can be reached.

use serde::Serialize;
use tracing::debug;

use fleet_core::ServiceProvision;
use fleetgrid_state::{ServiceRecord, ServiceStatus, StateStore, epoch_secs};

use crate::error::{ResolveError, ResolveResult};

/// Host used when provider and consumer share a server.
pub const LOOPBACK: &str = "127.0.0.1";

/// A resolved address for a consumer to dial.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServiceConnection {
    pub service_name: String,
    pub deployment_id: String,
    pub server_id: String,
    pub host: String,
    pub port: u16,
    pub same_server: bool,
}

/// A `(server_id, port)` pair already claimed by another service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PortConflict {
    pub port: u16,
    pub deployment_id: String,
    pub service_name: String,
}

/// Service location registry over the state store.
#[derive(Clone)]
pub struct ServiceRegistry {
    store: StateStore,
    /// Server the control plane runs on.
    local_server_id: String,
}

impl ServiceRegistry {
    pub fn new(store: StateStore, local_server_id: impl Into<String>) -> Self {
        Self {
            store,
            local_server_id: local_server_id.into(),
        }
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub fn local_server_id(&self) -> &str {
        &self.local_server_id
    }

    fn host_for(&self, server_id: &str) -> ResolveResult<String> {
        if server_id == self.local_server_id {
            return Ok(LOOPBACK.to_string());
        }
        let server = self
            .store
            .get_server(server_id)?
            .ok_or_else(|| ResolveError::UnknownServer(server_id.to_string()))?;
        Ok(server.host)
    }

    /// Upsert the record for `(deployment_id, provision.name)`.
    ///
    /// A re-registration keeps the original `registered_at` so tie-breaking
    /// in [`find_service`](Self::find_service) stays stable.
    pub fn register_service(
        &self,
        deployment_id: &str,
        server_id: &str,
        provision: &ServiceProvision,
    ) -> ResolveResult<ServiceRecord> {
        let host = self.host_for(server_id)?;
        let now = epoch_secs();
        let registered_at = self
            .store
            .get_service(deployment_id, &provision.name)?
            .map(|existing| existing.registered_at)
            .unwrap_or(now);

        let record = ServiceRecord {
            deployment_id: deployment_id.to_string(),
            service_name: provision.name.clone(),
            server_id: server_id.to_string(),
            host,
            port: provision.port,
            protocol: provision.protocol,
            status: ServiceStatus::Available,
            registered_at,
            updated_at: now,
        };
        self.store.put_service(&record)?;
        debug!(
            %deployment_id,
            %server_id,
            service = %record.service_name,
            port = record.port,
            "service registered"
        );
        Ok(record)
    }

    /// Remove every service a deployment provides.
    pub fn unregister_services(&self, deployment_id: &str) -> ResolveResult<u32> {
        let removed = self.store.delete_services_for_deployment(deployment_id)?;
        debug!(%deployment_id, removed, "services unregistered");
        Ok(removed)
    }

    /// Mark a deployment's services available (start) or unavailable (stop).
    pub fn set_availability(&self, deployment_id: &str, available: bool) -> ResolveResult<u32> {
        let status = if available {
            ServiceStatus::Available
        } else {
            ServiceStatus::Unavailable
        };
        Ok(self.store.set_services_status(deployment_id, status)?)
    }

    /// All records for a service name, available first, then registration order.
    pub fn providers(&self, service_name: &str) -> ResolveResult<Vec<ServiceRecord>> {
        let mut providers: Vec<ServiceRecord> = self
            .store
            .list_services()?
            .into_iter()
            .filter(|s| s.service_name == service_name)
            .collect();
        providers.sort_by(|a, b| {
            b.is_available()
                .cmp(&a.is_available())
                .then(a.registered_at.cmp(&b.registered_at))
                .then(a.deployment_id.cmp(&b.deployment_id))
        });
        Ok(providers)
    }

    /// First available provider: earliest `registered_at`, then lowest
    /// `deployment_id`.
    pub fn find_service(&self, service_name: &str) -> ResolveResult<Option<ServiceRecord>> {
        Ok(self
            .providers(service_name)?
            .into_iter()
            .find(ServiceRecord::is_available))
    }

    pub fn find_service_on_server(
        &self,
        service_name: &str,
        server_id: &str,
    ) -> ResolveResult<Option<ServiceRecord>> {
        Ok(self
            .providers(service_name)?
            .into_iter()
            .find(|s| s.is_available() && s.server_id == server_id))
    }

    /// Pick a provider for a consumer on `consumer_server_id`.
    pub fn get_connection(
        &self,
        service_name: &str,
        consumer_server_id: &str,
        prefer_same_server: bool,
    ) -> ResolveResult<Option<ServiceConnection>> {
        let mut provider = None;
        if prefer_same_server {
            provider = self.find_service_on_server(service_name, consumer_server_id)?;
        }
        if provider.is_none() {
            provider = self.find_service(service_name)?;
        }

        let Some(record) = provider else {
            return Ok(None);
        };
        let same_server = record.server_id == consumer_server_id;
        let host = if same_server {
            LOOPBACK.to_string()
        } else if record.host == LOOPBACK {
            // Registered from the control plane's point of view.
            self.store
                .get_server(&record.server_id)?
                .map(|s| s.host)
                .unwrap_or(record.host)
        } else {
            record.host
        };
        Ok(Some(ServiceConnection {
            service_name: record.service_name,
            deployment_id: record.deployment_id,
            server_id: record.server_id,
            host,
            port: record.port,
            same_server,
        }))
    }

    /// Report which of `ports` are already registered on `server_id`.
    pub fn check_port_conflicts(
        &self,
        server_id: &str,
        ports: &[u16],
    ) -> ResolveResult<Vec<PortConflict>> {
        let mut conflicts: Vec<PortConflict> = self
            .store
            .list_services()?
            .into_iter()
            .filter(|s| s.server_id == server_id && ports.contains(&s.port))
            .map(|s| PortConflict {
                port: s.port,
                deployment_id: s.deployment_id,
                service_name: s.service_name,
            })
            .collect();
        conflicts.sort_by_key(|c| c.port);
        Ok(conflicts)
    }
}
