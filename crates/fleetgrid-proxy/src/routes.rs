//! Route table: persisted web UI and service routes.
//!
//! Routes are created inactive at install, flipped active on start and
//! inactive on stop, and deleted on uninstall. HTTP paths and TCP external
//! ports are unique across every route in the table.

use tracing::debug;

use fleet_core::{Protocol, ServiceProvision, WebUi};
use fleetgrid_state::{ProxyRoute, ServiceRoute, StateStore, StoreTxn, epoch_secs};

use crate::error::{ProxyError, ProxyResult};

/// Path prefixes owned by the control plane's own routes.
pub const RESERVED_PATHS: [&str; 3] = ["/api", "/health", "/agent"];

/// Where a deployment's routes should forward to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Upstream {
    pub host: String,
}

/// Identity of the route being registered. Only a route with the same
/// identity may already hold the path or port it claims.
#[derive(Debug, Clone, Copy)]
enum RouteKey<'a> {
    Web(&'a str),
    Service(&'a str, &'a str),
}

impl RouteKey<'_> {
    fn is_web(&self, route: &ProxyRoute) -> bool {
        matches!(self, RouteKey::Web(id) if *id == route.deployment_id)
    }

    fn is_service(&self, route: &ServiceRoute) -> bool {
        matches!(self, RouteKey::Service(id, name)
            if *id == route.deployment_id && *name == route.service_name)
    }
}

/// Route flags as they were before [`RouteTable::set_active`].
#[derive(Debug, Clone, Default)]
pub struct RouteSnapshot {
    web: Option<ProxyRoute>,
    services: Vec<ServiceRoute>,
}

#[derive(Clone)]
pub struct RouteTable {
    store: StateStore,
}

impl RouteTable {
    pub fn new(store: StateStore) -> Self {
        Self { store }
    }

    /// Register one route per provided service, all inactive.
    pub fn register_service_routes(
        &self,
        deployment_id: &str,
        upstream: &Upstream,
        provides: &[ServiceProvision],
    ) -> ProxyResult<Vec<ServiceRoute>> {
        let now = epoch_secs();
        let routes: Vec<ServiceRoute> = provides
            .iter()
            .map(|p| ServiceRoute {
                deployment_id: deployment_id.to_string(),
                service_name: p.name.clone(),
                protocol: p.protocol,
                path: (p.protocol == Protocol::Http).then(|| p.route_path()),
                external_port: match p.protocol {
                    Protocol::Tcp => Some(p.external_port.unwrap_or(p.port)),
                    Protocol::Http => None,
                },
                upstream_host: upstream.host.clone(),
                upstream_port: p.port,
                active: false,
                created_at: now,
            })
            .collect();

        self.store.transaction(|txn| -> ProxyResult<()> {
            for route in &routes {
                let key = RouteKey::Service(deployment_id, &route.service_name);
                if let Some(path) = &route.path {
                    check_path(txn, path, key)?;
                }
                if let Some(port) = route.external_port {
                    check_port(txn, port, key)?;
                }
                txn.put_service_route(route)?;
            }
            Ok(())
        })?;

        debug!(%deployment_id, count = routes.len(), "service routes registered");
        Ok(routes)
    }

    /// Register the web UI route for a deployment, inactive.
    pub fn register_web_route(
        &self,
        deployment_id: &str,
        upstream: &Upstream,
        web_ui: &WebUi,
    ) -> ProxyResult<ProxyRoute> {
        let route = ProxyRoute {
            deployment_id: deployment_id.to_string(),
            path: normalize_path(&web_ui.path),
            upstream_host: upstream.host.clone(),
            upstream_port: web_ui.port,
            active: false,
            created_at: epoch_secs(),
        };
        self.store.transaction(|txn| -> ProxyResult<()> {
            check_path(txn, &route.path, RouteKey::Web(deployment_id))?;
            Ok(txn.put_proxy_route(&route)?)
        })?;
        debug!(%deployment_id, path = %route.path, "web route registered");
        Ok(route)
    }

    /// Flip every route of a deployment, returning the previous state.
    pub fn set_active(&self, deployment_id: &str, active: bool) -> ProxyResult<RouteSnapshot> {
        let snapshot = RouteSnapshot {
            web: self.store.get_proxy_route(deployment_id)?,
            services: self.store.list_service_routes_for_deployment(deployment_id)?,
        };
        self.store.transaction(|txn| -> ProxyResult<()> {
            if let Some(web) = &snapshot.web {
                txn.put_proxy_route(&ProxyRoute {
                    active,
                    ..web.clone()
                })?;
            }
            for route in &snapshot.services {
                txn.put_service_route(&ServiceRoute {
                    active,
                    ..route.clone()
                })?;
            }
            Ok(())
        })?;
        debug!(%deployment_id, active, "route flags updated");
        Ok(snapshot)
    }

    /// Put route flags back the way a snapshot recorded them.
    pub fn restore(&self, snapshot: &RouteSnapshot) -> ProxyResult<()> {
        self.store.transaction(|txn| -> ProxyResult<()> {
            if let Some(web) = &snapshot.web {
                txn.put_proxy_route(web)?;
            }
            for route in &snapshot.services {
                txn.put_service_route(route)?;
            }
            Ok(())
        })?;
        Ok(())
    }

    pub fn unregister_service_routes(&self, deployment_id: &str) -> ProxyResult<u32> {
        Ok(self.store.delete_service_routes_for_deployment(deployment_id)?)
    }

    pub fn unregister_web_route(&self, deployment_id: &str) -> ProxyResult<bool> {
        Ok(self.store.delete_proxy_route(deployment_id)?)
    }

    /// Remove all routes of a deployment.
    pub fn unregister(&self, deployment_id: &str) -> ProxyResult<()> {
        self.store.transaction(|txn| -> ProxyResult<()> {
            txn.delete_service_routes_for_deployment(deployment_id)?;
            txn.delete_proxy_route(deployment_id)?;
            Ok(())
        })?;
        debug!(%deployment_id, "routes unregistered");
        Ok(())
    }

    pub fn active_web_routes(&self) -> ProxyResult<Vec<ProxyRoute>> {
        Ok(self
            .store
            .list_proxy_routes()?
            .into_iter()
            .filter(|r| r.active)
            .collect())
    }

    pub fn active_service_routes(&self) -> ProxyResult<Vec<ServiceRoute>> {
        Ok(self
            .store
            .list_service_routes()?
            .into_iter()
            .filter(|r| r.active)
            .collect())
    }
}

fn normalize_path(path: &str) -> String {
    let trimmed = path.trim_end_matches('/');
    if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{trimmed}")
    }
}

fn check_path(txn: &StoreTxn<'_>, path: &str, key: RouteKey<'_>) -> ProxyResult<()> {
    if RESERVED_PATHS
        .iter()
        .any(|reserved| path == *reserved || path.starts_with(&format!("{reserved}/")))
    {
        return Err(ProxyError::RouteConflict(format!("path {path} is reserved")));
    }
    let web_taken = txn
        .list_proxy_routes()?
        .into_iter()
        .find(|r| r.path == path && !key.is_web(r));
    if let Some(owner) = web_taken {
        return Err(ProxyError::RouteConflict(format!(
            "path {path} already used by deployment {}",
            owner.deployment_id
        )));
    }
    let service_taken = txn
        .list_service_routes()?
        .into_iter()
        .find(|r| r.path.as_deref() == Some(path) && !key.is_service(r));
    if let Some(owner) = service_taken {
        return Err(ProxyError::RouteConflict(format!(
            "path {path} already used by deployment {}",
            owner.deployment_id
        )));
    }
    Ok(())
}

fn check_port(txn: &StoreTxn<'_>, port: u16, key: RouteKey<'_>) -> ProxyResult<()> {
    let taken = txn
        .list_service_routes()?
        .into_iter()
        .find(|r| r.external_port == Some(port) && !key.is_service(r));
    match taken {
        Some(owner) => Err(ProxyError::RouteConflict(format!(
            "external port {port} already used by deployment {}",
            owner.deployment_id
        ))),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> RouteTable {
        RouteTable::new(StateStore::open_in_memory().unwrap())
    }

    fn upstream() -> Upstream {
        Upstream {
            host: "127.0.0.1".to_string(),
        }
    }

    fn http(name: &str, port: u16) -> ServiceProvision {
        ServiceProvision {
            name: name.to_string(),
            port,
            protocol: Protocol::Http,
            path: None,
            external_port: None,
        }
    }

    fn http_at(name: &str, port: u16, path: &str) -> ServiceProvision {
        ServiceProvision {
            path: Some(path.to_string()),
            ..http(name, port)
        }
    }

    fn tcp(name: &str, port: u16, external: u16) -> ServiceProvision {
        ServiceProvision {
            name: name.to_string(),
            port,
            protocol: Protocol::Tcp,
            path: None,
            external_port: Some(external),
        }
    }

    #[test]
    fn routes_start_inactive() {
        let routes = table();
        let registered = routes
            .register_service_routes("dep-1", &upstream(), &[http("grafana", 3000), tcp("pg", 5432, 15432)])
            .unwrap();
        assert_eq!(registered.len(), 2);
        assert_eq!(registered[0].path.as_deref(), Some("/grafana"));
        assert_eq!(registered[1].external_port, Some(15432));
        assert!(routes.active_service_routes().unwrap().is_empty());
    }

    #[test]
    fn duplicate_path_is_rejected() {
        let routes = table();
        routes
            .register_service_routes("dep-1", &upstream(), &[http("grafana", 3000)])
            .unwrap();
        let err = routes
            .register_web_route(
                "dep-2",
                &upstream(),
                &WebUi {
                    path: "/grafana/".to_string(),
                    port: 8080,
                },
            )
            .unwrap_err();
        assert!(matches!(err, ProxyError::RouteConflict(_)));
    }

    #[test]
    fn duplicate_external_port_is_rejected_atomically() {
        let routes = table();
        routes
            .register_service_routes("dep-1", &upstream(), &[tcp("pg", 5432, 15432)])
            .unwrap();
        let err = routes
            .register_service_routes(
                "dep-2",
                &upstream(),
                &[http("admin", 8080), tcp("pg", 5433, 15432)],
            )
            .unwrap_err();
        assert!(matches!(err, ProxyError::RouteConflict(msg) if msg.contains("15432")));
        // The http route registered before the conflict was rolled back.
        assert_eq!(routes.store.list_service_routes().unwrap().len(), 1);
    }

    #[test]
    fn web_ui_cannot_reuse_own_service_path() {
        let routes = table();
        routes
            .register_service_routes("dep-1", &upstream(), &[http("grafana", 3000)])
            .unwrap();
        let err = routes
            .register_web_route(
                "dep-1",
                &upstream(),
                &WebUi {
                    path: "/grafana".to_string(),
                    port: 3000,
                },
            )
            .unwrap_err();
        assert!(matches!(err, ProxyError::RouteConflict(msg) if msg.contains("dep-1")));
        assert!(routes.store.list_proxy_routes().unwrap().is_empty());
    }

    #[test]
    fn services_of_one_deployment_need_distinct_paths_and_ports() {
        let routes = table();
        let err = routes
            .register_service_routes(
                "dep-1",
                &upstream(),
                &[http("grafana", 3000), http_at("grafana-api", 3001, "/grafana")],
            )
            .unwrap_err();
        assert!(matches!(err, ProxyError::RouteConflict(_)));

        let err = routes
            .register_service_routes(
                "dep-1",
                &upstream(),
                &[tcp("pg", 5432, 15432), tcp("pg-replica", 5433, 15432)],
            )
            .unwrap_err();
        assert!(matches!(err, ProxyError::RouteConflict(msg) if msg.contains("15432")));
        assert!(routes.store.list_service_routes().unwrap().is_empty());
    }

    #[test]
    fn re_registering_the_same_routes_is_allowed() {
        let routes = table();
        let provides = [http("grafana", 3000), tcp("pg", 5432, 15432)];
        let ui = WebUi {
            path: "/ui".to_string(),
            port: 8080,
        };
        routes.register_service_routes("dep-1", &upstream(), &provides).unwrap();
        routes.register_web_route("dep-1", &upstream(), &ui).unwrap();
        routes.register_service_routes("dep-1", &upstream(), &provides).unwrap();
        routes.register_web_route("dep-1", &upstream(), &ui).unwrap();
        assert_eq!(routes.store.list_service_routes().unwrap().len(), 2);
    }

    #[test]
    fn reserved_paths_are_rejected() {
        let routes = table();
        let err = routes
            .register_web_route(
                "dep-1",
                &upstream(),
                &WebUi {
                    path: "/api/v2".to_string(),
                    port: 8080,
                },
            )
            .unwrap_err();
        assert!(matches!(err, ProxyError::RouteConflict(_)));
    }

    #[test]
    fn set_active_and_restore() {
        let routes = table();
        routes
            .register_service_routes("dep-1", &upstream(), &[http("grafana", 3000)])
            .unwrap();
        routes
            .register_web_route(
                "dep-1",
                &upstream(),
                &WebUi {
                    path: "/ui".to_string(),
                    port: 8080,
                },
            )
            .unwrap();

        let snapshot = routes.set_active("dep-1", true).unwrap();
        assert_eq!(routes.active_service_routes().unwrap().len(), 1);
        assert_eq!(routes.active_web_routes().unwrap().len(), 1);

        routes.restore(&snapshot).unwrap();
        assert!(routes.active_service_routes().unwrap().is_empty());
        assert!(routes.active_web_routes().unwrap().is_empty());

        routes.unregister("dep-1").unwrap();
        assert!(routes.store.list_proxy_routes().unwrap().is_empty());
    }
}
