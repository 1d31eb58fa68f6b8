//! Router configuration generation.
//!
//! The generated document is a pure function of the active routes in the
//! state store plus the fixed system routes, so it hashes identically
//! whenever nothing has changed.
//!
//! ```text
//!   http:  /api, /health, /agent/ws   → control plane
//!          /<app routes>               → deployments   (longest prefix first)
//!          /                           → static UI
//!   tcp:   :<external_port>            → deployments
//! ```

use serde::Serialize;
use sha2::{Digest, Sha256};

use fleet_core::Protocol;

use crate::error::ProxyResult;
use crate::routes::RouteTable;
use crate::tls::{TlsPolicy, probe_internal_ca};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HttpRoute {
    pub id: String,
    pub path: String,
    /// Remove `path` before forwarding.
    pub strip_prefix: bool,
    pub websocket: bool,
    pub upstream: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TcpRoute {
    pub id: String,
    pub listen_port: u16,
    pub upstream: String,
}

/// A complete router configuration document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RouterConfig {
    pub http: Vec<HttpRoute>,
    pub tcp: Vec<TcpRoute>,
    pub tls: TlsPolicy,
}

impl RouterConfig {
    /// Hex SHA-256 of the serialized document.
    pub fn content_hash(&self) -> ProxyResult<String> {
        let bytes = serde_json::to_vec(self)?;
        Ok(hex::encode(Sha256::digest(&bytes)))
    }
}

/// Builds [`RouterConfig`] documents from the route table.
#[derive(Clone)]
pub struct ConfigGenerator {
    routes: RouteTable,
    /// host:port of the control plane's HTTP listener.
    control_plane: String,
    /// host:port serving the static UI.
    ui_upstream: Option<String>,
    /// host:port of the internal CA.
    ca_addr: Option<String>,
}

impl ConfigGenerator {
    pub fn new(routes: RouteTable, control_plane: impl Into<String>) -> Self {
        Self {
            routes,
            control_plane: control_plane.into(),
            ui_upstream: None,
            ca_addr: None,
        }
    }

    pub fn with_ui_upstream(mut self, upstream: impl Into<String>) -> Self {
        self.ui_upstream = Some(upstream.into());
        self
    }

    pub fn with_ca_addr(mut self, addr: impl Into<String>) -> Self {
        self.ca_addr = Some(addr.into());
        self
    }

    pub fn routes(&self) -> &RouteTable {
        &self.routes
    }

    pub async fn generate(&self) -> ProxyResult<RouterConfig> {
        let tls = probe_internal_ca(self.ca_addr.as_deref()).await;
        self.build(tls)
    }

    fn build(&self, tls: TlsPolicy) -> ProxyResult<RouterConfig> {
        let mut app_routes = Vec::new();
        for web in self.routes.active_web_routes()? {
            app_routes.push(HttpRoute {
                id: format!("web:{}", web.deployment_id),
                path: web.path,
                strip_prefix: true,
                websocket: true,
                upstream: format!("{}:{}", web.upstream_host, web.upstream_port),
            });
        }

        let mut tcp = Vec::new();
        for route in self.routes.active_service_routes()? {
            let id = format!("svc:{}:{}", route.deployment_id, route.service_name);
            let upstream = format!("{}:{}", route.upstream_host, route.upstream_port);
            match (route.protocol, route.path, route.external_port) {
                (Protocol::Http, Some(path), _) => app_routes.push(HttpRoute {
                    id,
                    path,
                    strip_prefix: true,
                    websocket: false,
                    upstream,
                }),
                (Protocol::Tcp, _, Some(listen_port)) => tcp.push(TcpRoute {
                    id,
                    listen_port,
                    upstream,
                }),
                _ => {}
            }
        }

        app_routes.sort_by(|a, b| {
            b.path
                .len()
                .cmp(&a.path.len())
                .then_with(|| a.path.cmp(&b.path))
                .then_with(|| a.id.cmp(&b.id))
        });
        tcp.sort_by_key(|r| r.listen_port);

        let mut http = self.system_routes();
        http.extend(app_routes);
        if let Some(ui) = &self.ui_upstream {
            http.push(HttpRoute {
                id: "system:ui".to_string(),
                path: "/".to_string(),
                strip_prefix: false,
                websocket: false,
                upstream: ui.clone(),
            });
        }

        Ok(RouterConfig { http, tcp, tls })
    }

    fn system_routes(&self) -> Vec<HttpRoute> {
        [
            ("system:api", "/api", false),
            ("system:health", "/health", false),
            ("system:agent-ws", "/agent/ws", true),
        ]
        .into_iter()
        .map(|(id, path, websocket)| HttpRoute {
            id: id.to_string(),
            path: path.to_string(),
            strip_prefix: false,
            websocket,
            upstream: self.control_plane.clone(),
        })
        .collect()
    }
}
