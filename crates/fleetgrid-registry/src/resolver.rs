//! Dependency resolver: validates an app's requirements and resolves its
//! final configuration.
//!
//! Validation runs cycle detection over the catalog first (a DFS with an
//! explicit recursion stack) and stops there if a cycle is found. Only then
//! is each requirement checked against the live service registry.
//!
//! Resolution layers values in increasing precedence:
//!
//! ```text
//!   manifest defaults  <  inherit_from  <  injected  <  user values
//! ```

use std::collections::BTreeSet;
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use fleet_core::{AppCatalog, AppManifest, ConfigMap, Injection, Locality};
use fleetgrid_state::ServiceRecord;

use crate::error::{ResolveError, ResolveResult};
use crate::registry::{ServiceConnection, ServiceRegistry};

/// Outcome of [`DependencyResolver::validate`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ValidationReport {
    pub valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationReport {
    fn finish(mut self) -> Self {
        self.valid = self.errors.is_empty();
        self
    }
}

/// One app in a dependency tree.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DependencyNode {
    pub app: String,
    pub version: String,
    pub requires: Vec<RequirementNode>,
    /// Set when this app already appears higher up the path.
    pub cycle: bool,
}

/// One requirement edge of a [`DependencyNode`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RequirementNode {
    pub service: String,
    pub optional: bool,
    pub locality: Locality,
    /// Catalog apps that can provide the service.
    pub providers: Vec<DependencyNode>,
    /// Deployments currently registered for the service.
    pub deployed: Vec<ServiceRecord>,
}

#[derive(Clone)]
pub struct DependencyResolver {
    registry: ServiceRegistry,
    catalog: Arc<AppCatalog>,
}

impl DependencyResolver {
    pub fn new(registry: ServiceRegistry, catalog: Arc<AppCatalog>) -> Self {
        Self { registry, catalog }
    }

    pub fn registry(&self) -> &ServiceRegistry {
        &self.registry
    }

    pub fn catalog(&self) -> &AppCatalog {
        &self.catalog
    }

    /// Check that `manifest` can be installed on `target_server_id`.
    pub fn validate(
        &self,
        manifest: &AppManifest,
        target_server_id: &str,
    ) -> ResolveResult<ValidationReport> {
        let mut report = ValidationReport::default();

        if let Some(cycle) = self.find_cycle(manifest) {
            report
                .errors
                .push(format!("Circular dependency detected: {}", cycle.join(" -> ")));
            return Ok(report.finish());
        }

        let app = manifest.name();
        for req in &manifest.requires {
            let Some(provider) = self.registry.find_service(&req.service)? else {
                if req.optional {
                    report.warnings.push(format!(
                        "Optional service '{}' not found on any server",
                        req.service
                    ));
                } else {
                    report.errors.push(format!(
                        "Required service '{}' not found on any server",
                        req.service
                    ));
                }
                continue;
            };

            let local = if provider.server_id == target_server_id {
                Some(provider)
            } else {
                self.registry
                    .find_service_on_server(&req.service, target_server_id)?
            };
            match (req.locality, local) {
                (Locality::SameServer, None) => report.errors.push(format!(
                    "Service '{}' required by '{app}' must run on server '{target_server_id}'",
                    req.service
                )),
                (Locality::PreferSameServer, None) => report.warnings.push(format!(
                    "Service '{}' is not available on server '{target_server_id}'; \
                     '{app}' will connect to a remote provider",
                    req.service
                )),
                _ => {}
            }
        }

        debug!(
            %app,
            server_id = %target_server_id,
            errors = report.errors.len(),
            warnings = report.warnings.len(),
            "dependencies validated"
        );
        Ok(report.finish())
    }

    /// Produce the full configuration for installing `manifest` on
    /// `target_server_id`.
    pub fn resolve(
        &self,
        manifest: &AppManifest,
        target_server_id: &str,
        user_config: &ConfigMap,
    ) -> ResolveResult<ConfigMap> {
        let mut config = ConfigMap::new();

        for field in &manifest.config {
            if let Some(default) = &field.default {
                config.insert(field.name.clone(), default.clone());
            }
        }

        for field in &manifest.config {
            let Some(inherit) = &field.inherit_from else {
                continue;
            };
            let newest = self
                .registry
                .store()
                .list_deployments_for_app(&inherit.app)?
                .into_iter()
                .next();
            if let Some(source) = newest
                && let Some(value) = self.provider_value(&source.id, &source.config, &inherit.field)?
            {
                config.insert(field.name.clone(), value);
            }
        }

        for req in &manifest.requires {
            if req.inject.is_empty() {
                continue;
            }
            let prefer_local = req.locality != Locality::Any;
            let Some(conn) =
                self.registry
                    .get_connection(&req.service, target_server_id, prefer_local)?
            else {
                continue;
            };
            for (key, injection) in &req.inject {
                if let Some(value) = self.injected_value(&conn, injection)? {
                    config.insert(key.clone(), value);
                }
            }
        }

        for (key, value) in user_config {
            config.insert(key.clone(), value.clone());
        }

        Ok(config)
    }

    fn injected_value(
        &self,
        conn: &ServiceConnection,
        injection: &Injection,
    ) -> ResolveResult<Option<Value>> {
        Ok(match injection {
            Injection::Host => Some(Value::from(conn.host.clone())),
            Injection::Port => Some(Value::from(conn.port)),
            Injection::Address => Some(Value::from(format!("{}:{}", conn.host, conn.port))),
            Injection::Config { field } => {
                let provider_config = self
                    .registry
                    .store()
                    .get_deployment(&conn.deployment_id)?
                    .map(|d| d.config)
                    .unwrap_or_default();
                self.provider_value(&conn.deployment_id, &provider_config, field)?
            }
        })
    }

    /// A provider's field: its config first, then its secrets.
    fn provider_value(
        &self,
        deployment_id: &str,
        config: &ConfigMap,
        field: &str,
    ) -> ResolveResult<Option<Value>> {
        if let Some(value) = config.get(field) {
            return Ok(Some(value.clone()));
        }
        let secrets = self.registry.store().get_secrets(deployment_id)?;
        Ok(secrets.get(field).cloned().map(Value::from))
    }

    /// Deployed records of every provider of `service_name`.
    pub fn get_service_providers(&self, service_name: &str) -> ResolveResult<Vec<ServiceRecord>> {
        self.registry.providers(service_name)
    }

    /// Walk the catalog from `app_name` down through its requirements.
    pub fn get_dependency_tree(&self, app_name: &str) -> ResolveResult<DependencyNode> {
        let manifest = self
            .catalog
            .get(app_name)
            .ok_or_else(|| ResolveError::UnknownApp(app_name.to_string()))?;
        let mut path = Vec::new();
        self.tree_node(manifest, &mut path)
    }

    fn tree_node(
        &self,
        manifest: &AppManifest,
        path: &mut Vec<String>,
    ) -> ResolveResult<DependencyNode> {
        let name = manifest.name().to_string();
        if path.contains(&name) {
            return Ok(DependencyNode {
                app: name,
                version: manifest.app.version.clone(),
                requires: Vec::new(),
                cycle: true,
            });
        }

        path.push(name.clone());
        let mut requires = Vec::with_capacity(manifest.requires.len());
        for req in &manifest.requires {
            let mut providers = Vec::new();
            for provider in self.catalog.providers_of(&req.service) {
                providers.push(self.tree_node(provider, path)?);
            }
            requires.push(RequirementNode {
                service: req.service.clone(),
                optional: req.optional,
                locality: req.locality,
                providers,
                deployed: self.registry.providers(&req.service)?,
            });
        }
        path.pop();

        Ok(DependencyNode {
            app: name,
            version: manifest.app.version.clone(),
            requires,
            cycle: false,
        })
    }

    // ── Cycle detection ────────────────────────────────────────────

    /// Return the first cycle reachable from `root`, as a closed path.
    fn find_cycle(&self, root: &AppManifest) -> Option<Vec<String>> {
        let mut stack = Vec::new();
        let mut done = BTreeSet::new();
        self.visit(root, root, &mut stack, &mut done)
    }

    fn visit(
        &self,
        root: &AppManifest,
        app: &AppManifest,
        stack: &mut Vec<String>,
        done: &mut BTreeSet<String>,
    ) -> Option<Vec<String>> {
        let name = app.name();
        if let Some(pos) = stack.iter().position(|n| n == name) {
            let mut cycle = stack[pos..].to_vec();
            cycle.push(name.to_string());
            return Some(cycle);
        }
        if done.contains(name) {
            return None;
        }

        stack.push(name.to_string());
        for req in &app.requires {
            for provider in self.catalog_providers(root, &req.service) {
                if let Some(cycle) = self.visit(root, provider, stack, done) {
                    return Some(cycle);
                }
            }
        }
        stack.pop();
        done.insert(name.to_string());
        None
    }

    /// Catalog providers of a service, with the manifest under validation
    /// standing in for its own catalog entry.
    fn catalog_providers<'a>(
        &'a self,
        root: &'a AppManifest,
        service: &str,
    ) -> Vec<&'a AppManifest> {
        let mut providers: Vec<&AppManifest> = self
            .catalog
            .providers_of(service)
            .into_iter()
            .filter(|m| m.name() != root.name())
            .collect();
        if root.provides_service(service) {
            providers.push(root);
        }
        providers
    }
}
