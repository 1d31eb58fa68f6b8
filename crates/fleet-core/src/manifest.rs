//! App manifest (`<app>.toml`) parser.
//!
//! A manifest describes one installable application: the services it
//! provides, the services it requires from other apps, its configuration
//! fields, and an optional web UI exposed through the reverse proxy.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Resolved configuration for a deployment: field name → value.
pub type ConfigMap = BTreeMap<String, Value>;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AppManifest {
    pub app: AppInfo,
    #[serde(default)]
    pub provides: Vec<ServiceProvision>,
    #[serde(default)]
    pub requires: Vec<ServiceRequirement>,
    #[serde(default)]
    pub config: Vec<ConfigField>,
    pub web_ui: Option<WebUi>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AppInfo {
    pub name: String,
    pub version: String,
    pub description: Option<String>,
    /// At most one deployment of this app across the whole fleet.
    #[serde(default)]
    pub singleton: bool,
    /// Cannot be uninstalled from the core server.
    #[serde(default)]
    pub mandatory: bool,
    /// This app is the fleet's reverse proxy.
    #[serde(default)]
    pub proxy: bool,
    /// Apps that must not be installed on the same server.
    #[serde(default)]
    pub conflicts: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[default]
    Http,
    Tcp,
}

/// A named service this app exposes to other apps.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServiceProvision {
    pub name: String,
    pub port: u16,
    #[serde(default)]
    pub protocol: Protocol,
    /// Router path prefix for HTTP services (defaults to `/<name>`).
    pub path: Option<String>,
    /// Port the router listens on for TCP services.
    pub external_port: Option<u16>,
}

impl ServiceProvision {
    /// Router path for an HTTP service.
    pub fn route_path(&self) -> String {
        self.path
            .clone()
            .unwrap_or_else(|| format!("/{}", self.name))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Locality {
    #[default]
    Any,
    SameServer,
    PreferSameServer,
}

/// A service this app needs from another app.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServiceRequirement {
    pub service: String,
    #[serde(default)]
    pub optional: bool,
    #[serde(default)]
    pub locality: Locality,
    /// Config field → where its value comes from on the provider.
    #[serde(default)]
    pub inject: BTreeMap<String, Injection>,
}

/// Source of an injected config value.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "from", rename_all = "snake_case")]
pub enum Injection {
    Host,
    Port,
    /// `host:port`
    Address,
    /// A config or secret field of the provider deployment.
    Config { field: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecretKind {
    Password,
    Hex,
    Token,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConfigField {
    pub name: String,
    pub description: Option<String>,
    pub default: Option<Value>,
    /// Stored in the secrets table instead of the deployment row.
    #[serde(default)]
    pub secret: bool,
    /// Generate a value of this kind when the user supplies none.
    pub generated: Option<SecretKind>,
    /// Copy the value from the most recent deployment of another app.
    pub inherit_from: Option<InheritRef>,
    #[serde(default)]
    pub required: bool,
}

impl ConfigField {
    pub fn is_secret(&self) -> bool {
        self.secret || self.generated.is_some()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InheritRef {
    pub app: String,
    pub field: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WebUi {
    pub path: String,
    pub port: u16,
}

#[derive(Debug, thiserror::Error)]
pub enum ManifestError {
    #[error("app name must not be empty")]
    EmptyName,
    #[error("app '{app}' has invalid version '{version}': {reason}")]
    InvalidVersion {
        app: String,
        version: String,
        reason: String,
    },
    #[error("app '{app}' declares service '{service}' more than once")]
    DuplicateService { app: String, service: String },
    #[error("app '{app}' declares config field '{field}' more than once")]
    DuplicateField { app: String, field: String },
    #[error("app '{app}' web UI path must start with '/': {path}")]
    InvalidPath { app: String, path: String },
}

impl AppManifest {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Parse and validate a manifest from TOML text.
    pub fn parse(content: &str) -> anyhow::Result<Self> {
        let manifest: AppManifest = toml::from_str(content)?;
        manifest.validate()?;
        Ok(manifest)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn name(&self) -> &str {
        &self.app.name
    }

    pub fn validate(&self) -> Result<(), ManifestError> {
        let app = self.app.name.clone();
        if app.trim().is_empty() {
            return Err(ManifestError::EmptyName);
        }
        if let Err(e) = semver::Version::parse(&self.app.version) {
            return Err(ManifestError::InvalidVersion {
                app,
                version: self.app.version.clone(),
                reason: e.to_string(),
            });
        }

        let mut seen = std::collections::HashSet::new();
        for svc in &self.provides {
            if !seen.insert(svc.name.as_str()) {
                return Err(ManifestError::DuplicateService {
                    app,
                    service: svc.name.clone(),
                });
            }
        }

        let mut fields = std::collections::HashSet::new();
        for field in &self.config {
            if !fields.insert(field.name.as_str()) {
                return Err(ManifestError::DuplicateField {
                    app,
                    field: field.name.clone(),
                });
            }
        }

        if let Some(ui) = &self.web_ui {
            if !ui.path.starts_with('/') {
                return Err(ManifestError::InvalidPath {
                    app,
                    path: ui.path.clone(),
                });
            }
        }
        Ok(())
    }

    /// Whether this app provides the named service.
    pub fn provides_service(&self, service: &str) -> bool {
        self.provides.iter().any(|p| p.name == service)
    }

    pub fn field(&self, name: &str) -> Option<&ConfigField> {
        self.config.iter().find(|f| f.name == name)
    }

    /// Scaffold a minimal manifest with no services or config.
    pub fn scaffold(name: &str, version: &str) -> Self {
        AppManifest {
            app: AppInfo {
                name: name.to_string(),
                version: version.to_string(),
                description: None,
                singleton: false,
                mandatory: false,
                proxy: false,
                conflicts: Vec::new(),
            },
            provides: Vec::new(),
            requires: Vec::new(),
            config: Vec::new(),
            web_ui: None,
        }
    }
}
