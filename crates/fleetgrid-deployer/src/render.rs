//! Config rendering: turns a resolved deployment into files for the agent.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::debug;

use fleet_core::{AppManifest, ConfigMap};
use fleetgrid_state::{Deployment, SecretMap};

use crate::error::{DeployError, DeployResult};

/// One file the agent writes next to the app.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RenderedFile {
    pub path: String,
    /// Unix permission bits.
    pub mode: u32,
    pub contents: String,
}

/// Script names the agent runs for each lifecycle step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LifecycleScripts {
    pub install: String,
    pub start: String,
    pub stop: String,
    pub uninstall: String,
}

impl Default for LifecycleScripts {
    fn default() -> Self {
        Self {
            install: "install.sh".to_string(),
            start: "start.sh".to_string(),
            stop: "stop.sh".to_string(),
            uninstall: "uninstall.sh".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenderedArtifacts {
    pub files: Vec<RenderedFile>,
    pub scripts: LifecycleScripts,
}

impl RenderedArtifacts {
    /// Command payload for install and configure.
    pub fn payload(&self, deployment: &Deployment) -> Value {
        json!({
            "deploymentId": deployment.id,
            "version": deployment.version,
            "files": self.files,
            "scripts": self.scripts,
        })
    }

    /// Write every file under `dir` with its mode.
    pub fn write_to(&self, dir: &Path) -> std::io::Result<()> {
        std::fs::create_dir_all(dir)?;
        for file in &self.files {
            let path = dir.join(&file.path);
            std::fs::write(&path, &file.contents)?;
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                std::fs::set_permissions(&path, std::fs::Permissions::from_mode(file.mode))?;
            }
        }
        Ok(())
    }
}

/// Produces the artifacts an agent needs to run a deployment.
pub trait ConfigRenderer: Send + Sync {
    fn render(
        &self,
        deployment: &Deployment,
        manifest: &AppManifest,
        config: &ConfigMap,
        secrets: &SecretMap,
    ) -> DeployResult<RenderedArtifacts>;

    /// Drop anything kept for a deployment that no longer exists.
    fn discard(&self, _deployment_id: &str) -> DeployResult<()> {
        Ok(())
    }
}

/// Renders an `.env` file with every value and an `app.json` with the
/// non-secret config. Secrets appear only in the env file.
///
/// With an output directory, a copy is also kept under
/// `<dir>/<deployment id>/`.
#[derive(Debug, Clone, Default)]
pub struct EnvFileRenderer {
    output_dir: Option<PathBuf>,
}

impl EnvFileRenderer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.output_dir = Some(dir.into());
        self
    }
}

impl ConfigRenderer for EnvFileRenderer {
    fn render(
        &self,
        deployment: &Deployment,
        manifest: &AppManifest,
        config: &ConfigMap,
        secrets: &SecretMap,
    ) -> DeployResult<RenderedArtifacts> {
        let mut env = String::new();
        for (key, value) in config {
            let text = match value {
                Value::String(s) => s.clone(),
                Value::Null => String::new(),
                other => other.to_string(),
            };
            env.push_str(&env_line(key, &text));
        }
        for (key, value) in secrets {
            env.push_str(&env_line(key, value));
        }

        let app_json = json!({
            "app": manifest.name(),
            "version": deployment.version,
            "deploymentId": deployment.id,
            "serverId": deployment.server_id,
            "config": config,
        });
        let app_json = serde_json::to_string_pretty(&app_json)
            .map_err(|e| DeployError::Render(format!("app.json: {e}")))?;

        let artifacts = RenderedArtifacts {
            files: vec![
                RenderedFile {
                    path: ".env".to_string(),
                    mode: 0o600,
                    contents: env,
                },
                RenderedFile {
                    path: "app.json".to_string(),
                    mode: 0o644,
                    contents: app_json,
                },
            ],
            scripts: LifecycleScripts::default(),
        };

        if let Some(root) = &self.output_dir {
            let dir = root.join(&deployment.id);
            artifacts
                .write_to(&dir)
                .map_err(|e| DeployError::Render(format!("write {}: {e}", dir.display())))?;
            debug!(deployment_id = %deployment.id, dir = %dir.display(), "artifacts written");
        }
        Ok(artifacts)
    }

    fn discard(&self, deployment_id: &str) -> DeployResult<()> {
        let Some(root) = &self.output_dir else {
            return Ok(());
        };
        let dir = root.join(deployment_id);
        match std::fs::remove_dir_all(&dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(DeployError::Render(format!("remove {}: {e}", dir.display()))),
        }
    }
}

/// `KEY=value` with the key upper-cased and the value quoted when needed.
fn env_line(key: &str, value: &str) -> String {
    let key: String = key
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_uppercase() } else { '_' })
        .collect();
    let needs_quotes = value
        .chars()
        .any(|c| c.is_whitespace() || matches!(c, '"' | '\'' | '#' | '$' | '\\'));
    if needs_quotes {
        let escaped = value
            .replace('\\', "\\\\")
            .replace('"', "\\\"")
            .replace('$', "\\$")
            .replace('\n', "\\n");
        format!("{key}=\"{escaped}\"\n")
    } else {
        format!("{key}={value}\n")
    }
}
