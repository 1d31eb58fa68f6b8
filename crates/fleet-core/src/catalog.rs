//! App catalog: the set of installable app manifests.
//!
//! Loaded once at startup from a directory of `*.toml` manifests and
//! shared read-only across the control plane.

use std::collections::BTreeMap;
use std::path::Path;

use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::manifest::AppManifest;

#[derive(Debug, Clone, Default)]
pub struct AppCatalog {
    apps: BTreeMap<String, AppManifest>,
}

impl AppCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load every `*.toml` manifest directly under `dir`.
    ///
    /// Files that fail to parse are skipped with a warning so one broken
    /// manifest does not take the whole catalog down.
    pub fn load_dir(dir: &Path) -> anyhow::Result<Self> {
        let mut catalog = Self::new();
        for entry in WalkDir::new(dir).min_depth(1).max_depth(1).sort_by_file_name() {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("toml") {
                continue;
            }
            match AppManifest::from_file(path) {
                Ok(manifest) => {
                    debug!(app = %manifest.name(), ?path, "manifest loaded");
                    catalog.insert(manifest);
                }
                Err(e) => warn!(?path, error = %e, "skipping invalid manifest"),
            }
        }
        info!(apps = catalog.len(), ?dir, "app catalog loaded");
        Ok(catalog)
    }

    /// Insert or replace a manifest.
    pub fn insert(&mut self, manifest: AppManifest) {
        self.apps.insert(manifest.app.name.clone(), manifest);
    }

    pub fn get(&self, name: &str) -> Option<&AppManifest> {
        self.apps.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.apps.contains_key(name)
    }

    pub fn list(&self) -> impl Iterator<Item = &AppManifest> {
        self.apps.values()
    }

    pub fn len(&self) -> usize {
        self.apps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.apps.is_empty()
    }

    /// Apps that declare the given service in their `provides` list.
    pub fn providers_of(&self, service: &str) -> Vec<&AppManifest> {
        self.apps
            .values()
            .filter(|m| m.provides_service(service))
            .collect()
    }
}

impl FromIterator<AppManifest> for AppCatalog {
    fn from_iter<I: IntoIterator<Item = AppManifest>>(iter: I) -> Self {
        let mut catalog = Self::new();
        for manifest in iter {
            catalog.insert(manifest);
        }
        catalog
    }
}
