//! Secret generation and the split between config and secret fields.

use serde_json::Value;

use fleet_core::{AppManifest, ConfigMap, SecretKind};
use fleetgrid_state::SecretMap;

use crate::error::{DeployError, DeployResult};

const ALPHANUMERIC: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";

/// Generate a fresh secret value of `kind`.
pub fn generate(kind: SecretKind) -> DeployResult<String> {
    match kind {
        SecretKind::Password => alphanumeric(32),
        SecretKind::Token => alphanumeric(48),
        SecretKind::Hex => {
            let mut buf = [0u8; 32];
            getrandom::getrandom(&mut buf)
                .map_err(|e| DeployError::Render(format!("secret generation: {e}")))?;
            Ok(hex::encode(buf))
        }
    }
}

fn alphanumeric(len: usize) -> DeployResult<String> {
    // Rejection sampling keeps the distribution uniform over 62 symbols.
    let limit = u8::MAX - (u8::MAX % ALPHANUMERIC.len() as u8);
    let mut out = String::with_capacity(len);
    let mut buf = [0u8; 64];
    while out.len() < len {
        getrandom::getrandom(&mut buf)
            .map_err(|e| DeployError::Render(format!("secret generation: {e}")))?;
        for b in buf {
            if b < limit && out.len() < len {
                out.push(ALPHANUMERIC[(b as usize) % ALPHANUMERIC.len()] as char);
            }
        }
    }
    Ok(out)
}

/// Fill every generated field the resolved config left empty.
pub fn fill_generated(manifest: &AppManifest, config: &mut ConfigMap) -> DeployResult<()> {
    for field in &manifest.config {
        let Some(kind) = field.generated else {
            continue;
        };
        let missing = config
            .get(&field.name)
            .is_none_or(|v| v.is_null() || v.as_str() == Some(""));
        if missing {
            config.insert(field.name.clone(), Value::from(generate(kind)?));
        }
    }
    Ok(())
}

/// Move secret fields out of `config` into their own map.
pub fn split_secrets(manifest: &AppManifest, mut config: ConfigMap) -> (ConfigMap, SecretMap) {
    let mut secrets = SecretMap::new();
    for field in manifest.config.iter().filter(|f| f.is_secret()) {
        if let Some(value) = config.remove(&field.name) {
            let text = match value {
                Value::String(s) => s,
                other => other.to_string(),
            };
            secrets.insert(field.name.clone(), text);
        }
    }
    (config, secrets)
}

/// The inverse of [`split_secrets`]: one map with every field.
pub fn merge_secrets(config: &ConfigMap, secrets: &SecretMap) -> ConfigMap {
    let mut merged = config.clone();
    for (key, value) in secrets {
        merged.insert(key.clone(), Value::from(value.clone()));
    }
    merged
}

/// First required field with no value.
pub fn missing_required<'a>(manifest: &'a AppManifest, config: &ConfigMap) -> Option<&'a str> {
    manifest
        .config
        .iter()
        .filter(|f| f.required)
        .find(|f| config.get(&f.name).is_none_or(Value::is_null))
        .map(|f| f.name.as_str())
}
