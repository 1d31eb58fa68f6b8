//! fleetd.toml configuration.
//!
//! Every field has a default, so an empty file (or no file) yields a
//! working single-host control plane. Durations are written as `"10s"`,
//! `"15m"`, `"500ms"` or `"1h"`.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use fleetgrid_channel::ChannelConfig;
use fleetgrid_health::MonitorConfig;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FleetdConfig {
    pub listen: SocketAddr,
    pub data_dir: PathBuf,
    /// Directory of app manifests (`*.toml`).
    pub catalog_dir: PathBuf,
    pub log_format: LogFormat,
    pub control_plane: ControlPlaneConfig,
    pub proxy: ProxyConfig,
    pub timers: TimerConfig,
    /// Servers seeded into the store at startup.
    #[serde(rename = "server")]
    pub servers: Vec<ServerSeed>,
}

impl Default for FleetdConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([0, 0, 0, 0], 8080)),
            data_dir: PathBuf::from("/var/lib/fleetd"),
            catalog_dir: PathBuf::from("/etc/fleetd/apps"),
            log_format: LogFormat::Text,
            control_plane: ControlPlaneConfig::default(),
            proxy: ProxyConfig::default(),
            timers: TimerConfig::default(),
            servers: Vec::new(),
        }
    }
}

impl FleetdConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("read config {}", path.display()))?;
        Self::parse(&content).with_context(|| format!("parse config {}", path.display()))
    }

    pub fn parse(content: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// The server whose mandatory apps may not be uninstalled.
    pub fn core_server_id(&self) -> &str {
        self.control_plane
            .core_server_id
            .as_deref()
            .unwrap_or(&self.control_plane.server_id)
    }

    pub fn channel_config(&self) -> ChannelConfig {
        ChannelConfig {
            ack_timeout: self.timers.ack_timeout,
            heartbeat_interval: self.timers.heartbeat_interval,
            heartbeat_timeout: self.timers.heartbeat_timeout,
        }
    }

    pub fn monitor_config(&self) -> MonitorConfig {
        MonitorConfig {
            interval: self.timers.reaper_interval,
            stuck_threshold: self.timers.reaper_threshold,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlPlaneConfig {
    /// Server id of the host running fleetd.
    pub server_id: String,
    /// Address other servers use to reach this host.
    pub host: String,
    /// Defaults to `server_id`.
    pub core_server_id: Option<String>,
}

impl Default for ControlPlaneConfig {
    fn default() -> Self {
        Self {
            server_id: "core".to_string(),
            host: "127.0.0.1".to_string(),
            core_server_id: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// host:port of the router admin API.
    pub admin_addr: String,
    pub admin_path: String,
    /// host:port the router forwards API, health and agent traffic to.
    pub control_plane_upstream: String,
    pub ui_upstream: Option<String>,
    /// host:port of the internal certificate authority.
    pub ca_addr: Option<String>,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            admin_addr: "127.0.0.1:2019".to_string(),
            admin_path: "/load".to_string(),
            control_plane_upstream: "127.0.0.1:8080".to_string(),
            ui_upstream: None,
            ca_addr: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimerConfig {
    #[serde(with = "duration_str")]
    pub ack_timeout: Duration,
    #[serde(with = "duration_str")]
    pub heartbeat_interval: Duration,
    #[serde(with = "duration_str")]
    pub heartbeat_timeout: Duration,
    #[serde(with = "duration_str")]
    pub reaper_interval: Duration,
    #[serde(with = "duration_str")]
    pub reaper_threshold: Duration,
}

impl Default for TimerConfig {
    fn default() -> Self {
        let channel = ChannelConfig::default();
        let monitor = MonitorConfig::default();
        Self {
            ack_timeout: channel.ack_timeout,
            heartbeat_interval: channel.heartbeat_interval,
            heartbeat_timeout: channel.heartbeat_timeout,
            reaper_interval: monitor.interval,
            reaper_threshold: monitor.stuck_threshold,
        }
    }
}

/// A managed server declared in the config file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSeed {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    pub host: String,
    /// SHA-256 hex digest of the agent token (`fleetd hash-token`).
    #[serde(default)]
    pub token_hash: Option<String>,
}

/// Parse `"500ms"`, `"10s"`, `"15m"`, `"1h"`. A bare number is seconds.
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    if let Some(ms) = s.strip_suffix("ms") {
        ms.trim().parse::<u64>().ok().map(Duration::from_millis)
    } else if let Some(secs) = s.strip_suffix('s') {
        secs.trim().parse::<u64>().ok().map(Duration::from_secs)
    } else if let Some(mins) = s.strip_suffix('m') {
        mins.trim().parse::<u64>().ok().map(|m| Duration::from_secs(m * 60))
    } else if let Some(hours) = s.strip_suffix('h') {
        hours.trim().parse::<u64>().ok().map(|h| Duration::from_secs(h * 3600))
    } else {
        s.parse::<u64>().ok().map(Duration::from_secs)
    }
}

pub fn format_duration(d: Duration) -> String {
    let millis = d.as_millis();
    if millis % 1000 != 0 {
        format!("{millis}ms")
    } else if d.as_secs() % 3600 == 0 && d.as_secs() > 0 {
        format!("{}h", d.as_secs() / 3600)
    } else if d.as_secs() % 60 == 0 && d.as_secs() > 0 {
        format!("{}m", d.as_secs() / 60)
    } else {
        format!("{}s", d.as_secs())
    }
}

mod duration_str {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer, de};

    pub fn serialize<S: Serializer>(d: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&super::format_duration(*d))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(deserializer)?;
        super::parse_duration(&raw)
            .ok_or_else(|| de::Error::custom(format!("invalid duration '{raw}'")))
    }
}
