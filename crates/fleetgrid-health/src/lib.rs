//! fleetgrid-health: reconciliation of deployments left mid-operation.
//!
//! Install, configure and uninstall move a deployment through a transient
//! status. If the saga or the agent never finishes, nothing else moves it
//! out again. The monitor scans on a fixed interval and fails those
//! deployments.
//!
//! # Architecture
//!
//! ```text
//! DeploymentHealthMonitor (every 60s)
//!   └── for each deployment in installing | configuring | uninstalling
//!       └── idle longer than 15m?
//!           ├── deployment → error ("stuck in <status> for N minutes")
//!           └── its unfinished command rows → timeout
//! ```

pub mod monitor;

pub use monitor::{DeploymentHealthMonitor, MonitorConfig, ReapedDeployment};
