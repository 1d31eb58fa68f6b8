//! fleetgrid-deployer: deployment lifecycle orchestration.
//!
//! Composes the resolver, registry, route table, proxy controller and
//! command channel into the operator-facing operations.
//!
//! # Install saga
//!
//! ```text
//! Pending
//!   ├── agent connected? preconditions? dependencies? ── fail: no mutation
//!   └── persist row + secrets (one txn)          undo: purge row + secrets
//! Provisioned
//!   ├── render artifacts                         undo: discard artifacts
//!   └── install command, await result
//! AgentAcked                                     undo: uninstall on agent
//!   │                                            undo: reload proxy
//!   ├── register services + service routes       undo: unregister
//!   └── register web UI route                    undo: unregister
//! RoutesRegistered
//!   └── activate routes, push proxy config
//! Live
//! ```
//!
//! On failure the undo actions run bottom to top.

pub mod deployer;
pub mod error;
pub mod hooks;
pub mod render;
pub mod saga;
pub mod secrets;

pub use deployer::{Deployer, InstallRequest};
pub use error::{DeployError, DeployResult, ErrorKind};
pub use hooks::{AuditLog, ProxyHaCoordinator, TracingAuditLog};
pub use render::{ConfigRenderer, EnvFileRenderer, LifecycleScripts, RenderedArtifacts, RenderedFile};
pub use saga::{CompensationStack, InstallPhase, UnwindReport};
