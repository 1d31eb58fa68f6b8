//! fleetgrid-registry: where services run and how apps get wired to them.
//!
//! The [`ServiceRegistry`] records every service a deployment provides and
//! answers locality-aware lookups. The [`DependencyResolver`] walks an app's
//! requirements against the catalog and the registry: it detects dependency
//! cycles, reports missing providers, and produces the final configuration
//! for an install.
//!
//! ```text
//!   AppManifest ──► DependencyResolver ──► ValidationReport
//!                         │                ConfigMap (resolved)
//!                         ▼
//!                   ServiceRegistry ──► StateStore (services table)
//! ```

pub mod error;
pub mod registry;
pub mod resolver;

pub use error::{ResolveError, ResolveResult};
pub use registry::{PortConflict, ServiceConnection, ServiceRegistry, LOOPBACK};
pub use resolver::{DependencyNode, DependencyResolver, RequirementNode, ValidationReport};
