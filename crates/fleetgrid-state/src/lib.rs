//! fleetgrid-state: embedded state store for Fleetgrid.
//!
//! Backed by [redb](https://docs.rs/redb), provides persistent and in-memory
//! state management for servers, deployments, secrets, services, routes,
//! and the agent command log.
//!
//! # Architecture
//!
//! All domain types are JSON-serialized into redb's `&[u8]` value columns.
//! Composite keys (`{deployment_id}:{service_name}`) enable prefix scans
//! for the records that belong to one deployment.
//!
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and can be shared across async tasks. Writes spanning several records go
//! through `StateStore::transaction` and commit atomically.

pub mod error;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use store::{StateStore, StoreTxn};
pub use types::*;
