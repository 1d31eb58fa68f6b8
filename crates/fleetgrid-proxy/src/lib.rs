//! fleetgrid-proxy: reverse-proxy control for the fleet.
//!
//! Deployments expose web UIs and services through a single HTTP(S) router.
//! This crate owns the persisted route table, turns it into a router config
//! document, and pushes that document to the router's admin API.
//!
//! # Components
//!
//! - **`routes`**: Web UI and service routes with path/port uniqueness
//! - **`config`**: Deterministic router config generation and hashing
//! - **`tls`**: TLS policy chosen by probing the internal CA
//! - **`sink`**: `ConfigSink` trait and the HTTP admin-API sink
//! - **`controller`**: Hash dedup, retry with jitter, circuit breaker,
//!   restore of the last known good config

pub mod config;
pub mod controller;
pub mod error;
pub mod routes;
pub mod sink;
pub mod tls;

pub use config::{ConfigGenerator, HttpRoute, RouterConfig, TcpRoute};
pub use controller::{CIRCUIT_THRESHOLD, ProxyController, RetryPolicy};
pub use error::{ProxyError, ProxyResult, PushError};
pub use routes::{RESERVED_PATHS, RouteSnapshot, RouteTable, Upstream};
pub use sink::{AdminApiSink, ConfigSink};
pub use tls::{TlsPolicy, probe_internal_ca};
