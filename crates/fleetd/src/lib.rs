//! fleetd: the Fleetgrid control plane daemon.
//!
//! Assembles the state store, app catalog, command channel, proxy
//! controller, deployer and deployment health monitor into one process and
//! serves agents over WebSocket.
//!
//! # HTTP surface
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | GET | `/agent/ws` | Agent control channel (WebSocket upgrade) |
//! | GET | `/health` | `200` while serving, `503` while draining |

pub mod agent_ws;
pub mod config;
pub mod control_plane;

pub use config::{FleetdConfig, LogFormat};
pub use control_plane::{AppState, ControlPlane};
