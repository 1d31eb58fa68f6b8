//! fleetgrid-channel: command channel between the control plane and agents.
//!
//! Each server runs an agent that holds one authenticated connection to the
//! control plane. Commands travel down that connection and are tracked
//! through two windows: the agent must acknowledge within the ack window,
//! then report a result within a per-action completion window.
//!
//! # Architecture
//!
//! ```text
//! transport (WebSocket)
//!   ├── auth::authenticate ── token hash check against the server record
//!   └── CommandChannel
//!       ├── connections: server → live connection (one per server)
//!       │   ├── outbound queue → AgentSession
//!       │   └── heartbeat task (ping, drop when silent)
//!       ├── pending: command id → timers + waiter
//!       │   ├── ack timer        → Timeout, deployment Error
//!       │   ├── completion timer → Timeout, deployment Error
//!       │   └── result           → Completed | Failed, status derived
//!       └── events (broadcast ChannelEvent)
//! ```

pub mod auth;
pub mod channel;
pub mod dispatch;
pub mod error;
pub mod protocol;

pub use auth::{authenticate, hash_token};
pub use channel::{AgentSession, ChannelConfig, ChannelEvent, CommandChannel};
pub use dispatch::{CommandOutcome, derive_status};
pub use error::{ChannelError, ChannelResult, TimeoutPhase};
pub use protocol::{
    ACK_TIMEOUT, AgentMessage, AppReport, ControlMessage, ReportedStatus, ResultStatus,
    completion_timeout,
};
