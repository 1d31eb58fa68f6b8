use std::fmt;

use fleetgrid_state::{CommandAction, StateError};

pub type ChannelResult<T> = Result<T, ChannelError>;

/// Which of a command's two windows expired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutPhase {
    Ack,
    Completion,
}

impl fmt::Display for TimeoutPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimeoutPhase::Ack => f.write_str("acknowledgment"),
            TimeoutPhase::Completion => f.write_str("completion"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("agent for server {0} is not connected")]
    NotConnected(String),

    #[error("agent for server {server_id} disconnected before {action} command {command_id} finished")]
    Disconnected {
        server_id: String,
        command_id: String,
        action: CommandAction,
    },

    #[error("{action} command {command_id} timed out waiting for {phase}")]
    Timeout {
        command_id: String,
        action: CommandAction,
        phase: TimeoutPhase,
    },

    #[error("{action} command {command_id} failed on agent: {message}")]
    CommandFailed {
        command_id: String,
        action: CommandAction,
        message: String,
    },

    #[error("authentication failed for server {0}")]
    AuthFailed(String),

    #[error("state error: {0}")]
    State(#[from] StateError),
}
