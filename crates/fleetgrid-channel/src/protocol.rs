//! Control protocol between the control plane and agents.
//!
//! Messages are JSON objects tagged by `type`. Field names are camelCase on
//! the wire.
//!
//! ```text
//!   agent → server   auth, command:ack, command:result, status, pong
//!   server → agent   auth:result, command, status:request, ping
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use fleetgrid_state::{CommandAction, CommandId};

/// Window for an agent to acknowledge a command.
pub const ACK_TIMEOUT: Duration = Duration::from_secs(10);

/// Ceiling for an acknowledged command to report its result.
pub fn completion_timeout(action: CommandAction) -> Duration {
    match action {
        CommandAction::Install => Duration::from_secs(600),
        CommandAction::Uninstall => Duration::from_secs(300),
        CommandAction::Configure
        | CommandAction::Start
        | CommandAction::Stop
        | CommandAction::Restart => Duration::from_secs(120),
        CommandAction::StatusCheck => Duration::from_secs(30),
    }
}

/// Messages sent by an agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all_fields = "camelCase")]
pub enum AgentMessage {
    #[serde(rename = "auth")]
    Auth {
        server_id: String,
        token: String,
        #[serde(default)]
        version: Option<String>,
    },
    #[serde(rename = "command:ack")]
    CommandAck {
        command_id: CommandId,
        #[serde(default)]
        received_at: Option<u64>,
    },
    #[serde(rename = "command:result")]
    CommandResult {
        command_id: CommandId,
        status: ResultStatus,
        #[serde(default)]
        message: Option<String>,
    },
    #[serde(rename = "status")]
    Status {
        #[serde(default)]
        metrics: Option<Value>,
        #[serde(default)]
        apps: Vec<AppReport>,
    },
    #[serde(rename = "pong")]
    Pong,
}

/// Messages sent to an agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all_fields = "camelCase")]
pub enum ControlMessage {
    #[serde(rename = "auth:result")]
    AuthResult {
        ok: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    #[serde(rename = "command")]
    Command {
        id: CommandId,
        action: CommandAction,
        app_name: String,
        payload: Value,
    },
    #[serde(rename = "status:request")]
    StatusRequest,
    #[serde(rename = "ping")]
    Ping,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultStatus {
    Success,
    Failure,
}

/// One app's state as seen by the agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppReport {
    pub app_name: String,
    pub status: ReportedStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportedStatus {
    Running,
    Stopped,
    Error,
    #[serde(other)]
    Unknown,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn agent_messages_decode_from_wire_names() {
        let ack: AgentMessage =
            serde_json::from_value(json!({"type": "command:ack", "commandId": "c1", "receivedAt": 5}))
                .unwrap();
        assert_eq!(
            ack,
            AgentMessage::CommandAck {
                command_id: "c1".into(),
                received_at: Some(5)
            }
        );

        let result: AgentMessage = serde_json::from_value(json!({
            "type": "command:result",
            "commandId": "c1",
            "status": "failure",
            "message": "disk full"
        }))
        .unwrap();
        assert!(matches!(
            result,
            AgentMessage::CommandResult { status: ResultStatus::Failure, .. }
        ));

        let pong: AgentMessage = serde_json::from_value(json!({"type": "pong"})).unwrap();
        assert_eq!(pong, AgentMessage::Pong);
    }

    #[test]
    fn status_report_tolerates_unknown_app_states() {
        let status: AgentMessage = serde_json::from_value(json!({
            "type": "status",
            "metrics": {"cpu": 0.5},
            "apps": [
                {"appName": "grafana", "status": "running"},
                {"appName": "loki", "status": "restarting"}
            ]
        }))
        .unwrap();
        let AgentMessage::Status { apps, .. } = status else {
            panic!("expected status");
        };
        assert_eq!(apps[1].status, ReportedStatus::Unknown);
    }

    #[test]
    fn command_encodes_with_type_tag() {
        let msg = ControlMessage::Command {
            id: "c1".into(),
            action: CommandAction::StatusCheck,
            app_name: "grafana".into(),
            payload: json!({}),
        };
        let encoded = serde_json::to_value(&msg).unwrap();
        assert_eq!(encoded["type"], "command");
        assert_eq!(encoded["appName"], "grafana");
        assert_eq!(encoded["action"], "status_check");

        let ping = serde_json::to_value(ControlMessage::Ping).unwrap();
        assert_eq!(ping, json!({"type": "ping"}));
    }

    #[test]
    fn completion_ceilings() {
        assert_eq!(completion_timeout(CommandAction::Install), Duration::from_secs(600));
        assert_eq!(completion_timeout(CommandAction::Uninstall), Duration::from_secs(300));
        assert_eq!(completion_timeout(CommandAction::Restart), Duration::from_secs(120));
    }
}
