//! Agent transport: JSON text frames over a WebSocket at `/agent/ws`.
//!
//! The first frame must be `auth` and must arrive within [`AUTH_TIMEOUT`].
//! After `auth:result{ok:true}` the socket pumps the channel's outbound
//! queue to the agent and hands every inbound frame to the channel.

use std::sync::atomic::Ordering;
use std::time::Duration;

use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use tracing::{debug, info, warn};

use fleetgrid_channel::{AgentMessage, CommandChannel, ControlMessage, authenticate};

use crate::control_plane::AppState;

pub const AUTH_TIMEOUT: Duration = Duration::from_secs(5);

pub async fn upgrade(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    if state.draining.load(Ordering::SeqCst) {
        return (StatusCode::SERVICE_UNAVAILABLE, "draining").into_response();
    }
    ws.on_upgrade(move |socket| serve_agent(state.channel, socket))
}

async fn serve_agent(channel: CommandChannel, mut socket: WebSocket) {
    let server_id = match await_auth(&channel, &mut socket).await {
        Ok(server_id) => server_id,
        Err(reason) => {
            debug!(%reason, "agent auth rejected");
            let rejection = ControlMessage::AuthResult {
                ok: false,
                message: Some(reason),
            };
            let _ = send_json(&mut socket, &rejection).await;
            let _ = socket.send(Message::Close(None)).await;
            return;
        }
    };

    let mut session = match channel.connect(&server_id).await {
        Ok(session) => session,
        Err(e) => {
            warn!(%server_id, error = %e, "failed to register agent connection");
            let _ = socket.send(Message::Close(None)).await;
            return;
        }
    };
    let accepted = ControlMessage::AuthResult {
        ok: true,
        message: None,
    };
    if let Err(e) = send_json(&mut socket, &accepted).await {
        debug!(%server_id, error = %e, "agent went away during auth");
        channel.disconnect(&server_id, session.conn_id).await;
        return;
    }

    loop {
        tokio::select! {
            outbound = session.outbound.recv() => match outbound {
                Some(message) => {
                    if let Err(e) = send_json(&mut socket, &message).await {
                        debug!(%server_id, error = %e, "write to agent failed");
                        break;
                    }
                }
                None => {
                    info!(%server_id, conn_id = session.conn_id, "connection closed by control plane");
                    let _ = socket.send(Message::Close(None)).await;
                    break;
                }
            },
            inbound = socket.recv() => match inbound {
                Some(Ok(Message::Text(text))) => {
                    match serde_json::from_str::<AgentMessage>(text.as_str()) {
                        Ok(message) => {
                            channel.handle_message(&server_id, session.conn_id, message).await;
                        }
                        Err(e) => warn!(%server_id, error = %e, "unparseable agent frame"),
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!(%server_id, error = %e, "agent socket error");
                    break;
                }
            },
        }
    }

    channel.disconnect(&server_id, session.conn_id).await;
}

/// Wait for the `auth` frame and verify it. Returns the server id.
async fn await_auth(channel: &CommandChannel, socket: &mut WebSocket) -> Result<String, String> {
    let frame = match tokio::time::timeout(AUTH_TIMEOUT, socket.recv()).await {
        Err(_) => return Err("authentication timeout".to_string()),
        Ok(None) | Ok(Some(Err(_))) => return Err("connection closed before auth".to_string()),
        Ok(Some(Ok(frame))) => frame,
    };
    let Message::Text(text) = frame else {
        return Err("first frame must be auth".to_string());
    };
    match serde_json::from_str::<AgentMessage>(text.as_str()) {
        Ok(AgentMessage::Auth {
            server_id,
            token,
            version,
        }) => {
            authenticate(channel.store(), &server_id, &token).map_err(|e| e.to_string())?;
            info!(%server_id, version = ?version, "agent authenticated");
            Ok(server_id)
        }
        Ok(_) => Err("first frame must be auth".to_string()),
        Err(e) => Err(format!("malformed auth frame: {e}")),
    }
}

async fn send_json(socket: &mut WebSocket, message: &ControlMessage) -> anyhow::Result<()> {
    let text = serde_json::to_string(message)?;
    socket.send(Message::Text(text.into())).await?;
    Ok(())
}
