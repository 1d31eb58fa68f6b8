//! Two-phase command dispatch.
//!
//! Every in-flight command lives in the pending arena, keyed by command id,
//! and owns its timer tasks. Exactly one of four events finishes it: a
//! result, an ack timeout, a completion timeout, or the server
//! disconnecting. Whichever handler removes the arena entry handles the
//! event; the others find nothing and return.
//!
//! ```text
//!   send ──► pending ──ack──► acknowledged ──result──► completed | failed
//!              │                    │
//!              └─ ack timeout       └─ completion timeout ──► timeout
//! ```

use std::time::Duration;

use serde_json::Value;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use fleetgrid_state::{
    CommandAction, CommandId, CommandRecord, CommandStatus, DeploymentStatus, ServerId, epoch_secs,
};

use crate::channel::{ChannelEvent, CommandChannel};
use crate::error::{ChannelError, ChannelResult, TimeoutPhase};
use crate::protocol::{ControlMessage, ResultStatus, completion_timeout};

/// What the agent reported for a finished command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutcome {
    pub command_id: CommandId,
    pub action: CommandAction,
    pub message: Option<String>,
}

type Waiter = oneshot::Sender<ChannelResult<CommandOutcome>>;

pub(crate) struct PendingCommand {
    server_id: ServerId,
    deployment_id: Option<String>,
    action: CommandAction,
    acknowledged: bool,
    ack_timer: Option<JoinHandle<()>>,
    completion_timer: Option<JoinHandle<()>>,
    waiter: Option<Waiter>,
}

impl PendingCommand {
    fn cancel_timers(&mut self) {
        if let Some(timer) = self.ack_timer.take() {
            timer.abort();
        }
        if let Some(timer) = self.completion_timer.take() {
            timer.abort();
        }
    }
}

/// Status a deployment takes when a command finishes.
///
/// `None` leaves the deployment to whoever issued the command.
pub fn derive_status(action: CommandAction, status: ResultStatus) -> Option<DeploymentStatus> {
    match (status, action) {
        (ResultStatus::Failure, _) => Some(DeploymentStatus::Error),
        (
            ResultStatus::Success,
            CommandAction::Install
            | CommandAction::Configure
            | CommandAction::Start
            | CommandAction::Restart,
        ) => Some(DeploymentStatus::Running),
        (ResultStatus::Success, CommandAction::Stop) => Some(DeploymentStatus::Stopped),
        (ResultStatus::Success, CommandAction::Uninstall | CommandAction::StatusCheck) => None,
    }
}

impl CommandChannel {
    fn pending(
        &self,
    ) -> std::sync::MutexGuard<'_, std::collections::HashMap<String, PendingCommand>> {
        self.inner
            .pending
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn take_pending(&self, command_id: &str) -> Option<PendingCommand> {
        self.pending().remove(command_id)
    }

    pub fn pending_count(&self) -> usize {
        self.pending().len()
    }

    /// Send a command and return once it is queued.
    ///
    /// The outcome arrives through the result path: the command log and the
    /// deployment status are updated when the agent reports back.
    pub async fn send_command(
        &self,
        server_id: &str,
        action: CommandAction,
        app_name: &str,
        deployment_id: Option<&str>,
        payload: Value,
    ) -> ChannelResult<CommandId> {
        self.dispatch(server_id, action, app_name, deployment_id, payload, None)
    }

    /// Send a command and wait for its outcome.
    ///
    /// A failure result, either timeout, or a disconnect surfaces as an
    /// error.
    pub async fn send_command_and_wait(
        &self,
        server_id: &str,
        action: CommandAction,
        app_name: &str,
        deployment_id: Option<&str>,
        payload: Value,
    ) -> ChannelResult<CommandOutcome> {
        let (tx, rx) = oneshot::channel();
        let command_id =
            self.dispatch(server_id, action, app_name, deployment_id, payload, Some(tx))?;
        match rx.await {
            Ok(outcome) => outcome,
            // The entry was dropped without a terminal event.
            Err(_) => Err(ChannelError::Disconnected {
                server_id: server_id.to_string(),
                command_id,
                action,
            }),
        }
    }

    fn dispatch(
        &self,
        server_id: &str,
        action: CommandAction,
        app_name: &str,
        deployment_id: Option<&str>,
        payload: Value,
        waiter: Option<Waiter>,
    ) -> ChannelResult<CommandId> {
        if !self.is_connected(server_id) {
            return Err(ChannelError::NotConnected(server_id.to_string()));
        }

        let command_id = Uuid::new_v4().to_string();
        self.inner.store.put_command(&CommandRecord {
            id: command_id.clone(),
            server_id: server_id.to_string(),
            deployment_id: deployment_id.map(str::to_string),
            action,
            status: CommandStatus::Pending,
            message: None,
            created_at: epoch_secs(),
            acknowledged_at: None,
            completed_at: None,
        })?;

        let ack_timer = self.spawn_timer(command_id.clone(), self.inner.config.ack_timeout, TimeoutPhase::Ack);
        self.pending().insert(
            command_id.clone(),
            PendingCommand {
                server_id: server_id.to_string(),
                deployment_id: deployment_id.map(str::to_string),
                action,
                acknowledged: false,
                ack_timer: Some(ack_timer),
                completion_timer: None,
                waiter,
            },
        );

        let message = ControlMessage::Command {
            id: command_id.clone(),
            action,
            app_name: app_name.to_string(),
            payload,
        };
        if !self.send_to(server_id, message) {
            if let Some(mut pending) = self.take_pending(&command_id) {
                pending.cancel_timers();
            }
            let _ = self.inner.store.update_command_status(
                &command_id,
                CommandStatus::Failed,
                Some("agent not connected".to_string()),
            );
            return Err(ChannelError::NotConnected(server_id.to_string()));
        }

        info!(%command_id, %server_id, %action, deployment_id = ?deployment_id, "command sent");
        Ok(command_id)
    }

    fn spawn_timer(&self, command_id: CommandId, after: Duration, phase: TimeoutPhase) -> JoinHandle<()> {
        let channel = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(after).await;
            channel.on_timeout(&command_id, phase).await;
        })
    }

    // ── Terminal events ────────────────────────────────────────────

    pub(crate) fn on_ack(&self, command_id: &str) {
        {
            let mut pending = self.pending();
            let Some(entry) = pending.get_mut(command_id) else {
                debug!(%command_id, "ack for unknown or finished command");
                return;
            };
            if entry.acknowledged {
                return;
            }
            entry.acknowledged = true;
            if let Some(timer) = entry.ack_timer.take() {
                timer.abort();
            }
            let ceiling = completion_timeout(entry.action);
            entry.completion_timer =
                Some(self.spawn_timer(command_id.to_string(), ceiling, TimeoutPhase::Completion));
        }

        if let Err(e) = self
            .inner
            .store
            .update_command_status(command_id, CommandStatus::Acknowledged, None)
        {
            warn!(%command_id, error = %e, "failed to record command ack");
        }
        debug!(%command_id, "command acknowledged");
    }

    pub(crate) async fn on_result(
        &self,
        command_id: &str,
        status: ResultStatus,
        message: Option<String>,
    ) {
        let Some(mut pending) = self.take_pending(command_id) else {
            warn!(%command_id, ?status, "result for unknown or finished command");
            return;
        };
        pending.cancel_timers();

        let log_status = match status {
            ResultStatus::Success => CommandStatus::Completed,
            ResultStatus::Failure => CommandStatus::Failed,
        };
        if let Err(e) =
            self.inner
                .store
                .update_command_status(command_id, log_status, message.clone())
        {
            warn!(%command_id, error = %e, "failed to record command result");
        }

        if let (Some(deployment_id), Some(next)) =
            (&pending.deployment_id, derive_status(pending.action, status))
        {
            let detail = match status {
                ResultStatus::Failure => message.clone(),
                ResultStatus::Success => None,
            };
            self.set_deployment_status(deployment_id, next, detail).await;
        }

        info!(%command_id, action = %pending.action, ?status, "command finished");
        let outcome = match status {
            ResultStatus::Success => Ok(CommandOutcome {
                command_id: command_id.to_string(),
                action: pending.action,
                message,
            }),
            ResultStatus::Failure => Err(ChannelError::CommandFailed {
                command_id: command_id.to_string(),
                action: pending.action,
                message: message.unwrap_or_else(|| "no message".to_string()),
            }),
        };
        self.finish(command_id, pending, log_status, outcome);
    }

    async fn on_timeout(&self, command_id: &str, phase: TimeoutPhase) {
        let Some(mut pending) = self.take_pending(command_id) else {
            return;
        };
        // Only the other timer may still be live; this one is running now.
        match phase {
            TimeoutPhase::Ack => drop(pending.ack_timer.take()),
            TimeoutPhase::Completion => drop(pending.completion_timer.take()),
        }
        pending.cancel_timers();

        let window = match phase {
            TimeoutPhase::Ack => self.inner.config.ack_timeout,
            TimeoutPhase::Completion => completion_timeout(pending.action),
        };
        let message = format!("no {phase} from agent within {}s", window.as_secs());
        warn!(%command_id, action = %pending.action, server_id = %pending.server_id, %phase, "command timed out");

        if let Err(e) = self.inner.store.update_command_status(
            command_id,
            CommandStatus::Timeout,
            Some(message.clone()),
        ) {
            warn!(%command_id, error = %e, "failed to record command timeout");
        }
        if let Some(deployment_id) = &pending.deployment_id {
            self.set_deployment_status(
                deployment_id,
                DeploymentStatus::Error,
                Some(format!("{} {message}", pending.action)),
            )
            .await;
        }

        let outcome = Err(ChannelError::Timeout {
            command_id: command_id.to_string(),
            action: pending.action,
            phase,
        });
        self.finish(command_id, pending, CommandStatus::Timeout, outcome);
    }

    /// Reject every pending command of a server that went away.
    /// Remove every pending command of `server_id` from the arena.
    ///
    /// Called under the server lock so a command sent on a later connection
    /// is never swept up with the old one.
    pub(crate) fn take_pending_for_server(&self, server_id: &str) -> Vec<(String, PendingCommand)> {
        let mut pending = self.pending();
        let ids: Vec<String> = pending
            .iter()
            .filter(|(_, p)| p.server_id == server_id)
            .map(|(id, _)| id.clone())
            .collect();
        ids.into_iter()
            .filter_map(|id| pending.remove(&id).map(|p| (id, p)))
            .collect()
    }

    /// Fail commands taken by [`Self::take_pending_for_server`].
    pub(crate) fn reject_disconnected(&self, server_id: &str, orphaned: Vec<(String, PendingCommand)>) {
        for (command_id, mut pending) in orphaned {
            pending.cancel_timers();
            if let Err(e) = self.inner.store.update_command_status(
                &command_id,
                CommandStatus::Failed,
                Some("agent disconnected".to_string()),
            ) {
                warn!(%command_id, error = %e, "failed to record command failure");
            }
            warn!(%command_id, %server_id, action = %pending.action, "command rejected by disconnect");
            let outcome = Err(ChannelError::Disconnected {
                server_id: server_id.to_string(),
                command_id: command_id.clone(),
                action: pending.action,
            });
            self.finish(&command_id, pending, CommandStatus::Failed, outcome);
        }
    }

    fn finish(
        &self,
        command_id: &str,
        mut pending: PendingCommand,
        status: CommandStatus,
        outcome: ChannelResult<CommandOutcome>,
    ) {
        if let Some(waiter) = pending.waiter.take() {
            // The caller may have stopped waiting.
            let _ = waiter.send(outcome);
        }
        self.emit(ChannelEvent::CommandFinished {
            command_id: command_id.to_string(),
            server_id: pending.server_id,
            deployment_id: pending.deployment_id,
            action: pending.action,
            status,
        });
    }

    async fn set_deployment_status(
        &self,
        deployment_id: &str,
        status: DeploymentStatus,
        message: Option<String>,
    ) {
        let store = &self.inner.store;
        self.inner
            .locks
            .with_deployment_lock(deployment_id, || async {
                match store.update_deployment_status(deployment_id, status, message) {
                    Ok(Some(_)) => debug!(%deployment_id, %status, "deployment status derived from command"),
                    Ok(None) => debug!(%deployment_id, "deployment gone before command finished"),
                    Err(e) => warn!(%deployment_id, error = %e, "failed to update deployment status"),
                }
            })
            .await;
    }
}
