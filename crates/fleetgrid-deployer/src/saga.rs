//! Compensation stack for multi-step deployment operations.
//!
//! Each step that mutates something pushes the action that undoes it. On
//! failure the stack unwinds last-added-first. Every compensation runs even
//! when an earlier one fails; failures are logged and reported, never
//! raised.

use std::fmt;
use std::future::Future;
use std::pin::Pin;

use tracing::{debug, error, info};

use crate::error::DeployResult;

type CompensationFuture = Pin<Box<dyn Future<Output = DeployResult<()>> + Send>>;
type Compensation = Box<dyn FnOnce() -> CompensationFuture + Send>;

/// How far an install got before it finished or failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum InstallPhase {
    Pending,
    /// Deployment row and secrets persisted.
    Provisioned,
    /// The agent reported the install done.
    AgentAcked,
    RoutesRegistered,
    Live,
}

impl fmt::Display for InstallPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            InstallPhase::Pending => "pending",
            InstallPhase::Provisioned => "provisioned",
            InstallPhase::AgentAcked => "agent_acked",
            InstallPhase::RoutesRegistered => "routes_registered",
            InstallPhase::Live => "live",
        };
        f.write_str(s)
    }
}

/// What an unwind did.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct UnwindReport {
    /// Labels in the order they ran.
    pub ran: Vec<String>,
    /// Labels that failed, with the error text.
    pub failed: Vec<(String, String)>,
}

pub struct CompensationStack {
    saga: String,
    phase: InstallPhase,
    steps: Vec<(String, Compensation)>,
}

impl CompensationStack {
    pub fn new(saga: impl Into<String>) -> Self {
        Self {
            saga: saga.into(),
            phase: InstallPhase::Pending,
            steps: Vec::new(),
        }
    }

    /// Register the undo action for a step that just succeeded.
    pub fn push<F, Fut>(&mut self, label: impl Into<String>, undo: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = DeployResult<()>> + Send + 'static,
    {
        let label = label.into();
        debug!(saga = %self.saga, %label, "compensation registered");
        let undo: Compensation = Box::new(move || Box::pin(undo()) as CompensationFuture);
        self.steps.push((label, undo));
    }

    pub fn advance(&mut self, phase: InstallPhase) {
        debug!(saga = %self.saga, from = %self.phase, to = %phase, "saga advanced");
        self.phase = phase;
    }

    pub fn phase(&self) -> InstallPhase {
        self.phase
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// The operation succeeded; drop every compensation.
    pub fn commit(self) {
        info!(saga = %self.saga, phase = %self.phase, "saga committed");
    }

    /// Run every compensation, newest first.
    pub async fn unwind(mut self) -> UnwindReport {
        let mut report = UnwindReport::default();
        info!(
            saga = %self.saga,
            phase = %self.phase,
            steps = self.steps.len(),
            "unwinding saga"
        );
        while let Some((label, undo)) = self.steps.pop() {
            match undo().await {
                Ok(()) => debug!(saga = %self.saga, %label, "compensation done"),
                Err(e) => {
                    error!(saga = %self.saga, %label, error = %e, "compensation failed");
                    report.failed.push((label.clone(), e.to_string()));
                }
            }
            report.ran.push(label);
        }
        report
    }
}
