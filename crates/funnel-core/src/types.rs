use serde::{Deserialize, Serialize};

use crate::error::{FunnelError, FunnelResult};
use crate::ids::{CheckpointId, RunId};
use crate::model::*;
use crate::commands::Action;
use crate::payload::PhasePayload;
use crate::signal::Signal;

/// One entrepreneur's journey through the funnel.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ValidationRun {
    pub id: RunId,
    pub phase: Phase,
    pub status: RunStatus,
    /// Version the artifact of the current phase visit will carry.
    pub current_version: u32,
    pub pivot_count: u32,
    pub pivot_history: Vec<PivotRecord>,
    pub initial_context: String,
    pub request_token: Option<String>,
    pub policy_hash: String,
    pub terminal_reason: Option<String>,
    pub created_at_unix: i64,
    pub updated_at_unix: i64,
}

impl ValidationRun {
    pub fn new(initial_context: impl Into<String>, request_token: Option<String>, policy_hash: impl Into<String>, now_unix: i64) -> Self {
        Self {
            id: RunId::new(),
            phase: Phase::Onboarding,
            status: RunStatus::Running,
            current_version: 1,
            pivot_count: 0,
            pivot_history: vec![],
            initial_context: initial_context.into(),
            request_token,
            policy_hash: policy_hash.into(),
            terminal_reason: None,
            created_at_unix: now_unix,
            updated_at_unix: now_unix,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status == RunStatus::Terminal
    }

    pub fn ensure_not_terminal(&self) -> FunnelResult<()> {
        if self.is_terminal() {
            return Err(FunnelError::TerminalState { run_id: self.id.clone(), phase: self.phase });
        }
        Ok(())
    }

    /// Phase work may only start from RUNNING; anything else fails fast.
    pub fn ensure_running(&self) -> FunnelResult<()> {
        self.ensure_not_terminal()?;
        if self.status != RunStatus::Running {
            return Err(FunnelError::NotRunning { run_id: self.id.clone(), status: self.status });
        }
        Ok(())
    }

    fn set_status(&mut self, to: RunStatus) -> FunnelResult<()> {
        self.ensure_not_terminal()?;
        if !allowed_status_transitions(self.status).contains(&to) {
            return Err(FunnelError::Conflict(format!(
                "run {} cannot move from {} to {}",
                self.id, self.status, to
            )));
        }
        self.status = to;
        Ok(())
    }

    /// Enter `phase` at `version`. Entering a terminal phase ends the run.
    pub fn enter_phase(&mut self, phase: Phase, version: u32, now_unix: i64) -> FunnelResult<()> {
        if phase.is_terminal() {
            let outcome = if phase == Phase::Validated { Outcome::Validated } else { Outcome::Killed };
            return self.terminate(outcome, format!("advanced to {phase}"), now_unix);
        }
        self.set_status(RunStatus::Running)?;
        self.phase = phase;
        self.current_version = version;
        self.updated_at_unix = now_unix;
        Ok(())
    }

    pub fn record_pivot(&mut self, record: PivotRecord) {
        self.pivot_count += 1;
        self.pivot_history.push(record);
    }

    pub fn terminate(&mut self, outcome: Outcome, reason: impl Into<String>, now_unix: i64) -> FunnelResult<()> {
        self.set_status(RunStatus::Terminal)?;
        self.phase = outcome.phase();
        self.current_version = 0;
        self.terminal_reason = Some(reason.into());
        self.updated_at_unix = now_unix;
        Ok(())
    }

    pub fn suspend(&mut self, now_unix: i64) -> FunnelResult<()> {
        self.set_status(RunStatus::SuspendedForInput)?;
        self.updated_at_unix = now_unix;
        Ok(())
    }
}

/// Append-only record of a non-forward routing action.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct PivotRecord {
    pub from_phase: Phase,
    pub to_phase: Phase,
    pub pivot: PivotType,
    /// Signal or decision label that caused the pivot.
    pub trigger: String,
    pub origin: PivotOrigin,
    pub downgrade: bool,
    pub at_unix: i64,
}

/// Immutable output of one phase execution.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct PhaseArtifact {
    pub run_id: RunId,
    pub phase: Phase,
    pub version: u32,
    pub payload: PhasePayload,
    pub signal: Signal,
    pub created_at_unix: i64,
}

impl PhaseArtifact {
    /// Same content at the same coordinates; used for idempotent re-puts.
    pub fn same_content(&self, other: &PhaseArtifact) -> bool {
        self.run_id == other.run_id
            && self.phase == other.phase
            && self.version == other.version
            && self.payload == other.payload
            && self.signal == other.signal
    }
}

/// Suspension point awaiting an external decision.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Checkpoint {
    pub id: CheckpointId,
    pub run_id: RunId,
    pub phase: Phase,
    /// Version of the artifact whose routing raised this checkpoint.
    pub artifact_version: u32,
    pub kind: CheckpointKind,
    pub options: Vec<Decision>,
    pub presented_context: serde_json::Value,
    /// Action released by APPROVE on a gate.
    pub pending_action: Option<Action>,
    pub budget_exhausted: bool,
    pub resolved: bool,
    pub decision: Option<Decision>,
    pub decided_at_unix: Option<i64>,
    pub created_at_unix: i64,
}

impl Checkpoint {
    pub fn option_labels(&self) -> Vec<String> {
        self.options.iter().map(|d| d.label().to_string()).collect()
    }

    pub fn mark_resolved(&mut self, decision: Decision, now_unix: i64) {
        self.resolved = true;
        self.decision = Some(decision);
        self.decided_at_unix = Some(now_unix);
    }
}
