use thiserror::Error;

use crate::ids::{CheckpointId, RunId};
use crate::model::{Phase, RunStatus};

/// Misconfiguration of the routing table, policy, or agent wiring.
///
/// Always fatal for the transition that hit it; never defaulted silently.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("no route for signal {signal} in phase {phase}")]
    UnmappedSignal { phase: Phase, signal: String },
    #[error("signal {signal} of phase {phase} is routed more than once")]
    DuplicateRoute { phase: Phase, signal: String },
    #[error("signal {signal} does not belong to phase {phase}")]
    SignalPhaseMismatch { phase: Phase, signal: String },
    #[error("route from {from} advances to {to}; only the next phase is allowed")]
    SkipAhead { from: Phase, to: Phase },
    #[error("route from {from} loops forward to {to}")]
    ForwardLoop { from: Phase, to: Phase },
    #[error("UNKNOWN signal of {0} must request a human decision")]
    UnknownMustAskHuman(Phase),
    #[error("human decision for {0} offers no options")]
    EmptyOptions(Phase),
    #[error("APPROVE offered at {0} without a gated action")]
    ApproveWithoutPending(Phase),
    #[error("{0} is not a work phase")]
    NotAWorkPhase(Phase),
    #[error("no agent registered for phase {0}")]
    MissingAgent(Phase),
    #[error("unknown {what} label: {label}")]
    UnknownLabel { what: &'static str, label: String },
    #[error("invalid policy: {0}")]
    InvalidPolicy(String),
}

/// The error taxonomy surfaced across the run-state boundary.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum FunnelError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("decision {decision} is not one of the offered options {options:?}")]
    InvalidDecision { decision: String, options: Vec<String> },
    #[error("checkpoint {0} is already resolved")]
    AlreadyResolved(CheckpointId),
    #[error("{what} {id} not found")]
    NotFound { what: &'static str, id: String },
    #[error("run {run_id} is terminal ({phase})")]
    TerminalState { run_id: RunId, phase: Phase },
    #[error("run {run_id} is {status}; phase execution requires RUNNING")]
    NotRunning { run_id: RunId, status: RunStatus },
    #[error("run {0} was cancelled")]
    Cancelled(RunId),
    #[error("storage failure: {0}")]
    Storage(String),
    #[error("inconsistent persisted state for run {run_id}: {detail}")]
    Inconsistent { run_id: RunId, detail: String },
}

impl FunnelError {
    pub fn run_not_found(run_id: &RunId) -> Self {
        FunnelError::NotFound { what: "run", id: run_id.to_string() }
    }

    pub fn checkpoint_not_found(id: &CheckpointId) -> Self {
        FunnelError::NotFound { what: "checkpoint", id: id.to_string() }
    }
}

pub type FunnelResult<T> = Result<T, FunnelError>;
