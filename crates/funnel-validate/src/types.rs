use funnel_core::{Checkpoint, PhaseArtifact, PivotBudget, ValidationRun};
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum AuditCategory {
    Structural,
    Lifecycle,
    Budget,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Warn,
    Fail,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Finding {
    pub rule_id: String,
    pub category: AuditCategory,
    pub severity: Severity,
    pub run_id: String,
    pub message: String,
}

/// Everything persisted about one run.
#[derive(Clone, Debug)]
pub struct RunAudit {
    pub run: ValidationRun,
    pub artifacts: Vec<PhaseArtifact>,
    pub checkpoints: Vec<Checkpoint>,
    /// Budget of the policy the run was started with, when known.
    pub max_pivots: Option<PivotBudget>,
}
