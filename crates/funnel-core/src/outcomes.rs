use serde::{Deserialize, Serialize};

use crate::commands::{Action, Target};
use crate::ids::CheckpointId;
use crate::model::*;
use crate::signal::Signal;

/// Output of `route`. Not persisted on its own; pivots are logged in the run history.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct RouteDecision {
    pub from_phase: Phase,
    pub signal: Signal,
    pub action: Action,
    /// Action an APPROVE releases when the phase gates success.
    pub gated: Option<Action>,
    /// The table asked for a pivot but the budget was already spent.
    pub budget_exhausted: bool,
}

impl RouteDecision {
    pub fn target(&self) -> Target {
        self.action.target()
    }

    pub fn pivot_type(&self) -> Option<PivotType> {
        self.action.pivot_type()
    }
}

/// Next executable step for a run, derived from persisted state only.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "plan", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResumePlan {
    /// No artifact exists at the current version: run the phase.
    ExecutePhase { phase: Phase, version: u32 },
    /// The artifact was written but the process stopped before routing it.
    RouteArtifact { phase: Phase, version: u32 },
    /// Waiting on a human; nothing to execute.
    AwaitDecision { checkpoint_id: CheckpointId },
    Finished { phase: Phase },
}
