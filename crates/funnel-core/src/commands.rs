use serde::{Deserialize, Serialize};

use crate::model::*;

/// What the shell must do after a phase has been classified.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "action", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Action {
    Advance { next: Phase },
    LoopBack { target: Phase, pivot: PivotType },
    DowngradeAndRetest { target: Phase, pivot: PivotType },
    RequestHumanDecision { kind: CheckpointKind, options: Vec<Decision> },
    Terminate { outcome: Outcome },
}

/// Where an action leads.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Target {
    Phase(Phase),
    Terminal(Outcome),
    AwaitDecision,
}

impl Action {
    pub fn target(&self) -> Target {
        match self {
            Action::Advance { next } if next.is_terminal() => Target::Terminal(Outcome::Validated),
            Action::Advance { next } => Target::Phase(*next),
            Action::LoopBack { target, .. } | Action::DowngradeAndRetest { target, .. } => Target::Phase(*target),
            Action::RequestHumanDecision { .. } => Target::AwaitDecision,
            Action::Terminate { outcome } => Target::Terminal(*outcome),
        }
    }

    pub fn pivot_type(&self) -> Option<PivotType> {
        match self {
            Action::LoopBack { pivot, .. } | Action::DowngradeAndRetest { pivot, .. } => Some(*pivot),
            _ => None,
        }
    }

    /// LOOP_BACK and DOWNGRADE_AND_RETEST consume pivot budget.
    pub fn is_pivot(&self) -> bool {
        self.pivot_type().is_some()
    }

    pub fn name(&self) -> &'static str {
        match self {
            Action::Advance { .. } => "ADVANCE",
            Action::LoopBack { .. } => "LOOP_BACK",
            Action::DowngradeAndRetest { .. } => "DOWNGRADE_AND_RETEST",
            Action::RequestHumanDecision { .. } => "REQUEST_HUMAN_DECISION",
            Action::Terminate { .. } => "TERMINATE",
        }
    }
}
