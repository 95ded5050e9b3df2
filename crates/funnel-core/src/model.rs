use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Stage of the validation funnel. `Validated` and `Killed` are terminal.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Phase {
    Onboarding,
    Discovery,
    Desirability,
    Feasibility,
    Viability,
    Validated,
    Killed,
}

impl Phase {
    /// Work phases in funnel order.
    pub const WORK: [Phase; 5] = [
        Phase::Onboarding,
        Phase::Discovery,
        Phase::Desirability,
        Phase::Feasibility,
        Phase::Viability,
    ];

    pub fn is_terminal(self) -> bool {
        matches!(self, Phase::Validated | Phase::Killed)
    }

    /// Position in the funnel. Terminal phases share the last slot.
    pub fn ordinal(self) -> u8 {
        match self {
            Phase::Onboarding => 0,
            Phase::Discovery => 1,
            Phase::Desirability => 2,
            Phase::Feasibility => 3,
            Phase::Viability => 4,
            Phase::Validated | Phase::Killed => 5,
        }
    }

    /// The only phase an ADVANCE may move to. Phases are strictly linear.
    pub fn next(self) -> Option<Phase> {
        match self {
            Phase::Onboarding => Some(Phase::Discovery),
            Phase::Discovery => Some(Phase::Desirability),
            Phase::Desirability => Some(Phase::Feasibility),
            Phase::Feasibility => Some(Phase::Viability),
            Phase::Viability => Some(Phase::Validated),
            Phase::Validated | Phase::Killed => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Onboarding => "ONBOARDING",
            Phase::Discovery => "DISCOVERY",
            Phase::Desirability => "DESIRABILITY",
            Phase::Feasibility => "FEASIBILITY",
            Phase::Viability => "VIABILITY",
            Phase::Validated => "VALIDATED",
            Phase::Killed => "KILLED",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Phase {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "ONBOARDING" => Ok(Phase::Onboarding),
            "DISCOVERY" => Ok(Phase::Discovery),
            "DESIRABILITY" => Ok(Phase::Desirability),
            "FEASIBILITY" => Ok(Phase::Feasibility),
            "VIABILITY" => Ok(Phase::Viability),
            "VALIDATED" => Ok(Phase::Validated),
            "KILLED" => Ok(Phase::Killed),
            other => Err(ConfigError::UnknownLabel {
                what: "phase",
                label: other.to_string(),
            }),
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Running,
    SuspendedForInput,
    Terminal,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Running => "RUNNING",
            RunStatus::SuspendedForInput => "SUSPENDED_FOR_INPUT",
            RunStatus::Terminal => "TERMINAL",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "RUNNING" => Ok(RunStatus::Running),
            "SUSPENDED_FOR_INPUT" => Ok(RunStatus::SuspendedForInput),
            "TERMINAL" => Ok(RunStatus::Terminal),
            other => Err(ConfigError::UnknownLabel {
                what: "run status",
                label: other.to_string(),
            }),
        }
    }
}

/// Status changes the run lifecycle permits. Terminal is absorbing.
pub fn allowed_status_transitions(from: RunStatus) -> &'static [RunStatus] {
    use RunStatus::*;
    match from {
        Running => &[Running, SuspendedForInput, Terminal],
        SuspendedForInput => &[Running, Terminal],
        Terminal => &[],
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CheckpointKind {
    GateApproval,
    StrategicDecision,
}

impl CheckpointKind {
    pub fn as_str(self) -> &'static str {
        match self {
            CheckpointKind::GateApproval => "GATE_APPROVAL",
            CheckpointKind::StrategicDecision => "STRATEGIC_DECISION",
        }
    }
}

impl FromStr for CheckpointKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "GATE_APPROVAL" => Ok(CheckpointKind::GateApproval),
            "STRATEGIC_DECISION" => Ok(CheckpointKind::StrategicDecision),
            other => Err(ConfigError::UnknownLabel {
                what: "checkpoint kind",
                label: other.to_string(),
            }),
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PivotType {
    SegmentPivot,
    ValuePivot,
    FeaturePivot,
    PricePivot,
    CostPivot,
    ModelPivot,
    Retry,
}

impl PivotType {
    pub const ALL: [PivotType; 7] = [
        PivotType::SegmentPivot,
        PivotType::ValuePivot,
        PivotType::FeaturePivot,
        PivotType::PricePivot,
        PivotType::CostPivot,
        PivotType::ModelPivot,
        PivotType::Retry,
    ];

    /// Phase re-entered when a human picks this pivot. `Retry` re-enters `from`.
    pub fn reentry_phase(self, from: Phase) -> Phase {
        match self {
            PivotType::SegmentPivot | PivotType::ModelPivot => Phase::Discovery,
            PivotType::ValuePivot | PivotType::FeaturePivot | PivotType::PricePivot => Phase::Desirability,
            PivotType::CostPivot => Phase::Feasibility,
            PivotType::Retry => from,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PivotType::SegmentPivot => "SEGMENT_PIVOT",
            PivotType::ValuePivot => "VALUE_PIVOT",
            PivotType::FeaturePivot => "FEATURE_PIVOT",
            PivotType::PricePivot => "PRICE_PIVOT",
            PivotType::CostPivot => "COST_PIVOT",
            PivotType::ModelPivot => "MODEL_PIVOT",
            PivotType::Retry => "RETRY",
        }
    }
}

impl fmt::Display for PivotType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal outcome of a run.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Outcome {
    Validated,
    Killed,
}

impl Outcome {
    pub fn phase(self) -> Phase {
        match self {
            Outcome::Validated => Phase::Validated,
            Outcome::Killed => Phase::Killed,
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PivotOrigin {
    Router,
    Human,
}

/// A label an external decider may pick at a checkpoint.
///
/// Serialized as its label (`"APPROVE"`, `"COST_PIVOT"`, ...).
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(into = "String", try_from = "String")]
pub enum Decision {
    Approve,
    ContinueAnyway,
    Kill,
    Pivot(PivotType),
}

impl Decision {
    pub const RETRY: Decision = Decision::Pivot(PivotType::Retry);

    pub fn label(self) -> &'static str {
        match self {
            Decision::Approve => "APPROVE",
            Decision::ContinueAnyway => "CONTINUE_ANYWAY",
            Decision::Kill => "KILL",
            Decision::Pivot(p) => p.as_str(),
        }
    }

    /// Whether choosing this label consumes pivot budget.
    pub fn is_pivot(self) -> bool {
        matches!(self, Decision::Pivot(_))
    }

    pub fn parse(label: &str) -> Option<Decision> {
        match label.trim().to_ascii_uppercase().as_str() {
            "APPROVE" => Some(Decision::Approve),
            "CONTINUE_ANYWAY" => Some(Decision::ContinueAnyway),
            "KILL" => Some(Decision::Kill),
            other => PivotType::ALL
                .iter()
                .find(|p| p.as_str() == other)
                .map(|p| Decision::Pivot(*p)),
        }
    }
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl From<Decision> for String {
    fn from(d: Decision) -> Self {
        d.label().to_string()
    }
}

impl TryFrom<String> for Decision {
    type Error = ConfigError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Decision::parse(&s).ok_or(ConfigError::UnknownLabel { what: "decision", label: s })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phases_advance_linearly() {
        let mut seen = vec![Phase::Onboarding];
        let mut p = Phase::Onboarding;
        while let Some(n) = p.next() {
            assert!(n.ordinal() == p.ordinal() + 1);
            seen.push(n);
            p = n;
        }
        assert_eq!(p, Phase::Validated);
        assert_eq!(seen.len(), 6);
        assert_eq!(Phase::Killed.next(), None);
    }

    #[test]
    fn terminal_status_is_absorbing() {
        assert!(allowed_status_transitions(RunStatus::Terminal).is_empty());
        assert!(allowed_status_transitions(RunStatus::SuspendedForInput).contains(&RunStatus::Running));
    }

    #[test]
    fn decision_labels_round_trip() {
        assert_eq!(Decision::parse("cost_pivot"), Some(Decision::Pivot(PivotType::CostPivot)));
        assert_eq!(Decision::parse("RETRY"), Some(Decision::RETRY));
        assert_eq!(Decision::parse("MAYBE"), None);
        let json = serde_json::to_string(&Decision::ContinueAnyway).unwrap();
        assert_eq!(json, "\"CONTINUE_ANYWAY\"");
    }

    #[test]
    fn pivot_reentry_targets() {
        assert_eq!(PivotType::CostPivot.reentry_phase(Phase::Viability), Phase::Feasibility);
        assert_eq!(PivotType::Retry.reentry_phase(Phase::Viability), Phase::Viability);
        assert_eq!(PivotType::SegmentPivot.reentry_phase(Phase::Desirability), Phase::Discovery);
    }
}
