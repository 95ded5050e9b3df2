use std::fmt;

use serde::{Deserialize, Serialize};

use crate::commands::Action;
use crate::error::{ConfigError, FunnelError, FunnelResult};
use crate::model::*;
use crate::outcomes::RouteDecision;
use crate::signal::*;
use crate::types::{Checkpoint, ValidationRun};

/// Cap on LOOP_BACK / DOWNGRADE actions per run. There is no default; a
/// policy must state one (`unbounded` is an explicit choice).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "BudgetRepr", into = "BudgetRepr")]
pub enum PivotBudget {
    Capped(u32),
    Unbounded,
}

impl PivotBudget {
    pub fn exhausted(self, pivot_count: u32) -> bool {
        match self {
            PivotBudget::Capped(max) => pivot_count >= max,
            PivotBudget::Unbounded => false,
        }
    }
}

impl fmt::Display for PivotBudget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PivotBudget::Capped(n) => write!(f, "{n}"),
            PivotBudget::Unbounded => f.write_str("unbounded"),
        }
    }
}

/// Wire form of `PivotBudget`: a count or the word `unbounded`.
#[doc(hidden)]
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(untagged)]
pub enum BudgetRepr {
    Count(u32),
    Word(String),
}

impl TryFrom<BudgetRepr> for PivotBudget {
    type Error = ConfigError;

    fn try_from(r: BudgetRepr) -> Result<Self, Self::Error> {
        match r {
            BudgetRepr::Count(n) => Ok(PivotBudget::Capped(n)),
            BudgetRepr::Word(w) if w.eq_ignore_ascii_case("unbounded") => Ok(PivotBudget::Unbounded),
            BudgetRepr::Word(w) => Err(ConfigError::InvalidPolicy(format!("max_pivots must be a count or `unbounded`, got {w}"))),
        }
    }
}

impl From<PivotBudget> for BudgetRepr {
    fn from(b: PivotBudget) -> Self {
        match b {
            PivotBudget::Capped(n) => BudgetRepr::Count(n),
            PivotBudget::Unbounded => BudgetRepr::Word("unbounded".into()),
        }
    }
}

/// Per-phase knobs.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhasePolicy {
    pub phase: Phase,
    /// Route ADVANCE through an approval gate.
    #[serde(default)]
    pub gate_required_even_on_success: bool,
    /// Extra agent attempts after the first one fails transiently.
    pub retry_limit: u32,
    /// Wall-clock budget handed to the agent per attempt.
    pub time_budget_secs: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteRule {
    pub signal: Signal,
    pub action: Action,
}

/// Total mapping from every signal value to an action.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingTable {
    pub rules: Vec<RouteRule>,
}

impl RoutingTable {
    pub fn standard() -> Self {
        use Action::*;
        let unknown_options = vec![Decision::RETRY, Decision::ContinueAnyway, Decision::Kill];
        let ask = |options: Vec<Decision>| RequestHumanDecision { kind: CheckpointKind::StrategicDecision, options };
        let rule = |signal, action| RouteRule { signal, action };

        let mut rules = vec![
            rule(Signal::Onboarding(OnboardingSignal::Complete), Advance { next: Phase::Discovery }),
            rule(Signal::Onboarding(OnboardingSignal::Incomplete), ask(vec![Decision::RETRY, Decision::Kill])),
            rule(Signal::Discovery(DiscoverySignal::StrongFit), Advance { next: Phase::Desirability }),
            rule(
                Signal::Discovery(DiscoverySignal::WeakFit),
                LoopBack { target: Phase::Discovery, pivot: PivotType::SegmentPivot },
            ),
            rule(
                Signal::Discovery(DiscoverySignal::NoFit),
                ask(vec![Decision::Pivot(PivotType::SegmentPivot), Decision::Kill]),
            ),
            rule(Signal::Desirability(DesirabilitySignal::StrongCommitment), Advance { next: Phase::Feasibility }),
            rule(
                Signal::Desirability(DesirabilitySignal::WeakInterest),
                LoopBack { target: Phase::Desirability, pivot: PivotType::ValuePivot },
            ),
            rule(
                Signal::Desirability(DesirabilitySignal::NoInterest),
                LoopBack { target: Phase::Discovery, pivot: PivotType::SegmentPivot },
            ),
            rule(Signal::Feasibility(FeasibilitySignal::GreenFeasible), Advance { next: Phase::Viability }),
            rule(
                Signal::Feasibility(FeasibilitySignal::OrangeConstrained),
                DowngradeAndRetest { target: Phase::Desirability, pivot: PivotType::FeaturePivot },
            ),
            rule(Signal::Feasibility(FeasibilitySignal::RedImpossible), Terminate { outcome: Outcome::Killed }),
            rule(Signal::Viability(ViabilitySignal::Profitable), Advance { next: Phase::Validated }),
            rule(
                Signal::Viability(ViabilitySignal::Marginal),
                LoopBack { target: Phase::Desirability, pivot: PivotType::PricePivot },
            ),
            rule(
                Signal::Viability(ViabilitySignal::Underwater),
                ask(vec![
                    Decision::Pivot(PivotType::PricePivot),
                    Decision::Pivot(PivotType::CostPivot),
                    Decision::Pivot(PivotType::ModelPivot),
                    Decision::Kill,
                ]),
            ),
        ];
        for phase in Phase::WORK {
            if let Ok(unknown) = Signal::unknown(phase) {
                rules.push(rule(unknown, ask(unknown_options.clone())));
            }
        }
        Self { rules }
    }

    pub fn lookup(&self, signal: Signal) -> Option<&Action> {
        self.rules.iter().find(|r| r.signal == signal).map(|r| &r.action)
    }

    /// Replace the rule for `rule.signal`, or add it.
    pub fn override_rule(&mut self, rule: RouteRule) {
        match self.rules.iter_mut().find(|r| r.signal == rule.signal) {
            Some(existing) => existing.action = rule.action,
            None => self.rules.push(rule),
        }
    }

    /// Exhaustive, linear-forward, human-on-UNKNOWN.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for signal in Signal::all() {
            match self.rules.iter().filter(|r| r.signal == signal).count() {
                0 => {
                    return Err(ConfigError::UnmappedSignal { phase: signal.phase(), signal: signal.label().into() });
                }
                1 => {}
                _ => {
                    return Err(ConfigError::DuplicateRoute { phase: signal.phase(), signal: signal.label().into() });
                }
            }
        }
        for rule in &self.rules {
            validate_rule(rule)?;
        }
        Ok(())
    }
}

fn validate_rule(rule: &RouteRule) -> Result<(), ConfigError> {
    let phase = rule.signal.phase();
    let loop_target_ok = |to: Phase| !to.is_terminal() && to.ordinal() <= phase.ordinal();
    match &rule.action {
        Action::Advance { next } => {
            if phase.next() != Some(*next) {
                return Err(ConfigError::SkipAhead { from: phase, to: *next });
            }
        }
        Action::LoopBack { target, .. } | Action::DowngradeAndRetest { target, .. } => {
            if !loop_target_ok(*target) {
                return Err(ConfigError::ForwardLoop { from: phase, to: *target });
            }
        }
        Action::RequestHumanDecision { options, .. } => {
            if options.is_empty() {
                return Err(ConfigError::EmptyOptions(phase));
            }
            for option in options {
                match option {
                    Decision::Approve => return Err(ConfigError::ApproveWithoutPending(phase)),
                    Decision::Pivot(p) if !loop_target_ok(p.reentry_phase(phase)) => {
                        return Err(ConfigError::ForwardLoop { from: phase, to: p.reentry_phase(phase) });
                    }
                    _ => {}
                }
            }
        }
        Action::Terminate { outcome: Outcome::Validated } if phase != Phase::Viability => {
            return Err(ConfigError::SkipAhead { from: phase, to: Phase::Validated });
        }
        Action::Terminate { .. } => {}
    }
    if rule.signal.is_unknown() && !matches!(rule.action, Action::RequestHumanDecision { .. }) {
        return Err(ConfigError::UnknownMustAskHuman(phase));
    }
    Ok(())
}

/// Everything `route` needs besides the signal.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingPolicy {
    pub max_pivots: PivotBudget,
    pub phases: Vec<PhasePolicy>,
    pub table: RoutingTable,
}

impl RoutingPolicy {
    /// Standard table and phase knobs: only VIABILITY gates success.
    pub fn standard(max_pivots: PivotBudget) -> Self {
        let phases = Phase::WORK
            .iter()
            .map(|phase| PhasePolicy {
                phase: *phase,
                gate_required_even_on_success: *phase == Phase::Viability,
                retry_limit: 2,
                time_budget_secs: 120,
            })
            .collect();
        Self { max_pivots, phases, table: RoutingTable::standard() }
    }

    pub fn phase_policy(&self, phase: Phase) -> Result<&PhasePolicy, ConfigError> {
        self.phases
            .iter()
            .find(|p| p.phase == phase)
            .ok_or_else(|| ConfigError::InvalidPolicy(format!("no phase policy for {phase}")))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for phase in Phase::WORK {
            match self.phases.iter().filter(|p| p.phase == phase).count() {
                1 => {}
                0 => return Err(ConfigError::InvalidPolicy(format!("no phase policy for {phase}"))),
                _ => return Err(ConfigError::InvalidPolicy(format!("phase {phase} configured twice"))),
            }
        }
        if let Some(p) = self.phases.iter().find(|p| p.phase.is_terminal()) {
            return Err(ConfigError::NotAWorkPhase(p.phase));
        }
        self.table.validate()
    }
}

/// The slice of run state routing depends on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RouteState {
    pub pivot_count: u32,
}

impl From<&ValidationRun> for RouteState {
    fn from(run: &ValidationRun) -> Self {
        Self { pivot_count: run.pivot_count }
    }
}

/// Map a phase's classification to the next action. Pure and deterministic.
pub fn route(policy: &RoutingPolicy, phase: Phase, signal: Signal, state: &RouteState) -> Result<RouteDecision, ConfigError> {
    if signal.phase() != phase {
        return Err(ConfigError::SignalPhaseMismatch { phase, signal: signal.to_string() });
    }
    let base = policy
        .table
        .lookup(signal)
        .ok_or_else(|| ConfigError::UnmappedSignal { phase, signal: signal.label().into() })?;
    let gate = policy.phase_policy(phase)?.gate_required_even_on_success;
    let exhausted = policy.max_pivots.exhausted(state.pivot_count);

    let decision = |action: Action, gated: Option<Action>, budget_exhausted: bool| RouteDecision {
        from_phase: phase,
        signal,
        action,
        gated,
        budget_exhausted,
    };

    Ok(match base {
        Action::Advance { .. } if gate => decision(
            Action::RequestHumanDecision {
                kind: CheckpointKind::GateApproval,
                options: vec![Decision::Approve, Decision::Kill],
            },
            Some(base.clone()),
            false,
        ),
        a if a.is_pivot() && exhausted => decision(
            Action::RequestHumanDecision {
                kind: CheckpointKind::StrategicDecision,
                options: vec![Decision::ContinueAnyway, Decision::Kill],
            },
            None,
            true,
        ),
        Action::RequestHumanDecision { kind, options } if exhausted && options.iter().any(|d| d.is_pivot()) => {
            let mut restricted: Vec<Decision> = options.iter().copied().filter(|d| !d.is_pivot()).collect();
            if !restricted.contains(&Decision::ContinueAnyway) {
                restricted.insert(0, Decision::ContinueAnyway);
            }
            decision(Action::RequestHumanDecision { kind: *kind, options: restricted }, None, true)
        }
        other => decision(other.clone(), None, false),
    })
}

/// Translate a human's choice at a checkpoint into the action it implies.
pub fn decision_action(checkpoint: &Checkpoint, decision: Decision) -> FunnelResult<Action> {
    if !checkpoint.options.contains(&decision) {
        return Err(FunnelError::InvalidDecision {
            decision: decision.label().into(),
            options: checkpoint.option_labels(),
        });
    }
    let phase = checkpoint.phase;
    Ok(match decision {
        Decision::Approve => checkpoint
            .pending_action
            .clone()
            .ok_or(ConfigError::ApproveWithoutPending(phase))?,
        Decision::ContinueAnyway => Action::Advance { next: phase.next().ok_or(ConfigError::NotAWorkPhase(phase))? },
        Decision::Kill => Action::Terminate { outcome: Outcome::Killed },
        Decision::Pivot(pivot) => Action::LoopBack { target: pivot.reentry_phase(phase), pivot },
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(max: PivotBudget) -> RoutingPolicy {
        RoutingPolicy::standard(max)
    }

    #[test]
    fn standard_policy_is_valid() {
        policy(PivotBudget::Capped(3)).validate().unwrap();
    }

    #[test]
    fn strong_commitment_advances() {
        let d = route(
            &policy(PivotBudget::Capped(3)),
            Phase::Desirability,
            Signal::Desirability(DesirabilitySignal::StrongCommitment),
            &RouteState { pivot_count: 0 },
        )
        .unwrap();
        assert_eq!(d.action, Action::Advance { next: Phase::Feasibility });
        assert!(!d.budget_exhausted);
    }

    #[test]
    fn orange_downgrades() {
        let d = route(
            &policy(PivotBudget::Capped(3)),
            Phase::Feasibility,
            Signal::Feasibility(FeasibilitySignal::OrangeConstrained),
            &RouteState { pivot_count: 1 },
        )
        .unwrap();
        assert_eq!(
            d.action,
            Action::DowngradeAndRetest { target: Phase::Desirability, pivot: PivotType::FeaturePivot }
        );
        assert_eq!(d.pivot_type(), Some(PivotType::FeaturePivot));
    }

    #[test]
    fn profitable_is_gated_by_default() {
        let d = route(
            &policy(PivotBudget::Unbounded),
            Phase::Viability,
            Signal::Viability(ViabilitySignal::Profitable),
            &RouteState { pivot_count: 0 },
        )
        .unwrap();
        assert_eq!(
            d.action,
            Action::RequestHumanDecision {
                kind: CheckpointKind::GateApproval,
                options: vec![Decision::Approve, Decision::Kill]
            }
        );
        assert_eq!(d.gated, Some(Action::Advance { next: Phase::Validated }));
    }

    #[test]
    fn ungated_phase_advances_directly() {
        let mut p = policy(PivotBudget::Unbounded);
        for ph in p.phases.iter_mut() {
            ph.gate_required_even_on_success = false;
        }
        let d = route(&p, Phase::Viability, Signal::Viability(ViabilitySignal::Profitable), &RouteState { pivot_count: 0 })
            .unwrap();
        assert_eq!(d.action, Action::Advance { next: Phase::Validated });
    }

    #[test]
    fn exhausted_budget_forces_human_decision() {
        let d = route(
            &policy(PivotBudget::Capped(1)),
            Phase::Feasibility,
            Signal::Feasibility(FeasibilitySignal::OrangeConstrained),
            &RouteState { pivot_count: 1 },
        )
        .unwrap();
        assert!(d.budget_exhausted);
        assert_eq!(
            d.action,
            Action::RequestHumanDecision {
                kind: CheckpointKind::StrategicDecision,
                options: vec![Decision::ContinueAnyway, Decision::Kill]
            }
        );
    }

    #[test]
    fn exhausted_budget_strips_pivot_options() {
        let d = route(
            &policy(PivotBudget::Capped(0)),
            Phase::Viability,
            Signal::Viability(ViabilitySignal::Underwater),
            &RouteState { pivot_count: 0 },
        )
        .unwrap();
        assert_eq!(
            d.action,
            Action::RequestHumanDecision {
                kind: CheckpointKind::StrategicDecision,
                options: vec![Decision::ContinueAnyway, Decision::Kill]
            }
        );
    }

    #[test]
    fn unbounded_budget_never_forces() {
        let d = route(
            &policy(PivotBudget::Unbounded),
            Phase::Desirability,
            Signal::Desirability(DesirabilitySignal::WeakInterest),
            &RouteState { pivot_count: 10_000 },
        )
        .unwrap();
        assert!(d.action.is_pivot());
    }

    #[test]
    fn unknown_asks_human() {
        for phase in Phase::WORK {
            let d = route(&policy(PivotBudget::Capped(5)), phase, Signal::unknown(phase).unwrap(), &RouteState { pivot_count: 0 })
                .unwrap();
            assert!(matches!(d.action, Action::RequestHumanDecision { .. }), "{phase}");
        }
    }

    #[test]
    fn mismatched_signal_is_config_error() {
        let err = route(
            &policy(PivotBudget::Capped(5)),
            Phase::Viability,
            Signal::Feasibility(FeasibilitySignal::GreenFeasible),
            &RouteState { pivot_count: 0 },
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::SignalPhaseMismatch { .. }));
    }

    #[test]
    fn unmapped_signal_is_config_error() {
        let mut p = policy(PivotBudget::Capped(5));
        p.table.rules.retain(|r| r.signal != Signal::Feasibility(FeasibilitySignal::RedImpossible));
        assert!(matches!(p.validate(), Err(ConfigError::UnmappedSignal { .. })));
        let err = route(&p, Phase::Feasibility, Signal::Feasibility(FeasibilitySignal::RedImpossible), &RouteState { pivot_count: 0 })
            .unwrap_err();
        assert!(matches!(err, ConfigError::UnmappedSignal { .. }));
    }

    #[test]
    fn validation_rejects_skip_ahead_and_silent_unknown() {
        let mut t = RoutingTable::standard();
        t.override_rule(RouteRule {
            signal: Signal::Discovery(DiscoverySignal::StrongFit),
            action: Action::Advance { next: Phase::Feasibility },
        });
        assert!(matches!(t.validate(), Err(ConfigError::SkipAhead { .. })));

        let mut t = RoutingTable::standard();
        t.override_rule(RouteRule {
            signal: Signal::Feasibility(FeasibilitySignal::Unknown),
            action: Action::Advance { next: Phase::Viability },
        });
        assert!(matches!(t.validate(), Err(ConfigError::UnknownMustAskHuman(Phase::Feasibility))));

        let mut t = RoutingTable::standard();
        t.override_rule(RouteRule {
            signal: Signal::Discovery(DiscoverySignal::NoFit),
            action: Action::RequestHumanDecision {
                kind: CheckpointKind::StrategicDecision,
                options: vec![Decision::Pivot(PivotType::CostPivot)],
            },
        });
        assert!(matches!(t.validate(), Err(ConfigError::ForwardLoop { .. })));
    }

    #[test]
    fn cost_pivot_decision_reenters_feasibility() {
        let cp = Checkpoint {
            id: crate::CheckpointId::from_str("c"),
            run_id: crate::RunId::from_str("r"),
            phase: Phase::Viability,
            artifact_version: 1,
            kind: CheckpointKind::StrategicDecision,
            options: vec![Decision::Pivot(PivotType::CostPivot), Decision::Kill],
            presented_context: serde_json::Value::Null,
            pending_action: None,
            budget_exhausted: false,
            resolved: false,
            decision: None,
            decided_at_unix: None,
            created_at_unix: 0,
        };
        assert_eq!(
            decision_action(&cp, Decision::Pivot(PivotType::CostPivot)).unwrap(),
            Action::LoopBack { target: Phase::Feasibility, pivot: PivotType::CostPivot }
        );
        assert!(matches!(
            decision_action(&cp, Decision::Approve),
            Err(FunnelError::InvalidDecision { .. })
        ));
        assert_eq!(decision_action(&cp, Decision::Kill).unwrap(), Action::Terminate { outcome: Outcome::Killed });
    }
}
