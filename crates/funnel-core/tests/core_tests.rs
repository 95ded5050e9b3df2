use funnel_core::*;
use proptest::prelude::*;

/// Drive a run through `signals` with the pure core only, resolving every
/// checkpoint with the matching entry of `decisions`.
fn walk(policy: &RoutingPolicy, signals: &[Signal], decisions: &[Decision]) -> ValidationRun {
    let mut run = ValidationRun::new("meal kits for night-shift nurses", None, "test", 0);
    let mut versions = std::collections::HashMap::new();
    versions.insert(Phase::Onboarding, 1u32);
    let mut decisions = decisions.iter();
    let mut now = 0;

    for signal in signals {
        now += 1;
        assert_eq!(signal.phase(), run.phase, "script out of step with run");
        let routed = route(policy, run.phase, *signal, &RouteState::from(&run)).unwrap();
        let action = match &routed.action {
            Action::RequestHumanDecision { kind, options } => {
                let cp = Checkpoint {
                    id: CheckpointId::new(),
                    run_id: run.id.clone(),
                    phase: run.phase,
                    artifact_version: run.current_version,
                    kind: *kind,
                    options: options.clone(),
                    presented_context: serde_json::Value::Null,
                    pending_action: routed.gated.clone(),
                    budget_exhausted: routed.budget_exhausted,
                    resolved: false,
                    decision: None,
                    decided_at_unix: None,
                    created_at_unix: now,
                };
                let decision = *decisions.next().expect("script ran out of decisions");
                decision_action(&cp, decision).unwrap()
            }
            other => other.clone(),
        };
        let target = match action.target() {
            Target::Phase(p) => p,
            _ => run.phase,
        };
        let next_version = versions.get(&target).map(|v| v + 1).unwrap_or(1);
        run = apply_action(&run, &action, signal.label(), PivotOrigin::Router, next_version, now).unwrap();
        if !run.is_terminal() {
            versions.insert(run.phase, run.current_version);
        }
    }
    run
}

fn standard(max: PivotBudget) -> RoutingPolicy {
    RoutingPolicy::standard(max)
}

#[test]
fn happy_path_validates_after_gate() {
    let run = walk(
        &standard(PivotBudget::Capped(3)),
        &[
            Signal::Onboarding(OnboardingSignal::Complete),
            Signal::Discovery(DiscoverySignal::StrongFit),
            Signal::Desirability(DesirabilitySignal::StrongCommitment),
            Signal::Feasibility(FeasibilitySignal::GreenFeasible),
            Signal::Viability(ViabilitySignal::Profitable),
        ],
        &[Decision::Approve],
    );
    assert_eq!(run.phase, Phase::Validated);
    assert_eq!(run.status, RunStatus::Terminal);
    assert_eq!(run.pivot_count, 0);
}

#[test]
fn orange_feasibility_downgrades_and_retests_desirability() {
    let run = walk(
        &standard(PivotBudget::Capped(3)),
        &[
            Signal::Onboarding(OnboardingSignal::Complete),
            Signal::Discovery(DiscoverySignal::StrongFit),
            Signal::Desirability(DesirabilitySignal::StrongCommitment),
            Signal::Feasibility(FeasibilitySignal::OrangeConstrained),
        ],
        &[],
    );
    assert_eq!(run.phase, Phase::Desirability);
    assert_eq!(run.current_version, 2);
    assert_eq!(run.pivot_count, 1);
    assert!(run.pivot_history[0].downgrade);
}

#[test]
fn red_feasibility_kills() {
    let run = walk(
        &standard(PivotBudget::Capped(3)),
        &[
            Signal::Onboarding(OnboardingSignal::Complete),
            Signal::Discovery(DiscoverySignal::StrongFit),
            Signal::Desirability(DesirabilitySignal::StrongCommitment),
            Signal::Feasibility(FeasibilitySignal::RedImpossible),
        ],
        &[],
    );
    assert_eq!(run.phase, Phase::Killed);
    assert!(run.terminal_reason.unwrap().contains("RED_IMPOSSIBLE"));
}

#[test]
fn underwater_cost_pivot_reenters_feasibility() {
    let run = walk(
        &standard(PivotBudget::Capped(3)),
        &[
            Signal::Onboarding(OnboardingSignal::Complete),
            Signal::Discovery(DiscoverySignal::StrongFit),
            Signal::Desirability(DesirabilitySignal::StrongCommitment),
            Signal::Feasibility(FeasibilitySignal::GreenFeasible),
            Signal::Viability(ViabilitySignal::Underwater),
        ],
        &[Decision::Pivot(PivotType::CostPivot)],
    );
    assert_eq!(run.phase, Phase::Feasibility);
    assert_eq!(run.current_version, 2);
    assert_eq!(run.pivot_count, 1);
}

#[test]
fn budget_exhaustion_hands_control_to_human() {
    // Capped(1): the first weak fit loops, the second forces a decision.
    let policy = standard(PivotBudget::Capped(1));
    let run = walk(
        &policy,
        &[
            Signal::Onboarding(OnboardingSignal::Complete),
            Signal::Discovery(DiscoverySignal::WeakFit),
            Signal::Discovery(DiscoverySignal::WeakFit),
        ],
        &[Decision::ContinueAnyway],
    );
    assert_eq!(run.phase, Phase::Desirability);
    assert_eq!(run.pivot_count, 1);

    let routed = route(
        &policy,
        Phase::Discovery,
        Signal::Discovery(DiscoverySignal::WeakFit),
        &RouteState { pivot_count: 1 },
    )
    .unwrap();
    assert!(routed.budget_exhausted);
}

#[test]
fn policy_round_trips_through_yaml_shaped_json() {
    let policy = standard(PivotBudget::Unbounded);
    let json = serde_json::to_value(&policy).unwrap();
    assert_eq!(json["max_pivots"], "unbounded");
    let back: RoutingPolicy = serde_json::from_value(json).unwrap();
    assert_eq!(back, policy);

    let capped: PivotBudget = serde_json::from_str("4").unwrap();
    assert_eq!(capped, PivotBudget::Capped(4));
    assert!(serde_json::from_str::<PivotBudget>("\"lots\"").is_err());
}

fn any_signal() -> impl Strategy<Value = Signal> {
    let all = Signal::all();
    (0..all.len()).prop_map(move |i| all[i])
}

proptest! {
    #[test]
    fn route_is_deterministic(signal in any_signal(), pivots in 0u32..8, cap in 0u32..5) {
        let policy = standard(PivotBudget::Capped(cap));
        let state = RouteState { pivot_count: pivots };
        let a = route(&policy, signal.phase(), signal, &state).unwrap();
        let b = route(&policy, signal.phase(), signal, &state).unwrap();
        prop_assert_eq!(&a, &b);
        if pivots >= cap {
            prop_assert!(!a.action.is_pivot());
        }
        if signal.is_unknown() {
            let is_human = matches!(a.action, Action::RequestHumanDecision { .. });
            prop_assert!(is_human);
        }
    }
}
