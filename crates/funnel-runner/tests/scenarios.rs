use std::path::{Path, PathBuf};

use std::sync::Arc;

use funnel_core::{
    BackoffPolicy, CheckpointKind, Decision, FunnelError, Phase, PhasePayload, PivotBudget, ResumePlan, RunStatus,
};
use funnel_events::{EventKind, MemorySink};
use funnel_executor::{AgentRegistry, CancelFlag, PhaseExecutor};
use funnel_hitl::{CheckpointController, CheckpointRequest};
use funnel_policy::{compile_policy, PolicyPack};
use funnel_runner::scenario::{load_expected, simulate, Script, ScenarioResult};
use funnel_storage::{InMemoryStorage, Storage};

fn dir(name: &str) -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("../../fixtures/scenarios").join(name)
}

/// Simulate a fixture and check it against its expected.yaml.
fn run(name: &str) -> ScenarioResult {
    let d = dir(name);
    let exp = load_expected(&d).unwrap();
    assert_eq!(exp.scenario_id, name);
    let res = simulate(&d).unwrap();
    assert_eq!(res.run.phase, exp.final_phase, "{name}: final phase");
    assert_eq!(res.run.status == RunStatus::SuspendedForInput, exp.suspended, "{name}: suspended");
    assert_eq!(res.run.pivot_count, exp.pivot_count, "{name}: pivot count");
    assert_eq!(res.run.pivot_history.len() as u32, res.run.pivot_count);
    assert_eq!(res.checkpoints.len(), exp.checkpoints, "{name}: checkpoints");
    for (phase, version) in &exp.versions {
        assert_eq!(res.latest_version(*phase), Some(*version), "{name}: {phase} version");
    }
    let degraded: Vec<Phase> = res.artifacts.iter().filter(|a| a.payload.is_degraded()).map(|a| a.phase).collect();
    assert_eq!(degraded, exp.degraded, "{name}: degraded phases");
    res
}

#[test]
fn sc01_happy_path_validates_after_gate() {
    let res = run("SC-01-happy-path");
    assert_eq!(res.decisions, vec!["APPROVE"]);
    let gate = &res.checkpoints[0];
    assert_eq!(gate.phase, Phase::Viability);
    assert!(gate.presented_context["ask_md"].as_str().unwrap().contains("**Recommended:** APPROVE"));
    assert_eq!(res.events.iter().filter(|e| e.kind == EventKind::RunTerminated).count(), 1);
}

#[test]
fn sc02_downgrade_carries_scope_into_retest() {
    let res = run("SC-02-feasibility-downgrade");
    let pivot = &res.run.pivot_history[0];
    assert!(pivot.downgrade);
    assert_eq!((pivot.from_phase, pivot.to_phase), (Phase::Feasibility, Phase::Desirability));
    let retest = res
        .agent_inputs
        .iter()
        .find(|i| i.phase == Phase::Desirability && i.version == 2)
        .unwrap();
    assert_eq!(retest.downgraded_scope, vec!["realtime sync".to_string()]);
    assert_eq!(retest.pivot.as_ref().map(|p| p.to_phase), Some(Phase::Desirability));
}

#[test]
fn sc03_red_impossible_kills_without_asking() {
    let res = run("SC-03-impossible-kill");
    assert!(res.run.is_terminal());
    assert!(res.latest_version(Phase::Viability).is_none());

    // nothing more can be executed or decided on the killed run
    let store: Arc<dyn Storage> = Arc::new(InMemoryStorage::new());
    store.create_run(&res.run).unwrap();
    let sink = Arc::new(MemorySink::new());
    let agent = Script::load(&dir("SC-03-impossible-kill").join("script.yaml")).unwrap().agent().unwrap();
    let executor = PhaseExecutor::new(store.clone(), AgentRegistry::uniform(Arc::new(agent)), sink.clone(), BackoffPolicy::default());
    let routing = compile_policy(&PolicyPack::standard(PivotBudget::Capped(3))).unwrap().routing;
    let policy = routing.phase_policy(Phase::Viability).unwrap();
    assert!(matches!(
        executor.execute(&res.run, policy, &CancelFlag::new(), 99),
        Err(FunnelError::TerminalState { .. })
    ));
    let controller = CheckpointController::new(store.clone(), sink);
    let request = CheckpointRequest {
        kind: CheckpointKind::StrategicDecision,
        options: vec![Decision::Kill],
        pending_action: None,
        budget_exhausted: false,
        context: serde_json::json!({}),
    };
    assert!(matches!(controller.suspend(&res.run, request, 99), Err(FunnelError::TerminalState { .. })));
    assert!(matches!(controller.cancel(&res.run.id, "again", 99), Err(FunnelError::TerminalState { .. })));
    assert!(store.artifacts_for_run(&res.run.id).unwrap().is_empty());
}

#[test]
fn sc04_cost_pivot_reenters_feasibility() {
    let res = run("SC-04-viability-cost-pivot");
    assert_eq!(res.decisions, vec!["COST_PIVOT", "APPROVE"]);
    let pivot = &res.run.pivot_history[0];
    assert_eq!(pivot.to_phase, Phase::Feasibility);
    assert_eq!(pivot.trigger, "COST_PIVOT");
    match &res.artifacts.iter().find(|a| a.phase == Phase::Feasibility && a.version == 2).unwrap().payload {
        PhasePayload::Feasibility(f) => assert_eq!(f.monthly_run_cost, 18000.0),
        other => panic!("unexpected payload {other:?}"),
    }
}

#[test]
fn sc05_exhausted_budget_offers_no_pivot() {
    let res = run("SC-05-pivot-budget-exhausted");
    let cp = &res.checkpoints[0];
    assert!(cp.budget_exhausted);
    assert_eq!(cp.option_labels(), vec!["CONTINUE_ANYWAY", "KILL"]);
}

#[test]
fn sc06_exhausted_retries_ask_a_human() {
    let res = run("SC-06-agent-failure-degrades");
    let cp = &res.checkpoints[0];
    assert_eq!(cp.phase, Phase::Discovery);
    assert_eq!(cp.option_labels(), vec!["RETRY", "CONTINUE_ANYWAY", "KILL"]);
    let discovery_attempts = res.agent_inputs.iter().filter(|i| i.phase == Phase::Discovery && i.version == 1).count();
    assert_eq!(discovery_attempts, 3);
}

#[test]
fn sc07_crash_after_write_routes_instead_of_rerunning() {
    let res = run("SC-07-crash-recovery");
    assert_eq!(res.resumed_with, Some(ResumePlan::RouteArtifact { phase: Phase::Feasibility, version: 1 }));
    let feasibility_calls = res.agent_inputs.iter().filter(|i| i.phase == Phase::Feasibility).count();
    assert_eq!(feasibility_calls, 1);
}

#[test]
fn every_fixture_has_expectations() {
    let root = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../fixtures/scenarios");
    for entry in std::fs::read_dir(root).unwrap() {
        let d = entry.unwrap().path();
        load_expected(&d).unwrap();
        simulate(&d).unwrap();
    }
}
