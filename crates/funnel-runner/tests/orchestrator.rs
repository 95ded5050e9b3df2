use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use funnel_core::*;
use funnel_events::{EventKind, MemorySink};
use funnel_executor::{AgentError, AgentOutput, AgentRegistry, PhaseAgent, PhaseInput};
use funnel_policy::{compile_policy, PolicyPack};
use funnel_runner::{Orchestrator, OrchestratorOptions, StepOutcome};
use funnel_storage::{InMemoryStorage, PutOutcome, Storage, StoreResult};
use funnel_storage_sqlite::SqliteStorage;

/// Answers every phase with its success signal.
struct Steady;

impl PhaseAgent for Steady {
    fn run(&self, input: &PhaseInput, _budget: Duration) -> Result<AgentOutput, AgentError> {
        let label = match input.phase {
            Phase::Onboarding => "COMPLETE",
            Phase::Discovery => "STRONG_FIT",
            Phase::Desirability => "STRONG_COMMITMENT",
            Phase::Feasibility => "GREEN_FEASIBLE",
            _ => "PROFITABLE",
        };
        Ok(AgentOutput {
            payload: PhasePayload::empty_for(input.phase).unwrap(),
            signal: Signal::parse(input.phase, label).unwrap(),
        })
    }
}

/// Holds the first call until the test releases it.
struct Gate {
    started: Arc<Barrier>,
    release: Arc<Barrier>,
}

impl PhaseAgent for Gate {
    fn run(&self, input: &PhaseInput, budget: Duration) -> Result<AgentOutput, AgentError> {
        self.started.wait();
        self.release.wait();
        Steady.run(input, budget)
    }
}

fn options() -> OrchestratorOptions {
    OrchestratorOptions { backoff: BackoffPolicy { base_ms: 0, max_ms: 0 }, step_limit: 32 }
}

fn orchestrator(store: Arc<dyn Storage>, agent: Arc<dyn PhaseAgent>, sink: Arc<MemorySink>) -> Orchestrator {
    let policy = compile_policy(&PolicyPack::standard(PivotBudget::Capped(2))).unwrap();
    Orchestrator::new(store, AgentRegistry::uniform(agent), sink, policy, options()).unwrap()
}

fn gated() -> (Arc<Barrier>, Arc<Barrier>, Arc<Gate>) {
    let started = Arc::new(Barrier::new(2));
    let release = Arc::new(Barrier::new(2));
    let gate = Arc::new(Gate { started: started.clone(), release: release.clone() });
    (started, release, gate)
}

#[test]
fn drive_stops_at_viability_gate_and_approve_validates() {
    let sink = Arc::new(MemorySink::new());
    let orch = orchestrator(Arc::new(InMemoryStorage::new()), Arc::new(Steady), sink.clone());
    let run = orch.start_run("idea", None).unwrap();
    let report = orch.drive(&run.id).unwrap();
    let checkpoint = match report.last {
        StepOutcome::Suspended { checkpoint, run } => {
            assert_eq!(run.status, RunStatus::SuspendedForInput);
            checkpoint
        }
        other => panic!("expected a gate, got {other:?}"),
    };
    assert_eq!(report.steps, 5);
    assert_eq!(checkpoint.kind, CheckpointKind::GateApproval);

    let state = orch.run_state(&run.id).unwrap();
    assert_eq!(state.latest.len(), 5);
    assert_eq!(state.open_checkpoint.as_ref().map(|c| c.id.clone()), Some(checkpoint.id.clone()));

    // stepping a suspended run is a no-op
    assert!(matches!(orch.step(&run.id).unwrap(), StepOutcome::Waiting { .. }));

    let done = orch.resolve(&checkpoint.id, "APPROVE").unwrap();
    assert_eq!(done.phase, Phase::Validated);
    assert!(matches!(orch.step(&run.id).unwrap(), StepOutcome::Finished { .. }));
    assert!(matches!(orch.resolve(&checkpoint.id, "APPROVE"), Err(FunnelError::TerminalState { .. })));

    let artifact_events = sink.events().iter().filter(|e| e.kind == EventKind::ArtifactWritten).count();
    assert_eq!(artifact_events, 5);
    assert_eq!(orch.manifest(&run.id).unwrap().outcome, Phase::Validated);
}

#[test]
fn start_is_idempotent_per_token() {
    let sink = Arc::new(MemorySink::new());
    let orch = orchestrator(Arc::new(InMemoryStorage::new()), Arc::new(Steady), sink.clone());
    let a = orch.start_run("idea", Some("req-1".into())).unwrap();
    let b = orch.start_run("idea", Some("req-1".into())).unwrap();
    assert_eq!(a.id, b.id);
    assert_eq!(sink.events().iter().filter(|e| e.kind == EventKind::RunStarted).count(), 1);
}

#[test]
fn independent_runs_drive_in_parallel() {
    let orch = Arc::new(orchestrator(Arc::new(InMemoryStorage::new()), Arc::new(Steady), Arc::new(MemorySink::new())));
    let handles: Vec<_> = (0..4)
        .map(|i| {
            let orch = orch.clone();
            thread::spawn(move || {
                let run = orch.start_run(&format!("idea {i}"), None).unwrap();
                let report = orch.drive(&run.id).unwrap();
                let StepOutcome::Suspended { checkpoint, .. } = report.last else { panic!("not suspended") };
                orch.resolve(&checkpoint.id, "APPROVE").unwrap()
            })
        })
        .collect();
    let mut ids = vec![];
    for h in handles {
        let run = h.join().unwrap();
        assert_eq!(run.phase, Phase::Validated);
        ids.push(run.id);
    }
    ids.sort();
    ids.dedup();
    assert_eq!(ids.len(), 4);
}

#[test]
fn concurrent_step_on_same_run_conflicts() {
    let (started, release, gate) = gated();
    let orch = Arc::new(orchestrator(Arc::new(InMemoryStorage::new()), gate, Arc::new(MemorySink::new())));
    let run = orch.start_run("idea", None).unwrap();

    let worker = {
        let (orch, id) = (orch.clone(), run.id.clone());
        thread::spawn(move || orch.step(&id))
    };
    started.wait();
    assert!(matches!(orch.step(&run.id), Err(FunnelError::Conflict(_))));
    release.wait();
    assert!(matches!(worker.join().unwrap(), Ok(StepOutcome::Moved { .. })));
    assert_eq!(orch.run_state(&run.id).unwrap().run.phase, Phase::Discovery);
}

#[test]
fn cancel_during_execution_writes_nothing() {
    let (started, release, gate) = gated();
    let store: Arc<dyn Storage> = Arc::new(InMemoryStorage::new());
    let orch = Arc::new(orchestrator(store.clone(), gate, Arc::new(MemorySink::new())));
    let run = orch.start_run("idea", None).unwrap();

    let worker = {
        let (orch, id) = (orch.clone(), run.id.clone());
        thread::spawn(move || orch.step(&id))
    };
    started.wait();
    let killed = orch.cancel(&run.id, "operator").unwrap();
    assert_eq!(killed.phase, Phase::Killed);
    release.wait();
    assert!(matches!(worker.join().unwrap(), Err(FunnelError::Cancelled(_))));
    assert!(store.artifacts_for_run(&run.id).unwrap().is_empty());
    assert!(matches!(orch.cancel(&run.id, "again"), Err(FunnelError::TerminalState { .. })));
}

/// Delegates to a store, holding `cancel_run` until the test lets it through.
struct HeldCancel {
    inner: Arc<dyn Storage>,
    entered: Barrier,
    proceed: Barrier,
}

impl Storage for HeldCancel {
    fn create_run(&self, run: &ValidationRun) -> StoreResult<ValidationRun> {
        self.inner.create_run(run)
    }
    fn load_run(&self, run_id: &RunId) -> StoreResult<Option<ValidationRun>> {
        self.inner.load_run(run_id)
    }
    fn save_run(&self, run: &ValidationRun) -> StoreResult<()> {
        self.inner.save_run(run)
    }
    fn list_runs(&self) -> StoreResult<Vec<ValidationRun>> {
        self.inner.list_runs()
    }
    fn put_artifact(&self, artifact: &PhaseArtifact) -> StoreResult<PutOutcome> {
        self.inner.put_artifact(artifact)
    }
    fn latest_artifact(&self, run_id: &RunId, phase: Phase) -> StoreResult<Option<PhaseArtifact>> {
        self.inner.latest_artifact(run_id, phase)
    }
    fn artifact_at(&self, run_id: &RunId, phase: Phase, version: u32) -> StoreResult<Option<PhaseArtifact>> {
        self.inner.artifact_at(run_id, phase, version)
    }
    fn artifacts_for_run(&self, run_id: &RunId) -> StoreResult<Vec<PhaseArtifact>> {
        self.inner.artifacts_for_run(run_id)
    }
    fn open_checkpoint(&self, run_id: &RunId) -> StoreResult<Option<Checkpoint>> {
        self.inner.open_checkpoint(run_id)
    }
    fn load_checkpoint(&self, id: &CheckpointId) -> StoreResult<Option<Checkpoint>> {
        self.inner.load_checkpoint(id)
    }
    fn checkpoints_for_run(&self, run_id: &RunId) -> StoreResult<Vec<Checkpoint>> {
        self.inner.checkpoints_for_run(run_id)
    }
    fn suspend_run(&self, run: &ValidationRun, checkpoint: &Checkpoint) -> StoreResult<()> {
        self.inner.suspend_run(run, checkpoint)
    }
    fn resolve_checkpoint(&self, checkpoint: &Checkpoint, run: &ValidationRun) -> StoreResult<()> {
        self.inner.resolve_checkpoint(checkpoint, run)
    }
    fn cancel_run(&self, run_id: &RunId, reason: &str, now_unix: i64) -> StoreResult<ValidationRun> {
        self.entered.wait();
        self.proceed.wait();
        self.inner.cancel_run(run_id, reason, now_unix)
    }
}

/// A run at VIABILITY whose UNDERWATER artifact is written but not yet routed.
fn underwater_at_viability(store: &dyn Storage) -> ValidationRun {
    let mut run = store.create_run(&ValidationRun::new("idea", None, "h", 0)).unwrap();
    run.enter_phase(Phase::Viability, 1, 1).unwrap();
    store.save_run(&run).unwrap();
    let payload = PhasePayload::empty_for(Phase::Viability).unwrap();
    store.put(&run.id, Phase::Viability, payload, Signal::Viability(ViabilitySignal::Underwater), 1).unwrap();
    run
}

fn held_store() -> (Arc<InMemoryStorage>, Arc<HeldCancel>) {
    let inner = Arc::new(InMemoryStorage::new());
    let held = Arc::new(HeldCancel { inner: inner.clone(), entered: Barrier::new(2), proceed: Barrier::new(2) });
    (inner, held)
}

#[test]
fn step_racing_a_cancel_raises_no_checkpoint() {
    let (inner, held) = held_store();
    let run = underwater_at_viability(inner.as_ref());
    let orch = Arc::new(orchestrator(held.clone(), Arc::new(Steady), Arc::new(MemorySink::new())));

    let canceller = {
        let (orch, id) = (orch.clone(), run.id.clone());
        thread::spawn(move || orch.cancel(&id, "operator"))
    };
    held.entered.wait();
    assert!(matches!(orch.step(&run.id), Err(FunnelError::Cancelled(_))));
    held.proceed.wait();
    assert_eq!(canceller.join().unwrap().unwrap().phase, Phase::Killed);

    assert!(inner.checkpoints_for_run(&run.id).unwrap().is_empty());
    assert_eq!(orch.resume(&run.id).unwrap(), ResumePlan::Finished { phase: Phase::Killed });
}

#[test]
fn checkpoint_raised_by_another_orchestrator_is_closed_by_cancel() {
    let (inner, held) = held_store();
    let run = underwater_at_viability(inner.as_ref());
    // two processes over one database: no shared cancel flag
    let stepper = orchestrator(inner.clone(), Arc::new(Steady), Arc::new(MemorySink::new()));
    let admin = Arc::new(orchestrator(held.clone(), Arc::new(Steady), Arc::new(MemorySink::new())));

    let canceller = {
        let (admin, id) = (admin.clone(), run.id.clone());
        thread::spawn(move || admin.cancel(&id, "operator"))
    };
    held.entered.wait();
    assert!(matches!(stepper.step(&run.id), Ok(StepOutcome::Suspended { .. })));
    held.proceed.wait();
    assert_eq!(canceller.join().unwrap().unwrap().phase, Phase::Killed);

    let stored = inner.load_run(&run.id).unwrap().unwrap();
    assert_eq!((stored.phase, stored.status), (Phase::Killed, RunStatus::Terminal));
    assert!(inner.open_checkpoint(&run.id).unwrap().is_none());
    assert_eq!(inner.checkpoints_for_run(&run.id).unwrap()[0].decision, Some(Decision::Kill));
    assert_eq!(stepper.resume(&run.id).unwrap(), ResumePlan::Finished { phase: Phase::Killed });
    assert!(matches!(stepper.step(&run.id), Ok(StepOutcome::Finished { .. })));
}

#[test]
fn cancel_of_unknown_or_finished_run_leaves_stepping_alone() {
    let store: Arc<dyn Storage> = Arc::new(InMemoryStorage::new());
    let orch = orchestrator(store.clone(), Arc::new(Steady), Arc::new(MemorySink::new()));
    assert!(matches!(orch.cancel(&RunId::from_str("nope"), "x"), Err(FunnelError::NotFound { .. })));
    assert!(matches!(orch.step(&RunId::from_str("nope")), Err(FunnelError::NotFound { .. })));

    let run = orch.start_run("idea", None).unwrap();
    orch.cancel(&run.id, "operator").unwrap();
    assert!(matches!(orch.cancel(&run.id, "again"), Err(FunnelError::TerminalState { .. })));

    let next = orch.start_run("other idea", None).unwrap();
    assert!(matches!(orch.step(&next.id), Ok(StepOutcome::Moved { .. })));
}

#[test]
fn cancel_while_suspended_closes_checkpoint() {
    let store: Arc<dyn Storage> = Arc::new(InMemoryStorage::new());
    let orch = orchestrator(store.clone(), Arc::new(Steady), Arc::new(MemorySink::new()));
    let run = orch.start_run("idea", None).unwrap();
    orch.drive(&run.id).unwrap();
    orch.cancel(&run.id, "operator").unwrap();
    let cps = store.checkpoints_for_run(&run.id).unwrap();
    assert_eq!(cps.len(), 1);
    assert!(cps[0].resolved);
    assert_eq!(cps[0].decision, Some(Decision::Kill));
    assert_eq!(orch.resume(&run.id).unwrap(), ResumePlan::Finished { phase: Phase::Killed });
}

#[test]
fn suspended_run_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("funnel.db");
    let run_id = {
        let store = Arc::new(SqliteStorage::open(&db).unwrap());
        let orch = orchestrator(store, Arc::new(Steady), Arc::new(MemorySink::new()));
        let run = orch.start_run("idea", Some("req-9".into())).unwrap();
        orch.drive(&run.id).unwrap();
        run.id
    };

    let store = Arc::new(SqliteStorage::open(&db).unwrap());
    let orch = orchestrator(store, Arc::new(Steady), Arc::new(MemorySink::new()));
    let plan = orch.resume(&run_id).unwrap();
    assert_eq!(plan, orch.resume(&run_id).unwrap());
    let ResumePlan::AwaitDecision { checkpoint_id } = plan else { panic!("expected a pending decision, got {plan:?}") };
    let run = orch.resolve(&checkpoint_id, "KILL").unwrap();
    assert_eq!(run.phase, Phase::Killed);
    assert_eq!(run.terminal_reason.as_deref(), Some("KILL at VIABILITY"));
}

#[test]
fn missing_agent_is_a_config_error() {
    let policy = compile_policy(&PolicyPack::standard(PivotBudget::Unbounded)).unwrap();
    let mut agents = AgentRegistry::new();
    agents.register(Phase::Onboarding, Arc::new(Steady)).unwrap();
    let err = Orchestrator::new(Arc::new(InMemoryStorage::new()), agents, Arc::new(MemorySink::new()), policy, options())
        .err()
        .unwrap();
    assert_eq!(err, FunnelError::Config(ConfigError::MissingAgent(Phase::Discovery)));
}
