use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use funnel_core::{
    apply_action, route, Action, BackoffPolicy, Checkpoint, CheckpointId, ConfigError, FunnelError, FunnelResult,
    PhaseArtifact, PivotOrigin, ResumePlan, RouteDecision, RouteState, RoutingPolicy, RunId, Target, ValidationRun,
};
use funnel_events::{notify, EventKind, EventSink, FunnelEvent, RunManifest};
use funnel_executor::{AgentRegistry, CancelFlag, PhaseExecutor};
use funnel_hitl::{presented_context, CheckpointController, CheckpointRequest};
use funnel_policy::CompiledPolicy;
use funnel_storage::Storage;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::util::now_unix;

#[derive(Clone, Copy, Debug)]
pub struct OrchestratorOptions {
    pub backoff: BackoffPolicy,
    pub step_limit: u32,
}

impl Default for OrchestratorOptions {
    fn default() -> Self {
        Self { backoff: BackoffPolicy::default(), step_limit: 64 }
    }
}

/// What one `step` did.
#[derive(Clone, Debug)]
pub enum StepOutcome {
    /// The run moved (advanced, pivoted or terminated).
    Moved { run: ValidationRun, route: RouteDecision },
    /// A checkpoint was raised and the run now waits on it.
    Suspended { run: ValidationRun, checkpoint: Checkpoint },
    /// Already waiting on this checkpoint; nothing was done.
    Waiting { checkpoint_id: CheckpointId },
    /// Terminal; nothing was done.
    Finished { run: ValidationRun },
}

impl StepOutcome {
    /// Whether another step could make progress without outside input.
    pub fn can_continue(&self) -> bool {
        matches!(self, StepOutcome::Moved { run, .. } if !run.is_terminal())
    }
}

#[derive(Clone, Debug)]
pub struct DriveReport {
    pub run_id: RunId,
    pub steps: u32,
    pub last: StepOutcome,
    pub hit_step_limit: bool,
}

#[derive(Clone, Debug, Serialize)]
pub struct ArtifactSummary {
    pub phase: funnel_core::Phase,
    pub version: u32,
    pub signal: String,
    pub summary: String,
}

/// Externally visible state of a run.
#[derive(Clone, Debug, Serialize)]
pub struct RunState {
    pub run: ValidationRun,
    /// Latest artifact of every visited phase, in funnel order.
    pub latest: Vec<ArtifactSummary>,
    pub open_checkpoint: Option<Checkpoint>,
}

/// Drives runs through the funnel: execute, route, suspend, repeat.
///
/// Runs are independent and may be stepped from different threads; a run is
/// only ever stepped by one caller at a time.
pub struct Orchestrator {
    store: Arc<dyn Storage>,
    events: Arc<dyn EventSink>,
    executor: PhaseExecutor,
    controller: CheckpointController,
    routing: RoutingPolicy,
    policy_hash: String,
    step_limit: u32,
    active: Mutex<HashSet<RunId>>,
    cancels: Mutex<HashMap<RunId, CancelFlag>>,
}

/// Removes the run from the active set when the step ends.
struct ActiveRun<'a> {
    set: &'a Mutex<HashSet<RunId>>,
    run_id: RunId,
}

impl Drop for ActiveRun<'_> {
    fn drop(&mut self) {
        lock(self.set).remove(&self.run_id);
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn Storage>,
        agents: AgentRegistry,
        events: Arc<dyn EventSink>,
        policy: CompiledPolicy,
        options: OrchestratorOptions,
    ) -> FunnelResult<Self> {
        policy.routing.validate()?;
        if let Some(phase) = agents.missing().first() {
            return Err(ConfigError::MissingAgent(*phase).into());
        }
        Ok(Self {
            executor: PhaseExecutor::new(store.clone(), agents, events.clone(), options.backoff),
            controller: CheckpointController::new(store.clone(), events.clone()),
            store,
            events,
            routing: policy.routing,
            policy_hash: policy.hash,
            step_limit: options.step_limit.max(1),
            active: Mutex::new(HashSet::new()),
            cancels: Mutex::new(HashMap::new()),
        })
    }

    pub fn routing(&self) -> &RoutingPolicy {
        &self.routing
    }

    /// Create a run at ONBOARDING. Repeating a request token returns the run it created.
    pub fn start_run(&self, initial_context: &str, request_token: Option<String>) -> FunnelResult<ValidationRun> {
        let now = now_unix();
        let fresh = ValidationRun::new(initial_context, request_token, self.policy_hash.clone(), now);
        let run = self.store.create_run(&fresh)?;
        if run.id != fresh.id {
            debug!(run_id = %run.id, "request token already used; returning existing run");
            return Ok(run);
        }
        info!(run_id = %run.id, policy = %self.policy_hash, "run started");
        self.emit(&run, EventKind::RunStarted, "run started".into(), now);
        self.emit(&run, EventKind::PhaseEntered, format!("entered {}", run.phase), now);
        Ok(run)
    }

    pub fn run_state(&self, run_id: &RunId) -> FunnelResult<RunState> {
        let run = self.load(run_id)?;
        let mut latest = vec![];
        for phase in funnel_core::Phase::WORK {
            if let Some(a) = self.store.latest_artifact(run_id, phase)? {
                latest.push(ArtifactSummary {
                    phase,
                    version: a.version,
                    signal: a.signal.label().to_string(),
                    summary: a.payload.summary(),
                });
            }
        }
        let open_checkpoint = self.store.open_checkpoint(run_id)?;
        Ok(RunState { run, latest, open_checkpoint })
    }

    /// Take the next step the persisted state calls for.
    pub fn step(&self, run_id: &RunId) -> FunnelResult<StepOutcome> {
        let _active = self.enter(run_id)?;
        let snapshot = self.store.load_snapshot(run_id)?;
        let plan = funnel_core::plan_resume(&snapshot)?;
        debug!(run_id = %run_id, ?plan, "step");
        let run = snapshot.run;
        let cancel = match &plan {
            ResumePlan::Finished { .. } => return Ok(StepOutcome::Finished { run }),
            ResumePlan::AwaitDecision { checkpoint_id } => {
                return Ok(StepOutcome::Waiting { checkpoint_id: checkpoint_id.clone() })
            }
            ResumePlan::ExecutePhase { .. } | ResumePlan::RouteArtifact { .. } => self.cancel_flag(run_id),
        };
        let result = match plan {
            ResumePlan::RouteArtifact { phase, version } => match snapshot.current_artifact {
                Some(artifact) => self.route_artifact(&run, &artifact, &cancel),
                None => Err(FunnelError::Inconsistent {
                    run_id: run.id.clone(),
                    detail: format!("planned to route {phase}@v{version} but it is gone"),
                }),
            },
            _ => {
                let policy = self.routing.phase_policy(run.phase)?;
                self.executor
                    .execute(&run, policy, &cancel, now_unix())
                    .and_then(|artifact| self.route_artifact(&run, &artifact, &cancel))
            }
        };
        // A cancel, here or in another process, makes the run terminal under us;
        // report that rather than the refused write.
        result.map_err(|e| {
            if cancel.is_cancelled() || self.terminated_elsewhere(run_id) {
                FunnelError::Cancelled(run_id.clone())
            } else {
                e
            }
        })
    }

    /// Step until the run suspends, terminates or the step limit is hit.
    pub fn drive(&self, run_id: &RunId) -> FunnelResult<DriveReport> {
        let mut steps = 0;
        loop {
            let last = self.step(run_id)?;
            steps += 1;
            let limit = steps >= self.step_limit;
            if !last.can_continue() || limit {
                if limit && last.can_continue() {
                    warn!(run_id = %run_id, steps, "step limit reached");
                }
                let hit_step_limit = limit && last.can_continue();
                return Ok(DriveReport { run_id: run_id.clone(), steps, last, hit_step_limit });
            }
        }
    }

    /// Apply a human decision and hand the run back for stepping.
    pub fn resolve(&self, checkpoint_id: &CheckpointId, decision: &str) -> FunnelResult<ValidationRun> {
        let cp = self
            .store
            .load_checkpoint(checkpoint_id)?
            .ok_or_else(|| FunnelError::checkpoint_not_found(checkpoint_id))?;
        let _active = self.enter(&cp.run_id)?;
        let now = now_unix();
        let res = self.controller.resolve(checkpoint_id, decision, now)?;
        self.after_move(&res.run, &res.action, now);
        Ok(res.run)
    }

    /// Next step after a restart. Read-only.
    pub fn resume(&self, run_id: &RunId) -> FunnelResult<ResumePlan> {
        self.controller.resume_from_crash(run_id)
    }

    /// Administrative kill. In-flight execution observes the flag and writes nothing.
    pub fn cancel(&self, run_id: &RunId, reason: &str) -> FunnelResult<ValidationRun> {
        self.load(run_id)?.ensure_not_terminal()?;
        let flag = self.cancel_flag(run_id);
        flag.cancel();
        let now = now_unix();
        let run = match self.controller.cancel(run_id, reason, now) {
            Ok(run) => run,
            Err(e) => {
                warn!(run_id = %run_id, error = %e, "cancel failed; run left as it was");
                flag.reset();
                lock(&self.cancels).remove(run_id);
                return Err(e);
            }
        };
        lock(&self.cancels).remove(run_id);
        self.emit(&run, EventKind::RunTerminated, format!("cancelled: {reason}"), now);
        Ok(run)
    }

    /// Summary of a run for the event log; meaningful once the run is terminal.
    pub fn manifest(&self, run_id: &RunId) -> FunnelResult<RunManifest> {
        let run = self.load(run_id)?;
        let artifacts = self.store.artifacts_for_run(run_id)?;
        let checkpoints = self.store.checkpoints_for_run(run_id)?;
        Ok(RunManifest::build(&run, &artifacts, &checkpoints))
    }

    fn route_artifact(&self, run: &ValidationRun, artifact: &PhaseArtifact, cancel: &CancelFlag) -> FunnelResult<StepOutcome> {
        let now = now_unix();
        let decision = route(&self.routing, run.phase, artifact.signal, &RouteState::from(run))?;
        info!(
            run_id = %run.id,
            phase = %run.phase,
            signal = artifact.signal.label(),
            action = decision.action.name(),
            budget_exhausted = decision.budget_exhausted,
            "routed"
        );
        if let Action::RequestHumanDecision { .. } = decision.action {
            if cancel.is_cancelled() {
                return Err(FunnelError::Cancelled(run.id.clone()));
            }
            let context = presented_context(run, artifact, &decision, self.routing.max_pivots);
            let request = CheckpointRequest::from_route(&decision, context)?;
            let (run, checkpoint) = self.controller.suspend(run, request, now)?;
            return Ok(StepOutcome::Suspended { run, checkpoint });
        }
        let next_version = match decision.target() {
            Target::Phase(p) => self.store.next_version(&run.id, p)?,
            Target::Terminal(_) | Target::AwaitDecision => 0,
        };
        let next = apply_action(run, &decision.action, artifact.signal.label(), PivotOrigin::Router, next_version, now)?;
        self.store.save_run(&next)?;
        self.after_move(&next, &decision.action, now);
        Ok(StepOutcome::Moved { run: next, route: decision })
    }

    fn after_move(&self, run: &ValidationRun, action: &Action, now: i64) {
        if run.is_terminal() {
            info!(run_id = %run.id, outcome = %run.phase, "run terminated");
            let reason = run.terminal_reason.clone().unwrap_or_default();
            self.emit(run, EventKind::RunTerminated, reason, now);
            lock(&self.cancels).remove(&run.id);
        } else if !matches!(action, Action::RequestHumanDecision { .. }) {
            self.emit(run, EventKind::PhaseEntered, format!("{} into {}", action.name(), run.phase), now);
        }
    }

    fn emit(&self, run: &ValidationRun, kind: EventKind, summary: String, now: i64) {
        notify(self.events.as_ref(), &FunnelEvent::new(&run.id, run.phase, run.current_version, kind, summary, now));
    }

    fn load(&self, run_id: &RunId) -> FunnelResult<ValidationRun> {
        self.store.load_run(run_id)?.ok_or_else(|| FunnelError::run_not_found(run_id))
    }

    fn enter(&self, run_id: &RunId) -> FunnelResult<ActiveRun<'_>> {
        if !lock(&self.active).insert(run_id.clone()) {
            return Err(FunnelError::Conflict(format!("run {run_id} is already being stepped")));
        }
        Ok(ActiveRun { set: &self.active, run_id: run_id.clone() })
    }

    fn terminated_elsewhere(&self, run_id: &RunId) -> bool {
        matches!(self.store.load_run(run_id), Ok(Some(run)) if run.is_terminal())
    }

    fn cancel_flag(&self, run_id: &RunId) -> CancelFlag {
        lock(&self.cancels).entry(run_id.clone()).or_default().clone()
    }
}
