use std::sync::Arc;

use funnel_core::{
    apply_action, decision_action, plan_resume, Action, Checkpoint, CheckpointId, CheckpointKind, ConfigError, Decision,
    FunnelError, FunnelResult, PhaseArtifact, PivotBudget, PivotOrigin, ResumePlan, RouteDecision, RunId, Target,
    ValidationRun,
};
use funnel_events::{notify, EventKind, EventSink, FunnelEvent};
use funnel_storage::Storage;
use serde_json::json;
use tracing::info;

use crate::ask::{format_ask, option_consequences, recommend};

/// A checkpoint about to be raised.
#[derive(Clone, Debug)]
pub struct CheckpointRequest {
    pub kind: CheckpointKind,
    pub options: Vec<Decision>,
    pub pending_action: Option<Action>,
    pub budget_exhausted: bool,
    pub context: serde_json::Value,
}

impl CheckpointRequest {
    /// The checkpoint a REQUEST_HUMAN_DECISION route asks for.
    pub fn from_route(routed: &RouteDecision, context: serde_json::Value) -> FunnelResult<Self> {
        match &routed.action {
            Action::RequestHumanDecision { kind, options } => Ok(Self {
                kind: *kind,
                options: options.clone(),
                pending_action: routed.gated.clone(),
                budget_exhausted: routed.budget_exhausted,
                context,
            }),
            other => Err(FunnelError::Conflict(format!("route {} does not ask for a decision", other.name()))),
        }
    }
}

/// Outcome of resolving a checkpoint.
#[derive(Clone, Debug)]
pub struct Resolution {
    pub run: ValidationRun,
    pub checkpoint: Checkpoint,
    pub action: Action,
}

/// Suspends runs for human input and hands control back once decided.
pub struct CheckpointController {
    store: Arc<dyn Storage>,
    events: Arc<dyn EventSink>,
}

impl CheckpointController {
    pub fn new(store: Arc<dyn Storage>, events: Arc<dyn EventSink>) -> Self {
        Self { store, events }
    }

    /// Persist a new open checkpoint and the SUSPENDED_FOR_INPUT run in one write.
    pub fn suspend(&self, run: &ValidationRun, req: CheckpointRequest, now_unix: i64) -> FunnelResult<(ValidationRun, Checkpoint)> {
        run.ensure_running()?;
        if req.options.is_empty() {
            return Err(ConfigError::EmptyOptions(run.phase).into());
        }
        if req.options.contains(&Decision::Approve) && req.pending_action.is_none() {
            return Err(ConfigError::ApproveWithoutPending(run.phase).into());
        }
        if let Some(open) = self.store.open_checkpoint(&run.id)? {
            return Err(FunnelError::Conflict(format!("run {} already waits on checkpoint {}", run.id, open.id)));
        }
        let mut checkpoint = Checkpoint {
            id: CheckpointId::new(),
            run_id: run.id.clone(),
            phase: run.phase,
            artifact_version: run.current_version,
            kind: req.kind,
            options: req.options,
            presented_context: req.context,
            pending_action: req.pending_action,
            budget_exhausted: req.budget_exhausted,
            resolved: false,
            decision: None,
            decided_at_unix: None,
            created_at_unix: now_unix,
        };
        let ask = format_ask(
            &run.id,
            &format!("{} at {}", checkpoint.kind.as_str(), run.phase),
            &option_consequences(&checkpoint),
            recommend(&checkpoint).label(),
        );
        let mut context = match checkpoint.presented_context.take() {
            serde_json::Value::Object(map) => map,
            serde_json::Value::Null => serde_json::Map::new(),
            other => [("context".to_string(), other)].into_iter().collect(),
        };
        context.insert("ask_md".into(), json!(ask));
        checkpoint.presented_context = serde_json::Value::Object(context);

        let mut suspended = run.clone();
        suspended.suspend(now_unix)?;
        self.store.suspend_run(&suspended, &checkpoint)?;
        info!(run_id = %run.id, phase = %run.phase, checkpoint = %checkpoint.id, options = ?checkpoint.option_labels(), "run suspended for input");
        notify(
            self.events.as_ref(),
            &FunnelEvent::new(
                &run.id,
                run.phase,
                run.current_version,
                EventKind::CheckpointCreated,
                format!("{} options: {}", checkpoint.kind.as_str(), checkpoint.option_labels().join(", ")),
                now_unix,
            ),
        );
        Ok((suspended, checkpoint))
    }

    /// Apply a human decision. Validation order: checkpoint exists, run is
    /// live, checkpoint still open, decision among the offered options.
    pub fn resolve(&self, checkpoint_id: &CheckpointId, decision_label: &str, now_unix: i64) -> FunnelResult<Resolution> {
        let mut checkpoint = self
            .store
            .load_checkpoint(checkpoint_id)?
            .ok_or_else(|| FunnelError::checkpoint_not_found(checkpoint_id))?;
        let run = self
            .store
            .load_run(&checkpoint.run_id)?
            .ok_or_else(|| FunnelError::run_not_found(&checkpoint.run_id))?;
        run.ensure_not_terminal()?;
        if checkpoint.resolved {
            return Err(FunnelError::AlreadyResolved(checkpoint.id.clone()));
        }
        let decision = Decision::parse(decision_label).ok_or_else(|| FunnelError::InvalidDecision {
            decision: decision_label.to_string(),
            options: checkpoint.option_labels(),
        })?;
        let action = decision_action(&checkpoint, decision)?;
        let next_version = match action.target() {
            Target::Phase(p) => self.store.next_version(&run.id, p)?,
            Target::Terminal(_) | Target::AwaitDecision => 0,
        };
        let next = apply_action(&run, &action, decision.label(), PivotOrigin::Human, next_version, now_unix)?;
        checkpoint.mark_resolved(decision, now_unix);
        self.store.resolve_checkpoint(&checkpoint, &next)?;
        info!(run_id = %run.id, checkpoint = %checkpoint.id, decision = decision.label(), action = action.name(), "checkpoint resolved");
        notify(
            self.events.as_ref(),
            &FunnelEvent::new(
                &run.id,
                checkpoint.phase,
                checkpoint.artifact_version,
                EventKind::CheckpointResolved,
                format!("{} chose {}", checkpoint.kind.as_str(), decision.label()),
                now_unix,
            ),
        );
        Ok(Resolution { run: next, checkpoint, action })
    }

    /// Next step for a run, from persisted state only. Never writes.
    pub fn resume_from_crash(&self, run_id: &RunId) -> FunnelResult<ResumePlan> {
        let snapshot = self.store.load_snapshot(run_id)?;
        plan_resume(&snapshot)
    }

    /// Administrative kill. Closes any open checkpoint with KILL in the same write.
    pub fn cancel(&self, run_id: &RunId, reason: &str, now_unix: i64) -> FunnelResult<ValidationRun> {
        let run = self.store.load_run(run_id)?.ok_or_else(|| FunnelError::run_not_found(run_id))?;
        run.ensure_not_terminal()?;
        let killed = self.store.cancel_run(run_id, reason, now_unix)?;
        info!(run_id = %run_id, from = %run.phase, "run cancelled");
        Ok(killed)
    }
}

/// Context shown to the decider: the artifact, its classification and the pivot budget.
pub fn presented_context(run: &ValidationRun, artifact: &PhaseArtifact, routed: &RouteDecision, budget: PivotBudget) -> serde_json::Value {
    json!({
        "run_id": run.id,
        "phase": run.phase,
        "version": artifact.version,
        "signal": artifact.signal.label(),
        "summary": artifact.payload.summary(),
        "artifact": artifact.payload,
        "pivot_count": run.pivot_count,
        "max_pivots": budget.to_string(),
        "budget_exhausted": routed.budget_exhausted,
        "initial_context": run.initial_context,
    })
}
