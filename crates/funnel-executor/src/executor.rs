use std::sync::Arc;
use std::time::{Duration, Instant};

use funnel_core::{
    BackoffPolicy, DegradedReport, FunnelError, FunnelResult, Phase, PhaseArtifact, PhasePayload, PhasePolicy, Signal,
    ValidationRun,
};
use funnel_events::{notify, EventKind, EventSink, FunnelEvent};
use funnel_storage::{PutOutcome, Storage};
use tracing::{debug, info, warn};

use crate::agent::{AgentError, AgentOutput, AgentRegistry, CancelFlag, PhaseInput};
use crate::retry::{classify, decide_retry, RetryDecision};

/// Runs one phase visit: delegates to the phase's agent, retries, and
/// persists exactly one artifact at the run's current version.
pub struct PhaseExecutor {
    store: Arc<dyn Storage>,
    agents: AgentRegistry,
    events: Arc<dyn EventSink>,
    backoff: BackoffPolicy,
}

impl PhaseExecutor {
    pub fn new(store: Arc<dyn Storage>, agents: AgentRegistry, events: Arc<dyn EventSink>, backoff: BackoffPolicy) -> Self {
        Self { store, agents, events, backoff }
    }

    pub fn agents(&self) -> &AgentRegistry {
        &self.agents
    }

    pub fn execute(
        &self,
        run: &ValidationRun,
        policy: &PhasePolicy,
        cancel: &CancelFlag,
        now_unix: i64,
    ) -> FunnelResult<PhaseArtifact> {
        run.ensure_running()?;
        let (phase, version) = (run.phase, run.current_version);
        if let Some(existing) = self.store.artifact_at(&run.id, phase, version)? {
            debug!(run_id = %run.id, %phase, version, "artifact already written; not re-executing");
            return Ok(existing);
        }
        let agent = self.agents.get(phase)?;
        let mut input = build_input(self.store.as_ref(), run)?;
        let budget = Duration::from_secs(policy.time_budget_secs);

        let output = loop {
            if cancel.is_cancelled() {
                info!(run_id = %run.id, %phase, "cancelled before attempt {}", input.attempt);
                return Err(FunnelError::Cancelled(run.id.clone()));
            }
            debug!(run_id = %run.id, %phase, version, attempt = input.attempt, "dispatching phase agent");
            let started = Instant::now();
            let result = agent
                .run(&input, budget)
                .and_then(|out| if started.elapsed() > budget { Err(AgentError::Timeout(budget)) } else { Ok(out) })
                .and_then(|out| check_contract(phase, out));
            let err = match result {
                Ok(out) => break out,
                Err(err) => err,
            };
            match decide_retry(classify(&err), input.attempt, policy.retry_limit, &self.backoff) {
                RetryDecision::RetryAfter(delay) => {
                    warn!(run_id = %run.id, %phase, attempt = input.attempt, error = %err, ?delay, "phase agent failed; retrying");
                    std::thread::sleep(delay);
                    input.attempt += 1;
                }
                RetryDecision::Degrade { reason } => {
                    warn!(run_id = %run.id, %phase, attempt = input.attempt, error = %err, "{reason}; classifying as UNKNOWN");
                    break degraded(phase, input.attempt, &err)?;
                }
            }
        };

        if cancel.is_cancelled() {
            info!(run_id = %run.id, %phase, "cancelled before artifact write");
            return Err(FunnelError::Cancelled(run.id.clone()));
        }
        let artifact = PhaseArtifact {
            run_id: run.id.clone(),
            phase,
            version,
            payload: output.payload,
            signal: output.signal,
            created_at_unix: now_unix,
        };
        match self.store.put_artifact(&artifact)? {
            PutOutcome::Inserted => info!(run_id = %run.id, %phase, version, signal = artifact.signal.label(), "artifact written"),
            PutOutcome::AlreadyPresent => debug!(run_id = %run.id, %phase, version, "artifact re-put ignored"),
        }
        notify(
            self.events.as_ref(),
            &FunnelEvent::new(
                &run.id,
                phase,
                version,
                EventKind::ArtifactWritten,
                format!("{}: {}", artifact.signal.label(), artifact.payload.summary()),
                now_unix,
            ),
        );
        Ok(artifact)
    }
}

fn check_contract(phase: Phase, out: AgentOutput) -> Result<AgentOutput, AgentError> {
    if out.signal.phase() != phase {
        return Err(AgentError::Contract(format!("{phase} agent returned signal {}", out.signal)));
    }
    if out.payload.phase() != phase {
        return Err(AgentError::Contract(format!("{phase} agent returned a {} payload", out.payload.phase())));
    }
    Ok(out)
}

fn degraded(phase: Phase, attempts: u32, err: &AgentError) -> FunnelResult<AgentOutput> {
    Ok(AgentOutput {
        payload: PhasePayload::Degraded(DegradedReport { phase, attempts, last_error: err.to_string() }),
        signal: Signal::unknown(phase)?,
    })
}

/// Assemble the agent's view of the run from persisted state.
pub fn build_input(store: &dyn Storage, run: &ValidationRun) -> FunnelResult<PhaseInput> {
    let mut upstream = vec![];
    for phase in Phase::WORK.into_iter().filter(|p| p.ordinal() < run.phase.ordinal()) {
        if let Some(a) = store.latest_artifact(&run.id, phase)? {
            upstream.push(a);
        }
    }
    let pivot = run.pivot_history.last().filter(|p| p.to_phase == run.phase).cloned();
    let downgraded_scope = if run.pivot_history.iter().any(|p| p.downgrade) {
        match store.latest_artifact(&run.id, Phase::Feasibility)?.map(|a| a.payload) {
            Some(PhasePayload::Feasibility(f)) => f.downgraded_features,
            _ => vec![],
        }
    } else {
        vec![]
    };
    Ok(PhaseInput {
        run_id: run.id.clone(),
        phase: run.phase,
        version: run.current_version,
        attempt: 1,
        initial_context: run.initial_context.clone(),
        upstream,
        pivot,
        downgraded_scope,
    })
}
