use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use funnel_core::{ConfigError, Phase, PhaseArtifact, PhasePayload, PivotRecord, RunId, Signal};
use thiserror::Error;

/// What an agent sees when asked to do a phase's work.
#[derive(Clone, Debug)]
pub struct PhaseInput {
    pub run_id: RunId,
    pub phase: Phase,
    pub version: u32,
    /// 1-based attempt within this execution.
    pub attempt: u32,
    pub initial_context: String,
    /// Latest artifact of every earlier phase, in funnel order.
    pub upstream: Vec<PhaseArtifact>,
    /// The pivot that re-entered this phase, if any.
    pub pivot: Option<PivotRecord>,
    /// Features cut by the latest feasibility assessment after a downgrade.
    pub downgraded_scope: Vec<String>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct AgentOutput {
    pub payload: PhasePayload,
    pub signal: Signal,
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum AgentError {
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("transient failure: {0}")]
    Transient(String),
    #[error("fatal failure: {0}")]
    Fatal(String),
    #[error("contract violation: {0}")]
    Contract(String),
}

/// External worker producing a phase's payload and classification.
///
/// `budget` is the wall-clock allowance for this attempt; answers arriving
/// later are discarded as timeouts.
pub trait PhaseAgent: Send + Sync {
    fn run(&self, input: &PhaseInput, budget: Duration) -> Result<AgentOutput, AgentError>;
}

#[derive(Clone, Default)]
pub struct AgentRegistry {
    agents: HashMap<Phase, Arc<dyn PhaseAgent>>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// One agent serving every work phase.
    pub fn uniform(agent: Arc<dyn PhaseAgent>) -> Self {
        let mut reg = Self::new();
        for phase in Phase::WORK {
            reg.agents.insert(phase, agent.clone());
        }
        reg
    }

    pub fn register(&mut self, phase: Phase, agent: Arc<dyn PhaseAgent>) -> Result<(), ConfigError> {
        if phase.is_terminal() {
            return Err(ConfigError::NotAWorkPhase(phase));
        }
        self.agents.insert(phase, agent);
        Ok(())
    }

    pub fn get(&self, phase: Phase) -> Result<Arc<dyn PhaseAgent>, ConfigError> {
        self.agents.get(&phase).cloned().ok_or(ConfigError::MissingAgent(phase))
    }

    /// Work phases with no agent.
    pub fn missing(&self) -> Vec<Phase> {
        Phase::WORK.into_iter().filter(|p| !self.agents.contains_key(p)).collect()
    }
}

/// Shared cancellation switch for one run.
#[derive(Clone, Debug, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Withdraw a cancel that did not take effect.
    pub fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}
