use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use funnel_core::{
    BackoffPolicy, Checkpoint, Phase, PhaseArtifact, PhasePayload, PivotBudget, ResumePlan, Signal, ValidationRun,
};
use funnel_events::{FunnelEvent, MemorySink};
use funnel_executor::{AgentError, AgentOutput, AgentRegistry, CancelFlag, PhaseAgent, PhaseExecutor, PhaseInput};
use funnel_policy::{compile_policy, PolicyPack};
use funnel_storage::{InMemoryStorage, Storage};
use serde::Deserialize;

use crate::orchestrator::{Orchestrator, OrchestratorOptions, StepOutcome};
use crate::util::now_unix;

#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FailKind {
    Transient,
    Fatal,
    Timeout,
}

/// One scripted attempt: a failure, or a signal with an optional payload.
#[derive(Clone, Debug, Deserialize)]
pub struct ScriptStep {
    #[serde(default)]
    pub signal: Option<String>,
    #[serde(default)]
    pub fail: Option<FailKind>,
    /// Payload fields; the `kind` tag is filled in from the phase.
    #[serde(default)]
    pub payload: Option<serde_json::Value>,
}

/// `script.yaml` of a scenario directory.
#[derive(Clone, Debug, Deserialize)]
pub struct Script {
    pub name: String,
    #[serde(default)]
    pub initial_context: String,
    pub max_pivots: PivotBudget,
    #[serde(default)]
    pub policy: Option<PolicyPack>,
    pub phases: BTreeMap<Phase, Vec<ScriptStep>>,
    /// Decisions fed to checkpoints, in order.
    #[serde(default)]
    pub decisions: Vec<String>,
    /// Simulate a process crash right after this phase's first artifact write.
    #[serde(default)]
    pub crash_after_write: Option<Phase>,
}

impl Script {
    pub fn load(path: &Path) -> Result<Self> {
        let s = std::fs::read_to_string(path).with_context(|| format!("read script: {}", path.display()))?;
        serde_yaml::from_str(&s).with_context(|| format!("parse script: {}", path.display()))
    }

    pub fn agent(&self) -> Result<ScriptedAgent> {
        ScriptedAgent::compile(&self.phases)
    }

    pub fn policy_pack(&self) -> PolicyPack {
        let mut pack = self.policy.clone().unwrap_or_else(|| PolicyPack::standard(self.max_pivots));
        pack.max_pivots = Some(self.max_pivots);
        pack
    }
}

/// Phase agent answering from a script; attempts consume steps in order.
pub struct ScriptedAgent {
    steps: Mutex<HashMap<Phase, VecDeque<Result<AgentOutput, AgentError>>>>,
    inputs: Mutex<Vec<PhaseInput>>,
}

impl ScriptedAgent {
    pub fn compile(phases: &BTreeMap<Phase, Vec<ScriptStep>>) -> Result<Self> {
        let mut steps = HashMap::new();
        for (phase, script) in phases {
            if phase.is_terminal() {
                return Err(anyhow!("script for terminal phase {phase}"));
            }
            let queue = script
                .iter()
                .enumerate()
                .map(|(i, s)| compile_step(*phase, s).with_context(|| format!("{phase} step {}", i + 1)))
                .collect::<Result<VecDeque<_>>>()?;
            steps.insert(*phase, queue);
        }
        Ok(Self { steps: Mutex::new(steps), inputs: Mutex::new(vec![]) })
    }

    /// Every input the agent was called with.
    pub fn inputs(&self) -> Vec<PhaseInput> {
        self.inputs.lock().map(|v| v.clone()).unwrap_or_default()
    }
}

fn compile_step(phase: Phase, step: &ScriptStep) -> Result<Result<AgentOutput, AgentError>> {
    match (step.fail, &step.signal) {
        (Some(FailKind::Transient), _) => Ok(Err(AgentError::Transient("scripted transient failure".into()))),
        (Some(FailKind::Fatal), _) => Ok(Err(AgentError::Fatal("scripted fatal failure".into()))),
        (Some(FailKind::Timeout), _) => Ok(Err(AgentError::Timeout(Duration::ZERO))),
        (None, Some(label)) => {
            let signal = Signal::parse(phase, label)?;
            let payload = match &step.payload {
                Some(fields) => payload_for(phase, fields.clone())?,
                None => PhasePayload::empty_for(phase).ok_or_else(|| anyhow!("no payload for {phase}"))?,
            };
            Ok(Ok(AgentOutput { payload, signal }))
        }
        (None, None) => Err(anyhow!("step needs a signal or a failure")),
    }
}

fn payload_for(phase: Phase, mut fields: serde_json::Value) -> Result<PhasePayload> {
    let obj = fields.as_object_mut().ok_or_else(|| anyhow!("payload must be a mapping"))?;
    obj.entry("kind").or_insert_with(|| serde_json::Value::String(phase.as_str().to_ascii_lowercase()));
    serde_json::from_value(fields).context("payload does not match the phase")
}

impl PhaseAgent for ScriptedAgent {
    fn run(&self, input: &PhaseInput, budget: Duration) -> Result<AgentOutput, AgentError> {
        if let Ok(mut seen) = self.inputs.lock() {
            seen.push(input.clone());
        }
        let mut steps = self.steps.lock().map_err(|_| AgentError::Fatal("script lock poisoned".into()))?;
        match steps.get_mut(&input.phase).and_then(|q| q.pop_front()) {
            Some(Err(AgentError::Timeout(_))) => Err(AgentError::Timeout(budget)),
            Some(step) => step,
            None => Err(AgentError::Fatal(format!("script exhausted for {}", input.phase))),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ScenarioExpected {
    pub scenario_id: String,
    /// Final phase: VALIDATED, KILLED, or the phase the run is suspended in.
    pub final_phase: Phase,
    #[serde(default)]
    pub suspended: bool,
    pub pivot_count: u32,
    pub checkpoints: usize,
    /// Latest version per phase.
    #[serde(default)]
    pub versions: BTreeMap<Phase, u32>,
    #[serde(default)]
    pub degraded: Vec<Phase>,
}

pub fn load_expected(dir: &Path) -> Result<ScenarioExpected> {
    let p = dir.join("expected.yaml");
    let s = std::fs::read_to_string(&p).with_context(|| format!("read expected.yaml: {}", p.display()))?;
    let exp: ScenarioExpected = serde_yaml::from_str(&s).with_context(|| "parse expected.yaml")?;
    Ok(exp)
}

#[derive(Debug)]
pub struct ScenarioResult {
    pub run: ValidationRun,
    pub artifacts: Vec<PhaseArtifact>,
    pub checkpoints: Vec<Checkpoint>,
    pub events: Vec<FunnelEvent>,
    /// Decisions actually applied.
    pub decisions: Vec<String>,
    /// Plan a fresh orchestrator derived after the simulated crash.
    pub resumed_with: Option<ResumePlan>,
    pub agent_inputs: Vec<PhaseInput>,
}

impl ScenarioResult {
    pub fn latest_version(&self, phase: Phase) -> Option<u32> {
        self.artifacts.iter().filter(|a| a.phase == phase).map(|a| a.version).max()
    }
}

/// Run `script.yaml` of `dir` against in-memory storage, answering
/// checkpoints from the script's decision list.
pub fn simulate(dir: &Path) -> Result<ScenarioResult> {
    let script = Script::load(&dir.join("script.yaml"))?;
    let agent = Arc::new(script.agent()?);
    let policy = compile_policy(&script.policy_pack())?;
    let store: Arc<dyn Storage> = Arc::new(InMemoryStorage::new());
    let sink = Arc::new(MemorySink::new());
    let options = OrchestratorOptions { backoff: BackoffPolicy { base_ms: 0, max_ms: 0 }, step_limit: 256 };
    let build = || {
        Orchestrator::new(store.clone(), AgentRegistry::uniform(agent.clone()), sink.clone(), policy.clone(), options)
    };

    let mut orch = build()?;
    let run = orch.start_run(&script.initial_context, Some(format!("scenario:{}", script.name)))?;
    let mut decisions: VecDeque<String> = script.decisions.iter().cloned().collect();
    let mut applied = vec![];
    let mut crash_pending = script.crash_after_write;
    let mut resumed_with = None;

    for _ in 0..options.step_limit {
        if let Some(phase) = crash_pending {
            if let ResumePlan::ExecutePhase { phase: p, .. } = orch.resume(&run.id)? {
                if p == phase {
                    // Write the artifact, then lose the process before it is routed.
                    let current = store.load_run(&run.id)?.ok_or_else(|| anyhow!("run vanished"))?;
                    let executor = PhaseExecutor::new(
                        store.clone(),
                        AgentRegistry::uniform(agent.clone()),
                        sink.clone(),
                        options.backoff,
                    );
                    executor.execute(&current, orch.routing().phase_policy(phase)?, &CancelFlag::new(), now_unix())?;
                    orch = build()?;
                    resumed_with = Some(orch.resume(&run.id)?);
                    crash_pending = None;
                }
            }
        }
        match orch.step(&run.id)? {
            StepOutcome::Moved { .. } => {}
            StepOutcome::Finished { .. } => break,
            StepOutcome::Suspended { checkpoint, .. } => match decisions.pop_front() {
                Some(d) => {
                    orch.resolve(&checkpoint.id, &d)?;
                    applied.push(d);
                }
                None => break,
            },
            StepOutcome::Waiting { checkpoint_id } => match decisions.pop_front() {
                Some(d) => {
                    orch.resolve(&checkpoint_id, &d)?;
                    applied.push(d);
                }
                None => break,
            },
        }
    }

    Ok(ScenarioResult {
        run: store.load_run(&run.id)?.ok_or_else(|| anyhow!("run vanished"))?,
        artifacts: store.artifacts_for_run(&run.id)?,
        checkpoints: store.checkpoints_for_run(&run.id)?,
        events: sink.events(),
        decisions: applied,
        resumed_with,
        agent_inputs: agent.inputs(),
    })
}
