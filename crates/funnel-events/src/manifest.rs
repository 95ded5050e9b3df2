use funnel_core::{Checkpoint, CheckpointKind, Phase, PhaseArtifact, PivotRecord, ValidationRun};
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ArtifactEntry {
    pub phase: Phase,
    pub version: u32,
    pub signal: String,
    pub summary: String,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct CheckpointEntry {
    pub id: String,
    pub phase: Phase,
    pub kind: CheckpointKind,
    pub options: Vec<String>,
    pub decision: Option<String>,
}

/// Summary of a finished run, written next to its event log.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct RunManifest {
    pub run_id: String,
    pub outcome: Phase,
    pub terminal_reason: Option<String>,
    pub policy_hash: String,
    pub pivot_count: u32,
    pub pivots: Vec<PivotRecord>,
    pub artifacts: Vec<ArtifactEntry>,
    pub checkpoints: Vec<CheckpointEntry>,
}

impl RunManifest {
    pub fn build(run: &ValidationRun, artifacts: &[PhaseArtifact], checkpoints: &[Checkpoint]) -> Self {
        Self {
            run_id: run.id.to_string(),
            outcome: run.phase,
            terminal_reason: run.terminal_reason.clone(),
            policy_hash: run.policy_hash.clone(),
            pivot_count: run.pivot_count,
            pivots: run.pivot_history.clone(),
            artifacts: artifacts
                .iter()
                .map(|a| ArtifactEntry {
                    phase: a.phase,
                    version: a.version,
                    signal: a.signal.label().to_string(),
                    summary: a.payload.summary(),
                })
                .collect(),
            checkpoints: checkpoints
                .iter()
                .map(|c| CheckpointEntry {
                    id: c.id.to_string(),
                    phase: c.phase,
                    kind: c.kind,
                    options: c.option_labels(),
                    decision: c.decision.map(|d| d.label().to_string()),
                })
                .collect(),
        }
    }
}
