use crate::{Checkpoint, PhaseArtifact, ValidationRun};

/// Minimal persisted marker a fresh process needs to pick a run back up.
/// The imperative shell is responsible for producing this snapshot from storage.
#[derive(Clone, Debug)]
pub struct RunSnapshot {
    pub run: ValidationRun,
    /// Artifact of the current phase at `run.current_version`, if written.
    pub current_artifact: Option<PhaseArtifact>,
    pub open_checkpoint: Option<Checkpoint>,
}
