use funnel_core::{
    Checkpoint, CheckpointId, Outcome, Phase, PhaseArtifact, PhasePayload, RunId, RunSnapshot, Signal, ValidationRun,
};

use crate::error::{StoreError, StoreResult};

/// Result of an artifact put.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PutOutcome {
    Inserted,
    /// Same content already stored at these coordinates; nothing written.
    AlreadyPresent,
}

/// Durable state of runs, artifacts and checkpoints.
///
/// Multi-record writes (`suspend_run`, `resolve_checkpoint`, `cancel_run`)
/// are atomic: either every record lands or none does. Terminal runs refuse
/// every write, artifacts included.
pub trait Storage: Send + Sync {
    /// Insert a new run. A run carrying a `request_token` that is already
    /// stored returns the existing run instead of creating a second one.
    fn create_run(&self, run: &ValidationRun) -> StoreResult<ValidationRun>;
    fn load_run(&self, run_id: &RunId) -> StoreResult<Option<ValidationRun>>;
    /// Overwrite a non-terminal run.
    fn save_run(&self, run: &ValidationRun) -> StoreResult<()>;
    fn list_runs(&self) -> StoreResult<Vec<ValidationRun>>;

    /// Store an immutable artifact. `version` must be the latest stored
    /// version of (run, phase) plus one; re-putting identical content at an
    /// existing version is a no-op.
    fn put_artifact(&self, artifact: &PhaseArtifact) -> StoreResult<PutOutcome>;
    fn latest_artifact(&self, run_id: &RunId, phase: Phase) -> StoreResult<Option<PhaseArtifact>>;
    fn artifact_at(&self, run_id: &RunId, phase: Phase, version: u32) -> StoreResult<Option<PhaseArtifact>>;
    /// Every artifact of a run in the order they were written.
    fn artifacts_for_run(&self, run_id: &RunId) -> StoreResult<Vec<PhaseArtifact>>;

    fn open_checkpoint(&self, run_id: &RunId) -> StoreResult<Option<Checkpoint>>;
    fn load_checkpoint(&self, id: &CheckpointId) -> StoreResult<Option<Checkpoint>>;
    fn checkpoints_for_run(&self, run_id: &RunId) -> StoreResult<Vec<Checkpoint>>;

    /// Persist a new open checkpoint together with the suspended run.
    /// Fails with `Conflict` when the run already has an open checkpoint.
    fn suspend_run(&self, run: &ValidationRun, checkpoint: &Checkpoint) -> StoreResult<()>;

    /// Mark `checkpoint` resolved and save `run` in one write. Fails with
    /// `AlreadyResolved` if the stored checkpoint was resolved first.
    fn resolve_checkpoint(&self, checkpoint: &Checkpoint, run: &ValidationRun) -> StoreResult<()>;

    /// Kill a live run, closing its open checkpoint (if any) with KILL in the
    /// same write. Returns the stored KILLED run.
    fn cancel_run(&self, run_id: &RunId, reason: &str, now_unix: i64) -> StoreResult<ValidationRun>;

    /// Append the next version of (run, phase) and return it.
    fn put(&self, run_id: &RunId, phase: Phase, payload: PhasePayload, signal: Signal, now_unix: i64) -> StoreResult<u32> {
        let version = self.latest_artifact(run_id, phase)?.map(|a| a.version + 1).unwrap_or(1);
        self.put_artifact(&PhaseArtifact { run_id: run_id.clone(), phase, version, payload, signal, created_at_unix: now_unix })?;
        Ok(version)
    }

    /// Next version a visit to `phase` will carry.
    fn next_version(&self, run_id: &RunId, phase: Phase) -> StoreResult<u32> {
        Ok(self.latest_artifact(run_id, phase)?.map(|a| a.version + 1).unwrap_or(1))
    }

    /// Everything resume planning reads, in one place.
    fn load_snapshot(&self, run_id: &RunId) -> StoreResult<RunSnapshot> {
        let run = self
            .load_run(run_id)?
            .ok_or_else(|| StoreError::NotFound { what: "run", id: run_id.to_string() })?;
        let current_artifact = if run.is_terminal() {
            None
        } else {
            self.artifact_at(run_id, run.phase, run.current_version)?
        };
        let open_checkpoint = self.open_checkpoint(run_id)?;
        Ok(RunSnapshot { run, current_artifact, open_checkpoint })
    }
}

/// The KILLED form of a stored live run, as `cancel_run` writes it.
pub fn killed_run(stored: &ValidationRun, reason: &str, now_unix: i64) -> StoreResult<ValidationRun> {
    let mut killed = stored.clone();
    killed
        .terminate(Outcome::Killed, reason, now_unix)
        .map_err(|e| StoreError::Conflict(e.to_string()))?;
    Ok(killed)
}

/// Shared checks for `put_artifact` implementations.
///
/// `existing` is whatever is stored at the artifact's coordinates and
/// `latest` the highest stored version for its (run, phase).
pub fn check_put(artifact: &PhaseArtifact, existing: Option<&PhaseArtifact>, latest: Option<u32>) -> StoreResult<PutOutcome> {
    let conflict = |detail: &str| StoreError::VersionConflict {
        run_id: artifact.run_id.clone(),
        phase: artifact.phase,
        version: artifact.version,
        detail: detail.to_string(),
    };
    if artifact.payload.phase() != artifact.phase || artifact.signal.phase() != artifact.phase {
        return Err(conflict("payload or signal belongs to another phase"));
    }
    match existing {
        Some(stored) if stored.same_content(artifact) => Ok(PutOutcome::AlreadyPresent),
        Some(_) => Err(conflict("a different artifact is already stored at this version")),
        None if artifact.version == latest.unwrap_or(0) + 1 => Ok(PutOutcome::Inserted),
        None => Err(conflict(&format!("expected version {}", latest.unwrap_or(0) + 1))),
    }
}
