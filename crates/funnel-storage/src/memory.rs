use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use funnel_core::{Checkpoint, CheckpointId, Decision, Phase, PhaseArtifact, RunId, ValidationRun};

use crate::error::{StoreError, StoreResult};
use crate::traits::{check_put, killed_run, PutOutcome, Storage};

/// In-memory storage for tests and scenario simulation. Not durable.
#[derive(Default)]
pub struct InMemoryStorage {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    runs: HashMap<String, ValidationRun>,
    run_order: Vec<RunId>,
    /// Append order is write order.
    artifacts: Vec<PhaseArtifact>,
    checkpoints: Vec<Checkpoint>,
}

impl Inner {
    fn ensure_writable(&self, run_id: &RunId) -> StoreResult<&ValidationRun> {
        match self.runs.get(run_id.as_str()) {
            None => Err(StoreError::NotFound { what: "run", id: run_id.to_string() }),
            Some(stored) if stored.is_terminal() => {
                Err(StoreError::Conflict(format!("run {} is terminal ({})", run_id, stored.phase)))
            }
            Some(stored) => Ok(stored),
        }
    }

    fn open_checkpoint(&self, run_id: &RunId) -> Option<&Checkpoint> {
        self.checkpoints.iter().find(|c| &c.run_id == run_id && !c.resolved)
    }
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> StoreResult<MutexGuard<'_, Inner>> {
        self.inner.lock().map_err(|_| StoreError::Backend("in-memory store lock poisoned".into()))
    }
}

impl Storage for InMemoryStorage {
    fn create_run(&self, run: &ValidationRun) -> StoreResult<ValidationRun> {
        let mut inner = self.lock()?;
        if let Some(token) = &run.request_token {
            if let Some(existing) = inner.runs.values().find(|r| r.request_token.as_ref() == Some(token)) {
                return Ok(existing.clone());
            }
        }
        if inner.runs.contains_key(run.id.as_str()) {
            return Err(StoreError::Conflict(format!("run {} already exists", run.id)));
        }
        inner.runs.insert(run.id.0.clone(), run.clone());
        inner.run_order.push(run.id.clone());
        Ok(run.clone())
    }

    fn load_run(&self, run_id: &RunId) -> StoreResult<Option<ValidationRun>> {
        Ok(self.lock()?.runs.get(run_id.as_str()).cloned())
    }

    fn save_run(&self, run: &ValidationRun) -> StoreResult<()> {
        let mut inner = self.lock()?;
        inner.ensure_writable(&run.id)?;
        inner.runs.insert(run.id.0.clone(), run.clone());
        Ok(())
    }

    fn list_runs(&self) -> StoreResult<Vec<ValidationRun>> {
        let inner = self.lock()?;
        Ok(inner.run_order.iter().filter_map(|id| inner.runs.get(id.as_str()).cloned()).collect())
    }

    fn put_artifact(&self, artifact: &PhaseArtifact) -> StoreResult<PutOutcome> {
        let mut inner = self.lock()?;
        inner.ensure_writable(&artifact.run_id)?;
        let same_slot = |a: &&PhaseArtifact| a.run_id == artifact.run_id && a.phase == artifact.phase;
        let existing = inner.artifacts.iter().filter(same_slot).find(|a| a.version == artifact.version);
        let latest = inner.artifacts.iter().filter(same_slot).map(|a| a.version).max();
        let outcome = check_put(artifact, existing, latest)?;
        if outcome == PutOutcome::Inserted {
            inner.artifacts.push(artifact.clone());
        }
        Ok(outcome)
    }

    fn latest_artifact(&self, run_id: &RunId, phase: Phase) -> StoreResult<Option<PhaseArtifact>> {
        let inner = self.lock()?;
        Ok(inner
            .artifacts
            .iter()
            .filter(|a| &a.run_id == run_id && a.phase == phase)
            .max_by_key(|a| a.version)
            .cloned())
    }

    fn artifact_at(&self, run_id: &RunId, phase: Phase, version: u32) -> StoreResult<Option<PhaseArtifact>> {
        let inner = self.lock()?;
        Ok(inner
            .artifacts
            .iter()
            .find(|a| &a.run_id == run_id && a.phase == phase && a.version == version)
            .cloned())
    }

    fn artifacts_for_run(&self, run_id: &RunId) -> StoreResult<Vec<PhaseArtifact>> {
        let inner = self.lock()?;
        Ok(inner.artifacts.iter().filter(|a| &a.run_id == run_id).cloned().collect())
    }

    fn open_checkpoint(&self, run_id: &RunId) -> StoreResult<Option<Checkpoint>> {
        Ok(self.lock()?.open_checkpoint(run_id).cloned())
    }

    fn load_checkpoint(&self, id: &CheckpointId) -> StoreResult<Option<Checkpoint>> {
        Ok(self.lock()?.checkpoints.iter().find(|c| &c.id == id).cloned())
    }

    fn checkpoints_for_run(&self, run_id: &RunId) -> StoreResult<Vec<Checkpoint>> {
        let inner = self.lock()?;
        Ok(inner.checkpoints.iter().filter(|c| &c.run_id == run_id).cloned().collect())
    }

    fn suspend_run(&self, run: &ValidationRun, checkpoint: &Checkpoint) -> StoreResult<()> {
        let mut inner = self.lock()?;
        inner.ensure_writable(&run.id)?;
        if let Some(open) = inner.open_checkpoint(&run.id) {
            return Err(StoreError::Conflict(format!("run {} already waits on checkpoint {}", run.id, open.id)));
        }
        inner.checkpoints.push(checkpoint.clone());
        inner.runs.insert(run.id.0.clone(), run.clone());
        Ok(())
    }

    fn resolve_checkpoint(&self, checkpoint: &Checkpoint, run: &ValidationRun) -> StoreResult<()> {
        let mut inner = self.lock()?;
        let idx = inner
            .checkpoints
            .iter()
            .position(|c| c.id == checkpoint.id)
            .ok_or_else(|| StoreError::NotFound { what: "checkpoint", id: checkpoint.id.to_string() })?;
        if inner.checkpoints[idx].resolved {
            return Err(StoreError::AlreadyResolved(checkpoint.id.clone()));
        }
        inner.ensure_writable(&run.id)?;
        inner.checkpoints[idx] = checkpoint.clone();
        inner.runs.insert(run.id.0.clone(), run.clone());
        Ok(())
    }

    fn cancel_run(&self, run_id: &RunId, reason: &str, now_unix: i64) -> StoreResult<ValidationRun> {
        let mut inner = self.lock()?;
        let killed = killed_run(inner.ensure_writable(run_id)?, reason, now_unix)?;
        for cp in inner.checkpoints.iter_mut().filter(|c| &c.run_id == run_id && !c.resolved) {
            cp.mark_resolved(Decision::Kill, now_unix);
        }
        inner.runs.insert(run_id.0.clone(), killed.clone());
        Ok(killed)
    }
}
