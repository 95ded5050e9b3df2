use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use anyhow::Context;
use funnel_core::{
    Checkpoint, CheckpointId, Decision, Phase, PhaseArtifact, RunId, RunStatus, ValidationRun,
};
use funnel_storage::{check_put, killed_run, PutOutcome, Storage, StoreError, StoreResult};
use rusqlite::{params, Connection, OptionalExtension, Params, Row};

const RUN_COLUMNS: &str = "id, phase, status, current_version, pivot_count, pivot_history, initial_context, \
     request_token, policy_hash, terminal_reason, created_at, updated_at";
const ARTIFACT_COLUMNS: &str = "run_id, phase, version, payload, signal, created_at";
const CHECKPOINT_COLUMNS: &str = "id, run_id, phase, artifact_version, kind, options, presented_context, \
     pending_action, budget_exhausted, resolved, decision, decided_at, created_at";

/// Durable storage backed by a single SQLite file.
pub struct SqliteStorage {
    conn: Mutex<Connection>,
}

trait BackendExt<T> {
    fn store(self) -> StoreResult<T>;
}

impl<T, E: Into<anyhow::Error>> BackendExt<T> for Result<T, E> {
    fn store(self) -> StoreResult<T> {
        self.map_err(StoreError::backend)
    }
}

impl SqliteStorage {
    pub fn open(db_path: &Path) -> anyhow::Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
        }
        let conn = Connection::open(db_path).with_context(|| format!("open sqlite db {}", db_path.display()))?;
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        let init_sql = include_str!("../migrations/0001_init.sql");
        conn.execute_batch(init_sql).context("apply schema")?;
        tracing::debug!(db = %db_path.display(), "sqlite store ready");
        Ok(Self { conn: Mutex::new(conn) })
    }

    fn lock(&self) -> StoreResult<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| StoreError::Backend("sqlite connection lock poisoned".into()))
    }
}

struct RunRow {
    id: String,
    phase: String,
    status: String,
    current_version: i64,
    pivot_count: i64,
    pivot_history: String,
    initial_context: String,
    request_token: Option<String>,
    policy_hash: String,
    terminal_reason: Option<String>,
    created_at: i64,
    updated_at: i64,
}

impl RunRow {
    fn read(r: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: r.get(0)?,
            phase: r.get(1)?,
            status: r.get(2)?,
            current_version: r.get(3)?,
            pivot_count: r.get(4)?,
            pivot_history: r.get(5)?,
            initial_context: r.get(6)?,
            request_token: r.get(7)?,
            policy_hash: r.get(8)?,
            terminal_reason: r.get(9)?,
            created_at: r.get(10)?,
            updated_at: r.get(11)?,
        })
    }

    fn decode(self) -> StoreResult<ValidationRun> {
        Ok(ValidationRun {
            id: RunId::from_str(self.id),
            phase: self.phase.parse::<Phase>().store()?,
            status: self.status.parse::<RunStatus>().store()?,
            current_version: self.current_version as u32,
            pivot_count: self.pivot_count as u32,
            pivot_history: serde_json::from_str(&self.pivot_history).store()?,
            initial_context: self.initial_context,
            request_token: self.request_token,
            policy_hash: self.policy_hash,
            terminal_reason: self.terminal_reason,
            created_at_unix: self.created_at,
            updated_at_unix: self.updated_at,
        })
    }
}

struct ArtifactRow {
    run_id: String,
    phase: String,
    version: i64,
    payload: String,
    signal: String,
    created_at: i64,
}

impl ArtifactRow {
    fn read(r: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            run_id: r.get(0)?,
            phase: r.get(1)?,
            version: r.get(2)?,
            payload: r.get(3)?,
            signal: r.get(4)?,
            created_at: r.get(5)?,
        })
    }

    fn decode(self) -> StoreResult<PhaseArtifact> {
        Ok(PhaseArtifact {
            run_id: RunId::from_str(self.run_id),
            phase: self.phase.parse::<Phase>().store()?,
            version: self.version as u32,
            payload: serde_json::from_str(&self.payload).store()?,
            signal: serde_json::from_str(&self.signal).store()?,
            created_at_unix: self.created_at,
        })
    }
}

struct CheckpointRow {
    id: String,
    run_id: String,
    phase: String,
    artifact_version: i64,
    kind: String,
    options: String,
    presented_context: String,
    pending_action: Option<String>,
    budget_exhausted: bool,
    resolved: bool,
    decision: Option<String>,
    decided_at: Option<i64>,
    created_at: i64,
}

impl CheckpointRow {
    fn read(r: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: r.get(0)?,
            run_id: r.get(1)?,
            phase: r.get(2)?,
            artifact_version: r.get(3)?,
            kind: r.get(4)?,
            options: r.get(5)?,
            presented_context: r.get(6)?,
            pending_action: r.get(7)?,
            budget_exhausted: r.get(8)?,
            resolved: r.get(9)?,
            decision: r.get(10)?,
            decided_at: r.get(11)?,
            created_at: r.get(12)?,
        })
    }

    fn decode(self) -> StoreResult<Checkpoint> {
        let decision = match self.decision {
            Some(label) => Some(Decision::try_from(label).store()?),
            None => None,
        };
        let pending_action = match self.pending_action {
            Some(json) => Some(serde_json::from_str(&json).store()?),
            None => None,
        };
        Ok(Checkpoint {
            id: CheckpointId::from_str(self.id),
            run_id: RunId::from_str(self.run_id),
            phase: self.phase.parse::<Phase>().store()?,
            artifact_version: self.artifact_version as u32,
            kind: self.kind.parse::<funnel_core::CheckpointKind>().store()?,
            options: serde_json::from_str(&self.options).store()?,
            presented_context: serde_json::from_str(&self.presented_context).store()?,
            pending_action,
            budget_exhausted: self.budget_exhausted,
            resolved: self.resolved,
            decision,
            decided_at_unix: self.decided_at,
            created_at_unix: self.created_at,
        })
    }
}

fn query_runs<P: Params>(conn: &Connection, where_clause: &str, p: P) -> StoreResult<Vec<ValidationRun>> {
    let sql = format!("SELECT {RUN_COLUMNS} FROM runs {where_clause}");
    let mut stmt = conn.prepare(&sql).store()?;
    let rows = stmt.query_map(p, RunRow::read).store()?;
    let mut out = vec![];
    for row in rows {
        out.push(row.store()?.decode()?);
    }
    Ok(out)
}

fn query_artifacts<P: Params>(conn: &Connection, where_clause: &str, p: P) -> StoreResult<Vec<PhaseArtifact>> {
    let sql = format!("SELECT {ARTIFACT_COLUMNS} FROM artifacts {where_clause}");
    let mut stmt = conn.prepare(&sql).store()?;
    let rows = stmt.query_map(p, ArtifactRow::read).store()?;
    let mut out = vec![];
    for row in rows {
        out.push(row.store()?.decode()?);
    }
    Ok(out)
}

fn query_checkpoints<P: Params>(conn: &Connection, where_clause: &str, p: P) -> StoreResult<Vec<Checkpoint>> {
    let sql = format!("SELECT {CHECKPOINT_COLUMNS} FROM checkpoints {where_clause}");
    let mut stmt = conn.prepare(&sql).store()?;
    let rows = stmt.query_map(p, CheckpointRow::read).store()?;
    let mut out = vec![];
    for row in rows {
        out.push(row.store()?.decode()?);
    }
    Ok(out)
}

fn insert_run(conn: &Connection, run: &ValidationRun) -> StoreResult<()> {
    conn.execute(
        &format!("INSERT INTO runs({RUN_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)"),
        params![
            run.id.as_str(),
            run.phase.as_str(),
            run.status.as_str(),
            run.current_version,
            run.pivot_count,
            serde_json::to_string(&run.pivot_history).store()?,
            run.initial_context,
            run.request_token,
            run.policy_hash,
            run.terminal_reason,
            run.created_at_unix,
            run.updated_at_unix,
        ],
    )
    .store()?;
    Ok(())
}

/// Refuse writes to missing or terminal runs.
fn ensure_writable(conn: &Connection, run_id: &RunId) -> StoreResult<()> {
    let status: Option<String> = conn
        .query_row("SELECT status FROM runs WHERE id = ?1", params![run_id.as_str()], |r| r.get(0))
        .optional()
        .store()?;
    match status.as_deref() {
        None => Err(StoreError::NotFound { what: "run", id: run_id.to_string() }),
        Some(s) if s == RunStatus::Terminal.as_str() => {
            Err(StoreError::Conflict(format!("run {run_id} is terminal")))
        }
        Some(_) => Ok(()),
    }
}

fn update_run(conn: &Connection, run: &ValidationRun) -> StoreResult<()> {
    ensure_writable(conn, &run.id)?;
    conn.execute(
        "UPDATE runs SET phase = ?2, status = ?3, current_version = ?4, pivot_count = ?5, pivot_history = ?6,
                terminal_reason = ?7, updated_at = ?8
         WHERE id = ?1",
        params![
            run.id.as_str(),
            run.phase.as_str(),
            run.status.as_str(),
            run.current_version,
            run.pivot_count,
            serde_json::to_string(&run.pivot_history).store()?,
            run.terminal_reason,
            run.updated_at_unix,
        ],
    )
    .store()?;
    Ok(())
}

impl Storage for SqliteStorage {
    fn create_run(&self, run: &ValidationRun) -> StoreResult<ValidationRun> {
        let conn = self.lock()?;
        let tx = conn.unchecked_transaction().store()?;
        if let Some(token) = &run.request_token {
            if let Some(existing) = query_runs(&tx, "WHERE request_token = ?1", params![token])?.pop() {
                tx.commit().store()?;
                return Ok(existing);
            }
        }
        insert_run(&tx, run)?;
        tx.commit().store()?;
        Ok(run.clone())
    }

    fn load_run(&self, run_id: &RunId) -> StoreResult<Option<ValidationRun>> {
        let conn = self.lock()?;
        Ok(query_runs(&conn, "WHERE id = ?1", params![run_id.as_str()])?.pop())
    }

    fn save_run(&self, run: &ValidationRun) -> StoreResult<()> {
        let conn = self.lock()?;
        let tx = conn.unchecked_transaction().store()?;
        update_run(&tx, run)?;
        tx.commit().store()
    }

    fn list_runs(&self) -> StoreResult<Vec<ValidationRun>> {
        let conn = self.lock()?;
        query_runs(&conn, "ORDER BY created_at, rowid", params![])
    }

    fn put_artifact(&self, artifact: &PhaseArtifact) -> StoreResult<PutOutcome> {
        let conn = self.lock()?;
        let tx = conn.unchecked_transaction().store()?;
        ensure_writable(&tx, &artifact.run_id)?;
        let existing = query_artifacts(
            &tx,
            "WHERE run_id = ?1 AND phase = ?2 AND version = ?3",
            params![artifact.run_id.as_str(), artifact.phase.as_str(), artifact.version],
        )?
        .pop();
        let latest: Option<i64> = tx
            .query_row(
                "SELECT MAX(version) FROM artifacts WHERE run_id = ?1 AND phase = ?2",
                params![artifact.run_id.as_str(), artifact.phase.as_str()],
                |r| r.get(0),
            )
            .store()?;
        let outcome = check_put(artifact, existing.as_ref(), latest.map(|v| v as u32))?;
        if outcome == PutOutcome::Inserted {
            tx.execute(
                &format!("INSERT INTO artifacts({ARTIFACT_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6)"),
                params![
                    artifact.run_id.as_str(),
                    artifact.phase.as_str(),
                    artifact.version,
                    serde_json::to_string(&artifact.payload).store()?,
                    serde_json::to_string(&artifact.signal).store()?,
                    artifact.created_at_unix,
                ],
            )
            .store()?;
        }
        tx.commit().store()?;
        Ok(outcome)
    }

    fn latest_artifact(&self, run_id: &RunId, phase: Phase) -> StoreResult<Option<PhaseArtifact>> {
        let conn = self.lock()?;
        Ok(query_artifacts(
            &conn,
            "WHERE run_id = ?1 AND phase = ?2 ORDER BY version DESC LIMIT 1",
            params![run_id.as_str(), phase.as_str()],
        )?
        .pop())
    }

    fn artifact_at(&self, run_id: &RunId, phase: Phase, version: u32) -> StoreResult<Option<PhaseArtifact>> {
        let conn = self.lock()?;
        Ok(query_artifacts(
            &conn,
            "WHERE run_id = ?1 AND phase = ?2 AND version = ?3",
            params![run_id.as_str(), phase.as_str(), version],
        )?
        .pop())
    }

    fn artifacts_for_run(&self, run_id: &RunId) -> StoreResult<Vec<PhaseArtifact>> {
        let conn = self.lock()?;
        query_artifacts(&conn, "WHERE run_id = ?1 ORDER BY seq", params![run_id.as_str()])
    }

    fn open_checkpoint(&self, run_id: &RunId) -> StoreResult<Option<Checkpoint>> {
        let conn = self.lock()?;
        Ok(query_checkpoints(&conn, "WHERE run_id = ?1 AND resolved = 0", params![run_id.as_str()])?.pop())
    }

    fn load_checkpoint(&self, id: &CheckpointId) -> StoreResult<Option<Checkpoint>> {
        let conn = self.lock()?;
        Ok(query_checkpoints(&conn, "WHERE id = ?1", params![id.as_str()])?.pop())
    }

    fn checkpoints_for_run(&self, run_id: &RunId) -> StoreResult<Vec<Checkpoint>> {
        let conn = self.lock()?;
        query_checkpoints(&conn, "WHERE run_id = ?1 ORDER BY seq", params![run_id.as_str()])
    }

    fn suspend_run(&self, run: &ValidationRun, checkpoint: &Checkpoint) -> StoreResult<()> {
        let conn = self.lock()?;
        let tx = conn.unchecked_transaction().store()?;
        if let Some(open) = query_checkpoints(&tx, "WHERE run_id = ?1 AND resolved = 0", params![run.id.as_str()])?.pop() {
            return Err(StoreError::Conflict(format!("run {} already waits on checkpoint {}", run.id, open.id)));
        }
        update_run(&tx, run)?;
        let pending = match &checkpoint.pending_action {
            Some(a) => Some(serde_json::to_string(a).store()?),
            None => None,
        };
        tx.execute(
            &format!(
                "INSERT INTO checkpoints({CHECKPOINT_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)"
            ),
            params![
                checkpoint.id.as_str(),
                checkpoint.run_id.as_str(),
                checkpoint.phase.as_str(),
                checkpoint.artifact_version,
                checkpoint.kind.as_str(),
                serde_json::to_string(&checkpoint.options).store()?,
                serde_json::to_string(&checkpoint.presented_context).store()?,
                pending,
                checkpoint.budget_exhausted,
                checkpoint.resolved,
                checkpoint.decision.map(|d| d.label()),
                checkpoint.decided_at_unix,
                checkpoint.created_at_unix,
            ],
        )
        .store()?;
        tx.commit().store()
    }

    fn resolve_checkpoint(&self, checkpoint: &Checkpoint, run: &ValidationRun) -> StoreResult<()> {
        let conn = self.lock()?;
        let tx = conn.unchecked_transaction().store()?;
        let stored = query_checkpoints(&tx, "WHERE id = ?1", params![checkpoint.id.as_str()])?
            .pop()
            .ok_or_else(|| StoreError::NotFound { what: "checkpoint", id: checkpoint.id.to_string() })?;
        if stored.resolved {
            return Err(StoreError::AlreadyResolved(checkpoint.id.clone()));
        }
        update_run(&tx, run)?;
        let changed = tx
            .execute(
                "UPDATE checkpoints SET resolved = 1, decision = ?2, decided_at = ?3 WHERE id = ?1 AND resolved = 0",
                params![checkpoint.id.as_str(), checkpoint.decision.map(|d| d.label()), checkpoint.decided_at_unix],
            )
            .store()?;
        if changed == 0 {
            return Err(StoreError::AlreadyResolved(checkpoint.id.clone()));
        }
        tx.commit().store()
    }

    fn cancel_run(&self, run_id: &RunId, reason: &str, now_unix: i64) -> StoreResult<ValidationRun> {
        let conn = self.lock()?;
        let tx = conn.unchecked_transaction().store()?;
        let stored = query_runs(&tx, "WHERE id = ?1", params![run_id.as_str()])?
            .pop()
            .ok_or_else(|| StoreError::NotFound { what: "run", id: run_id.to_string() })?;
        let killed = killed_run(&stored, reason, now_unix)?;
        update_run(&tx, &killed)?;
        tx.execute(
            "UPDATE checkpoints SET resolved = 1, decision = ?2, decided_at = ?3 WHERE run_id = ?1 AND resolved = 0",
            params![run_id.as_str(), Decision::Kill.label(), now_unix],
        )
        .store()?;
        tx.commit().store()?;
        Ok(killed)
    }
}
