use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use funnel_core::{FunnelResult, RunId, ValidationRun};
use funnel_events::FsEventLog;
use funnel_executor::AgentRegistry;
use funnel_policy::CompiledPolicy;
use funnel_storage::Storage;
use funnel_storage_sqlite::SqliteStorage;
use funnel_validate::Finding;
use tracing::info;

use crate::orchestrator::{Orchestrator, OrchestratorOptions};
use crate::{doctor::doctor, Config};

/// A project directory wired up: config, SQLite state, event log, orchestrator.
pub struct Runner {
    pub project_root: PathBuf,
    pub cfg: Config,
    pub policy_name: String,
    pub policy_hash: String,
    pub store: Arc<SqliteStorage>,
    pub events: Arc<FsEventLog>,
    pub orchestrator: Orchestrator,
}

impl Runner {
    pub fn open(project_root: PathBuf, agents: AgentRegistry) -> Result<Self> {
        let cfg_path = Config::config_path(&project_root);
        let cfg = if cfg_path.exists() {
            Config::load_from(&cfg_path)?
        } else {
            let cfg = Config::default_for_project(&project_id(&project_root));
            cfg.save_to(&cfg_path)?;
            cfg
        };
        let policy: CompiledPolicy = cfg.compile_policy(&project_root)?;
        let store = Arc::new(SqliteStorage::open(&Config::db_path(&project_root))?);
        let events = Arc::new(FsEventLog::new(cfg.event_root()));
        let options = OrchestratorOptions { backoff: cfg.executor.backoff(), step_limit: cfg.executor.step_limit };
        let (policy_name, policy_hash) = (policy.name.clone(), policy.hash.clone());
        let orchestrator = Orchestrator::new(store.clone(), agents, events.clone(), policy, options)
            .context("build orchestrator")?;
        info!(project = %cfg.project.id, policy = %policy_name, hash = %policy_hash, "runner opened");
        Ok(Self { project_root, cfg, policy_name, policy_hash, store, events, orchestrator })
    }

    pub fn init_project(project_root: &Path) -> Result<()> {
        let cfg_path = Config::config_path(project_root);
        if !cfg_path.exists() {
            Config::default_for_project(&project_id(project_root)).save_to(&cfg_path)?;
        }
        let cfg = Config::load_from(&cfg_path)?;
        cfg.compile_policy(project_root)?;
        let _ = SqliteStorage::open(&Config::db_path(project_root))?;
        std::fs::create_dir_all(cfg.event_root())
            .with_context(|| format!("create event root {}", cfg.event_root().display()))?;
        Ok(())
    }

    pub fn doctor(&self) -> Result<Vec<Finding>> {
        doctor(self.store.as_ref(), &self.policy_hash, self.orchestrator.routing().max_pivots)
    }

    /// Write `run_manifest.json` for a terminal run; returns its path.
    pub fn finish(&self, run: &ValidationRun) -> Result<Option<PathBuf>> {
        if !run.is_terminal() {
            return Ok(None);
        }
        let manifest = self.orchestrator.manifest(&run.id)?;
        let path = self.events.write_manifest(&manifest)?;
        let dir = self.events.run_dir(&run.id);
        self.events.append_worklog(&dir, &format!("## {} ended as {}", run.id, run.phase))?;
        Ok(Some(path))
    }

    pub fn load_run(&self, run_id: &RunId) -> FunnelResult<Option<ValidationRun>> {
        Ok(self.store.load_run(run_id)?)
    }
}

fn project_id(root: &Path) -> String {
    root.file_name().and_then(|s| s.to_str()).unwrap_or("funnel").to_string()
}
