use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use funnel_core::{BackoffPolicy, PivotBudget};
use funnel_policy::{compile_policy, load_policy_pack, CompiledPolicy, PolicyPack};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    pub project: ProjectConfig,
    pub policy: PolicyConfig,
    #[serde(default)]
    pub executor: ExecutorConfig,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProjectConfig {
    pub id: String,
    /// Root of per-run event logs and manifests. `~` is expanded.
    pub event_root: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PolicyConfig {
    /// Policy pack YAML, relative to the project root. Without one the
    /// standard pack is used with `max_pivots` below.
    #[serde(default)]
    pub pack: Option<String>,
    #[serde(default)]
    pub max_pivots: Option<PivotBudget>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExecutorConfig {
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    /// Upper bound on steps taken by one `drive` call.
    pub step_limit: u32,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        let backoff = BackoffPolicy::default();
        Self { backoff_base_ms: backoff.base_ms, backoff_max_ms: backoff.max_ms, step_limit: 64 }
    }
}

impl ExecutorConfig {
    pub fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy { base_ms: self.backoff_base_ms, max_ms: self.backoff_max_ms }
    }
}

impl Config {
    pub fn default_for_project(project_id: &str) -> Self {
        Self {
            project: ProjectConfig {
                id: project_id.to_string(),
                event_root: "~/.funnel/runs".to_string(),
            },
            policy: PolicyConfig { pack: None, max_pivots: Some(PivotBudget::Capped(3)) },
            executor: ExecutorConfig::default(),
        }
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let s = std::fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
        let cfg: Config = toml::from_str(&s).with_context(|| "parse funnel.toml")?;
        Ok(cfg)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
        }
        let s = toml::to_string_pretty(self).with_context(|| "serialize toml")?;
        std::fs::write(path, s).with_context(|| format!("write {}", path.display()))?;
        Ok(())
    }

    /// The routing policy runs of this project are driven with.
    pub fn compile_policy(&self, project_root: &Path) -> Result<CompiledPolicy> {
        let pack = match &self.policy.pack {
            Some(rel) => {
                let path = project_root.join(shellexpand::tilde(rel).into_owned());
                let mut pack = load_policy_pack(&path)?;
                if let Some(max) = self.policy.max_pivots {
                    pack.max_pivots = Some(max);
                }
                pack
            }
            None => {
                let max = self
                    .policy
                    .max_pivots
                    .ok_or_else(|| anyhow!("funnel.toml: set policy.max_pivots or policy.pack"))?;
                PolicyPack::standard(max)
            }
        };
        compile_policy(&pack)
    }

    pub fn event_root(&self) -> PathBuf {
        PathBuf::from(shellexpand::tilde(&self.project.event_root).to_string())
    }

    pub fn config_path(project_root: &Path) -> PathBuf {
        project_root.join(".funnel").join("funnel.toml")
    }

    pub fn db_path(project_root: &Path) -> PathBuf {
        project_root.join(".funnel").join("funnel.db")
    }
}
