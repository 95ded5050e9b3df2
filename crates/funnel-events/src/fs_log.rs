use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use funnel_core::RunId;

use crate::event::{FunnelEvent, SeenEvents};
use crate::manifest::RunManifest;
use crate::sink::EventSink;

/// Per-run directory with `events.jsonl`, a human-readable `worklog.md`
/// and, once the run ends, `run_manifest.json`.
pub struct FsEventLog {
    pub root: PathBuf,
    seen: Mutex<SeenEvents>,
}

impl FsEventLog {
    pub fn new(root: PathBuf) -> Self {
        Self { root, seen: Mutex::new(SeenEvents::new()) }
    }

    pub fn run_dir(&self, run_id: &RunId) -> PathBuf {
        self.root.join(run_id.as_str())
    }

    pub fn create_run_dir(&self, run_id: &RunId) -> Result<PathBuf> {
        let dir = self.run_dir(run_id);
        std::fs::create_dir_all(&dir).with_context(|| format!("create run dir {}", dir.display()))?;
        Ok(dir)
    }

    pub fn write_manifest(&self, manifest: &RunManifest) -> Result<PathBuf> {
        let dir = self.create_run_dir(&RunId::from_str(manifest.run_id.clone()))?;
        let path = dir.join("run_manifest.json");
        let bytes = serde_json::to_vec_pretty(manifest)?;
        std::fs::write(&path, bytes).with_context(|| format!("write manifest {}", path.display()))?;
        Ok(path)
    }

    pub fn append_worklog(&self, run_dir: &Path, line: &str) -> Result<()> {
        let path = run_dir.join("worklog.md");
        let mut f = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("open worklog {}", path.display()))?;
        writeln!(f, "{}", line)?;
        Ok(())
    }

    /// Events recorded for a run, in delivery order.
    pub fn read_events(&self, run_id: &RunId) -> Result<Vec<FunnelEvent>> {
        let path = self.run_dir(run_id).join("events.jsonl");
        if !path.exists() {
            return Ok(vec![]);
        }
        let text = std::fs::read_to_string(&path).with_context(|| format!("read {}", path.display()))?;
        text.lines()
            .filter(|l| !l.trim().is_empty())
            .map(|l| serde_json::from_str(l).with_context(|| format!("parse event line in {}", path.display())))
            .collect()
    }
}

impl EventSink for FsEventLog {
    fn publish(&self, event: &FunnelEvent) -> Result<()> {
        let first = self
            .seen
            .lock()
            .map_err(|_| anyhow::anyhow!("event log lock poisoned"))?
            .first_time(event);
        if !first {
            return Ok(());
        }
        let dir = self.create_run_dir(&event.run_id)?;
        let path = dir.join("events.jsonl");
        let mut f = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("open event log {}", path.display()))?;
        writeln!(f, "{}", serde_json::to_string(event)?)?;
        self.append_worklog(
            &dir,
            &format!("- `{}` {} {}@v{}: {}", event.at_unix, event.kind.as_str(), event.phase, event.version, event.summary),
        )
    }
}
