use std::collections::HashSet;

use funnel_core::{EventId, Phase, RunId};
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    RunStarted,
    PhaseEntered,
    ArtifactWritten,
    CheckpointCreated,
    CheckpointResolved,
    RunTerminated,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::RunStarted => "run_started",
            EventKind::PhaseEntered => "phase_entered",
            EventKind::ArtifactWritten => "artifact_written",
            EventKind::CheckpointCreated => "checkpoint_created",
            EventKind::CheckpointResolved => "checkpoint_resolved",
            EventKind::RunTerminated => "run_terminated",
        }
    }
}

/// Notification for external subscribers. Delivery is at-least-once.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct FunnelEvent {
    pub id: EventId,
    pub run_id: RunId,
    pub phase: Phase,
    /// Artifact version the event refers to; 0 once the run is terminal.
    pub version: u32,
    pub kind: EventKind,
    pub summary: String,
    pub at_unix: i64,
}

impl FunnelEvent {
    pub fn new(run_id: &RunId, phase: Phase, version: u32, kind: EventKind, summary: impl Into<String>, at_unix: i64) -> Self {
        Self {
            id: EventId::new(),
            run_id: run_id.clone(),
            phase,
            version,
            kind,
            summary: summary.into(),
            at_unix,
        }
    }

    /// Identity a consumer deduplicates on. Redelivery of the same fact
    /// carries a fresh `id` but the same key.
    pub fn dedup_key(&self) -> String {
        format!("{}/{}@v{}/{}", self.run_id, self.phase, self.version, self.kind.as_str())
    }
}

/// Consumer-side filter for redelivered events.
#[derive(Debug, Default)]
pub struct SeenEvents {
    seen: HashSet<String>,
}

impl SeenEvents {
    pub fn new() -> Self {
        Self::default()
    }

    /// True the first time a key is observed.
    pub fn first_time(&mut self, event: &FunnelEvent) -> bool {
        self.seen.insert(event.dedup_key())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redelivery_shares_dedup_key() {
        let run = RunId::from_str("r1");
        let a = FunnelEvent::new(&run, Phase::Feasibility, 2, EventKind::ArtifactWritten, "x", 1);
        let b = FunnelEvent::new(&run, Phase::Feasibility, 2, EventKind::ArtifactWritten, "x", 5);
        assert_ne!(a.id, b.id);
        assert_eq!(a.dedup_key(), b.dedup_key());

        let mut seen = SeenEvents::new();
        assert!(seen.first_time(&a));
        assert!(!seen.first_time(&b));

        let cp = FunnelEvent::new(&run, Phase::Feasibility, 2, EventKind::CheckpointCreated, "x", 5);
        assert!(seen.first_time(&cp));
    }
}
