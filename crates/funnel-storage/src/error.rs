use funnel_core::{CheckpointId, FunnelError, Phase, RunId};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("checkpoint {0} is already resolved")]
    AlreadyResolved(CheckpointId),
    #[error("artifact {run_id}/{phase}@v{version}: {detail}")]
    VersionConflict { run_id: RunId, phase: Phase, version: u32, detail: String },
    #[error("{what} {id} not found")]
    NotFound { what: &'static str, id: String },
    #[error("storage backend: {0}")]
    Backend(String),
}

impl StoreError {
    /// Wrap a backend failure, keeping the whole context chain in the message.
    pub fn backend(err: impl Into<anyhow::Error>) -> Self {
        StoreError::Backend(format!("{:#}", err.into()))
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

impl From<StoreError> for FunnelError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Conflict(msg) => FunnelError::Conflict(msg),
            StoreError::AlreadyResolved(id) => FunnelError::AlreadyResolved(id),
            e @ StoreError::VersionConflict { .. } => FunnelError::Conflict(e.to_string()),
            StoreError::NotFound { what, id } => FunnelError::NotFound { what, id },
            StoreError::Backend(msg) => FunnelError::Storage(msg),
        }
    }
}
