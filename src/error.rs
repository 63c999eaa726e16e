use std::path::PathBuf;

use thiserror::Error;

/// Fatal engine failures. These abort the operation that raised them; they are
/// never collected into a `SyncResult` the way per-change failures are.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("{path} is already initialized")]
    AlreadyInitialized { path: PathBuf },

    #[error("{path} is not a pushwork workspace (run `pushwork init` first)")]
    NotInitialized { path: PathBuf },

    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    #[error("snapshot invalid: {0}")]
    SnapshotInvalid(String),

    #[error("workspace locked by another process")]
    WorkspaceLocked,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type EngineResult<T> = Result<T, EngineError>;

/// A recoverable failure attached to one path during a sync. Never returned as
/// `Err`; always collected into `SyncResult::errors` or `::warnings`.
#[derive(Debug, Clone)]
pub struct ChangeError {
    pub path: String,
    pub operation: &'static str,
    pub message: String,
    pub recoverable: bool,
}

impl ChangeError {
    pub fn recoverable(path: impl Into<String>, operation: &'static str, message: impl std::fmt::Display) -> Self {
        Self {
            path: path.into(),
            operation,
            message: message.to_string(),
            recoverable: true,
        }
    }
}

impl std::fmt::Display for ChangeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({}): {}", self.path, self.operation, self.message)
    }
}
