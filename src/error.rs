use thiserror::Error;

use crate::core::graph::EdgeId;
use crate::core::task::TaskId;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("No home directory")]
    NoHomeDir,

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Task {0} cannot depend on itself")]
    SelfDependency(TaskId),

    #[error("Dependency from {task_id} on {depends_on_id} already exists")]
    DuplicateEdge {
        task_id: TaskId,
        depends_on_id: TaskId,
    },

    #[error("Dependency from {task_id} on {depends_on_id} would create a circular dependency")]
    CycleDetected {
        task_id: TaskId,
        depends_on_id: TaskId,
    },

    #[error("Task not found: {0}")]
    TaskNotFound(TaskId),

    #[error("Edge not found: {0}")]
    EdgeNotFound(EdgeId),

    #[error("Invalid run state transition from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("Orchestrator invariant violated: {0}")]
    FatalOrchestrator(String),

    #[error("Sync error: {0}")]
    TransientSync(String),

    #[error("Operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Engine channel closed: {0}")]
    ChannelClosed(String),

    #[error("Nothing to undo")]
    NothingToUndo,

    #[error("Nothing to redo")]
    NothingToRedo,
}

impl Error {
    /// Whether this error maps to an HTTP-equivalent 409 conflict: the
    /// mutation was well-formed but clashes with existing graph state.
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            Error::DuplicateEdge { .. } | Error::CycleDetected { .. }
        )
    }

    /// Whether this error is recoverable by reconnect/retry rather than
    /// being surfaced to the caller as a hard failure.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::TransientSync(_) | Error::Timeout(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
