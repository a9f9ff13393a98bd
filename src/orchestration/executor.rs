//! Execution collaborator contract.
//!
//! The engine decides *what* may run; an executor decides *how*. For each
//! dispatched task the executor must eventually deliver exactly one
//! terminal report back on the report channel, and it should honor the
//! cancellation token best-effort. Reports re-enter the coordinator's
//! serialized mutation path, so executors never touch engine state.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::{Arc, RwLock};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::core::task::{Task, TaskId};
use crate::{llog_debug, llog_warn};

/// Terminal outcome of one dispatched task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionOutcome {
    /// The work finished successfully.
    Completed,
    /// The work finished and is parked for human review.
    AwaitingReview,
    /// The work failed; the engine leaves the task's status alone.
    Failed { error: String },
    /// The executor honored cancellation before finishing.
    Cancelled,
}

/// One terminal report for a dispatched task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionReport {
    pub task_id: TaskId,
    pub outcome: ExecutionOutcome,
}

impl ExecutionReport {
    pub fn new(task_id: TaskId, outcome: ExecutionOutcome) -> Self {
        Self { task_id, outcome }
    }
}

/// The execution collaborator.
///
/// `dispatch` must not block: implementations spawn their own work and
/// report the terminal outcome on the channel they were built with.
pub trait TaskExecutor: Send + Sync {
    fn dispatch(&self, task: &Task, cancel: CancellationToken);
}

/// Executor that completes every task immediately. Useful for dry runs
/// and demos where only the ordering decisions matter.
pub struct InstantExecutor {
    reports: mpsc::Sender<ExecutionReport>,
}

impl InstantExecutor {
    pub fn new(reports: mpsc::Sender<ExecutionReport>) -> Self {
        Self { reports }
    }
}

impl TaskExecutor for InstantExecutor {
    fn dispatch(&self, task: &Task, _cancel: CancellationToken) {
        let reports = self.reports.clone();
        let task_id = task.id;
        tokio::spawn(async move {
            let _ = reports
                .send(ExecutionReport::new(task_id, ExecutionOutcome::Completed))
                .await;
        });
    }
}

/// Shared task-id-to-command table for `ShellExecutor`. Shared so a
/// caller can register commands as tasks are created, before any
/// dispatch happens.
pub type CommandMap = Arc<RwLock<HashMap<TaskId, String>>>;

/// Executor that runs one shell command per task.
///
/// Commands are looked up by task id; a task without a command completes
/// immediately. Cancellation kills the child process and reports
/// `Cancelled`; a nonzero exit reports `Failed`.
pub struct ShellExecutor {
    commands: CommandMap,
    reports: mpsc::Sender<ExecutionReport>,
}

impl ShellExecutor {
    pub fn new(commands: CommandMap, reports: mpsc::Sender<ExecutionReport>) -> Self {
        Self { commands, reports }
    }
}

impl TaskExecutor for ShellExecutor {
    fn dispatch(&self, task: &Task, cancel: CancellationToken) {
        let reports = self.reports.clone();
        let task_id = task.id;
        let title = task.title.clone();
        let command = self
            .commands
            .read()
            .ok()
            .and_then(|map| map.get(&task.id).cloned());

        tokio::spawn(async move {
            let outcome = match command {
                None => ExecutionOutcome::Completed,
                Some(command) => run_command(&command, &title, cancel).await,
            };
            let _ = reports.send(ExecutionReport::new(task_id, outcome)).await;
        });
    }
}

async fn run_command(command: &str, title: &str, cancel: CancellationToken) -> ExecutionOutcome {
    llog_debug!("executing '{}' for task '{}'", command, title);

    let child = tokio::process::Command::new("sh")
        .arg("-c")
        .arg(command)
        .stdin(Stdio::null())
        .spawn();

    let mut child = match child {
        Ok(child) => child,
        Err(err) => {
            return ExecutionOutcome::Failed {
                error: format!("failed to spawn: {}", err),
            }
        }
    };

    tokio::select! {
        status = child.wait() => match status {
            Ok(status) if status.success() => ExecutionOutcome::Completed,
            Ok(status) => ExecutionOutcome::Failed {
                error: format!("exited with {}", status),
            },
            Err(err) => ExecutionOutcome::Failed {
                error: format!("wait failed: {}", err),
            },
        },
        _ = cancel.cancelled() => {
            if let Err(err) = child.kill().await {
                llog_warn!("failed to kill cancelled task '{}': {}", title, err);
            }
            ExecutionOutcome::Cancelled
        }
    }
}
