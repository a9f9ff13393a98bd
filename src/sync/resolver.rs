//! Conflict resolution against a remote backing store.
//!
//! Only relevant when a secondary durable store with its own writers is
//! configured. Reconciliation is whole-record: the winning side replaces
//! the losing side outright, no field-level merging. The strategy is a
//! deployment-level choice (see `EngineConfig`), not a per-call one.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::Duration;

use crate::core::graph::{DependencyEdge, EdgeId};
use crate::core::task::{Task, TaskId};
use crate::{llog_debug, llog_warn};

/// How a remote record update is reconciled against the local one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictStrategy {
    /// The record with the later `updated_at` wins. Equal timestamps:
    /// remote wins. Deterministic by policy, not by incidental ordering.
    LastWriterWins,
    /// The local record always wins.
    KeepLocal,
    /// The remote record always wins.
    AcceptRemote,
}

impl Default for ConflictStrategy {
    fn default() -> Self {
        Self::LastWriterWins
    }
}

/// Which side of a conflict won.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    Local,
    Remote,
}

/// Pick the winning side for a task record pair.
pub fn resolve(local: &Task, remote: &Task, strategy: ConflictStrategy) -> Resolution {
    match strategy {
        ConflictStrategy::KeepLocal => Resolution::Local,
        ConflictStrategy::AcceptRemote => Resolution::Remote,
        ConflictStrategy::LastWriterWins => {
            if remote.updated_at >= local.updated_at {
                Resolution::Remote
            } else {
                Resolution::Local
            }
        }
    }
}

/// A local mutation forwarded to the remote store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "mutation")]
pub enum RemoteMutation {
    UpsertTask { task: Task },
    DeleteTask { task_id: TaskId },
    UpsertEdge { edge: DependencyEdge },
    DeleteEdge { edge_id: EdgeId },
}

/// The remote-sync collaborator. Implementations push local mutations to
/// the secondary store; inbound change notifications re-enter the engine
/// through the coordinator as whole-record updates.
pub trait RemoteSync: Send + Sync {
    /// Forward one mutation. A returned error is treated as transient and
    /// retried by the forwarder.
    fn forward(&self, mutation: &RemoteMutation) -> std::result::Result<(), String>;
}

/// Retry schedule for the forwarder: exponential backoff from this base.
const FORWARD_BASE_DELAY: Duration = Duration::from_millis(200);
const FORWARD_MAX_ATTEMPTS: u32 = 5;

/// Background task draining a mutation queue into a `RemoteSync`
/// collaborator with retry/backoff. Failures never reach the caller: a
/// mutation that exhausts its retries is dropped with a warning, and the
/// remote converges on the next snapshot-level sync.
pub struct RemoteForwarder;

impl RemoteForwarder {
    pub fn spawn(
        remote: Arc<dyn RemoteSync>,
        mut rx: mpsc::Receiver<RemoteMutation>,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(mutation) = rx.recv().await {
                let mut delay = FORWARD_BASE_DELAY;
                let mut delivered = false;
                for attempt in 1..=FORWARD_MAX_ATTEMPTS {
                    match remote.forward(&mutation) {
                        Ok(()) => {
                            llog_debug!("forwarded remote mutation on attempt {}", attempt);
                            delivered = true;
                            break;
                        }
                        Err(err) => {
                            llog_debug!(
                                "remote forward attempt {} failed: {}",
                                attempt,
                                err
                            );
                            tokio::time::sleep(delay).await;
                            delay *= 2;
                        }
                    }
                }
                if !delivered {
                    llog_warn!(
                        "remote forward dropped after {} attempts",
                        FORWARD_MAX_ATTEMPTS
                    );
                }
            }
        })
    }
}
