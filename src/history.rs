//! Bounded undo/redo history for user-initiated graph mutations.
//!
//! The stacks record reversible task/edge changes with enough data to
//! invert them: a deletion carries the full deleted records so undo can
//! recreate them. Orchestrator-driven status transitions are never
//! recorded; they reflect external execution progress, not a user
//! decision. One instance is injected per coordinator/session; there is
//! no ambient global history.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

use crate::core::graph::{DependencyEdge, EdgeId};
use crate::core::task::{Task, TaskId};

/// Default bound on each stack; the oldest entry is evicted beyond it.
pub const DEFAULT_HISTORY_LIMIT: usize = 30;

/// A reversible change, carrying the data needed to invert it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "change")]
pub enum RecordedChange {
    TaskCreated {
        task: Task,
    },
    TaskUpdated {
        before: Task,
        after: Task,
    },
    /// Deletion carries the cascade-removed edges too, so undo restores
    /// the graph exactly.
    TaskDeleted {
        task: Task,
        edges: Vec<DependencyEdge>,
    },
    EdgeCreated {
        edge: DependencyEdge,
    },
    EdgeDeleted {
        edge: DependencyEdge,
    },
}

/// The kind of mutation a change represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Create,
    Update,
    Delete,
}

impl RecordedChange {
    pub fn kind(&self) -> ChangeKind {
        match self {
            RecordedChange::TaskCreated { .. } | RecordedChange::EdgeCreated { .. } => {
                ChangeKind::Create
            }
            RecordedChange::TaskUpdated { .. } => ChangeKind::Update,
            RecordedChange::TaskDeleted { .. } | RecordedChange::EdgeDeleted { .. } => {
                ChangeKind::Delete
            }
        }
    }

    /// The task this change targets, when it targets a task.
    pub fn task_id(&self) -> Option<TaskId> {
        match self {
            RecordedChange::TaskCreated { task }
            | RecordedChange::TaskDeleted { task, .. } => Some(task.id),
            RecordedChange::TaskUpdated { after, .. } => Some(after.id),
            RecordedChange::EdgeCreated { .. } | RecordedChange::EdgeDeleted { .. } => None,
        }
    }

    /// The edge this change targets, when it targets an edge.
    pub fn edge_id(&self) -> Option<EdgeId> {
        match self {
            RecordedChange::EdgeCreated { edge } | RecordedChange::EdgeDeleted { edge } => {
                Some(edge.id)
            }
            _ => None,
        }
    }

    /// The change that would exactly invert this one.
    pub fn inverted(&self) -> RecordedChange {
        match self {
            RecordedChange::TaskCreated { task } => RecordedChange::TaskDeleted {
                task: task.clone(),
                edges: Vec::new(),
            },
            RecordedChange::TaskUpdated { before, after } => RecordedChange::TaskUpdated {
                before: after.clone(),
                after: before.clone(),
            },
            // Recreation; the restored edges ride along in the forward
            // direction, so the inverse only needs the task.
            RecordedChange::TaskDeleted { task, .. } => {
                RecordedChange::TaskCreated { task: task.clone() }
            }
            RecordedChange::EdgeCreated { edge } => RecordedChange::EdgeDeleted {
                edge: edge.clone(),
            },
            RecordedChange::EdgeDeleted { edge } => RecordedChange::EdgeCreated {
                edge: edge.clone(),
            },
        }
    }
}

/// A recorded change with its timestamp.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub change: RecordedChange,
    pub recorded_at: DateTime<Utc>,
}

impl HistoryEntry {
    pub fn new(change: RecordedChange) -> Self {
        Self {
            change,
            recorded_at: Utc::now(),
        }
    }
}

/// Bounded undo/redo stacks.
///
/// `record` is the only entry point for new user actions: it pushes to
/// the undo stack and clears the redo stack (a new action invalidates any
/// stale redo future). While a programmatic undo/redo is being applied
/// the replay guard makes `record` a no-op, so applying an inverse never
/// re-records itself.
#[derive(Debug)]
pub struct CommandHistory {
    undo: VecDeque<HistoryEntry>,
    redo: VecDeque<HistoryEntry>,
    limit: usize,
    replaying: bool,
}

impl CommandHistory {
    pub fn new(limit: usize) -> Self {
        Self {
            undo: VecDeque::new(),
            redo: VecDeque::new(),
            limit: limit.max(1),
            replaying: false,
        }
    }

    /// Record a user-initiated change. No-op during replay.
    pub fn record(&mut self, change: RecordedChange) {
        if self.replaying {
            return;
        }
        if self.undo.len() == self.limit {
            self.undo.pop_front();
        }
        self.undo.push_back(HistoryEntry::new(change));
        self.redo.clear();
    }

    /// Pop the most recent undoable entry.
    pub fn pop_undo(&mut self) -> Option<HistoryEntry> {
        self.undo.pop_back()
    }

    /// Pop the most recent redoable entry.
    pub fn pop_redo(&mut self) -> Option<HistoryEntry> {
        self.redo.pop_back()
    }

    /// Push an entry computed from the pre-undo state onto the redo stack.
    pub fn push_redo(&mut self, entry: HistoryEntry) {
        if self.redo.len() == self.limit {
            self.redo.pop_front();
        }
        self.redo.push_back(entry);
    }

    /// Push an entry back onto the undo stack without clearing redo
    /// (used when a redo re-establishes its undo twin).
    pub fn push_undo(&mut self, entry: HistoryEntry) {
        if self.undo.len() == self.limit {
            self.undo.pop_front();
        }
        self.undo.push_back(entry);
    }

    /// Run `f` with recording suppressed. The guard is re-entrant safe in
    /// the sense that the flag is always restored.
    pub fn replay<T>(&mut self, f: impl FnOnce(&mut Self) -> T) -> T {
        let prev = self.replaying;
        self.replaying = true;
        let out = f(self);
        self.replaying = prev;
        out
    }

    pub fn is_replaying(&self) -> bool {
        self.replaying
    }

    pub fn undo_len(&self) -> usize {
        self.undo.len()
    }

    pub fn redo_len(&self) -> usize {
        self.redo.len()
    }

    pub fn clear(&mut self) {
        self.undo.clear();
        self.redo.clear();
    }
}

impl Default for CommandHistory {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_LIMIT)
    }
}
