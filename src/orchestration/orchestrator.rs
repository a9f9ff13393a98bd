//! Orchestrator run-state machine and dispatch accounting.
//!
//! The orchestrator decides *what may run now*: while running it keeps up
//! to `concurrency_limit` ready tasks dispatched, and it is the only
//! writer of the per-project run state. It holds no channels and performs
//! no I/O; the coordinator wires its decisions to the executor and the
//! change stream.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use tokio_util::sync::CancellationToken;

use crate::core::plan::ExecutionPlan;
use crate::core::task::TaskId;
use crate::error::{Error, Result};

/// Per-project run state. Exactly one instance per project; transitions
/// are the only writer of this value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Idle,
    Running,
    Paused,
    Stopping,
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunState::Idle => write!(f, "idle"),
            RunState::Running => write!(f, "running"),
            RunState::Paused => write!(f, "paused"),
            RunState::Stopping => write!(f, "stopping"),
        }
    }
}

/// Events emitted on the change stream as execution progresses.
///
/// A closed sum type with a typed payload per variant; consumers match
/// exhaustively.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "event")]
pub enum EngineEvent {
    /// The execution plan was recomputed and differs from the previous one.
    PlanUpdated { plan: ExecutionPlan },
    /// The run state changed.
    StateChanged { state: RunState },
    /// A task was dispatched to the executor.
    TaskStarted { task_id: TaskId },
    /// A dispatched task finished successfully.
    TaskCompleted { task_id: TaskId },
    /// A dispatched task failed. The task's status is left for the caller
    /// to decide; the orchestrator never silently retries.
    TaskFailed { task_id: TaskId, error: String },
    /// A dispatched task finished its work and is parked for review.
    TaskAwaitingReview { task_id: TaskId },
    /// An internal invariant was violated and the run was aborted.
    Diagnostic { message: String },
}

/// Run-state machine with dispatch accounting.
pub struct Orchestrator {
    state: RunState,
    concurrency_limit: usize,
    /// Tasks this orchestrator dispatched that have not reported a
    /// terminal outcome. Externally-initiated in-progress tasks are not
    /// tracked here and never consume dispatch budget.
    in_flight: HashMap<TaskId, CancellationToken>,
    /// Every task dispatched during the current run. A task is dispatched
    /// at most once per run, even if its readiness returns to ready.
    attempted: HashSet<TaskId>,
}

impl Orchestrator {
    pub fn new(concurrency_limit: usize) -> Self {
        Self {
            state: RunState::Idle,
            concurrency_limit: concurrency_limit.max(1),
            in_flight: HashMap::new(),
            attempted: HashSet::new(),
        }
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn concurrency_limit(&self) -> usize {
        self.concurrency_limit
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    pub fn in_flight_ids(&self) -> Vec<TaskId> {
        self.in_flight.keys().copied().collect()
    }

    pub fn is_in_flight(&self, task_id: TaskId) -> bool {
        self.in_flight.contains_key(&task_id)
    }

    pub fn free_slots(&self) -> usize {
        self.concurrency_limit.saturating_sub(self.in_flight.len())
    }

    /// Begin a run. Valid only from idle; resets per-run accounting.
    pub fn start(&mut self) -> Result<()> {
        self.transition(RunState::Idle, RunState::Running)?;
        self.attempted.clear();
        Ok(())
    }

    /// Stop dispatching new tasks. In-flight tasks continue.
    pub fn pause(&mut self) -> Result<()> {
        self.transition(RunState::Running, RunState::Paused)
    }

    /// Resume dispatching from the current ready set.
    pub fn resume(&mut self) -> Result<()> {
        self.transition(RunState::Paused, RunState::Running)
    }

    /// Enter the stopping state, returning cancellation tokens for every
    /// in-flight task. The caller cancels them and later calls
    /// `finish_stop` once outstanding work acknowledges (or times out).
    pub fn begin_stop(&mut self) -> Result<Vec<CancellationToken>> {
        match self.state {
            RunState::Running | RunState::Paused => {
                self.state = RunState::Stopping;
                Ok(self.in_flight.values().cloned().collect())
            }
            from => Err(Error::InvalidStateTransition {
                from: from.to_string(),
                to: RunState::Stopping.to_string(),
            }),
        }
    }

    /// Complete a stop (all acknowledged, or the timeout elapsed).
    pub fn finish_stop(&mut self) -> Vec<TaskId> {
        let orphaned = self.in_flight_ids();
        self.state = RunState::Idle;
        self.in_flight.clear();
        self.attempted.clear();
        orphaned
    }

    /// End a run normally: every task settled, nothing in flight.
    pub fn complete_run(&mut self) {
        self.state = RunState::Idle;
        self.in_flight.clear();
        self.attempted.clear();
    }

    /// Abort the run after an invariant violation: drop straight to idle
    /// regardless of the current state.
    pub fn force_idle(&mut self) -> Vec<TaskId> {
        let orphaned = self.in_flight_ids();
        self.state = RunState::Idle;
        self.in_flight.clear();
        self.attempted.clear();
        orphaned
    }

    /// Pick the tasks to dispatch right now: ready, never attempted this
    /// run, not in flight, capped at the free dispatch slots. Empty unless
    /// running.
    pub fn select_dispatch(&self, plan: &ExecutionPlan) -> Vec<TaskId> {
        if self.state != RunState::Running {
            return Vec::new();
        }
        plan.ready_tasks()
            .into_iter()
            .filter(|id| !self.attempted.contains(id) && !self.in_flight.contains_key(id))
            .take(self.free_slots())
            .collect()
    }

    /// Account for a dispatch, returning the task's cancellation token.
    ///
    /// Exceeding the concurrency limit here means dispatch selection and
    /// accounting disagree; that is a coordination bug, and continuing
    /// would produce an inconsistent plan.
    pub fn note_dispatched(&mut self, task_id: TaskId) -> Result<CancellationToken> {
        if self.in_flight.len() >= self.concurrency_limit {
            return Err(Error::FatalOrchestrator(format!(
                "dispatch of {} would exceed concurrency limit {} ({} in flight)",
                task_id.short(),
                self.concurrency_limit,
                self.in_flight.len()
            )));
        }
        let token = CancellationToken::new();
        self.in_flight.insert(task_id, token.clone());
        self.attempted.insert(task_id);
        Ok(token)
    }

    /// Account for a terminal outcome. Returns the token if the task was
    /// actually in flight; `None` marks a stale or unknown report.
    pub fn note_terminal(&mut self, task_id: TaskId) -> Option<CancellationToken> {
        self.in_flight.remove(&task_id)
    }

    fn transition(&mut self, from: RunState, to: RunState) -> Result<()> {
        if self.state != from {
            return Err(Error::InvalidStateTransition {
                from: self.state.to_string(),
                to: to.to_string(),
            });
        }
        self.state = to;
        Ok(())
    }
}
