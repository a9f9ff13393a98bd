//! Project coordinator: the single-writer actor owning all mutable state.
//!
//! Every mutation — user commands, executor completion reports, inbound
//! remote updates — serializes through this task's loop, so the graph,
//! the orchestrator state, and plan recomputation never race. Readiness
//! recomputation and stream broadcast happen strictly after the mutation
//! that triggered them; two commands are never processed out of their
//! arrival order.
//!
//! Control calls return once the transition and dispatch decisions are
//! recorded, not once dispatched work finishes. `stop` resolves after
//! in-flight cancellation is acknowledged or a bounded timeout elapses.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

use crate::config::EngineConfig;
use crate::core::genre::Genre;
use crate::core::graph::{DependencyEdge, DependencyGraph, EdgeId};
use crate::core::plan::ExecutionPlan;
use crate::core::task::{Position, ProjectId, Task, TaskId, TaskStatus};
use crate::error::{Error, Result};
use crate::history::{CommandHistory, HistoryEntry, RecordedChange};
use crate::orchestration::executor::{ExecutionOutcome, ExecutionReport, TaskExecutor};
use crate::orchestration::orchestrator::{EngineEvent, Orchestrator, RunState};
use crate::sync::patch::{PatchOp, StateSnapshot};
use crate::sync::resolver::{resolve, RemoteMutation, Resolution};
use crate::sync::stream::{ChangeStream, StreamClient};
use crate::{llog, llog_debug, llog_error, llog_warn};

/// Fields of a task a user may change in one update call. `position`
/// distinguishes "leave alone" (None) from "clear" (Some(None)).
#[derive(Debug, Clone, Default)]
pub struct TaskUpdate {
    pub title: Option<String>,
    pub status: Option<TaskStatus>,
    pub position: Option<Option<Position>>,
}

/// Result of an orchestrator control call.
#[derive(Debug, Clone)]
pub struct RunStatus {
    pub state: RunState,
    pub plan: ExecutionPlan,
}

/// Commands accepted by the coordinator. Each carries a oneshot reply.
pub enum EngineCommand {
    CreateTask {
        title: String,
        position: Option<Position>,
        reply: oneshot::Sender<Result<Task>>,
    },
    UpdateTask {
        task_id: TaskId,
        update: TaskUpdate,
        reply: oneshot::Sender<Result<Task>>,
    },
    DeleteTask {
        task_id: TaskId,
        reply: oneshot::Sender<Result<()>>,
    },
    AddEdge {
        task_id: TaskId,
        depends_on_id: TaskId,
        genre_id: Option<crate::core::genre::GenreId>,
        reply: oneshot::Sender<Result<DependencyEdge>>,
    },
    RemoveEdge {
        edge_id: EdgeId,
        reply: oneshot::Sender<Result<()>>,
    },
    AddGenre {
        name: String,
        color: String,
        reply: oneshot::Sender<Result<Genre>>,
    },
    Start {
        reply: oneshot::Sender<Result<RunStatus>>,
    },
    Pause {
        reply: oneshot::Sender<Result<RunStatus>>,
    },
    Resume {
        reply: oneshot::Sender<Result<RunStatus>>,
    },
    Stop {
        reply: oneshot::Sender<Result<RunStatus>>,
    },
    Undo {
        reply: oneshot::Sender<Result<()>>,
    },
    Redo {
        reply: oneshot::Sender<Result<()>>,
    },
    Subscribe {
        reply: oneshot::Sender<StreamClient>,
    },
    RemoteUpdate {
        task: Task,
        reply: oneshot::Sender<Result<()>>,
    },
    Status {
        reply: oneshot::Sender<RunStatus>,
    },
    Edges {
        reply: oneshot::Sender<Vec<DependencyEdge>>,
    },
    Shutdown,
}

/// Clonable client handle: the in-process equivalent of the mutation and
/// control endpoints. All methods submit a command and await its reply.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineCommand>,
}

impl EngineHandle {
    pub async fn create_task(&self, title: &str, position: Option<Position>) -> Result<Task> {
        let (reply, rx) = oneshot::channel();
        self.send(EngineCommand::CreateTask {
            title: title.to_string(),
            position,
            reply,
        })
        .await?;
        recv(rx).await?
    }

    pub async fn update_task(&self, task_id: TaskId, update: TaskUpdate) -> Result<Task> {
        let (reply, rx) = oneshot::channel();
        self.send(EngineCommand::UpdateTask {
            task_id,
            update,
            reply,
        })
        .await?;
        recv(rx).await?
    }

    pub async fn delete_task(&self, task_id: TaskId) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(EngineCommand::DeleteTask { task_id, reply }).await?;
        recv(rx).await?
    }

    pub async fn add_edge(
        &self,
        task_id: TaskId,
        depends_on_id: TaskId,
        genre_id: Option<crate::core::genre::GenreId>,
    ) -> Result<DependencyEdge> {
        let (reply, rx) = oneshot::channel();
        self.send(EngineCommand::AddEdge {
            task_id,
            depends_on_id,
            genre_id,
            reply,
        })
        .await?;
        recv(rx).await?
    }

    pub async fn remove_edge(&self, edge_id: EdgeId) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(EngineCommand::RemoveEdge { edge_id, reply }).await?;
        recv(rx).await?
    }

    pub async fn add_genre(&self, name: &str, color: &str) -> Result<Genre> {
        let (reply, rx) = oneshot::channel();
        self.send(EngineCommand::AddGenre {
            name: name.to_string(),
            color: color.to_string(),
            reply,
        })
        .await?;
        recv(rx).await?
    }

    pub async fn start(&self) -> Result<RunStatus> {
        let (reply, rx) = oneshot::channel();
        self.send(EngineCommand::Start { reply }).await?;
        recv(rx).await?
    }

    pub async fn pause(&self) -> Result<RunStatus> {
        let (reply, rx) = oneshot::channel();
        self.send(EngineCommand::Pause { reply }).await?;
        recv(rx).await?
    }

    pub async fn resume(&self) -> Result<RunStatus> {
        let (reply, rx) = oneshot::channel();
        self.send(EngineCommand::Resume { reply }).await?;
        recv(rx).await?
    }

    pub async fn stop(&self) -> Result<RunStatus> {
        let (reply, rx) = oneshot::channel();
        self.send(EngineCommand::Stop { reply }).await?;
        recv(rx).await?
    }

    pub async fn undo(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(EngineCommand::Undo { reply }).await?;
        recv(rx).await?
    }

    pub async fn redo(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(EngineCommand::Redo { reply }).await?;
        recv(rx).await?
    }

    /// Register a stream subscriber: returns a client holding an atomic
    /// snapshot plus the ordered message feed that follows it.
    pub async fn subscribe(&self) -> Result<StreamClient> {
        let (reply, rx) = oneshot::channel();
        self.send(EngineCommand::Subscribe { reply }).await?;
        recv(rx).await
    }

    /// Deliver an inbound remote record update for reconciliation.
    pub async fn apply_remote_update(&self, task: Task) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(EngineCommand::RemoteUpdate { task, reply }).await?;
        recv(rx).await?
    }

    pub async fn status(&self) -> Result<RunStatus> {
        let (reply, rx) = oneshot::channel();
        self.send(EngineCommand::Status { reply }).await?;
        recv(rx).await
    }

    /// Current edge set for the project. Pure read.
    pub async fn edges(&self) -> Result<Vec<DependencyEdge>> {
        let (reply, rx) = oneshot::channel();
        self.send(EngineCommand::Edges { reply }).await?;
        recv(rx).await
    }

    pub async fn shutdown(&self) {
        let _ = self.tx.send(EngineCommand::Shutdown).await;
    }

    async fn send(&self, cmd: EngineCommand) -> Result<()> {
        self.tx
            .send(cmd)
            .await
            .map_err(|_| Error::ChannelClosed("coordinator stopped".to_string()))
    }
}

async fn recv<T>(rx: oneshot::Receiver<T>) -> Result<T> {
    rx.await
        .map_err(|_| Error::ChannelClosed("coordinator dropped reply".to_string()))
}

/// Patches and events accumulated while handling one input, flushed to
/// the stream as a batch once the mutation is fully applied.
#[derive(Default)]
struct Effects {
    patches: Vec<PatchOp>,
    events: Vec<EngineEvent>,
}

impl Effects {
    fn patch(&mut self, patch: Result<PatchOp>) {
        match patch {
            Ok(p) => self.patches.push(p),
            Err(e) => llog_error!("failed to encode patch: {}", e),
        }
    }

    fn event(&mut self, event: EngineEvent) {
        self.events.push(event);
    }
}

/// The per-project coordinator actor.
pub struct ProjectCoordinator {
    project_id: ProjectId,
    config: EngineConfig,
    tasks: HashMap<TaskId, Task>,
    genres: Vec<Genre>,
    graph: DependencyGraph,
    /// The last broadcast plan; compared against recomputes to decide
    /// whether a plan patch/event is due.
    plan: ExecutionPlan,
    orchestrator: Orchestrator,
    history: CommandHistory,
    stream: ChangeStream,
    executor: Arc<dyn TaskExecutor>,
    remote_tx: Option<mpsc::Sender<RemoteMutation>>,
    cmd_rx: mpsc::Receiver<EngineCommand>,
    report_rx: mpsc::Receiver<ExecutionReport>,
    pending_stop: Vec<oneshot::Sender<Result<RunStatus>>>,
    stop_deadline: Option<Instant>,
}

enum Wake {
    Command(Option<EngineCommand>),
    Report(ExecutionReport),
    Heartbeat,
    StopTimeout,
}

impl ProjectCoordinator {
    /// Spawn a coordinator for one project.
    ///
    /// The executor reports terminal outcomes on the channel whose
    /// receiving half is passed here; `remote_tx` (when configured)
    /// receives every applied local mutation for forwarding.
    pub fn spawn(
        project_id: ProjectId,
        config: EngineConfig,
        executor: Arc<dyn TaskExecutor>,
        report_rx: mpsc::Receiver<ExecutionReport>,
        remote_tx: Option<mpsc::Sender<RemoteMutation>>,
    ) -> (EngineHandle, tokio::task::JoinHandle<()>) {
        let (tx, cmd_rx) = mpsc::channel(64);
        let coordinator = Self {
            project_id,
            orchestrator: Orchestrator::new(config.concurrency_limit),
            history: CommandHistory::new(config.history_limit),
            stream: ChangeStream::new(config.stream_capacity),
            config,
            tasks: HashMap::new(),
            genres: Vec::new(),
            graph: DependencyGraph::new(project_id),
            plan: ExecutionPlan::default(),
            executor,
            remote_tx,
            cmd_rx,
            report_rx,
            pending_stop: Vec::new(),
            stop_deadline: None,
        };
        let join = tokio::spawn(coordinator.run());
        (EngineHandle { tx }, join)
    }

    async fn run(mut self) {
        llog!("coordinator started for project {}", self.project_id);
        let mut heartbeat = tokio::time::interval(self.config.heartbeat_interval());
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately; swallow it.
        heartbeat.tick().await;

        loop {
            let deadline = self.stop_deadline;
            let wake = tokio::select! {
                maybe = self.cmd_rx.recv() => Wake::Command(maybe),
                Some(report) = self.report_rx.recv() => Wake::Report(report),
                _ = heartbeat.tick() => Wake::Heartbeat,
                _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)),
                    if deadline.is_some() => Wake::StopTimeout,
            };

            match wake {
                Wake::Command(None) | Wake::Command(Some(EngineCommand::Shutdown)) => break,
                Wake::Command(Some(cmd)) => self.handle_command(cmd),
                Wake::Report(report) => self.handle_report(report),
                Wake::Heartbeat => self.stream.heartbeat(),
                Wake::StopTimeout => self.stop_timed_out(),
            }
        }
        llog!("coordinator stopped for project {}", self.project_id);
    }

    // ========== Command handling ==========

    fn handle_command(&mut self, cmd: EngineCommand) {
        match cmd {
            EngineCommand::CreateTask {
                title,
                position,
                reply,
            } => {
                let _ = reply.send(self.create_task(&title, position));
            }
            EngineCommand::UpdateTask {
                task_id,
                update,
                reply,
            } => {
                let _ = reply.send(self.update_task(task_id, update));
            }
            EngineCommand::DeleteTask { task_id, reply } => {
                let _ = reply.send(self.delete_task(task_id));
            }
            EngineCommand::AddEdge {
                task_id,
                depends_on_id,
                genre_id,
                reply,
            } => {
                let _ = reply.send(self.add_edge(task_id, depends_on_id, genre_id));
            }
            EngineCommand::RemoveEdge { edge_id, reply } => {
                let _ = reply.send(self.remove_edge(edge_id));
            }
            EngineCommand::AddGenre { name, color, reply } => {
                let _ = reply.send(self.add_genre(&name, &color));
            }
            EngineCommand::Start { reply } => {
                let _ = reply.send(self.start());
            }
            EngineCommand::Pause { reply } => {
                let _ = reply.send(self.pause());
            }
            EngineCommand::Resume { reply } => {
                let _ = reply.send(self.resume());
            }
            EngineCommand::Stop { reply } => self.stop(reply),
            EngineCommand::Undo { reply } => {
                let _ = reply.send(self.undo());
            }
            EngineCommand::Redo { reply } => {
                let _ = reply.send(self.redo());
            }
            EngineCommand::Subscribe { reply } => {
                let _ = reply.send(self.stream.subscribe(self.snapshot()));
            }
            EngineCommand::RemoteUpdate { task, reply } => {
                let _ = reply.send(self.remote_update(task));
            }
            EngineCommand::Status { reply } => {
                let _ = reply.send(self.run_status());
            }
            EngineCommand::Edges { reply } => {
                let _ = reply.send(self.graph.edges().to_vec());
            }
            EngineCommand::Shutdown => unreachable!("handled in run loop"),
        }
    }

    fn create_task(&mut self, title: &str, position: Option<Position>) -> Result<Task> {
        if title.trim().is_empty() {
            return Err(Error::Validation("task title must not be empty".to_string()));
        }

        let mut task = Task::new(self.project_id, title);
        task.position = position;
        self.tasks.insert(task.id, task.clone());
        self.history
            .record(RecordedChange::TaskCreated { task: task.clone() });
        self.forward_remote(RemoteMutation::UpsertTask { task: task.clone() });

        let mut effects = Effects::default();
        effects.patch(PatchOp::add_task(&task));
        self.settle(effects);
        llog_debug!("created task {} '{}'", task.id.short(), task.title);
        Ok(task)
    }

    fn update_task(&mut self, task_id: TaskId, update: TaskUpdate) -> Result<Task> {
        let task = self
            .tasks
            .get_mut(&task_id)
            .ok_or(Error::TaskNotFound(task_id))?;

        let before = task.clone();
        if let Some(title) = update.title {
            if title.trim().is_empty() {
                return Err(Error::Validation("task title must not be empty".to_string()));
            }
            task.set_title(&title);
        }
        if let Some(status) = update.status {
            task.set_status(status);
        }
        if let Some(position) = update.position {
            task.set_position(position);
        }
        let after = task.clone();

        self.history.record(RecordedChange::TaskUpdated {
            before,
            after: after.clone(),
        });
        self.forward_remote(RemoteMutation::UpsertTask { task: after.clone() });

        let mut effects = Effects::default();
        effects.patch(PatchOp::replace_task(&after));
        self.settle(effects);
        Ok(after)
    }

    fn delete_task(&mut self, task_id: TaskId) -> Result<()> {
        let task = self
            .tasks
            .remove(&task_id)
            .ok_or(Error::TaskNotFound(task_id))?;
        let edges = self.graph.remove_task_edges(task_id);

        self.history.record(RecordedChange::TaskDeleted {
            task: task.clone(),
            edges: edges.clone(),
        });
        self.forward_remote(RemoteMutation::DeleteTask { task_id });

        let mut effects = Effects::default();
        for edge in &edges {
            effects.patches.push(PatchOp::remove_edge(edge.id));
        }
        effects.patches.push(PatchOp::remove_task(task_id));
        self.settle(effects);
        llog_debug!(
            "deleted task {} (cascaded {} edges)",
            task_id.short(),
            edges.len()
        );
        Ok(())
    }

    fn add_edge(
        &mut self,
        task_id: TaskId,
        depends_on_id: TaskId,
        genre_id: Option<crate::core::genre::GenreId>,
    ) -> Result<DependencyEdge> {
        if !self.tasks.contains_key(&task_id) {
            return Err(Error::TaskNotFound(task_id));
        }
        if !self.tasks.contains_key(&depends_on_id) {
            return Err(Error::TaskNotFound(depends_on_id));
        }

        let edge = self.graph.add_edge(task_id, depends_on_id, genre_id)?.clone();
        self.history
            .record(RecordedChange::EdgeCreated { edge: edge.clone() });
        self.forward_remote(RemoteMutation::UpsertEdge { edge: edge.clone() });

        let mut effects = Effects::default();
        effects.patch(PatchOp::add_edge(&edge));
        self.settle(effects);
        Ok(edge)
    }

    fn remove_edge(&mut self, edge_id: EdgeId) -> Result<()> {
        let edge = self.graph.remove_edge(edge_id)?;
        self.history
            .record(RecordedChange::EdgeDeleted { edge: edge.clone() });
        self.forward_remote(RemoteMutation::DeleteEdge { edge_id });

        let mut effects = Effects::default();
        effects.patches.push(PatchOp::remove_edge(edge_id));
        self.settle(effects);
        Ok(())
    }

    fn add_genre(&mut self, name: &str, color: &str) -> Result<Genre> {
        if name.trim().is_empty() {
            return Err(Error::Validation("genre name must not be empty".to_string()));
        }
        let position = self.genres.len() as u32;
        let genre = Genre::new(name, color, position);
        self.genres.push(genre.clone());

        let mut effects = Effects::default();
        effects.patch(PatchOp::add_genre(&genre));
        self.settle(effects);
        Ok(genre)
    }

    // ========== Orchestrator control ==========

    fn start(&mut self) -> Result<RunStatus> {
        if self.tasks.is_empty() {
            return Err(Error::Validation(
                "cannot start a run in a project with no tasks".to_string(),
            ));
        }
        self.orchestrator.start()?;
        llog!("run started (limit {})", self.orchestrator.concurrency_limit());

        let mut effects = Effects::default();
        self.note_state_change(&mut effects);
        self.settle(effects);
        Ok(self.run_status())
    }

    fn pause(&mut self) -> Result<RunStatus> {
        self.orchestrator.pause()?;
        llog!("run paused ({} in flight)", self.orchestrator.in_flight_count());

        let mut effects = Effects::default();
        self.note_state_change(&mut effects);
        self.settle(effects);
        Ok(self.run_status())
    }

    fn resume(&mut self) -> Result<RunStatus> {
        self.orchestrator.resume()?;
        llog!("run resumed");

        let mut effects = Effects::default();
        self.note_state_change(&mut effects);
        self.settle(effects);
        Ok(self.run_status())
    }

    fn stop(&mut self, reply: oneshot::Sender<Result<RunStatus>>) {
        let tokens = match self.orchestrator.begin_stop() {
            Ok(tokens) => tokens,
            Err(e) => {
                let _ = reply.send(Err(e));
                return;
            }
        };
        llog!("stopping run; cancelling {} in-flight tasks", tokens.len());
        for token in &tokens {
            token.cancel();
        }

        let mut effects = Effects::default();
        self.note_state_change(&mut effects);

        if self.orchestrator.in_flight_count() == 0 {
            self.complete_stop(vec![reply], &mut effects);
        } else {
            self.pending_stop.push(reply);
            self.stop_deadline = Some(Instant::now() + self.config.stop_timeout());
        }
        self.settle(effects);
    }

    fn stop_timed_out(&mut self) {
        if self.orchestrator.state() != RunState::Stopping {
            self.stop_deadline = None;
            return;
        }
        llog_warn!(
            "stop timed out with {} tasks unacknowledged; forcing idle",
            self.orchestrator.in_flight_count()
        );
        let replies = std::mem::take(&mut self.pending_stop);
        let mut effects = Effects::default();
        self.complete_stop(replies, &mut effects);
        self.settle(effects);
    }

    /// Finish a stop: idle state, abandoned in-flight tasks return to todo.
    fn complete_stop(
        &mut self,
        replies: Vec<oneshot::Sender<Result<RunStatus>>>,
        effects: &mut Effects,
    ) {
        let orphaned = self.orchestrator.finish_stop();
        self.stop_deadline = None;
        for task_id in orphaned {
            if let Some(task) = self.tasks.get_mut(&task_id) {
                if task.status == TaskStatus::InProgress {
                    task.set_status(TaskStatus::Todo);
                    effects.patch(PatchOp::replace_task(task));
                }
            }
        }
        self.note_state_change(effects);
        llog!("run stopped; orchestrator idle");

        let status = self.run_status();
        for reply in replies {
            let _ = reply.send(Ok(status.clone()));
        }
    }

    // ========== Executor reports ==========

    fn handle_report(&mut self, report: ExecutionReport) {
        let Some(_token) = self.orchestrator.note_terminal(report.task_id) else {
            llog_debug!(
                "ignoring stale report for task {}",
                report.task_id.short()
            );
            return;
        };

        let mut effects = Effects::default();
        match report.outcome {
            ExecutionOutcome::Completed => {
                if let Some(task) = self.tasks.get_mut(&report.task_id) {
                    task.set_status(TaskStatus::Done);
                    effects.patch(PatchOp::replace_task(task));
                }
                effects.event(EngineEvent::TaskCompleted {
                    task_id: report.task_id,
                });
                llog!("task {} completed", report.task_id.short());
            }
            ExecutionOutcome::AwaitingReview => {
                if let Some(task) = self.tasks.get_mut(&report.task_id) {
                    task.set_status(TaskStatus::InReview);
                    effects.patch(PatchOp::replace_task(task));
                }
                effects.event(EngineEvent::TaskAwaitingReview {
                    task_id: report.task_id,
                });
            }
            ExecutionOutcome::Failed { error } => {
                // Status stays as-is: retrying or cancelling is the
                // caller's decision, never an automatic one.
                effects.event(EngineEvent::TaskFailed {
                    task_id: report.task_id,
                    error: error.clone(),
                });
                llog_warn!("task {} failed: {}", report.task_id.short(), error);
            }
            ExecutionOutcome::Cancelled => {
                if let Some(task) = self.tasks.get_mut(&report.task_id) {
                    if task.status == TaskStatus::InProgress {
                        task.set_status(TaskStatus::Todo);
                        effects.patch(PatchOp::replace_task(task));
                    }
                }
                llog_debug!("task {} acknowledged cancellation", report.task_id.short());
            }
        }

        if self.orchestrator.state() == RunState::Stopping
            && self.orchestrator.in_flight_count() == 0
        {
            let replies = std::mem::take(&mut self.pending_stop);
            self.complete_stop(replies, &mut effects);
        }

        self.settle(effects);
    }

    // ========== Undo / redo ==========

    fn undo(&mut self) -> Result<()> {
        let entry = self.history.pop_undo().ok_or(Error::NothingToUndo)?;
        let mut effects = Effects::default();

        let redo_change = match self.apply_inverse(&entry.change, &mut effects) {
            Ok(change) => change,
            Err(e) => {
                // Leave history as it was; the entry stays undoable.
                self.history.push_undo(entry);
                return Err(e);
            }
        };

        self.history.push_redo(HistoryEntry::new(redo_change));
        self.settle(effects);
        Ok(())
    }

    fn redo(&mut self) -> Result<()> {
        let entry = self.history.pop_redo().ok_or(Error::NothingToRedo)?;
        let mut effects = Effects::default();

        let undo_change = match self.apply_forward(&entry.change, &mut effects) {
            Ok(change) => change,
            Err(e) => {
                self.history.push_redo(entry);
                return Err(e);
            }
        };

        self.history.push_undo(HistoryEntry::new(undo_change));
        self.settle(effects);
        Ok(())
    }

    /// Apply the inverse of a recorded change and return the redo twin,
    /// computed from the pre-undo state.
    fn apply_inverse(
        &mut self,
        change: &RecordedChange,
        effects: &mut Effects,
    ) -> Result<RecordedChange> {
        match change {
            RecordedChange::TaskCreated { task } => {
                let (current, _edges) = self.raw_delete_task(task.id, effects)?;
                Ok(RecordedChange::TaskCreated { task: current })
            }
            RecordedChange::TaskUpdated { before, after } => {
                let current = self
                    .tasks
                    .get(&after.id)
                    .ok_or(Error::TaskNotFound(after.id))?
                    .clone();
                self.raw_restore_task(before.clone(), effects);
                Ok(RecordedChange::TaskUpdated {
                    before: before.clone(),
                    after: current,
                })
            }
            RecordedChange::TaskDeleted { task, edges } => {
                self.raw_restore_task(task.clone(), effects);
                for edge in edges {
                    if let Err(e) = self.raw_insert_edge(edge.clone(), effects) {
                        llog_warn!("undo could not restore edge {}: {}", edge.id.short(), e);
                    }
                }
                Ok(RecordedChange::TaskDeleted {
                    task: task.clone(),
                    edges: edges.clone(),
                })
            }
            RecordedChange::EdgeCreated { edge } => {
                let removed = self.raw_remove_edge(edge.id, effects)?;
                Ok(RecordedChange::EdgeCreated { edge: removed })
            }
            RecordedChange::EdgeDeleted { edge } => {
                self.raw_insert_edge(edge.clone(), effects)?;
                Ok(RecordedChange::EdgeDeleted { edge: edge.clone() })
            }
        }
    }

    /// Re-apply a recorded change forward and return the undo twin,
    /// reflecting the state immediately prior to the redo.
    fn apply_forward(
        &mut self,
        change: &RecordedChange,
        effects: &mut Effects,
    ) -> Result<RecordedChange> {
        match change {
            RecordedChange::TaskCreated { task } => {
                self.raw_restore_task(task.clone(), effects);
                Ok(RecordedChange::TaskCreated { task: task.clone() })
            }
            RecordedChange::TaskUpdated { before: _, after } => {
                let current = self
                    .tasks
                    .get(&after.id)
                    .ok_or(Error::TaskNotFound(after.id))?
                    .clone();
                self.raw_restore_task(after.clone(), effects);
                Ok(RecordedChange::TaskUpdated {
                    before: current,
                    after: after.clone(),
                })
            }
            RecordedChange::TaskDeleted { task, .. } => {
                let (current, edges) = self.raw_delete_task(task.id, effects)?;
                Ok(RecordedChange::TaskDeleted {
                    task: current,
                    edges,
                })
            }
            RecordedChange::EdgeCreated { edge } => {
                self.raw_insert_edge(edge.clone(), effects)?;
                Ok(RecordedChange::EdgeCreated { edge: edge.clone() })
            }
            RecordedChange::EdgeDeleted { edge } => {
                let removed = self.raw_remove_edge(edge.id, effects)?;
                Ok(RecordedChange::EdgeDeleted { edge: removed })
            }
        }
    }

    /// Upsert a task record without recording history.
    fn raw_restore_task(&mut self, task: Task, effects: &mut Effects) {
        self.forward_remote(RemoteMutation::UpsertTask { task: task.clone() });
        effects.patch(PatchOp::replace_task(&task));
        self.tasks.insert(task.id, task);
    }

    /// Delete a task (cascading edges) without recording history.
    fn raw_delete_task(
        &mut self,
        task_id: TaskId,
        effects: &mut Effects,
    ) -> Result<(Task, Vec<DependencyEdge>)> {
        let task = self
            .tasks
            .remove(&task_id)
            .ok_or(Error::TaskNotFound(task_id))?;
        let edges = self.graph.remove_task_edges(task_id);
        for edge in &edges {
            effects.patches.push(PatchOp::remove_edge(edge.id));
        }
        effects.patches.push(PatchOp::remove_task(task_id));
        self.forward_remote(RemoteMutation::DeleteTask { task_id });
        Ok((task, edges))
    }

    fn raw_insert_edge(&mut self, edge: DependencyEdge, effects: &mut Effects) -> Result<()> {
        let inserted = self.graph.insert_edge(edge)?.clone();
        effects.patch(PatchOp::add_edge(&inserted));
        self.forward_remote(RemoteMutation::UpsertEdge { edge: inserted });
        Ok(())
    }

    fn raw_remove_edge(
        &mut self,
        edge_id: EdgeId,
        effects: &mut Effects,
    ) -> Result<DependencyEdge> {
        let edge = self.graph.remove_edge(edge_id)?;
        effects.patches.push(PatchOp::remove_edge(edge_id));
        self.forward_remote(RemoteMutation::DeleteEdge { edge_id });
        Ok(edge)
    }

    // ========== Remote reconciliation ==========

    fn remote_update(&mut self, remote: Task) -> Result<()> {
        if remote.project_id != self.project_id {
            return Err(Error::Validation(
                "remote record belongs to another project".to_string(),
            ));
        }

        let known = self.tasks.contains_key(&remote.id);
        let remote_wins = match self.tasks.get(&remote.id) {
            None => true,
            Some(local) => {
                resolve(local, &remote, self.config.conflict_strategy) == Resolution::Remote
            }
        };

        let mut effects = Effects::default();
        if remote_wins {
            // Whole-record replacement; no field merging.
            effects.patch(if known {
                PatchOp::replace_task(&remote)
            } else {
                PatchOp::add_task(&remote)
            });
            self.tasks.insert(remote.id, remote);
        } else {
            llog_debug!("remote update for {} lost resolution", remote.id.short());
        }
        self.settle(effects);
        Ok(())
    }

    fn forward_remote(&self, mutation: RemoteMutation) {
        if let Some(tx) = &self.remote_tx {
            if let Err(e) = tx.try_send(mutation) {
                llog_warn!("remote forward queue rejected mutation: {}", e);
            }
        }
    }

    // ========== Plan / dispatch plumbing ==========

    /// Recompute the plan, fill free dispatch slots, detect run
    /// completion, and flush all accumulated patches and events in order.
    /// Called at the end of every state-changing input.
    fn settle(&mut self, mut effects: Effects) {
        let mut current = self.compute_plan();

        if self.dispatch_fill(&current, &mut effects) > 0 {
            current = self.compute_plan();
        }
        self.maybe_finish_run(&current, &mut effects);

        if current != self.plan {
            self.plan = current.clone();
            effects.patch(PatchOp::replace_plan(&current));
            effects.event(EngineEvent::PlanUpdated { plan: current });
        }

        self.stream.emit_patches(std::mem::take(&mut effects.patches));
        for event in effects.events {
            self.stream.emit_event(event);
        }
    }

    fn compute_plan(&self) -> ExecutionPlan {
        let tasks: Vec<Task> = self.tasks.values().cloned().collect();
        ExecutionPlan::compute(&tasks, self.graph.edges())
    }

    /// Dispatch ready tasks into free slots. Returns how many were sent.
    fn dispatch_fill(&mut self, plan: &ExecutionPlan, effects: &mut Effects) -> usize {
        let picked = self.orchestrator.select_dispatch(plan);
        let mut dispatched = 0;

        for task_id in picked {
            let token = match self.orchestrator.note_dispatched(task_id) {
                Ok(token) => token,
                Err(e) => {
                    self.fatal(e.to_string(), effects);
                    return dispatched;
                }
            };
            let Some(task) = self.tasks.get_mut(&task_id) else {
                self.orchestrator.note_terminal(task_id);
                continue;
            };
            task.set_status(TaskStatus::InProgress);
            let snapshot = task.clone();
            effects.patch(PatchOp::replace_task(&snapshot));
            effects.event(EngineEvent::TaskStarted { task_id });
            llog!("dispatched task {} '{}'", task_id.short(), snapshot.title);
            self.executor.dispatch(&snapshot, token);
            dispatched += 1;
        }
        dispatched
    }

    /// A run is a bounded activity: once everything is settled and
    /// nothing is in flight, return to idle.
    fn maybe_finish_run(&mut self, plan: &ExecutionPlan, effects: &mut Effects) {
        if self.orchestrator.state() == RunState::Running
            && self.orchestrator.in_flight_count() == 0
            && plan.all_settled()
        {
            self.orchestrator.complete_run();
            self.note_state_change(effects);
            llog!("run complete; orchestrator idle");
        }
    }

    /// Invariant violations are fatal for the run: cancel everything,
    /// force idle, and surface a diagnostic rather than continue with an
    /// inconsistent plan.
    fn fatal(&mut self, message: String, effects: &mut Effects) {
        llog_error!("fatal orchestrator error: {}", message);
        let orphaned = self.orchestrator.force_idle();
        for task_id in orphaned {
            if let Some(task) = self.tasks.get_mut(&task_id) {
                if task.status == TaskStatus::InProgress {
                    task.set_status(TaskStatus::Todo);
                    effects.patch(PatchOp::replace_task(task));
                }
            }
        }
        effects.event(EngineEvent::Diagnostic { message });
        self.note_state_change(effects);

        let replies = std::mem::take(&mut self.pending_stop);
        let status = self.run_status();
        for reply in replies {
            let _ = reply.send(Ok(status.clone()));
        }
        self.stop_deadline = None;
    }

    fn note_state_change(&self, effects: &mut Effects) {
        let state = self.orchestrator.state();
        effects.patch(PatchOp::replace_run_state(state));
        effects.event(EngineEvent::StateChanged { state });
    }

    fn run_status(&self) -> RunStatus {
        RunStatus {
            state: self.orchestrator.state(),
            plan: self.plan.clone(),
        }
    }

    fn snapshot(&self) -> StateSnapshot {
        let mut tasks: Vec<Task> = self.tasks.values().cloned().collect();
        tasks.sort_by_key(|t| (t.created_at, t.id));
        StateSnapshot {
            project_id: self.project_id,
            tasks,
            edges: self.graph.edges().to_vec(),
            genres: self.genres.clone(),
            plan: self.plan.clone(),
            run_state: self.orchestrator.state(),
        }
    }
}
