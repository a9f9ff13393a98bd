//! Task data model.
//!
//! Tasks are the nodes of the dependency graph. Status is the authoritative
//! record of where a task is in its lifecycle; readiness is derived from it
//! together with the edge set (see `core::plan`).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for a task.
///
/// Uses UUID v4 for generation and provides a short form display
/// for human-readable output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub Uuid);

impl TaskId {
    /// Create a new unique task identifier.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Return first 8 characters of the UUID for display.
    pub fn short(&self) -> String {
        self.0.to_string()[..8].to_string()
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for TaskId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Unique identifier for a project. Every task, edge, and coordinator is
/// scoped to exactly one project.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProjectId(pub Uuid);

impl ProjectId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ProjectId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ProjectId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Task status in its lifecycle.
///
/// Mutated by users, or by the orchestrator for tasks it has dispatched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Not started.
    Todo,
    /// Currently being worked on.
    InProgress,
    /// Work finished, awaiting review.
    InReview,
    /// Completed.
    Done,
    /// Abandoned; will never run.
    Cancelled,
}

impl TaskStatus {
    /// Whether the task will never be dispatched again (Done or Cancelled).
    pub fn is_settled(&self) -> bool {
        matches!(self, TaskStatus::Done | TaskStatus::Cancelled)
    }
}

impl Default for TaskStatus {
    fn default() -> Self {
        Self::Todo
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Todo => write!(f, "todo"),
            TaskStatus::InProgress => write!(f, "in_progress"),
            TaskStatus::InReview => write!(f, "in_review"),
            TaskStatus::Done => write!(f, "done"),
            TaskStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Free-form layout coordinates, carried for presentation clients.
/// Has no effect on readiness or scheduling.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

/// A single task within a project.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Unique identifier for this task.
    pub id: TaskId,
    /// The project this task belongs to.
    pub project_id: ProjectId,
    /// Human-readable title.
    pub title: String,
    /// Current lifecycle status.
    pub status: TaskStatus,
    /// Optional layout coordinates.
    pub position: Option<Position>,
    /// When the task was created.
    pub created_at: DateTime<Utc>,
    /// When the task was last mutated. Drives last-writer-wins resolution.
    pub updated_at: DateTime<Utc>,
}

impl Task {
    /// Create a new task with Todo status and current timestamps.
    pub fn new(project_id: ProjectId, title: &str) -> Self {
        let now = Utc::now();
        Self {
            id: TaskId::new(),
            project_id,
            title: title.to_string(),
            status: TaskStatus::Todo,
            position: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Change the status, refreshing `updated_at`.
    pub fn set_status(&mut self, status: TaskStatus) {
        self.status = status;
        self.touch();
    }

    /// Change the title, refreshing `updated_at`.
    pub fn set_title(&mut self, title: &str) {
        self.title = title.to_string();
        self.touch();
    }

    /// Change the layout position, refreshing `updated_at`.
    pub fn set_position(&mut self, position: Option<Position>) {
        self.position = position;
        self.touch();
    }

    /// Refresh the modification timestamp.
    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}
