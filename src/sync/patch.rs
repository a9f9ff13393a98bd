//! Patch operations and state snapshots.
//!
//! The change stream describes every state delta as an ordered list of
//! add/replace/remove operations against explicit paths. A subscriber
//! applies them in arrival order to its copy of the snapshot and stays
//! equal to canonical state. Paths are flat: `/tasks/<id>`, `/edges/<id>`,
//! `/genres/<id>`, `/plan`, `/run_state`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::genre::{Genre, GenreId};
use crate::core::graph::{DependencyEdge, EdgeId};
use crate::core::plan::ExecutionPlan;
use crate::core::task::{ProjectId, Task, TaskId};
use crate::error::{Error, Result};
use crate::orchestration::orchestrator::RunState;

/// One state delta against an explicit path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "op")]
pub enum PatchOp {
    Add { path: String, value: Value },
    Replace { path: String, value: Value },
    Remove { path: String },
}

impl PatchOp {
    pub fn path(&self) -> &str {
        match self {
            PatchOp::Add { path, .. }
            | PatchOp::Replace { path, .. }
            | PatchOp::Remove { path } => path,
        }
    }

    pub fn add_task(task: &Task) -> Result<Self> {
        Ok(PatchOp::Add {
            path: task_path(task.id),
            value: serde_json::to_value(task)?,
        })
    }

    pub fn replace_task(task: &Task) -> Result<Self> {
        Ok(PatchOp::Replace {
            path: task_path(task.id),
            value: serde_json::to_value(task)?,
        })
    }

    pub fn remove_task(id: TaskId) -> Self {
        PatchOp::Remove {
            path: task_path(id),
        }
    }

    pub fn add_edge(edge: &DependencyEdge) -> Result<Self> {
        Ok(PatchOp::Add {
            path: edge_path(edge.id),
            value: serde_json::to_value(edge)?,
        })
    }

    pub fn remove_edge(id: EdgeId) -> Self {
        PatchOp::Remove {
            path: edge_path(id),
        }
    }

    pub fn add_genre(genre: &Genre) -> Result<Self> {
        Ok(PatchOp::Add {
            path: genre_path(genre.id),
            value: serde_json::to_value(genre)?,
        })
    }

    pub fn replace_plan(plan: &ExecutionPlan) -> Result<Self> {
        Ok(PatchOp::Replace {
            path: "/plan".to_string(),
            value: serde_json::to_value(plan)?,
        })
    }

    pub fn replace_run_state(state: RunState) -> Result<Self> {
        Ok(PatchOp::Replace {
            path: "/run_state".to_string(),
            value: serde_json::to_value(state)?,
        })
    }
}

pub fn task_path(id: TaskId) -> String {
    format!("/tasks/{}", id)
}

pub fn edge_path(id: EdgeId) -> String {
    format!("/edges/{}", id)
}

pub fn genre_path(id: GenreId) -> String {
    format!("/genres/{}", id)
}

/// A full copy of canonical state, delivered atomically to each new
/// subscriber before any patches.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub project_id: ProjectId,
    pub tasks: Vec<Task>,
    pub edges: Vec<DependencyEdge>,
    pub genres: Vec<Genre>,
    pub plan: ExecutionPlan,
    pub run_state: RunState,
}

impl StateSnapshot {
    /// Apply one patch to this snapshot. Out-of-order application is not
    /// supported; the stream guarantees arrival order, and the client
    /// must resnapshot after any gap.
    pub fn apply(&mut self, patch: &PatchOp) -> Result<()> {
        let path = patch.path();
        let mut parts = path.strip_prefix('/').unwrap_or(path).splitn(2, '/');
        let collection = parts.next().unwrap_or_default();
        let key = parts.next();

        match (collection, key) {
            ("tasks", Some(id)) => {
                let id: TaskId = parse_id(id)?;
                match patch {
                    PatchOp::Add { value, .. } | PatchOp::Replace { value, .. } => {
                        let task: Task = serde_json::from_value(value.clone())?;
                        upsert_by(&mut self.tasks, task, |t| t.id == id);
                    }
                    PatchOp::Remove { .. } => self.tasks.retain(|t| t.id != id),
                }
            }
            ("edges", Some(id)) => {
                let id: EdgeId = EdgeId(parse_uuid(id)?);
                match patch {
                    PatchOp::Add { value, .. } | PatchOp::Replace { value, .. } => {
                        let edge: DependencyEdge = serde_json::from_value(value.clone())?;
                        upsert_by(&mut self.edges, edge, |e| e.id == id);
                    }
                    PatchOp::Remove { .. } => self.edges.retain(|e| e.id != id),
                }
            }
            ("genres", Some(id)) => {
                let id = GenreId(parse_uuid(id)?);
                match patch {
                    PatchOp::Add { value, .. } | PatchOp::Replace { value, .. } => {
                        let genre: Genre = serde_json::from_value(value.clone())?;
                        upsert_by(&mut self.genres, genre, |g| g.id == id);
                    }
                    PatchOp::Remove { .. } => self.genres.retain(|g| g.id != id),
                }
            }
            ("plan", None) => match patch {
                PatchOp::Add { value, .. } | PatchOp::Replace { value, .. } => {
                    self.plan = serde_json::from_value(value.clone())?;
                }
                PatchOp::Remove { .. } => self.plan = ExecutionPlan::default(),
            },
            ("run_state", None) => match patch {
                PatchOp::Add { value, .. } | PatchOp::Replace { value, .. } => {
                    self.run_state = serde_json::from_value(value.clone())?;
                }
                PatchOp::Remove { .. } => {
                    return Err(Error::Validation(
                        "run_state cannot be removed".to_string(),
                    ))
                }
            },
            _ => {
                return Err(Error::Validation(format!(
                    "unknown patch path: {}",
                    path
                )))
            }
        }
        Ok(())
    }
}

fn parse_uuid(s: &str) -> Result<uuid::Uuid> {
    uuid::Uuid::parse_str(s)
        .map_err(|e| Error::Validation(format!("malformed id in patch path: {}", e)))
}

fn parse_id(s: &str) -> Result<TaskId> {
    Ok(TaskId(parse_uuid(s)?))
}

fn upsert_by<T>(items: &mut Vec<T>, item: T, matches: impl Fn(&T) -> bool) {
    if let Some(existing) = items.iter_mut().find(|i| matches(i)) {
        *existing = item;
    } else {
        items.push(item);
    }
}
