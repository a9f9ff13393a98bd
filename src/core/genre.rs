//! Genre: optional descriptive classification attached to dependency edges.
//!
//! Genres never affect readiness or scheduling. They exist so presentation
//! clients can color edges and group tasks into lanes.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

use crate::core::graph::DependencyEdge;
use crate::core::task::{Task, TaskId};

/// Unique identifier for a genre.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GenreId(pub Uuid);

impl GenreId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for GenreId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for GenreId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A named edge classification with a display color and ordering position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Genre {
    pub id: GenreId,
    pub name: String,
    /// Display color as a hex string, e.g. "#7c3aed".
    pub color: String,
    /// Ordering position among a project's genres.
    pub position: u32,
}

impl Genre {
    pub fn new(name: &str, color: &str, position: u32) -> Self {
        Self {
            id: GenreId::new(),
            name: name.to_string(),
            color: color.to_string(),
            position,
        }
    }
}

/// Assign each task to at most one genre lane.
///
/// A task's lane is the genre of its first-created outgoing dependency edge
/// (the earliest edge where the task is the depending side). Later edges
/// with other genres do not move it: first edge wins. Tasks with no genred
/// outgoing edge map to `None`.
pub fn lane_assignments(
    tasks: &[Task],
    edges: &[DependencyEdge],
) -> HashMap<TaskId, Option<GenreId>> {
    let mut ordered: Vec<&DependencyEdge> = edges.iter().collect();
    ordered.sort_by_key(|e| (e.created_at, e.id));

    let mut lanes: HashMap<TaskId, Option<GenreId>> =
        tasks.iter().map(|t| (t.id, None)).collect();
    let mut assigned: HashMap<TaskId, bool> = HashMap::new();

    for edge in ordered {
        if edge.genre_id.is_none() {
            continue;
        }
        if assigned.get(&edge.task_id).copied().unwrap_or(false) {
            continue;
        }
        if let Some(slot) = lanes.get_mut(&edge.task_id) {
            *slot = edge.genre_id;
            assigned.insert(edge.task_id, true);
        }
    }

    lanes
}
