//! Dependency graph store.
//!
//! Holds the directed edge set `(task_id, depends_on_id)` for one project
//! and enforces the structural invariants: no self-loops, no duplicate
//! pairs, and no cycles. The edge set is always a DAG; acyclicity is
//! checked on every insertion, so readers never need to re-validate.

use chrono::{DateTime, Utc};
use petgraph::algo::is_cyclic_directed;
use petgraph::graph::{DiGraph, NodeIndex};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

use crate::core::genre::GenreId;
use crate::core::task::{ProjectId, TaskId};
use crate::error::{Error, Result};

/// Unique identifier for a dependency edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EdgeId(pub Uuid);

impl EdgeId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Return first 8 characters of the UUID for display.
    pub fn short(&self) -> String {
        self.0.to_string()[..8].to_string()
    }
}

impl Default for EdgeId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for EdgeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A directed dependency: `task_id` cannot be considered ready until
/// `depends_on_id` is done.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DependencyEdge {
    pub id: EdgeId,
    pub project_id: ProjectId,
    /// The depending task (blocked side).
    pub task_id: TaskId,
    /// The task that must finish first (blocking side).
    pub depends_on_id: TaskId,
    /// Optional descriptive classification; never affects readiness.
    pub genre_id: Option<GenreId>,
    pub created_at: DateTime<Utc>,
}

/// The dependency edge set for one project.
///
/// Edges are kept in creation order; adjacency and cycle checks are
/// derived from the records on demand, so removal never leaves stale
/// indexes behind.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DependencyGraph {
    project_id: ProjectId,
    edges: Vec<DependencyEdge>,
}

impl DependencyGraph {
    /// Create an empty graph for a project.
    pub fn new(project_id: ProjectId) -> Self {
        Self {
            project_id,
            edges: Vec::new(),
        }
    }

    pub fn project_id(&self) -> ProjectId {
        self.project_id
    }

    /// Current edge set, in creation order.
    pub fn edges(&self) -> &[DependencyEdge] {
        &self.edges
    }

    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.edges.is_empty()
    }

    pub fn get_edge(&self, id: EdgeId) -> Option<&DependencyEdge> {
        self.edges.iter().find(|e| e.id == id)
    }

    /// Whether a dependency pair already exists.
    pub fn has_edge(&self, task_id: TaskId, depends_on_id: TaskId) -> bool {
        self.edges
            .iter()
            .any(|e| e.task_id == task_id && e.depends_on_id == depends_on_id)
    }

    /// Direct dependencies of a task (the tasks it is blocked on).
    pub fn dependencies_of(&self, task_id: TaskId) -> Vec<TaskId> {
        self.edges
            .iter()
            .filter(|e| e.task_id == task_id)
            .map(|e| e.depends_on_id)
            .collect()
    }

    /// Direct dependents of a task (the tasks blocked on it).
    pub fn dependents_of(&self, task_id: TaskId) -> Vec<TaskId> {
        self.edges
            .iter()
            .filter(|e| e.depends_on_id == task_id)
            .map(|e| e.task_id)
            .collect()
    }

    /// Add a dependency edge.
    ///
    /// # Errors
    /// - `SelfDependency` if `task_id == depends_on_id`
    /// - `DuplicateEdge` if the pair already exists
    /// - `CycleDetected` if the edge would close a cycle
    pub fn add_edge(
        &mut self,
        task_id: TaskId,
        depends_on_id: TaskId,
        genre_id: Option<GenreId>,
    ) -> Result<&DependencyEdge> {
        let edge = DependencyEdge {
            id: EdgeId::new(),
            project_id: self.project_id,
            task_id,
            depends_on_id,
            genre_id,
            created_at: Utc::now(),
        };
        self.insert_edge(edge)
    }

    /// Insert a fully-formed edge record, running the same validation as
    /// `add_edge`. Used when undo recreates a previously removed edge.
    pub fn insert_edge(&mut self, edge: DependencyEdge) -> Result<&DependencyEdge> {
        if edge.task_id == edge.depends_on_id {
            return Err(Error::SelfDependency(edge.task_id));
        }
        if self.has_edge(edge.task_id, edge.depends_on_id) {
            return Err(Error::DuplicateEdge {
                task_id: edge.task_id,
                depends_on_id: edge.depends_on_id,
            });
        }
        if self.would_cycle(edge.task_id, edge.depends_on_id) {
            return Err(Error::CycleDetected {
                task_id: edge.task_id,
                depends_on_id: edge.depends_on_id,
            });
        }

        self.edges.push(edge);
        Ok(self.edges.last().expect("edge just pushed"))
    }

    /// Remove an edge by id, returning the removed record.
    ///
    /// Absence is a soft condition (`EdgeNotFound`); callers treating the
    /// operation as idempotent may ignore it.
    pub fn remove_edge(&mut self, id: EdgeId) -> Result<DependencyEdge> {
        let index = self
            .edges
            .iter()
            .position(|e| e.id == id)
            .ok_or(Error::EdgeNotFound(id))?;
        Ok(self.edges.remove(index))
    }

    /// Remove every edge touching a task (cascade for task deletion).
    /// Returns the removed records so the deletion can be undone.
    pub fn remove_task_edges(&mut self, task_id: TaskId) -> Vec<DependencyEdge> {
        let (removed, kept): (Vec<_>, Vec<_>) = self
            .edges
            .drain(..)
            .partition(|e| e.task_id == task_id || e.depends_on_id == task_id);
        self.edges = kept;
        removed
    }

    /// Would adding `(task_id, depends_on_id)` close a cycle?
    ///
    /// Builds the current graph plus the candidate edge and checks for a
    /// directed cycle. Equivalent to asking whether `depends_on_id` is
    /// already reachable from `task_id` through the dependent direction.
    fn would_cycle(&self, task_id: TaskId, depends_on_id: TaskId) -> bool {
        let mut graph: DiGraph<TaskId, ()> = DiGraph::new();
        let mut index: HashMap<TaskId, NodeIndex> = HashMap::new();

        let mut node = |graph: &mut DiGraph<TaskId, ()>,
                        index: &mut HashMap<TaskId, NodeIndex>,
                        id: TaskId| {
            *index.entry(id).or_insert_with(|| graph.add_node(id))
        };

        for edge in &self.edges {
            let from = node(&mut graph, &mut index, edge.depends_on_id);
            let to = node(&mut graph, &mut index, edge.task_id);
            graph.add_edge(from, to, ());
        }

        let from = node(&mut graph, &mut index, depends_on_id);
        let to = node(&mut graph, &mut index, task_id);
        graph.add_edge(from, to, ());

        is_cyclic_directed(&graph)
    }
}
