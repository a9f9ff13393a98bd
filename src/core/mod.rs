//! Core domain models for the orchestration engine.
//!
//! This module contains the fundamental data structures: tasks, the
//! dependency edge set with acyclicity enforcement, genre classification,
//! and the derived execution plan.

pub mod genre;
pub mod graph;
pub mod plan;
pub mod task;

pub use genre::{lane_assignments, Genre, GenreId};
pub use graph::{DependencyEdge, DependencyGraph, EdgeId};
pub use plan::{ExecutionPlan, PlanEntry, Readiness};
pub use task::{Position, ProjectId, Task, TaskId, TaskStatus};
