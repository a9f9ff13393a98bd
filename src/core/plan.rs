//! Execution plan computation.
//!
//! A pure projection of `(tasks, edges)` into per-task readiness plus an
//! ordered set of execution levels. The plan is derived state: it is
//! regenerated after every relevant mutation and never mutated in place.
//! Given identical inputs the output is identical; ties are broken by
//! task id so downstream consumers see a stable ordering.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::core::graph::DependencyEdge;
use crate::core::task::{Task, TaskId, TaskStatus};

/// Derived per-task readiness for one plan snapshot.
///
/// Status is authoritative: a done or cancelled task reports
/// completed/cancelled no matter what the graph says. Only todo and
/// in_review tasks consult their dependencies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum Readiness {
    /// Every direct dependency is done; eligible for dispatch.
    Ready,
    /// At least one direct dependency is not done.
    Blocked {
        /// The direct dependencies currently holding this task back.
        blocking_task_ids: Vec<TaskId>,
    },
    /// The task is being worked on.
    InProgress,
    /// The task is done.
    Completed,
    /// The task was cancelled.
    Cancelled,
}

impl Readiness {
    pub fn is_ready(&self) -> bool {
        matches!(self, Readiness::Ready)
    }

    /// Completed or cancelled: this task will never be dispatched.
    pub fn is_settled(&self) -> bool {
        matches!(self, Readiness::Completed | Readiness::Cancelled)
    }
}

/// One task's entry in a plan level.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanEntry {
    pub task_id: TaskId,
    pub readiness: Readiness,
}

/// An ordered sequence of execution levels.
///
/// `level(task)` is the longest-path distance from a dependency-free task:
/// 0 without dependencies, otherwise `1 + max(level of each dependency)`.
/// Levels order presentation only; readiness depends on dependency status,
/// never on level.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionPlan {
    pub levels: Vec<Vec<PlanEntry>>,
}

impl ExecutionPlan {
    /// Compute the plan for the given tasks and edges.
    pub fn compute(tasks: &[Task], edges: &[DependencyEdge]) -> Self {
        let by_id: HashMap<TaskId, &Task> = tasks.iter().map(|t| (t.id, t)).collect();

        // Direct dependency sets, ignoring edges whose endpoints are gone
        // (cascade deletion makes those transient at worst).
        let mut deps: HashMap<TaskId, Vec<TaskId>> = HashMap::new();
        for edge in edges {
            if by_id.contains_key(&edge.task_id) && by_id.contains_key(&edge.depends_on_id) {
                deps.entry(edge.task_id).or_default().push(edge.depends_on_id);
            }
        }

        let mut levels_by_task: HashMap<TaskId, usize> = HashMap::new();
        for task in tasks {
            level_of(task.id, &deps, &mut levels_by_task);
        }

        let depth = levels_by_task.values().copied().max().map_or(0, |d| d + 1);
        let mut levels: Vec<Vec<PlanEntry>> = vec![Vec::new(); depth];

        let mut ordered: Vec<&Task> = tasks.iter().collect();
        ordered.sort_by_key(|t| t.id);

        for task in ordered {
            let readiness = readiness_of(task, &deps, &by_id);
            let level = levels_by_task.get(&task.id).copied().unwrap_or(0);
            levels[level].push(PlanEntry {
                task_id: task.id,
                readiness,
            });
        }

        Self { levels }
    }

    /// Look up one task's readiness in this plan.
    pub fn readiness(&self, task_id: TaskId) -> Option<&Readiness> {
        self.levels
            .iter()
            .flatten()
            .find(|e| e.task_id == task_id)
            .map(|e| &e.readiness)
    }

    /// Task ids currently ready, in level-then-id order.
    pub fn ready_tasks(&self) -> Vec<TaskId> {
        self.levels
            .iter()
            .flatten()
            .filter(|e| e.readiness.is_ready())
            .map(|e| e.task_id)
            .collect()
    }

    /// Whether every task is completed or cancelled.
    pub fn all_settled(&self) -> bool {
        self.levels
            .iter()
            .flatten()
            .all(|e| e.readiness.is_settled())
    }

    /// Total number of task entries across all levels.
    pub fn task_count(&self) -> usize {
        self.levels.iter().map(|l| l.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.task_count() == 0
    }
}

/// Longest-path level with memoization. The edge set is a DAG by
/// construction, so the recursion terminates.
fn level_of(
    id: TaskId,
    deps: &HashMap<TaskId, Vec<TaskId>>,
    memo: &mut HashMap<TaskId, usize>,
) -> usize {
    if let Some(&level) = memo.get(&id) {
        return level;
    }
    let level = match deps.get(&id) {
        None => 0,
        Some(direct) if direct.is_empty() => 0,
        Some(direct) => {
            1 + direct
                .iter()
                .map(|d| level_of(*d, deps, memo))
                .max()
                .unwrap_or(0)
        }
    };
    memo.insert(id, level);
    level
}

fn readiness_of(
    task: &Task,
    deps: &HashMap<TaskId, Vec<TaskId>>,
    by_id: &HashMap<TaskId, &Task>,
) -> Readiness {
    match task.status {
        TaskStatus::Done => Readiness::Completed,
        TaskStatus::Cancelled => Readiness::Cancelled,
        TaskStatus::InProgress => Readiness::InProgress,
        TaskStatus::Todo | TaskStatus::InReview => {
            let mut blocking: Vec<TaskId> = deps
                .get(&task.id)
                .map(|direct| {
                    direct
                        .iter()
                        .filter(|d| {
                            by_id
                                .get(*d)
                                .map(|t| t.status != TaskStatus::Done)
                                .unwrap_or(false)
                        })
                        .copied()
                        .collect()
                })
                .unwrap_or_default();

            if blocking.is_empty() {
                Readiness::Ready
            } else {
                blocking.sort();
                blocking.dedup();
                Readiness::Blocked {
                    blocking_task_ids: blocking,
                }
            }
        }
    }
}
