//! Layered execution plans: the resolver's output and the engine's input.

use serde::{Deserialize, Serialize};

use crate::task::TaskWithDependencies;

/// One parallel cohort of an execution plan.
///
/// Every dependency of a task in level `k` lives in a level `< k`; level 0
/// contains exactly the root tasks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanLevel {
    /// 0-indexed level number.
    pub level: u32,
    /// Tasks that may run concurrently once all earlier levels finished.
    pub tasks: Vec<TaskWithDependencies>,
    /// Whether the level holds more than one task.
    pub parallel: bool,
}

/// A layered view of a task DAG, one level per parallel cohort.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionPlan {
    /// Levels in execution order.
    pub levels: Vec<PlanLevel>,
    /// Total number of tasks across all levels.
    pub total_tasks: usize,
    /// Size of the widest level.
    pub estimated_parallelism: usize,
    /// Longest dependency chain through the graph, as task ids.
    pub critical_path: Vec<String>,
}

impl ExecutionPlan {
    /// An empty plan.
    pub fn empty() -> Self {
        Self {
            levels: Vec::new(),
            total_tasks: 0,
            estimated_parallelism: 0,
            critical_path: Vec::new(),
        }
    }

    /// Iterate over all tasks in level order.
    pub fn tasks(&self) -> impl Iterator<Item = &TaskWithDependencies> {
        self.levels.iter().flat_map(|level| level.tasks.iter())
    }
}
