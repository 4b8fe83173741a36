//! Task graph validation and execution plan construction.

use std::collections::HashMap;

use tracing::debug;

use flotilla_types::{ExecutionPlan, PlanLevel, Task, TaskWithDependencies};

use crate::dag::{Dag, GraphError};

/// Options accepted by [`DependencyResolver::resolve`].
#[derive(Debug, Clone, Default)]
pub struct ResolveOptions {
    /// Reject plans deeper than this many levels.
    pub max_levels: Option<usize>,
}

/// Outcome of resolving a task graph.
#[derive(Debug, Clone)]
pub struct Resolution {
    /// Whether the input graph was valid.
    pub valid: bool,
    /// Human-readable validation errors; empty when valid.
    pub errors: Vec<String>,
    /// The execution plan; present only when valid.
    pub plan: Option<ExecutionPlan>,
}

/// Validates task graphs and produces layered [`ExecutionPlan`]s.
#[derive(Debug, Default)]
pub struct DependencyResolver {
    graph: Dag<Task>,
}

impl DependencyResolver {
    /// An empty resolver.
    pub fn new() -> Self {
        Self { graph: Dag::new() }
    }

    /// Clear and rebuild the internal graph from the given tasks.
    ///
    /// Edges pointing at unknown task ids are reported, not added; the
    /// remaining graph is still built so cycle checks can run alongside.
    pub fn build_graph(&mut self, tasks: &[TaskWithDependencies]) -> Vec<String> {
        self.graph.clear();
        let mut errors = Vec::new();
        for node in tasks {
            self.graph.add_node(node.id.clone(), node.task.clone());
        }
        for node in tasks {
            for dependency in &node.dependencies {
                match self.graph.add_edge(dependency, &node.id) {
                    Ok(()) => {}
                    Err(GraphError::MissingNode(missing)) => {
                        errors.push(format!(
                            "task `{}` depends on unknown task `{}`",
                            node.id, missing
                        ));
                    }
                    Err(other) => errors.push(other.to_string()),
                }
            }
        }
        errors
    }

    /// Validate the task graph and produce an execution plan.
    pub fn resolve(&mut self, tasks: &[TaskWithDependencies], options: &ResolveOptions) -> Resolution {
        let mut errors = self.build_graph(tasks);

        if let Some(cycle) = self.graph.detect_cycle() {
            errors.push(GraphError::Cycle(cycle).to_string());
        }

        if !errors.is_empty() {
            return Resolution {
                valid: false,
                errors,
                plan: None,
            };
        }

        let level_ids = match self.graph.execution_levels() {
            Ok(levels) => levels,
            Err(error) => {
                return Resolution {
                    valid: false,
                    errors: vec![error.to_string()],
                    plan: None,
                }
            }
        };

        if let Some(max_levels) = options.max_levels {
            if level_ids.len() > max_levels {
                return Resolution {
                    valid: false,
                    errors: vec![format!(
                        "plan depth {} exceeds the configured maximum of {max_levels} levels",
                        level_ids.len()
                    )],
                    plan: None,
                };
            }
        }

        let by_id: HashMap<&str, &TaskWithDependencies> =
            tasks.iter().map(|t| (t.id.as_str(), t)).collect();
        let levels: Vec<PlanLevel> = level_ids
            .into_iter()
            .enumerate()
            .map(|(index, ids)| {
                let tasks: Vec<TaskWithDependencies> = ids
                    .iter()
                    .filter_map(|id| by_id.get(id.as_str()).map(|t| (*t).clone()))
                    .collect();
                let parallel = tasks.len() > 1;
                PlanLevel {
                    level: index as u32,
                    tasks,
                    parallel,
                }
            })
            .collect();

        let estimated_parallelism = levels.iter().map(|l| l.tasks.len()).max().unwrap_or(0);
        let plan = ExecutionPlan {
            total_tasks: tasks.len(),
            estimated_parallelism,
            critical_path: self.graph.critical_path(),
            levels,
        };
        debug!(
            total_tasks = plan.total_tasks,
            levels = plan.levels.len(),
            parallelism = plan.estimated_parallelism,
            "resolved execution plan"
        );

        Resolution {
            valid: true,
            errors: Vec::new(),
            plan: Some(plan),
        }
    }

    /// Borrow the underlying graph (rebuilt on every resolve).
    pub fn graph(&self) -> &Dag<Task> {
        &self.graph
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(id: &str) -> Task {
        Task::new(id, format!("task {id}")).unwrap()
    }

    fn node(id: &str, deps: &[&str]) -> TaskWithDependencies {
        TaskWithDependencies::with_dependencies(task(id), deps.iter().copied())
    }

    #[test]
    fn linear_chain_resolves_to_one_task_per_level() {
        let tasks = vec![node("a", &[]), node("b", &["a"]), node("c", &["b"])];
        let mut resolver = DependencyResolver::new();
        let resolution = resolver.resolve(&tasks, &ResolveOptions::default());

        assert!(resolution.valid);
        let plan = resolution.plan.unwrap();
        assert_eq!(plan.levels.len(), 3);
        assert_eq!(plan.estimated_parallelism, 1);
        assert_eq!(plan.critical_path, vec!["a", "b", "c"]);
        assert!(plan.levels.iter().all(|l| !l.parallel));
    }

    #[test]
    fn diamond_resolves_with_parallel_middle() {
        let tasks = vec![
            node("a", &[]),
            node("b", &["a"]),
            node("c", &["a"]),
            node("d", &["b", "c"]),
        ];
        let mut resolver = DependencyResolver::new();
        let resolution = resolver.resolve(&tasks, &ResolveOptions::default());

        assert!(resolution.valid);
        let plan = resolution.plan.unwrap();
        assert_eq!(plan.levels.len(), 3);
        assert_eq!(plan.estimated_parallelism, 2);
        assert!(plan.levels[1].parallel);
        assert_eq!(plan.levels[0].tasks[0].id, "a");
        assert_eq!(plan.levels[2].tasks[0].id, "d");
    }

    #[test]
    fn cycle_invalidates_and_names_a_participant() {
        let tasks = vec![node("a", &["c"]), node("b", &["a"]), node("c", &["b"])];
        let mut resolver = DependencyResolver::new();
        let resolution = resolver.resolve(&tasks, &ResolveOptions::default());

        assert!(!resolution.valid);
        assert!(resolution.plan.is_none());
        let joined = resolution.errors.join("; ");
        assert!(
            joined.contains('a') || joined.contains('b') || joined.contains('c'),
            "cycle error should name a participant: {joined}"
        );
    }

    #[test]
    fn missing_dependency_is_reported_by_name() {
        let tasks = vec![node("a", &["ghost"])];
        let mut resolver = DependencyResolver::new();
        let resolution = resolver.resolve(&tasks, &ResolveOptions::default());

        assert!(!resolution.valid);
        assert!(resolution.errors[0].contains("ghost"));
    }

    #[test]
    fn level_cap_is_enforced() {
        let tasks = vec![node("a", &[]), node("b", &["a"]), node("c", &["b"])];
        let mut resolver = DependencyResolver::new();
        let resolution = resolver.resolve(
            &tasks,
            &ResolveOptions {
                max_levels: Some(2),
            },
        );

        assert!(!resolution.valid);
        assert!(resolution.errors[0].contains("exceeds"));
    }

    #[test]
    fn empty_input_is_a_valid_empty_plan() {
        let mut resolver = DependencyResolver::new();
        let resolution = resolver.resolve(&[], &ResolveOptions::default());
        assert!(resolution.valid);
        let plan = resolution.plan.unwrap();
        assert_eq!(plan.total_tasks, 0);
        assert!(plan.levels.is_empty());
    }
}
