//! Property tests for plan soundness and cycle detection.

use proptest::prelude::*;

use flotilla_graph::{DependencyResolver, ResolveOptions};
use flotilla_types::{Task, TaskWithDependencies};

fn make_task(index: usize) -> Task {
    Task::new(format!("t{index}"), format!("task {index}")).expect("valid task")
}

/// Tasks whose dependencies only point at earlier indices - acyclic by
/// construction.
fn acyclic_tasks() -> impl Strategy<Value = Vec<TaskWithDependencies>> {
    (2usize..20).prop_flat_map(|count| {
        let deps = proptest::collection::vec(
            proptest::collection::vec(0usize..count, 0..4),
            count,
        );
        deps.prop_map(move |dep_lists| {
            dep_lists
                .into_iter()
                .enumerate()
                .map(|(index, raw)| {
                    let mut deps: Vec<String> = raw
                        .into_iter()
                        .filter(|&d| d < index)
                        .map(|d| format!("t{d}"))
                        .collect();
                    deps.sort();
                    deps.dedup();
                    TaskWithDependencies::with_dependencies(make_task(index), deps)
                })
                .collect()
        })
    })
}

proptest! {
    /// For every edge a -> b of the source graph, level(a) < level(b).
    #[test]
    fn plans_are_sound(tasks in acyclic_tasks()) {
        let mut resolver = DependencyResolver::new();
        let resolution = resolver.resolve(&tasks, &ResolveOptions::default());
        prop_assert!(resolution.valid, "acyclic input must resolve: {:?}", resolution.errors);

        let plan = resolution.plan.expect("valid resolution carries a plan");
        let mut level_of = std::collections::HashMap::new();
        for level in &plan.levels {
            for task in &level.tasks {
                level_of.insert(task.id.clone(), level.level);
            }
        }
        prop_assert_eq!(level_of.len(), tasks.len());

        for task in &tasks {
            for dep in &task.dependencies {
                prop_assert!(
                    level_of[dep] < level_of[&task.id],
                    "dependency {} of {} must resolve to an earlier level",
                    dep,
                    &task.id
                );
            }
        }

        let widest = plan.levels.iter().map(|l| l.tasks.len()).max().unwrap_or(0);
        prop_assert_eq!(plan.estimated_parallelism, widest);
    }

    /// Forcing a back edge onto an otherwise valid chain always yields a
    /// cycle, and resolve reports it as invalid.
    #[test]
    fn forced_cycles_are_rejected(len in 2usize..12) {
        let mut tasks: Vec<TaskWithDependencies> = (0..len)
            .map(|i| {
                let deps: Vec<String> = if i == 0 { vec![] } else { vec![format!("t{}", i - 1)] };
                TaskWithDependencies::with_dependencies(make_task(i), deps)
            })
            .collect();
        // Close the loop: t0 depends on the last task.
        tasks[0].dependencies.push(format!("t{}", len - 1));

        let mut resolver = DependencyResolver::new();
        let resolution = resolver.resolve(&tasks, &ResolveOptions::default());
        prop_assert!(!resolution.valid);
        prop_assert!(resolution.plan.is_none());
        prop_assert!(resolution.errors.iter().any(|e| e.contains("cycle")));
    }
}
