//! Task primitives: the atomic unit of work handed to an agent, and the
//! dependency-annotated wrapper consumed by the resolver.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::{check_id, ValidationError, MAX_TASK_DESCRIPTION_LEN};

//─────────────────────────────
//  Priority
//─────────────────────────────

/// Scheduling priority of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskPriority {
    /// May be deferred indefinitely.
    Low,
    /// Default priority.
    Normal,
    /// Between normal and high; kept for compatibility with intake formats.
    Medium,
    /// Scheduled ahead of normal work.
    High,
    /// Scheduled before everything else.
    Critical,
}

impl Default for TaskPriority {
    fn default() -> Self {
        Self::Normal
    }
}

//─────────────────────────────
//  Task
//─────────────────────────────

/// The atomic unit of work handed to an agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Stable task identifier, unique within a plan.
    pub id: String,
    /// Short human-readable name.
    pub name: String,
    /// Longer description of the work.
    #[serde(default)]
    pub description: String,
    /// Skills an agent must declare to be eligible.
    #[serde(default)]
    pub required_skills: BTreeSet<String>,
    /// Scheduling priority.
    #[serde(default)]
    pub priority: TaskPriority,
    /// Load contribution when assigned; defaults to 1 when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weight: Option<f64>,
    /// Whether the task can be checkpointed mid-flight (allows pausing a
    /// busy agent).
    #[serde(default)]
    pub checkpointable: bool,
    /// Whether partial progress can be saved (allows graceful stop of a
    /// busy agent).
    #[serde(default)]
    pub can_save_progress: bool,
    /// Reported progress in `[0, 1]`, if the executor surfaces it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<f64>,
    /// Engine-supplied parameter payload handed to the task executor;
    /// absent for plain plan tasks.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<serde_json::Value>,
}

impl Task {
    /// Create a task with validation of the identifier, name, and
    /// description length.
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Result<Self, ValidationError> {
        let id = id.into();
        let name = name.into();
        check_id("task id", &id)?;
        check_id("task name", &name)?;
        Ok(Self {
            id,
            name,
            description: String::new(),
            required_skills: BTreeSet::new(),
            priority: TaskPriority::Normal,
            weight: None,
            checkpointable: false,
            can_save_progress: false,
            progress: None,
            parameters: None,
        })
    }

    /// Attach an executor-facing parameter payload.
    pub fn with_parameters(mut self, parameters: serde_json::Value) -> Self {
        self.parameters = Some(parameters);
        self
    }

    /// Attach a description, enforcing the length cap.
    pub fn with_description(mut self, description: impl Into<String>) -> Result<Self, ValidationError> {
        let description = description.into();
        if description.len() > MAX_TASK_DESCRIPTION_LEN {
            return Err(ValidationError::TooLong {
                field: "task description",
                actual: description.len(),
                max: MAX_TASK_DESCRIPTION_LEN,
            });
        }
        self.description = description;
        Ok(self)
    }

    /// Require the given skills of any agent executing this task.
    pub fn with_skills<I, S>(mut self, skills: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.required_skills = skills.into_iter().map(Into::into).collect();
        self
    }

    /// Set the scheduling priority.
    pub fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }

    /// Set the load weight applied when the task is assigned.
    pub fn with_weight(mut self, weight: f64) -> Self {
        self.weight = Some(weight);
        self
    }

    /// Mark the task checkpointable.
    pub fn checkpointable(mut self) -> Self {
        self.checkpointable = true;
        self
    }

    /// Mark the task as able to save partial progress.
    pub fn can_save_progress(mut self) -> Self {
        self.can_save_progress = true;
        self
    }

    /// Effective load weight, defaulting to 1.
    pub fn effective_weight(&self) -> f64 {
        self.weight.unwrap_or(1.0)
    }
}

//─────────────────────────────
//  Task with dependencies
//─────────────────────────────

/// A task plus the ordered list of task ids it depends on.
///
/// Every dependency id must resolve to another node in the same graph; the
/// resolver rejects graphs that violate this.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskWithDependencies {
    /// Task identifier, mirrored from [`Task::id`].
    pub id: String,
    /// The task itself.
    pub task: Task,
    /// Ids of tasks that must reach a terminal status first.
    #[serde(default)]
    pub dependencies: Vec<String>,
}

impl TaskWithDependencies {
    /// Wrap a task with no dependencies.
    pub fn root(task: Task) -> Self {
        Self {
            id: task.id.clone(),
            task,
            dependencies: Vec::new(),
        }
    }

    /// Wrap a task with the given dependencies.
    pub fn with_dependencies<I, S>(task: Task, dependencies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            id: task.id.clone(),
            task,
            dependencies: dependencies.into_iter().map(Into::into).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_validation() {
        assert!(Task::new("", "build").is_err());
        assert!(Task::new("t1", "  ").is_err());
        let task = Task::new("t1", "build").unwrap();
        assert_eq!(task.effective_weight(), 1.0);
    }

    #[test]
    fn description_cap() {
        let task = Task::new("t1", "build").unwrap();
        let long = "d".repeat(MAX_TASK_DESCRIPTION_LEN + 1);
        assert!(task.clone().with_description(long).is_err());
        assert!(task.with_description("short").is_ok());
    }

    #[test]
    fn dependency_wrapper_mirrors_id() {
        let task = Task::new("t2", "test").unwrap();
        let node = TaskWithDependencies::with_dependencies(task, ["t1"]);
        assert_eq!(node.id, "t2");
        assert_eq!(node.dependencies, vec!["t1".to_string()]);
    }
}
