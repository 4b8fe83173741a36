//! Running (and retained) workflow instances.

use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Lifecycle status of an instance. Monotonic towards a terminal value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceStatus {
    /// Nodes are being scheduled.
    Running,
    /// Every reached terminal node settled successfully.
    Completed,
    /// A node failure ended the instance under the stop policy.
    Failed,
    /// Scheduling is frozen; in-flight nodes still settle.
    Paused,
    /// Cancelled by the caller.
    Cancelled,
}

impl InstanceStatus {
    /// Whether no further status change may occur.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Stable lowercase name for events and errors.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Paused => "paused",
            Self::Cancelled => "cancelled",
        }
    }
}

/// Per-node progress within an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeState {
    /// Not reached yet.
    Pending,
    /// Currently executing.
    Running,
    /// Finished with a result.
    Completed,
    /// Exhausted retries.
    Failed,
    /// Failed under the continue policy, or bypassed by traversal.
    Skipped,
}

impl NodeState {
    /// Whether the node will make no further progress.
    pub fn is_settled(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Skipped)
    }
}

/// One run of a workflow definition.
///
/// Instances reference, never own, their definition, and are retained
/// for query after reaching a terminal status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowInstance {
    /// Instance identifier.
    pub id: String,
    /// Definition this instance runs.
    pub workflow_id: String,
    /// Lifecycle status.
    pub status: InstanceStatus,
    /// Instance variables (defaults merged with inputs).
    pub variables: Value,
    /// Per-node progress.
    pub node_states: HashMap<String, NodeState>,
    /// Nodes currently running.
    pub current_nodes: BTreeSet<String>,
    /// Nodes that completed. Grows monotonically.
    pub completed_nodes: BTreeSet<String>,
    /// Nodes that failed (including continue-policy skips that failed).
    pub failed_nodes: BTreeSet<String>,
    /// Per-node results.
    pub results: HashMap<String, Value>,
    /// Parent instance for sub-workflows.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_instance_id: Option<String>,
    /// Root of the instance tree (self for top-level instances).
    pub root_instance_id: String,
    /// Nesting depth, 0 for top-level instances.
    pub depth: u32,
    /// Start time.
    pub started_at: DateTime<Utc>,
    /// Terminal time, once reached.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl WorkflowInstance {
    /// Scope used for substitution: the variables with the given parent
    /// result layered in as `result`.
    pub fn scope_with_result(&self, result: Option<&Value>) -> Value {
        let mut scope = self.variables.clone();
        if !scope.is_object() {
            scope = Value::Object(serde_json::Map::new());
        }
        if let (Some(map), Some(result)) = (scope.as_object_mut(), result) {
            map.insert("result".to_string(), result.clone());
        }
        scope
    }
}
