//! Workflow definitions: nodes as a tagged union over the six kinds,
//! edges with optional guard expressions, declared variables, and
//! registration-time validation.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use flotilla_graph::Dag;
use flotilla_types::RetryBackoff;

use crate::WorkflowError;

//─────────────────────────────
//  Node configs
//─────────────────────────────

/// Selection hints a task node passes through to agent dispatch.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskSelectorConfig {
    /// Skills the selected agent must declare.
    #[serde(default)]
    pub required_skills: Vec<String>,
}

/// Config of a `task` node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskNodeConfig {
    /// Executor-facing task type; becomes the task name.
    pub task_type: String,
    /// Parameters, substituted against the instance scope before execution.
    #[serde(default)]
    pub parameters: Value,
    /// Agent selection hints.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_selector: Option<TaskSelectorConfig>,
    /// Per-attempt timeout; the engine default applies when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    /// Retries after the first attempt.
    #[serde(default)]
    pub retries: u32,
    /// Base delay between attempts.
    #[serde(default)]
    pub retry_delay_ms: u64,
    /// Backoff shape over the base delay.
    #[serde(default)]
    pub retry_backoff: RetryBackoff,
}

/// Config of a `condition` node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConditionConfig {
    /// Boolean expression over `${...}` substitutions and the parent
    /// node's `result`.
    pub condition: String,
    /// Node followed when the expression is true.
    pub true_branch: String,
    /// Node followed when the expression is false.
    pub false_branch: String,
}

/// How a `parallel` node waits for its branches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum WaitPolicy {
    /// A fixed number of completed branches.
    Count(u32),
    /// All branches, or the first one.
    Mode(WaitMode),
}

/// Named wait policies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WaitMode {
    /// Wait for every branch to settle.
    All,
    /// Resolve on the first completed branch.
    Any,
}

impl Default for WaitPolicy {
    fn default() -> Self {
        Self::Mode(WaitMode::All)
    }
}

/// Config of a `parallel` node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParallelConfig {
    /// Nodes run as branches; excluded from the workflow's start set.
    pub branches: Vec<String>,
    /// Completion policy.
    #[serde(default)]
    pub wait_for: WaitPolicy,
}

/// Result combination applied by a `merge` node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MergeStrategy {
    /// All parent results as an array.
    Collect,
    /// The first settled parent's result.
    First,
    /// The last settled parent's result.
    Last,
    /// Concatenate array/string results.
    Concat,
    /// Fold parent results with a reduce expression over `acc` and `item`.
    Reduce,
}

/// Config of a `merge` node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergeConfig {
    /// Combination strategy.
    pub strategy: MergeStrategy,
    /// Reduce expression, required by [`MergeStrategy::Reduce`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reduce_function: Option<String>,
}

/// Config of a `delay` node: a duration or an absolute time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DelayConfig {
    /// Sleep for this long.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    /// Or sleep until this instant.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub until: Option<chrono::DateTime<chrono::Utc>>,
}

/// Config of a `sub-workflow` node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubWorkflowConfig {
    /// Workflow definition to start as a child instance.
    pub workflow_id: String,
    /// Child inputs: variable name to a path into the parent scope.
    #[serde(default)]
    pub inputs: HashMap<String, String>,
    /// Whether to poll the child to a terminal status.
    #[serde(default = "default_true")]
    pub wait_for_completion: bool,
    /// Wait bound; the engine's sub-workflow timeout applies when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    /// Whether a failed child fails this node.
    #[serde(default = "default_true")]
    pub propagate_errors: bool,
}

fn default_true() -> bool {
    true
}

/// The six node kinds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "config", rename_all = "kebab-case")]
pub enum NodeKind {
    /// Execute a task on a selected agent.
    Task(TaskNodeConfig),
    /// Follow one of two branches based on an expression.
    Condition(ConditionConfig),
    /// Fan out into branches with a wait policy.
    Parallel(ParallelConfig),
    /// Combine the results of the immediate graph parents.
    Merge(MergeConfig),
    /// Sleep for a duration or until an instant.
    Delay(DelayConfig),
    /// Start another workflow as a child instance.
    SubWorkflow(SubWorkflowConfig),
}

/// One step of a workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowNode {
    /// Node identifier, unique within the workflow.
    pub id: String,
    /// The node's kind and configuration.
    #[serde(flatten)]
    pub kind: NodeKind,
}

/// A directed edge; traversal evaluates the guard against
/// `{...variables, result}` and skips the edge when false.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowEdge {
    /// Source node.
    pub from: String,
    /// Target node.
    pub to: String,
    /// Optional boolean guard expression.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
}

/// A declared workflow variable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariableDef {
    /// Variable name.
    pub name: String,
    /// Default applied when no input is supplied.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    /// Whether starting without a value is an error.
    #[serde(default)]
    pub required: bool,
}

/// What happens when a node exhausts its retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailurePolicy {
    /// Mark the instance failed.
    Stop,
    /// Skip the failing node and continue with `{"error": ...}`.
    Continue,
}

impl Default for FailurePolicy {
    fn default() -> Self {
        Self::Stop
    }
}

//─────────────────────────────
//  Workflow
//─────────────────────────────

/// A user-defined DAG of heterogeneous nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Workflow {
    /// Definition identifier.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Nodes, any of the six kinds.
    pub nodes: Vec<WorkflowNode>,
    /// Edges between nodes.
    #[serde(default)]
    pub edges: Vec<WorkflowEdge>,
    /// Declared variables.
    #[serde(default)]
    pub variables: Vec<VariableDef>,
    /// Failure policy for nodes that exhaust retries.
    #[serde(default)]
    pub on_failure: FailurePolicy,
}

impl Workflow {
    /// Validate the definition: unique node ids, resolvable references,
    /// and an acyclic graph (explicit edges plus the implicit edges from
    /// condition and parallel nodes to their branches).
    pub fn validate(&self) -> Result<(), WorkflowError> {
        let invalid = |reason: String| WorkflowError::Invalid {
            workflow_id: self.id.clone(),
            reason,
        };

        let mut ids = HashSet::new();
        for node in &self.nodes {
            if !ids.insert(node.id.as_str()) {
                return Err(invalid(format!("duplicate node id `{}`", node.id)));
            }
        }

        for edge in &self.edges {
            for endpoint in [&edge.from, &edge.to] {
                if !ids.contains(endpoint.as_str()) {
                    return Err(invalid(format!(
                        "edge {} -> {} references unknown node `{endpoint}`",
                        edge.from, edge.to
                    )));
                }
            }
        }

        for node in &self.nodes {
            match &node.kind {
                NodeKind::Condition(config) => {
                    for branch in [&config.true_branch, &config.false_branch] {
                        if !ids.contains(branch.as_str()) {
                            return Err(invalid(format!(
                                "condition `{}` references unknown branch `{branch}`",
                                node.id
                            )));
                        }
                    }
                }
                NodeKind::Parallel(config) => {
                    if config.branches.is_empty() {
                        return Err(invalid(format!(
                            "parallel `{}` declares no branches",
                            node.id
                        )));
                    }
                    for branch in &config.branches {
                        if !ids.contains(branch.as_str()) {
                            return Err(invalid(format!(
                                "parallel `{}` references unknown branch `{branch}`",
                                node.id
                            )));
                        }
                    }
                }
                NodeKind::Merge(config) => {
                    if config.strategy == MergeStrategy::Reduce && config.reduce_function.is_none()
                    {
                        return Err(invalid(format!(
                            "merge `{}` uses the reduce strategy without a reduce function",
                            node.id
                        )));
                    }
                }
                NodeKind::Delay(config) => {
                    if config.duration_ms.is_none() && config.until.is_none() {
                        return Err(invalid(format!(
                            "delay `{}` needs a duration or an absolute time",
                            node.id
                        )));
                    }
                }
                _ => {}
            }
        }

        let mut names = HashSet::new();
        for variable in &self.variables {
            if !names.insert(variable.name.as_str()) {
                return Err(invalid(format!(
                    "duplicate variable `{}`",
                    variable.name
                )));
            }
        }

        let mut dag: Dag<()> = Dag::new();
        for node in &self.nodes {
            dag.add_node(node.id.clone(), ());
        }
        for (from, to) in self.all_edges() {
            // Duplicate edges collapse inside the graph.
            dag.add_edge(&from, &to)
                .map_err(|e| invalid(e.to_string()))?;
        }
        if let Some(cycle) = dag.detect_cycle() {
            return Err(invalid(format!("cycle: {}", cycle.join(" -> "))));
        }

        Ok(())
    }

    /// Explicit edges plus the implicit condition/parallel branch edges.
    pub fn all_edges(&self) -> Vec<(String, String)> {
        let mut edges: Vec<(String, String)> = self
            .edges
            .iter()
            .map(|edge| (edge.from.clone(), edge.to.clone()))
            .collect();
        for node in &self.nodes {
            match &node.kind {
                NodeKind::Condition(config) => {
                    edges.push((node.id.clone(), config.true_branch.clone()));
                    edges.push((node.id.clone(), config.false_branch.clone()));
                }
                NodeKind::Parallel(config) => {
                    for branch in &config.branches {
                        edges.push((node.id.clone(), branch.clone()));
                    }
                }
                _ => {}
            }
        }
        edges.sort();
        edges.dedup();
        edges
    }

    /// Start nodes: no incoming edges, explicit or implicit.
    /// Parallel branches and condition targets are triggered by their
    /// controlling node, never at start.
    pub fn start_nodes(&self) -> Vec<String> {
        let with_incoming: HashSet<String> =
            self.all_edges().into_iter().map(|(_, to)| to).collect();
        self.nodes
            .iter()
            .filter(|node| !with_incoming.contains(&node.id))
            .map(|node| node.id.clone())
            .collect()
    }

    /// Look up a node.
    pub fn node(&self, id: &str) -> Option<&WorkflowNode> {
        self.nodes.iter().find(|node| node.id == id)
    }

    /// Ids every parallel node lists as a branch.
    pub fn parallel_branches(&self) -> HashSet<String> {
        let mut branches = HashSet::new();
        for node in &self.nodes {
            if let NodeKind::Parallel(config) = &node.kind {
                branches.extend(config.branches.iter().cloned());
            }
        }
        branches
    }

    /// Explicit outgoing edges of a node.
    pub fn edges_from(&self, id: &str) -> Vec<&WorkflowEdge> {
        self.edges.iter().filter(|edge| edge.from == id).collect()
    }

    /// Explicit incoming parents of a node, in edge order.
    pub fn parents_of(&self, id: &str) -> Vec<String> {
        self.edges
            .iter()
            .filter(|edge| edge.to == id)
            .map(|edge| edge.from.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn task_node(id: &str) -> WorkflowNode {
        WorkflowNode {
            id: id.to_string(),
            kind: NodeKind::Task(TaskNodeConfig {
                task_type: format!("{id}-work"),
                parameters: json!({}),
                agent_selector: None,
                timeout_ms: None,
                retries: 0,
                retry_delay_ms: 0,
                retry_backoff: RetryBackoff::Fixed,
            }),
        }
    }

    fn edge(from: &str, to: &str) -> WorkflowEdge {
        WorkflowEdge {
            from: from.to_string(),
            to: to.to_string(),
            condition: None,
        }
    }

    fn minimal(nodes: Vec<WorkflowNode>, edges: Vec<WorkflowEdge>) -> Workflow {
        Workflow {
            id: "wf".into(),
            name: "test workflow".into(),
            nodes,
            edges,
            variables: vec![],
            on_failure: FailurePolicy::Stop,
        }
    }

    #[test]
    fn valid_linear_workflow() {
        let wf = minimal(
            vec![task_node("a"), task_node("b")],
            vec![edge("a", "b")],
        );
        wf.validate().unwrap();
        assert_eq!(wf.start_nodes(), vec!["a"]);
    }

    #[test]
    fn unknown_edge_endpoint_is_rejected() {
        let wf = minimal(vec![task_node("a")], vec![edge("a", "ghost")]);
        assert!(wf.validate().is_err());
    }

    #[test]
    fn duplicate_node_ids_are_rejected() {
        let wf = minimal(vec![task_node("a"), task_node("a")], vec![]);
        assert!(wf.validate().is_err());
    }

    #[test]
    fn cycles_are_rejected() {
        let wf = minimal(
            vec![task_node("a"), task_node("b")],
            vec![edge("a", "b"), edge("b", "a")],
        );
        let err = wf.validate().unwrap_err();
        assert!(err.to_string().contains("cycle"));
    }

    #[test]
    fn missing_condition_branch_is_rejected() {
        let mut wf = minimal(vec![task_node("a")], vec![]);
        wf.nodes.push(WorkflowNode {
            id: "c".into(),
            kind: NodeKind::Condition(ConditionConfig {
                condition: "${x} > 1".into(),
                true_branch: "a".into(),
                false_branch: "ghost".into(),
            }),
        });
        assert!(wf.validate().is_err());
    }

    #[test]
    fn parallel_branches_are_not_start_nodes() {
        let mut wf = minimal(vec![task_node("a"), task_node("b"), task_node("c")], vec![]);
        wf.nodes.push(WorkflowNode {
            id: "p".into(),
            kind: NodeKind::Parallel(ParallelConfig {
                branches: vec!["b".into(), "c".into()],
                wait_for: WaitPolicy::default(),
            }),
        });
        wf.validate().unwrap();
        let mut starts = wf.start_nodes();
        starts.sort();
        assert_eq!(starts, vec!["a", "p"]);
    }

    #[test]
    fn reduce_merge_requires_a_function() {
        let mut wf = minimal(vec![task_node("a")], vec![]);
        wf.nodes.push(WorkflowNode {
            id: "m".into(),
            kind: NodeKind::Merge(MergeConfig {
                strategy: MergeStrategy::Reduce,
                reduce_function: None,
            }),
        });
        assert!(wf.validate().is_err());
    }

    #[test]
    fn node_kind_serde_round_trip() {
        let node = WorkflowNode {
            id: "d".into(),
            kind: NodeKind::Delay(DelayConfig {
                duration_ms: Some(250),
                until: None,
            }),
        };
        let json = serde_json::to_value(&node).unwrap();
        assert_eq!(json["type"], "delay");
        assert_eq!(json["config"]["duration_ms"], 250);
        let back: WorkflowNode = serde_json::from_value(json).unwrap();
        assert_eq!(back, node);
    }

    #[test]
    fn wait_policy_deserializes_names_and_counts() {
        let all: WaitPolicy = serde_json::from_value(json!("all")).unwrap();
        assert_eq!(all, WaitPolicy::Mode(WaitMode::All));
        let two: WaitPolicy = serde_json::from_value(json!(2)).unwrap();
        assert_eq!(two, WaitPolicy::Count(2));
    }
}
