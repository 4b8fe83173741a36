#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **flotilla-workflow** – Workflow interpretation for Flotilla.
//!
//! A workflow is a DAG over nodes of six kinds (task, condition, parallel,
//! merge, delay, sub-workflow) expressed as a tagged union and validated at
//! registration (references resolve, graph acyclic). The [`WorkflowEngine`]
//! interprets instances: `${a.b.c}` variable substitution against the
//! instance scope, constrained boolean expressions for conditions and edge
//! guards (evaluation failure is `false`, never a crash), bounded node
//! concurrency, per-node retry and timeout policy, recursive sub-workflow
//! starts with a nesting cap, and pause/resume/cancel control.

use thiserror::Error;

mod definition;
mod engine;
mod instance;
mod substitution;

pub use definition::{
    ConditionConfig, DelayConfig, FailurePolicy, MergeConfig, MergeStrategy, NodeKind,
    ParallelConfig, SubWorkflowConfig, TaskNodeConfig, TaskSelectorConfig, VariableDef, WaitMode,
    WaitPolicy, Workflow, WorkflowEdge, WorkflowNode,
};
pub use engine::WorkflowEngine;
pub use instance::{InstanceStatus, NodeState, WorkflowInstance};
pub use substitution::{evaluate_condition, lookup_path, substitute_str, substitute_value};

/// Errors surfaced by workflow registration and control.
#[derive(Debug, Error)]
pub enum WorkflowError {
    /// The workflow id is not registered.
    #[error("workflow `{0}` is not registered")]
    UnknownWorkflow(String),
    /// The instance id is not known.
    #[error("workflow instance `{0}` is not known")]
    UnknownInstance(String),
    /// The definition failed validation.
    #[error("invalid workflow `{workflow_id}`: {reason}")]
    Invalid {
        /// The offending workflow.
        workflow_id: String,
        /// What is wrong with it.
        reason: String,
    },
    /// A required variable has neither a default nor an input value.
    #[error("workflow `{workflow_id}` requires variable `{name}`")]
    MissingVariable {
        /// The workflow being started.
        workflow_id: String,
        /// The missing variable.
        name: String,
    },
    /// Sub-workflow nesting exceeded the configured depth cap.
    #[error("sub-workflow nesting depth {depth} exceeds the maximum of {max}")]
    NestingTooDeep {
        /// Depth the start would reach.
        depth: u32,
        /// Configured cap.
        max: u32,
    },
    /// The control operation does not apply to the instance's status.
    #[error("instance `{instance_id}` is {status}; cannot {operation}")]
    InvalidControl {
        /// The addressed instance.
        instance_id: String,
        /// Its current status.
        status: String,
        /// The rejected operation.
        operation: String,
    },
}
