#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **flotilla-types** – Shared primitive data structures for Flotilla.
//!
//! The crate is dependency-light and sits at the very bottom of the crate
//! graph so that *every* other crate can depend on it without causing cycles.
//! It intentionally makes no assumptions about I/O, scheduling, or storage:
//! events, tasks, plans, agent descriptors, and configuration knobs live
//! here; the machinery that moves them lives in the crates above.

use thiserror::Error;

//─────────────────────────────
//  Validation limits
//─────────────────────────────

/// Maximum allowed size for task descriptions to prevent memory exhaustion.
pub const MAX_TASK_DESCRIPTION_LEN: usize = 4096;

/// Maximum allowed size for task and agent identifiers.
pub const MAX_ID_LEN: usize = 256;

/// Maximum allowed size for an event type string.
pub const MAX_EVENT_TYPE_LEN: usize = 512;

//─────────────────────────────
//  Modules
//─────────────────────────────

/// Event record, metadata, and the typed payload overlays for core events.
pub mod event;
/// Task primitives handed to agents.
pub mod task;
/// Layered execution plans produced by dependency resolution.
pub mod plan;
/// Agent descriptors, lifecycle states, and persisted state snapshots.
pub mod agent;
/// Cluster descriptors used by multi-cluster routing.
pub mod cluster;
/// Runtime configuration knobs and their defaults.
pub mod config;

pub use agent::{
    AgentCapabilities, AgentConfig, AgentState, AgentStatus, ContextSnapshot, RegisteredAgent,
    RuntimeKind, SavedState, StateEntry,
};
pub use cluster::{Cluster, ClusterHealth, ClusterLoad};
pub use config::{
    BusConfig, EngineConfig, LoadBalancerConfig, PersistConfig, RetryBackoff, RuntimeConfig,
    SelectorWeights, StateConfig, StoreConfig, WorkflowEngineConfig,
};
pub use event::{Event, EventMetadata, EventPriority};
pub use plan::{ExecutionPlan, PlanLevel};
pub use task::{Task, TaskPriority, TaskWithDependencies};

//─────────────────────────────
//  Validation error
//─────────────────────────────

/// Error raised by validated constructors in this crate.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ValidationError {
    /// A field exceeded its maximum allowed length.
    #[error("{field} too long: {actual} > {max}")]
    TooLong {
        /// Name of the offending field.
        field: &'static str,
        /// Observed length.
        actual: usize,
        /// Maximum allowed length.
        max: usize,
    },
    /// A required field was empty or whitespace-only.
    #[error("{field} cannot be empty")]
    Empty {
        /// Name of the offending field.
        field: &'static str,
    },
    /// A numeric field was outside its allowed range.
    #[error("{field} out of range: {value}")]
    OutOfRange {
        /// Name of the offending field.
        field: &'static str,
        /// Observed value.
        value: f64,
    },
}

pub(crate) fn check_id(field: &'static str, value: &str) -> Result<(), ValidationError> {
    if value.trim().is_empty() {
        return Err(ValidationError::Empty { field });
    }
    if value.len() > MAX_ID_LEN {
        return Err(ValidationError::TooLong {
            field,
            actual: value.len(),
            max: MAX_ID_LEN,
        });
    }
    Ok(())
}

pub(crate) fn check_unit_interval(field: &'static str, value: f64) -> Result<(), ValidationError> {
    if !(0.0..=1.0).contains(&value) {
        return Err(ValidationError::OutOfRange { field, value });
    }
    Ok(())
}
