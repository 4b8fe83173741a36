#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **flotilla-agents** – Agent lifecycle management for Flotilla.
//!
//! Each registered agent is driven by a guarded finite state machine
//! ([`AgentStateMachine`]) whose committed transitions append to a
//! monotonic state log and surface as bus events. The
//! [`PersistentStateMachine`] wrapper debounces durable snapshots into a
//! [`StateStorage`](flotilla_store::StateStorage). The [`AgentRegistry`] is
//! the in-memory directory the selector scores against, and the
//! [`StatefulAgentRegistry`] binds one machine per registered agent and
//! exposes the work-assignment operations the execution layers call.
//!
//! Ownership is unidirectional: the stateful registry owns the machines;
//! machines reach back only through the narrow [`StateObserver`] and
//! [`TransitionHooks`] seams.

use thiserror::Error;

use flotilla_types::AgentState;

mod machine;
mod persistent;
mod registry;
mod stateful;

pub use machine::{
    AgentStateMachine, AgentStats, Guard, MachineContext, NoHooks, StateObserver, TransitionHooks,
};
pub use persistent::PersistentStateMachine;
pub use registry::AgentRegistry;
pub use stateful::StatefulAgentRegistry;

/// Errors surfaced by agent lifecycle operations.
#[derive(Debug, Error)]
pub enum AgentError {
    /// The requested transition leaves a terminal state or is not a
    /// defined edge.
    #[error("invalid transition for agent `{agent_id}`: {from} -> {to}")]
    InvalidTransition {
        /// Agent whose machine rejected the move.
        agent_id: String,
        /// Current state.
        from: AgentState,
        /// Requested state.
        to: AgentState,
    },
    /// A transition action raised; the transition did not commit.
    #[error("transition action failed for agent `{agent_id}` ({from} -> {to}): {source}")]
    ActionFailed {
        /// Agent whose action failed.
        agent_id: String,
        /// State the transition started from.
        from: AgentState,
        /// State the transition targeted.
        to: AgentState,
        /// Underlying failure.
        #[source]
        source: anyhow::Error,
    },
    /// The agent is not registered.
    #[error("agent `{0}` is not registered")]
    UnknownAgent(String),
    /// Saving or deleting persisted state failed.
    #[error("state persistence failed for agent `{agent_id}`: {source}")]
    Persistence {
        /// Agent whose state could not be persisted.
        agent_id: String,
        /// Underlying failure.
        #[source]
        source: anyhow::Error,
    },
    /// A registration config failed validation.
    #[error(transparent)]
    Validation(#[from] flotilla_types::ValidationError),
}
