#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **flotilla-routing** – Agent selection and multi-cluster routing.
//!
//! [`AgentSelector`] scores healthy registry agents against selection
//! criteria under a named strategy; [`LoadBalancer`] routes work requests
//! across clusters with session affinity, per-cluster circuit breakers,
//! and rebalance planning. Both read snapshots; neither holds registry
//! locks while scoring.

mod balancer;
mod selector;

pub use balancer::{
    BalanceStrategy, CircuitBreaker, LoadBalancer, RebalanceMove, RebalancePlan, RouteDecision,
    RouteError, RouteRequest,
};
pub use selector::{
    AgentSelector, ScoreBreakdown, ScoredAgent, SelectionCriteria, SelectionError,
    SelectionResult, SelectionStrategy,
};
