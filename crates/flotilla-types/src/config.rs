//! Runtime configuration knobs, grouped by subsystem.
//!
//! Every knob carries the documented default; tests and integrators override
//! individual fields and leave the rest at `Default::default()`.

use serde::{Deserialize, Serialize};

/// Backoff shape applied between retry attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RetryBackoff {
    /// Constant delay between attempts.
    Fixed,
    /// Delay grows linearly with the attempt number.
    Linear,
    /// Delay doubles with each attempt.
    Exponential,
}

impl Default for RetryBackoff {
    fn default() -> Self {
        Self::Fixed
    }
}

/// Event bus knobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusConfig {
    /// Capacity of the in-memory history ring; drop-oldest on overflow.
    pub max_history_size: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            max_history_size: 1000,
        }
    }
}

/// Event store knobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Flush once this many events are buffered.
    pub batch_size: usize,
    /// Flush at least this often regardless of buffer size.
    pub flush_interval_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            flush_interval_ms: 5000,
        }
    }
}

/// State persistence knobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistConfig {
    /// Debounce window for coalescing state saves.
    pub save_debounce_ms: u64,
}

impl Default for PersistConfig {
    fn default() -> Self {
        Self {
            save_debounce_ms: 100,
        }
    }
}

/// Execution engine knobs.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Per-level parallelism bound.
    pub max_concurrency: usize,
    /// Total attempts per task, including the first.
    pub retry_attempts: u32,
    /// Base delay between attempts.
    pub retry_delay_ms: u64,
    /// Backoff shape applied to the base delay.
    pub retry_backoff: RetryBackoff,
    /// Whether remaining levels still run after a terminal task failure.
    pub continue_on_failure: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 10,
            retry_attempts: 1,
            retry_delay_ms: 0,
            retry_backoff: RetryBackoff::Fixed,
            continue_on_failure: false,
        }
    }
}

/// Workflow engine knobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowEngineConfig {
    /// Concurrently running nodes per engine.
    pub max_concurrent_nodes: usize,
    /// Upper bound for a task node without an explicit timeout.
    pub default_task_timeout_ms: u64,
    /// Upper bound for awaiting a sub-workflow without an explicit timeout.
    pub sub_workflow_timeout_ms: u64,
    /// Maximum sub-workflow nesting depth.
    pub max_nesting_depth: u32,
}

impl Default for WorkflowEngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_nodes: 10,
            default_task_timeout_ms: 300_000,
            sub_workflow_timeout_ms: 600_000,
            max_nesting_depth: 8,
        }
    }
}

/// Load balancer knobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadBalancerConfig {
    /// Consecutive failures that open a cluster's circuit breaker.
    pub circuit_breaker_threshold: u32,
    /// Alternatives reported per successful route.
    pub max_alternatives: usize,
}

impl Default for LoadBalancerConfig {
    fn default() -> Self {
        Self {
            circuit_breaker_threshold: 3,
            max_alternatives: 3,
        }
    }
}

/// Weights of the selector's `balanced` strategy.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SelectorWeights {
    /// Weight of the combined skill score.
    pub skill: f64,
    /// Weight of the cost score.
    pub cost: f64,
    /// Weight of declared reliability.
    pub reliability: f64,
    /// Weight of the inverse-load score.
    pub load: f64,
}

impl Default for SelectorWeights {
    fn default() -> Self {
        Self {
            skill: 0.4,
            cost: 0.2,
            reliability: 0.2,
            load: 0.2,
        }
    }
}

/// State machine knobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateConfig {
    /// Error count below which `error -> initializing` recovery is allowed.
    pub error_retry_limit: u32,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            error_retry_limit: 3,
        }
    }
}

/// The full runtime configuration, one section per subsystem.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct RuntimeConfig {
    /// Event bus section.
    #[serde(default)]
    pub bus: BusConfig,
    /// Event store section.
    #[serde(default)]
    pub store: StoreConfig,
    /// State persistence section.
    #[serde(default)]
    pub persist: PersistConfig,
    /// Execution engine section.
    #[serde(default)]
    pub exec: EngineConfig,
    /// Workflow engine section.
    #[serde(default)]
    pub workflow: WorkflowEngineConfig,
    /// Load balancer section.
    #[serde(default)]
    pub lb: LoadBalancerConfig,
    /// Selector weights for the balanced strategy.
    #[serde(default)]
    pub selector: SelectorWeights,
    /// State machine section.
    #[serde(default)]
    pub state: StateConfig,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn documented_defaults() {
        let config = RuntimeConfig::default();
        assert_eq!(config.bus.max_history_size, 1000);
        assert_eq!(config.store.batch_size, 100);
        assert_eq!(config.store.flush_interval_ms, 5000);
        assert_eq!(config.persist.save_debounce_ms, 100);
        assert_eq!(config.exec.max_concurrency, 10);
        assert_eq!(config.exec.retry_attempts, 1);
        assert_eq!(config.exec.retry_delay_ms, 0);
        assert!(!config.exec.continue_on_failure);
        assert_eq!(config.workflow.max_concurrent_nodes, 10);
        assert_eq!(config.lb.circuit_breaker_threshold, 3);
        assert_eq!(config.lb.max_alternatives, 3);
        assert_eq!(config.selector.skill, 0.4);
        assert_eq!(config.state.error_retry_limit, 3);
    }
}
