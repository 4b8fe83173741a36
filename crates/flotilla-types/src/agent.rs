//! Agent descriptors: the capabilities and status the registry exposes, the
//! finer-grained lifecycle states the state machine drives, and the
//! persisted state snapshot format.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::time::Duration;

use crate::{check_id, check_unit_interval, ValidationError};

//─────────────────────────────
//  Runtime kind & capabilities
//─────────────────────────────

/// Where an agent's worker process runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeKind {
    /// Same host as the orchestrator.
    Local,
    /// Isolated container runtime.
    Container,
    /// Remote cluster endpoint.
    Remote,
}

/// Capabilities an agent declares at registration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentCapabilities {
    /// Skills the agent can apply, matched against task requirements.
    #[serde(default)]
    pub skills: Vec<String>,
    /// Narrower domains of expertise.
    #[serde(default)]
    pub specialties: Vec<String>,
    /// Programming languages the agent works in.
    #[serde(default)]
    pub languages: Vec<String>,
    /// Cost of keeping the agent busy, USD per hour.
    pub cost_per_hour: f64,
    /// Historical reliability in `[0, 1]`.
    pub reliability: f64,
    /// Average throughput in tasks per hour.
    pub avg_speed: f64,
}

impl AgentCapabilities {
    /// Validate declared ranges.
    pub fn validate(&self) -> Result<(), ValidationError> {
        check_unit_interval("reliability", self.reliability)?;
        if self.cost_per_hour < 0.0 {
            return Err(ValidationError::OutOfRange {
                field: "cost_per_hour",
                value: self.cost_per_hour,
            });
        }
        if self.avg_speed < 0.0 {
            return Err(ValidationError::OutOfRange {
                field: "avg_speed",
                value: self.avg_speed,
            });
        }
        Ok(())
    }

    /// Whether the agent declares every skill in `required`.
    pub fn has_all_skills<'a, I: IntoIterator<Item = &'a String>>(&self, required: I) -> bool {
        required
            .into_iter()
            .all(|skill| self.skills.iter().any(|s| s == skill))
    }
}

//─────────────────────────────
//  Registration
//─────────────────────────────

/// Configuration supplied when registering an agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Stable id; a fresh UUID is assigned when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Where the worker runs.
    pub runtime: RuntimeKind,
    /// Declared capabilities.
    pub capabilities: AgentCapabilities,
}

/// What the registry exposes: the coarse availability of an agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    /// Registered and accepting work.
    Idle,
    /// Executing a task.
    Busy,
    /// Paused, stopping, or stopped.
    Offline,
    /// In an error state; excluded from healthy-set queries.
    Unhealthy,
}

/// A registered agent as the registry sees it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisteredAgent {
    /// Stable agent identifier.
    pub id: String,
    /// Where the worker runs.
    pub runtime: RuntimeKind,
    /// Declared capabilities.
    pub capabilities: AgentCapabilities,
    /// Coarse availability.
    pub status: AgentStatus,
    /// Current load in `[0, 1]`; written only by the owning registry.
    pub current_load: f64,
    /// Registration time.
    pub registered_at: DateTime<Utc>,
    /// Last heartbeat observed.
    pub last_heartbeat: DateTime<Utc>,
}

impl RegisteredAgent {
    /// Build a registered agent from its registration config.
    pub fn from_config(id: String, config: &AgentConfig) -> Result<Self, ValidationError> {
        check_id("agent id", &id)?;
        config.capabilities.validate()?;
        let now = Utc::now();
        Ok(Self {
            id,
            runtime: config.runtime,
            capabilities: config.capabilities.clone(),
            status: AgentStatus::Idle,
            current_load: 0.0,
            registered_at: now,
            last_heartbeat: now,
        })
    }

    /// Whether the agent counts into healthy-set queries.
    pub fn is_healthy(&self) -> bool {
        matches!(self.status, AgentStatus::Idle | AgentStatus::Busy)
    }
}

//─────────────────────────────
//  Lifecycle states
//─────────────────────────────

/// Internal lifecycle state of an agent, driven by its state machine.
///
/// [`AgentState::Stopped`] is terminal: no transition ever leaves it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentState {
    /// Machine exists; nothing started yet.
    Created,
    /// Bootstrapping the worker.
    Initializing,
    /// Ready for work.
    Idle,
    /// Executing a task.
    Busy,
    /// Suspended; may resume.
    Paused,
    /// A task or initialization failed.
    Error,
    /// Graceful shutdown in progress.
    Stopping,
    /// Terminal; the machine is discarded afterwards.
    Stopped,
}

impl AgentState {
    /// Whether this state permits no outgoing transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(self, AgentState::Stopped)
    }

    /// Stable lowercase name, used in `state:<name>` event types.
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentState::Created => "created",
            AgentState::Initializing => "initializing",
            AgentState::Idle => "idle",
            AgentState::Busy => "busy",
            AgentState::Paused => "paused",
            AgentState::Error => "error",
            AgentState::Stopping => "stopping",
            AgentState::Stopped => "stopped",
        }
    }

    /// All states, for per-state aggregation.
    pub fn all() -> [AgentState; 8] {
        [
            AgentState::Created,
            AgentState::Initializing,
            AgentState::Idle,
            AgentState::Busy,
            AgentState::Paused,
            AgentState::Error,
            AgentState::Stopping,
            AgentState::Stopped,
        ]
    }
}

impl fmt::Display for AgentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

//─────────────────────────────
//  State history & persistence
//─────────────────────────────

/// One committed transition in an agent's append-only state log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateEntry {
    /// State the agent left.
    pub from: AgentState,
    /// State the agent entered.
    pub to: AgentState,
    /// Commit time; strictly non-decreasing within one log.
    pub timestamp: DateTime<Utc>,
    /// Time spent in the prior state.
    pub duration: Duration,
    /// Caller-supplied reason, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Structured extras attached by actions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

/// Condensed context captured alongside persisted state.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct ContextSnapshot {
    /// Load at save time.
    pub load: f64,
    /// Whether unresolved errors exist.
    pub has_errors: bool,
    /// Error count since the last recovery.
    pub error_count: u32,
}

/// The durable snapshot written by the persistent state machine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SavedState {
    /// State at save time.
    pub state: AgentState,
    /// Full transition history.
    pub history: Vec<StateEntry>,
    /// When the snapshot was taken.
    pub last_updated: DateTime<Utc>,
    /// Condensed context.
    pub context: ContextSnapshot,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stopped_is_the_only_terminal_state() {
        for state in AgentState::all() {
            assert_eq!(state.is_terminal(), state == AgentState::Stopped);
        }
    }

    #[test]
    fn capabilities_validation() {
        let caps = AgentCapabilities {
            skills: vec!["rust".into()],
            specialties: vec![],
            languages: vec![],
            cost_per_hour: 5.0,
            reliability: 1.5,
            avg_speed: 10.0,
        };
        assert!(caps.validate().is_err());
    }

    #[test]
    fn skill_containment() {
        let caps = AgentCapabilities {
            skills: vec!["rust".into(), "sql".into()],
            specialties: vec![],
            languages: vec![],
            cost_per_hour: 1.0,
            reliability: 0.9,
            avg_speed: 4.0,
        };
        let required = vec!["rust".to_string()];
        assert!(caps.has_all_skills(required.iter()));
        let missing = vec!["go".to_string()];
        assert!(!caps.has_all_skills(missing.iter()));
    }
}
