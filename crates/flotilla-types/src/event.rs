//! Immutable event records and the typed payload overlays for the core
//! emitted event families.
//!
//! An [`Event`] is a monomorphic envelope with an opaque JSON payload.
//! Consumers match on [`Event::event_type`] and deserialize the payload into
//! the matching overlay from [`payloads`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::{ValidationError, MAX_EVENT_TYPE_LEN};

//─────────────────────────────
//  Priority
//─────────────────────────────

/// Delivery priority attached to every event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventPriority {
    /// Background chatter.
    Low,
    /// Default priority.
    Normal,
    /// Time-sensitive notifications.
    High,
    /// Must never be dropped by consumers.
    Critical,
}

impl Default for EventPriority {
    fn default() -> Self {
        Self::Normal
    }
}

//─────────────────────────────
//  Metadata
//─────────────────────────────

/// Metadata carried by every event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventMetadata {
    /// Chains related events; assigned at publish if not inherited.
    pub correlation_id: Uuid,
    /// The event that directly caused this one, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub causation_id: Option<Uuid>,
    /// Schema version of the payload, starting at 1.
    pub version: u32,
    /// Delivery priority.
    #[serde(default)]
    pub priority: EventPriority,
    /// Time-to-live in milliseconds; expired events are dropped by readers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl_ms: Option<u64>,
}

impl Default for EventMetadata {
    fn default() -> Self {
        Self {
            correlation_id: Uuid::new_v4(),
            causation_id: None,
            version: 1,
            priority: EventPriority::Normal,
            ttl_ms: None,
        }
    }
}

//─────────────────────────────
//  Event record
//─────────────────────────────

/// An immutable fact observed by the system.
///
/// Events are append-only: once constructed they are never mutated. The bus
/// and the store each keep independent copies; subscribers hold read-only
/// clones.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Unique event identifier.
    pub id: Uuid,
    /// Dotted type string, e.g. `agent.busy` or `workflow:started`.
    #[serde(rename = "type")]
    pub event_type: String,
    /// Agent or component that produced the event.
    pub source: String,
    /// Optional addressee.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    /// Publish timestamp; non-decreasing per bus.
    pub timestamp: DateTime<Utc>,
    /// Opaque payload; see [`payloads`] for the typed overlays.
    pub payload: Value,
    /// Correlation, causation, and delivery metadata.
    pub metadata: EventMetadata,
}

impl Event {
    /// Construct an event with a fresh id and the current timestamp.
    ///
    /// The type string is validated; callers that need correlation inheritance
    /// or priorities mutate the metadata before handing the event to the bus.
    pub fn new(
        event_type: impl Into<String>,
        source: impl Into<String>,
        payload: Value,
    ) -> Result<Self, ValidationError> {
        let event_type = event_type.into();
        if event_type.trim().is_empty() {
            return Err(ValidationError::Empty {
                field: "event type",
            });
        }
        if event_type.len() > MAX_EVENT_TYPE_LEN {
            return Err(ValidationError::TooLong {
                field: "event type",
                actual: event_type.len(),
                max: MAX_EVENT_TYPE_LEN,
            });
        }
        Ok(Self {
            id: Uuid::new_v4(),
            event_type,
            source: source.into(),
            target: None,
            timestamp: Utc::now(),
            payload,
            metadata: EventMetadata::default(),
        })
    }

    /// Whether this event's TTL has elapsed at `now`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        match self.metadata.ttl_ms {
            Some(ttl) => {
                let age = now.signed_duration_since(self.timestamp);
                age.num_milliseconds() >= 0 && age.num_milliseconds() as u64 >= ttl
            }
            None => false,
        }
    }
}

//─────────────────────────────
//  Typed payload overlays
//─────────────────────────────

/// Typed payload shapes for the core emitted event families.
///
/// These are conveniences, not a closed set: integrators are free to publish
/// events with arbitrary payloads. Core components serialize these shapes so
/// downstream consumers can deserialize them without guessing field names.
pub mod payloads {
    use super::*;

    /// Payload of `workflow:*` lifecycle events.
    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct WorkflowLifecycle {
        /// Workflow instance identifier.
        pub instance_id: String,
        /// Definition the instance was started from.
        pub workflow_id: String,
        /// Structured extra data, event-family specific.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub data: Option<Value>,
    }

    /// Payload of `node:*` lifecycle events.
    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct NodeLifecycle {
        /// Workflow instance identifier.
        pub instance_id: String,
        /// Definition the instance was started from.
        pub workflow_id: String,
        /// Node within the workflow definition.
        pub node_id: String,
        /// Structured extra data, event-family specific.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub data: Option<Value>,
    }

    /// Payload of `agent.idle`, `agent.busy`, and `agent.error` events.
    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct AgentLifecycle {
        /// Agent identifier.
        pub agent_id: String,
        /// State the agent left, if known.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub previous_state: Option<String>,
    }

    /// Payload of `task:*` events emitted by the execution engine.
    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct TaskLifecycle {
        /// Task identifier.
        pub task_id: String,
        /// Agent the task ran on, if one was assigned.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub agent_id: Option<String>,
        /// 1-based attempt counter.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub attempt: Option<u32>,
        /// Failure description, on `task:failed` and `task:retry`.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub error: Option<String>,
    }

    /// Payload of `quota:violation` events.
    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct QuotaViolation {
        /// Principal whose quota was violated (user, team, or org id).
        pub principal_id: String,
        /// Which level denied the request: `user`, `team`, or `org`.
        pub level: String,
        /// Violated dimension, e.g. `agents_per_day`.
        pub violation_type: String,
        /// Configured limit for the dimension.
        pub limit: f64,
        /// Attempted value that tripped the limit.
        pub attempted: f64,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_type_is_validated() {
        assert!(Event::new("", "tests", Value::Null).is_err());
        let long = "x".repeat(MAX_EVENT_TYPE_LEN + 1);
        assert!(Event::new(long, "tests", Value::Null).is_err());
        assert!(Event::new("agent.busy", "tests", Value::Null).is_ok());
    }

    #[test]
    fn ttl_expiry() {
        let mut event = Event::new("tick", "tests", Value::Null).unwrap();
        event.metadata.ttl_ms = Some(1_000);
        assert!(!event.is_expired(event.timestamp));
        assert!(event.is_expired(event.timestamp + chrono::Duration::seconds(2)));
    }

    #[test]
    fn serde_round_trip_renames_type() {
        let event = Event::new("agent.idle", "registry", serde_json::json!({"agentId": "a1"}))
            .unwrap();
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "agent.idle");
        let back: Event = serde_json::from_value(json).unwrap();
        assert_eq!(back, event);
    }
}
