//! Per-user quota accounting.

use chrono::Utc;
use dashmap::DashMap;
use serde_json::json;
use tracing::warn;

use flotilla_bus::{EventBus, PublishOptions};

use crate::{check_limits, QuotaDecision, QuotaLimits, QuotaUsage, QUOTA_VIOLATION_EVENT};

#[derive(Debug, Default, Clone)]
struct UserQuota {
    limits: QuotaLimits,
    usage: QuotaUsage,
}

/// User-level allocation authority. Users without configured limits are
/// unlimited.
pub struct UserQuotaManager {
    users: DashMap<String, UserQuota>,
    bus: Option<EventBus>,
}

impl UserQuotaManager {
    /// Create a manager; violations are emitted on the bus when present.
    pub fn new(bus: Option<EventBus>) -> Self {
        Self {
            users: DashMap::new(),
            bus,
        }
    }

    /// Configure a user's limits.
    pub fn set_limits(&self, user_id: &str, limits: QuotaLimits) {
        self.users.entry(user_id.to_string()).or_default().limits = limits;
    }

    /// Check whether the user may allocate `agents` more.
    pub async fn can_allocate(&self, user_id: &str, agents: u32, session_id: &str) -> QuotaDecision {
        let violation = {
            let mut entry = self.users.entry(user_id.to_string()).or_default();
            entry.usage.roll(Utc::now());
            check_limits(&entry.limits, &entry.usage, agents)
        };
        match violation {
            None => QuotaDecision::allow(),
            Some((dimension, limit, attempted)) => {
                self.emit_violation(user_id, dimension, limit, attempted, session_id)
                    .await;
                QuotaDecision::deny(format!(
                    "user `{user_id}` exceeds {dimension}: {attempted} > {limit}"
                ))
            }
        }
    }

    /// Commit an allocation.
    pub fn allocate(&self, user_id: &str, agents: u32) {
        self.users
            .entry(user_id.to_string())
            .or_default()
            .usage
            .allocate(agents, Utc::now());
    }

    /// Release running agents.
    pub fn release(&self, user_id: &str, agents: u32) {
        if let Some(mut entry) = self.users.get_mut(user_id) {
            entry.usage.release(agents);
        }
    }

    /// Record compute-hours consumed today.
    pub fn record_compute_hours(&self, user_id: &str, hours: f64) {
        let mut entry = self.users.entry(user_id.to_string()).or_default();
        entry.usage.roll(Utc::now());
        entry.usage.compute_hours_today += hours;
    }

    /// Overwrite the user's storage footprint.
    pub fn record_storage(&self, user_id: &str, bytes: u64) {
        self.users
            .entry(user_id.to_string())
            .or_default()
            .usage
            .storage_bytes = bytes;
    }

    /// Usage snapshot (windows rolled to now).
    pub fn usage(&self, user_id: &str) -> Option<QuotaUsage> {
        let mut entry = self.users.get_mut(user_id)?;
        entry.usage.roll(Utc::now());
        Some(entry.usage)
    }

    /// Configured limits, if any.
    pub fn limits(&self, user_id: &str) -> Option<QuotaLimits> {
        self.users.get(user_id).map(|entry| entry.limits)
    }

    async fn emit_violation(
        &self,
        user_id: &str,
        dimension: &str,
        limit: f64,
        attempted: f64,
        session_id: &str,
    ) {
        warn!(user_id, dimension, limit, attempted, "user quota violation");
        let Some(bus) = &self.bus else { return };
        if let Err(error) = bus
            .publish(
                QUOTA_VIOLATION_EVENT,
                json!({
                    "principal_id": user_id,
                    "level": "user",
                    "violation_type": dimension,
                    "limit": limit,
                    "attempted": attempted,
                    "sessionId": session_id,
                }),
                PublishOptions::from_source("quota-manager"),
            )
            .await
        {
            warn!(%error, "failed to publish quota violation");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flotilla_bus::HistoryQuery;
    use flotilla_types::BusConfig;

    #[tokio::test]
    async fn unlimited_by_default() {
        let manager = UserQuotaManager::new(None);
        assert!(manager.can_allocate("u1", 1_000, "s").await.allowed);
    }

    #[tokio::test]
    async fn daily_window_denies_and_reports() {
        let bus = EventBus::new(BusConfig {
            max_history_size: 32,
        });
        let manager = UserQuotaManager::new(Some(bus.clone()));
        manager.set_limits(
            "u1",
            QuotaLimits {
                agents_per_day: Some(2),
                ..QuotaLimits::default()
            },
        );

        assert!(manager.can_allocate("u1", 2, "s").await.allowed);
        manager.allocate("u1", 2);
        let denied = manager.can_allocate("u1", 1, "s").await;
        assert!(!denied.allowed);

        let violations = bus.query_history(&HistoryQuery {
            event_type: Some(QUOTA_VIOLATION_EVENT.into()),
            ..HistoryQuery::default()
        });
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].payload["violation_type"], "agents_per_day");
        assert_eq!(violations[0].payload["level"], "user");
    }

    #[tokio::test]
    async fn concurrency_releases() {
        let manager = UserQuotaManager::new(None);
        manager.set_limits(
            "u1",
            QuotaLimits {
                max_concurrent_agents: Some(2),
                ..QuotaLimits::default()
            },
        );
        manager.allocate("u1", 2);
        assert!(!manager.can_allocate("u1", 1, "s").await.allowed);
        manager.release("u1", 1);
        assert!(manager.can_allocate("u1", 1, "s").await.allowed);
        assert_eq!(manager.usage("u1").unwrap().concurrent_agents, 1);
    }

    #[tokio::test]
    async fn compute_hours_gate() {
        let manager = UserQuotaManager::new(None);
        manager.set_limits(
            "u1",
            QuotaLimits {
                compute_hours_per_day: Some(10.0),
                ..QuotaLimits::default()
            },
        );
        manager.record_compute_hours("u1", 11.0);
        assert!(!manager.can_allocate("u1", 1, "s").await.allowed);
    }
}
