//! Organization-level quota accounting: the org tree, custom policy
//! rules, and the rolling admin audit log.

use std::collections::{BTreeSet, VecDeque};

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::warn;

use flotilla_bus::{EventBus, PublishOptions};

use crate::{check_limits, QuotaDecision, QuotaError, QuotaLimits, QuotaUsage, QUOTA_VIOLATION_EVENT};

/// Audit entries older than this are trimmed.
const AUDIT_RETENTION_DAYS: i64 = 30;

/// Comparison operator of a policy rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PolicyOperator {
    /// Field strictly below the value.
    Lt,
    /// Field at most the value.
    Le,
    /// Field strictly above the value.
    Gt,
    /// Field at least the value.
    Ge,
    /// Field equals the value.
    Eq,
    /// Field differs from the value.
    Ne,
}

impl PolicyOperator {
    fn holds(&self, field: f64, value: f64) -> bool {
        match self {
            Self::Lt => field < value,
            Self::Le => field <= value,
            Self::Gt => field > value,
            Self::Ge => field >= value,
            Self::Eq => (field - value).abs() < f64::EPSILON,
            Self::Ne => (field - value).abs() >= f64::EPSILON,
        }
    }
}

/// What a matching rule does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PolicyAction {
    /// Refuse the allocation.
    Deny,
    /// Allow but record a warning in the audit log.
    Warn,
}

/// One evaluatable condition of a policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyRule {
    /// Usage field the rule reads: `requested_agents`, `concurrent_agents`,
    /// `agents_today`, `agents_this_week`, `agents_this_month`, or
    /// `compute_hours_today`.
    pub field: String,
    /// Comparison applied.
    pub operator: PolicyOperator,
    /// Right-hand side.
    pub value: f64,
    /// Effect when the comparison holds.
    pub action: PolicyAction,
}

/// A named set of rules.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuotaPolicy {
    /// Policy identifier.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Rules, all evaluated.
    pub rules: Vec<PolicyRule>,
}

/// One admin-visible action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    /// When it happened.
    pub timestamp: DateTime<Utc>,
    /// Who did it.
    pub actor: String,
    /// What happened.
    pub action: String,
    /// Structured details.
    pub details: serde_json::Value,
}

/// A quota-managed organization.
#[derive(Debug, Clone)]
pub struct Organization {
    /// Organization identifier.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Parent org, if nested.
    pub parent: Option<String>,
    /// Child org ids.
    pub children: BTreeSet<String>,
    /// Enforced limits.
    pub limits: QuotaLimits,
    /// Windowed usage.
    pub usage: QuotaUsage,
    /// Custom policies.
    pub policies: Vec<QuotaPolicy>,
    /// Rolling audit log, newest last.
    pub audit: VecDeque<AuditEntry>,
}

/// Organization-level allocation authority.
pub struct OrgQuotaManager {
    orgs: DashMap<String, Organization>,
    bus: Option<EventBus>,
}

impl OrgQuotaManager {
    /// Create a manager; violations are emitted on the bus when present.
    pub fn new(bus: Option<EventBus>) -> Self {
        Self {
            orgs: DashMap::new(),
            bus,
        }
    }

    /// Create an organization, linking it under its parent when given.
    pub fn create_org(
        &self,
        org_id: &str,
        name: &str,
        parent: Option<&str>,
        limits: QuotaLimits,
    ) -> Result<(), QuotaError> {
        if let Some(parent_id) = parent {
            let mut parent_org = self
                .orgs
                .get_mut(parent_id)
                .ok_or_else(|| QuotaError::UnknownOrg(parent_id.to_string()))?;
            parent_org.children.insert(org_id.to_string());
        }
        self.orgs.insert(
            org_id.to_string(),
            Organization {
                id: org_id.to_string(),
                name: name.to_string(),
                parent: parent.map(str::to_string),
                children: BTreeSet::new(),
                limits,
                usage: QuotaUsage::default(),
                policies: Vec::new(),
                audit: VecDeque::new(),
            },
        );
        Ok(())
    }

    /// Attach a policy to an organization.
    pub fn add_policy(&self, org_id: &str, policy: QuotaPolicy) -> Result<(), QuotaError> {
        let mut org = self
            .orgs
            .get_mut(org_id)
            .ok_or_else(|| QuotaError::UnknownOrg(org_id.to_string()))?;
        org.policies.retain(|existing| existing.id != policy.id);
        org.policies.push(policy);
        Ok(())
    }

    /// Check whether the org may allocate `agents` more. Unknown orgs are
    /// treated as unmanaged and allowed.
    pub async fn can_allocate(&self, org_id: &str, agents: u32, session_id: &str) -> QuotaDecision {
        enum Finding {
            Limit(&'static str, f64, f64),
            PolicyDeny(String),
            Warnings(Vec<(String, f64)>),
        }

        let finding = {
            let Some(mut org) = self.orgs.get_mut(org_id) else {
                return QuotaDecision::allow();
            };
            org.usage.roll(Utc::now());

            if let Some((dimension, limit, attempted)) =
                check_limits(&org.limits, &org.usage, agents)
            {
                Finding::Limit(dimension, limit, attempted)
            } else {
                let usage = org.usage;
                let mut deny: Option<String> = None;
                let mut warnings = Vec::new();
                'outer: for policy in &org.policies {
                    for rule in &policy.rules {
                        let field = policy_field(&usage, agents, &rule.field);
                        if rule.operator.holds(field, rule.value) {
                            match rule.action {
                                PolicyAction::Deny => {
                                    deny = Some(format!(
                                        "policy `{}` denies: {} {:?} {}",
                                        policy.name, rule.field, rule.operator, rule.value
                                    ));
                                    break 'outer;
                                }
                                PolicyAction::Warn => {
                                    warnings.push((policy.name.clone(), field));
                                }
                            }
                        }
                    }
                }
                match deny {
                    Some(reason) => Finding::PolicyDeny(reason),
                    None => Finding::Warnings(warnings),
                }
            }
        };

        match finding {
            Finding::Limit(dimension, limit, attempted) => {
                self.emit_violation(org_id, dimension, limit, attempted, session_id)
                    .await;
                QuotaDecision::deny(format!(
                    "org `{org_id}` exceeds {dimension}: {attempted} > {limit}"
                ))
            }
            Finding::PolicyDeny(reason) => {
                self.emit_violation(org_id, "policy", 0.0, f64::from(agents), session_id)
                    .await;
                self.record_audit(org_id, "quota-manager", "policy-denial", json!({ "reason": reason }));
                QuotaDecision::deny(reason)
            }
            Finding::Warnings(warnings) => {
                for (policy, field) in warnings {
                    warn!(org_id, policy, field, "org quota policy warning");
                    self.record_audit(
                        org_id,
                        "quota-manager",
                        "policy-warning",
                        json!({ "policy": policy, "field": field }),
                    );
                }
                QuotaDecision::allow()
            }
        }
    }

    /// Commit an allocation.
    pub fn allocate(&self, org_id: &str, agents: u32) {
        if let Some(mut org) = self.orgs.get_mut(org_id) {
            org.usage.allocate(agents, Utc::now());
        }
    }

    /// Release running agents.
    pub fn release(&self, org_id: &str, agents: u32) {
        if let Some(mut org) = self.orgs.get_mut(org_id) {
            org.usage.release(agents);
        }
    }

    /// Snapshot of an organization.
    pub fn get_org(&self, org_id: &str) -> Option<Organization> {
        self.orgs.get(org_id).map(|org| org.clone())
    }

    /// Append an audit entry, trimming anything older than the retention
    /// window.
    pub fn record_audit(
        &self,
        org_id: &str,
        actor: &str,
        action: &str,
        details: serde_json::Value,
    ) {
        let Some(mut org) = self.orgs.get_mut(org_id) else {
            return;
        };
        org.audit.push_back(AuditEntry {
            timestamp: Utc::now(),
            actor: actor.to_string(),
            action: action.to_string(),
            details,
        });
        let cutoff = Utc::now() - Duration::days(AUDIT_RETENTION_DAYS);
        while org
            .audit
            .front()
            .map_or(false, |entry| entry.timestamp < cutoff)
        {
            org.audit.pop_front();
        }
    }

    /// The audit log, oldest first, already trimmed to the retention
    /// window.
    pub fn audit_log(&self, org_id: &str) -> Vec<AuditEntry> {
        let cutoff = Utc::now() - Duration::days(AUDIT_RETENTION_DAYS);
        self.orgs
            .get(org_id)
            .map(|org| {
                org.audit
                    .iter()
                    .filter(|entry| entry.timestamp >= cutoff)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    async fn emit_violation(
        &self,
        org_id: &str,
        dimension: &str,
        limit: f64,
        attempted: f64,
        session_id: &str,
    ) {
        warn!(org_id, dimension, limit, attempted, "org quota violation");
        let Some(bus) = &self.bus else { return };
        if let Err(error) = bus
            .publish(
                QUOTA_VIOLATION_EVENT,
                json!({
                    "principal_id": org_id,
                    "level": "org",
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

fn policy_field(usage: &QuotaUsage, requested_agents: u32, field: &str) -> f64 {
    match field {
        "requested_agents" => f64::from(requested_agents),
        "concurrent_agents" => f64::from(usage.concurrent_agents),
        "agents_today" => f64::from(usage.agents_today),
        "agents_this_week" => f64::from(usage.agents_this_week),
        "agents_this_month" => f64::from(usage.agents_this_month),
        "compute_hours_today" => usage.compute_hours_today,
        _ => f64::NAN,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn org_tree_links_children() {
        let manager = OrgQuotaManager::new(None);
        manager
            .create_org("root", "root org", None, QuotaLimits::default())
            .unwrap();
        manager
            .create_org("child", "child org", Some("root"), QuotaLimits::default())
            .unwrap();
        assert!(manager.create_org("x", "x", Some("ghost"), QuotaLimits::default()).is_err());

        let root = manager.get_org("root").unwrap();
        assert!(root.children.contains("child"));
        assert_eq!(manager.get_org("child").unwrap().parent.as_deref(), Some("root"));
    }

    #[tokio::test]
    async fn deny_policy_blocks_allocation() {
        let manager = OrgQuotaManager::new(None);
        manager
            .create_org("o1", "org", None, QuotaLimits::default())
            .unwrap();
        manager
            .add_policy(
                "o1",
                QuotaPolicy {
                    id: "p1".into(),
                    name: "burst cap".into(),
                    rules: vec![PolicyRule {
                        field: "requested_agents".into(),
                        operator: PolicyOperator::Gt,
                        value: 5.0,
                        action: PolicyAction::Deny,
                    }],
                },
            )
            .unwrap();

        assert!(manager.can_allocate("o1", 5, "s").await.allowed);
        let denied = manager.can_allocate("o1", 6, "s").await;
        assert!(!denied.allowed);
        assert!(denied.reason.unwrap().contains("burst cap"));
        // The denial is in the audit log.
        assert!(manager
            .audit_log("o1")
            .iter()
            .any(|entry| entry.action == "policy-denial"));
    }

    #[tokio::test]
    async fn warn_policy_allows_but_audits() {
        let manager = OrgQuotaManager::new(None);
        manager
            .create_org("o1", "org", None, QuotaLimits::default())
            .unwrap();
        manager
            .add_policy(
                "o1",
                QuotaPolicy {
                    id: "p1".into(),
                    name: "heads-up".into(),
                    rules: vec![PolicyRule {
                        field: "requested_agents".into(),
                        operator: PolicyOperator::Ge,
                        value: 3.0,
                        action: PolicyAction::Warn,
                    }],
                },
            )
            .unwrap();

        assert!(manager.can_allocate("o1", 4, "s").await.allowed);
        let log = manager.audit_log("o1");
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].action, "policy-warning");
    }

    #[tokio::test]
    async fn limits_apply_before_policies() {
        let manager = OrgQuotaManager::new(None);
        manager
            .create_org(
                "o1",
                "org",
                None,
                QuotaLimits {
                    max_concurrent_agents: Some(2),
                    ..QuotaLimits::default()
                },
            )
            .unwrap();
        manager.allocate("o1", 2);
        assert!(!manager.can_allocate("o1", 1, "s").await.allowed);
        manager.release("o1", 2);
        assert!(manager.can_allocate("o1", 1, "s").await.allowed);
    }

    #[test]
    fn audit_log_trims_by_age() {
        let manager = OrgQuotaManager::new(None);
        manager
            .create_org("o1", "org", None, QuotaLimits::default())
            .unwrap();
        // Inject an old entry directly, then record a fresh one.
        {
            let mut org = manager.orgs.get_mut("o1").unwrap();
            org.audit.push_back(AuditEntry {
                timestamp: Utc::now() - Duration::days(45),
                actor: "old".into(),
                action: "ancient".into(),
                details: serde_json::Value::Null,
            });
        }
        manager.record_audit("o1", "alice", "fresh", serde_json::Value::Null);
        let log = manager.audit_log("o1");
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].action, "fresh");
    }
}
