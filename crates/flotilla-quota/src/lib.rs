#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **flotilla-quota** – Admission control for Flotilla.
//!
//! Three levels of allocation authority, consulted user → team → org and
//! short-circuiting on the first denial. Each level enforces windowed agent
//! counts (day/week/month), daily compute-hours, concurrent agents, and
//! storage; denials emit structured `quota:violation` events. Teams add
//! member roles, project allocations, and quota transfers; organizations
//! add a child-org tree, custom policy rules, and a 30-day audit log.

use chrono::{DateTime, Datelike, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

mod org;
mod team;
mod user;

pub use org::{AuditEntry, OrgQuotaManager, Organization, PolicyAction, PolicyOperator, PolicyRule, QuotaPolicy};
pub use team::{ProjectAllocation, QuotaTransfer, Team, TeamQuotaManager, TeamRole, TransferStatus};
pub use user::UserQuotaManager;

/// Event type emitted when an allocation is denied.
pub const QUOTA_VIOLATION_EVENT: &str = "quota:violation";

//─────────────────────────────
//  Shared types
//─────────────────────────────

/// Enforceable limits; `None` means unlimited on that dimension.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct QuotaLimits {
    /// Agents allocatable per calendar day.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agents_per_day: Option<u32>,
    /// Agents allocatable per ISO week.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agents_per_week: Option<u32>,
    /// Agents allocatable per calendar month.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agents_per_month: Option<u32>,
    /// Compute-hours consumable per calendar day.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compute_hours_per_day: Option<f64>,
    /// Agents that may run at once.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_concurrent_agents: Option<u32>,
    /// Storage ceiling in bytes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_storage_bytes: Option<u64>,
}

/// Windowed usage counters. Windows roll automatically on read.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QuotaUsage {
    /// Day the daily counters belong to (days since epoch).
    day_stamp: i32,
    /// ISO week stamp (year * 100 + week).
    week_stamp: i32,
    /// Month stamp (year * 100 + month).
    month_stamp: i32,
    /// Agents allocated today.
    pub agents_today: u32,
    /// Agents allocated this week.
    pub agents_this_week: u32,
    /// Agents allocated this month.
    pub agents_this_month: u32,
    /// Compute-hours consumed today.
    pub compute_hours_today: f64,
    /// Agents currently running.
    pub concurrent_agents: u32,
    /// Storage in use, bytes.
    pub storage_bytes: u64,
}

impl Default for QuotaUsage {
    fn default() -> Self {
        Self::at(Utc::now())
    }
}

impl QuotaUsage {
    fn at(now: DateTime<Utc>) -> Self {
        Self {
            day_stamp: day_stamp(now),
            week_stamp: week_stamp(now),
            month_stamp: month_stamp(now),
            agents_today: 0,
            agents_this_week: 0,
            agents_this_month: 0,
            compute_hours_today: 0.0,
            concurrent_agents: 0,
            storage_bytes: 0,
        }
    }

    /// Reset any counter whose window has rolled over.
    pub fn roll(&mut self, now: DateTime<Utc>) {
        if day_stamp(now) != self.day_stamp {
            self.day_stamp = day_stamp(now);
            self.agents_today = 0;
            self.compute_hours_today = 0.0;
        }
        if week_stamp(now) != self.week_stamp {
            self.week_stamp = week_stamp(now);
            self.agents_this_week = 0;
        }
        if month_stamp(now) != self.month_stamp {
            self.month_stamp = month_stamp(now);
            self.agents_this_month = 0;
        }
    }

    /// Record an allocation of `agents`.
    pub fn allocate(&mut self, agents: u32, now: DateTime<Utc>) {
        self.roll(now);
        self.agents_today += agents;
        self.agents_this_week += agents;
        self.agents_this_month += agents;
        self.concurrent_agents += agents;
    }

    /// Record a release of `agents`.
    pub fn release(&mut self, agents: u32) {
        self.concurrent_agents = self.concurrent_agents.saturating_sub(agents);
    }
}

fn day_stamp(now: DateTime<Utc>) -> i32 {
    now.num_days_from_ce()
}

fn week_stamp(now: DateTime<Utc>) -> i32 {
    let week = now.iso_week();
    week.year() * 100 + week.week() as i32
}

fn month_stamp(now: DateTime<Utc>) -> i32 {
    now.year() * 100 + now.month() as i32
}

/// Outcome of an admission check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaDecision {
    /// Whether the allocation may proceed.
    pub allowed: bool,
    /// Human-readable denial reason.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl QuotaDecision {
    /// An approval.
    pub fn allow() -> Self {
        Self {
            allowed: true,
            reason: None,
        }
    }

    /// A denial with a reason.
    pub fn deny(reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            reason: Some(reason.into()),
        }
    }
}

/// Check windowed limits against usage for a requested allocation.
/// Returns the violated dimension, its limit, and the attempted value.
pub(crate) fn check_limits(
    limits: &QuotaLimits,
    usage: &QuotaUsage,
    agents: u32,
) -> Option<(&'static str, f64, f64)> {
    if let Some(limit) = limits.agents_per_day {
        let attempted = usage.agents_today + agents;
        if attempted > limit {
            return Some(("agents_per_day", f64::from(limit), f64::from(attempted)));
        }
    }
    if let Some(limit) = limits.agents_per_week {
        let attempted = usage.agents_this_week + agents;
        if attempted > limit {
            return Some(("agents_per_week", f64::from(limit), f64::from(attempted)));
        }
    }
    if let Some(limit) = limits.agents_per_month {
        let attempted = usage.agents_this_month + agents;
        if attempted > limit {
            return Some(("agents_per_month", f64::from(limit), f64::from(attempted)));
        }
    }
    if let Some(limit) = limits.compute_hours_per_day {
        if usage.compute_hours_today > limit {
            return Some(("compute_hours_per_day", limit, usage.compute_hours_today));
        }
    }
    if let Some(limit) = limits.max_concurrent_agents {
        let attempted = usage.concurrent_agents + agents;
        if attempted > limit {
            return Some((
                "max_concurrent_agents",
                f64::from(limit),
                f64::from(attempted),
            ));
        }
    }
    if let Some(limit) = limits.max_storage_bytes {
        if usage.storage_bytes > limit {
            return Some(("max_storage_bytes", limit as f64, usage.storage_bytes as f64));
        }
    }
    None
}

/// Errors surfaced by quota administration.
#[derive(Debug, Error)]
pub enum QuotaError {
    /// The team id is unknown.
    #[error("team `{0}` does not exist")]
    UnknownTeam(String),
    /// The organization id is unknown.
    #[error("organization `{0}` does not exist")]
    UnknownOrg(String),
    /// The transfer id is unknown.
    #[error("quota transfer `{0}` does not exist")]
    UnknownTransfer(String),
    /// The transfer was already resolved.
    #[error("quota transfer `{0}` is already resolved")]
    TransferAlreadyResolved(String),
    /// The actor lacks the role the operation requires.
    #[error("`{actor}` lacks the {required} role on team `{team_id}`")]
    InsufficientRole {
        /// Who attempted the operation.
        actor: String,
        /// Role the operation requires.
        required: String,
        /// Team the operation addressed.
        team_id: String,
    },
    /// The source does not hold enough quota to transfer.
    #[error("team `{team_id}` cannot give up {requested} agents (has {available})")]
    InsufficientQuota {
        /// Donor team.
        team_id: String,
        /// Requested amount.
        requested: u32,
        /// Amount actually available.
        available: u32,
    },
}

//─────────────────────────────
//  Facade
//─────────────────────────────

/// Identifies who is asking for agents at every level.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Principal {
    /// The requesting user.
    pub user_id: String,
    /// Their team, if quota-managed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub team_id: Option<String>,
    /// Their organization, if quota-managed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub org_id: Option<String>,
}

impl Principal {
    /// A principal with only a user id.
    pub fn user(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            team_id: None,
            org_id: None,
        }
    }
}

/// The three-level admission gate: user → team → org, short-circuiting on
/// the first denial.
pub struct QuotaManager {
    users: UserQuotaManager,
    teams: TeamQuotaManager,
    orgs: OrgQuotaManager,
}

impl QuotaManager {
    /// Create a manager whose levels emit `quota:violation` events on the
    /// given bus.
    pub fn new(bus: flotilla_bus::EventBus) -> Self {
        Self {
            users: UserQuotaManager::new(Some(bus.clone())),
            teams: TeamQuotaManager::new(Some(bus.clone())),
            orgs: OrgQuotaManager::new(Some(bus)),
        }
    }

    /// A manager without a bus, for tests.
    pub fn detached() -> Self {
        Self {
            users: UserQuotaManager::new(None),
            teams: TeamQuotaManager::new(None),
            orgs: OrgQuotaManager::new(None),
        }
    }

    /// The user level.
    pub fn users(&self) -> &UserQuotaManager {
        &self.users
    }

    /// The team level.
    pub fn teams(&self) -> &TeamQuotaManager {
        &self.teams
    }

    /// The organization level.
    pub fn orgs(&self) -> &OrgQuotaManager {
        &self.orgs
    }

    /// Check the full chain for an allocation of `agents`.
    pub async fn can_allocate(
        &self,
        principal: &Principal,
        agents: u32,
        session_id: &str,
    ) -> QuotaDecision {
        let decision = self
            .users
            .can_allocate(&principal.user_id, agents, session_id)
            .await;
        if !decision.allowed {
            return decision;
        }
        if let Some(team_id) = &principal.team_id {
            let decision = self.teams.can_allocate(team_id, agents, session_id).await;
            if !decision.allowed {
                return decision;
            }
        }
        if let Some(org_id) = &principal.org_id {
            let decision = self.orgs.can_allocate(org_id, agents, session_id).await;
            if !decision.allowed {
                return decision;
            }
        }
        QuotaDecision::allow()
    }

    /// Commit an allocation at every applicable level.
    pub fn allocate(&self, principal: &Principal, agents: u32) {
        self.users.allocate(&principal.user_id, agents);
        if let Some(team_id) = &principal.team_id {
            self.teams.allocate(team_id, agents);
        }
        if let Some(org_id) = &principal.org_id {
            self.orgs.allocate(org_id, agents);
        }
    }

    /// Release agents at every applicable level.
    pub fn release(&self, principal: &Principal, agents: u32) {
        self.users.release(&principal.user_id, agents);
        if let Some(team_id) = &principal.team_id {
            self.teams.release(team_id, agents);
        }
        if let Some(org_id) = &principal.org_id {
            self.orgs.release(org_id, agents);
        }
    }
}
