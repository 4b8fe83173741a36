//! Team-level quota accounting: member roles, project allocations, and
//! quota transfers between teams.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};
use uuid::Uuid;

use flotilla_bus::{EventBus, PublishOptions};

use crate::{check_limits, QuotaDecision, QuotaError, QuotaLimits, QuotaUsage, QUOTA_VIOLATION_EVENT};

/// Roles a user can hold on a team.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TeamRole {
    /// May administer quota, members, and transfers.
    Admin,
    /// May consume team quota.
    Member,
    /// Read-only.
    Viewer,
}

/// Agents reserved for one project out of the team's allotment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectAllocation {
    /// Project identifier.
    pub project_id: String,
    /// Agents reserved.
    pub reserved_agents: u32,
    /// Agents currently drawn from the reservation.
    pub used_agents: u32,
}

/// Lifecycle of a quota transfer request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferStatus {
    /// Awaiting an admin decision.
    Pending,
    /// Committed; quota moved.
    Approved,
    /// Declined; nothing moved.
    Rejected,
}

/// A request to move concurrent-agent quota between teams.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuotaTransfer {
    /// Transfer identifier.
    pub id: String,
    /// Donor team.
    pub from_team: String,
    /// Receiving team.
    pub to_team: String,
    /// Concurrent-agent quota to move.
    pub agents: u32,
    /// Requesting user.
    pub requested_by: String,
    /// Current status.
    pub status: TransferStatus,
    /// When the request was filed.
    pub requested_at: DateTime<Utc>,
    /// Admin who resolved it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_by: Option<String>,
    /// When it was resolved.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,
}

/// A quota-managed team.
#[derive(Debug, Clone)]
pub struct Team {
    /// Team identifier.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Enforced limits.
    pub limits: QuotaLimits,
    /// Windowed usage.
    pub usage: QuotaUsage,
    /// Member roles.
    pub members: HashMap<String, TeamRole>,
    /// Project reservations.
    pub projects: HashMap<String, ProjectAllocation>,
}

/// Team-level allocation authority.
pub struct TeamQuotaManager {
    teams: DashMap<String, Team>,
    transfers: DashMap<String, QuotaTransfer>,
    bus: Option<EventBus>,
}

impl TeamQuotaManager {
    /// Create a manager; violations are emitted on the bus when present.
    pub fn new(bus: Option<EventBus>) -> Self {
        Self {
            teams: DashMap::new(),
            transfers: DashMap::new(),
            bus,
        }
    }

    /// Create (or replace) a team.
    pub fn create_team(&self, team_id: &str, name: &str, limits: QuotaLimits) {
        self.teams.insert(
            team_id.to_string(),
            Team {
                id: team_id.to_string(),
                name: name.to_string(),
                limits,
                usage: QuotaUsage::default(),
                members: HashMap::new(),
                projects: HashMap::new(),
            },
        );
    }

    /// Add or update a member.
    pub fn add_member(&self, team_id: &str, user_id: &str, role: TeamRole) -> Result<(), QuotaError> {
        let mut team = self
            .teams
            .get_mut(team_id)
            .ok_or_else(|| QuotaError::UnknownTeam(team_id.to_string()))?;
        team.members.insert(user_id.to_string(), role);
        Ok(())
    }

    /// A member's role, if any.
    pub fn member_role(&self, team_id: &str, user_id: &str) -> Option<TeamRole> {
        self.teams
            .get(team_id)?
            .members
            .get(user_id)
            .copied()
    }

    /// Reserve agents for a project out of the team allotment.
    pub fn allocate_project(
        &self,
        team_id: &str,
        project_id: &str,
        reserved_agents: u32,
    ) -> Result<(), QuotaError> {
        let mut team = self
            .teams
            .get_mut(team_id)
            .ok_or_else(|| QuotaError::UnknownTeam(team_id.to_string()))?;
        team.projects.insert(
            project_id.to_string(),
            ProjectAllocation {
                project_id: project_id.to_string(),
                reserved_agents,
                used_agents: 0,
            },
        );
        Ok(())
    }

    /// Check whether the team may allocate `agents` more. Unknown teams
    /// are treated as unmanaged and allowed.
    pub async fn can_allocate(&self, team_id: &str, agents: u32, session_id: &str) -> QuotaDecision {
        let violation = {
            let Some(mut team) = self.teams.get_mut(team_id) else {
                return QuotaDecision::allow();
            };
            team.usage.roll(Utc::now());
            check_limits(&team.limits, &team.usage, agents)
        };
        match violation {
            None => QuotaDecision::allow(),
            Some((dimension, limit, attempted)) => {
                self.emit_violation(team_id, dimension, limit, attempted, session_id)
                    .await;
                QuotaDecision::deny(format!(
                    "team `{team_id}` exceeds {dimension}: {attempted} > {limit}"
                ))
            }
        }
    }

    /// Commit an allocation.
    pub fn allocate(&self, team_id: &str, agents: u32) {
        if let Some(mut team) = self.teams.get_mut(team_id) {
            team.usage.allocate(agents, Utc::now());
        }
    }

    /// Release running agents.
    pub fn release(&self, team_id: &str, agents: u32) {
        if let Some(mut team) = self.teams.get_mut(team_id) {
            team.usage.release(agents);
        }
    }

    /// Snapshot of a team.
    pub fn get_team(&self, team_id: &str) -> Option<Team> {
        self.teams.get(team_id).map(|team| team.clone())
    }

    //───────────── transfers ─────────────

    /// File a transfer of concurrent-agent quota between teams. The
    /// requester must be at least a member of the donor team.
    pub fn request_quota_transfer(
        &self,
        from_team: &str,
        to_team: &str,
        agents: u32,
        requested_by: &str,
    ) -> Result<String, QuotaError> {
        if !self.teams.contains_key(from_team) {
            return Err(QuotaError::UnknownTeam(from_team.to_string()));
        }
        if !self.teams.contains_key(to_team) {
            return Err(QuotaError::UnknownTeam(to_team.to_string()));
        }
        match self.member_role(from_team, requested_by) {
            Some(TeamRole::Admin) | Some(TeamRole::Member) => {}
            _ => {
                return Err(QuotaError::InsufficientRole {
                    actor: requested_by.to_string(),
                    required: "member".to_string(),
                    team_id: from_team.to_string(),
                })
            }
        }

        let id = Uuid::new_v4().to_string();
        self.transfers.insert(
            id.clone(),
            QuotaTransfer {
                id: id.clone(),
                from_team: from_team.to_string(),
                to_team: to_team.to_string(),
                agents,
                requested_by: requested_by.to_string(),
                status: TransferStatus::Pending,
                requested_at: Utc::now(),
                resolved_by: None,
                resolved_at: None,
            },
        );
        info!(transfer_id = %id, from_team, to_team, agents, "quota transfer requested");
        Ok(id)
    }

    /// Approve or reject a pending transfer. The approver must be an
    /// admin of the donor team; approval moves concurrent-agent quota.
    pub fn resolve_quota_transfer(
        &self,
        transfer_id: &str,
        approved: bool,
        approver: &str,
    ) -> Result<QuotaTransfer, QuotaError> {
        let (from_team, to_team, agents) = {
            let transfer = self
                .transfers
                .get(transfer_id)
                .ok_or_else(|| QuotaError::UnknownTransfer(transfer_id.to_string()))?;
            if transfer.status != TransferStatus::Pending {
                return Err(QuotaError::TransferAlreadyResolved(transfer_id.to_string()));
            }
            (
                transfer.from_team.clone(),
                transfer.to_team.clone(),
                transfer.agents,
            )
        };

        if self.member_role(&from_team, approver) != Some(TeamRole::Admin) {
            return Err(QuotaError::InsufficientRole {
                actor: approver.to_string(),
                required: "admin".to_string(),
                team_id: from_team,
            });
        }

        if approved {
            let available = {
                let donor = self
                    .teams
                    .get(&from_team)
                    .ok_or_else(|| QuotaError::UnknownTeam(from_team.clone()))?;
                donor.limits.max_concurrent_agents.unwrap_or(u32::MAX)
            };
            if available < agents {
                return Err(QuotaError::InsufficientQuota {
                    team_id: from_team,
                    requested: agents,
                    available,
                });
            }
            if let Some(mut donor) = self.teams.get_mut(&from_team) {
                if let Some(limit) = donor.limits.max_concurrent_agents.as_mut() {
                    *limit -= agents;
                }
            }
            if let Some(mut receiver) = self.teams.get_mut(&to_team) {
                let limit = receiver.limits.max_concurrent_agents.unwrap_or(0);
                receiver.limits.max_concurrent_agents = Some(limit + agents);
            }
        }

        let mut transfer = self
            .transfers
            .get_mut(transfer_id)
            .ok_or_else(|| QuotaError::UnknownTransfer(transfer_id.to_string()))?;
        transfer.status = if approved {
            TransferStatus::Approved
        } else {
            TransferStatus::Rejected
        };
        transfer.resolved_by = Some(approver.to_string());
        transfer.resolved_at = Some(Utc::now());
        info!(transfer_id, approved, "quota transfer resolved");
        Ok(transfer.clone())
    }

    /// Look up a transfer.
    pub fn get_transfer(&self, transfer_id: &str) -> Option<QuotaTransfer> {
        self.transfers.get(transfer_id).map(|t| t.clone())
    }

    async fn emit_violation(
        &self,
        team_id: &str,
        dimension: &str,
        limit: f64,
        attempted: f64,
        session_id: &str,
    ) {
        warn!(team_id, dimension, limit, attempted, "team quota violation");
        let Some(bus) = &self.bus else { return };
        if let Err(error) = bus
            .publish(
                QUOTA_VIOLATION_EVENT,
                json!({
                    "principal_id": team_id,
                    "level": "team",
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

    fn manager_with_teams() -> TeamQuotaManager {
        let manager = TeamQuotaManager::new(None);
        manager.create_team(
            "t1",
            "alpha",
            QuotaLimits {
                max_concurrent_agents: Some(10),
                ..QuotaLimits::default()
            },
        );
        manager.create_team(
            "t2",
            "beta",
            QuotaLimits {
                max_concurrent_agents: Some(4),
                ..QuotaLimits::default()
            },
        );
        manager.add_member("t1", "alice", TeamRole::Admin).unwrap();
        manager.add_member("t1", "bob", TeamRole::Member).unwrap();
        manager.add_member("t1", "carol", TeamRole::Viewer).unwrap();
        manager
    }

    #[tokio::test]
    async fn unknown_teams_are_unmanaged() {
        let manager = TeamQuotaManager::new(None);
        assert!(manager.can_allocate("ghost", 100, "s").await.allowed);
    }

    #[test]
    fn transfer_requires_membership_and_admin_resolution() {
        let manager = manager_with_teams();

        // A viewer cannot request.
        assert!(manager
            .request_quota_transfer("t1", "t2", 2, "carol")
            .is_err());

        let id = manager
            .request_quota_transfer("t1", "t2", 2, "bob")
            .unwrap();
        assert_eq!(
            manager.get_transfer(&id).unwrap().status,
            TransferStatus::Pending
        );

        // A member cannot resolve.
        assert!(manager.resolve_quota_transfer(&id, true, "bob").is_err());

        let resolved = manager.resolve_quota_transfer(&id, true, "alice").unwrap();
        assert_eq!(resolved.status, TransferStatus::Approved);
        assert_eq!(
            manager.get_team("t1").unwrap().limits.max_concurrent_agents,
            Some(8)
        );
        assert_eq!(
            manager.get_team("t2").unwrap().limits.max_concurrent_agents,
            Some(6)
        );

        // Double resolution fails.
        assert!(manager.resolve_quota_transfer(&id, false, "alice").is_err());
    }

    #[test]
    fn rejected_transfer_moves_nothing() {
        let manager = manager_with_teams();
        let id = manager
            .request_quota_transfer("t1", "t2", 2, "alice")
            .unwrap();
        let resolved = manager.resolve_quota_transfer(&id, false, "alice").unwrap();
        assert_eq!(resolved.status, TransferStatus::Rejected);
        assert_eq!(
            manager.get_team("t1").unwrap().limits.max_concurrent_agents,
            Some(10)
        );
    }

    #[test]
    fn oversized_transfer_is_refused() {
        let manager = manager_with_teams();
        let id = manager
            .request_quota_transfer("t1", "t2", 99, "alice")
            .unwrap();
        assert!(matches!(
            manager.resolve_quota_transfer(&id, true, "alice"),
            Err(QuotaError::InsufficientQuota { .. })
        ));
    }

    #[test]
    fn project_allocations_are_tracked() {
        let manager = manager_with_teams();
        manager.allocate_project("t1", "p1", 4).unwrap();
        let team = manager.get_team("t1").unwrap();
        assert_eq!(team.projects["p1"].reserved_agents, 4);
    }
}
