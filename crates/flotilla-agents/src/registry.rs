//! The in-memory agent directory.
//!
//! Mutations go through the registry; readers (the selector, trackers,
//! dashboards) take cloned snapshots so scoring never holds a registry
//! lock.

use std::collections::BTreeSet;

use chrono::Utc;
use dashmap::DashMap;
use tracing::debug;

use flotilla_types::{AgentStatus, RegisteredAgent};

/// Directory of registered agents with capability and health queries.
#[derive(Default)]
pub struct AgentRegistry {
    agents: DashMap<String, RegisteredAgent>,
    skill_index: DashMap<String, BTreeSet<String>>,
}

impl AgentRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an agent, replacing any previous registration under the same
    /// id.
    pub fn register(&self, agent: RegisteredAgent) {
        for skill in &agent.capabilities.skills {
            self.skill_index
                .entry(skill.clone())
                .or_default()
                .insert(agent.id.clone());
        }
        debug!(agent_id = %agent.id, "registered agent");
        self.agents.insert(agent.id.clone(), agent);
    }

    /// Remove an agent. Returns whether it was present.
    pub fn unregister(&self, agent_id: &str) -> bool {
        let Some((_, agent)) = self.agents.remove(agent_id) else {
            return false;
        };
        for skill in &agent.capabilities.skills {
            if let Some(mut ids) = self.skill_index.get_mut(skill) {
                ids.remove(agent_id);
            }
        }
        debug!(agent_id, "unregistered agent");
        true
    }

    /// Snapshot of one agent.
    pub fn get(&self, agent_id: &str) -> Option<RegisteredAgent> {
        self.agents.get(agent_id).map(|entry| entry.value().clone())
    }

    /// Snapshot of every registered agent.
    pub fn list(&self) -> Vec<RegisteredAgent> {
        self.agents.iter().map(|entry| entry.value().clone()).collect()
    }

    /// Snapshot of agents whose status is idle or busy.
    pub fn healthy(&self) -> Vec<RegisteredAgent> {
        self.agents
            .iter()
            .filter(|entry| entry.value().is_healthy())
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Snapshot of agents declaring a skill.
    pub fn with_skill(&self, skill: &str) -> Vec<RegisteredAgent> {
        let Some(ids) = self.skill_index.get(skill) else {
            return Vec::new();
        };
        ids.iter().filter_map(|id| self.get(id)).collect()
    }

    /// Overwrite an agent's exposed status.
    pub fn update_status(&self, agent_id: &str, status: AgentStatus) {
        if let Some(mut agent) = self.agents.get_mut(agent_id) {
            agent.status = status;
        }
    }

    /// Overwrite an agent's load.
    pub fn update_load(&self, agent_id: &str, load: f64) {
        if let Some(mut agent) = self.agents.get_mut(agent_id) {
            agent.current_load = load.clamp(0.0, 1.0);
        }
    }

    /// Record a heartbeat.
    pub fn heartbeat(&self, agent_id: &str) {
        if let Some(mut agent) = self.agents.get_mut(agent_id) {
            agent.last_heartbeat = Utc::now();
        }
    }

    /// Number of registered agents.
    pub fn len(&self) -> usize {
        self.agents.len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flotilla_types::{AgentCapabilities, AgentConfig, RuntimeKind};

    fn agent(id: &str, skills: &[&str]) -> RegisteredAgent {
        let config = AgentConfig {
            id: Some(id.to_string()),
            runtime: RuntimeKind::Local,
            capabilities: AgentCapabilities {
                skills: skills.iter().map(|s| s.to_string()).collect(),
                specialties: vec![],
                languages: vec![],
                cost_per_hour: 2.0,
                reliability: 0.95,
                avg_speed: 6.0,
            },
        };
        RegisteredAgent::from_config(id.to_string(), &config).unwrap()
    }

    #[test]
    fn register_and_query_by_skill() {
        let registry = AgentRegistry::new();
        registry.register(agent("a1", &["rust", "sql"]));
        registry.register(agent("a2", &["rust"]));

        assert_eq!(registry.len(), 2);
        assert_eq!(registry.with_skill("rust").len(), 2);
        assert_eq!(registry.with_skill("sql").len(), 1);
        assert!(registry.with_skill("go").is_empty());
    }

    #[test]
    fn unregister_cleans_the_skill_index() {
        let registry = AgentRegistry::new();
        registry.register(agent("a1", &["rust"]));
        assert!(registry.unregister("a1"));
        assert!(!registry.unregister("a1"));
        assert!(registry.with_skill("rust").is_empty());
    }

    #[test]
    fn healthy_set_tracks_status() {
        let registry = AgentRegistry::new();
        registry.register(agent("a1", &[]));
        registry.register(agent("a2", &[]));
        registry.update_status("a2", AgentStatus::Unhealthy);

        let healthy = registry.healthy();
        assert_eq!(healthy.len(), 1);
        assert_eq!(healthy[0].id, "a1");
    }

    #[test]
    fn load_is_clamped() {
        let registry = AgentRegistry::new();
        registry.register(agent("a1", &[]));
        registry.update_load("a1", 3.0);
        assert_eq!(registry.get("a1").unwrap().current_load, 1.0);
    }
}
