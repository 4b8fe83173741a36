//! Cluster descriptors: a set of agents addressed through one routing
//! endpoint, as seen by the multi-cluster load balancer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Health of a cluster as reported by its endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClusterHealth {
    /// Accepting work.
    Healthy,
    /// Accepting work but impaired.
    Degraded,
    /// Excluded from routing.
    Unhealthy,
}

/// Current occupancy of a cluster.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct ClusterLoad {
    /// Agents currently placed on the cluster.
    pub current_agents: u32,
    /// Utilization as a percentage of `max_agents`.
    pub utilization_percent: f64,
}

/// A routable cluster of agents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cluster {
    /// Stable cluster identifier.
    pub id: String,
    /// Routing endpoint, opaque to the balancer.
    pub endpoint: String,
    /// Deployment region, e.g. `eu-west-1`.
    pub region: String,
    /// Zone within the region.
    pub zone: String,
    /// Capacity ceiling.
    pub max_agents: u32,
    /// Current occupancy.
    pub load: ClusterLoad,
    /// Reported health.
    pub health: ClusterHealth,
    /// Opaque capability map matched by capability-aware routing.
    #[serde(default)]
    pub capabilities: HashMap<String, Value>,
    /// Last time the balancer heard from the cluster.
    pub last_seen: DateTime<Utc>,
}

impl Cluster {
    /// Build a healthy, empty cluster.
    pub fn new(
        id: impl Into<String>,
        endpoint: impl Into<String>,
        region: impl Into<String>,
        zone: impl Into<String>,
        max_agents: u32,
    ) -> Self {
        Self {
            id: id.into(),
            endpoint: endpoint.into(),
            region: region.into(),
            zone: zone.into(),
            max_agents,
            load: ClusterLoad::default(),
            health: ClusterHealth::Healthy,
            capabilities: HashMap::new(),
            last_seen: Utc::now(),
        }
    }

    /// Utilization as a fraction in `[0, 1]`.
    pub fn utilization(&self) -> f64 {
        self.load.utilization_percent / 100.0
    }

    /// Whether routing may consider this cluster at all.
    pub fn is_routable(&self) -> bool {
        matches!(self.health, ClusterHealth::Healthy | ClusterHealth::Degraded)
    }

    /// Whether the cluster declares every named capability key.
    pub fn has_capabilities<'a, I: IntoIterator<Item = &'a String>>(&self, required: I) -> bool {
        required
            .into_iter()
            .all(|key| self.capabilities.contains_key(key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn routability_follows_health() {
        let mut cluster = Cluster::new("c1", "grpc://c1", "eu-west-1", "a", 10);
        assert!(cluster.is_routable());
        cluster.health = ClusterHealth::Unhealthy;
        assert!(!cluster.is_routable());
    }

    #[test]
    fn capability_matching() {
        let mut cluster = Cluster::new("c1", "grpc://c1", "eu-west-1", "a", 10);
        cluster
            .capabilities
            .insert("gpu".into(), Value::Bool(true));
        let gpu = vec!["gpu".to_string()];
        assert!(cluster.has_capabilities(gpu.iter()));
        let tpu = vec!["tpu".to_string()];
        assert!(!cluster.has_capabilities(tpu.iter()));
    }
}
