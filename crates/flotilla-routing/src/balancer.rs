//! Multi-cluster load balancing with circuit breakers, session affinity,
//! and rebalance planning.

use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use flotilla_types::{Cluster, ClusterHealth, LoadBalancerConfig};

/// Utilization spread (as a fraction) below which rebalancing stops.
const REBALANCE_SPREAD: f64 = 0.10;

//─────────────────────────────
//  Strategies & requests
//─────────────────────────────

/// Cluster routing strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BalanceStrategy {
    /// Lowest utilization wins.
    LeastLoaded,
    /// Cycle through candidates.
    RoundRobin,
    /// Prefer the requested region, least-loaded fallback.
    Regional,
    /// Only clusters declaring the required capabilities.
    CapabilityMatch,
    /// Stick sessions to their previous cluster.
    SessionAffinity,
}

impl FromStr for BalanceStrategy {
    type Err = RouteError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "least-loaded" => Ok(Self::LeastLoaded),
            "round-robin" => Ok(Self::RoundRobin),
            "regional" => Ok(Self::Regional),
            "capability-match" => Ok(Self::CapabilityMatch),
            "session-affinity" => Ok(Self::SessionAffinity),
            other => Err(RouteError::InvalidStrategy(other.to_string())),
        }
    }
}

/// A work placement request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RouteRequest {
    /// Session whose affinity should be honoured and recorded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    /// Region preferred by the `regional` strategy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preferred_region: Option<String>,
    /// Capability keys required by the `capability-match` strategy.
    #[serde(default)]
    pub required_capabilities: Vec<String>,
}

/// Successful routing outcome.
#[derive(Debug, Clone)]
pub struct RouteDecision {
    /// The chosen cluster.
    pub cluster: Cluster,
    /// The strategy that actually decided (session affinity wins even when
    /// another strategy was requested).
    pub strategy: BalanceStrategy,
    /// Next-best clusters, capped at the configured maximum.
    pub alternatives: Vec<Cluster>,
}

/// Errors surfaced by routing.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum RouteError {
    /// Every cluster is unhealthy or circuit-broken.
    #[error("no healthy cluster available for routing")]
    NoHealthyCluster,
    /// No candidate declares the required capabilities.
    #[error("no cluster declares the required capabilities")]
    NoCapabilityMatch,
    /// The strategy name is unknown.
    #[error("invalid balance strategy `{0}`")]
    InvalidStrategy(String),
    /// The cluster id is not registered.
    #[error("unknown cluster `{0}`")]
    UnknownCluster(String),
}

/// Per-cluster consecutive-failure counter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreaker {
    /// The cluster this breaker guards.
    pub cluster_id: String,
    /// Whether routing currently excludes the cluster.
    pub is_open: bool,
    /// Consecutive failures observed.
    pub failures: u32,
    /// When the breaker opened, if open.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub opened_at: Option<DateTime<Utc>>,
    /// Failures required to open.
    pub threshold: u32,
}

//─────────────────────────────
//  Rebalancing
//─────────────────────────────

/// One proposed agent movement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RebalanceMove {
    /// Donor cluster.
    pub from: String,
    /// Receiving cluster.
    pub to: String,
    /// Number of agents to move.
    pub agents: u32,
}

/// A set of moves predicted to lower the maximum utilization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RebalancePlan {
    /// Proposed movements, already merged per (from, to) pair.
    pub moves: Vec<RebalanceMove>,
    /// Maximum utilization before applying the plan.
    pub max_utilization_before: f64,
    /// Predicted maximum utilization after applying the plan.
    pub max_utilization_after: f64,
}

//─────────────────────────────
//  Load balancer
//─────────────────────────────

/// Routes work requests across registered clusters.
pub struct LoadBalancer {
    clusters: DashMap<String, Cluster>,
    breakers: DashMap<String, CircuitBreaker>,
    affinity: DashMap<String, String>,
    round_robin: AtomicUsize,
    config: LoadBalancerConfig,
}

impl LoadBalancer {
    /// Create a balancer with the given breaker threshold and alternatives
    /// cap.
    pub fn new(config: LoadBalancerConfig) -> Self {
        Self {
            clusters: DashMap::new(),
            breakers: DashMap::new(),
            affinity: DashMap::new(),
            round_robin: AtomicUsize::new(0),
            config,
        }
    }

    //───────────── cluster registry ─────────────

    /// Register or replace a cluster.
    pub fn register_cluster(&self, cluster: Cluster) {
        self.breakers
            .entry(cluster.id.clone())
            .or_insert_with(|| CircuitBreaker {
                cluster_id: cluster.id.clone(),
                is_open: false,
                failures: 0,
                opened_at: None,
                threshold: self.config.circuit_breaker_threshold,
            });
        info!(cluster_id = %cluster.id, region = %cluster.region, "registered cluster");
        self.clusters.insert(cluster.id.clone(), cluster);
    }

    /// Remove a cluster and its breaker state.
    pub fn remove_cluster(&self, cluster_id: &str) -> bool {
        self.breakers.remove(cluster_id);
        self.affinity.retain(|_, target| target.as_str() != cluster_id);
        self.clusters.remove(cluster_id).is_some()
    }

    /// Snapshot of one cluster.
    pub fn get_cluster(&self, cluster_id: &str) -> Option<Cluster> {
        self.clusters.get(cluster_id).map(|entry| entry.value().clone())
    }

    /// Snapshot of every cluster.
    pub fn list_clusters(&self) -> Vec<Cluster> {
        self.clusters.iter().map(|entry| entry.value().clone()).collect()
    }

    /// Update a cluster's occupancy, recomputing utilization.
    pub fn update_cluster_load(&self, cluster_id: &str, current_agents: u32) -> Result<(), RouteError> {
        let mut cluster = self
            .clusters
            .get_mut(cluster_id)
            .ok_or_else(|| RouteError::UnknownCluster(cluster_id.to_string()))?;
        cluster.load.current_agents = current_agents;
        cluster.load.utilization_percent = if cluster.max_agents > 0 {
            current_agents as f64 / cluster.max_agents as f64 * 100.0
        } else {
            0.0
        };
        cluster.last_seen = Utc::now();
        Ok(())
    }

    /// Update a cluster's reported health.
    pub fn set_cluster_health(&self, cluster_id: &str, health: ClusterHealth) -> Result<(), RouteError> {
        let mut cluster = self
            .clusters
            .get_mut(cluster_id)
            .ok_or_else(|| RouteError::UnknownCluster(cluster_id.to_string()))?;
        cluster.health = health;
        cluster.last_seen = Utc::now();
        Ok(())
    }

    //───────────── circuit breakers ─────────────

    /// Snapshot of a cluster's breaker.
    pub fn breaker(&self, cluster_id: &str) -> Option<CircuitBreaker> {
        self.breakers.get(cluster_id).map(|entry| entry.value().clone())
    }

    /// Record a failure; opens the breaker at the threshold.
    pub fn record_failure(&self, cluster_id: &str) {
        let mut breaker = self
            .breakers
            .entry(cluster_id.to_string())
            .or_insert_with(|| CircuitBreaker {
                cluster_id: cluster_id.to_string(),
                is_open: false,
                failures: 0,
                opened_at: None,
                threshold: self.config.circuit_breaker_threshold,
            });
        breaker.failures += 1;
        if !breaker.is_open && breaker.failures >= breaker.threshold {
            breaker.is_open = true;
            breaker.opened_at = Some(Utc::now());
            info!(cluster_id, failures = breaker.failures, "circuit breaker opened");
        }
    }

    /// Record a success; any success closes the breaker.
    pub fn record_success(&self, cluster_id: &str) {
        if let Some(mut breaker) = self.breakers.get_mut(cluster_id) {
            if breaker.is_open {
                info!(cluster_id, "circuit breaker closed");
            }
            breaker.failures = 0;
            breaker.is_open = false;
            breaker.opened_at = None;
        }
    }

    fn breaker_open(&self, cluster_id: &str) -> bool {
        self.breakers
            .get(cluster_id)
            .map_or(false, |breaker| breaker.is_open)
    }

    //───────────── routing ─────────────

    /// Route a request to a cluster.
    ///
    /// Candidates are healthy clusters whose breaker is closed. An active
    /// session affinity short-circuits strategy selection; otherwise the
    /// chosen strategy applies and, when a session id is present, the
    /// resulting affinity is recorded.
    pub fn route(
        &self,
        request: &RouteRequest,
        strategy: Option<BalanceStrategy>,
    ) -> Result<RouteDecision, RouteError> {
        let mut candidates: Vec<Cluster> = self
            .clusters
            .iter()
            .filter(|entry| entry.value().is_routable() && !self.breaker_open(entry.key()))
            .map(|entry| entry.value().clone())
            .collect();
        candidates.sort_by(|a, b| a.id.cmp(&b.id));

        if let Some(session_id) = &request.session_id {
            if let Some(target) = self.affinity.get(session_id).map(|t| t.value().clone()) {
                if let Some(position) = candidates.iter().position(|c| c.id == target) {
                    let cluster = candidates.swap_remove(position);
                    let alternatives = self.alternatives(&candidates, &cluster.id);
                    return Ok(RouteDecision {
                        cluster,
                        strategy: BalanceStrategy::SessionAffinity,
                        alternatives,
                    });
                }
            }
        }

        if candidates.is_empty() {
            return Err(RouteError::NoHealthyCluster);
        }

        let strategy = strategy.unwrap_or(BalanceStrategy::LeastLoaded);
        let cluster = match strategy {
            BalanceStrategy::LeastLoaded | BalanceStrategy::SessionAffinity => {
                least_loaded(&candidates).clone()
            }
            BalanceStrategy::RoundRobin => {
                let index = self.round_robin.fetch_add(1, Ordering::Relaxed);
                candidates[index % candidates.len()].clone()
            }
            BalanceStrategy::Regional => {
                let regional: Vec<Cluster> = match &request.preferred_region {
                    Some(region) => candidates
                        .iter()
                        .filter(|c| &c.region == region)
                        .cloned()
                        .collect(),
                    None => Vec::new(),
                };
                if regional.is_empty() {
                    least_loaded(&candidates).clone()
                } else {
                    least_loaded(&regional).clone()
                }
            }
            BalanceStrategy::CapabilityMatch => {
                let matching: Vec<Cluster> = candidates
                    .iter()
                    .filter(|c| c.has_capabilities(request.required_capabilities.iter()))
                    .cloned()
                    .collect();
                if matching.is_empty() {
                    return Err(RouteError::NoCapabilityMatch);
                }
                least_loaded(&matching).clone()
            }
        };

        if let Some(session_id) = &request.session_id {
            self.affinity.insert(session_id.clone(), cluster.id.clone());
        }

        let alternatives = self.alternatives(&candidates, &cluster.id);
        debug!(cluster_id = %cluster.id, ?strategy, "routed request");
        Ok(RouteDecision {
            cluster,
            strategy,
            alternatives,
        })
    }

    /// Next-best clusters for a decision. Open-breaker clusters only appear
    /// when no closed candidate remains.
    fn alternatives(&self, candidates: &[Cluster], chosen_id: &str) -> Vec<Cluster> {
        let mut others: Vec<Cluster> = candidates
            .iter()
            .filter(|c| c.id != chosen_id)
            .cloned()
            .collect();
        if others.is_empty() {
            others = self
                .clusters
                .iter()
                .filter(|entry| {
                    entry.value().is_routable()
                        && entry.key() != chosen_id
                        && self.breaker_open(entry.key())
                })
                .map(|entry| entry.value().clone())
                .collect();
        }
        others.sort_by(|a, b| {
            a.utilization()
                .partial_cmp(&b.utilization())
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.id.cmp(&b.id))
        });
        others.truncate(self.config.max_alternatives);
        others
    }

    /// Forget a session's affinity.
    pub fn clear_affinity(&self, session_id: &str) -> bool {
        self.affinity.remove(session_id).is_some()
    }

    //───────────── rebalancing ─────────────

    /// Propose agent moves that lower the maximum utilization.
    ///
    /// Greedy: repeatedly move one agent from the most to the least
    /// utilized cluster until the spread falls under ten percentage points
    /// or no further move helps.
    pub fn generate_rebalance_plan(&self) -> RebalancePlan {
        #[derive(Clone)]
        struct Sim {
            id: String,
            agents: u32,
            max_agents: u32,
        }
        impl Sim {
            fn utilization(&self) -> f64 {
                if self.max_agents == 0 {
                    0.0
                } else {
                    self.agents as f64 / self.max_agents as f64
                }
            }
        }

        let mut sims: Vec<Sim> = self
            .clusters
            .iter()
            .filter(|entry| entry.value().is_routable() && entry.value().max_agents > 0)
            .map(|entry| Sim {
                id: entry.key().clone(),
                agents: entry.value().load.current_agents,
                max_agents: entry.value().max_agents,
            })
            .collect();
        sims.sort_by(|a, b| a.id.cmp(&b.id));

        let max_before = sims
            .iter()
            .map(Sim::utilization)
            .fold(0.0_f64, f64::max);

        let mut moves: Vec<RebalanceMove> = Vec::new();
        if sims.len() >= 2 {
            // One agent per step bounds the loop by total agent count.
            let step_budget: u32 = sims.iter().map(|s| s.agents).sum();
            for _ in 0..step_budget {
                let (max_index, min_index) = {
                    let mut max_index = 0;
                    let mut min_index = 0;
                    for (i, sim) in sims.iter().enumerate() {
                        if sim.utilization() > sims[max_index].utilization() {
                            max_index = i;
                        }
                        if sim.utilization() < sims[min_index].utilization() {
                            min_index = i;
                        }
                    }
                    (max_index, min_index)
                };
                let spread = sims[max_index].utilization() - sims[min_index].utilization();
                if spread <= REBALANCE_SPREAD
                    || sims[max_index].agents == 0
                    || sims[min_index].agents >= sims[min_index].max_agents
                {
                    break;
                }
                sims[max_index].agents -= 1;
                sims[min_index].agents += 1;
                let from = sims[max_index].id.clone();
                let to = sims[min_index].id.clone();
                match moves.iter_mut().find(|m| m.from == from && m.to == to) {
                    Some(existing) => existing.agents += 1,
                    None => moves.push(RebalanceMove { from, to, agents: 1 }),
                }
            }
        }

        let max_after = sims
            .iter()
            .map(Sim::utilization)
            .fold(0.0_f64, f64::max);

        RebalancePlan {
            moves,
            max_utilization_before: max_before,
            max_utilization_after: max_after,
        }
    }
}

fn least_loaded(clusters: &[Cluster]) -> &Cluster {
    clusters
        .iter()
        .min_by(|a, b| {
            a.utilization()
                .partial_cmp(&b.utilization())
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.id.cmp(&b.id))
        })
        .expect("least_loaded called with a non-empty slice")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn balancer() -> LoadBalancer {
        LoadBalancer::new(LoadBalancerConfig::default())
    }

    fn cluster(id: &str, region: &str, max_agents: u32, current: u32) -> Cluster {
        let mut cluster = Cluster::new(id, format!("grpc://{id}"), region, "a", max_agents);
        cluster.load.current_agents = current;
        cluster.load.utilization_percent = if max_agents > 0 {
            current as f64 / max_agents as f64 * 100.0
        } else {
            0.0
        };
        cluster
    }

    #[test]
    fn least_loaded_routing() {
        let lb = balancer();
        lb.register_cluster(cluster("c1", "eu", 10, 8));
        lb.register_cluster(cluster("c2", "eu", 10, 2));

        let decision = lb.route(&RouteRequest::default(), None).unwrap();
        assert_eq!(decision.cluster.id, "c2");
        assert_eq!(decision.strategy, BalanceStrategy::LeastLoaded);
        assert_eq!(decision.alternatives.len(), 1);
    }

    #[test]
    fn round_robin_cycles() {
        let lb = balancer();
        lb.register_cluster(cluster("c1", "eu", 10, 0));
        lb.register_cluster(cluster("c2", "eu", 10, 0));

        let first = lb
            .route(&RouteRequest::default(), Some(BalanceStrategy::RoundRobin))
            .unwrap()
            .cluster
            .id;
        let second = lb
            .route(&RouteRequest::default(), Some(BalanceStrategy::RoundRobin))
            .unwrap()
            .cluster
            .id;
        assert_ne!(first, second);
    }

    #[test]
    fn regional_prefers_the_region_and_falls_back() {
        let lb = balancer();
        lb.register_cluster(cluster("eu1", "eu-west-1", 10, 9));
        lb.register_cluster(cluster("us1", "us-east-1", 10, 0));

        let request = RouteRequest {
            preferred_region: Some("eu-west-1".into()),
            ..RouteRequest::default()
        };
        let decision = lb.route(&request, Some(BalanceStrategy::Regional)).unwrap();
        // The busier regional cluster still wins over the idle remote one.
        assert_eq!(decision.cluster.id, "eu1");

        let missing = RouteRequest {
            preferred_region: Some("ap-south-1".into()),
            ..RouteRequest::default()
        };
        let fallback = lb.route(&missing, Some(BalanceStrategy::Regional)).unwrap();
        assert_eq!(fallback.cluster.id, "us1");
    }

    #[test]
    fn capability_match_filters_clusters() {
        let lb = balancer();
        let mut gpu = cluster("gpu1", "eu", 10, 5);
        gpu.capabilities
            .insert("gpu".into(), serde_json::Value::Bool(true));
        lb.register_cluster(gpu);
        lb.register_cluster(cluster("cpu1", "eu", 10, 0));

        let request = RouteRequest {
            required_capabilities: vec!["gpu".into()],
            ..RouteRequest::default()
        };
        let decision = lb
            .route(&request, Some(BalanceStrategy::CapabilityMatch))
            .unwrap();
        assert_eq!(decision.cluster.id, "gpu1");

        let impossible = RouteRequest {
            required_capabilities: vec!["tpu".into()],
            ..RouteRequest::default()
        };
        assert_eq!(
            lb.route(&impossible, Some(BalanceStrategy::CapabilityMatch))
                .unwrap_err(),
            RouteError::NoCapabilityMatch
        );
    }

    #[test]
    fn session_affinity_sticks_and_reports_its_strategy() {
        let lb = balancer();
        lb.register_cluster(cluster("c1", "eu", 10, 9));
        lb.register_cluster(cluster("c2", "eu", 10, 0));

        let request = RouteRequest {
            session_id: Some("s1".into()),
            ..RouteRequest::default()
        };
        let first = lb.route(&request, None).unwrap();
        assert_eq!(first.cluster.id, "c2");

        // Make the previously chosen cluster look bad; affinity still wins.
        lb.update_cluster_load("c2", 10).unwrap();
        let second = lb.route(&request, None).unwrap();
        assert_eq!(second.cluster.id, "c2");
        assert_eq!(second.strategy, BalanceStrategy::SessionAffinity);

        lb.clear_affinity("s1");
        let third = lb.route(&request, None).unwrap();
        assert_eq!(third.cluster.id, "c1");
    }

    #[test]
    fn circuit_breaker_excludes_and_readmits() {
        let lb = balancer();
        lb.register_cluster(cluster("c1", "eu", 10, 0));
        lb.register_cluster(cluster("c2", "eu", 10, 5));
        lb.register_cluster(cluster("c3", "eu", 10, 5));

        for _ in 0..3 {
            lb.record_failure("c1");
        }
        assert!(lb.breaker("c1").unwrap().is_open);
        for _ in 0..10 {
            let decision = lb
                .route(&RouteRequest::default(), Some(BalanceStrategy::LeastLoaded))
                .unwrap();
            assert_ne!(decision.cluster.id, "c1");
        }

        lb.record_success("c1");
        assert!(!lb.breaker("c1").unwrap().is_open);
        let decision = lb
            .route(&RouteRequest::default(), Some(BalanceStrategy::LeastLoaded))
            .unwrap();
        // The idle cluster is routable again and wins on load.
        assert_eq!(decision.cluster.id, "c1");
    }

    #[test]
    fn all_breakers_open_is_a_routing_failure() {
        let lb = balancer();
        lb.register_cluster(cluster("c1", "eu", 10, 0));
        for _ in 0..3 {
            lb.record_failure("c1");
        }
        assert_eq!(
            lb.route(&RouteRequest::default(), None).unwrap_err(),
            RouteError::NoHealthyCluster
        );
    }

    #[test]
    fn unhealthy_clusters_are_not_candidates() {
        let lb = balancer();
        lb.register_cluster(cluster("c1", "eu", 10, 0));
        lb.set_cluster_health("c1", ClusterHealth::Unhealthy).unwrap();
        assert_eq!(
            lb.route(&RouteRequest::default(), None).unwrap_err(),
            RouteError::NoHealthyCluster
        );
    }

    #[test]
    fn rebalance_plan_lowers_max_utilization() {
        let lb = balancer();
        lb.register_cluster(cluster("hot", "eu", 10, 9));
        lb.register_cluster(cluster("cold", "eu", 10, 1));

        let plan = lb.generate_rebalance_plan();
        assert!(!plan.moves.is_empty());
        assert!(plan.max_utilization_after < plan.max_utilization_before);
        let total_moved: u32 = plan.moves.iter().map(|m| m.agents).sum();
        assert!(total_moved >= 3, "expected a meaningful move, got {total_moved}");
        assert_eq!(plan.moves[0].from, "hot");
        assert_eq!(plan.moves[0].to, "cold");
    }

    #[test]
    fn balanced_clusters_need_no_moves() {
        let lb = balancer();
        lb.register_cluster(cluster("c1", "eu", 10, 5));
        lb.register_cluster(cluster("c2", "eu", 10, 5));
        let plan = lb.generate_rebalance_plan();
        assert!(plan.moves.is_empty());
        assert_eq!(plan.max_utilization_before, plan.max_utilization_after);
    }
}
