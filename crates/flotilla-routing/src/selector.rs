//! Scoring-based agent selection.
//!
//! Hard constraints remove candidates before any scoring; the surviving
//! candidates are scored in `[0, 1]` under the requested strategy and the
//! best one wins. Rotation and recently-selected memory for the
//! load-balanced strategy are per-selector state, never process-global.

use std::collections::VecDeque;
use std::str::FromStr;
use std::sync::{Arc, Mutex as StdMutex};

use serde::{Deserialize, Serialize};
use tracing::debug;

use flotilla_agents::AgentRegistry;
use flotilla_types::{RegisteredAgent, RuntimeKind, SelectorWeights};

/// How many past selections the load-balanced penalty remembers.
const RECENT_SELECTION_WINDOW: usize = 3;

//─────────────────────────────
//  Strategy & criteria
//─────────────────────────────

/// Named selection strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SelectionStrategy {
    /// Skill coverage above all.
    SkillMatch,
    /// Cheapest capable agent.
    CostOptimized,
    /// Fastest capable agent.
    SpeedOptimized,
    /// Most reliable capable agent.
    ReliabilityOptimized,
    /// Spread work across agents.
    LoadBalanced,
    /// Weighted blend of skill, cost, reliability, and load.
    Balanced,
}

impl FromStr for SelectionStrategy {
    type Err = SelectionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "skill-match" => Ok(Self::SkillMatch),
            "cost-optimized" => Ok(Self::CostOptimized),
            "speed-optimized" => Ok(Self::SpeedOptimized),
            "reliability-optimized" => Ok(Self::ReliabilityOptimized),
            "load-balanced" => Ok(Self::LoadBalanced),
            "balanced" => Ok(Self::Balanced),
            other => Err(SelectionError::InvalidStrategy(other.to_string())),
        }
    }
}

/// What a caller requires and prefers of the selected agent.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SelectionCriteria {
    /// Skills the agent must declare (hard constraint and scoring input).
    #[serde(default)]
    pub required_skills: Vec<String>,
    /// Skills that improve the score but do not disqualify.
    #[serde(default)]
    pub preferred_skills: Vec<String>,
    /// Specialties the agent must declare.
    #[serde(default)]
    pub required_specialties: Vec<String>,
    /// Languages the agent must declare.
    #[serde(default)]
    pub required_languages: Vec<String>,
    /// Maximum acceptable cost per hour.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_cost_per_hour: Option<f64>,
    /// Minimum acceptable reliability.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_reliability: Option<f64>,
    /// Minimum acceptable average speed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_speed: Option<f64>,
    /// Required runtime placement.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preferred_runtime: Option<RuntimeKind>,
    /// Strategy applied to the surviving candidates.
    #[serde(default = "default_strategy")]
    pub strategy: SelectionStrategy,
}

fn default_strategy() -> SelectionStrategy {
    SelectionStrategy::Balanced
}

impl Default for SelectionStrategy {
    fn default() -> Self {
        Self::Balanced
    }
}

//─────────────────────────────
//  Results & errors
//─────────────────────────────

/// Per-dimension scores feeding the weighted total.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ScoreBreakdown {
    /// Required-skill coverage, 1 when nothing is required.
    pub required_skill: f64,
    /// Preferred-skill coverage, 0 when nothing is preferred.
    pub preferred_skill: f64,
    /// `exp(-cost_per_hour / 10)`.
    pub cost: f64,
    /// Declared reliability as-is.
    pub reliability: f64,
    /// `1 - current_load`.
    pub load: f64,
    /// Speed relative to the fastest candidate.
    pub speed: f64,
    /// Weighted total under the chosen strategy.
    pub total: f64,
}

/// One scored candidate.
#[derive(Debug, Clone)]
pub struct ScoredAgent {
    /// The candidate.
    pub agent: RegisteredAgent,
    /// Weighted total score.
    pub score: f64,
    /// Per-dimension details.
    pub breakdown: ScoreBreakdown,
}

/// Outcome of a single-agent selection.
#[derive(Debug, Clone)]
pub struct SelectionResult {
    /// The winning agent.
    pub agent: RegisteredAgent,
    /// Winning score.
    pub score: f64,
    /// Per-dimension details for the winner.
    pub breakdown: ScoreBreakdown,
    /// How many candidates survived the hard constraints.
    pub candidates_considered: usize,
}

/// Errors surfaced by selection.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum SelectionError {
    /// No healthy agents are registered at all.
    #[error("no healthy agents registered")]
    NoCandidates,
    /// Agents exist but none satisfies the hard constraints.
    #[error("no agents match the selection constraints")]
    NoMatchingAgents,
    /// Fewer matching agents than the requested count.
    #[error("insufficient agents: required {required}, available {available}")]
    InsufficientAgents {
        /// How many were requested.
        required: usize,
        /// How many matched.
        available: usize,
    },
    /// The strategy name is unknown.
    #[error("invalid selection strategy `{0}`")]
    InvalidStrategy(String),
    /// The requested agent count is unusable.
    #[error("invalid agent count: {0}")]
    InvalidCount(usize),
}

//─────────────────────────────
//  Selector
//─────────────────────────────

#[derive(Default)]
struct RotationState {
    index: usize,
    recent: VecDeque<String>,
}

/// Scores healthy registry agents against selection criteria.
pub struct AgentSelector {
    registry: Arc<AgentRegistry>,
    weights: SelectorWeights,
    rotation: StdMutex<RotationState>,
}

impl AgentSelector {
    /// Create a selector over a registry with the given balanced-strategy
    /// weights.
    pub fn new(registry: Arc<AgentRegistry>, weights: SelectorWeights) -> Self {
        Self {
            registry,
            weights,
            rotation: StdMutex::new(RotationState::default()),
        }
    }

    /// Select the single best agent for the criteria.
    pub fn select_agent(&self, criteria: &SelectionCriteria) -> Result<SelectionResult, SelectionError> {
        let ranked = self.rank_agents(criteria)?;
        let considered = ranked.len();
        let winner = ranked.into_iter().next().ok_or(SelectionError::NoMatchingAgents)?;

        if criteria.strategy == SelectionStrategy::LoadBalanced {
            let mut rotation = self
                .rotation
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            rotation.index = rotation.index.wrapping_add(1);
            rotation.recent.push_back(winner.agent.id.clone());
            while rotation.recent.len() > RECENT_SELECTION_WINDOW {
                rotation.recent.pop_front();
            }
        }

        debug!(
            agent_id = %winner.agent.id,
            score = winner.score,
            considered,
            strategy = ?criteria.strategy,
            "selected agent"
        );
        Ok(SelectionResult {
            agent: winner.agent,
            score: winner.score,
            breakdown: winner.breakdown,
            candidates_considered: considered,
        })
    }

    /// Select the top `count` agents; fails when fewer candidates match.
    pub fn select_multiple_agents(
        &self,
        criteria: &SelectionCriteria,
        count: usize,
    ) -> Result<Vec<SelectionResult>, SelectionError> {
        if count == 0 {
            return Err(SelectionError::InvalidCount(count));
        }
        let ranked = self.rank_agents(criteria)?;
        if ranked.len() < count {
            return Err(SelectionError::InsufficientAgents {
                required: count,
                available: ranked.len(),
            });
        }
        let considered = ranked.len();
        Ok(ranked
            .into_iter()
            .take(count)
            .map(|scored| SelectionResult {
                agent: scored.agent,
                score: scored.score,
                breakdown: scored.breakdown,
                candidates_considered: considered,
            })
            .collect())
    }

    /// Score and rank every matching candidate, best first.
    pub fn rank_agents(&self, criteria: &SelectionCriteria) -> Result<Vec<ScoredAgent>, SelectionError> {
        let healthy = self.registry.healthy();
        if healthy.is_empty() {
            return Err(SelectionError::NoCandidates);
        }

        let mut candidates: Vec<RegisteredAgent> = healthy
            .into_iter()
            .filter(|agent| Self::passes_hard_constraints(agent, criteria))
            .collect();
        if candidates.is_empty() {
            return Err(SelectionError::NoMatchingAgents);
        }
        candidates.sort_by(|a, b| a.id.cmp(&b.id));

        let max_speed = candidates
            .iter()
            .map(|agent| agent.capabilities.avg_speed)
            .fold(0.0_f64, f64::max);

        let (rotation_top, recent) = {
            let rotation = self
                .rotation
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            let top = candidates
                .get(rotation.index % candidates.len())
                .map(|agent| agent.id.clone());
            (top, rotation.recent.iter().cloned().collect::<Vec<_>>())
        };

        let mut scored: Vec<ScoredAgent> = candidates
            .into_iter()
            .map(|agent| {
                let breakdown = self.score(
                    &agent,
                    criteria,
                    max_speed,
                    rotation_top.as_deref(),
                    &recent,
                );
                ScoredAgent {
                    score: breakdown.total,
                    breakdown,
                    agent,
                }
            })
            .collect();
        scored.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.agent.id.cmp(&b.agent.id))
        });
        Ok(scored)
    }

    fn passes_hard_constraints(agent: &RegisteredAgent, criteria: &SelectionCriteria) -> bool {
        let caps = &agent.capabilities;
        if !caps.has_all_skills(criteria.required_skills.iter()) {
            return false;
        }
        if !criteria
            .required_specialties
            .iter()
            .all(|s| caps.specialties.iter().any(|have| have == s))
        {
            return false;
        }
        if !criteria
            .required_languages
            .iter()
            .all(|l| caps.languages.iter().any(|have| have == l))
        {
            return false;
        }
        if let Some(max_cost) = criteria.max_cost_per_hour {
            if caps.cost_per_hour > max_cost {
                return false;
            }
        }
        if let Some(min_reliability) = criteria.min_reliability {
            if caps.reliability < min_reliability {
                return false;
            }
        }
        if let Some(min_speed) = criteria.min_speed {
            if caps.avg_speed < min_speed {
                return false;
            }
        }
        if let Some(runtime) = criteria.preferred_runtime {
            if agent.runtime != runtime {
                return false;
            }
        }
        true
    }

    fn score(
        &self,
        agent: &RegisteredAgent,
        criteria: &SelectionCriteria,
        max_speed: f64,
        rotation_top: Option<&str>,
        recent: &[String],
    ) -> ScoreBreakdown {
        let caps = &agent.capabilities;
        let required_skill = skill_ratio(&criteria.required_skills, &caps.skills, 1.0);
        let preferred_skill = skill_ratio(&criteria.preferred_skills, &caps.skills, 0.0);
        let cost = (-caps.cost_per_hour / 10.0).exp();
        let reliability = caps.reliability;
        let load = 1.0 - agent.current_load;
        let speed = if max_speed > 0.0 {
            caps.avg_speed / max_speed
        } else {
            0.0
        };

        let total = match criteria.strategy {
            SelectionStrategy::SkillMatch => {
                let weighted = required_skill * 0.7 + preferred_skill * 0.3;
                if required_skill >= 1.0 {
                    weighted.max(0.9 + 0.1 * preferred_skill)
                } else {
                    weighted
                }
            }
            SelectionStrategy::CostOptimized => {
                cost * 0.6 + required_skill * 0.25 + preferred_skill * 0.15
            }
            SelectionStrategy::SpeedOptimized => speed * 0.5 + load * 0.25 + required_skill * 0.25,
            SelectionStrategy::ReliabilityOptimized => reliability * 0.7 + required_skill * 0.3,
            SelectionStrategy::LoadBalanced => {
                let mut total = load * 0.5 + required_skill * 0.3;
                if rotation_top == Some(agent.id.as_str()) {
                    total += 0.1;
                }
                if recent.iter().any(|id| id == &agent.id) {
                    total -= 0.15;
                }
                total.max(0.0)
            }
            SelectionStrategy::Balanced => {
                let skill = required_skill * 0.7 + preferred_skill * 0.3;
                skill * self.weights.skill
                    + cost * self.weights.cost
                    + reliability * self.weights.reliability
                    + load * self.weights.load
            }
        };

        ScoreBreakdown {
            required_skill,
            preferred_skill,
            cost,
            reliability,
            load,
            speed,
            total,
        }
    }
}

fn skill_ratio(wanted: &[String], declared: &[String], when_empty: f64) -> f64 {
    if wanted.is_empty() {
        return when_empty;
    }
    let matched = wanted
        .iter()
        .filter(|skill| declared.iter().any(|have| have == *skill))
        .count();
    matched as f64 / wanted.len() as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use flotilla_types::{AgentCapabilities, AgentConfig, AgentStatus};

    fn register(
        registry: &AgentRegistry,
        id: &str,
        skills: &[&str],
        cost: f64,
        reliability: f64,
        speed: f64,
        load: f64,
    ) {
        let config = AgentConfig {
            id: Some(id.to_string()),
            runtime: RuntimeKind::Local,
            capabilities: AgentCapabilities {
                skills: skills.iter().map(|s| s.to_string()).collect(),
                specialties: vec![],
                languages: vec![],
                cost_per_hour: cost,
                reliability,
                avg_speed: speed,
            },
        };
        let agent = RegisteredAgent::from_config(id.to_string(), &config).unwrap();
        registry.register(agent);
        registry.update_load(id, load);
    }

    fn selector(registry: Arc<AgentRegistry>) -> AgentSelector {
        AgentSelector::new(registry, SelectorWeights::default())
    }

    fn criteria(strategy: SelectionStrategy, required: &[&str]) -> SelectionCriteria {
        SelectionCriteria {
            required_skills: required.iter().map(|s| s.to_string()).collect(),
            strategy,
            ..SelectionCriteria::default()
        }
    }

    #[test]
    fn empty_registry_is_no_candidates() {
        let registry = Arc::new(AgentRegistry::new());
        let selector = selector(Arc::clone(&registry));
        let err = selector
            .select_agent(&criteria(SelectionStrategy::Balanced, &[]))
            .unwrap_err();
        assert_eq!(err, SelectionError::NoCandidates);
    }

    #[test]
    fn hard_constraints_disqualify_before_scoring() {
        let registry = Arc::new(AgentRegistry::new());
        register(&registry, "cheap", &["rust"], 1.0, 0.99, 10.0, 0.0);
        register(&registry, "skilled", &["rust", "sql"], 50.0, 0.99, 10.0, 0.0);
        let selector = selector(Arc::clone(&registry));

        // Only `skilled` declares sql, so cost cannot save `cheap`.
        let result = selector
            .select_agent(&criteria(SelectionStrategy::CostOptimized, &["sql"]))
            .unwrap();
        assert_eq!(result.agent.id, "skilled");
        assert_eq!(result.candidates_considered, 1);

        let err = selector
            .select_agent(&criteria(SelectionStrategy::Balanced, &["go"]))
            .unwrap_err();
        assert_eq!(err, SelectionError::NoMatchingAgents);
    }

    #[test]
    fn cost_optimized_prefers_cheaper_agents() {
        let registry = Arc::new(AgentRegistry::new());
        register(&registry, "cheap", &["rust"], 1.0, 0.9, 5.0, 0.0);
        register(&registry, "pricey", &["rust"], 40.0, 0.9, 5.0, 0.0);
        let selector = selector(Arc::clone(&registry));

        let result = selector
            .select_agent(&criteria(SelectionStrategy::CostOptimized, &["rust"]))
            .unwrap();
        assert_eq!(result.agent.id, "cheap");
    }

    #[test]
    fn speed_optimized_normalizes_to_fastest_candidate() {
        let registry = Arc::new(AgentRegistry::new());
        register(&registry, "slow", &[], 1.0, 0.9, 2.0, 0.0);
        register(&registry, "fast", &[], 1.0, 0.9, 8.0, 0.0);
        let selector = selector(Arc::clone(&registry));

        let ranked = selector
            .rank_agents(&criteria(SelectionStrategy::SpeedOptimized, &[]))
            .unwrap();
        assert_eq!(ranked[0].agent.id, "fast");
        assert_eq!(ranked[0].breakdown.speed, 1.0);
        assert_eq!(ranked[1].breakdown.speed, 0.25);
    }

    #[test]
    fn reliability_optimized_prefers_reliable_agents() {
        let registry = Arc::new(AgentRegistry::new());
        register(&registry, "flaky", &[], 1.0, 0.5, 5.0, 0.0);
        register(&registry, "solid", &[], 1.0, 0.99, 5.0, 0.0);
        let selector = selector(Arc::clone(&registry));

        let result = selector
            .select_agent(&criteria(SelectionStrategy::ReliabilityOptimized, &[]))
            .unwrap();
        assert_eq!(result.agent.id, "solid");
    }

    #[test]
    fn skill_match_floor_applies_on_perfect_required_match() {
        let registry = Arc::new(AgentRegistry::new());
        register(&registry, "a1", &["rust"], 1.0, 0.9, 5.0, 0.0);
        let selector = selector(Arc::clone(&registry));

        let result = selector
            .select_agent(&criteria(SelectionStrategy::SkillMatch, &["rust"]))
            .unwrap();
        // Perfect required match with no preferred skills floors at 0.9.
        assert!(result.score >= 0.9);
    }

    #[test]
    fn load_balanced_penalizes_recent_selection() {
        let registry = Arc::new(AgentRegistry::new());
        register(&registry, "a1", &[], 1.0, 0.9, 5.0, 0.2);
        register(&registry, "a2", &[], 1.0, 0.9, 5.0, 0.2);
        let selector = selector(Arc::clone(&registry));
        let c = criteria(SelectionStrategy::LoadBalanced, &[]);

        let first = selector.select_agent(&c).unwrap().agent.id;
        let second = selector.select_agent(&c).unwrap().agent.id;
        // The recently-selected penalty pushes the second pick elsewhere.
        assert_ne!(first, second);
    }

    #[test]
    fn select_multiple_enforces_counts() {
        let registry = Arc::new(AgentRegistry::new());
        register(&registry, "a1", &[], 1.0, 0.9, 5.0, 0.0);
        register(&registry, "a2", &[], 1.0, 0.9, 5.0, 0.0);
        let selector = selector(Arc::clone(&registry));
        let c = criteria(SelectionStrategy::Balanced, &[]);

        assert_eq!(
            selector.select_multiple_agents(&c, 0).unwrap_err(),
            SelectionError::InvalidCount(0)
        );
        assert_eq!(selector.select_multiple_agents(&c, 2).unwrap().len(), 2);
        assert_eq!(
            selector.select_multiple_agents(&c, 3).unwrap_err(),
            SelectionError::InsufficientAgents {
                required: 3,
                available: 2
            }
        );
    }

    #[test]
    fn unhealthy_agents_are_excluded() {
        let registry = Arc::new(AgentRegistry::new());
        register(&registry, "a1", &[], 1.0, 0.9, 5.0, 0.0);
        registry.update_status("a1", AgentStatus::Unhealthy);
        let selector = selector(Arc::clone(&registry));

        let err = selector
            .select_agent(&criteria(SelectionStrategy::Balanced, &[]))
            .unwrap_err();
        assert_eq!(err, SelectionError::NoCandidates);
    }

    #[test]
    fn strategy_parsing() {
        assert_eq!(
            "cost-optimized".parse::<SelectionStrategy>().unwrap(),
            SelectionStrategy::CostOptimized
        );
        assert!(matches!(
            "fastest".parse::<SelectionStrategy>(),
            Err(SelectionError::InvalidStrategy(_))
        ));
    }
}
