#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **flotilla-runtime** – Wiring for the Flotilla orchestration engine.
//!
//! The [`Orchestrator`] is the context struct binding every subsystem
//! (event bus, buffered event store, agent registry and state machines,
//! selector, load balancer, execution engine, workflow engine, and quota
//! admission) as explicit dependencies. Nothing here is a process-wide
//! singleton: tests build as many isolated orchestrators as they like via
//! [`OrchestratorBuilder`].
//!
//! The [`RegistryDispatch`] adaptor implements the execution layers'
//! [`AgentDispatch`] seam: quota admission, selector scoring, and the
//! stateful registry's `assign_work`/`complete_work`/`fail_work` lifecycle
//! all hang off one `acquire`/`release` pair.

use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use flotilla_agents::{AgentRegistry, StatefulAgentRegistry, TransitionHooks};
use flotilla_bus::EventBus;
use flotilla_exec::{
    AgentDispatch, ExecutionEngine, ExecutionTracker, TaskExecutor, TaskOutcome,
};
use flotilla_graph::{DependencyResolver, ResolveOptions, Resolution};
use flotilla_quota::{Principal, QuotaManager};
use flotilla_routing::{AgentSelector, LoadBalancer, SelectionCriteria, SelectionStrategy};
use flotilla_store::{
    BufferedEventStore, EventStoreBackend, MemoryEventStore, MemoryStateStorage, StateStorage,
};
use flotilla_types::{RuntimeConfig, Task, TaskWithDependencies};
use flotilla_workflow::WorkflowEngine;

//─────────────────────────────
//  Balancer hooks
//─────────────────────────────

/// Mirrors per-agent work outcomes into the load balancer's circuit
/// breakers, for agents mapped to a cluster.
struct BalancerHooks {
    balancer: Arc<LoadBalancer>,
    agent_clusters: Arc<DashMap<String, String>>,
}

#[async_trait]
impl TransitionHooks for BalancerHooks {
    async fn work_completed(&self, agent_id: &str, _task: Option<&Task>) -> Result<()> {
        if let Some(cluster) = self.agent_clusters.get(agent_id) {
            self.balancer.record_success(cluster.value());
        }
        Ok(())
    }

    async fn work_failed(&self, agent_id: &str, _error: Option<&str>) -> Result<()> {
        if let Some(cluster) = self.agent_clusters.get(agent_id) {
            self.balancer.record_failure(cluster.value());
        }
        Ok(())
    }
}

//─────────────────────────────
//  Registry dispatch
//─────────────────────────────

/// Binds quota admission, agent selection, and the stateful registry
/// behind the engines' [`AgentDispatch`] seam.
pub struct RegistryDispatch {
    agents: Arc<StatefulAgentRegistry>,
    selector: Arc<AgentSelector>,
    quotas: Option<Arc<QuotaManager>>,
    principal: Option<Principal>,
    strategy: SelectionStrategy,
}

impl RegistryDispatch {
    /// Create a dispatch without quota enforcement.
    pub fn new(agents: Arc<StatefulAgentRegistry>, selector: Arc<AgentSelector>) -> Self {
        Self {
            agents,
            selector,
            quotas: None,
            principal: None,
            strategy: SelectionStrategy::Balanced,
        }
    }

    /// Enforce quotas for the given principal on every acquire.
    pub fn with_quotas(mut self, quotas: Arc<QuotaManager>, principal: Principal) -> Self {
        self.quotas = Some(quotas);
        self.principal = Some(principal);
        self
    }

    /// Use a specific selection strategy instead of `balanced`.
    pub fn with_strategy(mut self, strategy: SelectionStrategy) -> Self {
        self.strategy = strategy;
        self
    }
}

#[async_trait]
impl AgentDispatch for RegistryDispatch {
    async fn acquire(&self, task: &Task) -> Result<String> {
        if let (Some(quotas), Some(principal)) = (&self.quotas, &self.principal) {
            let decision = quotas.can_allocate(principal, 1, &task.id).await;
            if !decision.allowed {
                bail!(
                    "quota denied for task {}: {}",
                    task.id,
                    decision.reason.unwrap_or_else(|| "no reason".to_string())
                );
            }
        }

        let criteria = SelectionCriteria {
            required_skills: task.required_skills.iter().cloned().collect(),
            strategy: self.strategy,
            ..SelectionCriteria::default()
        };
        let ranked = self
            .selector
            .rank_agents(&criteria)
            .map_err(|e| anyhow!(e))?;

        // The top-scored agent may refuse (already busy, guard denial);
        // fall through the ranking until one accepts.
        for candidate in ranked {
            if self.agents.assign_work(&candidate.agent.id, task).await? {
                if let (Some(quotas), Some(principal)) = (&self.quotas, &self.principal) {
                    quotas.allocate(principal, 1);
                }
                debug!(task_id = %task.id, agent_id = %candidate.agent.id, "acquired agent");
                return Ok(candidate.agent.id);
            }
        }
        bail!("no agent accepted task {}", task.id)
    }

    async fn release(&self, agent_id: &str, _task: &Task, outcome: &TaskOutcome) -> Result<()> {
        match outcome {
            TaskOutcome::Success(result) => {
                self.agents.complete_work(agent_id, result.clone()).await?;
            }
            TaskOutcome::Failure(error) => {
                self.agents.fail_work(agent_id, error).await?;
                // Self-heal within the recovery guard so transient executor
                // failures do not permanently drain the fleet.
                match self.agents.recover_agent(agent_id).await {
                    Ok(true) => debug!(agent_id, "agent recovered after failure"),
                    Ok(false) => warn!(agent_id, "agent exhausted its recovery budget"),
                    Err(error) => warn!(agent_id, %error, "agent recovery failed"),
                }
            }
        }
        if let (Some(quotas), Some(principal)) = (&self.quotas, &self.principal) {
            quotas.release(principal, 1);
        }
        Ok(())
    }
}

//─────────────────────────────
//  Orchestrator
//─────────────────────────────

/// The orchestration context: every subsystem as an explicit dependency.
pub struct Orchestrator {
    config: RuntimeConfig,
    bus: EventBus,
    store: Arc<BufferedEventStore>,
    registry: Arc<AgentRegistry>,
    agents: Arc<StatefulAgentRegistry>,
    selector: Arc<AgentSelector>,
    balancer: Arc<LoadBalancer>,
    quotas: Arc<QuotaManager>,
    executor: Arc<dyn TaskExecutor>,
    dispatch: Arc<RegistryDispatch>,
    workflows: WorkflowEngine,
    agent_clusters: Arc<DashMap<String, String>>,
    forwarder: JoinHandle<()>,
}

impl Orchestrator {
    /// Start building an orchestrator.
    pub fn builder() -> OrchestratorBuilder {
        OrchestratorBuilder::default()
    }

    /// The shared event bus.
    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// The buffered event store; every bus event is forwarded into it.
    pub fn store(&self) -> &Arc<BufferedEventStore> {
        &self.store
    }

    /// The agent directory.
    pub fn registry(&self) -> &Arc<AgentRegistry> {
        &self.registry
    }

    /// The stateful agent registry.
    pub fn agents(&self) -> &Arc<StatefulAgentRegistry> {
        &self.agents
    }

    /// The agent selector.
    pub fn selector(&self) -> &Arc<AgentSelector> {
        &self.selector
    }

    /// The multi-cluster load balancer.
    pub fn balancer(&self) -> &Arc<LoadBalancer> {
        &self.balancer
    }

    /// The quota admission gate.
    pub fn quotas(&self) -> &Arc<QuotaManager> {
        &self.quotas
    }

    /// The workflow engine.
    pub fn workflows(&self) -> &WorkflowEngine {
        &self.workflows
    }

    /// The dispatch seam engines use to acquire and release agents.
    pub fn dispatch(&self) -> Arc<RegistryDispatch> {
        Arc::clone(&self.dispatch)
    }

    /// The effective configuration.
    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Map an agent onto a cluster so its work outcomes feed that
    /// cluster's circuit breaker.
    pub fn assign_agent_to_cluster(&self, agent_id: &str, cluster_id: &str) {
        self.agent_clusters
            .insert(agent_id.to_string(), cluster_id.to_string());
    }

    /// Validate a task graph and produce an execution plan.
    pub fn resolve(
        &self,
        tasks: &[TaskWithDependencies],
        max_levels: Option<usize>,
    ) -> Resolution {
        let mut resolver = DependencyResolver::new();
        resolver.resolve(tasks, &ResolveOptions { max_levels })
    }

    /// A fresh execution engine over this orchestrator's seams. Engines
    /// are per-run so cancellation stays scoped.
    pub fn execution_engine(&self) -> ExecutionEngine {
        ExecutionEngine::new(
            self.dispatch(),
            Arc::clone(&self.executor),
            self.bus.clone(),
            self.config.exec,
        )
    }

    /// A tracker attached to this orchestrator's bus.
    pub fn tracker(&self, enable_eta: bool) -> ExecutionTracker {
        ExecutionTracker::attach(self.bus.clone(), enable_eta)
    }

    /// Flush the store and stop the event forwarder.
    pub async fn shutdown(self) -> Result<()> {
        // Give the forwarder a moment to drain the tap before closing.
        tokio::task::yield_now().await;
        self.forwarder.abort();
        self.store.close().await.context("closing event store")?;
        info!("orchestrator shut down");
        Ok(())
    }
}

//─────────────────────────────
//  Builder
//─────────────────────────────

/// Builds an [`Orchestrator`] from explicit parts; memory-backed storage
/// by default so tests need only supply an executor.
#[derive(Default)]
pub struct OrchestratorBuilder {
    config: Option<RuntimeConfig>,
    event_backend: Option<Arc<dyn EventStoreBackend>>,
    state_storage: Option<Arc<dyn StateStorage>>,
    executor: Option<Arc<dyn TaskExecutor>>,
    principal: Option<Principal>,
}

impl OrchestratorBuilder {
    /// Override the configuration.
    pub fn with_config(mut self, config: RuntimeConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Use a specific event store backend (memory by default).
    pub fn with_event_backend(mut self, backend: Arc<dyn EventStoreBackend>) -> Self {
        self.event_backend = Some(backend);
        self
    }

    /// Use a specific agent state storage (memory by default).
    pub fn with_state_storage(mut self, storage: Arc<dyn StateStorage>) -> Self {
        self.state_storage = Some(storage);
        self
    }

    /// The task executor adaptor; required.
    pub fn with_task_executor(mut self, executor: Arc<dyn TaskExecutor>) -> Self {
        self.executor = Some(executor);
        self
    }

    /// Enforce quotas for this principal on every agent acquisition.
    pub fn with_principal(mut self, principal: Principal) -> Self {
        self.principal = Some(principal);
        self
    }

    /// Wire everything together.
    pub fn build(self) -> Result<Orchestrator> {
        let config = self.config.unwrap_or_default();
        let executor = self
            .executor
            .ok_or_else(|| anyhow!("a task executor is required"))?;
        let bus = EventBus::new(config.bus);
        let backend = self
            .event_backend
            .unwrap_or_else(|| Arc::new(MemoryEventStore::new()));
        let store = Arc::new(BufferedEventStore::new(
            backend,
            config.store,
            Some(bus.clone()),
        ));
        let state_storage = self
            .state_storage
            .unwrap_or_else(|| Arc::new(MemoryStateStorage::new()));

        let registry = Arc::new(AgentRegistry::new());
        let balancer = Arc::new(LoadBalancer::new(config.lb));
        let agent_clusters: Arc<DashMap<String, String>> = Arc::new(DashMap::new());
        let hooks = Arc::new(BalancerHooks {
            balancer: Arc::clone(&balancer),
            agent_clusters: Arc::clone(&agent_clusters),
        });
        let agents = Arc::new(
            StatefulAgentRegistry::new(
                Arc::clone(&registry),
                bus.clone(),
                state_storage,
                config.state,
                config.persist,
            )
            .with_hooks(hooks),
        );
        let selector = Arc::new(AgentSelector::new(Arc::clone(&registry), config.selector));
        let quotas = Arc::new(QuotaManager::new(bus.clone()));

        let mut dispatch = RegistryDispatch::new(Arc::clone(&agents), Arc::clone(&selector));
        if let Some(principal) = self.principal {
            dispatch = dispatch.with_quotas(Arc::clone(&quotas), principal);
        }
        let dispatch = Arc::new(dispatch);

        let workflow_dispatch: Arc<dyn AgentDispatch> = dispatch.clone();
        let workflows = WorkflowEngine::new(
            bus.clone(),
            workflow_dispatch,
            Arc::clone(&executor),
            config.workflow,
        );

        // Every published event is also appended to the durable log.
        let forwarder = {
            let mut tap = bus.tap();
            let store = Arc::clone(&store);
            tokio::spawn(async move {
                loop {
                    match tap.recv().await {
                        Ok(event) => {
                            if let Err(error) = store.append(event).await {
                                warn!(%error, "event forwarding to the store failed");
                            }
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                            warn!(missed, "event forwarder lagged; events missed in the store");
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    }
                }
            })
        };

        info!("orchestrator assembled");
        Ok(Orchestrator {
            config,
            bus,
            store,
            registry,
            agents,
            selector,
            balancer,
            quotas,
            executor,
            dispatch,
            workflows,
            agent_clusters,
            forwarder,
        })
    }
}
