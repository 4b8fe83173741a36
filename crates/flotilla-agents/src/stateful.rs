//! The stateful registry: one persistent state machine per registered
//! agent, plus the work-assignment operations the execution layers call.

use std::sync::Arc;

use dashmap::DashMap;
use serde_json::json;
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

use flotilla_bus::{EventBus, PublishOptions};
use flotilla_store::StateStorage;
use flotilla_types::{
    AgentConfig, AgentState, AgentStatus, PersistConfig, RegisteredAgent, StateConfig, StateEntry,
    Task,
};

use crate::machine::{AgentStats, NoHooks, StateObserver, TransitionHooks};
use crate::persistent::PersistentStateMachine;
use crate::registry::AgentRegistry;
use crate::AgentError;

/// Registry status an internal machine state maps to, if any.
fn status_for(state: AgentState) -> Option<AgentStatus> {
    match state {
        AgentState::Idle => Some(AgentStatus::Idle),
        AgentState::Busy => Some(AgentStatus::Busy),
        AgentState::Error => Some(AgentStatus::Unhealthy),
        AgentState::Paused | AgentState::Stopping | AgentState::Stopped => {
            Some(AgentStatus::Offline)
        }
        AgentState::Created | AgentState::Initializing => None,
    }
}

/// Mirrors machine states into registry statuses through the narrow
/// observer seam, keeping ownership unidirectional.
struct StatusMirror {
    registry: Arc<AgentRegistry>,
}

impl StateObserver for StatusMirror {
    fn state_changed(&self, agent_id: &str, _from: AgentState, to: AgentState) {
        if let Some(status) = status_for(to) {
            self.registry.update_status(agent_id, status);
        }
    }
}

/// Binds an [`AgentRegistry`] to one [`PersistentStateMachine`] per agent.
pub struct StatefulAgentRegistry {
    registry: Arc<AgentRegistry>,
    machines: DashMap<String, Arc<Mutex<PersistentStateMachine>>>,
    bus: EventBus,
    storage: Arc<dyn StateStorage>,
    state_config: StateConfig,
    persist_config: PersistConfig,
    hooks: Arc<dyn TransitionHooks>,
}

impl StatefulAgentRegistry {
    /// Create a stateful registry over the given directory and storage.
    pub fn new(
        registry: Arc<AgentRegistry>,
        bus: EventBus,
        storage: Arc<dyn StateStorage>,
        state_config: StateConfig,
        persist_config: PersistConfig,
    ) -> Self {
        Self {
            registry,
            machines: DashMap::new(),
            bus,
            storage,
            state_config,
            persist_config,
            hooks: Arc::new(NoHooks),
        }
    }

    /// Install transition hooks applied to every machine created from now
    /// on (e.g. load-balancer success accounting).
    pub fn with_hooks(mut self, hooks: Arc<dyn TransitionHooks>) -> Self {
        self.hooks = hooks;
        self
    }

    /// The underlying directory.
    pub fn registry(&self) -> &Arc<AgentRegistry> {
        &self.registry
    }

    fn machine(
        &self,
        agent_id: &str,
    ) -> Result<Arc<Mutex<PersistentStateMachine>>, AgentError> {
        self.machines
            .get(agent_id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| AgentError::UnknownAgent(agent_id.to_string()))
    }

    async fn publish_lifecycle(
        &self,
        event_type: &str,
        agent_id: &str,
        previous: Option<AgentState>,
        extra: Option<serde_json::Value>,
    ) {
        let mut payload = json!({
            "agentId": agent_id,
            "previousState": previous.map(|s| s.as_str()),
        });
        if let (Some(object), Some(serde_json::Value::Object(extra))) =
            (payload.as_object_mut(), extra)
        {
            object.extend(extra);
        }
        if let Err(error) = self
            .bus
            .publish(event_type, payload, PublishOptions::from_source(agent_id))
            .await
        {
            warn!(agent_id, %error, event_type, "failed to publish lifecycle event");
        }
    }

    //───────────── registration ─────────────

    /// Register an agent and auto-drive its machine
    /// `created -> initializing -> idle`.
    ///
    /// When storage holds a non-terminal snapshot for the id, the machine
    /// resumes from it instead of bootstrapping.
    pub async fn register(&self, config: AgentConfig) -> Result<RegisteredAgent, AgentError> {
        let agent_id = config
            .id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let agent = RegisteredAgent::from_config(agent_id.clone(), &config)?;
        self.registry.register(agent);

        let mut machine = PersistentStateMachine::load_or_new(
            agent_id.clone(),
            self.bus.clone(),
            Arc::clone(&self.storage),
            self.state_config,
            self.persist_config,
            Arc::clone(&self.hooks),
        )
        .await?;
        machine.add_observer(Arc::new(StatusMirror {
            registry: Arc::clone(&self.registry),
        }));

        if machine.state() == AgentState::Created {
            machine
                .transition(AgentState::Initializing, Some("bootstrap".into()))
                .await?;
            machine.transition(AgentState::Idle, None).await?;
        } else if let Some(status) = status_for(machine.state()) {
            // Restored machines re-enter with whatever state they saved.
            self.registry.update_status(&agent_id, status);
        }

        if machine.state() == AgentState::Idle {
            self.publish_lifecycle("agent.idle", &agent_id, None, None)
                .await;
        }

        info!(agent_id, state = %machine.state(), "agent registered");
        self.machines
            .insert(agent_id.clone(), Arc::new(Mutex::new(machine)));
        self.registry
            .get(&agent_id)
            .ok_or(AgentError::UnknownAgent(agent_id))
    }

    //───────────── work assignment ─────────────

    /// Assign a task: refuses when already busy, otherwise attempts the
    /// guarded `idle -> busy` move. Returns whether the guard permitted it.
    pub async fn assign_work(&self, agent_id: &str, task: &Task) -> Result<bool, AgentError> {
        let machine = self.machine(agent_id)?;
        let mut m = machine.lock().await;
        if m.state() == AgentState::Busy {
            return Ok(false);
        }
        m.set_task(task.clone());
        let granted = m
            .transition(AgentState::Busy, Some(format!("assigned task {}", task.id)))
            .await?;
        if granted {
            let load = task.effective_weight().clamp(0.0, 1.0);
            m.set_load(load);
            self.registry.update_load(agent_id, load);
            self.publish_lifecycle(
                "agent.busy",
                agent_id,
                Some(AgentState::Idle),
                Some(json!({ "taskId": task.id })),
            )
            .await;
        } else {
            m.clear_task();
        }
        Ok(granted)
    }

    /// Complete the current task: `busy -> idle`, zero load.
    pub async fn complete_work(
        &self,
        agent_id: &str,
        result: serde_json::Value,
    ) -> Result<(), AgentError> {
        let machine = self.machine(agent_id)?;
        let mut m = machine.lock().await;
        m.transition(AgentState::Idle, Some("work complete".into()))
            .await?;
        m.clear_task();
        m.set_load(0.0);
        self.registry.update_load(agent_id, 0.0);
        self.publish_lifecycle(
            "agent.idle",
            agent_id,
            Some(AgentState::Busy),
            Some(json!({ "result": result })),
        )
        .await;
        Ok(())
    }

    /// Fail the current task: record the error, `busy -> error`, zero load.
    pub async fn fail_work(&self, agent_id: &str, error: &str) -> Result<(), AgentError> {
        let machine = self.machine(agent_id)?;
        let mut m = machine.lock().await;
        m.set_last_error(error);
        m.transition(AgentState::Error, Some(error.to_string()))
            .await?;
        m.clear_task();
        m.set_load(0.0);
        self.registry.update_load(agent_id, 0.0);
        self.publish_lifecycle(
            "agent.error",
            agent_id,
            Some(AgentState::Busy),
            Some(json!({ "error": error })),
        )
        .await;
        Ok(())
    }

    //───────────── lifecycle control ─────────────

    /// Pause an idle agent, or a busy one whose task is checkpointable.
    pub async fn pause_agent(&self, agent_id: &str) -> Result<bool, AgentError> {
        let machine = self.machine(agent_id)?;
        let mut m = machine.lock().await;
        m.transition(AgentState::Paused, Some("pause requested".into()))
            .await
    }

    /// Resume a paused agent: back to busy when work is pending, idle
    /// otherwise.
    pub async fn resume_agent(&self, agent_id: &str) -> Result<bool, AgentError> {
        let machine = self.machine(agent_id)?;
        let mut m = machine.lock().await;
        let target = if m.context().pending_work {
            AgentState::Busy
        } else {
            AgentState::Idle
        };
        let resumed = m
            .transition(target, Some("resume requested".into()))
            .await?;
        if resumed && target == AgentState::Idle {
            self.publish_lifecycle("agent.idle", agent_id, Some(AgentState::Paused), None)
                .await;
        }
        Ok(resumed)
    }

    /// Stop an agent and discard it.
    ///
    /// Graceful stops of a busy agent are guarded by the task's ability to
    /// save progress; a denial returns `Ok(false)` and leaves the agent
    /// running. On success the machine is discarded, its persisted state
    /// deleted, and the registry entry removed.
    pub async fn stop_agent(&self, agent_id: &str, force: bool) -> Result<bool, AgentError> {
        let machine = self.machine(agent_id)?;
        {
            let mut m = machine.lock().await;
            loop {
                match m.state() {
                    AgentState::Stopped => break,
                    AgentState::Stopping => {
                        m.transition(AgentState::Stopped, None).await?;
                    }
                    AgentState::Idle | AgentState::Paused | AgentState::Error => {
                        m.transition(AgentState::Stopping, Some("stop requested".into()))
                            .await?;
                    }
                    AgentState::Busy => {
                        if force {
                            m.force_transition(AgentState::Stopping, Some("forced stop".into()))
                                .await?;
                        } else {
                            let granted = m
                                .transition(AgentState::Stopping, Some("graceful stop".into()))
                                .await?;
                            if !granted {
                                return Ok(false);
                            }
                            // Checkpoint hand-off is the executor's concern;
                            // give in-flight work one scheduling point.
                            tokio::task::yield_now().await;
                        }
                    }
                    AgentState::Created => {
                        m.transition(AgentState::Initializing, None).await?;
                    }
                    AgentState::Initializing => {
                        m.transition(AgentState::Idle, None).await?;
                    }
                }
            }
            m.delete_persisted().await?;
        }
        self.machines.remove(agent_id);
        self.registry.unregister(agent_id);
        info!(agent_id, force, "agent stopped and unregistered");
        Ok(true)
    }

    /// Recover an errored agent: `error -> initializing -> idle`, gated by
    /// the error retry limit.
    pub async fn recover_agent(&self, agent_id: &str) -> Result<bool, AgentError> {
        let machine = self.machine(agent_id)?;
        let mut m = machine.lock().await;
        let recovered = m
            .transition(AgentState::Initializing, Some("recovery".into()))
            .await?;
        if !recovered {
            return Ok(false);
        }
        m.transition(AgentState::Idle, None).await?;
        self.publish_lifecycle("agent.idle", agent_id, Some(AgentState::Error), None)
            .await;
        Ok(true)
    }

    /// Flag queued work for an agent, read by the resume guard.
    pub async fn set_pending_work(&self, agent_id: &str, pending: bool) -> Result<(), AgentError> {
        let machine = self.machine(agent_id)?;
        machine.lock().await.set_pending_work(pending);
        Ok(())
    }

    //───────────── queries ─────────────

    /// Current machine state of an agent.
    pub async fn get_agent_state(&self, agent_id: &str) -> Result<AgentState, AgentError> {
        let machine = self.machine(agent_id)?;
        let m = machine.lock().await;
        Ok(m.state())
    }

    /// Full transition log of an agent.
    pub async fn get_agent_state_history(
        &self,
        agent_id: &str,
    ) -> Result<Vec<StateEntry>, AgentError> {
        let machine = self.machine(agent_id)?;
        let m = machine.lock().await;
        Ok(m.history().to_vec())
    }

    /// Ids of agents currently in the given state.
    pub async fn get_agents_in_state(&self, state: AgentState) -> Vec<String> {
        let handles: Vec<(String, Arc<Mutex<PersistentStateMachine>>)> = self
            .machines
            .iter()
            .map(|entry| (entry.key().clone(), Arc::clone(entry.value())))
            .collect();
        let mut ids = Vec::new();
        for (id, machine) in handles {
            if machine.lock().await.state() == state {
                ids.push(id);
            }
        }
        ids.sort();
        ids
    }

    /// Aggregate statistics for one agent.
    pub async fn get_agent_stats(&self, agent_id: &str) -> Result<AgentStats, AgentError> {
        let machine = self.machine(agent_id)?;
        let m = machine.lock().await;
        Ok(m.stats())
    }

    /// Number of agents with live machines.
    pub fn len(&self) -> usize {
        self.machines.len()
    }

    /// Whether no agents are registered.
    pub fn is_empty(&self) -> bool {
        self.machines.is_empty()
    }
}
