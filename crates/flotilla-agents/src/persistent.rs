//! Debounced persistence wrapper around [`AgentStateMachine`].
//!
//! Every committed transition schedules a snapshot write; writes within the
//! debounce window coalesce into one. `save_now` flushes immediately and
//! `delete_persisted` wipes the stored snapshot when an agent is discarded.

use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, warn};

use flotilla_bus::EventBus;
use flotilla_store::StateStorage;
use flotilla_types::{AgentState, PersistConfig, SavedState, StateConfig, StateEntry};

use crate::machine::{AgentStateMachine, AgentStats, MachineContext, StateObserver, TransitionHooks};
use crate::AgentError;

/// An [`AgentStateMachine`] whose state survives restarts.
pub struct PersistentStateMachine {
    inner: AgentStateMachine,
    storage: Arc<dyn StateStorage>,
    debounce: Duration,
    pending: Arc<StdMutex<Option<SavedState>>>,
    saver: Option<JoinHandle<()>>,
}

impl PersistentStateMachine {
    /// Create a machine, restoring state and history from storage when a
    /// non-terminal snapshot exists.
    pub async fn load_or_new(
        agent_id: impl Into<String>,
        bus: EventBus,
        storage: Arc<dyn StateStorage>,
        state_config: StateConfig,
        persist_config: PersistConfig,
        hooks: Arc<dyn TransitionHooks>,
    ) -> Result<Self, AgentError> {
        let agent_id = agent_id.into();
        let mut inner = AgentStateMachine::new(agent_id.clone(), bus, state_config).with_hooks(hooks);

        match storage.load(&agent_id).await {
            Ok(Some(saved)) if !saved.state.is_terminal() => {
                debug!(agent_id, state = %saved.state, "restored persisted agent state");
                inner.restore(saved);
            }
            Ok(_) => {}
            Err(source) => {
                return Err(AgentError::Persistence { agent_id, source });
            }
        }

        Ok(Self {
            inner,
            storage,
            debounce: Duration::from_millis(persist_config.save_debounce_ms),
            pending: Arc::new(StdMutex::new(None)),
            saver: None,
        })
    }

    /// Attempt a guarded transition; schedules a debounced save on commit.
    pub async fn transition(
        &mut self,
        to: AgentState,
        reason: Option<String>,
    ) -> Result<bool, AgentError> {
        let committed = self.inner.transition(to, reason).await?;
        if committed {
            self.schedule_save();
        }
        Ok(committed)
    }

    /// Guard-skipping transition used by forced shutdown.
    pub async fn force_transition(
        &mut self,
        to: AgentState,
        reason: Option<String>,
    ) -> Result<bool, AgentError> {
        let committed = self.inner.force_transition(to, reason).await?;
        if committed {
            self.schedule_save();
        }
        Ok(committed)
    }

    fn schedule_save(&mut self) {
        let snapshot = self.inner.snapshot();
        {
            let mut pending = self
                .pending
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            *pending = Some(snapshot);
        }
        if let Some(handle) = self.saver.take() {
            handle.abort();
        }
        let pending = Arc::clone(&self.pending);
        let storage = Arc::clone(&self.storage);
        let agent_id = self.inner.agent_id().to_string();
        let debounce = self.debounce;
        self.saver = Some(tokio::spawn(async move {
            tokio::time::sleep(debounce).await;
            let snapshot = pending
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .take();
            if let Some(snapshot) = snapshot {
                if let Err(error) = storage.save(&agent_id, &snapshot).await {
                    warn!(agent_id, %error, "debounced state save failed");
                }
            }
        }));
    }

    /// Flush the current state to storage immediately.
    pub async fn save_now(&mut self) -> Result<(), AgentError> {
        if let Some(handle) = self.saver.take() {
            handle.abort();
        }
        let snapshot = {
            let mut pending = self
                .pending
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            pending.take()
        }
        .unwrap_or_else(|| self.inner.snapshot());
        self.storage
            .save(self.inner.agent_id(), &snapshot)
            .await
            .map_err(|source| AgentError::Persistence {
                agent_id: self.inner.agent_id().to_string(),
                source,
            })
    }

    /// Remove the persisted snapshot and cancel any pending save.
    pub async fn delete_persisted(&mut self) -> Result<(), AgentError> {
        if let Some(handle) = self.saver.take() {
            handle.abort();
        }
        let _ = self
            .pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        self.storage
            .delete(self.inner.agent_id())
            .await
            .map_err(|source| AgentError::Persistence {
                agent_id: self.inner.agent_id().to_string(),
                source,
            })
    }

    //───────────── delegation ─────────────

    /// The owning agent's id.
    pub fn agent_id(&self) -> &str {
        self.inner.agent_id()
    }

    /// Current state.
    pub fn state(&self) -> AgentState {
        self.inner.state()
    }

    /// Borrow the context.
    pub fn context(&self) -> &MachineContext {
        self.inner.context()
    }

    /// The committed transition log.
    pub fn history(&self) -> &[StateEntry] {
        self.inner.history()
    }

    /// Aggregate statistics over the state log.
    pub fn stats(&self) -> AgentStats {
        self.inner.stats()
    }

    /// Register a commit observer on the wrapped machine.
    pub fn add_observer(&mut self, observer: Arc<dyn StateObserver>) {
        self.inner.add_observer(observer);
    }

    /// Assign the task guards and actions read.
    pub fn set_task(&mut self, task: flotilla_types::Task) {
        self.inner.set_task(task);
    }

    /// Clear the assigned task.
    pub fn clear_task(&mut self) {
        self.inner.clear_task();
    }

    /// Set the context load.
    pub fn set_load(&mut self, load: f64) {
        self.inner.set_load(load);
    }

    /// Flag queued work for the resume guard.
    pub fn set_pending_work(&mut self, pending: bool) {
        self.inner.set_pending_work(pending);
    }

    /// Record the most recent failure description.
    pub fn set_last_error(&mut self, error: impl Into<String>) {
        self.inner.set_last_error(error);
    }
}

impl Drop for PersistentStateMachine {
    fn drop(&mut self) {
        if let Some(handle) = self.saver.take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flotilla_store::MemoryStateStorage;
    use flotilla_types::BusConfig;
    use crate::machine::NoHooks;

    fn bus() -> EventBus {
        EventBus::new(BusConfig {
            max_history_size: 64,
        })
    }

    async fn new_machine(storage: Arc<dyn StateStorage>) -> PersistentStateMachine {
        PersistentStateMachine::load_or_new(
            "a1",
            bus(),
            storage,
            StateConfig::default(),
            PersistConfig {
                save_debounce_ms: 5,
            },
            Arc::new(NoHooks),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn debounced_save_persists_latest_state() {
        let storage: Arc<dyn StateStorage> = Arc::new(MemoryStateStorage::new());
        let mut machine = new_machine(Arc::clone(&storage)).await;

        machine.transition(AgentState::Initializing, None).await.unwrap();
        machine.transition(AgentState::Idle, None).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let saved = storage.load("a1").await.unwrap().unwrap();
        // Both transitions coalesced into one save of the latest state.
        assert_eq!(saved.state, AgentState::Idle);
        assert_eq!(saved.history.len(), 2);
    }

    #[tokio::test]
    async fn save_now_flushes_immediately() {
        let storage: Arc<dyn StateStorage> = Arc::new(MemoryStateStorage::new());
        let mut machine = new_machine(Arc::clone(&storage)).await;
        machine.transition(AgentState::Initializing, None).await.unwrap();
        machine.save_now().await.unwrap();
        let saved = storage.load("a1").await.unwrap().unwrap();
        assert_eq!(saved.state, AgentState::Initializing);
    }

    #[tokio::test]
    async fn restores_non_terminal_state() {
        let storage: Arc<dyn StateStorage> = Arc::new(MemoryStateStorage::new());
        {
            let mut machine = new_machine(Arc::clone(&storage)).await;
            machine.transition(AgentState::Initializing, None).await.unwrap();
            machine.transition(AgentState::Idle, None).await.unwrap();
            machine.save_now().await.unwrap();
        }
        let machine = new_machine(Arc::clone(&storage)).await;
        assert_eq!(machine.state(), AgentState::Idle);
        assert_eq!(machine.history().len(), 2);
    }

    #[tokio::test]
    async fn terminal_snapshots_are_not_restored() {
        let storage: Arc<dyn StateStorage> = Arc::new(MemoryStateStorage::new());
        {
            let mut machine = new_machine(Arc::clone(&storage)).await;
            machine.transition(AgentState::Initializing, None).await.unwrap();
            machine.transition(AgentState::Idle, None).await.unwrap();
            machine.transition(AgentState::Stopping, None).await.unwrap();
            machine.transition(AgentState::Stopped, None).await.unwrap();
            machine.save_now().await.unwrap();
        }
        let machine = new_machine(Arc::clone(&storage)).await;
        assert_eq!(machine.state(), AgentState::Created);
    }

    #[tokio::test]
    async fn delete_persisted_wipes_storage() {
        let storage: Arc<dyn StateStorage> = Arc::new(MemoryStateStorage::new());
        let mut machine = new_machine(Arc::clone(&storage)).await;
        machine.transition(AgentState::Initializing, None).await.unwrap();
        machine.save_now().await.unwrap();
        machine.delete_persisted().await.unwrap();
        assert!(storage.load("a1").await.unwrap().is_none());
    }
}
