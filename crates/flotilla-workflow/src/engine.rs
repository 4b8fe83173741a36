//! The workflow interpreter.
//!
//! Each started instance gets a driver task owning a ready-queue. Task,
//! delay, and sub-workflow nodes run as spawned futures bounded by the
//! engine-wide node semaphore; condition and merge nodes resolve inline;
//! parallel nodes enqueue their branches and wait on a policy over branch
//! settlement. After every settlement the driver evaluates outgoing edges
//! (or the condition's chosen branch), defers merges until their taken
//! parents are quiet, and re-checks parallel waiters and instance
//! completion.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use serde_json::{json, Map, Value};
use tokio::sync::{mpsc, Notify, RwLock, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use flotilla_bus::{EventBus, PublishOptions};
use flotilla_exec::{AgentDispatch, TaskExecutor, TaskOutcome};
use flotilla_types::{RetryBackoff, Task, WorkflowEngineConfig};

use crate::definition::{
    MergeStrategy, NodeKind, TaskNodeConfig, WaitMode, WaitPolicy, Workflow,
};
use crate::instance::{InstanceStatus, NodeState, WorkflowInstance};
use crate::substitution::{
    evaluate_condition, lookup_path, reduce_values, substitute_value,
};
use crate::{FailurePolicy, WorkflowError};

/// Poll period while awaiting a sub-workflow.
const SUB_WORKFLOW_POLL: Duration = Duration::from_millis(50);

//─────────────────────────────
//  Engine surface
//─────────────────────────────

struct InstanceControl {
    cancel: CancellationToken,
    nudge: Arc<Notify>,
}

struct EngineInner {
    workflows: DashMap<String, Arc<Workflow>>,
    instances: DashMap<String, Arc<RwLock<WorkflowInstance>>>,
    controls: DashMap<String, InstanceControl>,
    bus: EventBus,
    dispatch: Arc<dyn AgentDispatch>,
    executor: Arc<dyn TaskExecutor>,
    config: WorkflowEngineConfig,
    node_slots: Arc<Semaphore>,
}

/// Interprets registered workflow definitions.
#[derive(Clone)]
pub struct WorkflowEngine {
    inner: Arc<EngineInner>,
}

impl WorkflowEngine {
    /// Create an engine over the given seams.
    pub fn new(
        bus: EventBus,
        dispatch: Arc<dyn AgentDispatch>,
        executor: Arc<dyn TaskExecutor>,
        config: WorkflowEngineConfig,
    ) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                workflows: DashMap::new(),
                instances: DashMap::new(),
                controls: DashMap::new(),
                bus,
                dispatch,
                executor,
                node_slots: Arc::new(Semaphore::new(config.max_concurrent_nodes.max(1))),
                config,
            }),
        }
    }

    /// Validate and register a workflow definition.
    pub fn register(&self, workflow: Workflow) -> Result<(), WorkflowError> {
        workflow.validate()?;
        info!(workflow_id = %workflow.id, nodes = workflow.nodes.len(), "registered workflow");
        self.inner
            .workflows
            .insert(workflow.id.clone(), Arc::new(workflow));
        Ok(())
    }

    /// Look up a registered definition.
    pub fn get_workflow(&self, workflow_id: &str) -> Option<Arc<Workflow>> {
        self.inner
            .workflows
            .get(workflow_id)
            .map(|entry| Arc::clone(entry.value()))
    }

    /// Start an instance. Returns its id; progress is observable through
    /// the bus and [`get_instance`](Self::get_instance).
    pub async fn start(
        &self,
        workflow_id: &str,
        inputs: Option<Value>,
        parent_instance_id: Option<&str>,
    ) -> Result<String, WorkflowError> {
        start_internal(&self.inner, workflow_id, inputs, parent_instance_id).await
    }

    /// Freeze scheduling; in-flight nodes still settle.
    pub async fn pause(&self, instance_id: &str) -> Result<(), WorkflowError> {
        let instance = self.instance_arc(instance_id)?;
        {
            let mut instance = instance.write().await;
            if instance.status != InstanceStatus::Running {
                return Err(WorkflowError::InvalidControl {
                    instance_id: instance_id.to_string(),
                    status: instance.status.as_str().to_string(),
                    operation: "pause".to_string(),
                });
            }
            instance.status = InstanceStatus::Paused;
        }
        self.emit_lifecycle(instance_id, "workflow:paused", None).await;
        self.nudge(instance_id);
        Ok(())
    }

    /// Resume a paused instance.
    pub async fn resume(&self, instance_id: &str) -> Result<(), WorkflowError> {
        let instance = self.instance_arc(instance_id)?;
        {
            let mut instance = instance.write().await;
            if instance.status != InstanceStatus::Paused {
                return Err(WorkflowError::InvalidControl {
                    instance_id: instance_id.to_string(),
                    status: instance.status.as_str().to_string(),
                    operation: "resume".to_string(),
                });
            }
            instance.status = InstanceStatus::Running;
        }
        self.emit_lifecycle(instance_id, "workflow:resumed", None).await;
        self.nudge(instance_id);
        Ok(())
    }

    /// Cancel an instance. Running nodes complete; their successors are
    /// never scheduled. A no-op on already-terminal instances.
    pub async fn cancel(&self, instance_id: &str) -> Result<(), WorkflowError> {
        let instance = self.instance_arc(instance_id)?;
        {
            let mut instance = instance.write().await;
            if instance.status.is_terminal() {
                return Ok(());
            }
            instance.status = InstanceStatus::Cancelled;
            instance.finished_at = Some(Utc::now());
        }
        self.emit_lifecycle(instance_id, "workflow:cancelled", None).await;
        if let Some(control) = self.inner.controls.get(instance_id) {
            control.cancel.cancel();
            control.nudge.notify_one();
        }
        Ok(())
    }

    /// Snapshot of an instance, running or retained.
    pub async fn get_instance(&self, instance_id: &str) -> Option<WorkflowInstance> {
        let instance = self.inner.instances.get(instance_id).map(|e| Arc::clone(e.value()))?;
        let snapshot = instance.read().await.clone();
        Some(snapshot)
    }

    /// Snapshots of every instance this engine started.
    pub async fn list_instances(&self) -> Vec<WorkflowInstance> {
        let arcs: Vec<Arc<RwLock<WorkflowInstance>>> = self
            .inner
            .instances
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        let mut snapshots = Vec::with_capacity(arcs.len());
        for arc in arcs {
            snapshots.push(arc.read().await.clone());
        }
        snapshots
    }

    /// Per-node results of an instance.
    pub async fn instance_results(&self, instance_id: &str) -> Option<HashMap<String, Value>> {
        self.get_instance(instance_id).await.map(|i| i.results)
    }

    /// Poll an instance until it reaches a terminal status or the timeout
    /// elapses. Returns the final snapshot.
    pub async fn wait_until_terminal(
        &self,
        instance_id: &str,
        timeout: Duration,
    ) -> Result<WorkflowInstance, WorkflowError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let Some(snapshot) = self.get_instance(instance_id).await else {
                return Err(WorkflowError::UnknownInstance(instance_id.to_string()));
            };
            if snapshot.status.is_terminal() {
                return Ok(snapshot);
            }
            if tokio::time::Instant::now() >= deadline {
                return Ok(snapshot);
            }
            tokio::time::sleep(SUB_WORKFLOW_POLL).await;
        }
    }

    fn instance_arc(
        &self,
        instance_id: &str,
    ) -> Result<Arc<RwLock<WorkflowInstance>>, WorkflowError> {
        self.inner
            .instances
            .get(instance_id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| WorkflowError::UnknownInstance(instance_id.to_string()))
    }

    fn nudge(&self, instance_id: &str) {
        if let Some(control) = self.inner.controls.get(instance_id) {
            control.nudge.notify_one();
        }
    }

    async fn emit_lifecycle(&self, instance_id: &str, event: &str, data: Option<Value>) {
        let workflow_id = self
            .get_instance(instance_id)
            .await
            .map(|i| i.workflow_id)
            .unwrap_or_default();
        emit_event(&self.inner.bus, event, instance_id, &workflow_id, None, data).await;
    }
}

async fn emit_event(
    bus: &EventBus,
    event: &str,
    instance_id: &str,
    workflow_id: &str,
    node_id: Option<&str>,
    data: Option<Value>,
) {
    let mut payload = json!({
        "instanceId": instance_id,
        "workflowId": workflow_id,
    });
    if let Some(map) = payload.as_object_mut() {
        if let Some(node_id) = node_id {
            map.insert("nodeId".to_string(), Value::String(node_id.to_string()));
        }
        if let Some(data) = data {
            map.insert("data".to_string(), data);
        }
    }
    if let Err(error) = bus
        .publish(
            event,
            payload,
            PublishOptions::from_source("workflow-engine"),
        )
        .await
    {
        warn!(%error, event, instance_id, "failed to publish workflow event");
    }
}

//─────────────────────────────
//  Instance start
//─────────────────────────────

fn start_internal<'a>(
    inner: &'a Arc<EngineInner>,
    workflow_id: &'a str,
    inputs: Option<Value>,
    parent_instance_id: Option<&'a str>,
) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<String, WorkflowError>> + Send + 'a>> {
    Box::pin(async move {
    let workflow = inner
        .workflows
        .get(workflow_id)
        .map(|entry| Arc::clone(entry.value()))
        .ok_or_else(|| WorkflowError::UnknownWorkflow(workflow_id.to_string()))?;

    let (depth, root_hint, parent) = match parent_instance_id {
        Some(parent_id) => {
            let parent_arc = inner
                .instances
                .get(parent_id)
                .map(|entry| Arc::clone(entry.value()))
                .ok_or_else(|| WorkflowError::UnknownInstance(parent_id.to_string()))?;
            let parent = parent_arc.read().await;
            (
                parent.depth + 1,
                Some(parent.root_instance_id.clone()),
                Some(parent_id.to_string()),
            )
        }
        None => (0, None, None),
    };
    if depth > inner.config.max_nesting_depth {
        return Err(WorkflowError::NestingTooDeep {
            depth,
            max: inner.config.max_nesting_depth,
        });
    }

    let input_map: Map<String, Value> = match inputs {
        Some(Value::Object(map)) => map,
        Some(other) => {
            let mut map = Map::new();
            map.insert("input".to_string(), other);
            map
        }
        None => Map::new(),
    };
    let mut variables = Map::new();
    for definition in &workflow.variables {
        match input_map.get(&definition.name).cloned().or_else(|| definition.default.clone()) {
            Some(value) => {
                variables.insert(definition.name.clone(), value);
            }
            None if definition.required => {
                return Err(WorkflowError::MissingVariable {
                    workflow_id: workflow_id.to_string(),
                    name: definition.name.clone(),
                });
            }
            None => {}
        }
    }
    for (name, value) in input_map {
        variables.entry(name).or_insert(value);
    }

    let start_nodes = workflow.start_nodes();
    if start_nodes.is_empty() && !workflow.nodes.is_empty() {
        return Err(WorkflowError::Invalid {
            workflow_id: workflow_id.to_string(),
            reason: "workflow has no start nodes".to_string(),
        });
    }

    let instance_id = Uuid::new_v4().to_string();
    let root_instance_id = root_hint.unwrap_or_else(|| instance_id.clone());
    let instance = WorkflowInstance {
        id: instance_id.clone(),
        workflow_id: workflow_id.to_string(),
        status: InstanceStatus::Running,
        variables: Value::Object(variables),
        node_states: workflow
            .nodes
            .iter()
            .map(|node| (node.id.clone(), NodeState::Pending))
            .collect(),
        current_nodes: Default::default(),
        completed_nodes: Default::default(),
        failed_nodes: Default::default(),
        results: HashMap::new(),
        parent_instance_id: parent,
        root_instance_id,
        depth,
        started_at: Utc::now(),
        finished_at: None,
    };

    let instance_arc = Arc::new(RwLock::new(instance));
    inner
        .instances
        .insert(instance_id.clone(), Arc::clone(&instance_arc));
    let cancel = CancellationToken::new();
    let nudge = Arc::new(Notify::new());
    inner.controls.insert(
        instance_id.clone(),
        InstanceControl {
            cancel: cancel.clone(),
            nudge: Arc::clone(&nudge),
        },
    );

    emit_event(
        &inner.bus,
        "workflow:started",
        &instance_id,
        workflow_id,
        None,
        None,
    )
    .await;
    info!(workflow_id, instance_id, depth, "workflow instance started");

    let driver = Driver {
        inner: Arc::clone(inner),
        workflow,
        instance: instance_arc,
        instance_id: instance_id.clone(),
        cancel,
        nudge,
        start_nodes,
    };
    tokio::spawn(driver.run());

    Ok(instance_id)
    })
}

//─────────────────────────────
//  Driver
//─────────────────────────────

#[derive(Debug)]
struct Scheduled {
    node_id: String,
    trigger: Option<Value>,
}

#[derive(Debug)]
enum Outcome {
    Success(Value),
    Failure(String),
    Branch { result: Value, chosen: String },
}

#[derive(Debug)]
struct Done {
    node_id: String,
    outcome: Outcome,
}

struct ParallelWait {
    node_id: String,
    branches: Vec<String>,
    policy: WaitPolicy,
}

struct Driver {
    inner: Arc<EngineInner>,
    workflow: Arc<Workflow>,
    instance: Arc<RwLock<WorkflowInstance>>,
    instance_id: String,
    cancel: CancellationToken,
    nudge: Arc<Notify>,
    start_nodes: Vec<String>,
}

struct DriverState {
    ready: VecDeque<Scheduled>,
    seen: HashSet<String>,
    deferred: VecDeque<Scheduled>,
    deferred_ids: HashSet<String>,
    waiters: Vec<ParallelWait>,
    running: usize,
    done_tx: mpsc::UnboundedSender<Done>,
}

impl Driver {
    async fn run(self) {
        let (done_tx, mut done_rx) = mpsc::unbounded_channel::<Done>();
        let mut state = DriverState {
            ready: VecDeque::new(),
            seen: HashSet::new(),
            deferred: VecDeque::new(),
            deferred_ids: HashSet::new(),
            waiters: Vec::new(),
            running: 0,
            done_tx,
        };
        for node_id in &self.start_nodes {
            state.seen.insert(node_id.clone());
            state.ready.push_back(Scheduled {
                node_id: node_id.clone(),
                trigger: None,
            });
        }

        loop {
            if self.cancel.is_cancelled() {
                break;
            }
            let status = self.instance.read().await.status;
            if status.is_terminal() {
                // Nothing new is scheduled; in-flight nodes still settle.
                state.ready.clear();
                state.deferred.clear();
                state.deferred_ids.clear();
                for waiter in state.waiters.drain(..) {
                    let _ = state.done_tx.send(Done {
                        node_id: waiter.node_id,
                        outcome: Outcome::Failure("instance terminated".to_string()),
                    });
                }
                if state.running == 0 {
                    break;
                }
            }
            let paused = status == InstanceStatus::Paused;

            if !paused && !status.is_terminal() {
                while let Some(scheduled) = state.ready.pop_front() {
                    self.dispatch(scheduled, &mut state).await;
                }
                self.check_waiters(&mut state).await;
            }

            if !paused && !status.is_terminal() && state.running == 0 && state.ready.is_empty() {
                if !state.deferred.is_empty() {
                    // Every parent is quiet now; promote all deferred merges.
                    while let Some(scheduled) = state.deferred.pop_front() {
                        state.deferred_ids.remove(&scheduled.node_id);
                        state.seen.insert(scheduled.node_id.clone());
                        state.ready.push_back(scheduled);
                    }
                    continue;
                }
                if !state.waiters.is_empty() {
                    // Branches can no longer make progress; force-resolve.
                    self.check_waiters(&mut state).await;
                    if !state.waiters.is_empty() {
                        let stuck: Vec<String> =
                            state.waiters.drain(..).map(|w| w.node_id).collect();
                        for node_id in stuck {
                            let _ = state.done_tx.send(Done {
                                node_id,
                                outcome: Outcome::Failure(
                                    "parallel branches settled without satisfying the wait policy"
                                        .to_string(),
                                ),
                            });
                        }
                        continue;
                    }
                    continue;
                }
                break;
            }

            tokio::select! {
                maybe_done = done_rx.recv() => {
                    if let Some(done) = maybe_done {
                        self.handle_done(done, &mut state).await;
                    }
                }
                _ = self.cancel.cancelled() => break,
                _ = self.nudge.notified() => {}
            }
        }

        // Finalize.
        let (already_terminal, workflow_id) = {
            let mut instance = self.instance.write().await;
            let terminal = instance.status.is_terminal();
            if !terminal {
                instance.status = InstanceStatus::Completed;
                instance.finished_at = Some(Utc::now());
            }
            (terminal, instance.workflow_id.clone())
        };
        if !already_terminal {
            emit_event(
                &self.inner.bus,
                "workflow:completed",
                &self.instance_id,
                &workflow_id,
                None,
                None,
            )
            .await;
            info!(instance_id = %self.instance_id, "workflow instance completed");
        }
        self.inner.controls.remove(&self.instance_id);
    }

    //───────────── scheduling ─────────────

    async fn dispatch(&self, scheduled: Scheduled, state: &mut DriverState) {
        let Some(node) = self.workflow.node(&scheduled.node_id) else {
            return;
        };
        let node_id = node.id.clone();
        state.running += 1;
        let scope = {
            let mut instance = self.instance.write().await;
            instance
                .node_states
                .insert(node_id.clone(), NodeState::Running);
            instance.current_nodes.insert(node_id.clone());
            instance.scope_with_result(scheduled.trigger.as_ref())
        };
        self.emit_node("node:started", &node_id, None).await;

        match &node.kind {
            NodeKind::Condition(config) => {
                let (value, evaluated) = evaluate_condition(&config.condition, &scope);
                let chosen = if value {
                    config.true_branch.clone()
                } else {
                    config.false_branch.clone()
                };
                let result = json!({
                    "branch": chosen,
                    "result": value,
                    "evaluatedCondition": evaluated,
                });
                let _ = state.done_tx.send(Done {
                    node_id,
                    outcome: Outcome::Branch { result, chosen },
                });
            }
            NodeKind::Merge(config) => {
                let outcome = self.run_merge(&node_id, config).await;
                let _ = state.done_tx.send(Done { node_id, outcome });
            }
            NodeKind::Parallel(config) => {
                for branch in &config.branches {
                    if state.seen.insert(branch.clone()) {
                        state.ready.push_back(Scheduled {
                            node_id: branch.clone(),
                            trigger: scheduled.trigger.clone(),
                        });
                    }
                }
                state.waiters.push(ParallelWait {
                    node_id,
                    branches: config.branches.clone(),
                    policy: config.wait_for,
                });
            }
            NodeKind::Task(config) => {
                self.spawn_task_node(&node_id, config, &scope, state);
            }
            NodeKind::Delay(config) => {
                let duration = match (config.duration_ms, config.until) {
                    (Some(ms), _) => Duration::from_millis(ms),
                    (None, Some(until)) => until
                        .signed_duration_since(Utc::now())
                        .to_std()
                        .unwrap_or_default(),
                    (None, None) => Duration::ZERO,
                };
                let done_tx = state.done_tx.clone();
                let cancel = self.cancel.clone();
                tokio::spawn(async move {
                    let outcome = tokio::select! {
                        _ = tokio::time::sleep(duration) => {
                            Outcome::Success(json!({ "sleptMs": duration.as_millis() as u64 }))
                        }
                        _ = cancel.cancelled() => Outcome::Failure("cancelled".to_string()),
                    };
                    let _ = done_tx.send(Done { node_id, outcome });
                });
            }
            NodeKind::SubWorkflow(config) => {
                let inner = Arc::clone(&self.inner);
                let config = config.clone();
                let parent_id = self.instance_id.clone();
                let done_tx = state.done_tx.clone();
                let scope = scope.clone();
                tokio::spawn(async move {
                    let outcome = run_sub_workflow(inner, &parent_id, &config, &scope).await;
                    let _ = done_tx.send(Done { node_id, outcome });
                });
            }
        }
    }

    fn spawn_task_node(
        &self,
        node_id: &str,
        config: &TaskNodeConfig,
        scope: &Value,
        state: &mut DriverState,
    ) {
        let parameters = substitute_value(&config.parameters, scope);
        let mut task = match Task::new(
            format!("{}:{}", self.instance_id, node_id),
            config.task_type.clone(),
        ) {
            Ok(task) => task.with_parameters(parameters),
            Err(error) => {
                let _ = state.done_tx.send(Done {
                    node_id: node_id.to_string(),
                    outcome: Outcome::Failure(error.to_string()),
                });
                return;
            }
        };
        if let Some(selector) = &config.agent_selector {
            task = task.with_skills(selector.required_skills.iter().cloned());
        }

        let node_id = node_id.to_string();
        let instance_id = self.instance_id.clone();
        let workflow_id = self.workflow.id.clone();
        let dispatch = Arc::clone(&self.inner.dispatch);
        let executor = Arc::clone(&self.inner.executor);
        let bus = self.inner.bus.clone();
        let slots = Arc::clone(&self.inner.node_slots);
        let cancel = self.cancel.clone();
        let done_tx = state.done_tx.clone();
        let retries = config.retries;
        let retry_delay_ms = config.retry_delay_ms;
        let retry_backoff = config.retry_backoff;
        let timeout = Duration::from_millis(
            config
                .timeout_ms
                .unwrap_or(self.inner.config.default_task_timeout_ms),
        );

        tokio::spawn(async move {
            let Ok(_permit) = slots.acquire().await else {
                let _ = done_tx.send(Done {
                    node_id,
                    outcome: Outcome::Failure("engine shutting down".to_string()),
                });
                return;
            };

            let mut last_error = String::new();
            for attempt in 0..=retries {
                if attempt > 0 {
                    emit_event(
                        &bus,
                        "node:retrying",
                        &instance_id,
                        &workflow_id,
                        Some(&node_id),
                        Some(json!({ "attempt": attempt + 1, "error": &last_error })),
                    )
                    .await;
                    let delay = backoff_delay(retry_delay_ms, retry_backoff, attempt);
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                }

                match dispatch.acquire(&task).await {
                    Ok(agent_id) => {
                        let attempt_result =
                            tokio::time::timeout(timeout, executor.execute(&agent_id, &task)).await;
                        match attempt_result {
                            Ok(Ok(value)) => {
                                let _ = dispatch
                                    .release(&agent_id, &task, &TaskOutcome::Success(value.clone()))
                                    .await;
                                let _ = done_tx.send(Done {
                                    node_id,
                                    outcome: Outcome::Success(value),
                                });
                                return;
                            }
                            Ok(Err(error)) => {
                                last_error = error.to_string();
                                let _ = dispatch
                                    .release(
                                        &agent_id,
                                        &task,
                                        &TaskOutcome::Failure(last_error.clone()),
                                    )
                                    .await;
                            }
                            Err(_) => {
                                last_error = format!("timed out after {} ms", timeout.as_millis());
                                let _ = executor.cancel(&task.id).await;
                                let _ = dispatch
                                    .release(
                                        &agent_id,
                                        &task,
                                        &TaskOutcome::Failure(last_error.clone()),
                                    )
                                    .await;
                            }
                        }
                    }
                    Err(error) => {
                        last_error = error.to_string();
                    }
                }

                if cancel.is_cancelled() {
                    break;
                }
            }
            let _ = done_tx.send(Done {
                node_id,
                outcome: Outcome::Failure(last_error),
            });
        });
    }

    async fn run_merge(
        &self,
        node_id: &str,
        config: &crate::definition::MergeConfig,
    ) -> Outcome {
        let parents = self.workflow.parents_of(node_id);
        let results: Vec<Value> = {
            let instance = self.instance.read().await;
            parents
                .iter()
                .filter_map(|parent| instance.results.get(parent).cloned())
                .collect()
        };
        match config.strategy {
            MergeStrategy::Collect => Outcome::Success(Value::Array(results)),
            MergeStrategy::First => {
                Outcome::Success(results.into_iter().next().unwrap_or(Value::Null))
            }
            MergeStrategy::Last => {
                Outcome::Success(results.into_iter().next_back().unwrap_or(Value::Null))
            }
            MergeStrategy::Concat => {
                if results.iter().all(|v| v.is_string()) {
                    Outcome::Success(Value::String(
                        results
                            .iter()
                            .filter_map(Value::as_str)
                            .collect::<Vec<_>>()
                            .join(""),
                    ))
                } else {
                    let mut flattened = Vec::new();
                    for value in results {
                        match value {
                            Value::Array(items) => flattened.extend(items),
                            other => flattened.push(other),
                        }
                    }
                    Outcome::Success(Value::Array(flattened))
                }
            }
            MergeStrategy::Reduce => {
                let Some(expression) = &config.reduce_function else {
                    return Outcome::Failure("reduce strategy without a reduce function".into());
                };
                match reduce_values(expression, &results) {
                    Ok(value) => Outcome::Success(value),
                    Err(error) => Outcome::Failure(format!("reduce failed: {error}")),
                }
            }
        }
    }

    //───────────── settlement ─────────────

    async fn handle_done(&self, done: Done, state: &mut DriverState) {
        state.running = state.running.saturating_sub(1);
        let node_id = done.node_id;

        match done.outcome {
            Outcome::Success(result) => {
                self.settle_success(&node_id, &result).await;
                let successors = self.successors_for(&node_id, &result).await;
                for (target, trigger) in successors {
                    self.enqueue(target, Some(trigger), state).await;
                }
            }
            Outcome::Branch { result, chosen } => {
                self.settle_success(&node_id, &result).await;
                // Condition nodes follow only the chosen branch.
                self.enqueue(chosen, Some(result), state).await;
            }
            Outcome::Failure(error) => {
                debug!(node_id, %error, "workflow node failed");
                self.emit_node("node:failed", &node_id, Some(json!({ "error": &error })))
                    .await;
                match self.workflow.on_failure {
                    FailurePolicy::Stop => {
                        let (newly_failed, workflow_id) = {
                            let mut instance = self.instance.write().await;
                            instance.node_states.insert(node_id.clone(), NodeState::Failed);
                            instance.current_nodes.remove(&node_id);
                            instance.failed_nodes.insert(node_id.clone());
                            let newly_failed = !instance.status.is_terminal();
                            if newly_failed {
                                instance.status = InstanceStatus::Failed;
                                instance.finished_at = Some(Utc::now());
                            }
                            (newly_failed, instance.workflow_id.clone())
                        };
                        if newly_failed {
                            emit_event(
                                &self.inner.bus,
                                "workflow:failed",
                                &self.instance_id,
                                &workflow_id,
                                Some(&node_id),
                                Some(json!({ "error": error })),
                            )
                            .await;
                        }
                    }
                    FailurePolicy::Continue => {
                        let result = json!({ "error": error });
                        {
                            let mut instance = self.instance.write().await;
                            instance
                                .node_states
                                .insert(node_id.clone(), NodeState::Skipped);
                            instance.current_nodes.remove(&node_id);
                            instance.failed_nodes.insert(node_id.clone());
                            instance.results.insert(node_id.clone(), result.clone());
                        }
                        self.emit_node("node:skipped", &node_id, None).await;
                        let successors = self.successors_for(&node_id, &result).await;
                        for (target, trigger) in successors {
                            self.enqueue(target, Some(trigger), state).await;
                        }
                    }
                }
            }
        }

        self.check_waiters(state).await;
        self.promote_deferred(state).await;
    }

    async fn settle_success(&self, node_id: &str, result: &Value) {
        {
            let mut instance = self.instance.write().await;
            instance
                .node_states
                .insert(node_id.to_string(), NodeState::Completed);
            instance.current_nodes.remove(node_id);
            instance.completed_nodes.insert(node_id.to_string());
            instance.results.insert(node_id.to_string(), result.clone());
        }
        self.emit_node("node:completed", node_id, None).await;
    }

    /// Targets of a settled node's outgoing edges whose guards hold.
    async fn successors_for(&self, node_id: &str, result: &Value) -> Vec<(String, Value)> {
        let node = self.workflow.node(node_id);
        // Parallel branches are re-triggered by their parallel node, not by
        // sibling edges; condition nodes are handled by the branch path.
        if matches!(node.map(|n| &n.kind), Some(NodeKind::Condition(_))) {
            return Vec::new();
        }
        let scope = {
            let instance = self.instance.read().await;
            instance.scope_with_result(Some(result))
        };
        self.workflow
            .edges_from(node_id)
            .into_iter()
            .filter(|edge| match &edge.condition {
                Some(expression) => evaluate_condition(expression, &scope).0,
                None => true,
            })
            .map(|edge| (edge.to.clone(), result.clone()))
            .collect()
    }

    async fn enqueue(&self, target: String, trigger: Option<Value>, state: &mut DriverState) {
        if state.seen.contains(&target) || state.deferred_ids.contains(&target) {
            return;
        }
        let is_merge = matches!(
            self.workflow.node(&target).map(|n| &n.kind),
            Some(NodeKind::Merge(_))
        );
        if is_merge && !self.merge_parents_quiet(&target, state).await {
            state.deferred_ids.insert(target.clone());
            state.deferred.push_back(Scheduled {
                node_id: target,
                trigger,
            });
            return;
        }
        state.seen.insert(target.clone());
        state.ready.push_back(Scheduled {
            node_id: target,
            trigger,
        });
    }

    /// A merge may run once none of its parents can still produce a
    /// result: each parent is either settled, or pending and never
    /// scheduled (not on a taken path).
    async fn merge_parents_quiet(&self, merge_id: &str, state: &DriverState) -> bool {
        let parents = self.workflow.parents_of(merge_id);
        let instance = self.instance.read().await;
        parents.iter().all(|parent| {
            match instance.node_states.get(parent) {
                Some(node_state) if node_state.is_settled() => true,
                Some(NodeState::Pending) => !state.seen.contains(parent),
                _ => false,
            }
        })
    }

    async fn promote_deferred(&self, state: &mut DriverState) {
        let mut requeue = VecDeque::new();
        while let Some(scheduled) = state.deferred.pop_front() {
            if self.merge_parents_quiet(&scheduled.node_id, state).await {
                state.deferred_ids.remove(&scheduled.node_id);
                state.seen.insert(scheduled.node_id.clone());
                state.ready.push_back(scheduled);
            } else {
                requeue.push_back(scheduled);
            }
        }
        state.deferred = requeue;
    }

    async fn check_waiters(&self, state: &mut DriverState) {
        if state.waiters.is_empty() {
            return;
        }
        let (states, results) = {
            let instance = self.instance.read().await;
            (instance.node_states.clone(), instance.results.clone())
        };

        let mut remaining = Vec::new();
        for waiter in state.waiters.drain(..) {
            let settled: Vec<&String> = waiter
                .branches
                .iter()
                .filter(|b| states.get(*b).map_or(false, NodeState::is_settled))
                .collect();
            let completed: Vec<&String> = waiter
                .branches
                .iter()
                .filter(|b| states.get(*b) == Some(&NodeState::Completed))
                .collect();
            let all_settled = settled.len() == waiter.branches.len();

            let resolution: Option<Outcome> = match waiter.policy {
                WaitPolicy::Mode(WaitMode::All) => {
                    if all_settled {
                        let mut combined = Map::new();
                        for branch in &waiter.branches {
                            combined.insert(
                                branch.clone(),
                                results.get(branch).cloned().unwrap_or(Value::Null),
                            );
                        }
                        Some(Outcome::Success(Value::Object(combined)))
                    } else {
                        None
                    }
                }
                WaitPolicy::Mode(WaitMode::Any) => {
                    if let Some(first) = completed.first() {
                        Some(Outcome::Success(
                            results.get(*first).cloned().unwrap_or(Value::Null),
                        ))
                    } else if all_settled {
                        Some(Outcome::Failure("no parallel branch completed".into()))
                    } else {
                        None
                    }
                }
                WaitPolicy::Count(needed) => {
                    if completed.len() >= needed as usize {
                        let values: Vec<Value> = completed
                            .iter()
                            .take(needed as usize)
                            .map(|b| results.get(*b).cloned().unwrap_or(Value::Null))
                            .collect();
                        Some(Outcome::Success(Value::Array(values)))
                    } else if all_settled {
                        Some(Outcome::Failure(format!(
                            "only {} of {needed} parallel branches completed",
                            completed.len()
                        )))
                    } else {
                        None
                    }
                }
            };

            match resolution {
                Some(outcome) => {
                    let _ = state.done_tx.send(Done {
                        node_id: waiter.node_id,
                        outcome,
                    });
                }
                None => remaining.push(waiter),
            }
        }
        state.waiters = remaining;
    }

    async fn emit_node(&self, event: &str, node_id: &str, data: Option<Value>) {
        emit_event(
            &self.inner.bus,
            event,
            &self.instance_id,
            &self.workflow.id,
            Some(node_id),
            data,
        )
        .await;
    }
}

fn backoff_delay(base_ms: u64, backoff: RetryBackoff, attempt: u32) -> Duration {
    let factor = match backoff {
        RetryBackoff::Fixed => 1,
        RetryBackoff::Linear => u64::from(attempt),
        RetryBackoff::Exponential => 1u64 << attempt.saturating_sub(1).min(16),
    };
    Duration::from_millis(base_ms.saturating_mul(factor))
}

//─────────────────────────────
//  Sub-workflows
//─────────────────────────────

async fn run_sub_workflow(
    inner: Arc<EngineInner>,
    parent_instance_id: &str,
    config: &crate::definition::SubWorkflowConfig,
    scope: &Value,
) -> Outcome {
    let mut inputs = Map::new();
    for (name, path) in &config.inputs {
        if let Some(value) = lookup_path(scope, path) {
            inputs.insert(name.clone(), value.clone());
        }
    }

    let child_id = match start_internal(
        &inner,
        &config.workflow_id,
        Some(Value::Object(inputs)),
        Some(parent_instance_id),
    )
    .await
    {
        Ok(id) => id,
        Err(error) => return Outcome::Failure(error.to_string()),
    };

    if !config.wait_for_completion {
        return Outcome::Success(json!({ "instanceId": child_id }));
    }

    let timeout = Duration::from_millis(
        config
            .timeout_ms
            .unwrap_or(inner.config.sub_workflow_timeout_ms),
    );
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let snapshot = {
            let Some(arc) = inner.instances.get(&child_id).map(|e| Arc::clone(e.value())) else {
                return Outcome::Failure(format!("sub-workflow instance `{child_id}` vanished"));
            };
            let child = arc.read().await;
            (child.status, child.results.clone())
        };
        match snapshot.0 {
            InstanceStatus::Completed => {
                return Outcome::Success(json!({
                    "instanceId": child_id,
                    "results": snapshot.1,
                }));
            }
            InstanceStatus::Failed | InstanceStatus::Cancelled => {
                if config.propagate_errors {
                    return Outcome::Failure(format!(
                        "sub-workflow `{}` ended {}",
                        config.workflow_id,
                        snapshot.0.as_str()
                    ));
                }
                return Outcome::Success(json!({
                    "instanceId": child_id,
                    "status": snapshot.0.as_str(),
                }));
            }
            InstanceStatus::Running | InstanceStatus::Paused => {}
        }
        if tokio::time::Instant::now() >= deadline {
            return Outcome::Failure(format!(
                "sub-workflow `{}` timed out after {} ms",
                config.workflow_id,
                timeout.as_millis()
            ));
        }
        tokio::time::sleep(SUB_WORKFLOW_POLL).await;
    }
}
