//! End-to-end scenarios across the assembled orchestrator.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{json, Value};

use flotilla_bus::HistoryQuery;
use flotilla_exec::{TaskExecutor, TaskStatus};
use flotilla_quota::{Principal, QuotaLimits};
use flotilla_routing::{BalanceStrategy, RouteRequest};
use flotilla_runtime::Orchestrator;
use flotilla_types::{
    AgentCapabilities, AgentConfig, AgentState, Cluster, EngineConfig, RuntimeConfig, RuntimeKind,
    Task, TaskWithDependencies,
};
use flotilla_workflow::{
    ConditionConfig, FailurePolicy, InstanceStatus, MergeConfig, MergeStrategy, NodeKind,
    ParallelConfig, TaskNodeConfig, VariableDef, WaitMode, WaitPolicy, Workflow, WorkflowEdge,
    WorkflowNode,
};

/// Succeeds every task, echoing its id; can fail the first N calls.
struct StubExecutor {
    fail_first_n: AtomicU32,
}

impl StubExecutor {
    fn ok() -> Self {
        Self {
            fail_first_n: AtomicU32::new(0),
        }
    }

    fn failing_first(n: u32) -> Self {
        Self {
            fail_first_n: AtomicU32::new(n),
        }
    }
}

#[async_trait]
impl TaskExecutor for StubExecutor {
    async fn execute(&self, agent_id: &str, task: &Task) -> Result<Value> {
        let remaining = self.fail_first_n.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_first_n.store(remaining - 1, Ordering::SeqCst);
            anyhow::bail!("injected failure");
        }
        Ok(json!({ "taskId": task.id, "agentId": agent_id }))
    }
}

fn agent_config(id: &str, skills: &[&str]) -> AgentConfig {
    AgentConfig {
        id: Some(id.to_string()),
        runtime: RuntimeKind::Local,
        capabilities: AgentCapabilities {
            skills: skills.iter().map(|s| s.to_string()).collect(),
            specialties: vec![],
            languages: vec![],
            cost_per_hour: 3.0,
            reliability: 0.95,
            avg_speed: 6.0,
        },
    }
}

fn task(id: &str) -> Task {
    Task::new(id, format!("task {id}")).unwrap()
}

fn node(id: &str, deps: &[&str]) -> TaskWithDependencies {
    TaskWithDependencies::with_dependencies(task(id), deps.iter().copied())
}

async fn orchestrator_with(executor: StubExecutor, config: RuntimeConfig) -> Orchestrator {
    Orchestrator::builder()
        .with_config(config)
        .with_task_executor(Arc::new(executor))
        .build()
        .unwrap()
}

#[tokio::test]
async fn e1_linear_plan_runs_to_completion() {
    let orchestrator = orchestrator_with(StubExecutor::ok(), RuntimeConfig::default()).await;
    orchestrator.agents().register(agent_config("a1", &[])).await.unwrap();

    let tasks = vec![node("A", &[]), node("B", &["A"]), node("C", &["B"])];
    let resolution = orchestrator.resolve(&tasks, None);
    assert!(resolution.valid);
    let plan = resolution.plan.unwrap();
    assert_eq!(plan.levels.len(), 3);
    assert_eq!(plan.estimated_parallelism, 1);
    assert_eq!(plan.critical_path, vec!["A", "B", "C"]);

    let report = orchestrator.execution_engine().execute(&plan).await;
    assert_eq!(report.completed, 3);
    assert_eq!(report.failed, 0);

    let bus = orchestrator.bus();
    let started = bus.query_history(&HistoryQuery {
        event_type: Some("execution:started".into()),
        ..HistoryQuery::default()
    });
    assert_eq!(started.len(), 1);
    let completed = bus.query_history(&HistoryQuery {
        event_type: Some("task:completed".into()),
        ..HistoryQuery::default()
    });
    assert_eq!(completed.len(), 3);
    let summary = bus.query_history(&HistoryQuery {
        event_type: Some("execution:completed".into()),
        ..HistoryQuery::default()
    });
    assert_eq!(summary[0].payload["completed"], 3);
    assert_eq!(summary[0].payload["failed"], 0);
}

#[tokio::test]
async fn e2_diamond_plan_parallelizes_the_middle_level() {
    let config = RuntimeConfig {
        exec: EngineConfig {
            max_concurrency: 2,
            ..EngineConfig::default()
        },
        ..RuntimeConfig::default()
    };
    let orchestrator = orchestrator_with(StubExecutor::ok(), config).await;
    orchestrator.agents().register(agent_config("a1", &[])).await.unwrap();
    orchestrator.agents().register(agent_config("a2", &[])).await.unwrap();

    let tasks = vec![
        node("A", &[]),
        node("B", &["A"]),
        node("C", &["A"]),
        node("D", &["B", "C"]),
    ];
    let resolution = orchestrator.resolve(&tasks, None);
    let plan = resolution.plan.unwrap();
    assert_eq!(plan.estimated_parallelism, 2);
    assert_eq!(plan.levels[1].tasks.len(), 2);

    let report = orchestrator.execution_engine().execute(&plan).await;
    assert_eq!(report.completed, 4);

    // D started only after both B and C completed.
    let history = orchestrator.bus().query_history(&HistoryQuery::default());
    let position = |ty: &str, id: &str| {
        history
            .iter()
            .position(|e| e.event_type == ty && e.payload["taskId"] == id)
            .unwrap_or(usize::MAX)
    };
    assert!(position("task:started", "D") > position("task:completed", "B"));
    assert!(position("task:started", "D") > position("task:completed", "C"));
}

#[tokio::test]
async fn e3_cycles_are_rejected_with_participants_named() {
    let orchestrator = orchestrator_with(StubExecutor::ok(), RuntimeConfig::default()).await;
    let tasks = vec![node("A", &["C"]), node("B", &["A"]), node("C", &["B"])];
    let resolution = orchestrator.resolve(&tasks, None);
    assert!(!resolution.valid);
    assert!(resolution.plan.is_none());
    let joined = resolution.errors.join(" ");
    assert!(joined.contains('A') || joined.contains('B') || joined.contains('C'));
}

#[tokio::test]
async fn e4_agent_lifecycle_through_the_registry() {
    let orchestrator = orchestrator_with(StubExecutor::ok(), RuntimeConfig::default()).await;
    let agents = orchestrator.agents();
    agents.register(agent_config("a1", &[])).await.unwrap();

    assert_eq!(agents.get_agent_state("a1").await.unwrap(), AgentState::Idle);
    assert!(agents.assign_work("a1", &task("t")).await.unwrap());
    assert_eq!(agents.get_agent_state("a1").await.unwrap(), AgentState::Busy);
    agents.complete_work("a1", json!({"ok": true})).await.unwrap();
    assert_eq!(agents.get_agent_state("a1").await.unwrap(), AgentState::Idle);
    assert!(agents.pause_agent("a1").await.unwrap());
    assert_eq!(agents.get_agent_state("a1").await.unwrap(), AgentState::Paused);
    assert!(agents.resume_agent("a1").await.unwrap());
    assert_eq!(agents.get_agent_state("a1").await.unwrap(), AgentState::Idle);
    assert!(agents.stop_agent("a1", false).await.unwrap());
    assert!(orchestrator.registry().get("a1").is_none());
}

#[tokio::test]
async fn e5_retry_succeeds_on_the_third_attempt() {
    let config = RuntimeConfig {
        exec: EngineConfig {
            retry_attempts: 3,
            retry_delay_ms: 10,
            ..EngineConfig::default()
        },
        ..RuntimeConfig::default()
    };
    let orchestrator = orchestrator_with(StubExecutor::failing_first(2), config).await;
    orchestrator.agents().register(agent_config("a1", &[])).await.unwrap();

    let tasks = vec![node("A", &[])];
    let plan = orchestrator.resolve(&tasks, None).plan.unwrap();
    let report = orchestrator.execution_engine().execute(&plan).await;

    assert_eq!(report.completed, 1);
    let record = &report.results["A"];
    assert_eq!(record.status, TaskStatus::Completed);
    assert_eq!(record.attempts, 3);

    let retries = orchestrator.bus().query_history(&HistoryQuery {
        event_type: Some("task:retry".into()),
        ..HistoryQuery::default()
    });
    assert_eq!(retries.len(), 2);
    let completed = orchestrator.bus().query_history(&HistoryQuery {
        event_type: Some("task:completed".into()),
        ..HistoryQuery::default()
    });
    assert_eq!(completed.len(), 1);
}

#[tokio::test]
async fn e6_workflow_condition_and_parallel_through_real_dispatch() {
    let orchestrator = orchestrator_with(StubExecutor::ok(), RuntimeConfig::default()).await;
    for id in ["a1", "a2", "a3"] {
        orchestrator.agents().register(agent_config(id, &[])).await.unwrap();
    }

    let task_node = |id: &str, task_type: &str| WorkflowNode {
        id: id.to_string(),
        kind: NodeKind::Task(TaskNodeConfig {
            task_type: task_type.to_string(),
            parameters: json!({}),
            agent_selector: None,
            timeout_ms: None,
            retries: 0,
            retry_delay_ms: 0,
            retry_backoff: Default::default(),
        }),
    };
    orchestrator
        .workflows()
        .register(Workflow {
            id: "fanout".into(),
            name: "fanout".into(),
            nodes: vec![
                task_node("t0", "intake"),
                WorkflowNode {
                    id: "c1".into(),
                    kind: NodeKind::Condition(ConditionConfig {
                        condition: "${wide} === true".into(),
                        true_branch: "p1".into(),
                        false_branch: "p2".into(),
                    }),
                },
                WorkflowNode {
                    id: "p1".into(),
                    kind: NodeKind::Parallel(ParallelConfig {
                        branches: vec!["tA".into(), "tB".into()],
                        wait_for: WaitPolicy::Mode(WaitMode::All),
                    }),
                },
                task_node("p2", "narrow"),
                task_node("tA", "branch-a"),
                task_node("tB", "branch-b"),
                WorkflowNode {
                    id: "m1".into(),
                    kind: NodeKind::Merge(MergeConfig {
                        strategy: MergeStrategy::Collect,
                        reduce_function: None,
                    }),
                },
            ],
            edges: vec![
                WorkflowEdge {
                    from: "t0".into(),
                    to: "c1".into(),
                    condition: None,
                },
                WorkflowEdge {
                    from: "tA".into(),
                    to: "m1".into(),
                    condition: None,
                },
                WorkflowEdge {
                    from: "tB".into(),
                    to: "m1".into(),
                    condition: None,
                },
            ],
            variables: vec![VariableDef {
                name: "wide".into(),
                default: None,
                required: true,
            }],
            on_failure: FailurePolicy::Stop,
        })
        .unwrap();

    let instance_id = orchestrator
        .workflows()
        .start("fanout", Some(json!({ "wide": true })), None)
        .await
        .unwrap();
    let instance = orchestrator
        .workflows()
        .wait_until_terminal(&instance_id, Duration::from_secs(5))
        .await
        .unwrap();

    assert_eq!(instance.status, InstanceStatus::Completed);
    for reached in ["t0", "c1", "p1", "tA", "tB", "m1"] {
        assert!(instance.results.contains_key(reached), "missing {reached}");
    }
    assert!(!instance.results.contains_key("p2"));
}

#[tokio::test]
async fn e7_circuit_breaker_gates_routing_until_success() {
    let orchestrator = orchestrator_with(StubExecutor::ok(), RuntimeConfig::default()).await;
    let balancer = orchestrator.balancer();
    for id in ["c1", "c2", "c3"] {
        balancer.register_cluster(Cluster::new(id, format!("grpc://{id}"), "eu", "a", 10));
    }

    for _ in 0..3 {
        balancer.record_failure("c1");
    }
    for _ in 0..6 {
        let decision = balancer
            .route(&RouteRequest::default(), Some(BalanceStrategy::LeastLoaded))
            .unwrap();
        assert_ne!(decision.cluster.id, "c1");
    }

    balancer.record_success("c1");
    let routed_ids: Vec<String> = (0..6)
        .map(|_| {
            balancer
                .route(&RouteRequest::default(), Some(BalanceStrategy::RoundRobin))
                .unwrap()
                .cluster
                .id
        })
        .collect();
    assert!(routed_ids.iter().any(|id| id == "c1"));
}

#[tokio::test]
async fn published_events_round_trip_through_the_store() {
    let orchestrator = orchestrator_with(StubExecutor::ok(), RuntimeConfig::default()).await;
    orchestrator.agents().register(agent_config("a1", &[])).await.unwrap();

    let plan = orchestrator
        .resolve(&[node("A", &[])], None)
        .plan
        .unwrap();
    orchestrator.execution_engine().execute(&plan).await;

    // Give the forwarder a beat to drain the tap.
    tokio::time::sleep(Duration::from_millis(50)).await;

    let store = orchestrator.store();
    let completed = store.get_by_type("task:completed", None, None).await.unwrap();
    assert_eq!(completed.len(), 1);

    // Correlation chains line up between bus and store.
    let correlation = completed[0].metadata.correlation_id;
    let stream = store.get_stream(correlation).await.unwrap();
    assert!(stream.iter().any(|e| e.event_type == "execution:started"));
    assert!(stream.iter().any(|e| e.event_type == "execution:completed"));
    let chain = orchestrator.bus().correlation_chain(correlation);
    assert!(!chain.is_empty());
    assert!(chain.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
}

#[tokio::test]
async fn quota_denial_blocks_acquisition() {
    let orchestrator = Orchestrator::builder()
        .with_task_executor(Arc::new(StubExecutor::ok()))
        .with_principal(Principal::user("u1"))
        .build()
        .unwrap();
    orchestrator.agents().register(agent_config("a1", &[])).await.unwrap();
    orchestrator.agents().register(agent_config("a2", &[])).await.unwrap();
    orchestrator.quotas().users().set_limits(
        "u1",
        QuotaLimits {
            agents_per_day: Some(1),
            ..QuotaLimits::default()
        },
    );

    let plan = orchestrator
        .resolve(&[node("A", &[]), node("B", &["A"])], None)
        .plan
        .unwrap();
    let report = orchestrator.execution_engine().execute(&plan).await;

    // The first task consumed the daily budget; the second was denied.
    assert_eq!(report.completed, 1);
    assert_eq!(report.failed, 1);
    let violations = orchestrator.bus().query_history(&HistoryQuery {
        event_type: Some("quota:violation".into()),
        ..HistoryQuery::default()
    });
    assert!(!violations.is_empty());
}

#[tokio::test]
async fn shutdown_flushes_the_store() {
    let orchestrator = orchestrator_with(StubExecutor::ok(), RuntimeConfig::default()).await;
    orchestrator
        .bus()
        .publish("custom:event", json!({}), Default::default())
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    orchestrator.shutdown().await.unwrap();
}
