//! Level-by-level plan execution with bounded concurrency and retries.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use flotilla_bus::{EventBus, PublishOptions};
use flotilla_types::{EngineConfig, ExecutionPlan, RetryBackoff, TaskWithDependencies};

use crate::traits::{AgentDispatch, TaskExecutor, TaskOutcome};

//─────────────────────────────
//  Records & report
//─────────────────────────────

/// Terminal status of one task within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    /// Executor returned a result.
    Completed,
    /// Retry budget exhausted.
    Failed,
    /// Run was cancelled before the task started.
    Cancelled,
    /// An earlier failure aborted the run before the task started.
    Skipped,
}

/// Outcome of one task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    /// Task identifier.
    pub task_id: String,
    /// Terminal status.
    pub status: TaskStatus,
    /// Agent the final attempt ran on, if any attempt acquired one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    /// Executor result on success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    /// Last failure description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Attempts made, 0 for tasks that never started.
    pub attempts: u32,
    /// Wall-clock time across all attempts.
    pub duration: Duration,
}

/// Aggregated outcome of one plan execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionReport {
    /// Tasks that completed.
    pub completed: usize,
    /// Tasks that exhausted retries.
    pub failed: usize,
    /// Tasks cancelled before starting.
    pub cancelled: usize,
    /// Tasks skipped by an aborted run.
    pub skipped: usize,
    /// When the run started.
    pub started_at: DateTime<Utc>,
    /// When the run settled.
    pub completed_at: DateTime<Utc>,
    /// Total wall-clock duration.
    pub duration: Duration,
    /// Per-task records keyed by task id.
    pub results: HashMap<String, TaskRecord>,
}

//─────────────────────────────
//  Engine
//─────────────────────────────

/// Executes an [`ExecutionPlan`] against the dispatch and executor seams.
pub struct ExecutionEngine {
    dispatch: Arc<dyn AgentDispatch>,
    executor: Arc<dyn TaskExecutor>,
    bus: EventBus,
    config: EngineConfig,
    cancel: CancellationToken,
}

impl ExecutionEngine {
    /// Create an engine.
    pub fn new(
        dispatch: Arc<dyn AgentDispatch>,
        executor: Arc<dyn TaskExecutor>,
        bus: EventBus,
        config: EngineConfig,
    ) -> Self {
        Self {
            dispatch,
            executor,
            bus,
            config,
            cancel: CancellationToken::new(),
        }
    }

    /// Request cancellation: in-flight attempts finish but are not retried,
    /// and tasks not yet started report [`TaskStatus::Cancelled`].
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Whether cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Execute a plan level by level.
    ///
    /// No task in level *k* starts before every task in level *k−1* reached
    /// a terminal status. A terminal task failure aborts the run unless
    /// `continue_on_failure` is set; remaining tasks then report
    /// [`TaskStatus::Skipped`].
    pub async fn execute(&self, plan: &ExecutionPlan) -> ExecutionReport {
        let correlation = Uuid::new_v4();
        let started_at = Utc::now();
        info!(
            total_tasks = plan.total_tasks,
            levels = plan.levels.len(),
            "execution started"
        );
        self.publish(
            "execution:started",
            json!({
                "totalTasks": plan.total_tasks,
                "totalLevels": plan.levels.len(),
            }),
            correlation,
        )
        .await;

        let mut results: HashMap<String, TaskRecord> = HashMap::new();
        let mut aborted = false;

        for level in &plan.levels {
            if self.cancel.is_cancelled() || aborted {
                let status = if self.cancel.is_cancelled() {
                    TaskStatus::Cancelled
                } else {
                    TaskStatus::Skipped
                };
                for task in &level.tasks {
                    results.insert(task.id.clone(), unstarted(task, status));
                }
                continue;
            }

            self.publish(
                "level:started",
                json!({ "level": level.level, "taskCount": level.tasks.len() }),
                correlation,
            )
            .await;

            let semaphore = Arc::new(Semaphore::new(self.config.max_concurrency.max(1)));
            let runs = level
                .tasks
                .iter()
                .map(|task| self.run_task(task, Arc::clone(&semaphore), correlation));
            let records = join_all(runs).await;

            self.publish(
                "level:completed",
                json!({
                    "level": level.level,
                    "results": records
                        .iter()
                        .map(|r| json!({ "taskId": r.task_id, "status": r.status }))
                        .collect::<Vec<_>>(),
                }),
                correlation,
            )
            .await;

            let any_failed = records.iter().any(|r| r.status == TaskStatus::Failed);
            for record in records {
                results.insert(record.task_id.clone(), record);
            }
            if any_failed && !self.config.continue_on_failure {
                warn!(level = level.level, "level failed; aborting remaining levels");
                aborted = true;
            }
        }

        let completed_at = Utc::now();
        let count = |status: TaskStatus| results.values().filter(|r| r.status == status).count();
        let report = ExecutionReport {
            completed: count(TaskStatus::Completed),
            failed: count(TaskStatus::Failed),
            cancelled: count(TaskStatus::Cancelled),
            skipped: count(TaskStatus::Skipped),
            started_at,
            completed_at,
            duration: completed_at
                .signed_duration_since(started_at)
                .to_std()
                .unwrap_or_default(),
            results,
        };

        self.publish(
            "execution:completed",
            json!({
                "completed": report.completed,
                "failed": report.failed,
                "cancelled": report.cancelled,
                "skipped": report.skipped,
                "startedAt": report.started_at,
                "completedAt": report.completed_at,
                "durationMs": report.duration.as_millis() as u64,
            }),
            correlation,
        )
        .await;
        info!(
            completed = report.completed,
            failed = report.failed,
            "execution finished"
        );
        report
    }

    async fn run_task(
        &self,
        node: &TaskWithDependencies,
        semaphore: Arc<Semaphore>,
        correlation: Uuid,
    ) -> TaskRecord {
        // Cancellation is observed between tasks.
        if self.cancel.is_cancelled() {
            return unstarted(node, TaskStatus::Cancelled);
        }
        let Ok(_permit) = semaphore.acquire().await else {
            return unstarted(node, TaskStatus::Cancelled);
        };

        let task = &node.task;
        let started = Utc::now();
        let total_attempts = self.config.retry_attempts.max(1);
        let mut last_error: Option<String> = None;
        let mut agent_used: Option<String> = None;
        let mut attempts = 0;

        for attempt in 1..=total_attempts {
            attempts = attempt;
            if attempt == 1 {
                self.publish(
                    "task:started",
                    json!({ "taskId": task.id, "attempt": attempt }),
                    correlation,
                )
                .await;
            } else {
                self.publish(
                    "task:retry",
                    json!({ "taskId": task.id, "attempt": attempt, "error": &last_error }),
                    correlation,
                )
                .await;
                let delay = self.retry_delay(attempt);
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
            }

            match self.dispatch.acquire(task).await {
                Ok(agent_id) => {
                    agent_used = Some(agent_id.clone());
                    match self.executor.execute(&agent_id, task).await {
                        Ok(result) => {
                            let _ = self
                                .dispatch
                                .release(&agent_id, task, &TaskOutcome::Success(result.clone()))
                                .await;
                            self.publish(
                                "task:completed",
                                json!({ "taskId": task.id, "agentId": agent_id, "attempt": attempt }),
                                correlation,
                            )
                            .await;
                            return TaskRecord {
                                task_id: task.id.clone(),
                                status: TaskStatus::Completed,
                                agent_id: agent_used,
                                result: Some(result),
                                error: None,
                                attempts,
                                duration: elapsed_since(started),
                            };
                        }
                        Err(error) => {
                            let message = error.to_string();
                            let _ = self
                                .dispatch
                                .release(&agent_id, task, &TaskOutcome::Failure(message.clone()))
                                .await;
                            debug!(task_id = %task.id, attempt, %message, "task attempt failed");
                            last_error = Some(message);
                        }
                    }
                }
                Err(error) => {
                    debug!(task_id = %task.id, attempt, %error, "agent acquisition failed");
                    last_error = Some(error.to_string());
                }
            }

            // Cancellation suppresses further retries.
            if self.cancel.is_cancelled() {
                break;
            }
        }

        self.publish(
            "task:failed",
            json!({
                "taskId": task.id,
                "agentId": &agent_used,
                "attempt": attempts,
                "error": &last_error,
            }),
            correlation,
        )
        .await;
        TaskRecord {
            task_id: task.id.clone(),
            status: TaskStatus::Failed,
            agent_id: agent_used,
            result: None,
            error: last_error,
            attempts,
            duration: elapsed_since(started),
        }
    }

    fn retry_delay(&self, attempt: u32) -> Duration {
        let base = self.config.retry_delay_ms;
        let factor = match self.config.retry_backoff {
            RetryBackoff::Fixed => 1,
            RetryBackoff::Linear => u64::from(attempt.saturating_sub(1)),
            RetryBackoff::Exponential => 1u64 << attempt.saturating_sub(2).min(16),
        };
        Duration::from_millis(base.saturating_mul(factor))
    }

    async fn publish(&self, event_type: &str, payload: serde_json::Value, correlation: Uuid) {
        if let Err(error) = self
            .bus
            .publish(
                event_type,
                payload,
                PublishOptions::from_source("execution-engine").correlated(correlation),
            )
            .await
        {
            warn!(%error, event_type, "failed to publish execution event");
        }
    }
}

fn unstarted(node: &TaskWithDependencies, status: TaskStatus) -> TaskRecord {
    TaskRecord {
        task_id: node.id.clone(),
        status,
        agent_id: None,
        result: None,
        error: None,
        attempts: 0,
        duration: Duration::ZERO,
    }
}

fn elapsed_since(started: DateTime<Utc>) -> Duration {
    Utc::now()
        .signed_duration_since(started)
        .to_std()
        .unwrap_or_default()
}
