//! Integration seams consumed by the execution and workflow engines.

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;

use flotilla_types::Task;

/// How an executed task ended, reported back through [`AgentDispatch`].
#[derive(Debug, Clone)]
pub enum TaskOutcome {
    /// The executor returned a result.
    Success(Value),
    /// The executor raised; the payload is the error description.
    Failure(String),
}

/// The out-of-process worker protocol.
///
/// `execute` is called only after the assigned agent's state machine is
/// `busy` and returns the task's final result synchronously; streaming
/// protocols layer on top at the integrator's discretion. Failures
/// propagate as ordinary errors subject to the caller's retry policy.
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    /// Run a task on an agent and return its result.
    async fn execute(&self, agent_id: &str, task: &Task) -> Result<Value>;

    /// Best-effort cancellation of an in-flight task.
    async fn cancel(&self, task_id: &str) -> Result<()> {
        let _ = task_id;
        Ok(())
    }
}

/// Narrow seam through which engines acquire and release agents.
///
/// Implementations bind the selector, the stateful registry, and quota
/// admission together; engines stay unaware of all three.
#[async_trait]
pub trait AgentDispatch: Send + Sync {
    /// Pick an agent for the task and transition it to busy.
    /// Fails when no agent can be acquired.
    async fn acquire(&self, task: &Task) -> Result<String>;

    /// Return an agent after its task settled, reporting the outcome so the
    /// agent's machine transitions back to idle or error.
    async fn release(&self, agent_id: &str, task: &Task, outcome: &TaskOutcome) -> Result<()>;
}
