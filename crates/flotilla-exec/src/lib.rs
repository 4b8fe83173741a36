#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **flotilla-exec** – Execution plan walking for Flotilla.
//!
//! The [`ExecutionEngine`] walks an
//! [`ExecutionPlan`](flotilla_types::ExecutionPlan) level by level: within a
//! level tasks run concurrently up to `max_concurrency`, across levels no
//! task starts before the previous level settled. Agents come from the
//! injected [`AgentDispatch`] seam, work runs through the injected
//! [`TaskExecutor`], failures retry per policy, and every lifecycle point
//! is published on the bus. The [`ExecutionTracker`] folds those events
//! into progress, summary, and ETA views.

mod engine;
mod tracker;
mod traits;

pub use engine::{ExecutionEngine, ExecutionReport, TaskRecord, TaskStatus};
pub use tracker::{ExecutionProgress, ExecutionSummary, ExecutionTracker};
pub use traits::{AgentDispatch, TaskExecutor, TaskOutcome};
