//! Progress aggregation over the engine's bus events.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use flotilla_bus::EventBus;
use flotilla_types::Event;

/// Point-in-time progress view.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionProgress {
    /// Total tasks in the run.
    pub total_tasks: usize,
    /// Tasks completed so far.
    pub completed_tasks: usize,
    /// Tasks failed so far.
    pub failed_tasks: usize,
    /// Tasks currently running.
    pub running_tasks: usize,
    /// Level currently executing.
    pub current_level: u32,
    /// Total levels in the run.
    pub total_levels: usize,
    /// Settled fraction of the run, in percent.
    pub percentage: f64,
    /// Agents currently occupied by this run.
    pub active_agents: usize,
    /// Mean-duration ETA over not-yet-started tasks, when enabled.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_time_remaining: Option<Duration>,
}

/// End-of-run (or mid-run) status counts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionSummary {
    /// Total tasks in the run.
    pub total_tasks: usize,
    /// Completed count.
    pub completed: usize,
    /// Failed count.
    pub failed: usize,
    /// Cancelled count.
    pub cancelled: usize,
    /// Skipped count.
    pub skipped: usize,
    /// Currently running count.
    pub running: usize,
    /// Not yet started count.
    pub pending: usize,
    /// Mean duration of completed tasks.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub average_task_duration: Option<Duration>,
}

#[derive(Default)]
struct TrackerState {
    total_tasks: usize,
    total_levels: usize,
    current_level: u32,
    completed: usize,
    failed: usize,
    cancelled: usize,
    skipped: usize,
    running: usize,
    started_at: HashMap<String, DateTime<Utc>>,
    completed_durations: Vec<Duration>,
}

/// Aggregates per-task status into progress, ETA, and summary views by
/// listening to the engine's events.
pub struct ExecutionTracker {
    bus: EventBus,
    state: Arc<StdMutex<TrackerState>>,
    enable_eta: bool,
    subscriptions: Vec<Uuid>,
}

impl ExecutionTracker {
    /// Attach a tracker to the bus; it follows `execution:*`, `level:*`,
    /// and `task:*` events from then on.
    pub fn attach(bus: EventBus, enable_eta: bool) -> Self {
        let state = Arc::new(StdMutex::new(TrackerState::default()));
        let mut subscriptions = Vec::new();

        let patterns: [&str; 6] = [
            "execution:started",
            "execution:completed",
            "level:started",
            "task:started",
            "task:completed",
            "task:failed",
        ];
        for pattern in patterns {
            let state = Arc::clone(&state);
            let id = bus.subscribe(pattern, move |event| {
                let state = Arc::clone(&state);
                async move {
                    Self::apply(&state, &event);
                    Ok(())
                }
            });
            subscriptions.push(id);
        }

        Self {
            bus,
            state,
            enable_eta,
            subscriptions,
        }
    }

    /// Reset counters for a fresh run.
    pub fn initialize(&self, total_tasks: usize, total_levels: usize) {
        let mut state = self.lock();
        *state = TrackerState {
            total_tasks,
            total_levels,
            ..TrackerState::default()
        };
    }

    /// Remove the tracker's bus subscriptions.
    pub fn detach(&mut self) {
        for id in self.subscriptions.drain(..) {
            self.bus.unsubscribe(id);
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, TrackerState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn apply(state: &Arc<StdMutex<TrackerState>>, event: &Event) {
        let mut state = state.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let payload = &event.payload;
        match event.event_type.as_str() {
            "execution:started" => {
                let total_tasks = payload["totalTasks"].as_u64().unwrap_or(0) as usize;
                let total_levels = payload["totalLevels"].as_u64().unwrap_or(0) as usize;
                *state = TrackerState {
                    total_tasks,
                    total_levels,
                    ..TrackerState::default()
                };
            }
            "execution:completed" => {
                state.completed = payload["completed"].as_u64().unwrap_or(0) as usize;
                state.failed = payload["failed"].as_u64().unwrap_or(0) as usize;
                state.cancelled = payload["cancelled"].as_u64().unwrap_or(0) as usize;
                state.skipped = payload["skipped"].as_u64().unwrap_or(0) as usize;
                state.running = 0;
                state.started_at.clear();
            }
            "level:started" => {
                state.current_level = payload["level"].as_u64().unwrap_or(0) as u32;
            }
            "task:started" => {
                state.running += 1;
                if let Some(task_id) = payload["taskId"].as_str() {
                    state.started_at.insert(task_id.to_string(), event.timestamp);
                }
            }
            "task:completed" => {
                state.running = state.running.saturating_sub(1);
                state.completed += 1;
                if let Some(task_id) = payload["taskId"].as_str() {
                    if let Some(started) = state.started_at.remove(task_id) {
                        let duration = event
                            .timestamp
                            .signed_duration_since(started)
                            .to_std()
                            .unwrap_or_default();
                        state.completed_durations.push(duration);
                    }
                }
            }
            "task:failed" => {
                state.running = state.running.saturating_sub(1);
                state.failed += 1;
                if let Some(task_id) = payload["taskId"].as_str() {
                    state.started_at.remove(task_id);
                }
            }
            _ => {}
        }
    }

    /// Current progress view.
    pub fn get_progress(&self) -> ExecutionProgress {
        let state = self.lock();
        let settled = state.completed + state.failed + state.cancelled + state.skipped;
        let percentage = if state.total_tasks > 0 {
            settled as f64 / state.total_tasks as f64 * 100.0
        } else {
            0.0
        };
        let estimated_time_remaining = if self.enable_eta && !state.completed_durations.is_empty() {
            let not_started = state
                .total_tasks
                .saturating_sub(settled + state.running);
            let mean = state
                .completed_durations
                .iter()
                .sum::<Duration>()
                .checked_div(state.completed_durations.len() as u32)
                .unwrap_or_default();
            Some(mean.saturating_mul(not_started as u32))
        } else {
            None
        };
        ExecutionProgress {
            total_tasks: state.total_tasks,
            completed_tasks: state.completed,
            failed_tasks: state.failed,
            running_tasks: state.running,
            current_level: state.current_level,
            total_levels: state.total_levels,
            percentage,
            active_agents: state.running,
            estimated_time_remaining,
        }
    }

    /// Current status counts.
    pub fn get_summary(&self) -> ExecutionSummary {
        let state = self.lock();
        let settled = state.completed + state.failed + state.cancelled + state.skipped;
        let pending = state
            .total_tasks
            .saturating_sub(settled + state.running);
        let average_task_duration = if state.completed_durations.is_empty() {
            None
        } else {
            state
                .completed_durations
                .iter()
                .sum::<Duration>()
                .checked_div(state.completed_durations.len() as u32)
        };
        ExecutionSummary {
            total_tasks: state.total_tasks,
            completed: state.completed,
            failed: state.failed,
            cancelled: state.cancelled,
            skipped: state.skipped,
            running: state.running,
            pending,
            average_task_duration,
        }
    }
}

impl Drop for ExecutionTracker {
    fn drop(&mut self) {
        self.detach();
    }
}
