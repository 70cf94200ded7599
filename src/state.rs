//! Mutable run state for tasks and for the graph as a whole.
//!
//! Every status change goes through [`StateBoard`], which enforces the
//! lifecycle (`pending -> running -> {completed, failed}`, plus
//! `cancelled` from either non-terminal state) and publishes a
//! [`StatusEvent`] for each transition.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Mutex, PoisonError, RwLock};
use std::time::Duration;
use crate::reporter::{EventBus, EventKind, StatusEvent};
use crate::{ExecutionError, TaskError, TaskOutput};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// `Cancelled` is a failure variant.
    pub fn is_failure(self) -> bool {
        matches!(self, Self::Failed | Self::Cancelled)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GraphStatus {
    NotStarted,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl GraphStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl fmt::Display for GraphStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::NotStarted => "not_started",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskState {
    pub status: TaskStatus,
    /// Set only once the task is completed.
    pub result: Option<TaskOutput>,
    /// Error text of the most recent failed attempt.
    pub error: Option<String>,
    pub attempt_count: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Default for TaskState {
    fn default() -> Self {
        Self {
            status: TaskStatus::Pending,
            result: None,
            error: None,
            attempt_count: 0,
            started_at: None,
            finished_at: None,
        }
    }
}

/// Point-in-time view of one task, as returned by `task_status`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSnapshot {
    pub task_id: String,
    pub status: TaskStatus,
    pub attempt_count: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration: Option<Duration>,
    pub error: Option<String>,
    pub result: Option<TaskOutput>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskCounts {
    pub pending: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
}

impl TaskCounts {
    fn add(&mut self, status: TaskStatus) {
        match status {
            TaskStatus::Pending => self.pending += 1,
            TaskStatus::Running => self.running += 1,
            TaskStatus::Completed => self.completed += 1,
            TaskStatus::Failed => self.failed += 1,
            TaskStatus::Cancelled => self.cancelled += 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphStatusReport {
    pub status: GraphStatus,
    pub task_counts: TaskCounts,
    pub total_tasks: usize,
    pub is_running: bool,
    pub has_failed: bool,
}

pub(crate) struct StateBoard {
    tasks: RwLock<HashMap<String, TaskState>>,
    graph: Mutex<GraphStatus>,
    events: EventBus,
}

impl StateBoard {
    pub(crate) fn new(events: EventBus) -> Self {
        Self {
            tasks: RwLock::new(HashMap::new()),
            graph: Mutex::new(GraphStatus::NotStarted),
            events,
        }
    }

    pub(crate) fn insert_pending(&self, task_id: &str) {
        self.tasks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(task_id.to_string(), TaskState::default());
        self.events.emit(StatusEvent::now(EventKind::TaskAdded {
            task_id: task_id.to_string(),
        }));
    }

    pub(crate) fn graph_status(&self) -> GraphStatus {
        *self.graph.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// `not started -> running`. Fails if the graph was already executed.
    pub(crate) fn begin_graph(&self) -> Result<(), ExecutionError> {
        let mut graph = self.graph.lock().unwrap_or_else(PoisonError::into_inner);
        if *graph != GraphStatus::NotStarted {
            return Err(ExecutionError::AlreadyStarted);
        }
        *graph = GraphStatus::Running;
        self.events.emit(StatusEvent::now(EventKind::Graph {
            from: GraphStatus::NotStarted,
            to: GraphStatus::Running,
        }));
        Ok(())
    }

    pub(crate) fn finish_graph(&self, to: GraphStatus) {
        let mut graph = self.graph.lock().unwrap_or_else(PoisonError::into_inner);
        if *graph != GraphStatus::Running || !to.is_terminal() {
            return;
        }
        let from = *graph;
        *graph = to;
        self.events
            .emit(StatusEvent::now(EventKind::Graph { from, to }));
    }

    /// `pending -> running`. Rejecting anything else guarantees at most one
    /// in-flight runner per task.
    pub(crate) fn start(&self, task_id: &str) -> Result<(), ExecutionError> {
        self.transition(task_id, TaskStatus::Running, |state| {
            state.started_at = Some(Utc::now());
        })
    }

    /// Count a new attempt and return its 1-based number.
    pub(crate) fn begin_attempt(&self, task_id: &str) -> u32 {
        let mut tasks = self.tasks.write().unwrap_or_else(PoisonError::into_inner);
        match tasks.get_mut(task_id) {
            Some(state) => {
                state.attempt_count += 1;
                state.attempt_count
            }
            None => 0,
        }
    }

    pub(crate) fn record_attempt_failure(&self, task_id: &str, error: &TaskError) {
        let mut tasks = self.tasks.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(state) = tasks.get_mut(task_id) {
            state.error = Some(error.to_string());
        }
    }

    pub(crate) fn complete(&self, task_id: &str, output: TaskOutput) -> Result<(), ExecutionError> {
        self.transition(task_id, TaskStatus::Completed, |state| {
            state.result = Some(output);
            state.error = None;
            state.finished_at = Some(Utc::now());
        })
    }

    /// Terminal failure. `interrupted` marks a run cut short by graph
    /// cancellation and ends in `cancelled`. Everything else, including work
    /// that reports [`TaskError::Cancelled`] on its own, ends in `failed`.
    pub(crate) fn fail(
        &self,
        task_id: &str,
        error: &TaskError,
        interrupted: bool,
    ) -> Result<(), ExecutionError> {
        let to = if interrupted {
            TaskStatus::Cancelled
        } else {
            TaskStatus::Failed
        };
        let text = error.to_string();
        self.transition(task_id, to, |state| {
            state.error = Some(text);
            state.finished_at = Some(Utc::now());
        })
    }

    /// Cancel every task still pending. Returns the cancelled ids in
    /// `order`.
    pub(crate) fn cancel_pending(&self, order: &[String]) -> Vec<String> {
        let mut cancelled = Vec::new();
        for task_id in order {
            let pending = self
                .status(task_id)
                .is_some_and(|status| status == TaskStatus::Pending);
            if pending
                && self
                    .transition(task_id, TaskStatus::Cancelled, |state| {
                        state.error = Some(TaskError::Cancelled.to_string());
                        state.finished_at = Some(Utc::now());
                    })
                    .is_ok()
            {
                cancelled.push(task_id.clone());
            }
        }
        cancelled
    }

    pub(crate) fn status(&self, task_id: &str) -> Option<TaskStatus> {
        self.tasks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(task_id)
            .map(|state| state.status)
    }

    pub(crate) fn state(&self, task_id: &str) -> Option<TaskState> {
        self.tasks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(task_id)
            .cloned()
    }

    pub(crate) fn snapshot(&self, task_id: &str) -> Option<TaskSnapshot> {
        let state = self.state(task_id)?;
        let duration = match (state.started_at, state.finished_at) {
            (Some(start), Some(end)) => (end - start).to_std().ok(),
            _ => None,
        };
        Some(TaskSnapshot {
            task_id: task_id.to_string(),
            status: state.status,
            attempt_count: state.attempt_count,
            started_at: state.started_at,
            finished_at: state.finished_at,
            duration,
            error: state.error,
            result: state.result,
        })
    }

    /// Results of the given dependencies, keyed by id. Only completed
    /// dependencies contribute.
    pub(crate) fn dependency_results(&self, deps: &[String]) -> HashMap<String, TaskOutput> {
        let tasks = self.tasks.read().unwrap_or_else(PoisonError::into_inner);
        deps.iter()
            .filter_map(|dep| {
                let state = tasks.get(dep)?;
                match (&state.status, &state.result) {
                    (TaskStatus::Completed, Some(result)) => Some((dep.clone(), result.clone())),
                    _ => None,
                }
            })
            .collect()
    }

    pub(crate) fn completed_results(&self) -> HashMap<String, TaskOutput> {
        let tasks = self.tasks.read().unwrap_or_else(PoisonError::into_inner);
        tasks
            .iter()
            .filter_map(|(id, state)| {
                (state.status == TaskStatus::Completed)
                    .then(|| state.result.clone().map(|r| (id.clone(), r)))
                    .flatten()
            })
            .collect()
    }

    pub(crate) fn report(&self) -> GraphStatusReport {
        let tasks = self.tasks.read().unwrap_or_else(PoisonError::into_inner);
        let mut task_counts = TaskCounts::default();
        for state in tasks.values() {
            task_counts.add(state.status);
        }
        GraphStatusReport {
            status: self.graph_status(),
            task_counts,
            total_tasks: tasks.len(),
            is_running: task_counts.running > 0,
            has_failed: task_counts.failed > 0 || task_counts.cancelled > 0,
        }
    }

    fn transition<F>(&self, task_id: &str, to: TaskStatus, update: F) -> Result<(), ExecutionError>
    where
        F: FnOnce(&mut TaskState),
    {
        let mut tasks = self.tasks.write().unwrap_or_else(PoisonError::into_inner);
        let state = tasks.get_mut(task_id).ok_or_else(|| {
            ExecutionError::Invariant(format!("no run state for task {task_id}"))
        })?;

        let from = state.status;
        let allowed = match (from, to) {
            (TaskStatus::Pending, TaskStatus::Running | TaskStatus::Cancelled) => true,
            (TaskStatus::Running, to) => to.is_terminal(),
            _ => false,
        };
        if !allowed {
            return Err(ExecutionError::Invariant(format!(
                "task {task_id} cannot move from {from} to {to}"
            )));
        }

        state.status = to;
        update(&mut *state);

        let error = if to.is_failure() { state.error.clone() } else { None };
        self.events.emit(StatusEvent::now(EventKind::Task {
            task_id: task_id.to_string(),
            from,
            to,
            attempt_count: state.attempt_count,
            error,
        }));
        Ok(())
    }
}
