//! Status reporting.
//!
//! The engine never calls a [`StatusReporter`] inline. Transitions are
//! queued on an unbounded channel and a background dispatcher forwards
//! them, in order, to every registered reporter. Each reporter is fed
//! from its own task, so a slow one only delays itself. A reporter that
//! errors or panics is logged and otherwise ignored.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};
use crate::{GraphStatus, TaskStatus};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    /// A task entered the graph as `pending`.
    TaskAdded { task_id: String },
    Task {
        task_id: String,
        from: TaskStatus,
        to: TaskStatus,
        attempt_count: u32,
        /// Present on failure transitions.
        error: Option<String>,
    },
    Graph {
        from: GraphStatus,
        to: GraphStatus,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusEvent {
    #[serde(flatten)]
    pub kind: EventKind,
    pub timestamp: DateTime<Utc>,
}

impl StatusEvent {
    pub fn now(kind: EventKind) -> Self {
        Self {
            kind,
            timestamp: Utc::now(),
        }
    }

    pub fn task_id(&self) -> Option<&str> {
        match &self.kind {
            EventKind::TaskAdded { task_id } | EventKind::Task { task_id, .. } => Some(task_id),
            EventKind::Graph { .. } => None,
        }
    }
}

#[derive(Error, Debug)]
pub enum ReporterError {
    #[error("reporter channel closed")]
    ChannelClosed,
    #[error("reporter failed: {0}")]
    Failed(String),
}

#[async_trait]
pub trait StatusReporter: Send + Sync {
    async fn on_event(&self, event: &StatusEvent) -> Result<(), ReporterError>;
}

/// Sending half of the event queue, shared by everything that records
/// transitions.
#[derive(Clone)]
pub(crate) struct EventBus {
    tx: mpsc::UnboundedSender<StatusEvent>,
}

impl EventBus {
    pub(crate) fn new() -> (Self, mpsc::UnboundedReceiver<StatusEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// A bus nobody listens to.
    #[cfg(test)]
    pub(crate) fn detached() -> Self {
        Self::new().0
    }

    pub(crate) fn emit(&self, event: StatusEvent) {
        // A closed queue only means nobody is listening any more.
        let _ = self.tx.send(event);
    }
}

/// Drain `rx` into `reporters` until every sender is dropped, then wait
/// for each reporter to catch up.
pub(crate) async fn dispatch(
    mut rx: mpsc::UnboundedReceiver<StatusEvent>,
    reporters: Vec<Arc<dyn StatusReporter>>,
) {
    let mut sinks = JoinSet::new();
    let mut queues = Vec::with_capacity(reporters.len());
    for reporter in reporters {
        let (tx, sink_rx) = mpsc::unbounded_channel();
        queues.push(tx);
        sinks.spawn(deliver(sink_rx, reporter));
    }

    while let Some(event) = rx.recv().await {
        for queue in &queues {
            let _ = queue.send(event.clone());
        }
    }

    drop(queues);
    while sinks.join_next().await.is_some() {}
}

async fn deliver(
    mut rx: mpsc::UnboundedReceiver<StatusEvent>,
    reporter: Arc<dyn StatusReporter>,
) {
    while let Some(event) = rx.recv().await {
        match AssertUnwindSafe(reporter.on_event(&event))
            .catch_unwind()
            .await
        {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "status reporter failed"),
            Err(_) => error!("status reporter panicked"),
        }
    }
}

/// Logs every event through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingReporter;

#[async_trait]
impl StatusReporter for TracingReporter {
    async fn on_event(&self, event: &StatusEvent) -> Result<(), ReporterError> {
        match &event.kind {
            EventKind::TaskAdded { task_id } => debug!(%task_id, "task added"),
            EventKind::Task {
                task_id,
                from,
                to,
                attempt_count,
                error: Some(error),
            } => warn!(%task_id, %from, %to, attempt_count, %error, "task status changed"),
            EventKind::Task {
                task_id,
                from,
                to,
                attempt_count,
                error: None,
            } => info!(%task_id, %from, %to, attempt_count, "task status changed"),
            EventKind::Graph { from, to } => info!(%from, %to, "graph status changed"),
        }
        Ok(())
    }
}

/// Forwards events to an `mpsc` receiver, e.g. for a websocket or dashboard
/// collaborator.
#[derive(Debug, Clone)]
pub struct ChannelReporter {
    tx: mpsc::UnboundedSender<StatusEvent>,
}

impl ChannelReporter {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<StatusEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl StatusReporter for ChannelReporter {
    async fn on_event(&self, event: &StatusEvent) -> Result<(), ReporterError> {
        self.tx
            .send(event.clone())
            .map_err(|_| ReporterError::ChannelClosed)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    /// Number of transitions into each status. `pending` counts tasks
    /// added to the graph.
    pub transitions: HashMap<TaskStatus, u64>,
    /// Tasks currently running.
    pub active_tasks: u64,
    /// Wall-clock time from `running` to a terminal status, per task.
    pub task_durations: HashMap<String, Duration>,
}

#[derive(Default)]
struct MetricsInner {
    snapshot: MetricsSnapshot,
    started: HashMap<String, DateTime<Utc>>,
}

/// In-process counters fed by status events.
#[derive(Default)]
pub struct MetricsReporter {
    inner: Mutex<MetricsInner>,
}

impl MetricsReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .snapshot
            .clone()
    }

    fn record(&self, event: &StatusEvent) {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let (task_id, from, to) = match &event.kind {
            EventKind::TaskAdded { .. } => {
                *inner
                    .snapshot
                    .transitions
                    .entry(TaskStatus::Pending)
                    .or_default() += 1;
                return;
            }
            EventKind::Task {
                task_id, from, to, ..
            } => (task_id, from, to),
            EventKind::Graph { .. } => return,
        };
        *inner.snapshot.transitions.entry(*to).or_default() += 1;

        if *to == TaskStatus::Running {
            inner.snapshot.active_tasks += 1;
            inner.started.insert(task_id.clone(), event.timestamp);
        } else if *from == TaskStatus::Running {
            inner.snapshot.active_tasks = inner.snapshot.active_tasks.saturating_sub(1);
            if let Some(started) = inner.started.remove(task_id) {
                let elapsed = (event.timestamp - started).to_std().unwrap_or_default();
                inner
                    .snapshot
                    .task_durations
                    .insert(task_id.clone(), elapsed);
            }
        }
    }
}

#[async_trait]
impl StatusReporter for MetricsReporter {
    async fn on_event(&self, event: &StatusEvent) -> Result<(), ReporterError> {
        self.record(event);
        Ok(())
    }
}
