pub mod config;
pub mod cycle_check;
pub mod executor;
pub mod graph;
pub mod reporter;
pub mod retry;
pub mod state;
pub mod task;
pub mod visualize;

pub use config::{ExecutorConfig, SchedulingMode};
pub use cycle_check::find_cycle;
pub use executor::{GraphRun, TaskDag};
pub use graph::DependencyGraph;
pub use reporter::{
    ChannelReporter, EventKind, MetricsReporter, MetricsSnapshot, ReporterError, StatusEvent,
    StatusReporter, TracingReporter,
};
pub use retry::{TaskPolicy, TaskRunner};
pub use state::{GraphStatus, GraphStatusReport, TaskCounts, TaskSnapshot, TaskState, TaskStatus};
pub use task::{Task, Work, work_fn};

use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;

pub type TaskOutput = serde_json::Value;
pub type TaskInput = HashMap<String, TaskOutput>;

/// Construction-time errors. Always fatal to the offending call and never
/// retried; the graph is unchanged when one is returned.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GraphError {
    #[error("task {0} already exists")]
    DuplicateTask(String),
    #[error("task {task_id} depends on unknown task {dependency}")]
    UnknownDependency { task_id: String, dependency: String },
    #[error("dependency cycle detected: {}", path.join(" -> "))]
    Cycle { path: Vec<String> },
    #[error("task {0} not found")]
    UnknownTask(String),
    #[error("graph execution has already started; topology is frozen")]
    ExecutionStarted,
}

/// Outcome classification of a single attempt.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TaskError {
    #[error("task failed: {0}")]
    Failed(String),
    #[error("task failed permanently: {0}")]
    Permanent(String),
    #[error("task timed out after {after:?}")]
    Timeout { after: Duration },
    #[error("task panicked: {0}")]
    Panicked(String),
    #[error("task cancelled")]
    Cancelled,
}

impl TaskError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self::Permanent(message.into())
    }

    /// Whether another attempt may follow this one. Timeouts count against
    /// the same budget as any other work failure.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Failed(_) | Self::Timeout { .. } | Self::Panicked(_)
        )
    }
}

#[derive(Error, Debug)]
pub enum ExecutionError {
    #[error(transparent)]
    Graph(#[from] GraphError),
    #[error("graph has already been executed")]
    AlreadyStarted,
    #[error("task {task_id} failed: {source}")]
    TaskFailed {
        task_id: String,
        #[source]
        source: TaskError,
        blocked: Vec<String>,
    },
    #[error("task {task_id} cannot run: dependency {dependency} did not complete")]
    DependencyFailed { task_id: String, dependency: String },
    #[error("execution cancelled ({completed} completed, {cancelled} cancelled)")]
    Cancelled { completed: usize, cancelled: usize },
    #[error("join error: {0}")]
    Join(String),
    #[error("executor invariant violated: {0}")]
    Invariant(String),
}
