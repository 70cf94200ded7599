use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::{OwnedSemaphorePermit, Semaphore, mpsc};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span, warn};
use crate::reporter::{EventBus, StatusEvent, StatusReporter, dispatch};
use crate::state::StateBoard;
use crate::{
    DependencyGraph, ExecutionError, ExecutorConfig, GraphError, GraphStatus, GraphStatusReport,
    SchedulingMode, Task, TaskError, TaskOutput, TaskRunner, TaskSnapshot, TaskStatus, visualize,
};

/// Aggregated outcome of a successful `execute` call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphRun {
    pub results: HashMap<String, TaskOutput>,
    /// Task ids in the order they completed.
    pub execution_order: Vec<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration: Duration,
}

/// A dependency graph of tasks together with its run state.
///
/// Build it with [`add_task`](Self::add_task), run it once with
/// [`execute`](Self::execute). Status queries take `&self` and may be issued
/// while execution is in progress, e.g. through an `Arc<TaskDag>`.
pub struct TaskDag {
    graph: DependencyGraph,
    board: Arc<StateBoard>,
    config: ExecutorConfig,
    reporters: Vec<Arc<dyn StatusReporter>>,
    event_rx: Mutex<Option<mpsc::UnboundedReceiver<StatusEvent>>>,
    cancel: CancellationToken,
}

impl Default for TaskDag {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskDag {
    pub fn new() -> Self {
        Self::with_config(ExecutorConfig::default())
    }

    pub fn with_config(config: ExecutorConfig) -> Self {
        let (events, event_rx) = EventBus::new();
        Self {
            graph: DependencyGraph::new(),
            board: Arc::new(StateBoard::new(events)),
            config,
            reporters: Vec::new(),
            event_rx: Mutex::new(Some(event_rx)),
            cancel: CancellationToken::new(),
        }
    }

    /// Register a status sink. Events are delivered from a background task
    /// once execution starts.
    pub fn with_reporter(mut self, reporter: Arc<dyn StatusReporter>) -> Self {
        self.add_reporter(reporter);
        self
    }

    pub fn add_reporter(&mut self, reporter: Arc<dyn StatusReporter>) {
        self.reporters.push(reporter);
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Insert a task. Its dependencies must already be in the graph. On
    /// error nothing changes.
    pub fn add_task(&mut self, task: Task) -> Result<(), GraphError> {
        if self.board.graph_status() != GraphStatus::NotStarted {
            return Err(GraphError::ExecutionStarted);
        }
        let task_id = task.id().to_string();
        if let Err(e) = self.graph.add_task(task) {
            warn!(%task_id, error = %e, "failed to add task");
            return Err(e);
        }
        self.board.insert_pending(&task_id);
        debug!(%task_id, deps = self.graph.dependencies(&task_id).len(), "task added");
        Ok(())
    }

    /// Run every task once, dependencies first. One-shot: a second call
    /// fails with [`ExecutionError::AlreadyStarted`].
    ///
    /// Fails with [`ExecutionError::TaskFailed`] naming the first task that
    /// exhausted its attempts and the tasks left pending behind it, or with
    /// [`ExecutionError::Cancelled`] if [`cancel`](Self::cancel) was called
    /// before every task completed.
    pub async fn execute(&self) -> Result<GraphRun, ExecutionError> {
        let order = self.graph.topological_order()?;
        self.board.begin_graph()?;
        self.start_dispatcher();

        let started_at = Utc::now();
        let clock = Instant::now();
        info!(tasks = order.len(), mode = ?self.config.mode, "graph execution started");

        let outcome = match self.config.mode {
            SchedulingMode::Sequential => self.run_sequential(&order).await,
            SchedulingMode::Concurrent => self.run_concurrent(&order).await,
        };

        if self.cancel.is_cancelled() {
            let cancelled = self.board.cancel_pending(&order);
            if !cancelled.is_empty() {
                debug!(?cancelled, "pending tasks cancelled");
            }
        }

        let counts = self.board.report().task_counts;
        let status = if counts.cancelled > 0 {
            GraphStatus::Cancelled
        } else if outcome.is_err() {
            GraphStatus::Failed
        } else {
            GraphStatus::Completed
        };
        self.board.finish_graph(status);

        let duration = clock.elapsed();
        info!(
            %status,
            completed = counts.completed,
            failed = counts.failed,
            cancelled = counts.cancelled,
            pending = counts.pending,
            duration_ms = duration.as_millis() as u64,
            "graph execution finished"
        );

        match (status, outcome) {
            (GraphStatus::Completed, Ok(execution_order)) => Ok(GraphRun {
                results: self.board.completed_results(),
                execution_order,
                started_at,
                finished_at: Utc::now(),
                duration,
            }),
            (GraphStatus::Cancelled, _) => Err(ExecutionError::Cancelled {
                completed: counts.completed,
                cancelled: counts.cancelled,
            }),
            (_, Err(e)) => Err(e),
            (status, Ok(_)) => Err(ExecutionError::Invariant(format!(
                "graph finished as {status} without an error"
            ))),
        }
    }

    async fn run_sequential(&self, order: &[String]) -> Result<Vec<String>, ExecutionError> {
        let mut done = Vec::with_capacity(order.len());

        for (pos, task_id) in order.iter().enumerate() {
            if self.cancel.is_cancelled() {
                break;
            }
            let task = self.ready_task(task_id)?;
            let inputs = self.board.dependency_results(task.dependencies());
            let runner = TaskRunner::new(task.policy().clone());

            let result = runner
                .run(&self.cancel, task, inputs, &self.board)
                .instrument(info_span!("task", %task_id))
                .await;

            match result {
                Ok(_) => done.push(task_id.clone()),
                Err(ExecutionError::TaskFailed {
                    source: TaskError::Cancelled,
                    ..
                }) if self.cancel.is_cancelled() => break,
                Err(ExecutionError::TaskFailed {
                    task_id, source, ..
                }) => {
                    return Err(ExecutionError::TaskFailed {
                        task_id,
                        source,
                        blocked: order[pos + 1..].to_vec(),
                    });
                }
                Err(e) => return Err(e),
            }
        }

        Ok(done)
    }

    async fn run_concurrent(&self, order: &[String]) -> Result<Vec<String>, ExecutionError> {
        let mut in_degrees: HashMap<&str, usize> = order
            .iter()
            .map(|id| (id.as_str(), self.graph.dependencies(id).len()))
            .collect();
        let mut ready: VecDeque<String> = order
            .iter()
            .filter(|id| in_degrees.get(id.as_str()) == Some(&0))
            .cloned()
            .collect();

        let semaphore = Arc::new(Semaphore::new(
            self.config.max_concurrency.clamp(1, Semaphore::MAX_PERMITS),
        ));
        let mut running = JoinSet::new();
        let mut done = Vec::with_capacity(order.len());
        let mut first_failure: Option<(String, TaskError)> = None;
        let mut failed = Vec::new();

        loop {
            while !self.cancel.is_cancelled() {
                if ready.is_empty() {
                    break;
                }
                let Ok(permit) = Arc::clone(&semaphore).try_acquire_owned() else {
                    break;
                };
                if let Some(task_id) = ready.pop_front() {
                    self.spawn_task(&mut running, task_id, permit)?;
                }
            }

            let Some(joined) = running.join_next().await else {
                break;
            };
            let (task_id, result) = joined.map_err(|e| ExecutionError::Join(e.to_string()))?;

            match result {
                Ok(_) => {
                    for child in self.graph.dependents(&task_id) {
                        if let Some(degree) = in_degrees.get_mut(child.as_str()) {
                            *degree -= 1;
                            if *degree == 0 {
                                ready.push_back(child.clone());
                            }
                        }
                    }
                    done.push(task_id);
                }
                Err(ExecutionError::TaskFailed { source, .. }) => {
                    let interrupted =
                        source == TaskError::Cancelled && self.cancel.is_cancelled();
                    if !interrupted && first_failure.is_none() {
                        first_failure = Some((task_id.clone(), source));
                    }
                    failed.push(task_id);
                }
                Err(e) => return Err(e),
            }
        }

        match first_failure {
            Some((task_id, source)) => {
                let mut blocked: Vec<String> = Vec::new();
                for id in &failed {
                    for downstream in self.graph.downstream_of(id) {
                        let pending = self.board.status(&downstream) == Some(TaskStatus::Pending);
                        if pending && !blocked.contains(&downstream) {
                            blocked.push(downstream);
                        }
                    }
                }
                Err(ExecutionError::TaskFailed {
                    task_id,
                    source,
                    blocked,
                })
            }
            None => Ok(done),
        }
    }

    fn spawn_task(
        &self,
        running: &mut JoinSet<(String, Result<TaskOutput, ExecutionError>)>,
        task_id: String,
        permit: OwnedSemaphorePermit,
    ) -> Result<(), ExecutionError> {
        let task = self.ready_task(&task_id)?.clone();
        let inputs = self.board.dependency_results(task.dependencies());
        let runner = TaskRunner::new(task.policy().clone());
        let board = Arc::clone(&self.board);
        let ctx = self.cancel.clone();
        let span = info_span!("task", %task_id);

        running.spawn(
            async move {
                let result = runner.run(&ctx, &task, inputs, &board).await;
                drop(permit);
                (task_id, result)
            }
            .instrument(span),
        );
        Ok(())
    }

    /// Look up a task about to be dispatched and check that every
    /// dependency has completed.
    fn ready_task(&self, task_id: &str) -> Result<&Task, ExecutionError> {
        let task = self
            .graph
            .task(task_id)
            .ok_or_else(|| ExecutionError::Invariant(format!("task {task_id} missing from graph")))?;
        for dep in task.dependencies() {
            if self.board.status(dep) != Some(TaskStatus::Completed) {
                return Err(ExecutionError::DependencyFailed {
                    task_id: task_id.to_string(),
                    dependency: dep.clone(),
                });
            }
        }
        Ok(task)
    }

    fn start_dispatcher(&self) {
        let rx = self
            .event_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(rx) = rx {
            if !self.reporters.is_empty() {
                tokio::spawn(dispatch(rx, self.reporters.clone()));
            }
        }
    }

    /// Abort an in-progress or future `execute`. Running attempts are
    /// interrupted, pending tasks end `cancelled`, completed tasks keep their
    /// results.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn task_status(&self, task_id: &str) -> Result<TaskSnapshot, GraphError> {
        self.board
            .snapshot(task_id)
            .ok_or_else(|| GraphError::UnknownTask(task_id.to_string()))
    }

    pub fn graph_status(&self) -> GraphStatusReport {
        self.board.report()
    }

    /// Results of every task completed so far.
    pub fn results(&self) -> HashMap<String, TaskOutput> {
        self.board.completed_results()
    }

    pub fn topological_order(&self) -> Result<Vec<String>, GraphError> {
        self.graph.topological_order()
    }

    pub fn task(&self, task_id: &str) -> Option<&Task> {
        self.graph.task(task_id)
    }

    pub fn tasks(&self) -> impl Iterator<Item = &Task> {
        self.graph.all_tasks()
    }

    pub fn graph(&self) -> &DependencyGraph {
        &self.graph
    }

    pub fn len(&self) -> usize {
        self.graph.len()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.is_empty()
    }

    /// Graphviz DOT source with nodes colored by current status.
    pub fn to_dot(&self) -> String {
        visualize::to_dot(&self.graph, |id| self.board.status(id))
    }

    /// Indented text tree starting from every root.
    pub fn render_tree(&self) -> String {
        visualize::render_tree(&self.graph)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ok(id: &str, deps: &[&str]) -> Task {
        let value = json!(id.to_uppercase());
        Task::from_fn(id, move |_| {
            let value = value.clone();
            async move { Ok(value) }
        })
        .depends_on(deps.iter().copied())
    }

    #[test]
    fn add_task_registers_pending_state() {
        let mut dag = TaskDag::new();
        dag.add_task(ok("a", &[])).unwrap();
        let snap = dag.task_status("a").unwrap();
        assert_eq!(snap.status, TaskStatus::Pending);
        assert_eq!(snap.attempt_count, 0);
        assert_eq!(dag.graph_status().status, GraphStatus::NotStarted);
    }

    #[test]
    fn unknown_task_status_is_an_error() {
        let dag = TaskDag::new();
        assert_eq!(
            dag.task_status("nope").unwrap_err(),
            GraphError::UnknownTask("nope".into())
        );
    }

    #[tokio::test]
    async fn topology_is_frozen_after_execute() {
        let mut dag = TaskDag::new();
        dag.add_task(ok("a", &[])).unwrap();
        dag.execute().await.unwrap();
        assert_eq!(
            dag.add_task(ok("b", &[])).unwrap_err(),
            GraphError::ExecutionStarted
        );
        assert!(matches!(
            dag.execute().await,
            Err(ExecutionError::AlreadyStarted)
        ));
    }

    #[tokio::test]
    async fn empty_graph_completes() {
        let dag = TaskDag::new();
        let run = dag.execute().await.unwrap();
        assert!(run.results.is_empty());
        assert_eq!(dag.graph_status().status, GraphStatus::Completed);
    }

    #[tokio::test]
    async fn concurrency_limit_of_one_still_finishes() {
        let mut dag =
            TaskDag::with_config(ExecutorConfig::concurrent().with_max_concurrency(1));
        dag.add_task(ok("a", &[])).unwrap();
        dag.add_task(ok("b", &[])).unwrap();
        dag.add_task(ok("c", &["a", "b"])).unwrap();
        let run = dag.execute().await.unwrap();
        assert_eq!(run.results.len(), 3);
        assert_eq!(run.execution_order.last().map(String::as_str), Some("c"));
    }

    #[tokio::test]
    async fn oversized_concurrency_limit_is_clamped() {
        let mut dag = TaskDag::with_config(ExecutorConfig {
            mode: SchedulingMode::Concurrent,
            max_concurrency: usize::MAX,
        });
        dag.add_task(ok("a", &[])).unwrap();
        dag.add_task(ok("b", &["a"])).unwrap();
        let run = dag.execute().await.unwrap();
        assert_eq!(run.execution_order, ["a", "b"]);
    }
}
