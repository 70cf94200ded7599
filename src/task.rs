use async_trait::async_trait;
use futures::future::BoxFuture;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use crate::{TaskError, TaskInput, TaskOutput, TaskPolicy};

/// The opaque unit of work a task wraps.
///
/// `inputs` holds the result of every dependency, keyed by dependency id.
/// `ctx` is cancelled when the attempt times out or the graph is cancelled;
/// work that spawns its own background jobs should watch it.
#[async_trait]
pub trait Work: Send + Sync {
    async fn call(
        &self,
        ctx: CancellationToken,
        inputs: &TaskInput,
    ) -> Result<TaskOutput, TaskError>;
}

type BoxedFn = dyn Fn(TaskInput) -> BoxFuture<'static, Result<TaskOutput, TaskError>> + Send + Sync;

struct FnWork {
    f: Box<BoxedFn>,
}

#[async_trait]
impl Work for FnWork {
    async fn call(
        &self,
        _ctx: CancellationToken,
        inputs: &TaskInput,
    ) -> Result<TaskOutput, TaskError> {
        (self.f)(inputs.clone()).await
    }
}

/// Wrap an async closure as [`Work`]. The closure receives its own copy of
/// the dependency results.
pub fn work_fn<F, Fut>(f: F) -> Arc<dyn Work>
where
    F: Fn(TaskInput) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<TaskOutput, TaskError>> + Send + 'static,
{
    Arc::new(FnWork {
        f: Box::new(move |inputs| -> BoxFuture<'static, Result<TaskOutput, TaskError>> {
            Box::pin(f(inputs))
        }),
    })
}

/// Immutable definition of one task. Run state lives in
/// [`TaskState`](crate::TaskState), owned by the graph.
#[derive(Clone)]
pub struct Task {
    id: String,
    work: Arc<dyn Work>,
    dependencies: Vec<String>,
    policy: TaskPolicy,
}

impl Task {
    pub fn new(id: impl Into<String>, work: Arc<dyn Work>) -> Self {
        Self {
            id: id.into(),
            work,
            dependencies: Vec::new(),
            policy: TaskPolicy::default(),
        }
    }

    pub fn from_fn<F, Fut>(id: impl Into<String>, f: F) -> Self
    where
        F: Fn(TaskInput) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<TaskOutput, TaskError>> + Send + 'static,
    {
        Self::new(id, work_fn(f))
    }

    /// Add dependencies. Repeated ids are collapsed; first mention wins the
    /// position.
    pub fn depends_on<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for dep in deps {
            let dep = dep.into();
            if !self.dependencies.contains(&dep) {
                self.dependencies.push(dep);
            }
        }
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.policy.timeout = Some(timeout);
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.policy.max_retries = max_retries;
        self
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.policy.retry_delay = delay;
        self
    }

    pub fn with_policy(mut self, policy: TaskPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn dependencies(&self) -> &[String] {
        &self.dependencies
    }

    pub fn policy(&self) -> &TaskPolicy {
        &self.policy
    }

    pub fn work(&self) -> &Arc<dyn Work> {
        &self.work
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("dependencies", &self.dependencies)
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}
