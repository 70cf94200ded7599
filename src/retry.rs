use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};
use crate::state::StateBoard;
use crate::{ExecutionError, Task, TaskError, TaskInput, TaskOutput};

/// Timeout and retry policy of a single task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskPolicy {
    /// Bound on each attempt. `None` lets the work run to completion.
    pub timeout: Option<Duration>,
    /// Attempts after the first; `0` means try once.
    pub max_retries: u32,
    /// Wait before the first retry.
    pub retry_delay: Duration,
    /// Growth factor of the wait between consecutive retries. `1.0` keeps
    /// the delay fixed.
    pub backoff_multiplier: f64,
    pub max_retry_delay: Duration,
}

impl Default for TaskPolicy {
    fn default() -> Self {
        Self {
            timeout: None,
            max_retries: 0,
            retry_delay: Duration::from_secs(1),
            backoff_multiplier: 1.0,
            max_retry_delay: Duration::from_secs(150),
        }
    }
}

impl TaskPolicy {
    /// Wait inserted after failed attempt `attempt` (1-based).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let multiplier = if self.backoff_multiplier.is_finite() && self.backoff_multiplier >= 1.0 {
            self.backoff_multiplier
        } else {
            1.0
        };
        let exp = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let backoff = self.retry_delay.as_secs_f64() * multiplier.powi(exp);
        let cap = self.max_retry_delay.max(self.retry_delay);

        if !backoff.is_finite() || backoff >= cap.as_secs_f64() {
            cap
        } else {
            Duration::from_secs_f64(backoff)
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }
}

/// Drives one task to a terminal outcome: attempts under the policy's
/// timeout, waits between attempts, and stops early on cancellation or a
/// non-retryable error.
pub struct TaskRunner {
    policy: TaskPolicy,
}

impl TaskRunner {
    pub fn new(policy: TaskPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &TaskPolicy {
        &self.policy
    }

    /// Generic retry loop. `operation` receives the 1-based attempt number
    /// and a token that is cancelled when that attempt ends, times out or
    /// the parent `ctx` is cancelled. `on_failure` sees every failed
    /// attempt, including the last one.
    pub async fn execute_with_retry<T, F, Fut, E>(
        &self,
        ctx: &CancellationToken,
        task_id: &str,
        mut operation: F,
        mut on_failure: E,
    ) -> Result<T, TaskError>
    where
        F: FnMut(u32, CancellationToken) -> Fut,
        Fut: Future<Output = Result<T, TaskError>>,
        E: FnMut(u32, &TaskError),
    {
        let max_attempts = self.policy.max_attempts();
        let mut attempt = 0;

        loop {
            if ctx.is_cancelled() {
                return Err(TaskError::Cancelled);
            }
            attempt += 1;

            let attempt_ctx = ctx.child_token();
            let result = self
                .run_attempt(ctx, operation(attempt, attempt_ctx.clone()))
                .await;
            attempt_ctx.cancel();

            let err = match result {
                Ok(output) => return Ok(output),
                Err(err) => err,
            };
            on_failure(attempt, &err);

            if !err.is_retryable() || attempt >= max_attempts {
                return Err(err);
            }

            let wait = self.policy.delay_after(attempt);
            warn!(
                %task_id,
                attempt,
                max_attempts,
                error = %err,
                wait_ms = wait.as_millis() as u64,
                "attempt failed, retrying"
            );

            tokio::select! {
                _ = ctx.cancelled() => return Err(TaskError::Cancelled),
                _ = sleep(wait) => {}
            }
        }
    }

    async fn run_attempt<T, Fut>(&self, ctx: &CancellationToken, attempt: Fut) -> Result<T, TaskError>
    where
        Fut: Future<Output = Result<T, TaskError>>,
    {
        let guarded = AssertUnwindSafe(attempt)
            .catch_unwind()
            .map(|r| r.unwrap_or_else(|payload| Err(TaskError::Panicked(panic_message(payload)))));

        let bounded = async {
            match self.policy.timeout {
                Some(after) => timeout(after, guarded)
                    .await
                    .unwrap_or(Err(TaskError::Timeout { after })),
                None => guarded.await,
            }
        };

        tokio::select! {
            _ = ctx.cancelled() => Err(TaskError::Cancelled),
            result = bounded => result,
        }
    }

    /// Run `task` against the shared run state: mark it running, record
    /// every attempt, and finish it as completed, failed or cancelled.
    pub(crate) async fn run(
        &self,
        ctx: &CancellationToken,
        task: &Task,
        inputs: TaskInput,
        board: &StateBoard,
    ) -> Result<TaskOutput, ExecutionError> {
        let task_id = task.id();
        board.start(task_id)?;
        debug!(%task_id, deps = inputs.len(), "task started");

        let work = Arc::clone(task.work());
        let outcome = self
            .execute_with_retry(
                ctx,
                task_id,
                |attempt, attempt_ctx| {
                    let recorded = board.begin_attempt(task_id);
                    debug!(%task_id, attempt, recorded, "attempt started");
                    let work = Arc::clone(&work);
                    let inputs = &inputs;
                    async move { work.call(attempt_ctx, inputs).await }
                },
                |_, err| board.record_attempt_failure(task_id, err),
            )
            .await;

        match outcome {
            Ok(output) => {
                board.complete(task_id, output.clone())?;
                debug!(%task_id, "task completed");
                Ok(output)
            }
            Err(err) => {
                let interrupted = err == TaskError::Cancelled && ctx.is_cancelled();
                board.fail(task_id, &err, interrupted)?;
                if interrupted {
                    debug!(%task_id, "task cancelled");
                } else {
                    error!(%task_id, error = %err, "task failed");
                }
                Err(ExecutionError::TaskFailed {
                    task_id: task_id.to_string(),
                    source: err,
                    blocked: Vec::new(),
                })
            }
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn runner(max_retries: u32) -> TaskRunner {
        TaskRunner::new(TaskPolicy {
            max_retries,
            retry_delay: Duration::from_millis(1),
            ..TaskPolicy::default()
        })
    }

    #[test]
    fn fixed_delay_by_default() {
        let p = TaskPolicy {
            retry_delay: Duration::from_millis(200),
            ..TaskPolicy::default()
        };
        let got: Vec<u64> = (1..=4).map(|i| p.delay_after(i).as_millis() as u64).collect();
        assert_eq!(got, vec![200, 200, 200, 200]);
    }

    #[test]
    fn backoff_grows_and_is_capped() {
        let p = TaskPolicy {
            retry_delay: Duration::from_millis(100),
            backoff_multiplier: 2.0,
            max_retry_delay: Duration::from_millis(500),
            ..TaskPolicy::default()
        };
        let got: Vec<u64> = (1..=5).map(|i| p.delay_after(i).as_millis() as u64).collect();
        assert_eq!(got, vec![100, 200, 400, 500, 500]);
    }

    #[tokio::test]
    async fn zero_retries_means_one_attempt() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = runner(0)
            .execute_with_retry(
                &CancellationToken::new(),
                "t",
                |_, _| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Err(TaskError::failed("nope")) }
                },
                |_, _| {},
            )
            .await;
        assert_eq!(result, Err(TaskError::failed("nope")));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn always_failing_work_runs_n_plus_one_times() {
        let mut failures = Vec::new();
        let result: Result<(), _> = runner(3)
            .execute_with_retry(
                &CancellationToken::new(),
                "t",
                |attempt, _| async move { Err(TaskError::failed(format!("attempt {attempt}"))) },
                |attempt, _| failures.push(attempt),
            )
            .await;
        assert_eq!(result, Err(TaskError::failed("attempt 4")));
        assert_eq!(failures, vec![1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn recovers_after_transient_failures() {
        let result = runner(3)
            .execute_with_retry(
                &CancellationToken::new(),
                "t",
                |attempt, _| async move {
                    if attempt < 3 {
                        Err(TaskError::failed("flaky"))
                    } else {
                        Ok(attempt)
                    }
                },
                |_, _| {},
            )
            .await;
        assert_eq!(result, Ok(3));
    }

    #[tokio::test]
    async fn permanent_errors_are_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = runner(5)
            .execute_with_retry(
                &CancellationToken::new(),
                "t",
                |_, _| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Err(TaskError::permanent("bad input")) }
                },
                |_, _| {},
            )
            .await;
        assert_eq!(result, Err(TaskError::permanent("bad input")));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn timeout_consumes_a_retry() {
        let runner = TaskRunner::new(TaskPolicy {
            timeout: Some(Duration::from_millis(20)),
            max_retries: 1,
            retry_delay: Duration::from_millis(1),
            ..TaskPolicy::default()
        });
        let mut seen = Vec::new();
        let result = runner
            .execute_with_retry(
                &CancellationToken::new(),
                "t",
                |attempt, _| async move {
                    if attempt == 1 {
                        sleep(Duration::from_secs(5)).await;
                    }
                    Ok(attempt)
                },
                |_, err| seen.push(err.clone()),
            )
            .await;
        assert_eq!(result, Ok(2));
        assert_eq!(
            seen,
            vec![TaskError::Timeout {
                after: Duration::from_millis(20)
            }]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn retry_delay_only_between_attempts() {
        let runner = TaskRunner::new(TaskPolicy {
            max_retries: 2,
            retry_delay: Duration::from_millis(30),
            ..TaskPolicy::default()
        });
        let calls = AtomicU32::new(0);
        let start = tokio::time::Instant::now();
        let _: Result<(), _> = runner
            .execute_with_retry(
                &CancellationToken::new(),
                "t",
                |_, _| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Err(TaskError::failed("x")) }
                },
                |_, _| {},
            )
            .await;
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(60), "{elapsed:?}");
        assert!(elapsed < Duration::from_millis(90), "{elapsed:?}");
    }

    #[tokio::test]
    async fn cancellation_interrupts_retry_wait() {
        let runner = TaskRunner::new(TaskPolicy {
            max_retries: 5,
            retry_delay: Duration::from_secs(30),
            ..TaskPolicy::default()
        });
        let ctx = CancellationToken::new();
        let canceller = ctx.clone();
        tokio::spawn(async move {
            sleep(Duration::from_millis(20)).await;
            canceller.cancel();
        });

        let result: Result<(), _> = runner
            .execute_with_retry(&ctx, "t", |_, _| async { Err(TaskError::failed("x")) }, |_, _| {})
            .await;
        assert_eq!(result, Err(TaskError::Cancelled));
    }

    #[tokio::test]
    async fn attempt_token_is_cancelled_on_timeout() {
        let runner = TaskRunner::new(TaskPolicy {
            timeout: Some(Duration::from_millis(10)),
            ..TaskPolicy::default()
        });
        let mut tokens = Vec::new();
        let result: Result<(), _> = runner
            .execute_with_retry(
                &CancellationToken::new(),
                "t",
                |_, attempt_ctx| {
                    tokens.push(attempt_ctx);
                    async {
                        sleep(Duration::from_secs(5)).await;
                        Ok(())
                    }
                },
                |_, _| {},
            )
            .await;
        assert!(matches!(result, Err(TaskError::Timeout { .. })));
        assert!(tokens[0].is_cancelled());
    }

    #[tokio::test]
    async fn panics_become_failures() {
        let result: Result<(), _> = runner(0)
            .execute_with_retry(
                &CancellationToken::new(),
                "t",
                |_, _| async {
                    let value: Option<()> = None;
                    Ok(value.expect("kaboom"))
                },
                |_, _| {},
            )
            .await;
        assert_eq!(result, Err(TaskError::Panicked("kaboom".into())));
    }
}
