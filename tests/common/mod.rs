#![allow(dead_code)]

use serde_json::{Value, json};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use taskdag::{ExecutorConfig, Task, TaskDag, TaskError, TaskInput};

/// A task that returns `"<id> done"`.
pub fn ok_task(id: &str, deps: &[&str]) -> Task {
    let value = json!(format!("{id} done"));
    Task::from_fn(id, move |_| {
        let value = value.clone();
        async move { Ok(value) }
    })
    .depends_on(deps.iter().copied())
}

/// A task that always fails with a retryable error.
pub fn failing_task(id: &str, deps: &[&str]) -> Task {
    let message = format!("{id} exploded");
    Task::from_fn(id, move |_| {
        let message = message.clone();
        async move { Err(TaskError::Failed(message)) }
    })
    .depends_on(deps.iter().copied())
}

/// A task that sleeps before returning its id.
pub fn slow_task(id: &str, deps: &[&str], delay: Duration) -> Task {
    let value = json!(id);
    Task::from_fn(id, move |_| {
        let value = value.clone();
        async move {
            tokio::time::sleep(delay).await;
            Ok(value)
        }
    })
    .depends_on(deps.iter().copied())
}

/// A task that fails `failures` times before succeeding, counting calls.
pub fn flaky_task(id: &str, failures: u32, calls: Arc<AtomicU32>) -> Task {
    Task::from_fn(id, move |_| {
        let calls = calls.clone();
        async move {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            if n <= failures {
                Err(TaskError::failed(format!("attempt {n}")))
            } else {
                Ok(json!(format!("ok after {n}")))
            }
        }
    })
    .with_retry_delay(Duration::from_millis(1))
}

/// A task that records the dependency results it was handed.
pub fn recording_task(id: &str, deps: &[&str], seen: Arc<Mutex<Option<TaskInput>>>) -> Task {
    Task::from_fn(id, move |inputs| {
        let seen = seen.clone();
        async move {
            *seen.lock().unwrap() = Some(inputs);
            Ok(Value::Null)
        }
    })
    .depends_on(deps.iter().copied())
}

/// A (no deps), B (A), C (A), D (B, C), with `b` substituted for B.
pub fn diamond(config: ExecutorConfig, b: Task) -> TaskDag {
    let mut dag = TaskDag::with_config(config);
    dag.add_task(ok_task("a", &[])).unwrap();
    dag.add_task(b).unwrap();
    dag.add_task(ok_task("c", &["a"])).unwrap();
    dag.add_task(ok_task("d", &["b", "c"])).unwrap();
    dag
}
