use serde_json::json;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use taskdag::*;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let metrics = Arc::new(MetricsReporter::new());
    let mut dag = TaskDag::with_config(ExecutorConfig::concurrent())
        .with_reporter(Arc::new(TracingReporter))
        .with_reporter(metrics.clone());

    dag.add_task(Task::from_fn("extract", |_| async {
        tokio::time::sleep(Duration::from_millis(100)).await;
        Ok(json!([1, 2, 3, 4]))
    }))?;

    let flaky_calls = Arc::new(AtomicU32::new(0));
    dag.add_task(
        Task::from_fn("double", move |inputs| {
            let calls = flaky_calls.clone();
            async move {
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    return Err(TaskError::failed("upstream hiccup"));
                }
                let doubled: Vec<i64> = inputs["extract"]
                    .as_array()
                    .into_iter()
                    .flatten()
                    .filter_map(|v| v.as_i64())
                    .map(|v| v * 2)
                    .collect();
                Ok(json!(doubled))
            }
        })
        .depends_on(["extract"])
        .with_max_retries(2)
        .with_retry_delay(Duration::from_millis(50)),
    )?;

    dag.add_task(
        Task::from_fn("count", |inputs| async move {
            let n = inputs["extract"].as_array().map_or(0, Vec::len);
            Ok(json!(n))
        })
        .depends_on(["extract"])
        .with_timeout(Duration::from_secs(1)),
    )?;

    dag.add_task(
        Task::from_fn("report", |inputs| async move {
            Ok(json!({
                "values": inputs["double"],
                "count": inputs["count"],
            }))
        })
        .depends_on(["double", "count"]),
    )?;

    println!("=== task graph ===");
    print!("{}", dag.render_tree());

    println!("=== executing ===");
    let run = dag.execute().await?;

    println!("=== done in {:?} ===", run.duration);
    println!("order: {}", run.execution_order.join(" -> "));
    println!("report: {}", run.results["report"]);
    println!("status: {}", serde_json::to_string_pretty(&dag.graph_status())?);
    println!("double: {}", serde_json::to_string_pretty(&dag.task_status("double")?)?);
    println!("{}", dag.to_dot());

    // Let the reporter task drain before reading the counters.
    tokio::time::sleep(Duration::from_millis(50)).await;
    println!("metrics: {:?}", metrics.snapshot());

    Ok(())
}
