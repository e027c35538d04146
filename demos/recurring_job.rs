//! demos/recurring_job.rs
//!
//! A cleanup job repeated by a CRON expression (every second), capped at three
//! occurrences, scheduled through the typed dispatcher.

use jobbridge::dispatch::MAINTENANCE_QUEUE;
use jobbridge::{JobDispatcher, JobOptions, JobType, MemoryStore, QueueBackend, QueueOptions, Repeat};
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration as StdDuration;
use tracing::info;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
  // --- Setup Tracing ---
  let filter = tracing_subscriber::EnvFilter::try_new("warn,jobbridge=info,recurring_job=trace")
    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
  tracing_subscriber::fmt().with_env_filter(filter).init();

  let backend = Arc::new(QueueBackend::new(QueueOptions::default()));
  if !backend.initialize_with(Arc::new(MemoryStore::new())).await {
    return Err("memory store did not connect".into());
  }
  let dispatcher = JobDispatcher::new(backend.clone());

  // --- Register Processor ---
  let runs = Arc::new(AtomicUsize::new(0));
  let counter = runs.clone();
  dispatcher
    .process(JobType::Cleanup, Some(1), move |job| {
      let counter = counter.clone();
      async move {
        let run = counter.fetch_add(1, Ordering::SeqCst) + 1;
        info!(run, job_id = %job.id, "*** Recurring cleanup executing ***");
        Ok(json!({ "run": run }))
      }
    })
    .await?;

  // --- Schedule ---
  let cron_expr = "* * * * * *";
  info!("Using CRON expression: '{}'", cron_expr);
  let options = JobOptions::new().repeat(Repeat::cron(cron_expr).with_limit(3));
  let first = dispatcher
    .enqueue(JobType::Cleanup, json!({ "olderThanMs": 60_000 }), options)
    .await?;
  info!(job_id = %first, "Recurring job scheduled.");

  // --- Observe ---
  for _ in 0..6 {
    tokio::time::sleep(StdDuration::from_secs(1)).await;
    let stats = dispatcher.get_queue_stats(MAINTENANCE_QUEUE).await?;
    info!(runs = runs.load(Ordering::SeqCst), ?stats, "Tick.");
  }
  assert_eq!(runs.load(Ordering::SeqCst), 3, "limit caps the occurrences");

  backend.shutdown(Some(StdDuration::from_secs(5))).await;
  Ok(())
}
