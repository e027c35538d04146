//! demos/retrying_job.rs
//!
//! A job that fails twice with a retryable error, then succeeds on its third
//! attempt under an exponential backoff.

use jobbridge::{Backoff, Job, JobError, JobOptions, JobState, MemoryStore, QueueBackend, QueueOptions};
use serde_json::json;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration as StdDuration;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
  // --- Setup Tracing ---
  let filter = tracing_subscriber::EnvFilter::try_new("warn,jobbridge=info,retrying_job=trace")
    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
  tracing_subscriber::fmt().with_env_filter(filter).init();

  // --- Open Queue ---
  let backend = QueueBackend::new(QueueOptions::default());
  if !backend.initialize_with(Arc::new(MemoryStore::new())).await {
    return Err("memory store did not connect".into());
  }
  let queue = backend.get_queue("webhooks").await?;

  // --- Register Processor ---
  let attempts = Arc::new(AtomicU32::new(0));
  let counter = attempts.clone();
  queue
    .process("webhook-relay", 1, move |job: Job| {
      let counter = counter.clone();
      async move {
        let attempt = counter.fetch_add(1, Ordering::SeqCst) + 1;
        #[cfg(feature = "job_context")]
        {
          let ctx = jobbridge::job_context!();
          info!(job_id = %ctx.job_id, attempt = ctx.attempt, "Context of the running attempt.");
        }
        if attempt < 3 {
          warn!(attempt, "Upstream not ready. Failing this attempt.");
          return Err(JobError::new(format!("upstream busy on attempt {attempt}")));
        }
        info!(attempt, payload = %job.payload, "Delivered.");
        Ok(json!({ "deliveredOn": attempt }))
      }
    })
    .await?;

  // --- Submit Job ---
  let options = JobOptions::new()
    .attempts(5)
    .backoff(Backoff::exponential(StdDuration::from_millis(100)));
  let record = queue.add("webhook-relay", json!({ "event": "order.paid" }), options).await?;
  info!(job_id = %record.id, "Job submitted.");

  // --- Wait For Completion ---
  let mut finished = None;
  for _ in 0..50 {
    tokio::time::sleep(StdDuration::from_millis(100)).await;
    if let Some(current) = queue.get_job(record.id).await? {
      if current.state.is_finished() {
        finished = Some(current);
        break;
      }
    }
  }
  let finished = finished.ok_or("job did not finish in time")?;
  info!(
    state = %finished.state,
    attempts_made = finished.attempts_made,
    result = ?finished.return_value,
    "Job finished."
  );
  assert_eq!(finished.state, JobState::Completed);
  assert_eq!(attempts.load(Ordering::SeqCst), 3);

  let metrics = queue.metrics();
  info!("Metrics: {:#?}", metrics);
  assert_eq!(metrics.jobs_retried, 2);

  // --- Shutdown ---
  backend.shutdown(Some(StdDuration::from_secs(5))).await;
  Ok(())
}
