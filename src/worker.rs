use crate::command::{ShutdownMode, WorkerOutcome};
use crate::job::{BoxedProcessor, Job, JobRecord, WorkerId};
use crate::metrics::QueueMetrics;

#[cfg(feature = "job_context")]
use crate::job::context::{JobContext, CURRENT_JOB_CONTEXT};

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn, Instrument};

/// Aborts the processor task when the worker running it is dropped (a forced
/// shutdown aborts workers mid-job).
struct AbortOnDrop<T>(JoinHandle<T>);

impl<T> Drop for AbortOnDrop<T> {
  fn drop(&mut self) {
    self.0.abort();
  }
}

/// A worker task bound to one (queue, job type) registration.
///
/// Workers wait for claimed jobs from the coordinator on the registration's
/// dispatch channel, run the processor (catching panics), and report the outcome.
/// Retry and state decisions belong to the coordinator.
pub(crate) struct Worker {
  id: WorkerId,
  queue: String,
  job_type: String,
  processor: Arc<BoxedProcessor>,
  metrics: QueueMetrics,
  shutdown_rx: watch::Receiver<Option<ShutdownMode>>,
  outcome_tx: mpsc::Sender<WorkerOutcome>,
  dispatch_rx: async_channel::Receiver<JobRecord>,
}

impl Worker {
  #[allow(clippy::too_many_arguments)]
  pub fn new(
    id: WorkerId,
    queue: String,
    job_type: String,
    processor: Arc<BoxedProcessor>,
    metrics: QueueMetrics,
    shutdown_rx: watch::Receiver<Option<ShutdownMode>>,
    outcome_tx: mpsc::Sender<WorkerOutcome>,
    dispatch_rx: async_channel::Receiver<JobRecord>,
  ) -> Self {
    Self {
      id,
      queue,
      job_type,
      processor,
      metrics,
      shutdown_rx,
      outcome_tx,
      dispatch_rx,
    }
  }

  /// Runs until the dispatch channel is closed and drained, or a forced shutdown.
  ///
  /// A graceful shutdown does not stop the worker: the coordinator closes the
  /// dispatch channel once every claimed job has reported back.
  pub async fn run(&mut self) {
    debug!(worker_id = self.id, queue = %self.queue, job_type = %self.job_type, "Worker started.");

    loop {
      if self.is_forced() {
        break;
      }

      tokio::select! {
        biased;

        Ok(()) = self.shutdown_rx.changed() => {
          if self.is_forced() {
            info!(worker_id = self.id, queue = %self.queue, "Worker received forced shutdown.");
            break;
          }
        }

        result = self.dispatch_rx.recv() => {
          match result {
            Ok(record) => {
              let span = tracing::span!(
                tracing::Level::INFO,
                "job_exec",
                worker_id = self.id,
                queue = %self.queue,
                job_id = %record.id,
                job_type = %record.job_type,
                attempt = record.attempts_made + 1,
              );
              self.execute_and_report(record).instrument(span).await;
            }
            Err(_) => {
              trace!(worker_id = self.id, queue = %self.queue, "Dispatch channel closed. Worker exiting.");
              break;
            }
          }
        }
      }
    }

    debug!(worker_id = self.id, queue = %self.queue, job_type = %self.job_type, "Worker task shutting down.");
  }

  fn is_forced(&self) -> bool {
    *self.shutdown_rx.borrow() == Some(ShutdownMode::Force)
  }

  async fn execute_and_report(&self, record: JobRecord) {
    let waited = Utc::now().signed_duration_since(record.eligible_at);
    self
      .metrics
      .job_wait_duration
      .record(waited.to_std().unwrap_or(Duration::ZERO));

    let job_id = record.id;
    let start = Instant::now();
    debug!("Starting job execution.");
    let result = self.execute_processor(&record).await;
    let duration = start.elapsed();
    self.metrics.job_execution_duration.record(duration);

    let outcome = match result {
      Ok(value) => {
        QueueMetrics::incr(&self.metrics.jobs_completed);
        debug!(duration_ms = duration.as_millis() as u64, "Job attempt succeeded.");
        WorkerOutcome::Completed {
          job_id,
          result: value,
          duration,
        }
      }
      Err((reason, retryable)) => {
        QueueMetrics::incr(&self.metrics.jobs_failed_attempts);
        debug!(duration_ms = duration.as_millis() as u64, %reason, retryable, "Job attempt failed.");
        WorkerOutcome::Failed {
          job_id,
          reason,
          retryable,
          duration,
        }
      }
    };

    if self.outcome_tx.send(outcome).await.is_err() {
      warn!(worker_id = self.id, %job_id, "Failed to report job outcome (queue coordinator gone).");
    }
  }

  /// Runs the processor in its own task so a panic cannot take the worker down.
  /// Errors are returned as `(reason, retryable)`.
  async fn execute_processor(&self, record: &JobRecord) -> Result<serde_json::Value, (String, bool)> {
    let job = Job::from_record(record, self.outcome_tx.clone());
    let future = (self.processor)(job).in_current_span();

    #[cfg(feature = "job_context")]
    let task = {
      let context = JobContext {
        queue: record.queue.clone(),
        job_id: record.id,
        job_type: record.job_type.clone(),
        attempt: record.attempts_made + 1,
      };
      tokio::spawn(CURRENT_JOB_CONTEXT.scope(context, future))
    };
    #[cfg(not(feature = "job_context"))]
    let task = tokio::spawn(future);
    let mut task = AbortOnDrop(task);

    match (&mut task.0).await {
      Ok(Ok(value)) => Ok(value),
      Ok(Err(job_error)) => Err((job_error.message, job_error.retryable)),
      Err(join_error) if join_error.is_panic() => {
        error!(job_id = %record.id, job_type = %record.job_type, "Processor panicked.");
        QueueMetrics::incr(&self.metrics.jobs_panicked);
        Err(("processor panicked".to_string(), true))
      }
      Err(_) => {
        warn!(job_id = %record.id, "Processor task was cancelled.");
        Err(("processor task cancelled".to_string(), true))
      }
    }
  }
}
