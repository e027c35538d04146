use crate::error::QueueError;
use crate::job::{BoxedProcessor, JobId, JobOptions, JobRecord};
use crate::queue::QueueStats;

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::oneshot;

/// Commands sent from a [`QueueHandle`](crate::queue::QueueHandle) to the queue's
/// coordinator task.
///
/// Each command carries a `oneshot::Sender` for the coordinator to send the
/// response back to the requesting task.
pub(crate) enum QueueCommand {
  /// Create a job record from already merged options.
  Enqueue {
    job_type: String,
    payload: Value,
    options: JobOptions,
    responder: oneshot::Sender<Result<JobRecord, QueueError>>,
  },
  /// Look up a job by id. `Ok(None)` if the queue holds no such record.
  GetJob {
    job_id: JobId,
    responder: oneshot::Sender<Option<JobRecord>>,
  },
  /// Per-state job counts.
  Counts {
    responder: oneshot::Sender<QueueStats>,
  },
  /// Stop claiming jobs. Active jobs run to completion.
  Pause { responder: oneshot::Sender<()> },
  Resume { responder: oneshot::Sender<()> },
  /// Remove finished jobs whose `finished_at` is older than `older_than`.
  Clean {
    older_than: Duration,
    responder: oneshot::Sender<Result<usize, QueueError>>,
  },
  /// Bind a processor to a job type with its own concurrency budget.
  RegisterProcessor {
    job_type: String,
    concurrency: usize,
    processor: Arc<BoxedProcessor>,
    responder: oneshot::Sender<Result<(), QueueError>>,
  },
}

impl std::fmt::Debug for QueueCommand {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      QueueCommand::Enqueue { job_type, .. } => write!(f, "Enqueue({job_type})"),
      QueueCommand::GetJob { job_id, .. } => write!(f, "GetJob({job_id})"),
      QueueCommand::Counts { .. } => f.write_str("Counts"),
      QueueCommand::Pause { .. } => f.write_str("Pause"),
      QueueCommand::Resume { .. } => f.write_str("Resume"),
      QueueCommand::Clean { older_than, .. } => write!(f, "Clean({older_than:?})"),
      QueueCommand::RegisterProcessor {
        job_type,
        concurrency,
        ..
      } => write!(f, "RegisterProcessor({job_type}, {concurrency})"),
    }
  }
}

/// Represents the requested shutdown mode. Sent via a `watch` channel.
/// `None` indicates the queue is running normally.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownMode {
  /// Stop claiming jobs and wait for active ones to finish.
  Graceful,
  /// Stop as soon as possible. Active jobs are abandoned and recovered as
  /// stalled the next time the queue is opened on the same store.
  Force,
}

/// Message sent from a worker task (or a processor's `Job` handle) back to the
/// coordinator.
#[derive(Debug)]
pub(crate) enum WorkerOutcome {
  /// The processor resolved with a result.
  Completed {
    job_id: JobId,
    result: Value,
    duration: Duration,
  },
  /// The processor returned an error, panicked, or was cancelled.
  Failed {
    job_id: JobId,
    reason: String,
    retryable: bool,
    duration: Duration,
  },
  /// Progress reported through [`Job::report_progress`](crate::job::Job::report_progress).
  Progress { job_id: JobId, progress: Value },
}
