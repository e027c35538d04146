//! Job-type keyed enqueue and processing API on top of the [`QueueBackend`].

use crate::backend::QueueBackend;
use crate::error::{DispatchError, JobError};
use crate::job::{BoxedProcessor, Job, JobId, JobOptions, JobPriority, JobRecord, ProcessorFuture, Repeat};
use crate::queue::{QueueHandle, QueueStats};

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, error, info, warn};

// --- Queues ---

pub const MESSAGES_QUEUE: &str = "messages";
pub const MEDIA_QUEUE: &str = "media";
pub const WEBHOOKS_QUEUE: &str = "webhooks";
pub const DATA_QUEUE: &str = "data";
pub const MAINTENANCE_QUEUE: &str = "maintenance";

// --- Job Types ---

/// The job types this worker knows how to process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobType {
  MessageRelay,
  /// Fast producer half of media handling; enqueues a [`JobType::MediaDownload`].
  MediaRelay,
  MediaDownload,
  WebhookRelay,
  DataSync,
  Cleanup,
}

impl JobType {
  pub const ALL: [JobType; 6] = [
    JobType::MessageRelay,
    JobType::MediaRelay,
    JobType::MediaDownload,
    JobType::WebhookRelay,
    JobType::DataSync,
    JobType::Cleanup,
  ];

  pub fn as_str(&self) -> &'static str {
    match self {
      JobType::MessageRelay => "message-relay",
      JobType::MediaRelay => "media-relay",
      JobType::MediaDownload => "media-download",
      JobType::WebhookRelay => "webhook-relay",
      JobType::DataSync => "data-sync",
      JobType::Cleanup => "cleanup",
    }
  }

  /// Priority applied when the caller does not set one.
  pub fn default_priority(&self) -> JobPriority {
    match self {
      JobType::WebhookRelay => 10,
      JobType::MessageRelay => 8,
      JobType::MediaRelay => 5,
      JobType::DataSync => 5,
      JobType::MediaDownload => 3,
      JobType::Cleanup => 1,
    }
  }

  /// The queue jobs of this type are enqueued on.
  pub fn queue(&self) -> &'static str {
    match self {
      JobType::MessageRelay => MESSAGES_QUEUE,
      JobType::MediaRelay | JobType::MediaDownload => MEDIA_QUEUE,
      JobType::WebhookRelay => WEBHOOKS_QUEUE,
      JobType::DataSync => DATA_QUEUE,
      JobType::Cleanup => MAINTENANCE_QUEUE,
    }
  }
}

impl fmt::Display for JobType {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for JobType {
  type Err = DispatchError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    JobType::ALL
      .into_iter()
      .find(|job_type| job_type.as_str() == s)
      .ok_or_else(|| DispatchError::UnknownJobType(s.to_string()))
  }
}

// --- Bulk ---

/// One entry of a bulk enqueue.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkJob {
  #[serde(rename = "type")]
  pub job_type: String,
  #[serde(default)]
  pub payload: Value,
  #[serde(default)]
  pub options: JobOptions,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkItemResult {
  pub index: usize,
  pub success: bool,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub job_id: Option<JobId>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkEnqueueSummary {
  pub results: Vec<BulkItemResult>,
  pub total_jobs: usize,
  pub successful_jobs: usize,
}

// --- Dispatcher ---

/// Translates domain operations into enqueue calls and binds processors to job types.
///
/// Every operation returns a `Result<_, DispatchError>`; nothing here panics or
/// retries. Retries belong to the queue.
#[derive(Debug, Clone)]
pub struct JobDispatcher {
  backend: Arc<QueueBackend>,
}

impl JobDispatcher {
  pub fn new(backend: Arc<QueueBackend>) -> Self {
    Self { backend }
  }

  pub fn backend(&self) -> &Arc<QueueBackend> {
    &self.backend
  }

  async fn open_queue(&self, queue_name: &str) -> Result<QueueHandle, DispatchError> {
    if !self.backend.is_healthy() {
      return Err(DispatchError::BackendUnavailable);
    }
    Ok(self.backend.get_queue(queue_name).await?)
  }

  async fn existing_queue(&self, queue_name: &str) -> Result<QueueHandle, DispatchError> {
    self
      .backend
      .existing_queue(queue_name)
      .await
      .ok_or_else(|| DispatchError::QueueNotFound(queue_name.to_string()))
  }

  // --- Enqueue ---

  /// Enqueues a job of `job_type` on `queue_name`; `options` are merged over the
  /// queue's defaults. Fails fast with [`DispatchError::BackendUnavailable`] while
  /// the store is down.
  pub async fn add_job(
    &self,
    queue_name: &str,
    job_type: &str,
    payload: Value,
    options: JobOptions,
  ) -> Result<JobId, DispatchError> {
    let queue = match self.open_queue(queue_name).await {
      Ok(queue) => queue,
      Err(e) => {
        warn!(queue = queue_name, job_type, error = %e, "Rejected job: queue backend unavailable.");
        return Err(e);
      }
    };
    match queue.add(job_type, payload, options).await {
      Ok(record) => {
        info!(
          queue = queue_name,
          job_id = %record.id,
          job_type,
          priority = record.priority,
          state = %record.state,
          "Job added to queue."
        );
        Ok(record.id)
      }
      Err(e) => {
        error!(queue = queue_name, job_type, error = %e, "Failed to add job.");
        Err(e.into())
      }
    }
  }

  /// Enqueues on the job type's queue, with its default priority unless `options`
  /// names one.
  pub async fn enqueue(
    &self,
    job_type: JobType,
    payload: Value,
    mut options: JobOptions,
  ) -> Result<JobId, DispatchError> {
    options.priority = options.priority.or(Some(job_type.default_priority()));
    self
      .add_job(job_type.queue(), job_type.as_str(), payload, options)
      .await
  }

  pub async fn add_message_relay(&self, payload: Value, options: JobOptions) -> Result<JobId, DispatchError> {
    self.enqueue(JobType::MessageRelay, payload, options).await
  }

  pub async fn add_media_relay(&self, payload: Value, options: JobOptions) -> Result<JobId, DispatchError> {
    self.enqueue(JobType::MediaRelay, payload, options).await
  }

  pub async fn add_media_download(&self, payload: Value, options: JobOptions) -> Result<JobId, DispatchError> {
    self.enqueue(JobType::MediaDownload, payload, options).await
  }

  pub async fn add_webhook_relay(&self, payload: Value, options: JobOptions) -> Result<JobId, DispatchError> {
    self.enqueue(JobType::WebhookRelay, payload, options).await
  }

  pub async fn add_data_sync(&self, payload: Value, options: JobOptions) -> Result<JobId, DispatchError> {
    self.enqueue(JobType::DataSync, payload, options).await
  }

  pub async fn add_cleanup(&self, payload: Value, options: JobOptions) -> Result<JobId, DispatchError> {
    self.enqueue(JobType::Cleanup, payload, options).await
  }

  /// Enqueues `jobs` one after another. A failed entry does not stop the batch.
  pub async fn add_bulk(&self, jobs: Vec<BulkJob>) -> BulkEnqueueSummary {
    let total_jobs = jobs.len();
    let mut results = Vec::with_capacity(total_jobs);
    for (index, job) in jobs.into_iter().enumerate() {
      let outcome = match job.job_type.parse::<JobType>() {
        Ok(job_type) => self.enqueue(job_type, job.payload, job.options).await,
        Err(e) => Err(e),
      };
      results.push(match outcome {
        Ok(job_id) => BulkItemResult {
          index,
          success: true,
          job_id: Some(job_id),
          error: None,
        },
        Err(e) => BulkItemResult {
          index,
          success: false,
          job_id: None,
          error: Some(e.to_string()),
        },
      });
    }
    let successful_jobs = results.iter().filter(|r| r.success).count();
    info!(total_jobs, successful_jobs, "Bulk enqueue finished.");
    BulkEnqueueSummary {
      results,
      total_jobs,
      successful_jobs,
    }
  }

  /// Enqueues a job that recurs on `cron_expression` (with seconds, UTC). The queue
  /// evaluates the schedule; the first occurrence runs at the next match.
  pub async fn schedule_recurring_job(
    &self,
    job_type: JobType,
    payload: Value,
    cron_expression: &str,
    options: JobOptions,
  ) -> Result<JobId, DispatchError> {
    self
      .enqueue(job_type, payload, options.repeat(Repeat::cron(cron_expression)))
      .await
  }

  pub async fn schedule_delayed_job(
    &self,
    job_type: JobType,
    payload: Value,
    delay: Duration,
    options: JobOptions,
  ) -> Result<JobId, DispatchError> {
    self.enqueue(job_type, payload, options.delay(delay)).await
  }

  // --- Processing ---

  /// Registers `processor` for `job_type` jobs on `queue_name`.
  ///
  /// Returned errors are logged with the job's id and type, then handed back to the
  /// queue unchanged so its retry policy applies. `concurrency` defaults to the
  /// queue's configured concurrency.
  pub async fn process_queue<F, Fut>(
    &self,
    queue_name: &str,
    job_type: &str,
    concurrency: Option<usize>,
    processor: F,
  ) -> Result<(), DispatchError>
  where
    F: Fn(Job) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, JobError>> + Send + 'static,
  {
    let queue = self.open_queue(queue_name).await?;
    let concurrency = concurrency.unwrap_or(queue.options().concurrency);
    let processor = Arc::new(processor);
    let wrapped: BoxedProcessor = Box::new(move |job: Job| -> ProcessorFuture {
      let processor = processor.clone();
      Box::pin(async move {
        let (queue, job_id, job_type, attempt) =
          (job.queue.clone(), job.id, job.job_type.clone(), job.attempt());
        debug!(%queue, %job_id, %job_type, attempt, "Processing job.");
        let result = processor(job).await;
        if let Err(e) = &result {
          error!(
            %queue,
            %job_id,
            %job_type,
            attempt,
            retryable = e.retryable,
            error = %e,
            "Job processing failed."
          );
        }
        result
      })
    });
    queue
      .process_boxed(job_type, concurrency, Arc::new(wrapped))
      .await?;
    info!(queue = queue_name, job_type, concurrency, "Processing queue.");
    Ok(())
  }

  /// [`JobDispatcher::process_queue`] on the job type's own queue.
  pub async fn process<F, Fut>(
    &self,
    job_type: JobType,
    concurrency: Option<usize>,
    processor: F,
  ) -> Result<(), DispatchError>
  where
    F: Fn(Job) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, JobError>> + Send + 'static,
  {
    self
      .process_queue(job_type.queue(), job_type.as_str(), concurrency, processor)
      .await
  }

  // --- Inspection & Control ---

  pub async fn get_job_status(&self, queue_name: &str, job_id: JobId) -> Result<JobRecord, DispatchError> {
    let queue = self.existing_queue(queue_name).await?;
    queue
      .get_job(job_id)
      .await?
      .ok_or_else(|| DispatchError::JobNotFound {
        queue: queue_name.to_string(),
        job_id,
      })
  }

  /// Looks a job up on every created queue.
  pub async fn find_job(&self, job_id: JobId) -> Result<JobRecord, DispatchError> {
    for queue in self.backend.queues().await {
      if let Some(record) = queue.get_job(job_id).await? {
        return Ok(record);
      }
    }
    Err(DispatchError::JobNotFound {
      queue: "*".to_string(),
      job_id,
    })
  }

  pub async fn get_queue_stats(&self, queue_name: &str) -> Result<QueueStats, DispatchError> {
    let queue = self.existing_queue(queue_name).await?;
    Ok(queue.counts().await?)
  }

  /// Stats of every created queue. Queues that do not answer are left out and logged.
  pub async fn all_queue_stats(&self) -> BTreeMap<String, QueueStats> {
    let mut stats = BTreeMap::new();
    for queue in self.backend.queues().await {
      match queue.counts().await {
        Ok(counts) => {
          stats.insert(queue.name().to_string(), counts);
        }
        Err(e) => warn!(queue = queue.name(), error = %e, "Failed to read queue stats."),
      }
    }
    stats
  }

  pub async fn pause_queue(&self, queue_name: &str) -> Result<(), DispatchError> {
    self.existing_queue(queue_name).await?.pause().await?;
    info!(queue = queue_name, "Queue paused.");
    Ok(())
  }

  pub async fn resume_queue(&self, queue_name: &str) -> Result<(), DispatchError> {
    self.existing_queue(queue_name).await?.resume().await?;
    info!(queue = queue_name, "Queue resumed.");
    Ok(())
  }

  /// Removes finished jobs older than `older_than` from one queue.
  pub async fn clean_queue(&self, queue_name: &str, older_than: Duration) -> Result<usize, DispatchError> {
    let removed = self.existing_queue(queue_name).await?.clean(older_than).await?;
    info!(queue = queue_name, removed, older_than_ms = older_than.as_millis() as u64, "Queue cleaned.");
    Ok(removed)
  }

  /// [`JobDispatcher::clean_queue`] on every created queue; per-queue failures are logged.
  pub async fn clean_all(&self, older_than: Duration) -> usize {
    let mut removed = 0;
    for queue in self.backend.queues().await {
      match queue.clean(older_than).await {
        Ok(count) => removed += count,
        Err(e) => warn!(queue = queue.name(), error = %e, "Failed to clean queue."),
      }
    }
    removed
  }
}
