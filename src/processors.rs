//! Handlers bound to each [`JobType`].
//!
//! Every handler returns a JSON result (the job completes) or a [`JobError`] (the
//! queue's retry policy decides what happens next). Media work is split in two: the
//! `media-relay` job only enqueues a `media-download` job, so slow downloads never
//! hold up the media lane's fast path.

use crate::channel::OutboundChannel;
use crate::chat::ChatClient;
use crate::dispatch::{JobDispatcher, JobType};
use crate::error::{DispatchError, JobError};
use crate::job::{Job, JobOptions};

use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info};

const DEFAULT_WEBHOOK_PATH: &str = "/api/webhooks";

/// What the handlers reach out to.
#[derive(Clone)]
pub struct ProcessorDeps {
  pub channel: OutboundChannel,
  pub chat: Arc<dyn ChatClient>,
  pub dispatcher: JobDispatcher,
  /// Retention used by `cleanup` jobs that do not name one.
  pub cleanup_retention: Duration,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MediaPayload {
  media_id: String,
  #[serde(default)]
  mime_type: Option<String>,
  #[serde(default)]
  chat_id: Option<String>,
  #[serde(default)]
  message_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WebhookPayload {
  #[serde(default)]
  path: Option<String>,
  #[serde(default)]
  body: Value,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CleanupPayload {
  #[serde(default)]
  older_than_ms: Option<u64>,
}

/// Registers a handler for every job type on its queue.
///
/// `concurrency` overrides the queues' configured concurrency for every registration.
pub async fn register_all(
  dispatcher: &JobDispatcher,
  deps: Arc<ProcessorDeps>,
  concurrency: Option<usize>,
) -> Result<(), DispatchError> {
  for job_type in JobType::ALL {
    let deps = deps.clone();
    dispatcher
      .process(job_type, concurrency, move |job| handle(job_type, deps.clone(), job))
      .await?;
  }
  info!(job_types = JobType::ALL.len(), "Registered job processors.");
  Ok(())
}

/// Runs the handler for `job_type`.
pub async fn handle(job_type: JobType, deps: Arc<ProcessorDeps>, job: Job) -> Result<Value, JobError> {
  match job_type {
    JobType::MessageRelay => relay_message(&deps, job).await,
    JobType::MediaRelay => relay_media(&deps, job).await,
    JobType::MediaDownload => download_media(&deps, job).await,
    JobType::WebhookRelay => relay_webhook(&deps, job).await,
    JobType::DataSync => sync_data(&deps, job).await,
    JobType::Cleanup => cleanup(&deps, job).await,
  }
}

async fn relay_message(deps: &ProcessorDeps, job: Job) -> Result<Value, JobError> {
  let reply = deps.channel.relay_message_event(&job.payload).await?;
  Ok(json!({ "relayed": true, "status": reply.status }))
}

async fn relay_media(deps: &ProcessorDeps, job: Job) -> Result<Value, JobError> {
  let media: MediaPayload = job.payload_as()?;
  let download_job_id = deps
    .dispatcher
    .add_media_download(job.payload.clone(), JobOptions::new())
    .await
    .map_err(dispatch_failure)?;
  debug!(media_id = %media.media_id, %download_job_id, "Media download queued.");
  Ok(json!({ "mediaId": media.media_id, "downloadJobId": download_job_id }))
}

async fn download_media(deps: &ProcessorDeps, job: Job) -> Result<Value, JobError> {
  let media: MediaPayload = job.payload_as()?;
  job.report_progress(json!({ "stage": "downloading" }));
  let bytes = deps.chat.download_media(&media.media_id).await?;
  let size = bytes.len();

  job.report_progress(json!({ "stage": "relaying", "size": size }));
  let result = json!({
    "mediaId": media.media_id,
    "mimeType": media.mime_type,
    "chatId": media.chat_id,
    "messageId": media.message_id,
    "size": size,
    "data": BASE64.encode(&bytes),
  });
  deps
    .channel
    .relay_job_result(job.id, JobType::MediaDownload.as_str(), &result)
    .await?;
  Ok(json!({ "mediaId": media.media_id, "size": size }))
}

async fn relay_webhook(deps: &ProcessorDeps, job: Job) -> Result<Value, JobError> {
  let webhook: WebhookPayload = job.payload_as()?;
  let path = webhook.path.as_deref().unwrap_or(DEFAULT_WEBHOOK_PATH);
  if !path.starts_with('/') {
    return Err(JobError::fatal(format!("webhook path must be absolute: {path}")));
  }
  let reply = deps.channel.post(path, &webhook.body).await?;
  Ok(json!({ "status": reply.status, "response": reply.data }))
}

async fn sync_data(deps: &ProcessorDeps, job: Job) -> Result<Value, JobError> {
  let reply = deps.channel.request_data_sync(&job.payload).await?;
  Ok(json!({ "synced": true, "response": reply.data }))
}

async fn cleanup(deps: &ProcessorDeps, job: Job) -> Result<Value, JobError> {
  let request: CleanupPayload = if job.payload.is_null() {
    CleanupPayload::default()
  } else {
    job.payload_as()?
  };
  let older_than = request
    .older_than_ms
    .map(Duration::from_millis)
    .unwrap_or(deps.cleanup_retention);
  let removed = deps.dispatcher.clean_all(older_than).await;
  Ok(json!({ "removed": removed, "olderThanMs": older_than.as_millis() as u64 }))
}

fn dispatch_failure(err: DispatchError) -> JobError {
  if err.is_unavailable() {
    JobError::new(err.to_string())
  } else {
    JobError::fatal(err.to_string())
  }
}
