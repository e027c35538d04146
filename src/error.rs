use crate::job::JobId;

use thiserror::Error;

// --- Store Errors ---

/// Errors raised by a [`JobStore`](crate::store::JobStore) implementation.
#[derive(Error, Debug)]
pub enum StoreError {
  #[error("Store is not connected.")]
  Disconnected,
  #[error("Store I/O failed: {0}")]
  Io(String),
  #[error("Failed to serialize job record: {0}")]
  Serialize(#[source] serde_json::Error),
  #[error("Failed to deserialize job record under key '{key}': {source}")]
  Deserialize {
    key: String,
    #[source]
    source: serde_json::Error,
  },
}

impl From<sled::Error> for StoreError {
  fn from(err: sled::Error) -> Self {
    StoreError::Io(err.to_string())
  }
}

// --- Queue Errors ---

/// Errors returned by a [`QueueHandle`](crate::queue::QueueHandle).
///
/// Every queue call is bounded: if the queue's coordinator does not answer within
/// the configured operation timeout the call fails with [`QueueError::Timeout`]
/// instead of hanging.
#[derive(Error, Debug)]
pub enum QueueError {
  #[error("Queue '{0}' is unavailable: the store connection is down.")]
  Unavailable(String),
  #[error("Queue '{0}' is closed.")]
  Closed(String),
  #[error("Queue '{queue}' did not answer within {timeout_ms}ms.")]
  Timeout { queue: String, timeout_ms: u64 },
  #[error("A processor for job type '{job_type}' is already registered on queue '{queue}'.")]
  ProcessorAlreadyRegistered { queue: String, job_type: String },
  #[error("Concurrency for job type '{0}' must be greater than zero.")]
  ZeroConcurrency(String),
  #[error("Invalid repeat option: {0}")]
  InvalidRepeat(String),
  #[error("Delay of {0}ms is out of range.")]
  InvalidDelay(u64),
  #[error("Store operation failed: {0}")]
  Store(#[from] StoreError),
}

// --- Backend Errors ---

/// Errors returned by the [`QueueBackend`](crate::backend::QueueBackend) adapter.
#[derive(Error, Debug)]
pub enum BackendError {
  #[error("Queue backend has not been initialized.")]
  NotInitialized,
  #[error("Queue backend has been shut down.")]
  ShutDown,
  #[error("Failed to open store: {0}")]
  Store(#[from] StoreError),
  #[error("Timed out after {0}ms while connecting to the store.")]
  ConnectTimeout(u64),
  #[error("Failed to open queue: {0}")]
  Queue(#[from] QueueError),
}

// --- Dispatch Errors ---

/// Errors returned by the [`JobDispatcher`](crate::dispatch::JobDispatcher).
///
/// Every dispatcher operation resolves to `Result<_, DispatchError>`; none of them
/// panic, so callers (HTTP handlers, chat producers) always get a classified failure.
#[derive(Error, Debug)]
pub enum DispatchError {
  #[error("Queue backend is unavailable.")]
  BackendUnavailable,
  #[error("Queue '{0}' has not been created.")]
  QueueNotFound(String),
  #[error("Job {job_id} not found in queue '{queue}'.")]
  JobNotFound { queue: String, job_id: JobId },
  #[error("Unknown job type '{0}'.")]
  UnknownJobType(String),
  #[error(transparent)]
  Queue(#[from] QueueError),
  #[error(transparent)]
  Backend(#[from] BackendError),
}

impl DispatchError {
  /// Whether the error means the store connection is down (as opposed to a bad request).
  pub fn is_unavailable(&self) -> bool {
    matches!(
      self,
      DispatchError::BackendUnavailable
        | DispatchError::Queue(QueueError::Unavailable(_))
        | DispatchError::Queue(QueueError::Timeout { .. })
        | DispatchError::Backend(_)
    )
  }
}

// --- Job Processing Errors ---

/// The error a processor returns to fail a job attempt.
///
/// A retryable error (the default) engages the queue's retry/backoff policy; a
/// non-retryable error fails the job terminally regardless of attempts left.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct JobError {
  pub message: String,
  pub retryable: bool,
}

impl JobError {
  pub fn new(message: impl Into<String>) -> Self {
    Self {
      message: message.into(),
      retryable: true,
    }
  }

  pub fn fatal(message: impl Into<String>) -> Self {
    Self {
      message: message.into(),
      retryable: false,
    }
  }
}

impl From<serde_json::Error> for JobError {
  fn from(err: serde_json::Error) -> Self {
    // A payload that does not decode will not decode on the next attempt either.
    JobError::fatal(format!("invalid payload: {err}"))
  }
}

// --- Outbound Channel Errors ---

/// Classified failure of an outbound HTTP call to the primary service.
#[derive(Error, Debug, Clone)]
pub enum ChannelError {
  #[error("Request to {url} timed out.")]
  Timeout { url: String },
  #[error("Could not connect to {url}: {message}")]
  Connect { url: String, message: String },
  #[error("Primary service answered {status}: {body}")]
  Status { status: u16, body: String },
  #[error("Could not decode response body: {0}")]
  Decode(String),
  #[error("Request failed: {0}")]
  Request(String),
}

impl ChannelError {
  /// HTTP status of the failed call, when the server answered at all.
  pub fn status(&self) -> Option<u16> {
    match self {
      ChannelError::Status { status, .. } => Some(*status),
      _ => None,
    }
  }
}

impl From<ChannelError> for JobError {
  fn from(err: ChannelError) -> Self {
    match err.status() {
      // Client errors are not going to succeed on retry.
      Some(status) if (400..500).contains(&status) && status != 408 && status != 429 => {
        JobError::fatal(err.to_string())
      }
      _ => JobError::new(err.to_string()),
    }
  }
}

// --- Chat Client Errors ---

#[derive(Error, Debug, Clone)]
pub enum ChatError {
  #[error("Failed to connect chat client: {0}")]
  Connect(String),
  #[error("Chat client is disconnected.")]
  Disconnected,
  #[error("Failed to send chat message: {0}")]
  Send(String),
  #[error("Operation not supported by this chat transport: {0}")]
  Unsupported(&'static str),
}

impl From<ChatError> for JobError {
  fn from(err: ChatError) -> Self {
    match err {
      ChatError::Unsupported(_) => JobError::fatal(err.to_string()),
      _ => JobError::new(err.to_string()),
    }
  }
}

// --- Lifecycle Errors ---

/// Errors raised by the [`WorkerController`](crate::lifecycle::WorkerController).
#[derive(Error, Debug)]
pub enum LifecycleError {
  #[error("Startup step '{step}' failed: {reason}")]
  FatalStartup { step: &'static str, reason: String },
  #[error("Cannot {action} while worker is {state}.")]
  InvalidState { action: &'static str, state: String },
}

// --- Configuration Errors ---

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
  #[error("Invalid value '{value}' for {key}: {reason}")]
  Invalid {
    key: &'static str,
    value: String,
    reason: String,
  },
}
