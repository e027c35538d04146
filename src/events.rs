//! Queue events and synchronous observers.
//!
//! The coordinator emits a [`QueueEvent`] on every job state transition and calls each
//! observer inline, in registration order, before it processes anything else. Observers
//! must therefore be cheap; anything slow belongs on a channel the observer feeds.

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::RwLock;
use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::job::JobId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueEventKind {
  Waiting,
  Active,
  Progress,
  Completed,
  Failed,
  /// A job was found claimed by a processor that no longer exists.
  Stalled,
  /// Queue-level failure (store connection, persistence), not tied to a job attempt.
  Error,
}

impl QueueEventKind {
  pub fn as_str(&self) -> &'static str {
    match self {
      QueueEventKind::Waiting => "waiting",
      QueueEventKind::Active => "active",
      QueueEventKind::Progress => "progress",
      QueueEventKind::Completed => "completed",
      QueueEventKind::Failed => "failed",
      QueueEventKind::Stalled => "stalled",
      QueueEventKind::Error => "error",
    }
  }
}

impl fmt::Display for QueueEventKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

#[derive(Debug, Clone)]
pub struct QueueEvent {
  pub kind: QueueEventKind,
  pub queue: String,
  pub job_id: Option<JobId>,
  pub job_type: Option<String>,
  /// Attempts finished so far.
  pub attempts_made: u32,
  /// Failure reason or error message.
  pub message: Option<String>,
  /// Progress value or completion result.
  pub data: Option<Value>,
  /// Execution time of the attempt, for `completed` and `failed`.
  pub duration: Option<Duration>,
  /// `failed` with no retry left.
  pub terminal: bool,
}

impl QueueEvent {
  pub(crate) fn job(kind: QueueEventKind, queue: &str, job_id: JobId, job_type: &str) -> Self {
    Self {
      kind,
      queue: queue.to_string(),
      job_id: Some(job_id),
      job_type: Some(job_type.to_string()),
      attempts_made: 0,
      message: None,
      data: None,
      duration: None,
      terminal: false,
    }
  }

  pub(crate) fn queue_error(queue: &str, message: impl Into<String>) -> Self {
    Self {
      kind: QueueEventKind::Error,
      queue: queue.to_string(),
      job_id: None,
      job_type: None,
      attempts_made: 0,
      message: Some(message.into()),
      data: None,
      duration: None,
      terminal: false,
    }
  }

  pub(crate) fn attempts(mut self, attempts_made: u32) -> Self {
    self.attempts_made = attempts_made;
    self
  }

  pub(crate) fn message(mut self, message: impl Into<String>) -> Self {
    self.message = Some(message.into());
    self
  }

  pub(crate) fn data(mut self, data: Value) -> Self {
    self.data = Some(data);
    self
  }

  pub(crate) fn duration(mut self, duration: Duration) -> Self {
    self.duration = Some(duration);
    self
  }

  pub(crate) fn terminal(mut self, terminal: bool) -> Self {
    self.terminal = terminal;
    self
  }
}

pub type Observer = Arc<dyn Fn(&QueueEvent) + Send + Sync + 'static>;

type ObserverList = RwLock<Vec<(u64, Observer)>>;

/// Registry of observers for one queue.
#[derive(Default)]
pub struct EventBus {
  next_id: AtomicU64,
  observers: Arc<ObserverList>,
}

impl fmt::Debug for EventBus {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("EventBus")
      .field("observers", &self.observers.read().len())
      .finish()
  }
}

impl EventBus {
  pub fn new() -> Self {
    Self::default()
  }

  /// Registers an observer for every event. Dropping the returned handle keeps the
  /// observer registered; call [`ObserverHandle::cancel`] to remove it.
  pub fn subscribe<F>(&self, observer: F) -> ObserverHandle
  where
    F: Fn(&QueueEvent) + Send + Sync + 'static,
  {
    let id = self.next_id.fetch_add(1, Ordering::Relaxed);
    self.observers.write().push((id, Arc::new(observer)));
    ObserverHandle {
      id,
      observers: Arc::downgrade(&self.observers),
    }
  }

  /// Registers an observer for events of one kind.
  pub fn on<F>(&self, kind: QueueEventKind, observer: F) -> ObserverHandle
  where
    F: Fn(&QueueEvent) + Send + Sync + 'static,
  {
    self.subscribe(move |event| {
      if event.kind == kind {
        observer(event)
      }
    })
  }

  pub fn observer_count(&self) -> usize {
    self.observers.read().len()
  }

  /// Calls every observer with `event`. A panicking observer is logged and skipped.
  pub(crate) fn emit(&self, event: &QueueEvent) {
    let observers: Vec<Observer> = self
      .observers
      .read()
      .iter()
      .map(|(_, observer)| observer.clone())
      .collect();
    for observer in observers {
      if catch_unwind(AssertUnwindSafe(|| observer(event))).is_err() {
        error!(queue = %event.queue, event = %event.kind, "Queue event observer panicked.");
      }
    }
  }
}

/// Cancellation handle for a registered observer.
#[derive(Debug)]
pub struct ObserverHandle {
  id: u64,
  observers: Weak<ObserverList>,
}

impl ObserverHandle {
  /// Removes the observer. Returns `false` if it was already gone.
  pub fn cancel(self) -> bool {
    match self.observers.upgrade() {
      Some(observers) => {
        let mut observers = observers.write();
        let before = observers.len();
        observers.retain(|(id, _)| *id != self.id);
        observers.len() != before
      }
      None => false,
    }
  }
}

/// The standard observer wired onto every queue the backend creates: forwards each
/// event to the structured logger.
pub fn log_event(event: &QueueEvent) {
  let job_id = event.job_id.map(|id| id.to_string()).unwrap_or_default();
  let job_type = event.job_type.as_deref().unwrap_or("");
  let duration_ms = event.duration.map(|d| d.as_millis() as u64);
  match event.kind {
    QueueEventKind::Waiting | QueueEventKind::Active => {
      debug!(queue = %event.queue, %job_id, job_type, event = %event.kind, "Job state changed.")
    }
    QueueEventKind::Progress => {
      debug!(queue = %event.queue, %job_id, job_type, progress = ?event.data, "Job progress.")
    }
    QueueEventKind::Completed => info!(
      queue = %event.queue,
      %job_id,
      job_type,
      attempts = event.attempts_made,
      duration_ms,
      "Job completed."
    ),
    QueueEventKind::Failed if event.terminal => error!(
      queue = %event.queue,
      %job_id,
      job_type,
      attempts = event.attempts_made,
      duration_ms,
      reason = event.message.as_deref().unwrap_or(""),
      "Job failed permanently."
    ),
    QueueEventKind::Failed => warn!(
      queue = %event.queue,
      %job_id,
      job_type,
      attempts = event.attempts_made,
      duration_ms,
      reason = event.message.as_deref().unwrap_or(""),
      "Job attempt failed, retry scheduled."
    ),
    QueueEventKind::Stalled => {
      warn!(queue = %event.queue, %job_id, job_type, "Job stalled, re-queued.")
    }
    QueueEventKind::Error => error!(
      queue = %event.queue,
      error = event.message.as_deref().unwrap_or(""),
      "Queue error."
    ),
  }
}
