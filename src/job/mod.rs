#[cfg(feature = "job_context")]
pub mod context;

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::str::FromStr;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use cron::Schedule as CronSchedule;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::warn;
use uuid::Uuid;

use crate::command::WorkerOutcome;
use crate::error::{JobError, QueueError};

// --- Public Type Aliases ---

/// Identifier of a job, assigned by the queue on enqueue. Uses UUID v4.
pub type JobId = Uuid;

/// Job priority. Higher values are claimed first.
pub type JobPriority = i32;

/// Type alias for the simple numeric ID assigned to worker tasks for logging.
pub(crate) type WorkerId = usize;

/// Future returned by a processor invocation.
pub type ProcessorFuture = Pin<Box<dyn Future<Output = Result<Value, JobError>> + Send + 'static>>;

/// The function type bound to a (queue, job type) registration.
///
/// It receives a [`Job`] handle and resolves to either a JSON-serializable result
/// (the job completes) or a [`JobError`] (the attempt fails and the queue's retry
/// policy decides what happens next). Panics inside the processor are caught by the
/// worker and treated as a retryable failure.
pub type BoxedProcessor = Box<dyn Fn(Job) -> ProcessorFuture + Send + Sync + 'static>;

// --- Job State ---

/// State of a job record inside a queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
  /// Enqueued, but its delay (or retry backoff) has not elapsed yet.
  Delayed,
  /// Eligible and waiting for a processor slot.
  Waiting,
  /// Claimed by a processor.
  Active,
  Completed,
  Failed,
}

impl JobState {
  pub fn as_str(&self) -> &'static str {
    match self {
      JobState::Delayed => "delayed",
      JobState::Waiting => "waiting",
      JobState::Active => "active",
      JobState::Completed => "completed",
      JobState::Failed => "failed",
    }
  }

  /// `completed` and `failed` are terminal until a cleanup pass removes the record.
  pub fn is_finished(&self) -> bool {
    matches!(self, JobState::Completed | JobState::Failed)
  }
}

impl fmt::Display for JobState {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

// --- Retry Policy ---

/// Delay policy applied between attempts of a failed job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Backoff {
  /// Wait `delay` milliseconds before every retry.
  Fixed { delay: u64 },
  /// Wait `delay * 2^(attempts_made - 1)` milliseconds before a retry.
  Exponential { delay: u64 },
}

/// Upper bound on a single backoff interval (one day).
const MAX_BACKOFF_MS: u64 = 24 * 60 * 60 * 1000;

impl Backoff {
  pub fn fixed(delay: StdDuration) -> Self {
    Backoff::Fixed {
      delay: delay.as_millis() as u64,
    }
  }

  pub fn exponential(base: StdDuration) -> Self {
    Backoff::Exponential {
      delay: base.as_millis() as u64,
    }
  }

  /// Interval to wait after the `attempts_made`-th failed attempt (1-based).
  pub fn delay_for(&self, attempts_made: u32) -> StdDuration {
    let millis = match *self {
      Backoff::Fixed { delay } => delay,
      Backoff::Exponential { delay } => {
        let exponent = attempts_made.saturating_sub(1).min(32);
        delay.saturating_mul(1u64 << exponent)
      }
    };
    StdDuration::from_millis(millis.min(MAX_BACKOFF_MS))
  }
}

impl Default for Backoff {
  fn default() -> Self {
    Backoff::Fixed { delay: 0 }
  }
}

// --- Repeat ---

/// Recurring schedule for a job. Each occurrence is a separate job record; the next
/// one is enqueued when the current one is claimed by a processor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Repeat {
  /// Standard CRON expression with seconds (UTC), e.g. `"0 */5 * * * *"`.
  Cron {
    pattern: String,
    #[serde(default)]
    limit: Option<u32>,
  },
  /// Fixed interval between occurrences.
  Every {
    every_ms: u64,
    #[serde(default)]
    limit: Option<u32>,
  },
}

impl Repeat {
  pub fn cron(pattern: impl Into<String>) -> Self {
    Repeat::Cron {
      pattern: pattern.into(),
      limit: None,
    }
  }

  pub fn every(interval: StdDuration) -> Self {
    Repeat::Every {
      every_ms: interval.as_millis() as u64,
      limit: None,
    }
  }

  /// Stops after `limit` occurrences in total.
  pub fn with_limit(mut self, max: u32) -> Self {
    match &mut self {
      Repeat::Cron { limit, .. } | Repeat::Every { limit, .. } => *limit = Some(max),
    }
    self
  }

  pub fn limit(&self) -> Option<u32> {
    match self {
      Repeat::Cron { limit, .. } | Repeat::Every { limit, .. } => *limit,
    }
  }

  /// Checks that the schedule can produce occurrences at all.
  pub fn validate(&self) -> Result<(), String> {
    match self {
      Repeat::Cron { pattern, .. } => CronSchedule::from_str(pattern)
        .map(|_| ())
        .map_err(|e| format!("invalid cron expression '{pattern}': {e}")),
      Repeat::Every { every_ms, .. } if *every_ms == 0 => {
        Err("repeat interval must be greater than zero".to_string())
      }
      Repeat::Every { every_ms, .. } => match millis_after(Utc::now(), *every_ms) {
        Some(_) => Ok(()),
        None => Err(format!("repeat interval of {every_ms}ms is out of range")),
      },
    }
  }

  /// Calculates the next occurrence strictly after `reference_time`.
  /// Returns `None` if the schedule has no further occurrence.
  pub(crate) fn next_after(&self, reference_time: DateTime<Utc>) -> Option<DateTime<Utc>> {
    match self {
      Repeat::Cron { pattern, .. } => match CronSchedule::from_str(pattern) {
        Ok(schedule) => schedule.after(&reference_time).next(),
        Err(e) => {
          warn!("Failed to parse cron expression '{}': {}", pattern, e);
          None
        }
      },
      Repeat::Every { every_ms, .. } => millis_after(reference_time, *every_ms),
    }
  }
}

/// `at` plus `millis`, or `None` past the representable range.
pub(crate) fn millis_after(at: DateTime<Utc>, millis: u64) -> Option<DateTime<Utc>> {
  let offset = ChronoDuration::from_std(StdDuration::from_millis(millis)).ok()?;
  at.checked_add_signed(offset)
}

// --- Options ---

/// Per-job options. Any field left `None` falls back to the queue's
/// `default_job_options`, then to the built-in defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct JobOptions {
  pub priority: Option<JobPriority>,
  /// Milliseconds before the job becomes eligible.
  pub delay: Option<u64>,
  /// Maximum number of attempts (first run included).
  pub attempts: Option<u32>,
  pub backoff: Option<Backoff>,
  pub repeat: Option<Repeat>,
}

impl JobOptions {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn priority(mut self, priority: JobPriority) -> Self {
    self.priority = Some(priority);
    self
  }

  pub fn delay(mut self, delay: StdDuration) -> Self {
    self.delay = Some(u64::try_from(delay.as_millis()).unwrap_or(u64::MAX));
    self
  }

  pub fn attempts(mut self, attempts: u32) -> Self {
    self.attempts = Some(attempts);
    self
  }

  pub fn backoff(mut self, backoff: Backoff) -> Self {
    self.backoff = Some(backoff);
    self
  }

  pub fn repeat(mut self, repeat: Repeat) -> Self {
    self.repeat = Some(repeat);
    self
  }

  /// Returns these options with every unset field taken from `defaults`.
  pub fn merged_over(&self, defaults: &JobOptions) -> JobOptions {
    JobOptions {
      priority: self.priority.or(defaults.priority),
      delay: self.delay.or(defaults.delay),
      attempts: self.attempts.or(defaults.attempts),
      backoff: self.backoff.or(defaults.backoff),
      repeat: self.repeat.clone().or_else(|| defaults.repeat.clone()),
    }
  }
}

// --- Job Record ---

/// The durable record of a job, as stored under `{queue}:{id}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRecord {
  pub id: JobId,
  pub queue: String,
  #[serde(rename = "type")]
  pub job_type: String,
  pub payload: Value,
  pub priority: JobPriority,
  pub delay: u64,
  pub attempts_made: u32,
  pub max_attempts: u32,
  pub backoff: Backoff,
  pub state: JobState,
  pub created_at: DateTime<Utc>,
  /// When the job (or its pending retry) becomes eligible.
  pub eligible_at: DateTime<Utc>,
  pub processed_at: Option<DateTime<Utc>>,
  pub finished_at: Option<DateTime<Utc>>,
  pub failure_reason: Option<String>,
  pub return_value: Option<Value>,
  pub progress: Option<Value>,
  pub repeat: Option<Repeat>,
  /// Occurrence number of a repeatable job (1 for the first).
  #[serde(default)]
  pub repeat_count: u32,
  /// Monotonic enqueue sequence within the queue; breaks priority ties in FIFO order.
  #[serde(default)]
  pub seq: u64,
}

impl JobRecord {
  /// Builds a fresh record from fully merged options.
  pub(crate) fn new(
    queue: &str,
    job_type: &str,
    payload: Value,
    options: &JobOptions,
    now: DateTime<Utc>,
    seq: u64,
  ) -> Result<Self, QueueError> {
    let delay = options.delay.unwrap_or(0);
    let eligible_at = millis_after(now, delay).ok_or(QueueError::InvalidDelay(delay))?;
    Ok(Self {
      id: Uuid::new_v4(),
      queue: queue.to_string(),
      job_type: job_type.to_string(),
      payload,
      priority: options.priority.unwrap_or(0),
      delay,
      attempts_made: 0,
      max_attempts: options.attempts.unwrap_or(1).max(1),
      backoff: options.backoff.unwrap_or_default(),
      state: if delay > 0 {
        JobState::Delayed
      } else {
        JobState::Waiting
      },
      created_at: now,
      eligible_at,
      processed_at: None,
      finished_at: None,
      failure_reason: None,
      return_value: None,
      progress: None,
      repeat: options.repeat.clone(),
      repeat_count: 0,
      seq,
    })
  }

  /// Key of this record in the store.
  pub fn store_key(&self) -> String {
    store_key(&self.queue, self.id)
  }
}

/// `{queue}:{job_id}`
pub fn store_key(queue: &str, job_id: JobId) -> String {
  format!("{queue}:{job_id}")
}

// --- Processor-facing Job Handle ---

/// Read-only view of a job handed to its processor.
///
/// The only thing a processor may change about its job is its progress, through
/// [`Job::report_progress`]; the result is whatever the processor returns.
#[derive(Clone)]
pub struct Job {
  pub id: JobId,
  pub queue: String,
  pub job_type: String,
  pub payload: Value,
  pub priority: JobPriority,
  /// Attempts already finished before this one.
  pub attempts_made: u32,
  pub max_attempts: u32,
  pub created_at: DateTime<Utc>,
  pub(crate) outcome_tx: Option<mpsc::Sender<WorkerOutcome>>,
}

impl fmt::Debug for Job {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Job")
      .field("id", &self.id)
      .field("queue", &self.queue)
      .field("job_type", &self.job_type)
      .field("payload", &self.payload)
      .field("priority", &self.priority)
      .field("attempts_made", &self.attempts_made)
      .field("max_attempts", &self.max_attempts)
      .finish()
  }
}

impl Job {
  pub(crate) fn from_record(record: &JobRecord, outcome_tx: mpsc::Sender<WorkerOutcome>) -> Self {
    Self {
      id: record.id,
      queue: record.queue.clone(),
      job_type: record.job_type.clone(),
      payload: record.payload.clone(),
      priority: record.priority,
      attempts_made: record.attempts_made,
      max_attempts: record.max_attempts,
      created_at: record.created_at,
      outcome_tx: Some(outcome_tx),
    }
  }

  /// Builds a detached job, not bound to any queue. Progress reports are dropped.
  /// Useful for invoking processors directly.
  pub fn detached(job_type: &str, payload: Value) -> Self {
    Self {
      id: Uuid::new_v4(),
      queue: String::new(),
      job_type: job_type.to_string(),
      payload,
      priority: 0,
      attempts_made: 0,
      max_attempts: 1,
      created_at: Utc::now(),
      outcome_tx: None,
    }
  }

  /// 1-based number of the attempt currently running.
  pub fn attempt(&self) -> u32 {
    self.attempts_made + 1
  }

  /// Decodes the payload into `T`. A payload that does not decode is a fatal job error.
  pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, JobError> {
    Ok(serde_json::from_value(self.payload.clone())?)
  }

  /// Records progress for this job. Best-effort: dropped if the queue is saturated.
  pub fn report_progress(&self, progress: Value) {
    if let Some(tx) = &self.outcome_tx {
      let update = WorkerOutcome::Progress {
        job_id: self.id,
        progress,
      };
      if tx.try_send(update).is_err() {
        warn!(job_id = %self.id, "Dropped progress update (queue busy or closed).");
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn exponential_backoff_doubles_per_attempt() {
    let backoff = Backoff::Exponential { delay: 100 };
    assert_eq!(backoff.delay_for(1), StdDuration::from_millis(100));
    assert_eq!(backoff.delay_for(2), StdDuration::from_millis(200));
    assert_eq!(backoff.delay_for(4), StdDuration::from_millis(800));
  }

  #[test]
  fn fixed_backoff_is_constant_and_capped() {
    assert_eq!(
      Backoff::Fixed { delay: 250 }.delay_for(7),
      StdDuration::from_millis(250)
    );
    let huge = Backoff::Exponential { delay: u64::MAX / 2 };
    assert_eq!(huge.delay_for(40), StdDuration::from_millis(MAX_BACKOFF_MS));
  }

  #[test]
  fn options_merge_prefers_explicit_values() {
    let defaults = JobOptions::new()
      .priority(1)
      .attempts(3)
      .backoff(Backoff::Exponential { delay: 1000 });
    let merged = JobOptions::new().priority(9).merged_over(&defaults);
    assert_eq!(merged.priority, Some(9));
    assert_eq!(merged.attempts, Some(3));
    assert_eq!(merged.backoff, Some(Backoff::Exponential { delay: 1000 }));
    assert_eq!(merged.delay, None);
  }

  #[test]
  fn options_deserialize_from_wire_shape() {
    let options: JobOptions = serde_json::from_value(serde_json::json!({
      "priority": 5,
      "attempts": 2,
      "backoff": { "type": "fixed", "delay": 100 }
    }))
    .unwrap();
    assert_eq!(options.priority, Some(5));
    assert_eq!(options.backoff, Some(Backoff::Fixed { delay: 100 }));
  }

  #[test]
  fn repeat_validation_rejects_bad_cron() {
    assert!(Repeat::cron("not a cron").validate().is_err());
    assert!(Repeat::cron("0 */5 * * * *").validate().is_ok());
    assert!(Repeat::every(StdDuration::ZERO).validate().is_err());
    let forever = Repeat::Every { every_ms: u64::MAX, limit: None };
    assert!(forever.validate().is_err());
    assert_eq!(forever.next_after(Utc::now()), None);
  }

  #[test]
  fn out_of_range_delay_is_rejected() {
    let now = Utc::now();
    for delay in [10_u64.pow(16), i64::MAX as u64 + 1, u64::MAX] {
      let options = JobOptions { delay: Some(delay), ..JobOptions::default() };
      let err = JobRecord::new("jobs", "send-email", Value::Null, &options, now, 1).unwrap_err();
      assert!(matches!(err, QueueError::InvalidDelay(d) if d == delay));
    }
  }

  #[test]
  fn delayed_record_starts_in_delayed_state() {
    let now = Utc::now();
    let options = JobOptions::new().delay(StdDuration::from_millis(500));
    let record = JobRecord::new("jobs", "send-email", Value::Null, &options, now, 1).unwrap();
    assert_eq!(record.state, JobState::Delayed);
    assert_eq!(record.eligible_at, now + ChronoDuration::milliseconds(500));
    assert_eq!(record.max_attempts, 1);
    assert_eq!(record.store_key(), format!("jobs:{}", record.id));
  }
}
