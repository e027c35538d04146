use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

// --- Duration Histogram ---

/// Lock-free count and sum of observed durations.
///
/// Enough for a mean; no percentiles.
#[derive(Debug, Default)]
pub struct DurationHistogram {
  count: AtomicUsize,
  sum_micros: AtomicUsize,
}

impl DurationHistogram {
  /// Adds one observation.
  pub fn record(&self, duration: Duration) {
    self.count.fetch_add(1, Ordering::Relaxed);
    self.sum_micros.fetch_add(
      duration.as_micros().try_into().unwrap_or(usize::MAX),
      Ordering::Relaxed,
    );
  }

  pub fn count(&self) -> usize {
    self.count.load(Ordering::Relaxed)
  }

  /// Total of all recorded durations, in microseconds.
  pub fn sum_micros(&self) -> usize {
    self.sum_micros.load(Ordering::Relaxed)
  }
}

// --- Queue Metrics ---

/// Atomic counters for one queue.
///
/// Cloned into the coordinator and every worker of the queue; cloning only
/// clones the `Arc`s.
#[derive(Debug, Clone, Default)]
pub struct QueueMetrics {
  // --- Counters ---
  /// Jobs accepted by `add` (repeat occurrences included).
  pub jobs_enqueued: Arc<AtomicUsize>,
  /// Attempts that resolved with a result.
  pub jobs_completed: Arc<AtomicUsize>,
  /// Attempts that failed, whether or not a retry follows.
  pub jobs_failed_attempts: Arc<AtomicUsize>,
  /// Retries scheduled after a failed attempt.
  pub jobs_retried: Arc<AtomicUsize>,
  /// Jobs that reached terminal `failed`.
  pub jobs_permanently_failed: Arc<AtomicUsize>,
  /// Attempts whose processor panicked.
  pub jobs_panicked: Arc<AtomicUsize>,
  /// Jobs found `active` when the queue was opened.
  pub jobs_stalled: Arc<AtomicUsize>,

  // --- Gauges ---
  /// Jobs currently claimed by a processor, across all registrations.
  pub workers_active_current: Arc<AtomicUsize>,

  // --- Histograms ---
  pub job_execution_duration: Arc<DurationHistogram>,
  /// Time between a job becoming eligible and a worker starting it.
  pub job_wait_duration: Arc<DurationHistogram>,
}

impl QueueMetrics {
  pub fn new() -> Self {
    Self::default()
  }

  pub(crate) fn incr(counter: &AtomicUsize) {
    counter.fetch_add(1, Ordering::Relaxed);
  }

  /// Point-in-time copy of every value.
  pub fn snapshot(&self) -> MetricsSnapshot {
    let order = Ordering::Relaxed;
    MetricsSnapshot {
      jobs_enqueued: self.jobs_enqueued.load(order),
      jobs_completed: self.jobs_completed.load(order),
      jobs_failed_attempts: self.jobs_failed_attempts.load(order),
      jobs_retried: self.jobs_retried.load(order),
      jobs_permanently_failed: self.jobs_permanently_failed.load(order),
      jobs_panicked: self.jobs_panicked.load(order),
      jobs_stalled: self.jobs_stalled.load(order),
      workers_active_current: self.workers_active_current.load(order),
      job_execution_duration_count: self.job_execution_duration.count(),
      job_execution_duration_sum_micros: self.job_execution_duration.sum_micros(),
      job_wait_duration_count: self.job_wait_duration.count(),
      job_wait_duration_sum_micros: self.job_wait_duration.sum_micros(),
    }
  }
}

// --- Snapshot ---

/// A snapshot of a queue's metrics at a specific point in time.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
  pub jobs_enqueued: usize,
  pub jobs_completed: usize,
  pub jobs_failed_attempts: usize,
  pub jobs_retried: usize,
  pub jobs_permanently_failed: usize,
  pub jobs_panicked: usize,
  pub jobs_stalled: usize,
  pub workers_active_current: usize,
  pub job_execution_duration_count: usize,
  pub job_execution_duration_sum_micros: usize,
  pub job_wait_duration_count: usize,
  pub job_wait_duration_sum_micros: usize,
}

impl MetricsSnapshot {
  /// Mean job execution duration in microseconds, if any attempt finished.
  pub fn mean_execution_duration_micros(&self) -> Option<f64> {
    if self.job_execution_duration_count == 0 {
      None
    } else {
      Some(self.job_execution_duration_sum_micros as f64 / self.job_execution_duration_count as f64)
    }
  }

  pub fn mean_execution_duration(&self) -> Option<Duration> {
    self
      .mean_execution_duration_micros()
      .map(|micros| Duration::from_micros(micros as u64))
  }

  /// Sums two snapshots field by field, for process-wide totals.
  pub fn merge(&self, other: &MetricsSnapshot) -> MetricsSnapshot {
    MetricsSnapshot {
      jobs_enqueued: self.jobs_enqueued + other.jobs_enqueued,
      jobs_completed: self.jobs_completed + other.jobs_completed,
      jobs_failed_attempts: self.jobs_failed_attempts + other.jobs_failed_attempts,
      jobs_retried: self.jobs_retried + other.jobs_retried,
      jobs_permanently_failed: self.jobs_permanently_failed + other.jobs_permanently_failed,
      jobs_panicked: self.jobs_panicked + other.jobs_panicked,
      jobs_stalled: self.jobs_stalled + other.jobs_stalled,
      workers_active_current: self.workers_active_current + other.workers_active_current,
      job_execution_duration_count: self.job_execution_duration_count
        + other.job_execution_duration_count,
      job_execution_duration_sum_micros: self.job_execution_duration_sum_micros
        + other.job_execution_duration_sum_micros,
      job_wait_duration_count: self.job_wait_duration_count + other.job_wait_duration_count,
      job_wait_duration_sum_micros: self.job_wait_duration_sum_micros
        + other.job_wait_duration_sum_micros,
    }
  }
}
