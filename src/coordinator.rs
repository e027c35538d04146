use crate::command::{QueueCommand, ShutdownMode, WorkerOutcome};
use crate::error::{QueueError, StoreError};
use crate::events::{EventBus, QueueEvent, QueueEventKind};
use crate::job::{BoxedProcessor, JobId, JobOptions, JobPriority, JobRecord, JobState, Repeat};
use crate::metrics::QueueMetrics;
use crate::queue::{report_panics, FaultHook, QueueOptions, QueueStats};
use crate::store::{ConnectionState, JobStore};
use crate::worker::Worker;

use std::cmp::Reverse;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::Ordering as AtomicOrdering;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use priority_queue::PriorityQueue;
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

/// Waiting jobs of one type: highest priority first, then lowest enqueue sequence.
type WaitingLane = PriorityQueue<JobId, (JobPriority, Reverse<u64>)>;

/// Delayed jobs (initial delay or retry backoff): earliest eligibility first.
type DelayedSet = PriorityQueue<JobId, Reverse<(DateTime<Utc>, u64)>>;

/// Upper bound on a single timer sleep while delayed jobs exist.
const MAX_TIMER_SLEEP: Duration = Duration::from_secs(60);

/// A registered processor with its own concurrency budget and workers.
struct Registration {
  concurrency: usize,
  active: usize,
  dispatch_tx: async_channel::Sender<JobRecord>,
  workers: Vec<JoinHandle<()>>,
}

/// Channels and collaborators handed to the coordinator when a queue is opened.
pub(crate) struct CoordinatorState {
  pub name: String,
  pub options: QueueOptions,
  pub store: Arc<dyn JobStore>,
  pub events: Arc<EventBus>,
  pub metrics: QueueMetrics,
  pub cmd_rx: mpsc::Receiver<QueueCommand>,
  pub shutdown_rx: watch::Receiver<Option<ShutdownMode>>,
  pub connection_rx: watch::Receiver<ConnectionState>,
  /// Records found in the store when the queue was opened.
  pub recovered: Vec<JobRecord>,
  pub fault_hook: Option<FaultHook>,
}

/// The per-queue coordinator task.
///
/// It exclusively owns every job record of its queue. State transitions happen
/// here only, each one written through to the store before it is acted upon, and
/// each one emitted synchronously to the queue's observers.
pub(crate) struct Coordinator {
  name: String,
  options: QueueOptions,
  store: Arc<dyn JobStore>,
  events: Arc<EventBus>,
  metrics: QueueMetrics,
  cmd_rx: mpsc::Receiver<QueueCommand>,
  shutdown_rx: watch::Receiver<Option<ShutdownMode>>,
  connection_rx: watch::Receiver<ConnectionState>,
  outcome_tx: mpsc::Sender<WorkerOutcome>,
  outcome_rx: mpsc::Receiver<WorkerOutcome>,
  fault_hook: Option<FaultHook>,

  jobs: HashMap<JobId, JobRecord>,
  waiting: HashMap<String, WaitingLane>,
  delayed: DelayedSet,
  completed_order: VecDeque<JobId>,
  failed_order: VecDeque<JobId>,
  registrations: HashMap<String, Registration>,
  next_seq: u64,
  next_worker_id: usize,

  paused: bool,
  store_ready: bool,
  commands_open: bool,
  shutting_down: Option<ShutdownMode>,
}

impl Coordinator {
  pub fn new(state: CoordinatorState) -> Self {
    let (outcome_tx, outcome_rx) = mpsc::channel(state.options.command_buffer.max(16));
    let store_ready = state.connection_rx.borrow().is_ready();
    let mut coordinator = Self {
      name: state.name,
      options: state.options,
      store: state.store,
      events: state.events,
      metrics: state.metrics,
      cmd_rx: state.cmd_rx,
      shutdown_rx: state.shutdown_rx,
      connection_rx: state.connection_rx,
      outcome_tx,
      outcome_rx,
      fault_hook: state.fault_hook,
      jobs: HashMap::new(),
      waiting: HashMap::new(),
      delayed: PriorityQueue::new(),
      completed_order: VecDeque::new(),
      failed_order: VecDeque::new(),
      registrations: HashMap::new(),
      next_seq: 0,
      next_worker_id: 0,
      paused: false,
      store_ready,
      commands_open: true,
      shutting_down: None,
    };
    coordinator.recover(state.recovered);
    coordinator
  }

  /// Rebuilds in-memory state from the records found in the store.
  ///
  /// Records left `active` belonged to a processor that no longer exists: they are
  /// reported as stalled and put back in line without consuming an attempt.
  fn recover(&mut self, mut records: Vec<JobRecord>) {
    if records.is_empty() {
      return;
    }
    records.sort_by_key(|record| record.seq);
    let total = records.len();
    let mut finished: Vec<(DateTime<Utc>, JobId, JobState)> = Vec::new();

    for mut record in records {
      self.next_seq = self.next_seq.max(record.seq);
      match record.state {
        JobState::Waiting => self.push_waiting(&record),
        JobState::Delayed => self.push_delayed(&record),
        JobState::Active => {
          QueueMetrics::incr(&self.metrics.jobs_stalled);
          record.state = JobState::Waiting;
          record.processed_at = None;
          self.persist(&record);
          self.emit(
            QueueEvent::job(QueueEventKind::Stalled, &self.name, record.id, &record.job_type)
              .attempts(record.attempts_made),
          );
          self.push_waiting(&record);
        }
        JobState::Completed | JobState::Failed => {
          let finished_at = record.finished_at.unwrap_or(record.created_at);
          finished.push((finished_at, record.id, record.state));
        }
      }
      self.jobs.insert(record.id, record);
    }

    finished.sort_by_key(|(finished_at, _, _)| *finished_at);
    for (_, job_id, state) in finished {
      match state {
        JobState::Completed => self.completed_order.push_back(job_id),
        _ => self.failed_order.push_back(job_id),
      }
    }
    info!(queue = %self.name, jobs = total, "Recovered jobs from store.");
  }

  /// Runs the main event loop until shutdown.
  pub async fn run(&mut self) {
    info!(queue = %self.name, "Queue coordinator started.");

    loop {
      if self.shutting_down.is_none() {
        self.promote_due_jobs();
        self.dispatch_ready_jobs();
      }

      match self.shutting_down {
        Some(ShutdownMode::Force) => break,
        Some(ShutdownMode::Graceful) => {
          let active = self.active_total();
          if active == 0 {
            info!(queue = %self.name, "Graceful shutdown: no active jobs. Coordinator exiting.");
            break;
          }
          trace!(queue = %self.name, active, "Graceful shutdown: waiting for active jobs.");
        }
        None => {}
      }

      let timer = self.next_timer();
      tokio::select! {
        biased;

        Ok(()) = self.shutdown_rx.changed() => {
          let mode = *self.shutdown_rx.borrow_and_update();
          if mode.is_some() && mode != self.shutting_down {
            info!(queue = %self.name, ?mode, "Queue coordinator received shutdown signal.");
            self.shutting_down = mode;
          }
        }

        maybe_cmd = self.cmd_rx.recv(), if self.commands_open => {
          match maybe_cmd {
            Some(cmd) => self.handle_command(cmd),
            None => {
              // Every handle was dropped without closing the queue.
              self.commands_open = false;
              if self.shutting_down.is_none() {
                warn!(queue = %self.name, "All queue handles dropped. Shutting down gracefully.");
                self.shutting_down = Some(ShutdownMode::Graceful);
              }
            }
          }
        }

        Some(outcome) = self.outcome_rx.recv() => {
          self.handle_outcome(outcome);
        }

        Ok(()) = self.connection_rx.changed() => {
          let state = *self.connection_rx.borrow_and_update();
          self.handle_connection_change(state);
        }

        _ = sleep(timer.unwrap_or(Duration::ZERO)), if timer.is_some() => {
          trace!(queue = %self.name, "Timer fired.");
        }
      }
    }

    self.stop_workers().await;
    info!(queue = %self.name, "Queue coordinator shut down.");
  }

  /// Closes every dispatch channel and waits for (or, when forced, aborts) workers.
  async fn stop_workers(&mut self) {
    let forced = self.shutting_down == Some(ShutdownMode::Force);
    let mut handles = Vec::new();
    for (job_type, registration) in self.registrations.drain() {
      registration.dispatch_tx.close();
      if forced && registration.active > 0 {
        warn!(
          queue = %self.name,
          %job_type,
          active = registration.active,
          "Forced shutdown abandons active jobs; they will be recovered as stalled."
        );
      }
      handles.extend(registration.workers);
    }
    if forced {
      for handle in &handles {
        handle.abort();
      }
    }
    for result in futures::future::join_all(handles).await {
      if let Err(e) = result {
        if e.is_panic() {
          error!(queue = %self.name, "Worker task panicked: {:?}", e);
        }
      }
    }
    self
      .metrics
      .workers_active_current
      .store(0, AtomicOrdering::Relaxed);
  }

  // --- Commands ---

  fn handle_command(&mut self, cmd: QueueCommand) {
    trace!(queue = %self.name, ?cmd, "Handling queue command.");
    match cmd {
      QueueCommand::Enqueue {
        job_type,
        payload,
        options,
        responder,
      } => {
        let result = self.enqueue(&job_type, payload, &options);
        let _ = responder.send(result);
      }
      QueueCommand::GetJob { job_id, responder } => {
        let _ = responder.send(self.jobs.get(&job_id).cloned());
      }
      QueueCommand::Counts { responder } => {
        let _ = responder.send(self.counts());
      }
      QueueCommand::Pause { responder } => {
        if !self.paused {
          info!(queue = %self.name, "Queue paused.");
        }
        self.paused = true;
        let _ = responder.send(());
      }
      QueueCommand::Resume { responder } => {
        if self.paused {
          info!(queue = %self.name, "Queue resumed.");
        }
        self.paused = false;
        let _ = responder.send(());
      }
      QueueCommand::Clean {
        older_than,
        responder,
      } => {
        let _ = responder.send(self.clean(older_than));
      }
      QueueCommand::RegisterProcessor {
        job_type,
        concurrency,
        processor,
        responder,
      } => {
        let _ = responder.send(self.register(job_type, concurrency, processor));
      }
    }
  }

  fn enqueue(
    &mut self,
    job_type: &str,
    payload: Value,
    options: &JobOptions,
  ) -> Result<JobRecord, QueueError> {
    if let Some(repeat) = &options.repeat {
      repeat.validate().map_err(QueueError::InvalidRepeat)?;
    }
    if !self.store_ready {
      return Err(QueueError::Unavailable(self.name.clone()));
    }

    let now = Utc::now();
    let mut record = JobRecord::new(&self.name, job_type, payload, options, now, self.next_seq + 1)?;
    if let Some(repeat) = &record.repeat {
      record.repeat_count = 1;
      // A cron schedule fires on its next match, not at enqueue time.
      if let Repeat::Cron { .. } = repeat {
        match repeat.next_after(record.eligible_at) {
          Some(first) => {
            record.eligible_at = first;
            record.state = JobState::Delayed;
          }
          None => {
            return Err(QueueError::InvalidRepeat(
              "schedule has no upcoming occurrence".to_string(),
            ))
          }
        }
      }
    }

    self.store.put(&record).map_err(|e| self.store_error(e))?;
    self.next_seq = record.seq;
    QueueMetrics::incr(&self.metrics.jobs_enqueued);
    debug!(queue = %self.name, job_id = %record.id, %job_type, state = %record.state, "Job enqueued.");

    self.insert_scheduled(record.clone());
    Ok(record)
  }

  /// Places a freshly persisted record in the waiting lane or the delayed set.
  fn insert_scheduled(&mut self, record: JobRecord) {
    match record.state {
      JobState::Waiting => {
        self.push_waiting(&record);
        self.emit(QueueEvent::job(
          QueueEventKind::Waiting,
          &self.name,
          record.id,
          &record.job_type,
        ));
      }
      _ => self.push_delayed(&record),
    }
    self.jobs.insert(record.id, record);
  }

  fn register(
    &mut self,
    job_type: String,
    concurrency: usize,
    processor: Arc<BoxedProcessor>,
  ) -> Result<(), QueueError> {
    if concurrency == 0 {
      return Err(QueueError::ZeroConcurrency(job_type));
    }
    if self.registrations.contains_key(&job_type) {
      return Err(QueueError::ProcessorAlreadyRegistered {
        queue: self.name.clone(),
        job_type,
      });
    }

    let (dispatch_tx, dispatch_rx) = async_channel::bounded(concurrency);
    let mut workers = Vec::with_capacity(concurrency);
    for _ in 0..concurrency {
      self.next_worker_id += 1;
      let mut worker = Worker::new(
        self.next_worker_id,
        self.name.clone(),
        job_type.clone(),
        processor.clone(),
        self.metrics.clone(),
        self.shutdown_rx.clone(),
        self.outcome_tx.clone(),
        dispatch_rx.clone(),
      );
      let what = format!("queue '{}' worker {}", self.name, self.next_worker_id);
      let fault_hook = self.fault_hook.clone();
      workers.push(tokio::spawn(async move { report_panics(worker.run(), what, fault_hook).await }));
    }

    info!(queue = %self.name, %job_type, concurrency, "Processor registered.");
    self.registrations.insert(
      job_type,
      Registration {
        concurrency,
        active: 0,
        dispatch_tx,
        workers,
      },
    );
    Ok(())
  }

  fn counts(&self) -> QueueStats {
    let mut stats = QueueStats {
      paused: self.paused,
      ..QueueStats::default()
    };
    for record in self.jobs.values() {
      match record.state {
        JobState::Waiting => stats.waiting += 1,
        JobState::Active => stats.active += 1,
        JobState::Completed => stats.completed += 1,
        JobState::Failed => stats.failed += 1,
        JobState::Delayed => stats.delayed += 1,
      }
    }
    stats
  }

  /// Removes finished jobs with `finished_at < now - older_than`.
  fn clean(&mut self, older_than: Duration) -> Result<usize, QueueError> {
    let cutoff = ChronoDuration::from_std(older_than)
      .ok()
      .and_then(|older_than| Utc::now().checked_sub_signed(older_than))
      .unwrap_or(DateTime::<Utc>::MIN_UTC);
    let expired: Vec<JobId> = self
      .jobs
      .values()
      .filter(|record| record.state.is_finished())
      .filter(|record| record.finished_at.map_or(false, |at| at < cutoff))
      .map(|record| record.id)
      .collect();

    let mut removed = 0;
    for job_id in expired {
      self.store.remove(&self.name, job_id).map_err(|e| self.store_error(e))?;
      self.jobs.remove(&job_id);
      removed += 1;
    }
    if removed > 0 {
      let jobs = &self.jobs;
      self.completed_order.retain(|id| jobs.contains_key(id));
      self.failed_order.retain(|id| jobs.contains_key(id));
      info!(queue = %self.name, removed, "Cleaned finished jobs.");
    }
    Ok(removed)
  }

  // --- Outcomes ---

  fn handle_outcome(&mut self, outcome: WorkerOutcome) {
    match outcome {
      WorkerOutcome::Completed {
        job_id,
        result,
        duration,
      } => {
        let Some(mut record) = self.claim_back(job_id) else {
          return;
        };
        let now = Utc::now();
        record.attempts_made += 1;
        record.state = JobState::Completed;
        record.finished_at = Some(now);
        record.return_value = Some(result.clone());
        record.failure_reason = None;
        self.persist(&record);
        self.emit(
          QueueEvent::job(QueueEventKind::Completed, &self.name, job_id, &record.job_type)
            .attempts(record.attempts_made)
            .data(result)
            .duration(duration),
        );
        self.jobs.insert(job_id, record);
        self.completed_order.push_back(job_id);
        self.enforce_keep_limit(JobState::Completed);
      }
      WorkerOutcome::Failed {
        job_id,
        reason,
        retryable,
        duration,
      } => {
        let Some(mut record) = self.claim_back(job_id) else {
          return;
        };
        let now = Utc::now();
        record.attempts_made += 1;
        record.failure_reason = Some(reason.clone());
        let retry = retryable && record.attempts_made < record.max_attempts;

        if retry {
          let backoff = record.backoff.delay_for(record.attempts_made);
          record.state = JobState::Delayed;
          record.eligible_at = now
            + ChronoDuration::from_std(backoff).unwrap_or_else(|_| ChronoDuration::zero());
          QueueMetrics::incr(&self.metrics.jobs_retried);
          debug!(
            queue = %self.name,
            %job_id,
            attempts = record.attempts_made,
            max_attempts = record.max_attempts,
            backoff_ms = backoff.as_millis() as u64,
            "Scheduling retry."
          );
        } else {
          record.state = JobState::Failed;
          record.finished_at = Some(now);
          QueueMetrics::incr(&self.metrics.jobs_permanently_failed);
        }

        self.persist(&record);
        self.emit(
          QueueEvent::job(QueueEventKind::Failed, &self.name, job_id, &record.job_type)
            .attempts(record.attempts_made)
            .message(reason)
            .duration(duration)
            .terminal(!retry),
        );

        if retry {
          self.push_delayed(&record);
          self.jobs.insert(job_id, record);
        } else {
          self.jobs.insert(job_id, record);
          self.failed_order.push_back(job_id);
          self.enforce_keep_limit(JobState::Failed);
        }
      }
      WorkerOutcome::Progress { job_id, progress } => {
        let Some(record) = self.jobs.get_mut(&job_id) else {
          return;
        };
        if record.state != JobState::Active {
          trace!(queue = %self.name, %job_id, "Ignoring progress for inactive job.");
          return;
        }
        record.progress = Some(progress.clone());
        let record = record.clone();
        self.persist(&record);
        self.emit(
          QueueEvent::job(QueueEventKind::Progress, &self.name, job_id, &record.job_type)
            .attempts(record.attempts_made)
            .data(progress),
        );
      }
    }
  }

  /// Takes an active record back from its registration, releasing a concurrency slot.
  fn claim_back(&mut self, job_id: JobId) -> Option<JobRecord> {
    let record = match self.jobs.remove(&job_id) {
      Some(record) if record.state == JobState::Active => record,
      Some(record) => {
        warn!(queue = %self.name, %job_id, state = %record.state, "Outcome for a job that is not active.");
        self.jobs.insert(job_id, record);
        return None;
      }
      None => {
        warn!(queue = %self.name, %job_id, "Outcome for unknown job.");
        return None;
      }
    };
    if let Some(registration) = self.registrations.get_mut(&record.job_type) {
      registration.active = registration.active.saturating_sub(1);
    }
    self
      .metrics
      .workers_active_current
      .store(self.active_total(), AtomicOrdering::Relaxed);
    Some(record)
  }

  /// Drops the oldest finished records of `state` beyond the configured cap.
  fn enforce_keep_limit(&mut self, state: JobState) {
    let (keep, order) = match state {
      JobState::Completed => (self.options.keep_completed, &mut self.completed_order),
      JobState::Failed => (self.options.keep_failed, &mut self.failed_order),
      _ => return,
    };
    let Some(keep) = keep else {
      return;
    };
    let mut evicted = Vec::new();
    while order.len() > keep {
      if let Some(job_id) = order.pop_front() {
        evicted.push(job_id);
      }
    }
    for job_id in evicted {
      match self.store.remove(&self.name, job_id) {
        Ok(()) => {
          self.jobs.remove(&job_id);
        }
        Err(e) => {
          // Keep the record tracked so a later pass can remove it.
          warn!(queue = %self.name, %job_id, error = %e, "Failed to evict finished job.");
          match state {
            JobState::Completed => self.completed_order.push_front(job_id),
            _ => self.failed_order.push_front(job_id),
          }
          break;
        }
      }
    }
  }

  // --- Scheduling ---

  /// Moves delayed jobs whose eligibility time has passed into their waiting lane.
  fn promote_due_jobs(&mut self) {
    let now = Utc::now();
    while let Some((_, Reverse((eligible_at, _)))) = self.delayed.peek() {
      if *eligible_at > now {
        break;
      }
      let Some((job_id, _)) = self.delayed.pop() else {
        break;
      };
      let Some(record) = self.jobs.get_mut(&job_id) else {
        continue;
      };
      record.state = JobState::Waiting;
      let record = record.clone();
      self.persist(&record);
      self.push_waiting(&record);
      self.emit(
        QueueEvent::job(QueueEventKind::Waiting, &self.name, job_id, &record.job_type)
          .attempts(record.attempts_made),
      );
    }
  }

  /// Claims waiting jobs for every registration with a free slot.
  fn dispatch_ready_jobs(&mut self) {
    if self.paused || !self.store_ready {
      return;
    }

    let job_types: Vec<String> = self.registrations.keys().cloned().collect();
    for job_type in job_types {
      loop {
        let Some(registration) = self.registrations.get(&job_type) else {
          break;
        };
        if registration.active >= registration.concurrency {
          break;
        }
        let Some((job_id, _)) = self.waiting.get_mut(&job_type).and_then(|lane| lane.pop()) else {
          break;
        };
        let Some(record) = self.jobs.get(&job_id).cloned() else {
          continue;
        };

        let mut claimed = record.clone();
        claimed.state = JobState::Active;
        claimed.processed_at = Some(Utc::now());
        claimed.progress = None;
        if let Err(e) = self.store.put(&claimed) {
          // Leave the job in line; it is claimed once the store is writable again.
          error!(queue = %self.name, %job_id, error = %e, "Failed to persist claimed job.");
          self.push_waiting(&record);
          self.emit(QueueEvent::queue_error(&self.name, e.to_string()));
          return;
        }

        let Some(registration) = self.registrations.get_mut(&job_type) else {
          break;
        };
        if let Err(e) = registration.dispatch_tx.try_send(claimed.clone()) {
          error!(queue = %self.name, %job_id, "Dispatch channel rejected job: {}", e);
          self.persist(&record);
          self.push_waiting(&record);
          break;
        }
        registration.active += 1;

        self.emit(
          QueueEvent::job(QueueEventKind::Active, &self.name, job_id, &job_type)
            .attempts(claimed.attempts_made),
        );
        let next = self.next_occurrence(&claimed);
        self.jobs.insert(job_id, claimed);
        if let Some(next) = next {
          self.schedule_occurrence(next);
        }
      }
    }

    self
      .metrics
      .workers_active_current
      .store(self.active_total(), AtomicOrdering::Relaxed);
  }

  /// Builds the next occurrence of a repeatable job, unless its limit is reached.
  fn next_occurrence(&self, record: &JobRecord) -> Option<JobRecord> {
    let repeat = record.repeat.as_ref()?;
    let count = record.repeat_count.saturating_add(1);
    if repeat.limit().map_or(false, |limit| count > limit) {
      debug!(queue = %self.name, job_id = %record.id, "Repeat limit reached.");
      return None;
    }
    let now = Utc::now();
    let next_at = match repeat {
      Repeat::Every { .. } => repeat
        .next_after(record.eligible_at)
        .filter(|at| *at > now)
        .or_else(|| repeat.next_after(now)),
      Repeat::Cron { .. } => repeat.next_after(now),
    }?;

    let mut next = record.clone();
    next.id = Uuid::new_v4();
    next.state = JobState::Delayed;
    next.attempts_made = 0;
    next.created_at = now;
    next.eligible_at = next_at;
    next.delay = (next_at - now).num_milliseconds().max(0) as u64;
    next.processed_at = None;
    next.finished_at = None;
    next.failure_reason = None;
    next.return_value = None;
    next.progress = None;
    next.repeat_count = count;
    Some(next)
  }

  fn schedule_occurrence(&mut self, mut next: JobRecord) {
    next.seq = self.next_seq + 1;
    match self.store.put(&next) {
      Ok(()) => {
        self.next_seq = next.seq;
        QueueMetrics::incr(&self.metrics.jobs_enqueued);
        debug!(
          queue = %self.name,
          job_id = %next.id,
          job_type = %next.job_type,
          occurrence = next.repeat_count,
          eligible_at = %next.eligible_at,
          "Scheduled next occurrence."
        );
        self.insert_scheduled(next);
      }
      Err(e) => {
        error!(queue = %self.name, job_type = %next.job_type, error = %e, "Failed to schedule next occurrence.");
        self.emit(QueueEvent::queue_error(&self.name, e.to_string()));
      }
    }
  }

  /// Time until the earliest delayed job, if any.
  fn next_timer(&self) -> Option<Duration> {
    if self.shutting_down.is_some() {
      return None;
    }
    let (_, Reverse((eligible_at, _))) = self.delayed.peek()?;
    let until = (*eligible_at - Utc::now())
      .to_std()
      .unwrap_or(Duration::ZERO);
    Some(until.clamp(Duration::from_millis(1), MAX_TIMER_SLEEP))
  }

  fn handle_connection_change(&mut self, state: ConnectionState) {
    let ready = state.is_ready();
    if ready == self.store_ready {
      return;
    }
    self.store_ready = ready;
    if ready {
      info!(queue = %self.name, "Store connection restored. Resuming dispatch.");
    } else {
      self.emit(QueueEvent::queue_error(
        &self.name,
        format!("store connection {state:?}"),
      ));
    }
  }

  // --- Helpers ---

  fn push_waiting(&mut self, record: &JobRecord) {
    self
      .waiting
      .entry(record.job_type.clone())
      .or_default()
      .push(record.id, (record.priority, Reverse(record.seq)));
  }

  fn push_delayed(&mut self, record: &JobRecord) {
    self
      .delayed
      .push(record.id, Reverse((record.eligible_at, record.seq)));
  }

  fn active_total(&self) -> usize {
    self.registrations.values().map(|r| r.active).sum()
  }

  /// Writes a transition through to the store. Failures are reported, not fatal:
  /// the in-memory state stays authoritative and the next transition rewrites it.
  fn persist(&self, record: &JobRecord) {
    if let Err(e) = self.store.put(record) {
      warn!(queue = %self.name, job_id = %record.id, error = %e, "Failed to persist job transition.");
      self.emit(QueueEvent::queue_error(&self.name, e.to_string()));
    }
  }

  fn store_error(&self, err: StoreError) -> QueueError {
    match err {
      StoreError::Disconnected => QueueError::Unavailable(self.name.clone()),
      other => QueueError::Store(other),
    }
  }

  fn emit(&self, event: QueueEvent) {
    self.events.emit(&event);
  }
}
