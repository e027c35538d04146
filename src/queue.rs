//! The handle through which producers and processors talk to one queue.

use crate::command::{QueueCommand, ShutdownMode};
use crate::coordinator::{Coordinator, CoordinatorState};
use crate::error::{JobError, QueueError, StoreError};
use crate::events::{EventBus, ObserverHandle, QueueEvent};
use crate::job::{BoxedProcessor, Job, JobId, JobOptions, JobRecord, ProcessorFuture};
use crate::metrics::{MetricsSnapshot, QueueMetrics};
use crate::store::{ConnectionState, JobStore};

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Per-queue configuration.
#[derive(Debug, Clone)]
pub struct QueueOptions {
  /// Applied to every job for each option the caller leaves unset.
  pub default_job_options: JobOptions,
  /// Concurrency used when a registration does not name one.
  pub concurrency: usize,
  /// Keep at most this many `completed` records; older ones are removed.
  pub keep_completed: Option<usize>,
  /// Keep at most this many terminal `failed` records.
  pub keep_failed: Option<usize>,
  /// Bound on every call made through the handle.
  pub op_timeout: Duration,
  /// Capacity of the command channel to the coordinator.
  pub command_buffer: usize,
}

impl Default for QueueOptions {
  fn default() -> Self {
    Self {
      default_job_options: JobOptions::default(),
      concurrency: 1,
      keep_completed: None,
      keep_failed: None,
      op_timeout: Duration::from_secs(5),
      command_buffer: 128,
    }
  }
}

/// Receives a description of a queue task (coordinator or worker) that died of a panic.
pub type FaultHook = Arc<dyn Fn(String) + Send + Sync>;

/// Awaits `task`; a panic is logged and handed to `fault_hook` rather than lost with
/// the task.
pub(crate) async fn report_panics<F>(task: F, what: String, fault_hook: Option<FaultHook>)
where
  F: Future<Output = ()>,
{
  if AssertUnwindSafe(task).catch_unwind().await.is_err() {
    error!(task = %what, "Queue task panicked.");
    if let Some(report) = fault_hook {
      report(format!("{what} panicked"));
    }
  }
}

/// Per-state job counts of a queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
  pub waiting: usize,
  pub active: usize,
  pub completed: usize,
  pub failed: usize,
  pub delayed: usize,
  pub paused: bool,
}

struct QueueInner {
  name: String,
  options: QueueOptions,
  cmd_tx: mpsc::Sender<QueueCommand>,
  shutdown_tx: watch::Sender<Option<ShutdownMode>>,
  connection_rx: watch::Receiver<ConnectionState>,
  events: Arc<EventBus>,
  metrics: QueueMetrics,
  coordinator: Mutex<Option<JoinHandle<()>>>,
  closed: AtomicBool,
}

/// Cheaply cloneable handle to a named queue.
///
/// Every call is bounded by the queue's `op_timeout` and fails with a typed
/// [`QueueError`] rather than hanging. `add` fails fast with
/// [`QueueError::Unavailable`] while the store connection is down.
#[derive(Clone)]
pub struct QueueHandle {
  inner: Arc<QueueInner>,
}

impl std::fmt::Debug for QueueHandle {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("QueueHandle")
      .field("name", &self.inner.name)
      .field("closed", &self.is_closed())
      .finish()
  }
}

impl QueueHandle {
  /// Opens the queue `name` on `store`, reloading whatever the store holds for it,
  /// and starts its coordinator.
  ///
  /// Observers subscribed on `events` before this call see the `stalled` events
  /// raised during recovery.
  pub async fn open(
    name: &str,
    store: Arc<dyn JobStore>,
    options: QueueOptions,
    events: Arc<EventBus>,
  ) -> Result<QueueHandle, QueueError> {
    Self::open_with_fault_hook(name, store, options, events, None).await
  }

  /// Like [`QueueHandle::open`]; a panic in the queue's coordinator or in one of its
  /// workers is reported to `fault_hook`.
  pub async fn open_with_fault_hook(
    name: &str,
    store: Arc<dyn JobStore>,
    options: QueueOptions,
    events: Arc<EventBus>,
    fault_hook: Option<FaultHook>,
  ) -> Result<QueueHandle, QueueError> {
    let loader = store.clone();
    let queue = name.to_string();
    let recovered = tokio::task::spawn_blocking(move || loader.load_queue(&queue))
      .await
      .map_err(|e| QueueError::Store(StoreError::Io(e.to_string())))?
      .map_err(|e| match e {
        StoreError::Disconnected => QueueError::Unavailable(name.to_string()),
        other => QueueError::Store(other),
      })?;

    let (cmd_tx, cmd_rx) = mpsc::channel(options.command_buffer.max(1));
    let (shutdown_tx, shutdown_rx) = watch::channel(None);
    let connection_rx = store.watch_connection();
    let metrics = QueueMetrics::new();

    let mut coordinator = Coordinator::new(CoordinatorState {
      name: name.to_string(),
      options: options.clone(),
      store,
      events: events.clone(),
      metrics: metrics.clone(),
      cmd_rx,
      shutdown_rx,
      connection_rx: connection_rx.clone(),
      recovered,
      fault_hook: fault_hook.clone(),
    });
    let what = format!("queue '{name}' coordinator");
    let handle = tokio::spawn(async move { report_panics(coordinator.run(), what, fault_hook).await });
    debug!(queue = name, "Queue opened.");

    Ok(QueueHandle {
      inner: Arc::new(QueueInner {
        name: name.to_string(),
        options,
        cmd_tx,
        shutdown_tx,
        connection_rx,
        events,
        metrics,
        coordinator: Mutex::new(Some(handle)),
        closed: AtomicBool::new(false),
      }),
    })
  }

  pub fn name(&self) -> &str {
    &self.inner.name
  }

  pub fn options(&self) -> &QueueOptions {
    &self.inner.options
  }

  pub fn is_closed(&self) -> bool {
    self.inner.closed.load(Ordering::Acquire)
  }

  /// Whether the store behind this queue is currently connected.
  pub fn is_available(&self) -> bool {
    self.inner.connection_rx.borrow().is_ready()
  }

  // --- Producing ---

  /// Enqueues a job. `options` are merged over the queue's default job options.
  pub async fn add(
    &self,
    job_type: &str,
    payload: Value,
    options: JobOptions,
  ) -> Result<JobRecord, QueueError> {
    if !self.is_available() {
      return Err(QueueError::Unavailable(self.inner.name.clone()));
    }
    let options = options.merged_over(&self.inner.options.default_job_options);
    let job_type = job_type.to_string();
    self
      .request(|responder| QueueCommand::Enqueue {
        job_type,
        payload,
        options,
        responder,
      })
      .await?
  }

  pub async fn get_job(&self, job_id: JobId) -> Result<Option<JobRecord>, QueueError> {
    self
      .request(|responder| QueueCommand::GetJob { job_id, responder })
      .await
  }

  pub async fn counts(&self) -> Result<QueueStats, QueueError> {
    self
      .request(|responder| QueueCommand::Counts { responder })
      .await
  }

  /// Stops claiming new jobs. Jobs already active run to completion.
  pub async fn pause(&self) -> Result<(), QueueError> {
    self
      .request(|responder| QueueCommand::Pause { responder })
      .await
  }

  pub async fn resume(&self) -> Result<(), QueueError> {
    self
      .request(|responder| QueueCommand::Resume { responder })
      .await
  }

  /// Removes `completed`/`failed` jobs that finished more than `older_than` ago.
  /// Returns how many were removed.
  pub async fn clean(&self, older_than: Duration) -> Result<usize, QueueError> {
    self
      .request(|responder| QueueCommand::Clean {
        older_than,
        responder,
      })
      .await?
  }

  // --- Consuming ---

  /// Registers `processor` for every job of `job_type`, with at most `concurrency`
  /// jobs of that type in flight at once.
  ///
  /// Registering a second processor for the same type fails with
  /// [`QueueError::ProcessorAlreadyRegistered`].
  pub async fn process<F, Fut>(
    &self,
    job_type: &str,
    concurrency: usize,
    processor: F,
  ) -> Result<(), QueueError>
  where
    F: Fn(Job) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, JobError>> + Send + 'static,
  {
    let boxed: BoxedProcessor = Box::new(move |job| -> ProcessorFuture { Box::pin(processor(job)) });
    self
      .process_boxed(job_type, concurrency, Arc::new(boxed))
      .await
  }

  pub(crate) async fn process_boxed(
    &self,
    job_type: &str,
    concurrency: usize,
    processor: Arc<BoxedProcessor>,
  ) -> Result<(), QueueError> {
    if concurrency == 0 {
      return Err(QueueError::ZeroConcurrency(job_type.to_string()));
    }
    let job_type = job_type.to_string();
    self
      .request(|responder| QueueCommand::RegisterProcessor {
        job_type,
        concurrency,
        processor,
        responder,
      })
      .await?
  }

  // --- Observing ---

  /// Registers a synchronous observer for this queue's events.
  pub fn on<F>(&self, observer: F) -> ObserverHandle
  where
    F: Fn(&QueueEvent) + Send + Sync + 'static,
  {
    self.inner.events.subscribe(observer)
  }

  pub fn events(&self) -> &Arc<EventBus> {
    &self.inner.events
  }

  pub fn metrics(&self) -> MetricsSnapshot {
    self.inner.metrics.snapshot()
  }

  // --- Lifecycle ---

  /// Stops the queue: no more claims, then waits for active jobs to finish.
  ///
  /// With a `timeout`, jobs still active when it elapses are abandoned (they are
  /// recovered as stalled on the next open). Closing twice is a no-op.
  pub async fn close(&self, timeout: Option<Duration>) -> Result<(), QueueError> {
    if self.inner.closed.swap(true, Ordering::AcqRel) {
      debug!(queue = %self.inner.name, "Queue already closed.");
      return Ok(());
    }
    info!(queue = %self.inner.name, "Closing queue.");
    let _ = self.inner.shutdown_tx.send(Some(ShutdownMode::Graceful));

    let handle = self.inner.coordinator.lock().take();
    let Some(mut handle) = handle else {
      return Ok(());
    };

    match timeout {
      Some(limit) => match tokio::time::timeout(limit, &mut handle).await {
        Ok(joined) => Self::log_join(&self.inner.name, joined),
        Err(_) => {
          warn!(
            queue = %self.inner.name,
            timeout_ms = limit.as_millis() as u64,
            "Graceful close timed out. Forcing."
          );
          let _ = self.inner.shutdown_tx.send(Some(ShutdownMode::Force));
          match tokio::time::timeout(Duration::from_millis(500), &mut handle).await {
            Ok(joined) => Self::log_join(&self.inner.name, joined),
            Err(_) => handle.abort(),
          }
        }
      },
      None => Self::log_join(&self.inner.name, handle.await),
    }
    Ok(())
  }

  /// Stops the queue at once, abandoning active jobs.
  pub async fn close_now(&self) -> Result<(), QueueError> {
    if self.inner.closed.swap(true, Ordering::AcqRel) {
      return Ok(());
    }
    info!(queue = %self.inner.name, "Force-closing queue.");
    let _ = self.inner.shutdown_tx.send(Some(ShutdownMode::Force));
    let handle = self.inner.coordinator.lock().take();
    if let Some(handle) = handle {
      Self::log_join(&self.inner.name, handle.await);
    }
    Ok(())
  }

  fn log_join(queue: &str, joined: Result<(), tokio::task::JoinError>) {
    if let Err(e) = joined {
      if e.is_panic() {
        tracing::error!(queue, "Queue coordinator panicked: {:?}", e);
      }
    }
  }

  /// Sends a command and waits for its response, bounded by `op_timeout`.
  async fn request<T>(
    &self,
    make: impl FnOnce(oneshot::Sender<T>) -> QueueCommand,
  ) -> Result<T, QueueError> {
    if self.is_closed() {
      return Err(QueueError::Closed(self.inner.name.clone()));
    }
    let (responder, response) = oneshot::channel();
    let command = make(responder);
    let name = &self.inner.name;
    let exchange = async {
      self
        .inner
        .cmd_tx
        .send(command)
        .await
        .map_err(|_| QueueError::Closed(name.clone()))?;
      response.await.map_err(|_| QueueError::Closed(name.clone()))
    };
    let limit = self.inner.options.op_timeout;
    tokio::time::timeout(limit, exchange)
      .await
      .map_err(|_| QueueError::Timeout {
        queue: name.clone(),
        timeout_ms: limit.as_millis() as u64,
      })?
  }
}
