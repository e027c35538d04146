use crate::error::BackendError;
use crate::events::{log_event, EventBus, ObserverHandle};
use crate::queue::{FaultHook, QueueHandle, QueueOptions};
use crate::store::{ConnectionState, JobStore, StoreConfig};

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use parking_lot::RwLock;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

struct QueueEntry {
  handle: QueueHandle,
  log_observer: ObserverHandle,
}

/// Owns the store connection and the registry of queues opened on it.
///
/// Queues are memoized by name: the first [`QueueBackend::get_queue`] for a name
/// opens it (wiring the logging observer), later calls return the same queue.
/// Two backends never share queues, even on the same store.
///
/// A queue whose coordinator or worker panics marks the backend unhealthy for good,
/// and the fault is forwarded to the channel given to
/// [`QueueBackend::report_faults_to`], if any.
pub struct QueueBackend {
  queue_options: QueueOptions,
  connect_timeout: Duration,
  store: RwLock<Option<Arc<dyn JobStore>>>,
  queues: Mutex<HashMap<String, QueueEntry>>,
  healthy: Arc<AtomicBool>,
  faulted: Arc<AtomicBool>,
  fault_tx: Arc<parking_lot::Mutex<Option<mpsc::UnboundedSender<String>>>>,
  shut_down: AtomicBool,
  watcher: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for QueueBackend {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("QueueBackend")
      .field("healthy", &self.is_healthy())
      .field("faulted", &self.is_faulted())
      .field("shut_down", &self.shut_down.load(Ordering::Relaxed))
      .finish()
  }
}

impl QueueBackend {
  /// `queue_options` apply to every queue this backend opens.
  pub fn new(queue_options: QueueOptions) -> Self {
    Self {
      queue_options,
      connect_timeout: DEFAULT_CONNECT_TIMEOUT,
      store: RwLock::new(None),
      queues: Mutex::new(HashMap::new()),
      healthy: Arc::new(AtomicBool::new(false)),
      faulted: Arc::new(AtomicBool::new(false)),
      fault_tx: Arc::new(parking_lot::Mutex::new(None)),
      shut_down: AtomicBool::new(false),
      watcher: parking_lot::Mutex::new(None),
    }
  }

  pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
    self.connect_timeout = timeout;
    self
  }

  /// Sends the description of every queue task panic to `tx`.
  pub fn report_faults_to(&self, tx: mpsc::UnboundedSender<String>) {
    *self.fault_tx.lock() = Some(tx);
  }

  /// Whether a queue task has died of a panic.
  pub fn is_faulted(&self) -> bool {
    self.faulted.load(Ordering::Acquire)
  }

  fn fault_hook(&self) -> FaultHook {
    let faulted = self.faulted.clone();
    let fault_tx = self.fault_tx.clone();
    Arc::new(move |reason: String| {
      faulted.store(true, Ordering::Release);
      error!(%reason, "Queue backend faulted.");
      if let Some(tx) = fault_tx.lock().as_ref() {
        let _ = tx.send(reason);
      }
    })
  }

  /// Builds the store described by `config` and connects to it.
  /// Returns `false` (and logs why) if the store cannot be reached.
  pub async fn initialize(&self, config: &StoreConfig) -> bool {
    self.initialize_with(config.build()).await
  }

  /// Connects to an already built store. See [`QueueBackend::initialize`].
  pub async fn initialize_with(&self, store: Arc<dyn JobStore>) -> bool {
    match self.connect(store).await {
      Ok(()) => true,
      Err(e) => {
        error!(error = %e, "Queue backend initialization failed.");
        false
      }
    }
  }

  async fn connect(&self, store: Arc<dyn JobStore>) -> Result<(), BackendError> {
    if self.shut_down.load(Ordering::Acquire) {
      return Err(BackendError::ShutDown);
    }
    if self.store.read().is_some() {
      debug!("Queue backend already initialized.");
      return Ok(());
    }

    info!(store = store.name(), "Connecting queue backend.");
    let connector = store.clone();
    let limit = self.connect_timeout;
    match tokio::time::timeout(limit, tokio::task::spawn_blocking(move || connector.connect())).await {
      Err(_) => return Err(BackendError::ConnectTimeout(limit.as_millis() as u64)),
      Ok(Err(join_error)) => {
        return Err(BackendError::Store(crate::error::StoreError::Io(
          join_error.to_string(),
        )))
      }
      Ok(Ok(result)) => result?,
    }

    let mut connection_rx = store.watch_connection();
    self
      .healthy
      .store(connection_rx.borrow_and_update().is_ready(), Ordering::Release);
    let healthy = self.healthy.clone();
    let watcher = tokio::spawn(async move {
      while connection_rx.changed().await.is_ok() {
        let state = *connection_rx.borrow_and_update();
        let ready = state.is_ready();
        let was_ready = healthy.swap(ready, Ordering::AcqRel);
        match (was_ready, ready) {
          (false, true) => info!("Queue backend connection ready."),
          (true, false) if state == ConnectionState::Closed => {
            debug!("Queue backend connection closed.")
          }
          (true, false) => warn!(?state, "Queue backend connection lost."),
          _ => {}
        }
      }
    });

    *self.store.write() = Some(store);
    *self.watcher.lock() = Some(watcher);
    info!("Queue backend ready.");
    Ok(())
  }

  /// Live connection state, updated from the store's connection events. `false`
  /// once shut down or faulted.
  pub fn is_healthy(&self) -> bool {
    self.healthy.load(Ordering::Acquire) && !self.shut_down.load(Ordering::Acquire) && !self.is_faulted()
  }

  pub fn store(&self) -> Option<Arc<dyn JobStore>> {
    self.store.read().clone()
  }

  /// Returns the queue named `name`, opening it on first use.
  pub async fn get_queue(&self, name: &str) -> Result<QueueHandle, BackendError> {
    if self.shut_down.load(Ordering::Acquire) {
      return Err(BackendError::ShutDown);
    }
    let store = self.store().ok_or(BackendError::NotInitialized)?;

    let mut queues = self.queues.lock().await;
    if let Some(entry) = queues.get(name) {
      return Ok(entry.handle.clone());
    }

    let events = Arc::new(EventBus::new());
    let log_observer = events.subscribe(log_event);
    let handle =
      QueueHandle::open_with_fault_hook(name, store, self.queue_options.clone(), events, Some(self.fault_hook()))
        .await?;
    info!(queue = name, "Queue created.");
    queues.insert(
      name.to_string(),
      QueueEntry {
        handle: handle.clone(),
        log_observer,
      },
    );
    Ok(handle)
  }

  /// The queue named `name`, if it has been created.
  pub async fn existing_queue(&self, name: &str) -> Option<QueueHandle> {
    self.queues.lock().await.get(name).map(|entry| entry.handle.clone())
  }

  /// Every created queue, sorted by name.
  pub async fn queues(&self) -> Vec<QueueHandle> {
    let mut handles: Vec<QueueHandle> = self
      .queues
      .lock()
      .await
      .values()
      .map(|entry| entry.handle.clone())
      .collect();
    handles.sort_by(|a, b| a.name().cmp(b.name()));
    handles
  }

  pub async fn queue_names(&self) -> Vec<String> {
    self
      .queues()
      .await
      .iter()
      .map(|queue| queue.name().to_string())
      .collect()
  }

  /// Closes every queue concurrently, then the store. Failures are logged, never
  /// returned. Calling it again is a no-op.
  pub async fn shutdown(&self, queue_timeout: Option<Duration>) {
    if self.shut_down.swap(true, Ordering::AcqRel) {
      debug!("Queue backend already shut down.");
      return;
    }
    info!("Shutting down queue backend...");

    let entries: Vec<(String, QueueEntry)> = self.queues.lock().await.drain().collect();
    let closes = entries.iter().map(|(name, entry)| async move {
      (name.as_str(), entry.handle.close(queue_timeout).await)
    });
    for (name, result) in join_all(closes).await {
      match result {
        Ok(()) => debug!(queue = name, "Queue closed."),
        Err(e) => warn!(queue = name, error = %e, "Failed to close queue cleanly."),
      }
    }
    for (_, entry) in entries {
      entry.log_observer.cancel();
    }

    let store = self.store.write().take();
    if let Some(store) = store {
      match tokio::task::spawn_blocking(move || store.close()).await {
        Ok(Ok(())) => debug!("Store closed."),
        Ok(Err(e)) => warn!(error = %e, "Failed to close store cleanly."),
        Err(e) => warn!(error = %e, "Store close task failed."),
      }
    }

    let watcher = self.watcher.lock().take();
    if let Some(watcher) = watcher {
      watcher.abort();
    }
    self.healthy.store(false, Ordering::Release);
    info!("Queue backend shut down.");
  }
}
