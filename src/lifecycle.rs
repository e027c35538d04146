//! The worker process controller.
//!
//! Owns the queue backend, the outbound channel and the chat client, starts them in
//! dependency order, runs the periodic maintenance tasks, and tears everything down
//! again, either gracefully or under an emergency deadline.

use crate::backend::QueueBackend;
use crate::channel::{OutboundChannel, WorkerRegistration};
use crate::chat::{ChatClient, ChatEvent};
use crate::config::WorkerConfig;
use crate::diagnostics::memory_stats;
use crate::dispatch::{JobDispatcher, JobType};
use crate::error::LifecycleError;
use crate::health::HealthReporter;
use crate::job::JobOptions;
use crate::processors::{self, ProcessorDeps};
use crate::server::{ControlServer, ControlState};
use crate::store::JobStore;

use std::fmt;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::json;
use tokio::sync::{mpsc, watch};
use tokio::task::{AbortHandle, JoinHandle};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

const WORKER_KIND: &str = "chat-bridge";
const TASK_STOP_TIMEOUT: Duration = Duration::from_secs(2);
const QUEUE_CLOSE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum WorkerState {
  Created,
  Initializing,
  Running,
  ShuttingDown,
  Stopped,
  EmergencyShutdown,
}

impl WorkerState {
  pub fn as_str(&self) -> &'static str {
    match self {
      WorkerState::Created => "created",
      WorkerState::Initializing => "initializing",
      WorkerState::Running => "running",
      WorkerState::ShuttingDown => "shutting_down",
      WorkerState::Stopped => "stopped",
      WorkerState::EmergencyShutdown => "emergency_shutdown",
    }
  }
}

impl fmt::Display for WorkerState {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// How an emergency shutdown ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmergencyOutcome {
  /// Teardown finished inside the deadline.
  Completed,
  /// The deadline hit first; the rest of the teardown was abandoned.
  TimedOut,
}

/// Why [`WorkerController::run`] returned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
  /// SIGINT/SIGTERM, followed by a graceful shutdown.
  Signal,
  Emergency { reason: String, outcome: EmergencyOutcome },
}

struct SupervisedTask {
  name: &'static str,
  task: AbortHandle,
  watcher: JoinHandle<()>,
}

pub struct WorkerController {
  config: WorkerConfig,
  backend: Arc<QueueBackend>,
  dispatcher: JobDispatcher,
  channel: OutboundChannel,
  chat: Arc<dyn ChatClient>,
  health: HealthReporter,
  store_override: Option<Arc<dyn JobStore>>,
  state_tx: watch::Sender<WorkerState>,
  stop_tx: watch::Sender<bool>,
  stopped_tx: watch::Sender<bool>,
  shutdown_started: AtomicBool,
  emergency_tx: mpsc::UnboundedSender<String>,
  emergency_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<String>>,
  tasks: Mutex<Vec<SupervisedTask>>,
  control_addr: Mutex<Option<SocketAddr>>,
}

impl WorkerController {
  pub fn new(config: WorkerConfig, chat: Arc<dyn ChatClient>) -> Result<Self, LifecycleError> {
    let channel = OutboundChannel::new(config.channel.clone()).map_err(|e| LifecycleError::FatalStartup {
      step: "outbound channel",
      reason: e.to_string(),
    })?;
    let backend = Arc::new(
      QueueBackend::new(config.queue.clone()).with_connect_timeout(config.store_connect_timeout),
    );
    let dispatcher = JobDispatcher::new(backend.clone());
    let health = HealthReporter::new(config.worker_name.clone(), dispatcher.clone(), chat.clone());
    let (state_tx, _) = watch::channel(WorkerState::Created);
    let (stop_tx, _) = watch::channel(false);
    let (stopped_tx, _) = watch::channel(false);
    let (emergency_tx, emergency_rx) = mpsc::unbounded_channel();
    backend.report_faults_to(emergency_tx.clone());

    Ok(Self {
      config,
      backend,
      dispatcher,
      channel,
      chat,
      health,
      store_override: None,
      state_tx,
      stop_tx,
      stopped_tx,
      shutdown_started: AtomicBool::new(false),
      emergency_tx,
      emergency_rx: tokio::sync::Mutex::new(emergency_rx),
      tasks: Mutex::new(Vec::new()),
      control_addr: Mutex::new(None),
    })
  }

  /// Uses `store` instead of building one from the configuration.
  pub fn with_store(mut self, store: Arc<dyn JobStore>) -> Self {
    self.store_override = Some(store);
    self
  }

  // --- Accessors ---

  pub fn state(&self) -> WorkerState {
    *self.state_tx.borrow()
  }

  pub fn watch_state(&self) -> watch::Receiver<WorkerState> {
    self.state_tx.subscribe()
  }

  pub fn config(&self) -> &WorkerConfig {
    &self.config
  }

  pub fn dispatcher(&self) -> &JobDispatcher {
    &self.dispatcher
  }

  pub fn backend(&self) -> &Arc<QueueBackend> {
    &self.backend
  }

  pub fn channel(&self) -> &OutboundChannel {
    &self.channel
  }

  pub fn health(&self) -> &HealthReporter {
    &self.health
  }

  /// Address the control server is bound to, once started.
  pub fn control_addr(&self) -> Option<SocketAddr> {
    *self.control_addr.lock()
  }

  fn set_state(&self, state: WorkerState) {
    let previous = self.state_tx.send_replace(state);
    if previous != state {
      info!(from = %previous, to = %state, "Worker state changed.");
    }
  }

  // --- Startup ---

  /// Starts every subsystem in dependency order.
  ///
  /// A fatal step failure stops the sequence, tears down whatever was started and
  /// returns [`LifecycleError::FatalStartup`].
  pub async fn initialize(&self) -> Result<(), LifecycleError> {
    let current = self.state();
    if current != WorkerState::Created {
      return Err(LifecycleError::InvalidState {
        action: "initialize",
        state: current.to_string(),
      });
    }
    self.set_state(WorkerState::Initializing);
    info!(worker = %self.config.worker_name, "Initializing worker.");

    if let Err(e) = self.start_subsystems().await {
      error!(error = %e, "Worker startup failed. Shutting down.");
      self.shutdown().await;
      return Err(e);
    }

    self.set_state(WorkerState::Running);
    self.register_with_primary().await;
    self.start_background_tasks();
    info!(worker = %self.config.worker_name, "Worker running.");
    Ok(())
  }

  async fn start_subsystems(&self) -> Result<(), LifecycleError> {
    // 1. Outbound channel probe. Advisory.
    if !self.channel.test_connection().await {
      warn!(url = self.channel.base_url(), "Primary service unreachable. Continuing degraded.");
    }

    // 2. Queue backend.
    let ready = match &self.store_override {
      Some(store) => self.backend.initialize_with(store.clone()).await,
      None => self.backend.initialize(&self.config.store).await,
    };
    if !ready {
      return Err(fatal("queue backend", "store connection could not be established"));
    }

    // 3. Control server.
    let state = ControlState {
      dispatcher: self.dispatcher.clone(),
      health: self.health.clone(),
      worker_state: self.state_tx.subscribe(),
    };
    let server = ControlServer::bind(self.config.control_addr, state)
      .await
      .map_err(|e| fatal("control server", e))?;
    *self.control_addr.lock() = Some(server.local_addr());
    let stop_rx = self.stop_tx.subscribe();
    let emergency_tx = self.emergency_tx.clone();
    self.spawn_supervised("control-server", async move {
      if let Err(e) = server.serve(stop_rx).await {
        error!(error = %e, "Control server failed.");
        let _ = emergency_tx.send(format!("control server failed: {e}"));
      }
    });

    // 4. Chat client.
    self.chat.start().await.map_err(|e| fatal("chat client", e))?;

    // 5. Processors.
    let deps = Arc::new(ProcessorDeps {
      channel: self.channel.clone(),
      chat: self.chat.clone(),
      dispatcher: self.dispatcher.clone(),
      cleanup_retention: self.config.cleanup_retention,
    });
    processors::register_all(&self.dispatcher, deps, None)
      .await
      .map_err(|e| fatal("processors", e))?;
    Ok(())
  }

  async fn register_with_primary(&self) {
    let registration = WorkerRegistration {
      name: self.config.worker_name.clone(),
      version: env!("CARGO_PKG_VERSION").to_string(),
      kind: WORKER_KIND.to_string(),
      capabilities: JobType::ALL.iter().map(|t| t.as_str().to_string()).collect(),
      pid: std::process::id(),
      start_time: self.health.started_at(),
    };
    if let Err(e) = self.channel.register_worker(&registration).await {
      warn!(error = %e, "Worker registration with primary service failed.");
    }
  }

  fn start_background_tasks(&self) {
    if let Some(events) = self.chat.take_events() {
      let dispatcher = self.dispatcher.clone();
      let stop_rx = self.stop_tx.subscribe();
      self.spawn_supervised("inbound-pump", pump_inbound(events, dispatcher, stop_rx));
    } else {
      warn!("Chat event stream already taken. Inbound pump not started.");
    }

    let health = self.health.clone();
    let channel = self.channel.clone();
    let state_rx = self.state_tx.subscribe();
    self.spawn_periodic("heartbeat", self.config.heartbeat_interval, move || {
      let (health, channel, state) = (health.clone(), channel.clone(), *state_rx.borrow());
      async move {
        let snapshot = health.snapshot(state).await;
        if let Err(e) = channel.send_status(state.as_str(), &snapshot).await {
          debug!(error = %e, "Heartbeat push failed.");
        }
      }
    });

    let dispatcher = self.dispatcher.clone();
    let retention = self.config.cleanup_retention;
    self.spawn_periodic("maintenance", self.config.cleanup_interval, move || {
      let dispatcher = dispatcher.clone();
      async move {
        let removed = dispatcher.clean_all(retention).await;
        info!(removed, retention_secs = retention.as_secs(), "Queue maintenance finished.");
      }
    });

    let warn_mb = self.config.memory_warn_mb;
    self.spawn_periodic("memory-watch", self.config.memory_check_interval, move || async move {
      let stats = memory_stats();
      match stats.rss_mb() {
        Some(rss_mb) if rss_mb > warn_mb => {
          warn!(rss_mb, threshold_mb = warn_mb, "Memory usage above threshold.")
        }
        Some(rss_mb) => debug!(rss_mb, "Memory usage sampled."),
        None => debug!("Memory statistics unavailable on this platform."),
      }
    });
  }

  // --- Supervision ---

  /// Spawns `task` and watches it: a panic raises an emergency.
  fn spawn_supervised<F>(&self, name: &'static str, task: F)
  where
    F: Future<Output = ()> + Send + 'static,
  {
    let handle = tokio::spawn(task);
    let abort = handle.abort_handle();
    let emergency_tx = self.emergency_tx.clone();
    let watcher = tokio::spawn(async move {
      match handle.await {
        Ok(()) => debug!(task = name, "Supervised task finished."),
        Err(e) if e.is_panic() => {
          error!(task = name, "Supervised task panicked.");
          let _ = emergency_tx.send(format!("task '{name}' panicked"));
        }
        Err(_) => debug!(task = name, "Supervised task cancelled."),
      }
    });
    self.tasks.lock().push(SupervisedTask {
      name,
      task: abort,
      watcher,
    });
  }

  /// Runs `tick` every `period` (first run after one period) until shutdown.
  fn spawn_periodic<F, Fut>(&self, name: &'static str, period: Duration, mut tick: F)
  where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
  {
    if period.is_zero() {
      warn!(task = name, "Periodic task disabled: zero interval.");
      return;
    }
    let mut stop_rx = self.stop_tx.subscribe();
    self.spawn_supervised(name, async move {
      let mut ticker = interval_at(Instant::now() + period, period);
      ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
      loop {
        tokio::select! {
          biased;
          _ = stopped(&mut stop_rx) => break,
          _ = ticker.tick() => tick().await,
        }
      }
      debug!(task = name, "Periodic task stopped.");
    });
  }

  /// Raises an emergency from outside the controller.
  pub fn trigger_emergency(&self, reason: impl Into<String>) {
    let _ = self.emergency_tx.send(reason.into());
  }

  /// Resolves with the reason of the first emergency raised.
  pub async fn wait_for_emergency(&self) -> String {
    let mut rx = self.emergency_rx.lock().await;
    match rx.recv().await {
      Some(reason) => reason,
      None => std::future::pending().await,
    }
  }

  /// Waits for SIGINT/SIGTERM or an emergency, and shuts down accordingly.
  pub async fn run(&self) -> RunOutcome {
    tokio::select! {
      _ = wait_for_shutdown_signal() => {
        info!("Shutdown signal received.");
        self.shutdown().await;
        RunOutcome::Signal
      }
      reason = self.wait_for_emergency() => {
        let outcome = self.emergency_shutdown(&reason).await;
        RunOutcome::Emergency { reason, outcome }
      }
    }
  }

  // --- Shutdown ---

  /// Graceful shutdown. Safe to call any number of times; later calls wait for
  /// the first to finish.
  pub async fn shutdown(&self) {
    self.teardown(None).await;
  }

  /// Runs the shutdown sequence under `emergency_timeout`.
  pub async fn emergency_shutdown(&self, reason: &str) -> EmergencyOutcome {
    error!(reason, timeout_ms = self.config.emergency_timeout.as_millis() as u64, "Emergency shutdown.");
    match tokio::time::timeout(self.config.emergency_timeout, self.teardown(Some(reason))).await {
      Ok(()) => EmergencyOutcome::Completed,
      Err(_) => {
        error!("Emergency shutdown deadline exceeded. Abandoning teardown.");
        self.stop_tx.send_replace(true);
        for task in self.tasks.lock().drain(..) {
          task.task.abort();
          task.watcher.abort();
        }
        self.stopped_tx.send_replace(true);
        EmergencyOutcome::TimedOut
      }
    }
  }

  async fn teardown(&self, emergency: Option<&str>) {
    if self.shutdown_started.swap(true, Ordering::AcqRel) {
      debug!("Shutdown already in progress. Waiting for it.");
      let mut stopped_rx = self.stopped_tx.subscribe();
      let _ = stopped_rx.wait_for(|done| *done).await;
      return;
    }

    let was = self.state();
    match emergency {
      Some(_) => self.set_state(WorkerState::EmergencyShutdown),
      None => self.set_state(WorkerState::ShuttingDown),
    }

    if was == WorkerState::Running {
      let status = if emergency.is_some() { "emergency" } else { "shutting_down" };
      let details = json!({ "worker": self.config.worker_name, "reason": emergency });
      if let Err(e) = self.channel.send_status(status, &details).await {
        warn!(error = %e, "Could not notify primary service of shutdown.");
      }
    }

    self.stop_tx.send_replace(true);
    self.stop_tasks().await;

    if was != WorkerState::Created {
      self.chat.stop().await;
    }
    self.backend.shutdown(Some(QUEUE_CLOSE_TIMEOUT)).await;

    if emergency.is_none() {
      self.set_state(WorkerState::Stopped);
    }
    self.stopped_tx.send_replace(true);
    info!("Worker shut down.");
  }

  async fn stop_tasks(&self) {
    let tasks: Vec<SupervisedTask> = self.tasks.lock().drain(..).collect();
    for SupervisedTask { name, task, watcher } in tasks {
      if tokio::time::timeout(TASK_STOP_TIMEOUT, watcher).await.is_err() {
        warn!(task = name, "Task did not stop in time. Aborting.");
        task.abort();
      }
    }
  }
}

/// Resolves once the stop flag is set (or its sender is gone).
async fn stopped(stop_rx: &mut watch::Receiver<bool>) {
  let _ = stop_rx.wait_for(|stop| *stop).await;
}

async fn pump_inbound(
  mut events: mpsc::Receiver<ChatEvent>,
  dispatcher: JobDispatcher,
  mut stop_rx: watch::Receiver<bool>,
) {
  loop {
    let event = tokio::select! {
      biased;
      _ = stopped(&mut stop_rx) => break,
      event = events.recv() => match event {
        Some(event) => event,
        None => break,
      },
    };
    let message_id = event.message_id().to_string();
    let payload = match serde_json::to_value(&event) {
      Ok(payload) => payload,
      Err(e) => {
        warn!(%message_id, error = %e, "Could not encode chat event.");
        continue;
      }
    };
    let queued = match event {
      ChatEvent::Message { .. } => dispatcher.add_message_relay(payload, JobOptions::new()).await,
      ChatEvent::Media { .. } => dispatcher.add_media_relay(payload, JobOptions::new()).await,
    };
    match queued {
      Ok(job_id) => debug!(%message_id, %job_id, "Chat event queued."),
      Err(e) => warn!(%message_id, error = %e, "Dropped chat event: could not queue it."),
    }
  }
  debug!("Inbound pump stopped.");
}

fn fatal(step: &'static str, reason: impl fmt::Display) -> LifecycleError {
  LifecycleError::FatalStartup {
    step,
    reason: reason.to_string(),
  }
}

/// Resolves on SIGINT or SIGTERM (Ctrl-C elsewhere).
pub async fn wait_for_shutdown_signal() {
  #[cfg(unix)]
  {
    use tokio::signal::unix::{signal, SignalKind};

    let sigint = signal(SignalKind::interrupt());
    let sigterm = signal(SignalKind::terminate());
    match (sigint, sigterm) {
      (Ok(mut sigint), Ok(mut sigterm)) => {
        tokio::select! {
          _ = sigint.recv() => {}
          _ = sigterm.recv() => {}
        }
      }
      _ => {
        let _ = tokio::signal::ctrl_c().await;
      }
    }
  }
  #[cfg(not(unix))]
  {
    let _ = tokio::signal::ctrl_c().await;
  }
}
