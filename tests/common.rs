//! tests/common.rs
//! Shared helper functions for integration tests.
#![allow(dead_code)]

use async_trait::async_trait;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, Method, StatusCode, Uri};
use axum::Json;
use jobbridge::chat::{ChatEvent, ChatTransport};
use jobbridge::job::ProcessorFuture;
use jobbridge::{
  ChatError, ConnectionState, Job, JobError, JobId, JobRecord, JobStore, MemoryStore, QueueBackend, QueueEvent,
  QueueEventKind, QueueHandle, QueueOptions, StoreError,
};
use serde_json::{json, Value};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU16, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration as StdDuration, Instant};
use tokio::sync::mpsc;
use tracing_subscriber::fmt::TestWriter;

// Initializes tracing subscriber for test output.
pub fn setup_tracing() {
  // Use try_init to avoid panic if called multiple times
  let _ = tracing_subscriber::fmt()
    .with_max_level(tracing::Level::DEBUG)
    .with_writer(TestWriter::new())
    .with_test_writer()
    .try_init();
}

// Queue options with short bounds, so a broken test fails fast.
pub fn test_queue_options() -> QueueOptions {
  QueueOptions {
    op_timeout: StdDuration::from_secs(2),
    ..QueueOptions::default()
  }
}

// Builds a backend on a fresh memory store, already connected.
pub async fn memory_backend(options: QueueOptions) -> (Arc<QueueBackend>, Arc<MemoryStore>) {
  let store = Arc::new(MemoryStore::new());
  let backend = Arc::new(QueueBackend::new(options));
  let store_dyn: Arc<dyn JobStore> = store.clone();
  assert!(backend.initialize_with(store_dyn).await, "memory store should connect");
  (backend, store)
}

/// Job type whose write makes [`FaultyStore`] panic.
pub const EXPLODING_JOB_TYPE: &str = "explode";

// A memory store that panics when asked to persist a job of EXPLODING_JOB_TYPE.
pub struct FaultyStore {
  inner: MemoryStore,
}

impl FaultyStore {
  pub fn new() -> Self {
    Self {
      inner: MemoryStore::new(),
    }
  }
}

impl JobStore for FaultyStore {
  fn name(&self) -> &'static str {
    "faulty"
  }

  fn connect(&self) -> Result<(), StoreError> {
    self.inner.connect()
  }

  fn close(&self) -> Result<(), StoreError> {
    self.inner.close()
  }

  fn watch_connection(&self) -> tokio::sync::watch::Receiver<ConnectionState> {
    self.inner.watch_connection()
  }

  fn put(&self, record: &JobRecord) -> Result<(), StoreError> {
    if record.job_type == EXPLODING_JOB_TYPE {
      panic!("store refused job {}", record.id);
    }
    self.inner.put(record)
  }

  fn get(&self, queue: &str, job_id: JobId) -> Result<Option<JobRecord>, StoreError> {
    self.inner.get(queue, job_id)
  }

  fn remove(&self, queue: &str, job_id: JobId) -> Result<(), StoreError> {
    self.inner.remove(queue, job_id)
  }

  fn load_queue(&self, queue: &str) -> Result<Vec<JobRecord>, StoreError> {
    self.inner.load_queue(queue)
  }
}

// Polls `check` every 10ms until it returns true or `limit` elapses.
pub async fn wait_until<F, Fut>(limit: StdDuration, mut check: F) -> bool
where
  F: FnMut() -> Fut,
  Fut: Future<Output = bool>,
{
  let deadline = Instant::now() + limit;
  loop {
    if check().await {
      return true;
    }
    if Instant::now() >= deadline {
      return false;
    }
    tokio::time::sleep(StdDuration::from_millis(10)).await;
  }
}

// Waits until `queue` reports at least `completed` completed and `failed` failed jobs.
pub async fn wait_for_finished(queue: &QueueHandle, completed: usize, failed: usize) -> bool {
  wait_until(StdDuration::from_secs(5), || async {
    match queue.counts().await {
      Ok(stats) => stats.completed >= completed && stats.failed >= failed,
      Err(_) => false,
    }
  })
  .await
}

// A processor that increments a counter, optionally sleeps, and succeeds or fails.
pub fn counting_processor(
  counter: Arc<AtomicUsize>,
  delay: StdDuration,
  succeeds: bool,
) -> impl Fn(Job) -> ProcessorFuture + Send + Sync + 'static {
  move |job: Job| -> ProcessorFuture {
    let ctr = counter.clone();
    Box::pin(async move {
      let count = ctr.fetch_add(1, Ordering::SeqCst) + 1;
      tracing::debug!(job_id = %job.id, count, succeeds, "Counting processor executing");
      if delay > StdDuration::ZERO {
        tokio::time::sleep(delay).await;
      }
      if succeeds {
        Ok(json!({ "count": count }))
      } else {
        Err(JobError::new(format!("forced failure #{count}")))
      }
    })
  }
}

// A processor tracking how many of its jobs run at once.
pub fn concurrency_tracker(
  active: Arc<AtomicUsize>,
  max_observed: Arc<AtomicUsize>,
  delay: StdDuration,
) -> impl Fn(Job) -> ProcessorFuture + Send + Sync + 'static {
  move |_job: Job| -> ProcessorFuture {
    let active = active.clone();
    let max_observed = max_observed.clone();
    Box::pin(async move {
      let now_active = active.fetch_add(1, Ordering::SeqCst) + 1;
      max_observed.fetch_max(now_active, Ordering::SeqCst);
      tokio::time::sleep(delay).await;
      active.fetch_sub(1, Ordering::SeqCst);
      Ok(Value::Null)
    })
  }
}

// Collects every event of a queue, in emission order.
pub fn record_events(queue: &QueueHandle) -> Arc<parking_lot::Mutex<Vec<QueueEvent>>> {
  let events = Arc::new(parking_lot::Mutex::new(Vec::new()));
  let sink = events.clone();
  // The handle is dropped on purpose: the observer stays registered.
  let _handle = queue.on(move |event| sink.lock().push(event.clone()));
  events
}

pub fn kinds_for(events: &[QueueEvent], job_id: jobbridge::JobId) -> Vec<QueueEventKind> {
  events
    .iter()
    .filter(|event| event.job_id == Some(job_id))
    .map(|event| event.kind)
    .collect()
}

// --- Scripted chat transport ---

/// Chat transport driven by the test: connect failures are scripted up front,
/// inbound events (or link drops) are pushed through `inject`.
pub struct ScriptedTransport {
  failing_connects: AtomicU32,
  pub connects: AtomicU32,
  pub disconnects: AtomicU32,
  inbound: tokio::sync::Mutex<mpsc::UnboundedReceiver<Result<ChatEvent, ChatError>>>,
  media: Vec<u8>,
}

impl ScriptedTransport {
  pub fn new(failing_connects: u32) -> (Self, mpsc::UnboundedSender<Result<ChatEvent, ChatError>>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
      Self {
        failing_connects: AtomicU32::new(failing_connects),
        connects: AtomicU32::new(0),
        disconnects: AtomicU32::new(0),
        inbound: tokio::sync::Mutex::new(rx),
        media: b"fake-image-bytes".to_vec(),
      },
      tx,
    )
  }

  /// Fails the next `count` connect attempts.
  pub fn fail_next_connects(&self, count: u32) {
    self.failing_connects.store(count, Ordering::SeqCst);
  }
}

#[async_trait]
impl ChatTransport for ScriptedTransport {
  async fn connect(&self) -> Result<(), ChatError> {
    self.connects.fetch_add(1, Ordering::SeqCst);
    let remaining = self.failing_connects.load(Ordering::SeqCst);
    if remaining > 0 {
      self.failing_connects.store(remaining - 1, Ordering::SeqCst);
      return Err(ChatError::Connect("scripted failure".to_string()));
    }
    Ok(())
  }

  async fn disconnect(&self) -> Result<(), ChatError> {
    self.disconnects.fetch_add(1, Ordering::SeqCst);
    Ok(())
  }

  async fn next_event(&self) -> Result<ChatEvent, ChatError> {
    let mut inbound = self.inbound.lock().await;
    match inbound.recv().await {
      Some(next) => next,
      None => std::future::pending().await,
    }
  }

  async fn send_message(&self, _chat_id: &str, text: &str) -> Result<String, ChatError> {
    Ok(format!("sent:{text}"))
  }

  async fn download_media(&self, _media_id: &str) -> Result<Vec<u8>, ChatError> {
    Ok(self.media.clone())
  }
}

pub fn text_event(message_id: &str, text: &str) -> ChatEvent {
  ChatEvent::Message {
    chat_id: "chat-1".to_string(),
    message_id: message_id.to_string(),
    sender: "alice".to_string(),
    text: text.to_string(),
    timestamp: chrono::Utc::now(),
  }
}

pub fn media_event(message_id: &str, media_id: &str) -> ChatEvent {
  ChatEvent::Media {
    chat_id: "chat-1".to_string(),
    message_id: message_id.to_string(),
    sender: "alice".to_string(),
    media_id: media_id.to_string(),
    mime_type: "image/png".to_string(),
    caption: None,
    timestamp: chrono::Utc::now(),
  }
}

// --- Mock primary service ---

#[derive(Debug, Clone)]
pub struct RecordedRequest {
  pub method: String,
  pub path: String,
  pub body: Value,
  pub authorization: Option<String>,
  pub job_id_header: Option<String>,
}

#[derive(Clone, Default)]
struct MockState {
  requests: Arc<parking_lot::Mutex<Vec<RecordedRequest>>>,
  status: Arc<AtomicU16>,
}

/// In-process stand-in for the primary web service. Records every request and
/// answers with the configured status.
pub struct MockPrimary {
  pub base_url: String,
  state: MockState,
  handle: tokio::task::JoinHandle<()>,
}

impl MockPrimary {
  pub async fn spawn() -> Self {
    let state = MockState {
      requests: Arc::default(),
      status: Arc::new(AtomicU16::new(200)),
    };
    let app = axum::Router::new().fallback(record).with_state(state.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
      .await
      .expect("failed to bind ephemeral port");
    let addr: SocketAddr = listener.local_addr().unwrap();
    let handle = tokio::spawn(async move {
      axum::serve(listener, app).await.unwrap();
    });
    Self {
      base_url: format!("http://{addr}"),
      state,
      handle,
    }
  }

  pub fn respond_with(&self, status: u16) {
    self.state.status.store(status, Ordering::SeqCst);
  }

  pub fn requests(&self) -> Vec<RecordedRequest> {
    self.state.requests.lock().clone()
  }

  pub fn requests_to(&self, path: &str) -> Vec<RecordedRequest> {
    self.requests().into_iter().filter(|r| r.path == path).collect()
  }
}

impl Drop for MockPrimary {
  fn drop(&mut self) {
    self.handle.abort();
  }
}

async fn record(
  State(state): State<MockState>,
  method: Method,
  uri: Uri,
  headers: HeaderMap,
  body: Bytes,
) -> (StatusCode, Json<Value>) {
  let header = |name: &str| headers.get(name).and_then(|v| v.to_str().ok()).map(str::to_string);
  state.requests.lock().push(RecordedRequest {
    method: method.to_string(),
    path: uri.path().to_string(),
    body: serde_json::from_slice(&body).unwrap_or(Value::Null),
    authorization: header("authorization"),
    job_id_header: header("x-job-id"),
  });
  let status = StatusCode::from_u16(state.status.load(Ordering::SeqCst)).unwrap_or(StatusCode::OK);
  (status, Json(json!({ "ok": status.is_success() })))
}

pub fn unused_local_addr() -> SocketAddr {
  "127.0.0.1:0".parse().unwrap()
}
