//! The chat-bot collaborator.
//!
//! A [`ChatTransport`] is the raw link to a chat network. [`ChatSession`] wraps one
//! with the client-owned reconnect loop and pumps inbound [`ChatEvent`]s onto a
//! channel. The worker controller only sees the [`ChatClient`] surface: start, stop,
//! connected or not, and the event stream.

use crate::error::ChatError;

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Inbound event from the chat network.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum ChatEvent {
  #[serde(rename_all = "camelCase")]
  Message {
    chat_id: String,
    message_id: String,
    sender: String,
    text: String,
    timestamp: DateTime<Utc>,
  },
  #[serde(rename_all = "camelCase")]
  Media {
    chat_id: String,
    message_id: String,
    sender: String,
    media_id: String,
    mime_type: String,
    caption: Option<String>,
    timestamp: DateTime<Utc>,
  },
}

impl ChatEvent {
  pub fn message_id(&self) -> &str {
    match self {
      ChatEvent::Message { message_id, .. } | ChatEvent::Media { message_id, .. } => message_id,
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatStatus {
  Disconnected,
  Connecting,
  Connected,
  Reconnecting,
  /// Reconnect attempts exhausted.
  Failed,
  Stopped,
}

/// Raw link to a chat network.
#[async_trait]
pub trait ChatTransport: Send + Sync + 'static {
  async fn connect(&self) -> Result<(), ChatError>;

  async fn disconnect(&self) -> Result<(), ChatError>;

  /// Waits for the next inbound event. `Err` means the link dropped.
  async fn next_event(&self) -> Result<ChatEvent, ChatError>;

  /// Sends a text message, returning the network's message id.
  async fn send_message(&self, chat_id: &str, text: &str) -> Result<String, ChatError>;

  async fn download_media(&self, media_id: &str) -> Result<Vec<u8>, ChatError>;
}

/// What the worker needs from a chat client.
#[async_trait]
pub trait ChatClient: Send + Sync + 'static {
  /// Connects (with the client's own retry policy) and starts pumping events.
  async fn start(&self) -> Result<(), ChatError>;

  /// Stops the pump and disconnects. Idempotent.
  async fn stop(&self);

  fn status(&self) -> ChatStatus;

  fn watch_status(&self) -> watch::Receiver<ChatStatus>;

  fn is_connected(&self) -> bool {
    self.status() == ChatStatus::Connected
  }

  /// Total reconnect attempts since start.
  fn reconnect_attempts(&self) -> u32;

  /// The inbound event stream. Can be taken once.
  fn take_events(&self) -> Option<mpsc::Receiver<ChatEvent>>;

  async fn send_message(&self, chat_id: &str, text: &str) -> Result<String, ChatError>;

  async fn download_media(&self, media_id: &str) -> Result<Vec<u8>, ChatError>;
}

// --- Session ---

#[derive(Debug, Clone)]
pub struct ChatSessionConfig {
  /// Attempts per (re)connect cycle before giving up.
  pub reconnect_attempts: u32,
  /// Fixed wait between attempts.
  pub reconnect_delay: Duration,
  pub event_buffer: usize,
}

impl Default for ChatSessionConfig {
  fn default() -> Self {
    Self {
      reconnect_attempts: 5,
      reconnect_delay: Duration::from_secs(5),
      event_buffer: 256,
    }
  }
}

struct SessionShared<T> {
  transport: T,
  config: ChatSessionConfig,
  status_tx: watch::Sender<ChatStatus>,
  stop_tx: watch::Sender<bool>,
  reconnects: AtomicU32,
}

impl<T: ChatTransport> SessionShared<T> {
  fn set_status(&self, status: ChatStatus) {
    let previous = self.status_tx.send_replace(status);
    if previous != status {
      debug!(from = ?previous, to = ?status, "Chat status changed.");
    }
  }

  fn stopping(&self) -> bool {
    *self.stop_tx.borrow()
  }

  /// Tries to connect up to `reconnect_attempts` times. Returns the last error.
  async fn connect_with_retry(&self, mut stop_rx: watch::Receiver<bool>) -> Result<(), ChatError> {
    let attempts = self.config.reconnect_attempts.max(1);
    let mut last_error = ChatError::Disconnected;
    for attempt in 1..=attempts {
      if self.stopping() {
        return Err(ChatError::Disconnected);
      }
      match self.transport.connect().await {
        Ok(()) => {
          self.set_status(ChatStatus::Connected);
          return Ok(());
        }
        Err(e) => {
          warn!(attempt, max_attempts = attempts, error = %e, "Chat connect attempt failed.");
          last_error = e;
        }
      }
      if attempt < attempts {
        tokio::select! {
          _ = tokio::time::sleep(self.config.reconnect_delay) => {}
          _ = stop_rx.changed() => return Err(ChatError::Disconnected),
        }
      }
    }
    Err(last_error)
  }

  async fn pump(self: Arc<Self>, events_tx: mpsc::Sender<ChatEvent>) {
    let mut stop_rx = self.stop_tx.subscribe();
    loop {
      if self.stopping() {
        break;
      }
      let next = tokio::select! {
        biased;
        _ = stop_rx.changed() => break,
        next = self.transport.next_event() => next,
      };
      match next {
        Ok(event) => {
          if events_tx.send(event).await.is_err() {
            debug!("Chat event receiver dropped. Pump exiting.");
            break;
          }
        }
        Err(e) => {
          warn!(error = %e, "Chat connection dropped. Reconnecting.");
          self.set_status(ChatStatus::Reconnecting);
          self.reconnects.fetch_add(1, Ordering::Relaxed);
          tokio::select! {
            _ = tokio::time::sleep(self.config.reconnect_delay) => {}
            _ = stop_rx.changed() => break,
          }
          match self.connect_with_retry(stop_rx.clone()).await {
            Ok(()) => info!("Chat connection re-established."),
            Err(e) if self.stopping() => {
              debug!(error = %e, "Reconnect interrupted by stop.");
              break;
            }
            Err(e) => {
              error!(error = %e, "Chat reconnect attempts exhausted.");
              self.set_status(ChatStatus::Failed);
              break;
            }
          }
        }
      }
    }
  }
}

/// A [`ChatClient`] over any [`ChatTransport`].
pub struct ChatSession<T: ChatTransport> {
  shared: Arc<SessionShared<T>>,
  events_rx: Mutex<Option<mpsc::Receiver<ChatEvent>>>,
  events_tx: Mutex<Option<mpsc::Sender<ChatEvent>>>,
  pump: Mutex<Option<JoinHandle<()>>>,
}

impl<T: ChatTransport> ChatSession<T> {
  pub fn new(transport: T, config: ChatSessionConfig) -> Self {
    let (events_tx, events_rx) = mpsc::channel(config.event_buffer.max(1));
    let (status_tx, _) = watch::channel(ChatStatus::Disconnected);
    let (stop_tx, _) = watch::channel(false);
    Self {
      shared: Arc::new(SessionShared {
        transport,
        config,
        status_tx,
        stop_tx,
        reconnects: AtomicU32::new(0),
      }),
      events_rx: Mutex::new(Some(events_rx)),
      events_tx: Mutex::new(Some(events_tx)),
      pump: Mutex::new(None),
    }
  }

  pub fn transport(&self) -> &T {
    &self.shared.transport
  }
}

#[async_trait]
impl<T: ChatTransport> ChatClient for ChatSession<T> {
  async fn start(&self) -> Result<(), ChatError> {
    let events_tx = self.events_tx.lock().take();
    let Some(events_tx) = events_tx else {
      debug!("Chat session already started.");
      return Ok(());
    };

    self.shared.set_status(ChatStatus::Connecting);
    let stop_rx = self.shared.stop_tx.subscribe();
    if let Err(e) = self.shared.connect_with_retry(stop_rx).await {
      self.shared.set_status(ChatStatus::Failed);
      *self.events_tx.lock() = Some(events_tx);
      return Err(ChatError::Connect(e.to_string()));
    }

    let pump = tokio::spawn(self.shared.clone().pump(events_tx));
    *self.pump.lock() = Some(pump);
    info!("Chat session started.");
    Ok(())
  }

  async fn stop(&self) {
    if self.shared.stop_tx.send_replace(true) {
      return;
    }
    let pump = self.pump.lock().take();
    if let Some(pump) = pump {
      if tokio::time::timeout(Duration::from_secs(2), pump).await.is_err() {
        warn!("Chat pump did not stop in time.");
      }
    }
    if let Err(e) = self.shared.transport.disconnect().await {
      warn!(error = %e, "Chat disconnect failed.");
    }
    self.shared.set_status(ChatStatus::Stopped);
    info!("Chat session stopped.");
  }

  fn status(&self) -> ChatStatus {
    *self.shared.status_tx.borrow()
  }

  fn watch_status(&self) -> watch::Receiver<ChatStatus> {
    self.shared.status_tx.subscribe()
  }

  fn reconnect_attempts(&self) -> u32 {
    self.shared.reconnects.load(Ordering::Relaxed)
  }

  fn take_events(&self) -> Option<mpsc::Receiver<ChatEvent>> {
    self.events_rx.lock().take()
  }

  async fn send_message(&self, chat_id: &str, text: &str) -> Result<String, ChatError> {
    if !self.is_connected() {
      return Err(ChatError::Disconnected);
    }
    self.shared.transport.send_message(chat_id, text).await
  }

  async fn download_media(&self, media_id: &str) -> Result<Vec<u8>, ChatError> {
    if !self.is_connected() {
      return Err(ChatError::Disconnected);
    }
    self.shared.transport.download_media(media_id).await
  }
}

// --- Offline transport ---

/// Transport for running the worker without a chat network: connects instantly,
/// never produces events, and rejects outbound calls.
#[derive(Debug, Default, Clone, Copy)]
pub struct OfflineTransport;

#[async_trait]
impl ChatTransport for OfflineTransport {
  async fn connect(&self) -> Result<(), ChatError> {
    Ok(())
  }

  async fn disconnect(&self) -> Result<(), ChatError> {
    Ok(())
  }

  async fn next_event(&self) -> Result<ChatEvent, ChatError> {
    std::future::pending().await
  }

  async fn send_message(&self, _chat_id: &str, _text: &str) -> Result<String, ChatError> {
    Err(ChatError::Unsupported("send_message"))
  }

  async fn download_media(&self, _media_id: &str) -> Result<Vec<u8>, ChatError> {
    Err(ChatError::Unsupported("download_media"))
  }
}
