//! Durable job storage.
//!
//! A [`JobStore`] persists [`JobRecord`]s under `{queue}:{job_id}` keys and publishes
//! its connection state on a `watch` channel. Queues write every state transition
//! through to the store, and reload their records from it when they are opened.

mod memory;
mod sled_store;

pub use memory::MemoryStore;
pub use sled_store::SledStore;

use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::error::StoreError;
use crate::job::{JobId, JobRecord};

/// Connection state of a store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
  /// Never connected, or the connection was lost.
  Disconnected,
  Connecting,
  /// Connected and usable.
  Ready,
  /// Closed on purpose.
  Closed,
}

impl ConnectionState {
  pub fn is_ready(&self) -> bool {
    matches!(self, ConnectionState::Ready)
  }
}

/// Capability contract of the durable store behind every queue.
///
/// Implementations are synchronous; callers on the async runtime keep calls short
/// (single-record reads and writes) or move them to `spawn_blocking` (connect).
pub trait JobStore: Send + Sync + 'static {
  /// Short backend name for logs.
  fn name(&self) -> &'static str;

  /// Opens the connection. Publishes `Connecting`, then `Ready` or `Disconnected`.
  fn connect(&self) -> Result<(), StoreError>;

  /// Flushes and closes the connection. Publishes `Closed`. Closing twice is a no-op.
  fn close(&self) -> Result<(), StoreError>;

  /// Subscribes to connection-state transitions.
  fn watch_connection(&self) -> watch::Receiver<ConnectionState>;

  fn connection_state(&self) -> ConnectionState {
    *self.watch_connection().borrow()
  }

  /// Inserts or replaces a record.
  fn put(&self, record: &JobRecord) -> Result<(), StoreError>;

  fn get(&self, queue: &str, job_id: JobId) -> Result<Option<JobRecord>, StoreError>;

  fn remove(&self, queue: &str, job_id: JobId) -> Result<(), StoreError>;

  /// All records belonging to `queue`, in no particular order.
  fn load_queue(&self, queue: &str) -> Result<Vec<JobRecord>, StoreError>;
}

/// Which store to open, and where.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreConfig {
  /// Process-local store; nothing survives a restart.
  Memory,
  /// Persistent `sled` database at `path`.
  Sled {
    path: PathBuf,
    cache_capacity: Option<u64>,
  },
}

impl StoreConfig {
  /// Builds the (not yet connected) store described by this config.
  pub fn build(&self) -> Arc<dyn JobStore> {
    match self {
      StoreConfig::Memory => Arc::new(MemoryStore::new()),
      StoreConfig::Sled {
        path,
        cache_capacity,
      } => Arc::new(SledStore::new(path.clone(), *cache_capacity)),
    }
  }
}

/// Owner side of a store's connection-state channel.
#[derive(Debug)]
pub(crate) struct ConnectionSignal {
  store: &'static str,
  tx: watch::Sender<ConnectionState>,
}

impl ConnectionSignal {
  pub(crate) fn new(store: &'static str) -> Self {
    let (tx, _rx) = watch::channel(ConnectionState::Disconnected);
    Self { store, tx }
  }

  pub(crate) fn subscribe(&self) -> watch::Receiver<ConnectionState> {
    self.tx.subscribe()
  }

  pub(crate) fn current(&self) -> ConnectionState {
    *self.tx.borrow()
  }

  /// Publishes `next` if it differs from the current state.
  pub(crate) fn transition(&self, next: ConnectionState) {
    let previous = self.tx.send_replace(next);
    if previous == next {
      return;
    }
    match next {
      ConnectionState::Ready => info!(store = self.store, from = ?previous, "Store connection ready."),
      ConnectionState::Disconnected => {
        warn!(store = self.store, from = ?previous, "Store connection lost.")
      }
      _ => debug!(store = self.store, from = ?previous, to = ?next, "Store connection state changed."),
    }
  }

  pub(crate) fn ensure_ready(&self) -> Result<(), StoreError> {
    if self.current().is_ready() {
      Ok(())
    } else {
      Err(StoreError::Disconnected)
    }
  }
}
