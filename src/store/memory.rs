use std::collections::HashMap;

use parking_lot::Mutex;
use tokio::sync::watch;

use super::{ConnectionSignal, ConnectionState, JobStore};
use crate::error::StoreError;
use crate::job::{store_key, JobId, JobRecord};

/// In-process store. Records live as long as the store value does.
///
/// Besides tests and ephemeral deployments, it can simulate an outage with
/// [`MemoryStore::simulate_outage`] / [`MemoryStore::restore`], which drive the
/// same connection-state transitions a networked store would publish.
#[derive(Debug)]
pub struct MemoryStore {
  records: Mutex<HashMap<String, JobRecord>>,
  signal: ConnectionSignal,
}

impl MemoryStore {
  pub fn new() -> Self {
    Self {
      records: Mutex::new(HashMap::new()),
      signal: ConnectionSignal::new("memory"),
    }
  }

  /// Marks the connection as lost. Every operation fails until [`MemoryStore::restore`].
  pub fn simulate_outage(&self) {
    self.signal.transition(ConnectionState::Disconnected);
  }

  /// Re-establishes a connection lost through [`MemoryStore::simulate_outage`].
  pub fn restore(&self) {
    if self.signal.current() != ConnectionState::Closed {
      self.signal.transition(ConnectionState::Ready);
    }
  }

  /// Number of records currently held.
  pub fn len(&self) -> usize {
    self.records.lock().len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }
}

impl Default for MemoryStore {
  fn default() -> Self {
    Self::new()
  }
}

impl JobStore for MemoryStore {
  fn name(&self) -> &'static str {
    "memory"
  }

  fn connect(&self) -> Result<(), StoreError> {
    if self.signal.current().is_ready() {
      return Ok(());
    }
    self.signal.transition(ConnectionState::Connecting);
    self.signal.transition(ConnectionState::Ready);
    Ok(())
  }

  fn close(&self) -> Result<(), StoreError> {
    self.signal.transition(ConnectionState::Closed);
    Ok(())
  }

  fn watch_connection(&self) -> watch::Receiver<ConnectionState> {
    self.signal.subscribe()
  }

  fn put(&self, record: &JobRecord) -> Result<(), StoreError> {
    self.signal.ensure_ready()?;
    self
      .records
      .lock()
      .insert(record.store_key(), record.clone());
    Ok(())
  }

  fn get(&self, queue: &str, job_id: JobId) -> Result<Option<JobRecord>, StoreError> {
    self.signal.ensure_ready()?;
    Ok(self.records.lock().get(&store_key(queue, job_id)).cloned())
  }

  fn remove(&self, queue: &str, job_id: JobId) -> Result<(), StoreError> {
    self.signal.ensure_ready()?;
    self.records.lock().remove(&store_key(queue, job_id));
    Ok(())
  }

  fn load_queue(&self, queue: &str) -> Result<Vec<JobRecord>, StoreError> {
    self.signal.ensure_ready()?;
    Ok(
      self
        .records
        .lock()
        .values()
        .filter(|record| record.queue == queue)
        .cloned()
        .collect(),
    )
  }
}
