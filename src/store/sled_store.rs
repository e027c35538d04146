use std::path::PathBuf;

use parking_lot::RwLock;
use tokio::sync::watch;
use tracing::{debug, error};

use super::{ConnectionSignal, ConnectionState, JobStore};
use crate::error::StoreError;
use crate::job::{store_key, JobId, JobRecord};

const JOBS_TREE: &str = "jobs";

/// Persistent store backed by an embedded `sled` database.
///
/// Records are JSON-encoded under `{queue}:{job_id}` in the `jobs` tree. Any I/O
/// error from sled marks the connection as lost; a later successful
/// [`JobStore::connect`] brings it back.
pub struct SledStore {
  path: PathBuf,
  cache_capacity: Option<u64>,
  tree: RwLock<Option<(sled::Db, sled::Tree)>>,
  signal: ConnectionSignal,
}

impl SledStore {
  pub fn new(path: PathBuf, cache_capacity: Option<u64>) -> Self {
    Self {
      path,
      cache_capacity,
      tree: RwLock::new(None),
      signal: ConnectionSignal::new("sled"),
    }
  }

  pub fn path(&self) -> &PathBuf {
    &self.path
  }

  fn with_tree<T>(&self, op: impl FnOnce(&sled::Tree) -> Result<T, StoreError>) -> Result<T, StoreError> {
    self.signal.ensure_ready()?;
    let guard = self.tree.read();
    let (_, tree) = guard.as_ref().ok_or(StoreError::Disconnected)?;
    let result = op(tree);
    if let Err(StoreError::Io(message)) = &result {
      error!(path = %self.path.display(), error = %message, "Sled operation failed.");
      self.signal.transition(ConnectionState::Disconnected);
    }
    result
  }
}

impl std::fmt::Debug for SledStore {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("SledStore")
      .field("path", &self.path)
      .field("state", &self.signal.current())
      .finish()
  }
}

fn decode(key: &[u8], raw: &[u8]) -> Result<JobRecord, StoreError> {
  serde_json::from_slice(raw).map_err(|source| StoreError::Deserialize {
    key: String::from_utf8_lossy(key).into_owned(),
    source,
  })
}

impl JobStore for SledStore {
  fn name(&self) -> &'static str {
    "sled"
  }

  fn connect(&self) -> Result<(), StoreError> {
    if self.signal.current().is_ready() {
      return Ok(());
    }
    self.signal.transition(ConnectionState::Connecting);

    let mut config = sled::Config::new().path(&self.path);
    if let Some(cache_capacity) = self.cache_capacity {
      config = config.cache_capacity(cache_capacity);
    }

    let opened = config
      .open()
      .and_then(|db| db.open_tree(JOBS_TREE).map(|tree| (db, tree)));
    match opened {
      Ok(handles) => {
        *self.tree.write() = Some(handles);
        self.signal.transition(ConnectionState::Ready);
        Ok(())
      }
      Err(err) => {
        self.signal.transition(ConnectionState::Disconnected);
        Err(err.into())
      }
    }
  }

  fn close(&self) -> Result<(), StoreError> {
    let handles = self.tree.write().take();
    let flushed = match handles {
      Some((db, _tree)) => {
        debug!(path = %self.path.display(), "Flushing sled store before close.");
        db.flush().map(|_| ()).map_err(StoreError::from)
      }
      None => Ok(()),
    };
    self.signal.transition(ConnectionState::Closed);
    flushed
  }

  fn watch_connection(&self) -> watch::Receiver<ConnectionState> {
    self.signal.subscribe()
  }

  fn put(&self, record: &JobRecord) -> Result<(), StoreError> {
    let value = serde_json::to_vec(record).map_err(StoreError::Serialize)?;
    self.with_tree(|tree| {
      tree.insert(record.store_key().as_bytes(), value)?;
      Ok(())
    })
  }

  fn get(&self, queue: &str, job_id: JobId) -> Result<Option<JobRecord>, StoreError> {
    let key = store_key(queue, job_id);
    self.with_tree(|tree| {
      tree
        .get(key.as_bytes())?
        .map(|raw| decode(key.as_bytes(), raw.as_ref()))
        .transpose()
    })
  }

  fn remove(&self, queue: &str, job_id: JobId) -> Result<(), StoreError> {
    let key = store_key(queue, job_id);
    self.with_tree(|tree| {
      tree.remove(key.as_bytes())?;
      Ok(())
    })
  }

  fn load_queue(&self, queue: &str) -> Result<Vec<JobRecord>, StoreError> {
    let prefix = format!("{queue}:");
    self.with_tree(|tree| {
      let mut records = Vec::new();
      for entry in tree.scan_prefix(prefix.as_bytes()) {
        let (key, value) = entry?;
        let record = decode(key.as_ref(), value.as_ref())?;
        // `a:` also prefixes the keys of queue `a:b`.
        if record.queue == queue {
          records.push(record);
        }
      }
      Ok(records)
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::job::JobOptions;
  use chrono::Utc;
  use serde_json::json;

  #[test]
  fn records_survive_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let record = JobRecord::new("media", "media-download", json!({"url": "x"}), &JobOptions::new(), Utc::now(), 1).unwrap();

    let store = SledStore::new(dir.path().join("db"), None);
    store.connect().unwrap();
    store.put(&record).unwrap();
    store.close().unwrap();
    assert_eq!(store.connection_state(), ConnectionState::Closed);
    drop(store);

    let reopened = SledStore::new(dir.path().join("db"), None);
    reopened.connect().unwrap();
    let loaded = reopened.get("media", record.id).unwrap();
    assert_eq!(loaded, Some(record.clone()));
    assert_eq!(reopened.load_queue("media").unwrap().len(), 1);
    assert!(reopened.load_queue("messages").unwrap().is_empty());
  }

  #[test]
  fn operations_fail_before_connect() {
    let dir = tempfile::tempdir().unwrap();
    let store = SledStore::new(dir.path().join("db"), None);
    assert!(matches!(store.load_queue("media"), Err(StoreError::Disconnected)));
  }
}
