//! tests/recovery.rs
//! Durability on a sled store: records survive a restart, and jobs left active by a
//! dead process are recovered as stalled.

mod common;
use crate::common::{counting_processor, setup_tracing, test_queue_options, wait_for_finished, wait_until};
use jobbridge::{
  EventBus, Job, JobOptions, JobState, JobStore, QueueBackend, QueueEventKind, QueueHandle, SledStore,
};
use serde_json::{json, Value};
use std::sync::{
  atomic::{AtomicUsize, Ordering},
  Arc,
};
use std::time::Duration as StdDuration;

fn sled_store(dir: &tempfile::TempDir) -> Arc<dyn JobStore> {
  Arc::new(SledStore::new(dir.path().join("jobs.db"), None))
}

#[tokio::test]
async fn test_waiting_jobs_survive_restart() {
  setup_tracing();
  let dir = tempfile::tempdir().unwrap();

  let first = QueueBackend::new(test_queue_options());
  assert!(first.initialize_with(sled_store(&dir)).await);
  let queue = first.get_queue("data").await.unwrap();
  let record = queue
    .add("data-sync", json!({ "table": "users" }), JobOptions::new().priority(4))
    .await
    .unwrap();
  first.shutdown(None).await;

  let second = QueueBackend::new(test_queue_options());
  assert!(second.initialize_with(sled_store(&dir)).await);
  let queue = second.get_queue("data").await.unwrap();
  let reloaded = queue.get_job(record.id).await.unwrap().expect("record persisted");
  assert_eq!(reloaded.state, JobState::Waiting);
  assert_eq!(reloaded.priority, 4);
  assert_eq!(reloaded.payload, json!({ "table": "users" }));

  let counter = Arc::new(AtomicUsize::new(0));
  queue
    .process("data-sync", 1, counting_processor(counter.clone(), StdDuration::ZERO, true))
    .await
    .unwrap();
  assert!(wait_for_finished(&queue, 1, 0).await);
  assert_eq!(counter.load(Ordering::SeqCst), 1);

  second.shutdown(None).await;
}

#[tokio::test]
async fn test_abandoned_active_job_is_recovered_as_stalled() {
  setup_tracing();
  let dir = tempfile::tempdir().unwrap();

  // First process: the job is claimed, then the process "dies" mid-run.
  let first = QueueBackend::new(test_queue_options());
  assert!(first.initialize_with(sled_store(&dir)).await);
  let queue = first.get_queue("media").await.unwrap();
  queue
    .process("media-download", 1, |_job: Job| async move {
      tokio::time::sleep(StdDuration::from_secs(30)).await;
      Ok(Value::Null)
    })
    .await
    .unwrap();
  let record = queue
    .add("media-download", json!({ "mediaId": "m-1" }), JobOptions::new().attempts(3))
    .await
    .unwrap();
  assert!(
    wait_until(StdDuration::from_secs(2), || async {
      queue.counts().await.map(|s| s.active == 1).unwrap_or(false)
    })
    .await
  );
  first.shutdown(Some(StdDuration::from_millis(50))).await;

  // Second process: observers attached before open see the recovery.
  let store = sled_store(&dir);
  store.connect().unwrap();
  let events = Arc::new(EventBus::new());
  let stalled = Arc::new(parking_lot::Mutex::new(Vec::new()));
  let sink = stalled.clone();
  let _observer = events.on(QueueEventKind::Stalled, move |event| sink.lock().push(event.job_id));

  let queue = QueueHandle::open("media", store.clone(), test_queue_options(), events)
    .await
    .unwrap();
  assert_eq!(*stalled.lock(), vec![Some(record.id)]);
  assert_eq!(queue.metrics().jobs_stalled, 1);

  let recovered = queue.get_job(record.id).await.unwrap().unwrap();
  assert_eq!(recovered.state, JobState::Waiting);
  assert_eq!(queue.counts().await.unwrap().active, 0);

  let counter = Arc::new(AtomicUsize::new(0));
  queue
    .process("media-download", 1, counting_processor(counter.clone(), StdDuration::ZERO, true))
    .await
    .unwrap();
  assert!(wait_for_finished(&queue, 1, 0).await);
  assert_eq!(counter.load(Ordering::SeqCst), 1, "stalled job runs again");

  queue.close(None).await.unwrap();
  store.close().unwrap();
}

#[tokio::test]
async fn test_reopened_queue_loads_only_its_own_records() {
  setup_tracing();
  let dir = tempfile::tempdir().unwrap();

  let first = QueueBackend::new(test_queue_options());
  assert!(first.initialize_with(sled_store(&dir)).await);
  let nested = first.get_queue("a:b").await.unwrap();
  let stray = nested.add("data-sync", json!({}), JobOptions::new()).await.unwrap();
  let outer = first.get_queue("a").await.unwrap();
  let own = outer.add("data-sync", json!({}), JobOptions::new()).await.unwrap();
  first.shutdown(None).await;

  let store = sled_store(&dir);
  store.connect().unwrap();
  let loaded: Vec<String> = store.load_queue("a").unwrap().into_iter().map(|r| r.queue).collect();
  assert_eq!(loaded, vec!["a".to_string()]);
  store.close().unwrap();
  drop(store);

  let second = QueueBackend::new(test_queue_options());
  assert!(second.initialize_with(sled_store(&dir)).await);
  let outer = second.get_queue("a").await.unwrap();
  assert_eq!(outer.counts().await.unwrap().waiting, 1);
  assert!(outer.get_job(own.id).await.unwrap().is_some());
  assert!(outer.get_job(stray.id).await.unwrap().is_none());
  let nested = second.get_queue("a:b").await.unwrap();
  assert_eq!(nested.get_job(stray.id).await.unwrap().unwrap().queue, "a:b");

  second.shutdown(None).await;
}
