//! tests/queue.rs
//! Queue semantics: retries, priorities, pause/resume, cleaning, removal caps.

mod common;
use crate::common::{
  counting_processor, kinds_for, memory_backend, record_events, setup_tracing, test_queue_options,
  wait_for_finished, wait_until, FaultyStore, EXPLODING_JOB_TYPE,
};
use jobbridge::{
  Backoff, BackendError, Job, JobError, JobOptions, JobState, JobStore, QueueBackend, QueueError, QueueEventKind,
  QueueOptions, Repeat,
};
use serde_json::{json, Value};
use std::sync::{
  atomic::{AtomicUsize, Ordering},
  Arc,
};
use std::time::{Duration as StdDuration, Instant};

#[tokio::test]
async fn test_always_failing_job_runs_exactly_max_attempts() {
  setup_tracing();
  let (backend, _store) = memory_backend(test_queue_options()).await;
  let queue = backend.get_queue("jobs").await.unwrap();
  let counter = Arc::new(AtomicUsize::new(0));
  queue
    .process("flaky", 1, counting_processor(counter.clone(), StdDuration::ZERO, false))
    .await
    .unwrap();

  let options = JobOptions::new()
    .attempts(3)
    .backoff(Backoff::fixed(StdDuration::from_millis(20)));
  let record = queue.add("flaky", json!({}), options).await.unwrap();

  assert!(wait_for_finished(&queue, 0, 1).await, "job should fail terminally");
  let finished = queue.get_job(record.id).await.unwrap().unwrap();
  assert_eq!(finished.state, JobState::Failed);
  assert_eq!(finished.attempts_made, 3);
  assert_eq!(finished.failure_reason.as_deref(), Some("forced failure #3"));
  assert!(finished.finished_at.is_some());
  assert_eq!(counter.load(Ordering::SeqCst), 3, "processor should run once per attempt");

  let metrics = queue.metrics();
  assert_eq!(metrics.jobs_failed_attempts, 3);
  assert_eq!(metrics.jobs_retried, 2);
  assert_eq!(metrics.jobs_permanently_failed, 1);

  backend.shutdown(None).await;
}

#[tokio::test]
async fn test_non_retryable_error_fails_at_once() {
  setup_tracing();
  let (backend, _store) = memory_backend(test_queue_options()).await;
  let queue = backend.get_queue("jobs").await.unwrap();
  let counter = Arc::new(AtomicUsize::new(0));
  let ctr = counter.clone();
  queue
    .process("strict", 1, move |_job: Job| {
      let ctr = ctr.clone();
      async move {
        ctr.fetch_add(1, Ordering::SeqCst);
        Err::<Value, _>(JobError::fatal("payload rejected"))
      }
    })
    .await
    .unwrap();

  let record = queue
    .add("strict", json!({}), JobOptions::new().attempts(5))
    .await
    .unwrap();

  assert!(wait_for_finished(&queue, 0, 1).await);
  let finished = queue.get_job(record.id).await.unwrap().unwrap();
  assert_eq!(finished.attempts_made, 1);
  assert_eq!(counter.load(Ordering::SeqCst), 1);

  backend.shutdown(None).await;
}

#[tokio::test]
async fn test_panicking_processor_counts_as_failed_attempt() {
  setup_tracing();
  let (backend, _store) = memory_backend(test_queue_options()).await;
  let queue = backend.get_queue("jobs").await.unwrap();
  queue
    .process("boom", 1, |_job: Job| async move {
      tokio::task::yield_now().await;
      if true {
        panic!("processor forced panic!");
      }
      Ok(Value::Null)
    })
    .await
    .unwrap();

  let record = queue.add("boom", json!({}), JobOptions::new().attempts(2)).await.unwrap();

  assert!(wait_for_finished(&queue, 0, 1).await);
  let finished = queue.get_job(record.id).await.unwrap().unwrap();
  assert_eq!(finished.attempts_made, 2);
  assert_eq!(queue.metrics().jobs_panicked, 2);

  backend.shutdown(None).await;
}

#[tokio::test]
async fn test_higher_priority_starts_first() {
  setup_tracing();
  let (backend, _store) = memory_backend(test_queue_options()).await;
  let queue = backend.get_queue("jobs").await.unwrap();
  let order = Arc::new(parking_lot::Mutex::new(Vec::new()));

  // Hold the lane while both jobs are enqueued.
  queue.pause().await.unwrap();
  let seen = order.clone();
  queue
    .process("ranked", 1, move |job: Job| {
      let seen = seen.clone();
      async move {
        seen.lock().push(job.priority);
        Ok(Value::Null)
      }
    })
    .await
    .unwrap();

  queue.add("ranked", json!({}), JobOptions::new().priority(1)).await.unwrap();
  queue.add("ranked", json!({}), JobOptions::new().priority(10)).await.unwrap();
  queue.add("ranked", json!({}), JobOptions::new().priority(5)).await.unwrap();
  queue.resume().await.unwrap();

  assert!(wait_for_finished(&queue, 3, 0).await);
  assert_eq!(*order.lock(), vec![10, 5, 1]);

  backend.shutdown(None).await;
}

#[tokio::test]
async fn test_equal_priority_runs_in_enqueue_order() {
  setup_tracing();
  let (backend, _store) = memory_backend(test_queue_options()).await;
  let queue = backend.get_queue("jobs").await.unwrap();
  let order = Arc::new(parking_lot::Mutex::new(Vec::new()));
  queue.pause().await.unwrap();
  let seen = order.clone();
  queue
    .process("fifo", 1, move |job: Job| {
      let seen = seen.clone();
      async move {
        seen.lock().push(job.payload["n"].as_u64().unwrap_or_default());
        Ok(Value::Null)
      }
    })
    .await
    .unwrap();

  for n in 0..4 {
    queue.add("fifo", json!({ "n": n }), JobOptions::new()).await.unwrap();
  }
  queue.resume().await.unwrap();

  assert!(wait_for_finished(&queue, 4, 0).await);
  assert_eq!(*order.lock(), vec![0, 1, 2, 3]);

  backend.shutdown(None).await;
}

#[tokio::test]
async fn test_paused_queue_does_not_claim_until_resumed() {
  setup_tracing();
  let (backend, _store) = memory_backend(test_queue_options()).await;
  let queue = backend.get_queue("jobs").await.unwrap();
  let counter = Arc::new(AtomicUsize::new(0));
  queue
    .process("held", 1, counting_processor(counter.clone(), StdDuration::ZERO, true))
    .await
    .unwrap();

  queue.pause().await.unwrap();
  queue.add("held", json!({}), JobOptions::new()).await.unwrap();
  tokio::time::sleep(StdDuration::from_millis(150)).await;

  let stats = queue.counts().await.unwrap();
  assert!(stats.paused);
  assert_eq!(stats.waiting, 1);
  assert_eq!(counter.load(Ordering::SeqCst), 0, "paused queue must not claim");

  queue.resume().await.unwrap();
  assert!(wait_for_finished(&queue, 1, 0).await);
  assert_eq!(counter.load(Ordering::SeqCst), 1);

  backend.shutdown(None).await;
}

#[tokio::test]
async fn test_pause_lets_active_job_finish() {
  setup_tracing();
  let (backend, _store) = memory_backend(test_queue_options()).await;
  let queue = backend.get_queue("jobs").await.unwrap();
  let counter = Arc::new(AtomicUsize::new(0));
  queue
    .process("slow", 1, counting_processor(counter.clone(), StdDuration::from_millis(150), true))
    .await
    .unwrap();

  queue.add("slow", json!({}), JobOptions::new()).await.unwrap();
  assert!(
    wait_until(StdDuration::from_secs(2), || async { queue.counts().await.map(|s| s.active == 1).unwrap_or(false) }).await
  );
  queue.pause().await.unwrap();

  assert!(wait_for_finished(&queue, 1, 0).await, "active job runs to completion while paused");
  backend.shutdown(None).await;
}

#[tokio::test]
async fn test_delayed_job_becomes_eligible_after_delay() {
  setup_tracing();
  let (backend, _store) = memory_backend(test_queue_options()).await;
  let queue = backend.get_queue("jobs").await.unwrap();
  let counter = Arc::new(AtomicUsize::new(0));
  queue
    .process("later", 1, counting_processor(counter.clone(), StdDuration::ZERO, true))
    .await
    .unwrap();

  let start = Instant::now();
  let record = queue
    .add("later", json!({}), JobOptions::new().delay(StdDuration::from_millis(250)))
    .await
    .unwrap();
  assert_eq!(record.state, JobState::Delayed);

  tokio::time::sleep(StdDuration::from_millis(80)).await;
  assert_eq!(queue.counts().await.unwrap().delayed, 1);
  assert_eq!(counter.load(Ordering::SeqCst), 0);

  assert!(wait_for_finished(&queue, 1, 0).await);
  assert!(start.elapsed() >= StdDuration::from_millis(250));

  backend.shutdown(None).await;
}

#[tokio::test]
async fn test_clean_removes_only_expired_finished_jobs() {
  setup_tracing();
  let (backend, store) = memory_backend(test_queue_options()).await;
  let queue = backend.get_queue("jobs").await.unwrap();
  let counter = Arc::new(AtomicUsize::new(0));
  queue
    .process("ok", 2, counting_processor(counter.clone(), StdDuration::ZERO, true))
    .await
    .unwrap();
  queue
    .process("bad", 1, counting_processor(counter.clone(), StdDuration::ZERO, false))
    .await
    .unwrap();

  queue.add("ok", json!({}), JobOptions::new()).await.unwrap();
  queue.add("ok", json!({}), JobOptions::new()).await.unwrap();
  assert!(wait_for_finished(&queue, 2, 0).await);
  tokio::time::sleep(StdDuration::from_millis(400)).await;

  // Finished just now, and one that never runs (no processor for its type).
  queue.add("bad", json!({}), JobOptions::new()).await.unwrap();
  queue.add("unhandled", json!({}), JobOptions::new()).await.unwrap();
  assert!(wait_for_finished(&queue, 2, 1).await);

  let removed = queue.clean(StdDuration::from_millis(300)).await.unwrap();
  assert_eq!(removed, 2);

  let stats = queue.counts().await.unwrap();
  assert_eq!(stats.completed, 0);
  assert_eq!(stats.failed, 1);
  assert_eq!(stats.waiting, 1);
  assert_eq!(store.len(), 2, "cleaned records are removed from the store too");

  backend.shutdown(None).await;
}

#[tokio::test]
async fn test_keep_completed_caps_retained_jobs() {
  setup_tracing();
  let options = QueueOptions {
    keep_completed: Some(2),
    ..test_queue_options()
  };
  let (backend, store) = memory_backend(options).await;
  let queue = backend.get_queue("jobs").await.unwrap();
  let counter = Arc::new(AtomicUsize::new(0));
  queue
    .process("bulk", 1, counting_processor(counter.clone(), StdDuration::ZERO, true))
    .await
    .unwrap();

  let mut ids = Vec::new();
  for _ in 0..5 {
    ids.push(queue.add("bulk", json!({}), JobOptions::new()).await.unwrap().id);
  }
  assert!(
    wait_until(StdDuration::from_secs(5), || async {
      let stats = queue.counts().await.unwrap();
      stats.waiting + stats.active == 0 && stats.completed == 2
    })
    .await
  );
  assert_eq!(queue.metrics().jobs_completed, 5);
  assert_eq!(store.len(), 2);
  assert!(queue.get_job(ids[0]).await.unwrap().is_none(), "oldest job evicted");
  assert!(queue.get_job(ids[4]).await.unwrap().is_some(), "newest job kept");

  backend.shutdown(None).await;
}

#[tokio::test]
async fn test_reregistering_a_processor_is_rejected() {
  setup_tracing();
  let (backend, _store) = memory_backend(test_queue_options()).await;
  let queue = backend.get_queue("jobs").await.unwrap();
  let first = Arc::new(AtomicUsize::new(0));
  let second = Arc::new(AtomicUsize::new(0));

  queue
    .process("dup", 1, counting_processor(first.clone(), StdDuration::ZERO, true))
    .await
    .unwrap();
  let err = queue
    .process("dup", 1, counting_processor(second.clone(), StdDuration::ZERO, true))
    .await
    .unwrap_err();
  assert!(matches!(err, QueueError::ProcessorAlreadyRegistered { .. }));

  let err = queue
    .process("other", 0, counting_processor(second.clone(), StdDuration::ZERO, true))
    .await
    .unwrap_err();
  assert!(matches!(err, QueueError::ZeroConcurrency(_)));

  queue.add("dup", json!({}), JobOptions::new()).await.unwrap();
  assert!(wait_for_finished(&queue, 1, 0).await);
  assert_eq!(first.load(Ordering::SeqCst), 1, "original registration stays active");
  assert_eq!(second.load(Ordering::SeqCst), 0);

  backend.shutdown(None).await;
}

#[tokio::test]
async fn test_progress_is_persisted_and_emitted() {
  setup_tracing();
  let (backend, _store) = memory_backend(test_queue_options()).await;
  let queue = backend.get_queue("jobs").await.unwrap();
  let events = record_events(&queue);
  queue
    .process("report", 1, |job: Job| async move {
      job.report_progress(json!({ "pct": 50 }));
      tokio::time::sleep(StdDuration::from_millis(50)).await;
      Ok(json!({ "done": true }))
    })
    .await
    .unwrap();

  let record = queue.add("report", json!({}), JobOptions::new()).await.unwrap();
  assert!(wait_for_finished(&queue, 1, 0).await);

  let finished = queue.get_job(record.id).await.unwrap().unwrap();
  assert_eq!(finished.progress, Some(json!({ "pct": 50 })));
  assert_eq!(finished.return_value, Some(json!({ "done": true })));
  let kinds = kinds_for(&events.lock(), record.id);
  assert_eq!(
    kinds,
    vec![
      QueueEventKind::Waiting,
      QueueEventKind::Active,
      QueueEventKind::Progress,
      QueueEventKind::Completed
    ]
  );

  backend.shutdown(None).await;
}

#[tokio::test]
async fn test_interval_repeat_stops_at_limit() {
  setup_tracing();
  let (backend, _store) = memory_backend(test_queue_options()).await;
  let queue = backend.get_queue("jobs").await.unwrap();
  let counter = Arc::new(AtomicUsize::new(0));
  queue
    .process("tick", 1, counting_processor(counter.clone(), StdDuration::ZERO, true))
    .await
    .unwrap();

  let repeat = Repeat::every(StdDuration::from_millis(50)).with_limit(3);
  queue.add("tick", json!({}), JobOptions::new().repeat(repeat)).await.unwrap();

  assert!(wait_for_finished(&queue, 3, 0).await);
  tokio::time::sleep(StdDuration::from_millis(200)).await;
  assert_eq!(counter.load(Ordering::SeqCst), 3);
  let stats = queue.counts().await.unwrap();
  assert_eq!(stats.delayed + stats.waiting, 0, "no occurrence beyond the limit");

  backend.shutdown(None).await;
}

#[tokio::test]
async fn test_invalid_repeat_is_rejected() {
  setup_tracing();
  let (backend, _store) = memory_backend(test_queue_options()).await;
  let queue = backend.get_queue("jobs").await.unwrap();
  let err = queue
    .add("tick", json!({}), JobOptions::new().repeat(Repeat::cron("every tuesday")))
    .await
    .unwrap_err();
  assert!(matches!(err, QueueError::InvalidRepeat(_)));
  backend.shutdown(None).await;
}

#[tokio::test]
async fn test_out_of_range_delay_leaves_queue_alive() {
  setup_tracing();
  let (backend, _store) = memory_backend(test_queue_options()).await;
  let queue = backend.get_queue("jobs").await.unwrap();
  let counter = Arc::new(AtomicUsize::new(0));
  queue
    .process("later", 1, counting_processor(counter.clone(), StdDuration::ZERO, true))
    .await
    .unwrap();

  for delay in [10_u64.pow(16), u64::MAX] {
    let options = JobOptions {
      delay: Some(delay),
      ..JobOptions::default()
    };
    let err = queue.add("later", json!({}), options).await.unwrap_err();
    assert!(matches!(err, QueueError::InvalidDelay(d) if d == delay));
  }
  let err = queue
    .add("later", json!({}), JobOptions::new().repeat(Repeat::Every { every_ms: u64::MAX, limit: None }))
    .await
    .unwrap_err();
  assert!(matches!(err, QueueError::InvalidRepeat(_)));

  queue.add("later", json!({}), JobOptions::new()).await.unwrap();
  assert!(wait_for_finished(&queue, 1, 0).await);
  let stats = queue.counts().await.unwrap();
  assert_eq!(stats.delayed + stats.waiting, 0, "rejected jobs were never stored");
  assert!(!queue.is_closed());

  backend.shutdown(None).await;
}

#[tokio::test]
async fn test_closed_queue_rejects_calls() {
  setup_tracing();
  let (backend, _store) = memory_backend(test_queue_options()).await;
  let queue = backend.get_queue("jobs").await.unwrap();
  queue.close(None).await.unwrap();
  queue.close(None).await.unwrap();

  let err = queue.add("late", json!({}), JobOptions::new()).await.unwrap_err();
  assert!(matches!(err, QueueError::Closed(_)));
  backend.shutdown(None).await;
}

#[tokio::test]
async fn test_forced_close_stops_running_processor() {
  setup_tracing();
  let (backend, _store) = memory_backend(test_queue_options()).await;
  let queue = backend.get_queue("jobs").await.unwrap();
  let started = Arc::new(AtomicUsize::new(0));
  let finished = Arc::new(AtomicUsize::new(0));
  let (s, f) = (started.clone(), finished.clone());
  queue
    .process("slow", 1, move |_job: Job| {
      let (s, f) = (s.clone(), f.clone());
      async move {
        s.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(StdDuration::from_millis(300)).await;
        f.fetch_add(1, Ordering::SeqCst);
        Ok::<_, JobError>(Value::Null)
      }
    })
    .await
    .unwrap();
  queue.add("slow", json!({}), JobOptions::new()).await.unwrap();
  assert!(wait_until(StdDuration::from_secs(2), || async { started.load(Ordering::SeqCst) == 1 }).await);

  queue.close_now().await.unwrap();
  tokio::time::sleep(StdDuration::from_millis(600)).await;
  assert_eq!(finished.load(Ordering::SeqCst), 0, "processor must not outlive its queue");

  backend.shutdown(None).await;
}

// --- Registry ---

#[tokio::test]
async fn test_get_queue_returns_the_same_queue() {
  setup_tracing();
  let (backend, _store) = memory_backend(test_queue_options()).await;
  let first = backend.get_queue("jobs").await.unwrap();
  let second = backend.get_queue("jobs").await.unwrap();

  let record = first.add("report", json!({ "n": 1 }), JobOptions::new()).await.unwrap();
  let seen = second.get_job(record.id).await.unwrap().expect("same queue behind both handles");
  assert_eq!(seen.payload, json!({ "n": 1 }));
  second.pause().await.unwrap();
  assert!(first.counts().await.unwrap().paused);

  backend.get_queue("alerts").await.unwrap();
  assert_eq!(backend.queue_names().await, vec!["alerts".to_string(), "jobs".to_string()]);
  assert!(backend.existing_queue("missing").await.is_none());

  backend.shutdown(None).await;
}

#[tokio::test]
async fn test_backends_on_one_store_keep_separate_registries() {
  setup_tracing();
  let (first, store) = memory_backend(test_queue_options()).await;
  let second = QueueBackend::new(test_queue_options());
  let shared: Arc<dyn JobStore> = store.clone();
  assert!(second.initialize_with(shared).await);

  let mine = first.get_queue("jobs").await.unwrap();
  assert!(second.existing_queue("jobs").await.is_none());
  assert!(second.queue_names().await.is_empty());

  let theirs = second.get_queue("jobs").await.unwrap();
  mine.pause().await.unwrap();
  assert!(mine.counts().await.unwrap().paused);
  assert!(!theirs.counts().await.unwrap().paused, "each backend runs its own queue");

  second.shutdown(None).await;
  first.shutdown(None).await;
}

#[tokio::test]
async fn test_backend_shutdown_twice_is_a_no_op() {
  setup_tracing();
  let (backend, _store) = memory_backend(test_queue_options()).await;
  let queue = backend.get_queue("jobs").await.unwrap();
  assert!(backend.is_healthy());

  backend.shutdown(None).await;
  tokio::time::timeout(StdDuration::from_secs(1), backend.shutdown(None))
    .await
    .expect("second shutdown returns at once");

  assert!(!backend.is_healthy());
  assert!(queue.is_closed());
  assert!(matches!(backend.get_queue("jobs").await, Err(BackendError::ShutDown)));
  assert!(backend.queue_names().await.is_empty());
}

#[tokio::test]
async fn test_coordinator_panic_faults_the_backend() {
  setup_tracing();
  let backend = QueueBackend::new(test_queue_options());
  let (fault_tx, mut fault_rx) = tokio::sync::mpsc::unbounded_channel();
  backend.report_faults_to(fault_tx);
  assert!(backend.initialize_with(Arc::new(FaultyStore::new())).await);
  let doomed = backend.get_queue("jobs").await.unwrap();
  let bystander = backend.get_queue("other").await.unwrap();
  doomed.add("report", json!({}), JobOptions::new()).await.unwrap();
  assert!(backend.is_healthy());

  let err = doomed.add(EXPLODING_JOB_TYPE, json!({}), JobOptions::new()).await.unwrap_err();
  assert!(matches!(err, QueueError::Closed(_)));

  let reason = tokio::time::timeout(StdDuration::from_secs(2), fault_rx.recv())
    .await
    .expect("fault reported")
    .expect("fault channel open");
  assert!(reason.contains("queue 'jobs' coordinator"), "unexpected reason: {reason}");
  assert!(backend.is_faulted());
  assert!(!backend.is_healthy());

  bystander.add("report", json!({}), JobOptions::new()).await.unwrap();
  backend.shutdown(Some(StdDuration::from_millis(200))).await;
}
