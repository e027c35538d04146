//! tests/channel.rs
//! Outbound HTTP channel against an in-process primary service.

mod common;
use crate::common::{memory_backend, setup_tracing, test_queue_options, wait_for_finished, MockPrimary};
use jobbridge::{ChannelConfig, ChannelError, Job, JobError, JobOptions, OutboundChannel};
use serde_json::json;
use std::time::Duration as StdDuration;

fn channel_to(base_url: &str, token: Option<&str>) -> OutboundChannel {
  OutboundChannel::new(ChannelConfig {
    base_url: format!("{base_url}/"),
    token: token.map(str::to_string),
    timeout: StdDuration::from_secs(2),
  })
  .unwrap()
}

#[tokio::test]
async fn test_post_sends_json_and_bearer_token() {
  setup_tracing();
  let primary = MockPrimary::spawn().await;
  let channel = channel_to(&primary.base_url, Some("s3cret"));

  let reply = channel
    .relay_message_event(&json!({ "messageId": "m-1", "text": "hello" }))
    .await
    .unwrap();
  assert_eq!(reply.status, 200);
  assert_eq!(reply.data, json!({ "ok": true }));

  let recorded = primary.requests_to("/api/workers/messages");
  assert_eq!(recorded.len(), 1);
  assert_eq!(recorded[0].method, "POST");
  assert_eq!(recorded[0].body["text"], "hello");
  assert_eq!(recorded[0].authorization.as_deref(), Some("Bearer s3cret"));
  assert!(recorded[0].job_id_header.is_none(), "no job context outside a processor");
}

#[tokio::test]
async fn test_generic_verbs_and_remote_job_requests() {
  setup_tracing();
  let primary = MockPrimary::spawn().await;
  let channel = channel_to(&primary.base_url, Some("s3cret"));

  let reply = channel.put("/api/workers/settings", &json!({ "paused": true })).await.unwrap();
  assert_eq!(reply.status, 200);
  let reply = channel.delete("/api/workers/bridge-1").await.unwrap();
  assert_eq!(reply.status, 200);
  channel
    .request_remote_job("send-email", &json!({ "to": "ops@example.com" }))
    .await
    .unwrap();

  let recorded = primary.requests();
  assert_eq!(recorded.len(), 3);
  assert_eq!((recorded[0].method.as_str(), recorded[0].path.as_str()), ("PUT", "/api/workers/settings"));
  assert_eq!(recorded[0].body, json!({ "paused": true }));
  assert_eq!((recorded[1].method.as_str(), recorded[1].path.as_str()), ("DELETE", "/api/workers/bridge-1"));
  assert_eq!(recorded[1].body, serde_json::Value::Null);
  assert_eq!((recorded[2].method.as_str(), recorded[2].path.as_str()), ("POST", "/api/jobs"));
  assert_eq!(
    recorded[2].body,
    json!({ "type": "send-email", "payload": { "to": "ops@example.com" } })
  );
  assert!(recorded.iter().all(|r| r.authorization.as_deref() == Some("Bearer s3cret")));

  primary.respond_with(500);
  let err = channel.delete("/api/workers/bridge-1").await.unwrap_err();
  assert_eq!(err.status(), Some(500));
}

#[tokio::test]
async fn test_status_details_are_merged_into_body() {
  setup_tracing();
  let primary = MockPrimary::spawn().await;
  let channel = channel_to(&primary.base_url, None);

  channel
    .send_status("running", &json!({ "uptimeSecs": 12 }))
    .await
    .unwrap();
  channel.send_status("stopping", &json!(["not", "an", "object"])).await.unwrap();

  let recorded = primary.requests_to("/api/workers/status");
  assert_eq!(recorded.len(), 2);
  assert_eq!(recorded[0].body, json!({ "status": "running", "uptimeSecs": 12 }));
  assert_eq!(recorded[1].body["status"], "stopping");
  assert_eq!(recorded[1].body["details"], json!(["not", "an", "object"]));
  assert!(recorded[0].authorization.is_none());
}

#[tokio::test]
async fn test_error_statuses_are_classified() {
  setup_tracing();
  let primary = MockPrimary::spawn().await;
  let channel = channel_to(&primary.base_url, None);

  primary.respond_with(422);
  let err = channel.post("/api/webhooks", &json!({})).await.unwrap_err();
  assert_eq!(err.status(), Some(422));
  let job_error: JobError = err.into();
  assert!(!job_error.retryable, "client errors are not retried");

  primary.respond_with(503);
  let err = channel.get("/health").await.unwrap_err();
  assert!(matches!(err, ChannelError::Status { status: 503, .. }));
  let job_error: JobError = err.into();
  assert!(job_error.retryable);
  assert!(!channel.test_connection().await);

  primary.respond_with(200);
  assert!(channel.test_connection().await);
}

#[tokio::test]
async fn test_unreachable_service_is_a_connect_error() {
  setup_tracing();
  let addr = {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap()
  };
  let channel = channel_to(&format!("http://{addr}"), None);

  let err = channel.get("/health").await.unwrap_err();
  assert!(matches!(err, ChannelError::Connect { .. }), "got {err:?}");
  assert!(err.status().is_none());
}

#[tokio::test]
async fn test_job_id_header_is_sent_from_inside_a_processor() {
  setup_tracing();
  let primary = MockPrimary::spawn().await;
  let channel = channel_to(&primary.base_url, None);
  let (backend, _store) = memory_backend(test_queue_options()).await;
  let queue = backend.get_queue("webhooks").await.unwrap();

  queue
    .process("webhook-relay", 1, move |job: Job| {
      let channel = channel.clone();
      async move {
        let context = jobbridge::job_context!();
        if context.job_id != job.id || context.queue != "webhooks" || context.attempt != 1 {
          return Err(JobError::fatal("job context does not match the running job"));
        }
        let reply = channel.post("/api/webhooks", &job.payload).await?;
        Ok::<_, JobError>(json!({ "status": reply.status }))
      }
    })
    .await
    .unwrap();

  let record = queue
    .add("webhook-relay", json!({ "event": "ping" }), JobOptions::new())
    .await
    .unwrap();
  assert!(wait_for_finished(&queue, 1, 0).await);

  let recorded = primary.requests_to("/api/webhooks");
  assert_eq!(recorded.len(), 1);
  assert_eq!(recorded[0].job_id_header, Some(record.id.to_string()));
  assert_eq!(recorded[0].body, json!({ "event": "ping" }));

  backend.shutdown(None).await;
}
