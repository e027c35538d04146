//! HTTP client to the primary web service.
//!
//! Every call resolves to a [`ChannelReply`] or a classified [`ChannelError`];
//! `reqwest` errors never cross this module's boundary.

use crate::error::ChannelError;
use crate::job::JobId;

use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::{Client, Method};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct ChannelConfig {
  pub base_url: String,
  /// Sent as a bearer credential when set.
  pub token: Option<String>,
  pub timeout: Duration,
}

/// Successful answer from the primary service.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelReply {
  pub status: u16,
  /// Decoded JSON body; a non-JSON body is kept as a string, an empty one is `null`.
  pub data: Value,
}

/// Payload of the worker registration call.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerRegistration {
  pub name: String,
  pub version: String,
  #[serde(rename = "type")]
  pub kind: String,
  pub capabilities: Vec<String>,
  pub pid: u32,
  pub start_time: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct OutboundChannel {
  client: Client,
  base_url: String,
  token: Option<String>,
}

impl OutboundChannel {
  pub fn new(config: ChannelConfig) -> Result<Self, ChannelError> {
    let client = Client::builder()
      .timeout(config.timeout)
      .build()
      .map_err(|e| ChannelError::Request(e.to_string()))?;
    Ok(Self {
      client,
      base_url: config.base_url.trim_end_matches('/').to_string(),
      token: config.token,
    })
  }

  pub fn base_url(&self) -> &str {
    &self.base_url
  }

  // --- Generic verbs ---

  pub async fn get(&self, path: &str) -> Result<ChannelReply, ChannelError> {
    self.request(Method::GET, path, None).await
  }

  pub async fn post(&self, path: &str, body: &Value) -> Result<ChannelReply, ChannelError> {
    self.request(Method::POST, path, Some(body)).await
  }

  pub async fn put(&self, path: &str, body: &Value) -> Result<ChannelReply, ChannelError> {
    self.request(Method::PUT, path, Some(body)).await
  }

  pub async fn delete(&self, path: &str) -> Result<ChannelReply, ChannelError> {
    self.request(Method::DELETE, path, None).await
  }

  async fn request(
    &self,
    method: Method,
    path: &str,
    body: Option<&Value>,
  ) -> Result<ChannelReply, ChannelError> {
    let url = format!("{}{}", self.base_url, path);
    let mut request = self.client.request(method.clone(), &url);
    if let Some(token) = &self.token {
      request = request.bearer_auth(token);
    }
    #[cfg(feature = "job_context")]
    if let Some(context) = crate::job::context::try_get_current_job_context() {
      request = request.header("x-job-id", context.job_id.to_string());
    }
    if let Some(body) = body {
      request = request.json(body);
    }

    let response = request.send().await.map_err(|e| classify(&url, e))?;
    let status = response.status().as_u16();
    let text = response
      .text()
      .await
      .map_err(|e| ChannelError::Decode(e.to_string()))?;
    debug!(%method, %url, status, "Primary service answered.");

    if !(200..300).contains(&status) {
      return Err(ChannelError::Status { status, body: text });
    }
    let data = if text.trim().is_empty() {
      Value::Null
    } else {
      serde_json::from_str(&text).unwrap_or(Value::String(text))
    };
    Ok(ChannelReply { status, data })
  }

  // --- Domain calls ---

  pub async fn register_worker(&self, registration: &WorkerRegistration) -> Result<ChannelReply, ChannelError> {
    let body = serde_json::to_value(registration).map_err(|e| ChannelError::Decode(e.to_string()))?;
    let reply = self.post("/api/workers/register", &body).await?;
    info!(worker = %registration.name, "Registered with primary service.");
    Ok(reply)
  }

  /// Pushes `{status, ...details}`; `details` must serialize to an object.
  pub async fn send_status<T: Serialize>(&self, status: &str, details: &T) -> Result<ChannelReply, ChannelError> {
    let mut body = serde_json::to_value(details).map_err(|e| ChannelError::Decode(e.to_string()))?;
    match body.as_object_mut() {
      Some(fields) => {
        fields.insert("status".to_string(), Value::String(status.to_string()));
      }
      None => body = json!({ "status": status, "details": body }),
    }
    self.post("/api/workers/status", &body).await
  }

  pub async fn relay_message_event(&self, event: &Value) -> Result<ChannelReply, ChannelError> {
    self.post("/api/workers/messages", event).await
  }

  pub async fn relay_job_result(
    &self,
    job_id: JobId,
    job_type: &str,
    result: &Value,
  ) -> Result<ChannelReply, ChannelError> {
    let body = json!({ "jobId": job_id, "type": job_type, "result": result });
    self.post("/api/workers/results", &body).await
  }

  /// Asks the primary service to enqueue a job on its side.
  pub async fn request_remote_job(&self, job_type: &str, payload: &Value) -> Result<ChannelReply, ChannelError> {
    let body = json!({ "type": job_type, "payload": payload });
    self.post("/api/jobs", &body).await
  }

  pub async fn request_data_sync(&self, request: &Value) -> Result<ChannelReply, ChannelError> {
    self.post("/api/sync", request).await
  }

  pub async fn health_check(&self) -> Result<ChannelReply, ChannelError> {
    self.get("/health").await
  }

  /// Advisory reachability probe.
  pub async fn test_connection(&self) -> bool {
    match self.health_check().await {
      Ok(_) => true,
      Err(e) => {
        warn!(url = %self.base_url, error = %e, "Primary service unreachable.");
        false
      }
    }
  }
}

fn classify(url: &str, err: reqwest::Error) -> ChannelError {
  if err.is_timeout() {
    ChannelError::Timeout {
      url: url.to_string(),
    }
  } else if err.is_connect() {
    ChannelError::Connect {
      url: url.to_string(),
      message: err.to_string(),
    }
  } else {
    ChannelError::Request(err.to_string())
  }
}
