//! HTTP control surface: health, stats, and thin job/queue operations over the
//! [`JobDispatcher`].

use crate::dispatch::{BulkJob, JobDispatcher, JobType};
use crate::error::{DispatchError, QueueError};
use crate::health::{HealthReporter, HealthStatus};
use crate::job::{JobId, JobOptions};
use crate::lifecycle::WorkerState;

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{info, warn};

/// Uniform body of every `/api` response.
#[derive(Debug, Serialize)]
pub struct ApiResponse<T: Serialize> {
  pub success: bool,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub data: Option<T>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
  pub fn ok(data: T) -> Self {
    Self {
      success: true,
      data: Some(data),
      error: None,
    }
  }
}

impl ApiResponse<()> {
  pub fn failure(error: impl Into<String>) -> Self {
    Self {
      success: false,
      data: None,
      error: Some(error.into()),
    }
  }
}

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct ControlState {
  pub dispatcher: JobDispatcher,
  pub health: HealthReporter,
  pub worker_state: watch::Receiver<WorkerState>,
}

#[derive(Debug, Deserialize)]
pub struct EnqueueRequest {
  #[serde(rename = "type")]
  pub job_type: String,
  #[serde(default)]
  pub payload: Value,
  #[serde(default)]
  pub options: JobOptions,
  /// Target queue. Without it the job type must be a known [`JobType`] and goes to its own queue.
  #[serde(default)]
  pub queue: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct BulkRequest {
  pub jobs: Vec<BulkJob>,
}

#[derive(Debug, Deserialize)]
pub struct QueueRequest {
  pub queue: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CleanRequest {
  /// Without a queue every created queue is cleaned.
  #[serde(default)]
  pub queue: Option<String>,
  pub older_than_ms: u64,
}

#[derive(Debug, Deserialize)]
pub struct StatusQuery {
  #[serde(default)]
  pub queue: Option<String>,
}

pub fn router(state: ControlState) -> Router {
  Router::new()
    .route("/health", get(health))
    .route("/api/stats", get(stats))
    .route("/api/jobs", post(enqueue))
    .route("/api/jobs/bulk", post(enqueue_bulk))
    .route("/api/jobs/:id/status", get(job_status))
    .route("/api/queue/pause", post(pause_queue))
    .route("/api/queue/resume", post(resume_queue))
    .route("/api/queue/clean", post(clean_queue))
    .with_state(state)
}

/// A bound, not yet serving, control server.
pub struct ControlServer {
  listener: TcpListener,
  router: Router,
  local_addr: SocketAddr,
}

impl ControlServer {
  /// Binds `addr`. Port `0` picks a free port; see [`ControlServer::local_addr`].
  pub async fn bind(addr: SocketAddr, state: ControlState) -> io::Result<Self> {
    let listener = TcpListener::bind(addr).await?;
    let local_addr = listener.local_addr()?;
    Ok(Self {
      listener,
      router: router(state),
      local_addr,
    })
  }

  pub fn local_addr(&self) -> SocketAddr {
    self.local_addr
  }

  /// Serves until `shutdown` turns `true`, then drains in-flight requests.
  pub async fn serve(self, mut shutdown: watch::Receiver<bool>) -> io::Result<()> {
    info!(addr = %self.local_addr, "Control server listening.");
    axum::serve(self.listener, self.router)
      .with_graceful_shutdown(async move {
        let _ = shutdown.wait_for(|stop| *stop).await;
      })
      .await?;
    info!(addr = %self.local_addr, "Control server stopped.");
    Ok(())
  }
}

// --- Handlers ---

async fn health(State(state): State<ControlState>) -> Response {
  let worker_state = *state.worker_state.borrow();
  let snapshot = state.health.snapshot(worker_state).await;
  let status = if snapshot.status == HealthStatus::Unhealthy {
    StatusCode::SERVICE_UNAVAILABLE
  } else {
    StatusCode::OK
  };
  (status, Json(snapshot)).into_response()
}

async fn stats(State(state): State<ControlState>) -> Response {
  let queues = state.dispatcher.all_queue_stats().await;
  let healthy = state.dispatcher.backend().is_healthy();
  Json(ApiResponse::ok(json!({ "backendHealthy": healthy, "queues": queues }))).into_response()
}

async fn enqueue(State(state): State<ControlState>, Json(request): Json<EnqueueRequest>) -> Response {
  let outcome = match &request.queue {
    Some(queue) => {
      state
        .dispatcher
        .add_job(queue, &request.job_type, request.payload, request.options)
        .await
    }
    None => match request.job_type.parse::<JobType>() {
      Ok(job_type) => {
        state
          .dispatcher
          .enqueue(job_type, request.payload, request.options)
          .await
      }
      Err(e) => Err(e),
    },
  };
  match outcome {
    Ok(job_id) => (StatusCode::CREATED, Json(ApiResponse::ok(json!({ "jobId": job_id })))).into_response(),
    Err(e) => dispatch_error_response(e),
  }
}

async fn enqueue_bulk(State(state): State<ControlState>, Json(request): Json<BulkRequest>) -> Response {
  let summary = state.dispatcher.add_bulk(request.jobs).await;
  Json(ApiResponse::ok(summary)).into_response()
}

async fn job_status(
  State(state): State<ControlState>,
  Path(id): Path<String>,
  Query(query): Query<StatusQuery>,
) -> Response {
  let Ok(job_id) = id.parse::<JobId>() else {
    return json_failure(StatusCode::BAD_REQUEST, format!("'{id}' is not a job id"));
  };
  let record = match &query.queue {
    Some(queue) => state.dispatcher.get_job_status(queue, job_id).await,
    None => state.dispatcher.find_job(job_id).await,
  };
  match record {
    Ok(record) => Json(ApiResponse::ok(record)).into_response(),
    Err(e) => dispatch_error_response(e),
  }
}

async fn pause_queue(State(state): State<ControlState>, Json(request): Json<QueueRequest>) -> Response {
  match state.dispatcher.pause_queue(&request.queue).await {
    Ok(()) => Json(ApiResponse::ok(json!({ "queue": request.queue, "paused": true }))).into_response(),
    Err(e) => dispatch_error_response(e),
  }
}

async fn resume_queue(State(state): State<ControlState>, Json(request): Json<QueueRequest>) -> Response {
  match state.dispatcher.resume_queue(&request.queue).await {
    Ok(()) => Json(ApiResponse::ok(json!({ "queue": request.queue, "paused": false }))).into_response(),
    Err(e) => dispatch_error_response(e),
  }
}

async fn clean_queue(State(state): State<ControlState>, Json(request): Json<CleanRequest>) -> Response {
  let older_than = Duration::from_millis(request.older_than_ms);
  let removed = match &request.queue {
    Some(queue) => match state.dispatcher.clean_queue(queue, older_than).await {
      Ok(removed) => removed,
      Err(e) => return dispatch_error_response(e),
    },
    None => state.dispatcher.clean_all(older_than).await,
  };
  Json(ApiResponse::ok(json!({ "removed": removed }))).into_response()
}

// --- Error Mapping ---

fn dispatch_error_response(err: DispatchError) -> Response {
  let status = match &err {
    e if e.is_unavailable() => StatusCode::SERVICE_UNAVAILABLE,
    DispatchError::QueueNotFound(_) | DispatchError::JobNotFound { .. } => StatusCode::NOT_FOUND,
    DispatchError::UnknownJobType(_)
    | DispatchError::Queue(QueueError::InvalidRepeat(_))
    | DispatchError::Queue(QueueError::InvalidDelay(_)) => StatusCode::BAD_REQUEST,
    DispatchError::Queue(QueueError::Closed(_)) => StatusCode::SERVICE_UNAVAILABLE,
    _ => StatusCode::INTERNAL_SERVER_ERROR,
  };
  if status.is_server_error() {
    warn!(status = status.as_u16(), error = %err, "Control request failed.");
  }
  json_failure(status, err.to_string())
}

fn json_failure(status: StatusCode, error: impl Into<String>) -> Response {
  (status, Json(ApiResponse::failure(error))).into_response()
}
