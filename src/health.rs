use crate::chat::{ChatClient, ChatStatus};
use crate::diagnostics::{memory_stats, MemoryStats};
use crate::dispatch::JobDispatcher;
use crate::lifecycle::WorkerState;
use crate::metrics::MetricsSnapshot;
use crate::queue::QueueStats;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
  Healthy,
  /// Running, but the chat link is down.
  Degraded,
  Unhealthy,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatHealth {
  pub status: ChatStatus,
  pub connected: bool,
  pub reconnect_attempts: u32,
}

/// Aggregated worker health, as pushed by the heartbeat and served on `/health`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthSnapshot {
  pub status: HealthStatus,
  pub state: WorkerState,
  pub worker: String,
  pub version: &'static str,
  pub started_at: DateTime<Utc>,
  pub uptime_secs: u64,
  pub queue_backend_healthy: bool,
  pub chat: ChatHealth,
  pub queues: BTreeMap<String, QueueStats>,
  pub failed_jobs: usize,
  pub metrics: MetricsSnapshot,
  pub memory: MemoryStats,
}

/// Builds [`HealthSnapshot`]s from the live components.
#[derive(Clone)]
pub struct HealthReporter {
  worker: String,
  dispatcher: JobDispatcher,
  chat: Arc<dyn ChatClient>,
  started_at: DateTime<Utc>,
  started: Instant,
}

impl HealthReporter {
  pub fn new(worker: impl Into<String>, dispatcher: JobDispatcher, chat: Arc<dyn ChatClient>) -> Self {
    Self {
      worker: worker.into(),
      dispatcher,
      chat,
      started_at: Utc::now(),
      started: Instant::now(),
    }
  }

  pub fn started_at(&self) -> DateTime<Utc> {
    self.started_at
  }

  pub fn uptime_secs(&self) -> u64 {
    self.started.elapsed().as_secs()
  }

  pub async fn snapshot(&self, state: WorkerState) -> HealthSnapshot {
    let queues = self.dispatcher.all_queue_stats().await;
    let failed_jobs = queues.values().map(|stats| stats.failed).sum();
    let metrics = self
      .dispatcher
      .backend()
      .queues()
      .await
      .iter()
      .fold(MetricsSnapshot::default(), |total, queue| total.merge(&queue.metrics()));
    let queue_backend_healthy = self.dispatcher.backend().is_healthy();
    let chat = ChatHealth {
      status: self.chat.status(),
      connected: self.chat.is_connected(),
      reconnect_attempts: self.chat.reconnect_attempts(),
    };

    let status = if !queue_backend_healthy || state != WorkerState::Running {
      HealthStatus::Unhealthy
    } else if !chat.connected {
      HealthStatus::Degraded
    } else {
      HealthStatus::Healthy
    };

    HealthSnapshot {
      status,
      state,
      worker: self.worker.clone(),
      version: env!("CARGO_PKG_VERSION"),
      started_at: self.started_at,
      uptime_secs: self.uptime_secs(),
      queue_backend_healthy,
      chat,
      queues,
      failed_jobs,
      metrics,
      memory: memory_stats(),
    }
  }
}
