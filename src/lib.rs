//! JobBridge: a durable background job queue and worker lifecycle controller.
//!
//! JobBridge sits between a chat-bot client and a primary web service. Inbound chat
//! events and HTTP requests become typed jobs on named queues; registered processors
//! run them with bounded concurrency, retries and backoff; results are relayed back
//! to the primary service over HTTP.
//!
//! # Features
//!
//! - Named queues backed by a durable [`JobStore`] (`sled`, or in-memory), with
//!   priorities, delays, fixed or exponential backoff, and cron or interval repeats.
//! - One processor per (queue, job type) pair, each with its own concurrency budget.
//! - Synchronous event observers (`waiting`, `active`, `progress`, `completed`,
//!   `failed`, `stalled`, `error`) returning cancellation handles.
//! - Recovery on open: jobs left `active` by a dead process are re-queued as stalled.
//! - Fail-fast enqueue while the store is down, and bounded queue calls throughout.
//! - A [`WorkerController`] that starts every subsystem in order, runs heartbeat,
//!   maintenance and memory-watch tasks, and shuts down gracefully or under an
//!   emergency deadline.
//! - An HTTP control surface (`/health`, `/api/stats`, `/api/jobs`, `/api/queue/*`).
//! - Optional task-local job context (`JobContext`) inside processors (requires the
//!   `job_context` feature, on by default).
//!
//! # Usage
//!
//! ```no_run
//! use jobbridge::{JobOptions, MemoryStore, QueueBackend, QueueOptions, JobDispatcher, JobType};
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let backend = Arc::new(QueueBackend::new(QueueOptions::default()));
//!     if !backend.initialize_with(Arc::new(MemoryStore::new())).await {
//!         return Err("store unavailable".into());
//!     }
//!     let dispatcher = JobDispatcher::new(backend.clone());
//!
//!     dispatcher
//!         .process(JobType::MessageRelay, Some(2), |job| async move {
//!             println!("relaying {}", job.payload);
//!             Ok(json!({ "relayed": true }))
//!         })
//!         .await?;
//!
//!     let job_id = dispatcher
//!         .add_message_relay(json!({ "text": "hello" }), JobOptions::new())
//!         .await?;
//!     println!("queued {job_id}");
//!
//!     backend.shutdown(None).await;
//!     Ok(())
//! }
//! ```

pub mod backend;
pub mod channel;
pub mod chat;
mod command;
pub mod config;
mod coordinator;
pub mod diagnostics;
pub mod dispatch;
pub mod error;
pub mod events;
pub mod health;
pub mod job;
pub mod lifecycle;
pub mod logging;
pub mod metrics;
pub mod processors;
pub mod queue;
pub mod server;
pub mod store;
mod worker;

// --- Public Re-exports ---

// Queueing
pub use backend::QueueBackend;
pub use dispatch::{BulkEnqueueSummary, BulkJob, JobDispatcher, JobType};
pub use queue::{FaultHook, QueueHandle, QueueOptions, QueueStats};
pub use store::{ConnectionState, JobStore, MemoryStore, SledStore, StoreConfig};

// Jobs
pub use job::{Backoff, Job, JobId, JobOptions, JobPriority, JobRecord, JobState, Repeat};
#[cfg(feature = "job_context")]
pub use job::context::{try_get_current_job_context, JobContext};

// Events & metrics
pub use events::{log_event, EventBus, ObserverHandle, QueueEvent, QueueEventKind};
pub use metrics::{MetricsSnapshot, QueueMetrics};

// Worker process
pub use channel::{ChannelConfig, ChannelReply, OutboundChannel};
pub use chat::{ChatClient, ChatEvent, ChatSession, ChatSessionConfig, ChatStatus, ChatTransport, OfflineTransport};
pub use config::WorkerConfig;
pub use health::{HealthReporter, HealthSnapshot, HealthStatus};
pub use lifecycle::{EmergencyOutcome, RunOutcome, WorkerController, WorkerState};
pub use server::{ApiResponse, ControlServer, ControlState};

// Errors
pub use error::{
  BackendError, ChannelError, ChatError, ConfigError, DispatchError, JobError, LifecycleError, QueueError,
  StoreError,
};
