use jobbridge::chat::{ChatSession, OfflineTransport};
use jobbridge::{logging, EmergencyOutcome, RunOutcome, WorkerConfig, WorkerController};

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use tracing::{error, info};

#[tokio::main]
async fn main() -> ExitCode {
  match run().await {
    Ok(code) => code,
    Err(e) => {
      error!(error = format!("{e:#}"), "Worker failed.");
      eprintln!("jobbridge-worker: {e:#}");
      ExitCode::FAILURE
    }
  }
}

async fn run() -> anyhow::Result<ExitCode> {
  let config = WorkerConfig::from_env().context("invalid configuration")?;
  logging::init(&config.logging);
  info!(worker = %config.worker_name, version = env!("CARGO_PKG_VERSION"), "Starting worker.");

  let chat = Arc::new(ChatSession::new(OfflineTransport, config.chat.clone()));
  let controller = WorkerController::new(config, chat).context("failed to build worker")?;
  controller.initialize().await.context("worker startup failed")?;

  match controller.run().await {
    RunOutcome::Signal => {
      info!("Worker exited cleanly.");
      Ok(ExitCode::SUCCESS)
    }
    RunOutcome::Emergency {
      reason,
      outcome: EmergencyOutcome::TimedOut,
    } => {
      error!(%reason, "Emergency shutdown timed out. Forcing exit.");
      std::process::exit(1);
    }
    RunOutcome::Emergency { reason, .. } => {
      error!(%reason, "Worker exited after emergency shutdown.");
      Ok(ExitCode::FAILURE)
    }
  }
}
