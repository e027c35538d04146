//! Worker configuration, read from environment variables.
//!
//! Every variable is optional. A missing value takes its default; a value that is
//! present but does not parse is a [`ConfigError`], never silently replaced.

use crate::channel::ChannelConfig;
use crate::chat::ChatSessionConfig;
use crate::error::ConfigError;
use crate::job::{Backoff, JobOptions};
use crate::logging::{LogFormat, LoggingConfig};
use crate::queue::QueueOptions;
use crate::store::StoreConfig;

use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Everything the worker process needs to start.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
  pub worker_name: String,
  pub channel: ChannelConfig,
  pub control_addr: SocketAddr,
  pub store: StoreConfig,
  pub store_connect_timeout: Duration,
  pub queue: QueueOptions,
  pub heartbeat_interval: Duration,
  pub cleanup_interval: Duration,
  pub cleanup_retention: Duration,
  pub memory_check_interval: Duration,
  pub memory_warn_mb: u64,
  pub emergency_timeout: Duration,
  pub chat: ChatSessionConfig,
  pub logging: LoggingConfig,
}

impl WorkerConfig {
  /// Reads the configuration from the process environment.
  ///
  /// # Defaults
  ///
  /// - `WORKER_NAME` defaults to `"jobbridge-worker"`.
  /// - `PRIMARY_SERVICE_URL` defaults to `"http://127.0.0.1:3000"`.
  /// - `CONTROL_HOST`/`CONTROL_PORT` default to `0.0.0.0:8090`.
  /// - `STORE_BACKEND` defaults to `sled`, at `STORE_PATH` (`./data/jobs`).
  /// - `QUEUE_CONCURRENCY` defaults to `5`, `JOB_ATTEMPTS` to `3`, `JOB_BACKOFF_MS` to `2000`.
  pub fn from_env() -> Result<Self, ConfigError> {
    Self::from_lookup(|key| env::var(key).ok())
  }

  /// Reads the configuration through `lookup`, which maps a variable name to its value.
  pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
  where
    F: Fn(&str) -> Option<String>,
  {
    let vars = Vars { lookup };

    let host = vars.string("CONTROL_HOST", "0.0.0.0");
    let port: u16 = vars.parse("CONTROL_PORT", 8090)?;
    let control_addr = format!("{host}:{port}")
      .parse::<SocketAddr>()
      .map_err(|e| invalid("CONTROL_HOST", &host, e))?;

    let store_path = PathBuf::from(vars.string("STORE_PATH", "./data/jobs"));
    let store = match vars.string("STORE_BACKEND", "sled").to_lowercase().as_str() {
      "sled" => StoreConfig::Sled {
        path: store_path,
        cache_capacity: None,
      },
      "memory" => StoreConfig::Memory,
      other => {
        return Err(invalid(
          "STORE_BACKEND",
          other,
          "expected 'sled' or 'memory'",
        ))
      }
    };

    let concurrency: usize = vars.parse("QUEUE_CONCURRENCY", 5)?;
    if concurrency == 0 {
      return Err(invalid("QUEUE_CONCURRENCY", "0", "must be greater than zero"));
    }
    let attempts: u32 = vars.parse("JOB_ATTEMPTS", 3)?;
    if attempts == 0 {
      return Err(invalid("JOB_ATTEMPTS", "0", "must be greater than zero"));
    }
    let queue = QueueOptions {
      default_job_options: JobOptions::new()
        .attempts(attempts)
        .backoff(Backoff::exponential(vars.millis("JOB_BACKOFF_MS", 2000)?)),
      concurrency,
      keep_completed: Some(vars.parse("KEEP_COMPLETED", 100)?),
      keep_failed: Some(vars.parse("KEEP_FAILED", 500)?),
      op_timeout: vars.millis("QUEUE_OP_TIMEOUT_MS", 5000)?,
      ..QueueOptions::default()
    };

    let format_raw = vars.string("LOG_FORMAT", "pretty");
    let format = LogFormat::from_str(&format_raw).map_err(|reason| invalid("LOG_FORMAT", &format_raw, reason))?;

    Ok(Self {
      worker_name: vars.string("WORKER_NAME", "jobbridge-worker"),
      channel: ChannelConfig {
        base_url: vars.string("PRIMARY_SERVICE_URL", "http://127.0.0.1:3000"),
        token: vars.optional("PRIMARY_SERVICE_TOKEN"),
        timeout: vars.millis("HTTP_TIMEOUT_MS", 10_000)?,
      },
      control_addr,
      store,
      store_connect_timeout: vars.millis("STORE_CONNECT_TIMEOUT_MS", 5000)?,
      queue,
      heartbeat_interval: vars.secs("HEARTBEAT_INTERVAL_SECS", 30)?,
      cleanup_interval: vars.secs("CLEANUP_INTERVAL_SECS", 3600)?,
      cleanup_retention: vars.secs("CLEANUP_RETENTION_SECS", 86_400)?,
      memory_check_interval: vars.secs("MEMORY_CHECK_INTERVAL_SECS", 300)?,
      memory_warn_mb: vars.parse("MEMORY_WARN_MB", 500)?,
      emergency_timeout: vars.millis("EMERGENCY_TIMEOUT_MS", 5000)?,
      chat: ChatSessionConfig {
        reconnect_attempts: vars.parse("CHAT_RECONNECT_ATTEMPTS", 5)?,
        reconnect_delay: vars.millis("CHAT_RECONNECT_DELAY_MS", 5000)?,
        ..ChatSessionConfig::default()
      },
      logging: LoggingConfig {
        level: vars.string("LOG_LEVEL", "info"),
        format,
      },
    })
  }
}

struct Vars<F> {
  lookup: F,
}

impl<F> Vars<F>
where
  F: Fn(&str) -> Option<String>,
{
  /// Non-empty, trimmed value of `key`.
  fn optional(&self, key: &str) -> Option<String> {
    (self.lookup)(key)
      .map(|value| value.trim().to_string())
      .filter(|value| !value.is_empty())
  }

  fn string(&self, key: &str, default: &str) -> String {
    self.optional(key).unwrap_or_else(|| default.to_string())
  }

  fn parse<T>(&self, key: &'static str, default: T) -> Result<T, ConfigError>
  where
    T: FromStr,
    T::Err: std::fmt::Display,
  {
    match self.optional(key) {
      Some(raw) => raw.parse().map_err(|e| invalid(key, &raw, e)),
      None => Ok(default),
    }
  }

  fn millis(&self, key: &'static str, default: u64) -> Result<Duration, ConfigError> {
    self.parse(key, default).map(Duration::from_millis)
  }

  fn secs(&self, key: &'static str, default: u64) -> Result<Duration, ConfigError> {
    self.parse(key, default).map(Duration::from_secs)
  }
}

fn invalid(key: &'static str, value: &str, reason: impl std::fmt::Display) -> ConfigError {
  ConfigError::Invalid {
    key,
    value: value.to_string(),
    reason: reason.to_string(),
  }
}
