//! Process-wide `tracing` subscriber setup.

use std::str::FromStr;

use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
  #[default]
  Pretty,
  Json,
}

impl FromStr for LogFormat {
  type Err = String;

  fn from_str(value: &str) -> Result<Self, Self::Err> {
    match value.trim().to_lowercase().as_str() {
      "pretty" | "text" | "human" => Ok(LogFormat::Pretty),
      "json" => Ok(LogFormat::Json),
      other => Err(format!("expected 'pretty' or 'json', got '{other}'")),
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingConfig {
  /// Filter directive used when `RUST_LOG` is not set, e.g. `info` or `warn,jobbridge=debug`.
  pub level: String,
  pub format: LogFormat,
}

impl Default for LoggingConfig {
  fn default() -> Self {
    Self {
      level: "info".to_string(),
      format: LogFormat::Pretty,
    }
  }
}

/// Installs the global subscriber. Returns `false` if one was already installed.
pub fn init(config: &LoggingConfig) -> bool {
  let filter = EnvFilter::try_from_default_env()
    .or_else(|_| EnvFilter::try_new(&config.level))
    .unwrap_or_else(|_| EnvFilter::new("info"));

  let installed = match config.format {
    LogFormat::Json => tracing_subscriber::fmt()
      .json()
      .with_current_span(true)
      .with_ansi(false)
      .with_env_filter(filter)
      .try_init(),
    LogFormat::Pretty => tracing_subscriber::fmt()
      .with_target(true)
      .with_env_filter(filter)
      .try_init(),
  };
  installed.is_ok()
}
