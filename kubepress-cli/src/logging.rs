//! Logging setup
//!
//! Human-readable events go to stderr so they never mix with command
//! output. A JSON file layer is added when a log directory is configured.

use std::io;
use std::path::PathBuf;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::{non_blocking, rolling};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    /// Filter used when `RUST_LOG` is unset
    pub level: String,
    pub log_dir: Option<PathBuf>,
}

impl LoggingConfig {
    /// `--verbose` raises the configured level to debug
    pub fn new(level: &str, verbose: bool, log_dir: Option<PathBuf>) -> Self {
        let level = if verbose { "debug" } else { level };
        Self {
            level: level.to_string(),
            log_dir,
        }
    }

    /// Install the global subscriber. Keep the returned guard alive until
    /// exit or buffered file events are lost.
    pub fn init(&self) -> anyhow::Result<Option<WorkerGuard>> {
        let env_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&self.level));

        let console_layer = fmt::layer()
            .with_target(false)
            .with_level(true)
            .with_writer(io::stderr);

        let registry = tracing_subscriber::registry()
            .with(env_filter)
            .with(console_layer);

        let Some(dir) = &self.log_dir else {
            registry.try_init()?;
            return Ok(None);
        };

        std::fs::create_dir_all(dir)?;
        let (writer, guard) = non_blocking(rolling::daily(dir, "kubepress.log"));
        let file_layer = fmt::layer()
            .with_target(true)
            .with_thread_ids(true)
            .with_ansi(false)
            .json()
            .with_writer(writer);
        registry.with(file_layer).try_init()?;

        tracing::debug!(dir = %dir.display(), "File logging enabled");
        Ok(Some(guard))
    }
}
