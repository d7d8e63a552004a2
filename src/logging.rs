//! Tracing setup: console output plus optional daily rotating log files.

use std::path::PathBuf;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use crate::error::{EngineError, Result};

#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Directory for rotating log files; console only when unset
    pub dir: Option<PathBuf>,
    pub file_prefix: String,
    /// Filter used when `RUST_LOG` is not set
    pub default_filter: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            dir: None,
            file_prefix: "taskrunner".to_string(),
            default_filter: "info".to_string(),
        }
    }
}

/// Install the global subscriber.
///
/// The returned guard flushes the file writer when dropped, so the caller
/// must hold it for as long as logging is needed.
pub fn init_logging(config: &LogConfig) -> Result<Option<WorkerGuard>> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.default_filter));

    let console = tracing_subscriber::fmt::layer().with_target(false);

    let (file_layer, guard) = match &config.dir {
        Some(dir) => {
            std::fs::create_dir_all(dir).map_err(|e| {
                EngineError::Config(format!(
                    "failed to create log directory '{}': {e}",
                    dir.display()
                ))
            })?;
            let appender = rolling::daily(dir, &config.file_prefix);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_target(false)
                .boxed();
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console)
        .with(file_layer)
        .try_init()
        .map_err(|e| EngineError::Config(format!("failed to initialize logging: {e}")))?;

    if let Some(dir) = &config.dir {
        tracing::info!(
            "Logging to daily rotating files {}/{}.<YYYY-MM-DD>",
            dir.display(),
            config.file_prefix
        );
    }
    Ok(guard)
}
