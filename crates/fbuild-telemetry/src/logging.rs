//! Logging configuration and setup.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::error::{TelemetryError, TelemetryResult};

/// How many rotated daily files are retained.
const MAX_LOG_FILES: usize = 3;

/// Log output target.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogTarget {
    /// Log to stderr (foreground runs).
    #[default]
    Stderr,
    /// Log to daily-rotated files in a directory.
    File(PathBuf),
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Level filter (e.g. `"info"`, `"debug"`, `"fbuild_kernel=trace"`).
    pub level: String,
    /// Output target.
    #[serde(default)]
    pub target: LogTarget,
    /// File name prefix for file logging.
    #[serde(default = "default_prefix")]
    pub prefix: String,
    /// Extra filter directives layered over `level`.
    #[serde(default)]
    pub directives: Vec<String>,
}

fn default_prefix() -> String {
    "fbuild-daemon".to_owned()
}

impl LogConfig {
    /// Create a config at the given base level, logging to stderr.
    #[must_use]
    pub fn new(level: impl Into<String>) -> Self {
        Self {
            level: level.into(),
            target: LogTarget::Stderr,
            prefix: default_prefix(),
            directives: Vec::new(),
        }
    }

    /// Switch to daily-rotated file logging in `directory`.
    #[must_use]
    pub fn with_file_logging(
        mut self,
        directory: impl Into<PathBuf>,
        prefix: impl Into<String>,
    ) -> Self {
        self.target = LogTarget::File(directory.into());
        self.prefix = prefix.into();
        self
    }

    /// Add a filter directive (e.g. `"fbuild_pipeline=debug"`).
    #[must_use]
    pub fn with_directive(mut self, directive: impl Into<String>) -> Self {
        self.directives.push(directive.into());
        self
    }

    fn env_filter(&self) -> TelemetryResult<EnvFilter> {
        let mut filter = EnvFilter::try_new(&self.level)
            .map_err(|e| TelemetryError::InitError(e.to_string()))?;
        for directive in &self.directives {
            filter = filter.add_directive(
                directive
                    .parse()
                    .map_err(|e| TelemetryError::InitError(format!("{e}")))?,
            );
        }
        Ok(filter)
    }
}

/// Keeps the file-appender worker alive; dropping it flushes and stops the
/// background writer. Hold it for the life of the process.
#[derive(Debug)]
pub struct LogGuard {
    _worker: Option<WorkerGuard>,
}

/// Install the global subscriber per `config`.
///
/// # Errors
///
/// Returns [`TelemetryError`] if the filter is malformed, the log directory
/// cannot be prepared, or a subscriber is already installed.
pub fn setup_logging(config: &LogConfig) -> TelemetryResult<LogGuard> {
    let filter = config.env_filter()?;

    match &config.target {
        LogTarget::Stderr => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().with_writer(std::io::stderr))
                .try_init()
                .map_err(|e| TelemetryError::InitError(e.to_string()))?;
            Ok(LogGuard { _worker: None })
        },
        LogTarget::File(directory) => {
            std::fs::create_dir_all(directory)
                .map_err(|e| TelemetryError::LogDirError(e.to_string()))?;
            let appender = RollingFileAppender::builder()
                .rotation(Rotation::DAILY)
                .filename_prefix(&config.prefix)
                .filename_suffix("log")
                .max_log_files(MAX_LOG_FILES)
                .build(directory)
                .map_err(|e| TelemetryError::LogDirError(e.to_string()))?;
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().with_writer(writer).with_ansi(false))
                .try_init()
                .map_err(|e| TelemetryError::InitError(e.to_string()))?;
            Ok(LogGuard {
                _worker: Some(guard),
            })
        },
    }
}
