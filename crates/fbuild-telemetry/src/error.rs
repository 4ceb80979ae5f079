//! Telemetry error types.

use thiserror::Error;

/// Errors raised while setting up logging.
#[derive(Debug, Error)]
pub enum TelemetryError {
    /// Subscriber initialization failed (bad filter directive, double init).
    #[error("failed to initialize logging: {0}")]
    InitError(String),

    /// The log directory could not be created or opened.
    #[error("failed to prepare log directory: {0}")]
    LogDirError(String),
}

/// Result alias for telemetry operations.
pub type TelemetryResult<T> = Result<T, TelemetryError>;
