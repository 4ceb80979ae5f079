//! Configuration error types.

use thiserror::Error;

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A config file could not be read.
    #[error("failed to read config file {path}: {source}")]
    Io {
        /// The offending path.
        path: String,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// A config file was not valid TOML for [`crate::DaemonConfig`].
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        /// The offending path.
        path: String,
        /// Underlying TOML error.
        source: toml::de::Error,
    },

    /// A field (or interaction of fields) failed validation.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Result alias for configuration operations.
pub type ConfigResult<T> = Result<T, ConfigError>;
