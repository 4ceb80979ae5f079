//! fbuild Config - daemon configuration types and loading.
//!
//! Every tunable the daemon honors lives in [`DaemonConfig`]: network
//! binding, heartbeat timing, housekeeping sweep intervals, lock policy,
//! serial buffering and pipeline pool sizes. Loading merges an optional
//! TOML file over built-in defaults and then validates the result; invalid
//! interactions (a heartbeat cadence the server timeout cannot tolerate)
//! are load errors, not runtime surprises.

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]

mod error;
mod types;
mod validate;

pub use error::{ConfigError, ConfigResult};
pub use types::{
    DaemonConfig, HeartbeatConfig, LockConfig, NetworkConfig, PipelineConfig, SerialConfig,
    SweepConfig,
};

use std::path::Path;

use tracing::info;

/// Load configuration from an optional TOML file over defaults.
///
/// A missing file yields pure defaults; a present file is parsed and
/// merged field-by-field (serde defaults fill the gaps). The result is
/// validated before it is returned.
///
/// # Errors
///
/// Returns [`ConfigError`] on unreadable or malformed files, or when the
/// merged configuration fails validation.
pub fn load(path: Option<&Path>) -> ConfigResult<DaemonConfig> {
    let config = match path {
        Some(path) if path.exists() => {
            let raw = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
                path: path.display().to_string(),
                source: e,
            })?;
            let config: DaemonConfig =
                toml::from_str(&raw).map_err(|e| ConfigError::Parse {
                    path: path.display().to_string(),
                    source: e,
                })?;
            info!(path = %path.display(), "loaded daemon config");
            config
        },
        _ => DaemonConfig::default(),
    };
    validate::validate(&config)?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_missing_file_yields_defaults() {
        let config = load(Some(std::path::Path::new("/nonexistent/fbuild.toml"))).unwrap();
        assert_eq!(config.network.port, 9876);
    }

    #[test]
    fn test_load_file_overrides_and_validates() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("daemon.toml");
        std::fs::write(&path, "[network]\nport = 4242\n\n[serial]\nmax_buffer_lines = 500\n")
            .unwrap();
        let config = load(Some(&path)).unwrap();
        assert_eq!(config.network.port, 4242);
        assert_eq!(config.serial.max_buffer_lines, 500);
        // Untouched sections keep their defaults.
        assert!((config.heartbeat.timeout_secs - 4.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_load_rejects_invalid_interactions() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("daemon.toml");
        std::fs::write(&path, "[heartbeat]\nsend_interval_secs = 5.0\n").unwrap();
        assert!(matches!(load(Some(&path)), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_load_rejects_unknown_fields() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("daemon.toml");
        std::fs::write(&path, "[network]\nprot = 1\n").unwrap();
        assert!(matches!(load(Some(&path)), Err(ConfigError::Parse { .. })));
    }
}
