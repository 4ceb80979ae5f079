//! fbuild Telemetry - logging setup for the daemon and client tools.
//!
//! Wraps `tracing-subscriber` with the two shapes the daemon needs:
//! stderr output for foreground runs, and a daily-rotating log file
//! (three files retained) for daemonized runs.
//!
//! # Example
//!
//! ```rust,no_run
//! use fbuild_telemetry::{LogConfig, setup_logging};
//!
//! # fn main() -> Result<(), fbuild_telemetry::TelemetryError> {
//! let config = LogConfig::new("info").with_file_logging("/tmp/logs", "fbuild-daemon");
//! let _guard = setup_logging(&config)?;
//! tracing::info!("daemon starting");
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]

mod error;
mod logging;

pub use error::{TelemetryError, TelemetryResult};
pub use logging::{LogConfig, LogGuard, LogTarget, setup_logging};
