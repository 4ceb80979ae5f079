//! File-based request channels.
//!
//! Four operation channels (build, deploy, monitor, install-deps) plus
//! five device request/response pairs live as well-known JSON files under
//! the daemon's `requests/` directory. Producers write atomically
//! (temp-file-and-rename); the main loop consumes atomically: under the
//! channel's mutex it reads the file and deletes it before the request is
//! processed, so a second arrival can never be double-consumed.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::KernelResult;
use crate::fsio::write_json_atomically;

/// A build request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildRequest {
    /// Project directory to build.
    pub project_dir: String,
    /// Environment name.
    pub environment: String,
    /// Verbose toolchain output.
    #[serde(default)]
    pub verbose: bool,
    /// Force a clean build.
    #[serde(default)]
    pub clean: bool,
    /// Operation id for cancel signals.
    #[serde(default)]
    pub operation_id: Option<String>,
}

/// A deploy (flash) request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeployRequest {
    /// Project directory to deploy from.
    pub project_dir: String,
    /// Environment name.
    pub environment: String,
    /// Target port.
    pub port: String,
    /// Verbose toolchain output.
    #[serde(default)]
    pub verbose: bool,
    /// Attach a monitor after flashing.
    #[serde(default)]
    pub monitor_after: bool,
    /// Operation id for cancel signals.
    #[serde(default)]
    pub operation_id: Option<String>,
}

/// A serial monitor request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorRequest {
    /// Project directory (for environment defaults).
    pub project_dir: String,
    /// Environment name.
    pub environment: String,
    /// Port to monitor.
    pub port: String,
    /// Baud rate.
    #[serde(default = "default_baud")]
    pub baud_rate: u32,
    /// Verbose output.
    #[serde(default)]
    pub verbose: bool,
}

fn default_baud() -> u32 {
    115_200
}

/// An install-dependencies request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallDepsRequest {
    /// Project directory.
    pub project_dir: String,
    /// Environment name.
    pub environment: String,
    /// Verbose output.
    #[serde(default)]
    pub verbose: bool,
    /// Operation id for cancel signals.
    #[serde(default)]
    pub operation_id: Option<String>,
}

/// The four operation channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelKind {
    /// Build requests.
    Build,
    /// Deploy requests.
    Deploy,
    /// Monitor requests.
    Monitor,
    /// Install-dependencies requests.
    InstallDeps,
}

impl ChannelKind {
    /// The request file name for this channel.
    #[must_use]
    pub fn file_name(self) -> &'static str {
        match self {
            Self::Build => "build_request.json",
            Self::Deploy => "deploy_request.json",
            Self::Monitor => "monitor_request.json",
            Self::InstallDeps => "install_deps_request.json",
        }
    }
}

/// Device request/response channel pairs serviced by the main loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceChannel {
    /// Enumerate devices.
    List,
    /// One device's status.
    Status,
    /// Acquire a lease.
    Lease,
    /// Release a lease.
    Release,
    /// Preempt the exclusive lease.
    Preempt,
}

impl DeviceChannel {
    /// All device channels, in service order.
    pub const ALL: [Self; 5] = [
        Self::List,
        Self::Status,
        Self::Lease,
        Self::Release,
        Self::Preempt,
    ];

    /// The request file name.
    #[must_use]
    pub fn request_file(self) -> &'static str {
        match self {
            Self::List => "device_list_request.json",
            Self::Status => "device_status_request.json",
            Self::Lease => "device_lease_request.json",
            Self::Release => "device_release_request.json",
            Self::Preempt => "device_preempt_request.json",
        }
    }

    /// The paired response file name.
    #[must_use]
    pub fn response_file(self) -> &'static str {
        match self {
            Self::List => "device_list_response.json",
            Self::Status => "device_status_response.json",
            Self::Lease => "device_lease_response.json",
            Self::Release => "device_release_response.json",
            Self::Preempt => "device_preempt_response.json",
        }
    }
}

/// One single-file rendezvous with atomic consumption.
#[derive(Debug)]
pub struct RequestChannel {
    path: PathBuf,
    consume_lock: Mutex<()>,
}

impl RequestChannel {
    /// Create a channel over `path`.
    #[must_use]
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            consume_lock: Mutex::new(()),
        }
    }

    /// The channel's file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Atomically consume a pending request, if any.
    ///
    /// Under the channel mutex: read the file, then delete it. The delete
    /// completes before the request is handed to the caller. Malformed
    /// content is deleted and dropped with a warning.
    pub fn poll<T: DeserializeOwned>(&self) -> Option<T> {
        let _guard = self.consume_lock.lock().expect("channel mutex poisoned");
        let raw = std::fs::read_to_string(&self.path).ok()?;
        if let Err(e) = std::fs::remove_file(&self.path) {
            // Could not claim the request; leave it for the next poll.
            warn!(path = %self.path.display(), error = %e, "failed to consume request file");
            return None;
        }
        match serde_json::from_str(&raw) {
            Ok(request) => {
                debug!(path = %self.path.display(), "request consumed");
                Some(request)
            },
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "malformed request dropped");
                None
            },
        }
    }

    /// Atomically publish a request (client side; also used by tests).
    ///
    /// # Errors
    ///
    /// Returns [`crate::error::KernelError::StateIo`] on write failure.
    pub fn publish<T: Serialize>(&self, request: &T) -> KernelResult<()> {
        let _guard = self.consume_lock.lock().expect("channel mutex poisoned");
        write_json_atomically(&self.path, request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_poll_empty_channel() {
        let tmp = tempfile::tempdir().unwrap();
        let channel = RequestChannel::new(tmp.path().join(ChannelKind::Build.file_name()));
        assert!(channel.poll::<BuildRequest>().is_none());
    }

    #[test]
    fn test_publish_then_poll_consumes_once() {
        let tmp = tempfile::tempdir().unwrap();
        let channel = RequestChannel::new(tmp.path().join(ChannelKind::Build.file_name()));
        let request = BuildRequest {
            project_dir: "/p".into(),
            environment: "esp32dev".into(),
            verbose: true,
            clean: false,
            operation_id: Some("op-1".into()),
        };
        channel.publish(&request).unwrap();

        let consumed: BuildRequest = channel.poll().unwrap();
        assert_eq!(consumed.project_dir, "/p");
        assert!(consumed.verbose);
        // The file is gone: a second poll sees nothing.
        assert!(channel.poll::<BuildRequest>().is_none());
        assert!(!channel.path().exists());
    }

    #[test]
    fn test_malformed_request_is_dropped() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join(ChannelKind::Deploy.file_name());
        std::fs::write(&path, b"{broken").unwrap();
        let channel = RequestChannel::new(path.clone());
        assert!(channel.poll::<DeployRequest>().is_none());
        // Deleted, not left around to poison every poll.
        assert!(!path.exists());
    }

    #[test]
    fn test_concurrent_polls_consume_exactly_once() {
        let tmp = tempfile::tempdir().unwrap();
        let channel = std::sync::Arc::new(RequestChannel::new(
            tmp.path().join(ChannelKind::Monitor.file_name()),
        ));
        let request = MonitorRequest {
            project_dir: "/p".into(),
            environment: "e".into(),
            port: "/dev/ttyUSB0".into(),
            baud_rate: 115_200,
            verbose: false,
        };
        channel.publish(&request).unwrap();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let channel = std::sync::Arc::clone(&channel);
            handles.push(std::thread::spawn(move || {
                usize::from(channel.poll::<MonitorRequest>().is_some())
            }));
        }
        let consumed: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(consumed, 1);
    }
}
