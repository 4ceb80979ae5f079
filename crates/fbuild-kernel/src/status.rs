//! Status manager: the single source of truth for daemon state.
//!
//! Exactly one status record is authoritative at any instant. Writes go
//! through a temp file and an atomic rename, so a crashed writer never
//! leaves a torn snapshot for clients to read. Last writer wins; the
//! manager serializes its own writes internally.

use std::path::PathBuf;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::fsio::write_json_atomically;
use crate::locks::LockStatus;

/// Coarse daemon state advertised to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DaemonState {
    /// Waiting for work.
    Idle,
    /// Compiling and linking firmware.
    Building,
    /// Flashing firmware.
    Deploying,
    /// Serial monitoring.
    Monitoring,
    /// Materializing package dependencies.
    Installing,
    /// Winding down.
    ShuttingDown,
}

impl DaemonState {
    /// Wire name of this state.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Building => "building",
            Self::Deploying => "deploying",
            Self::Monitoring => "monitoring",
            Self::Installing => "installing",
            Self::ShuttingDown => "shutting_down",
        }
    }
}

/// The persisted status snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusSnapshot {
    /// Current daemon state.
    pub state: DaemonState,
    /// Human-readable detail.
    pub message: String,
    /// Daemon process id.
    pub daemon_pid: u32,
    /// PID of the client that spawned the daemon, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spawned_by: Option<u32>,
    /// When the daemon started.
    pub started_at: DateTime<Utc>,
    /// When this snapshot was written.
    pub updated_at: DateTime<Utc>,
    /// Whether a build/deploy/monitor/install operation is active.
    pub operation_in_progress: bool,
    /// Connected client count at write time.
    pub client_count: usize,
    /// Held configuration locks at write time.
    pub locks: Vec<LockStatus>,
}

#[derive(Debug)]
struct StatusInner {
    state: DaemonState,
    message: String,
    operation_in_progress: bool,
    client_count: usize,
    locks: Vec<LockStatus>,
}

/// Serializes daemon status and persists it atomically.
#[derive(Debug)]
pub struct StatusManager {
    path: PathBuf,
    daemon_pid: u32,
    spawned_by: Option<u32>,
    started_at: DateTime<Utc>,
    inner: Mutex<StatusInner>,
}

impl StatusManager {
    /// Create a manager writing to `path`.
    #[must_use]
    pub fn new(path: PathBuf, daemon_pid: u32, spawned_by: Option<u32>) -> Self {
        Self {
            path,
            daemon_pid,
            spawned_by,
            started_at: Utc::now(),
            inner: Mutex::new(StatusInner {
                state: DaemonState::Idle,
                message: String::new(),
                operation_in_progress: false,
                client_count: 0,
                locks: Vec::new(),
            }),
        }
    }

    /// Update state and message, then rewrite the status file.
    pub fn update_status(&self, state: DaemonState, message: impl Into<String>) {
        let snapshot = {
            let mut inner = self.inner.lock().expect("status mutex poisoned");
            inner.state = state;
            inner.message = message.into();
            self.snapshot_locked(&inner)
        };
        self.persist(&snapshot);
    }

    /// Refresh the client count and lock snapshot carried in the status
    /// file, then rewrite it.
    pub fn update_runtime_info(&self, client_count: usize, locks: Vec<LockStatus>) {
        let snapshot = {
            let mut inner = self.inner.lock().expect("status mutex poisoned");
            inner.client_count = client_count;
            inner.locks = locks;
            self.snapshot_locked(&inner)
        };
        self.persist(&snapshot);
    }

    /// Flag an operation as active or finished.
    pub fn set_operation_in_progress(&self, in_progress: bool) {
        let snapshot = {
            let mut inner = self.inner.lock().expect("status mutex poisoned");
            inner.operation_in_progress = in_progress;
            self.snapshot_locked(&inner)
        };
        self.persist(&snapshot);
    }

    /// Whether an operation is currently active.
    #[must_use]
    pub fn operation_in_progress(&self) -> bool {
        self.inner
            .lock()
            .expect("status mutex poisoned")
            .operation_in_progress
    }

    /// Current state and message.
    #[must_use]
    pub fn current(&self) -> (DaemonState, String) {
        let inner = self.inner.lock().expect("status mutex poisoned");
        (inner.state, inner.message.clone())
    }

    /// Build a snapshot of the current status without persisting it.
    #[must_use]
    pub fn snapshot(&self) -> StatusSnapshot {
        let inner = self.inner.lock().expect("status mutex poisoned");
        self.snapshot_locked(&inner)
    }

    fn snapshot_locked(&self, inner: &StatusInner) -> StatusSnapshot {
        StatusSnapshot {
            state: inner.state,
            message: inner.message.clone(),
            daemon_pid: self.daemon_pid,
            spawned_by: self.spawned_by,
            started_at: self.started_at,
            updated_at: Utc::now(),
            operation_in_progress: inner.operation_in_progress,
            client_count: inner.client_count,
            locks: inner.locks.clone(),
        }
    }

    fn persist(&self, snapshot: &StatusSnapshot) {
        if let Err(e) = write_json_atomically(&self.path, snapshot) {
            warn!(error = %e, path = %self.path.display(), "failed to write status file");
        } else {
            debug!(state = snapshot.state.as_str(), "status written");
        }
    }
}
