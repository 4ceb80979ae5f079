//! Per-client child-process tracking.
//!
//! Build and monitor operations spawn toolchain subprocesses on behalf of
//! clients. The tracker records them in a JSON registry so the orphan
//! sweep can terminate children whose owning client process has died.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use fbuild_core::ClientId;

use crate::fsio::write_json_atomically;
use crate::registry::pid_exists;

/// Registry file payload: client id -> tracked entry.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct TrackedClient {
    /// The client's own process id.
    client_pid: u32,
    /// Child processes spawned for this client.
    children: Vec<u32>,
}

/// Tracks child processes per client and reaps orphans.
#[derive(Debug)]
pub struct ProcessTracker {
    path: PathBuf,
    clients: Mutex<HashMap<ClientId, TrackedClient>>,
}

impl ProcessTracker {
    /// Load the tracker from `path`, tolerating a missing or corrupt file.
    #[must_use]
    pub fn load(path: PathBuf) -> Self {
        let clients = std::fs::read_to_string(&path)
            .ok()
            .and_then(|raw| serde_json::from_str(&raw).ok())
            .unwrap_or_default();
        Self {
            path,
            clients: Mutex::new(clients),
        }
    }

    /// Record a child process spawned for `client_id`.
    pub fn register_process(&self, client_id: &ClientId, client_pid: u32, child_pid: u32) {
        let snapshot = {
            let mut clients = self.clients.lock().expect("tracker mutex poisoned");
            let entry = clients.entry(client_id.clone()).or_default();
            entry.client_pid = client_pid;
            if !entry.children.contains(&child_pid) {
                entry.children.push(child_pid);
            }
            clients.clone()
        };
        self.persist(&snapshot);
        debug!(%client_id, child_pid, "child process registered");
    }

    /// Forget a child process (it exited normally).
    pub fn unregister_process(&self, client_id: &ClientId, child_pid: u32) {
        let snapshot = {
            let mut clients = self.clients.lock().expect("tracker mutex poisoned");
            if let Some(entry) = clients.get_mut(client_id) {
                entry.children.retain(|&pid| pid != child_pid);
                if entry.children.is_empty() {
                    clients.remove(client_id);
                }
            }
            clients.clone()
        };
        self.persist(&snapshot);
    }

    /// Drop all tracking for a client (graceful disconnect).
    pub fn forget_client(&self, client_id: &ClientId) {
        let snapshot = {
            let mut clients = self.clients.lock().expect("tracker mutex poisoned");
            clients.remove(client_id);
            clients.clone()
        };
        self.persist(&snapshot);
    }

    /// Kill children of clients whose own process has died. Returns the
    /// affected client ids.
    pub fn cleanup_orphans(&self) -> Vec<ClientId> {
        let snapshot = {
            let mut clients = self.clients.lock().expect("tracker mutex poisoned");
            let orphaned: Vec<ClientId> = clients
                .iter()
                .filter(|(_, entry)| entry.client_pid != 0 && !pid_exists(entry.client_pid))
                .map(|(id, _)| id.clone())
                .collect();
            for id in &orphaned {
                if let Some(entry) = clients.remove(id) {
                    for child in entry.children {
                        terminate(child);
                    }
                    info!(client_id = %id, "cleaned up orphaned child processes");
                }
            }
            if orphaned.is_empty() {
                return orphaned;
            }
            (orphaned, clients.clone())
        };
        let (orphaned, map) = snapshot;
        self.persist(&map);
        orphaned
    }

    /// Number of tracked clients.
    #[must_use]
    pub fn tracked_count(&self) -> usize {
        self.clients.lock().expect("tracker mutex poisoned").len()
    }

    fn persist(&self, snapshot: &HashMap<ClientId, TrackedClient>) {
        if let Err(e) = write_json_atomically(&self.path, snapshot) {
            warn!(error = %e, "failed to persist process registry");
        }
    }
}

/// Best-effort SIGTERM.
fn terminate(pid: u32) {
    #[cfg(unix)]
    {
        use nix::sys::signal::{Signal, kill};
        use nix::unistd::Pid;
        #[allow(clippy::cast_possible_wrap)]
        if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
            debug!(pid, error = %e, "failed to terminate orphan child");
        }
    }
    #[cfg(not(unix))]
    {
        let _ = pid;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_and_unregister() {
        let tmp = tempfile::tempdir().unwrap();
        let tracker = ProcessTracker::load(tmp.path().join("procs.json"));
        let id = ClientId::new("c1");

        tracker.register_process(&id, std::process::id(), 11111);
        tracker.register_process(&id, std::process::id(), 22222);
        assert_eq!(tracker.tracked_count(), 1);

        tracker.unregister_process(&id, 11111);
        tracker.unregister_process(&id, 22222);
        // Entry removed once the last child is gone.
        assert_eq!(tracker.tracked_count(), 0);
    }

    #[test]
    fn test_live_client_is_not_reaped() {
        let tmp = tempfile::tempdir().unwrap();
        let tracker = ProcessTracker::load(tmp.path().join("procs.json"));
        let id = ClientId::new("c1");
        tracker.register_process(&id, std::process::id(), 11111);
        assert!(tracker.cleanup_orphans().is_empty());
        assert_eq!(tracker.tracked_count(), 1);
    }

    #[cfg(unix)]
    #[test]
    fn test_dead_client_children_reaped() {
        let tmp = tempfile::tempdir().unwrap();
        let tracker = ProcessTracker::load(tmp.path().join("procs.json"));
        let id = ClientId::new("c1");
        // A pid that cannot exist in a test environment.
        tracker.register_process(&id, 3_999_999, 3_999_998);
        let orphaned = tracker.cleanup_orphans();
        assert_eq!(orphaned, vec![id]);
        assert_eq!(tracker.tracked_count(), 0);
    }

    #[test]
    fn test_registry_survives_reload() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("procs.json");
        {
            let tracker = ProcessTracker::load(path.clone());
            tracker.register_process(&ClientId::new("c1"), std::process::id(), 7);
        }
        let tracker = ProcessTracker::load(path);
        assert_eq!(tracker.tracked_count(), 1);
    }
}
