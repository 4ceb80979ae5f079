//! Client registry: identity, liveness and dead-client detection.
//!
//! The registry is authoritative for which clients exist. Other managers
//! key their state by `ClientId` and never hold references into the
//! registry; when a client is declared dead, the caller forwards the id
//! list to the lock, device and serial managers for cascade cleanup. The
//! registry itself only removes its own entries.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use fbuild_core::ClientId;

/// Client metadata captured at CONNECT.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClientMetadata {
    /// Client process id.
    pub pid: u32,
    /// Client host name.
    pub hostname: String,
    /// Client software version.
    pub version: String,
}

/// One registered client.
#[derive(Debug, Clone)]
pub struct ClientRecord {
    /// Client identity.
    pub client_id: ClientId,
    /// Metadata from CONNECT.
    pub metadata: ClientMetadata,
    /// Wall-clock registration time (for reporting).
    pub registered_at: DateTime<Utc>,
    /// Monotonic last-heartbeat time (for liveness).
    pub last_heartbeat: Instant,
}

impl ClientRecord {
    /// Whether the client's heartbeat is within `timeout`.
    #[must_use]
    pub fn is_alive(&self, timeout: Duration) -> bool {
        self.last_heartbeat.elapsed() <= timeout
    }
}

/// Tracks connected clients and detects dead ones.
#[derive(Debug)]
pub struct ClientRegistry {
    clients: Mutex<HashMap<ClientId, ClientRecord>>,
    heartbeat_timeout: Duration,
}

impl ClientRegistry {
    /// Create a registry with the given heartbeat timeout.
    #[must_use]
    pub fn new(heartbeat_timeout: Duration) -> Self {
        Self {
            clients: Mutex::new(HashMap::new()),
            heartbeat_timeout,
        }
    }

    /// Register a client (idempotent: re-registering refreshes metadata and
    /// the heartbeat).
    pub fn register(&self, client_id: ClientId, metadata: ClientMetadata) {
        let mut clients = self.clients.lock().expect("registry mutex poisoned");
        info!(%client_id, pid = metadata.pid, "client registered");
        clients.insert(
            client_id.clone(),
            ClientRecord {
                client_id,
                metadata,
                registered_at: Utc::now(),
                last_heartbeat: Instant::now(),
            },
        );
    }

    /// Refresh a client's heartbeat. Returns false for unknown clients.
    pub fn heartbeat(&self, client_id: &ClientId) -> bool {
        let mut clients = self.clients.lock().expect("registry mutex poisoned");
        if let Some(record) = clients.get_mut(client_id) {
            record.last_heartbeat = Instant::now();
            true
        } else {
            false
        }
    }

    /// Remove a client. Returns false if it was not registered.
    pub fn unregister(&self, client_id: &ClientId) -> bool {
        let removed = self
            .clients
            .lock()
            .expect("registry mutex poisoned")
            .remove(client_id)
            .is_some();
        if removed {
            debug!(%client_id, "client unregistered");
        }
        removed
    }

    /// Number of registered clients.
    #[must_use]
    pub fn client_count(&self) -> usize {
        self.clients.lock().expect("registry mutex poisoned").len()
    }

    /// Snapshot of all registered clients.
    #[must_use]
    pub fn list_clients(&self) -> Vec<ClientRecord> {
        self.clients
            .lock()
            .expect("registry mutex poisoned")
            .values()
            .cloned()
            .collect()
    }

    /// Remove clients whose heartbeat is stale or whose process no longer
    /// exists, returning the removed ids for cascade cleanup.
    pub fn cleanup_dead_clients(&self) -> Vec<ClientId> {
        let mut clients = self.clients.lock().expect("registry mutex poisoned");
        let dead: Vec<ClientId> = clients
            .values()
            .filter(|r| !r.is_alive(self.heartbeat_timeout) || !pid_exists(r.metadata.pid))
            .map(|r| r.client_id.clone())
            .collect();
        for id in &dead {
            clients.remove(id);
            info!(client_id = %id, "dead client removed from registry");
        }
        dead
    }
}

/// Whether a process with `pid` currently exists on this host.
///
/// A pid of 0 (client did not report one) is treated as existing so
/// liveness falls back to heartbeats alone.
#[must_use]
pub fn pid_exists(pid: u32) -> bool {
    if pid == 0 {
        return true;
    }
    #[cfg(unix)]
    {
        use nix::sys::signal::kill;
        use nix::unistd::Pid;
        // Signal None probes for existence without delivering anything.
        // EPERM still means the process exists.
        #[allow(clippy::cast_possible_wrap)]
        match kill(Pid::from_raw(pid as i32), None) {
            Ok(()) => true,
            Err(nix::errno::Errno::EPERM) => true,
            Err(_) => false,
        }
    }
    #[cfg(not(unix))]
    {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> ClientRegistry {
        ClientRegistry::new(Duration::from_millis(50))
    }

    fn metadata(pid: u32) -> ClientMetadata {
        ClientMetadata {
            pid,
            hostname: "host".into(),
            version: "0.3".into(),
        }
    }

    #[test]
    fn test_register_heartbeat_unregister() {
        let reg = registry();
        let id = ClientId::new("c1");
        reg.register(id.clone(), metadata(std::process::id()));
        assert_eq!(reg.client_count(), 1);
        assert!(reg.heartbeat(&id));
        assert!(reg.unregister(&id));
        assert!(!reg.unregister(&id));
        assert_eq!(reg.client_count(), 0);
    }

    #[test]
    fn test_heartbeat_unknown_client() {
        let reg = registry();
        assert!(!reg.heartbeat(&ClientId::new("ghost")));
    }

    #[test]
    fn test_stale_heartbeat_is_dead() {
        let reg = registry();
        let id = ClientId::new("c1");
        reg.register(id.clone(), metadata(std::process::id()));
        std::thread::sleep(Duration::from_millis(80));
        let dead = reg.cleanup_dead_clients();
        assert_eq!(dead, vec![id]);
        assert_eq!(reg.client_count(), 0);
    }

    #[test]
    fn test_fresh_heartbeat_survives_sweep() {
        let reg = registry();
        let id = ClientId::new("c1");
        reg.register(id.clone(), metadata(std::process::id()));
        assert!(reg.cleanup_dead_clients().is_empty());
        assert_eq!(reg.client_count(), 1);
    }

    #[cfg(unix)]
    #[test]
    fn test_nonexistent_pid_is_dead() {
        let reg = registry();
        let id = ClientId::new("c1");
        // PID near the top of the default pid_max range; extremely unlikely
        // to exist in a test environment.
        reg.register(id.clone(), metadata(4_000_000));
        let dead = reg.cleanup_dead_clients();
        assert_eq!(dead, vec![id]);
    }

    #[test]
    fn test_pid_zero_counts_as_alive() {
        assert!(pid_exists(0));
    }
}
