//! Configuration lock manager.
//!
//! Grants exclusive or shared-read locks keyed by the (project,
//! environment, port) triple. Lock state is pure bookkeeping guarded by the
//! manager mutex: there is no OS lock to own, which is what makes
//! cross-client force-release safe. A force-released holder's own `release`
//! simply returns `false` later.
//!
//! # Held predicate
//!
//! A lock is held iff `acquired_at` is set and either no release has
//! happened or the acquisition is strictly newer than the last release.
//! Equal timestamps mean NOT held. The holder sets are kept consistent
//! with this predicate; the timestamps are canonical.
//!
//! # Staleness
//!
//! A held lock whose age exceeds its timeout is stale. Staleness never
//! releases anything by itself; the janitor sweep (or an explicit signal)
//! force-releases stale locks and leaves a log trail.

use std::collections::{HashMap, HashSet};
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use fbuild_core::{ClientId, ConfigKey};

/// Upper bound substituted for non-finite wait/staleness timeouts.
const TIMEOUT_CEILING_SECS: f64 = 365.0 * 24.0 * 3600.0;

fn secs_to_duration(secs: f64) -> Duration {
    if secs.is_finite() && secs > 0.0 {
        Duration::from_secs_f64(secs.min(TIMEOUT_CEILING_SECS))
    } else if secs.is_nan() || secs <= 0.0 {
        Duration::ZERO
    } else {
        Duration::from_secs_f64(TIMEOUT_CEILING_SECS)
    }
}

/// One lock entry. Created on demand; garbage-collected when unheld and
/// idle.
#[derive(Debug)]
struct LockEntry {
    exclusive_holder: Option<ClientId>,
    shared_holders: HashSet<ClientId>,
    acquired_at: Option<Instant>,
    last_released_at: Option<Instant>,
    timeout_secs: f64,
    acquisition_count: u64,
    description: String,
    last_activity: Instant,
    waiting: usize,
}

impl LockEntry {
    fn new(default_timeout: f64) -> Self {
        Self {
            exclusive_holder: None,
            shared_holders: HashSet::new(),
            acquired_at: None,
            last_released_at: None,
            timeout_secs: default_timeout,
            acquisition_count: 0,
            description: String::new(),
            last_activity: Instant::now(),
            waiting: 0,
        }
    }

    /// The canonical held predicate. Equal timestamps mean NOT held.
    fn is_held(&self) -> bool {
        match (self.acquired_at, self.last_released_at) {
            (Some(acquired), Some(released)) => acquired > released,
            (Some(_), None) => true,
            (None, _) => false,
        }
    }

    /// A held lock older than its timeout is stale. Never true for an
    /// unheld lock.
    fn is_stale(&self) -> bool {
        if !self.is_held() {
            return false;
        }
        let Some(acquired) = self.acquired_at else {
            return false;
        };
        if !self.timeout_secs.is_finite() {
            return false;
        }
        // Zero and negative timeouts map to ZERO: immediately stale once
        // any time has passed.
        acquired.elapsed() > secs_to_duration(self.timeout_secs)
    }

    fn state_name(&self) -> &'static str {
        if !self.is_held() {
            "unlocked"
        } else if self.exclusive_holder.is_some() {
            "locked_exclusive"
        } else {
            "locked_shared_read"
        }
    }

    fn holder_count(&self) -> usize {
        if !self.is_held() {
            return 0;
        }
        usize::from(self.exclusive_holder.is_some()) + self.shared_holders.len()
    }

    fn grant_exclusive(&mut self, client: &ClientId, description: &str, timeout_secs: f64) {
        self.exclusive_holder = Some(client.clone());
        self.shared_holders.clear();
        self.acquired_at = Some(Instant::now());
        self.timeout_secs = timeout_secs;
        self.acquisition_count += 1;
        self.description = description.to_owned();
        self.last_activity = Instant::now();
    }

    fn clear_holders(&mut self) {
        self.exclusive_holder = None;
        self.shared_holders.clear();
        self.last_released_at = Some(Instant::now());
        self.last_activity = Instant::now();
    }
}

/// Reportable status of one lock.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockStatus {
    /// The lock key.
    pub key: ConfigKey,
    /// Whether an entry exists for the key at all.
    pub exists: bool,
    /// `"unlocked"`, `"locked_exclusive"` or `"locked_shared_read"`.
    pub state: String,
    /// Current holder count (1 for exclusive, N for shared).
    pub holder_count: usize,
    /// Threads currently blocked waiting for the lock.
    pub waiting_count: usize,
    /// The canonical held predicate.
    pub is_held: bool,
    /// Held and older than its timeout.
    pub is_stale: bool,
    /// Successful acquisitions over the entry's lifetime.
    pub acquisition_count: u64,
    /// Description supplied by the most recent holder.
    pub description: String,
    /// Staleness timeout in seconds.
    pub timeout_secs: f64,
    /// Seconds held so far, when held.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub held_for_secs: Option<f64>,
}

/// The lock manager.
#[derive(Debug)]
pub struct ConfigurationLockManager {
    locks: Mutex<HashMap<ConfigKey, LockEntry>>,
    released: Condvar,
    default_timeout_secs: f64,
}

impl ConfigurationLockManager {
    /// Create a manager with the given default staleness timeout.
    #[must_use]
    pub fn new(default_timeout_secs: f64) -> Self {
        Self {
            locks: Mutex::new(HashMap::new()),
            released: Condvar::new(),
            default_timeout_secs,
        }
    }

    /// Acquire an exclusive lock.
    ///
    /// Fails while any lock exists on the key. When `blocking`, waits up to
    /// `timeout_secs` for the key to free up; otherwise returns
    /// immediately. `timeout_secs` also becomes the lock's staleness
    /// timeout while held.
    pub fn acquire_exclusive(
        &self,
        key: &ConfigKey,
        client_id: &ClientId,
        description: &str,
        timeout_secs: f64,
        blocking: bool,
    ) -> bool {
        let deadline = Instant::now() + secs_to_duration(timeout_secs);
        let mut locks = self.locks.lock().expect("lock map mutex poisoned");

        loop {
            let entry = locks
                .entry(key.clone())
                .or_insert_with(|| LockEntry::new(self.default_timeout_secs));
            entry.last_activity = Instant::now();

            if !entry.is_held() {
                entry.grant_exclusive(client_id, description, timeout_secs);
                debug!(%client_id, key = %key, "exclusive lock acquired");
                return true;
            }

            if !blocking {
                return false;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return false;
            }

            entry.waiting += 1;
            let (guard, _timed_out) = self
                .released
                .wait_timeout(locks, remaining)
                .expect("lock map mutex poisoned");
            locks = guard;
            if let Some(entry) = locks.get_mut(key) {
                entry.waiting = entry.waiting.saturating_sub(1);
            }
        }
    }

    /// Acquire a shared-read lock. Succeeds immediately unless an exclusive
    /// holder exists; N readers coexist.
    pub fn acquire_shared_read(
        &self,
        key: &ConfigKey,
        client_id: &ClientId,
        description: &str,
    ) -> bool {
        let mut locks = self.locks.lock().expect("lock map mutex poisoned");
        let entry = locks
            .entry(key.clone())
            .or_insert_with(|| LockEntry::new(self.default_timeout_secs));
        entry.last_activity = Instant::now();

        if entry.is_held() && entry.exclusive_holder.is_some() {
            return false;
        }

        if !entry.is_held() {
            entry.acquired_at = Some(Instant::now());
            entry.description = description.to_owned();
        }
        entry.shared_holders.insert(client_id.clone());
        entry.acquisition_count += 1;
        debug!(%client_id, key = %key, "shared-read lock acquired");
        true
    }

    /// Release whichever lock form the client holds on `key`. Returns
    /// false if the client is not a holder (including after a
    /// force-release took the lock away).
    pub fn release(&self, key: &ConfigKey, client_id: &ClientId) -> bool {
        let mut locks = self.locks.lock().expect("lock map mutex poisoned");
        let Some(entry) = locks.get_mut(key) else {
            return false;
        };
        let released = Self::release_entry(entry, client_id);
        if released {
            debug!(%client_id, key = %key, "lock released");
            self.released.notify_all();
        }
        released
    }

    fn release_entry(entry: &mut LockEntry, client_id: &ClientId) -> bool {
        if !entry.is_held() {
            return false;
        }
        if entry.exclusive_holder.as_ref() == Some(client_id) {
            entry.clear_holders();
            return true;
        }
        if entry.shared_holders.remove(client_id) {
            entry.last_activity = Instant::now();
            if entry.shared_holders.is_empty() {
                entry.last_released_at = Some(Instant::now());
            }
            return true;
        }
        false
    }

    /// Cascade cleanup on client death: release everything the client
    /// holds. Returns the number of locks released.
    pub fn release_all_client_locks(&self, client_id: &ClientId) -> usize {
        let mut locks = self.locks.lock().expect("lock map mutex poisoned");
        let mut released = 0;
        for entry in locks.values_mut() {
            if Self::release_entry(entry, client_id) {
                released += 1;
            }
        }
        if released > 0 {
            info!(%client_id, count = released, "released locks for departed client");
            self.released.notify_all();
        }
        released
    }

    /// Force-release a lock regardless of holder. A no-op returning false
    /// for keys that were never held; never panics.
    pub fn force_release(&self, key: &ConfigKey) -> bool {
        let mut locks = self.locks.lock().expect("lock map mutex poisoned");
        let Some(entry) = locks.get_mut(key) else {
            return false;
        };
        if !entry.is_held() {
            return false;
        }
        warn!(key = %key, holders = entry.holder_count(), "force-releasing lock");
        entry.clear_holders();
        self.released.notify_all();
        true
    }

    /// Status for one key. A missing entry reports as unlocked.
    #[must_use]
    pub fn lock_status(&self, key: &ConfigKey) -> LockStatus {
        let locks = self.locks.lock().expect("lock map mutex poisoned");
        match locks.get(key) {
            Some(entry) => Self::status_of(key, entry, true),
            None => LockStatus {
                key: key.clone(),
                exists: false,
                state: "unlocked".to_owned(),
                holder_count: 0,
                waiting_count: 0,
                is_held: false,
                is_stale: false,
                acquisition_count: 0,
                description: String::new(),
                timeout_secs: self.default_timeout_secs,
                held_for_secs: None,
            },
        }
    }

    fn status_of(key: &ConfigKey, entry: &LockEntry, exists: bool) -> LockStatus {
        LockStatus {
            key: key.clone(),
            exists,
            state: entry.state_name().to_owned(),
            holder_count: entry.holder_count(),
            waiting_count: entry.waiting,
            is_held: entry.is_held(),
            is_stale: entry.is_stale(),
            acquisition_count: entry.acquisition_count,
            description: entry.description.clone(),
            timeout_secs: entry.timeout_secs,
            held_for_secs: entry
                .is_held()
                .then(|| entry.acquired_at.map(|a| a.elapsed().as_secs_f64()))
                .flatten(),
        }
    }

    /// Statuses of all currently-held locks (for the status file).
    #[must_use]
    pub fn held_lock_statuses(&self) -> Vec<LockStatus> {
        let locks = self.locks.lock().expect("lock map mutex poisoned");
        locks
            .iter()
            .filter(|(_, e)| e.is_held())
            .map(|(k, e)| Self::status_of(k, e, true))
            .collect()
    }

    /// Stale locks: held beyond their timeout.
    #[must_use]
    pub fn stale_locks(&self) -> Vec<LockStatus> {
        let locks = self.locks.lock().expect("lock map mutex poisoned");
        locks
            .iter()
            .filter(|(_, e)| e.is_stale())
            .map(|(k, e)| Self::status_of(k, e, true))
            .collect()
    }

    /// Janitor: force-release every stale lock. Returns the released count.
    pub fn force_release_stale_locks(&self) -> usize {
        let mut locks = self.locks.lock().expect("lock map mutex poisoned");
        let mut released = 0;
        for (key, entry) in locks.iter_mut() {
            if entry.is_stale() {
                warn!(key = %key, age_secs = entry.acquired_at.map(|a| a.elapsed().as_secs_f64()),
                    "janitor force-releasing stale lock");
                entry.clear_holders();
                released += 1;
            }
        }
        if released > 0 {
            self.released.notify_all();
        }
        released
    }

    /// Garbage-collect unheld entries idle for longer than
    /// `older_than_secs`. Held locks are never removed, no matter how old
    /// their last release is. NaN compares as not-older, so nothing is
    /// removed; negative values remove every unheld entry.
    pub fn cleanup_unused_locks(&self, older_than_secs: f64) -> usize {
        let mut locks = self.locks.lock().expect("lock map mutex poisoned");
        let before = locks.len();
        locks.retain(|_, entry| {
            if entry.is_held() || entry.waiting > 0 {
                return true;
            }
            let idle = entry.last_activity.elapsed().as_secs_f64();
            // NaN comparison is false: the entry stays.
            !(idle > older_than_secs)
        });
        let removed = before - locks.len();
        if removed > 0 {
            debug!(removed, "garbage-collected unused lock entries");
        }
        removed
    }

    /// Number of tracked lock entries (held or not).
    #[must_use]
    pub fn entry_count(&self) -> usize {
        self.locks.lock().expect("lock map mutex poisoned").len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn key(s: &str) -> ConfigKey {
        ConfigKey::new("/proj", "env", s)
    }

    fn client(s: &str) -> ClientId {
        ClientId::new(s)
    }

    fn manager() -> ConfigurationLockManager {
        ConfigurationLockManager::new(1800.0)
    }

    // -- held-predicate edge cases ------------------------------------------

    #[test]
    fn test_is_held_never_acquired() {
        let entry = LockEntry::new(1800.0);
        assert!(!entry.is_held());
    }

    #[test]
    fn test_is_held_acquired_not_released() {
        let mut entry = LockEntry::new(1800.0);
        entry.acquired_at = Some(Instant::now());
        assert!(entry.is_held());
    }

    #[test]
    fn test_is_held_released_after_acquired() {
        let mut entry = LockEntry::new(1800.0);
        entry.acquired_at = Some(Instant::now());
        std::thread::sleep(Duration::from_millis(5));
        entry.last_released_at = Some(Instant::now());
        assert!(!entry.is_held());
    }

    #[test]
    fn test_is_held_reacquired_after_release() {
        let mut entry = LockEntry::new(1800.0);
        entry.acquired_at = Some(Instant::now());
        std::thread::sleep(Duration::from_millis(5));
        entry.last_released_at = Some(Instant::now());
        assert!(!entry.is_held());
        std::thread::sleep(Duration::from_millis(5));
        entry.acquired_at = Some(Instant::now());
        assert!(entry.is_held());
    }

    #[test]
    fn test_is_held_equal_timestamps_not_held() {
        let mut entry = LockEntry::new(1800.0);
        let now = Instant::now();
        entry.acquired_at = Some(now);
        entry.last_released_at = Some(now);
        assert!(!entry.is_held());
    }

    #[test]
    fn test_is_held_released_without_acquire() {
        let mut entry = LockEntry::new(1800.0);
        entry.last_released_at = Some(Instant::now());
        assert!(!entry.is_held());
    }

    // -- staleness ----------------------------------------------------------

    #[test]
    fn test_stale_requires_held() {
        let entry = LockEntry::new(0.0);
        assert!(!entry.is_stale());
    }

    #[test]
    fn test_stale_within_timeout() {
        let mut entry = LockEntry::new(1800.0);
        entry.acquired_at = Some(Instant::now());
        entry.timeout_secs = 10.0;
        assert!(!entry.is_stale());
    }

    #[test]
    fn test_stale_beyond_timeout() {
        let mut entry = LockEntry::new(1800.0);
        entry.acquired_at = Some(Instant::now() - Duration::from_secs(10));
        entry.timeout_secs = 1.0;
        assert!(entry.is_stale());
    }

    #[test]
    fn test_stale_zero_timeout_immediately_stale() {
        let mut entry = LockEntry::new(1800.0);
        entry.acquired_at = Some(Instant::now());
        entry.timeout_secs = 0.0;
        std::thread::sleep(Duration::from_millis(2));
        assert!(entry.is_stale());
    }

    #[test]
    fn test_stale_infinite_timeout_never_stale() {
        let mut entry = LockEntry::new(1800.0);
        entry.acquired_at = Some(Instant::now() - Duration::from_secs(1_000_000));
        entry.timeout_secs = f64::INFINITY;
        assert!(!entry.is_stale());
    }

    // -- acquire / release --------------------------------------------------

    #[test]
    fn test_exclusive_blocks_exclusive_nonblocking() {
        let mgr = manager();
        assert!(mgr.acquire_exclusive(&key("p"), &client("a"), "build", 60.0, true));

        let started = Instant::now();
        assert!(!mgr.acquire_exclusive(&key("p"), &client("b"), "", 0.0, false));
        assert!(started.elapsed() < Duration::from_millis(100));

        let status = mgr.lock_status(&key("p"));
        assert_eq!(status.state, "locked_exclusive");
        assert_eq!(status.holder_count, 1);

        assert!(mgr.release(&key("p"), &client("a")));
        assert!(mgr.acquire_exclusive(&key("p"), &client("b"), "", 0.0, false));
    }

    #[test]
    fn test_shared_readers_coexist_and_block_exclusive() {
        let mgr = manager();
        assert!(mgr.acquire_shared_read(&key("p"), &client("r1"), "read"));
        assert!(mgr.acquire_shared_read(&key("p"), &client("r2"), "read"));
        assert_eq!(mgr.lock_status(&key("p")).holder_count, 2);
        assert_eq!(mgr.lock_status(&key("p")).state, "locked_shared_read");

        assert!(!mgr.acquire_exclusive(&key("p"), &client("w"), "", 0.0, false));

        assert!(mgr.release(&key("p"), &client("r1")));
        // Still one reader; exclusive still blocked.
        assert!(!mgr.acquire_exclusive(&key("p"), &client("w"), "", 0.0, false));
        assert!(mgr.release(&key("p"), &client("r2")));
        assert!(mgr.acquire_exclusive(&key("p"), &client("w"), "", 0.0, false));
    }

    #[test]
    fn test_exclusive_blocks_shared() {
        let mgr = manager();
        assert!(mgr.acquire_exclusive(&key("p"), &client("w"), "", 60.0, true));
        assert!(!mgr.acquire_shared_read(&key("p"), &client("r"), ""));
    }

    #[test]
    fn test_release_not_holder() {
        let mgr = manager();
        assert!(!mgr.release(&key("p"), &client("nobody")));
        assert!(mgr.acquire_exclusive(&key("p"), &client("a"), "", 60.0, true));
        assert!(!mgr.release(&key("p"), &client("b")));
        assert!(mgr.release(&key("p"), &client("a")));
        assert!(!mgr.release(&key("p"), &client("a")));
    }

    #[test]
    fn test_rapid_sequential_cycles_count_acquisitions() {
        let mgr = manager();
        for _ in 0..100 {
            assert!(mgr.acquire_exclusive(&key("rapid"), &client("a"), "", 60.0, true));
            assert!(mgr.release(&key("rapid"), &client("a")));
        }
        assert_eq!(mgr.lock_status(&key("rapid")).acquisition_count, 100);
    }

    #[test]
    fn test_blocking_contention_all_threads_acquire() {
        let mgr = Arc::new(manager());
        let acquired = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();
        for i in 0..10 {
            let mgr = Arc::clone(&mgr);
            let acquired = Arc::clone(&acquired);
            handles.push(std::thread::spawn(move || {
                let me = client(&format!("t{i}"));
                assert!(mgr.acquire_exclusive(&key("contended"), &me, "", 5.0, true));
                acquired.fetch_add(1, Ordering::SeqCst);
                std::thread::sleep(Duration::from_millis(5));
                assert!(mgr.release(&key("contended"), &me));
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(acquired.load(Ordering::SeqCst), 10);
    }

    #[test]
    fn test_blocking_timeout_expires() {
        let mgr = Arc::new(manager());
        assert!(mgr.acquire_exclusive(&key("held"), &client("a"), "", 600.0, true));
        let started = Instant::now();
        assert!(!mgr.acquire_exclusive(&key("held"), &client("b"), "", 0.2, true));
        let waited = started.elapsed();
        assert!(waited >= Duration::from_millis(150), "waited {waited:?}");
        assert!(waited < Duration::from_secs(2));
    }

    // -- force release ------------------------------------------------------

    #[test]
    fn test_force_release_nonexistent_is_noop() {
        let mgr = manager();
        assert!(!mgr.force_release(&key("ghost")));
    }

    #[test]
    fn test_force_release_unheld_is_noop() {
        let mgr = manager();
        assert!(mgr.acquire_exclusive(&key("p"), &client("a"), "", 60.0, true));
        assert!(mgr.release(&key("p"), &client("a")));
        assert!(!mgr.force_release(&key("p")));
    }

    #[test]
    fn test_force_release_cross_client() {
        let mgr = manager();
        assert!(mgr.acquire_exclusive(&key("p"), &client("a"), "", 60.0, true));
        assert!(mgr.force_release(&key("p")));
        // The former holder's release is a quiet false, never a panic.
        assert!(!mgr.release(&key("p"), &client("a")));
        // And the key is immediately acquirable again.
        assert!(mgr.acquire_exclusive(&key("p"), &client("b"), "", 60.0, false));
    }

    // -- janitor ------------------------------------------------------------

    #[test]
    fn test_janitor_releases_stale_lock() {
        let mgr = manager();
        assert!(mgr.acquire_exclusive(&key("s"), &client("a"), "", 0.05, true));
        std::thread::sleep(Duration::from_millis(80));

        let stale = mgr.stale_locks();
        assert_eq!(stale.len(), 1);
        assert!(stale[0].is_stale);

        assert_eq!(mgr.force_release_stale_locks(), 1);
        assert!(mgr.stale_locks().is_empty());
        // The old holder's explicit release returns false without throwing.
        assert!(!mgr.release(&key("s"), &client("a")));
    }

    #[test]
    fn test_fresh_lock_not_stale() {
        let mgr = manager();
        assert!(mgr.acquire_exclusive(&key("f"), &client("a"), "", 600.0, true));
        assert!(mgr.stale_locks().is_empty());
        assert_eq!(mgr.force_release_stale_locks(), 0);
    }

    // -- garbage collection -------------------------------------------------

    #[test]
    fn test_cleanup_never_removes_held_locks() {
        let mgr = manager();
        assert!(mgr.acquire_exclusive(&key("held"), &client("a"), "", 600.0, true));
        assert_eq!(mgr.cleanup_unused_locks(0.0), 0);
        assert!(mgr.lock_status(&key("held")).is_held);
    }

    #[test]
    fn test_cleanup_removes_old_unheld_locks() {
        let mgr = manager();
        assert!(mgr.acquire_exclusive(&key("old"), &client("a"), "", 600.0, true));
        assert!(mgr.release(&key("old"), &client("a")));
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(mgr.cleanup_unused_locks(0.0), 1);
        assert_eq!(mgr.entry_count(), 0);
    }

    #[test]
    fn test_cleanup_nan_removes_nothing() {
        let mgr = manager();
        assert!(mgr.acquire_exclusive(&key("x"), &client("a"), "", 600.0, true));
        assert!(mgr.release(&key("x"), &client("a")));
        assert_eq!(mgr.cleanup_unused_locks(f64::NAN), 0);
        assert_eq!(mgr.entry_count(), 1);
    }

    #[test]
    fn test_cleanup_negative_does_not_crash() {
        let mgr = manager();
        assert!(mgr.acquire_exclusive(&key("x"), &client("a"), "", 600.0, true));
        assert!(mgr.release(&key("x"), &client("a")));
        std::thread::sleep(Duration::from_millis(2));
        assert_eq!(mgr.cleanup_unused_locks(-5.0), 1);
    }

    // -- key space ----------------------------------------------------------

    #[test]
    fn test_empty_string_key_components() {
        let mgr = manager();
        let empty = ConfigKey::new("", "", "");
        assert!(mgr.acquire_exclusive(&empty, &client("a"), "", 60.0, true));
        assert!(!mgr.acquire_exclusive(&empty, &client("b"), "", 0.0, false));
        assert!(mgr.release(&empty, &client("a")));
    }

    #[test]
    fn test_unicode_key_components() {
        let mgr = manager();
        let unicode = ConfigKey::new("/项目", "пров", "ポート");
        assert!(mgr.acquire_exclusive(&unicode, &client("a"), "", 60.0, true));
        assert_eq!(mgr.lock_status(&unicode).state, "locked_exclusive");
        assert!(mgr.release(&unicode, &client("a")));
    }

    #[test]
    fn test_waiting_count_visible_in_status() {
        let mgr = Arc::new(manager());
        assert!(mgr.acquire_exclusive(&key("w"), &client("a"), "", 600.0, true));

        let waiter = {
            let mgr = Arc::clone(&mgr);
            std::thread::spawn(move || mgr.acquire_exclusive(&key("w"), &client("b"), "", 2.0, true))
        };

        // Give the waiter time to block, then observe it in the status.
        let mut saw_waiter = false;
        for _ in 0..50 {
            if mgr.lock_status(&key("w")).waiting_count > 0 {
                saw_waiter = true;
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        assert!(saw_waiter, "waiter never appeared in lock status");

        assert!(mgr.release(&key("w"), &client("a")));
        assert!(waiter.join().unwrap());
        assert_eq!(mgr.lock_status(&key("w")).waiting_count, 0);
    }

    #[test]
    fn test_status_serializes_for_the_wire() {
        let mgr = manager();
        assert!(mgr.acquire_exclusive(&key("s"), &client("a"), "flashing blinky", 60.0, true));
        let status = mgr.lock_status(&key("s"));
        let value = serde_json::to_value(&status).unwrap();
        assert_eq!(value["state"], "locked_exclusive");
        assert_eq!(value["description"], "flashing blinky");
        assert_eq!(value["key"]["port"], "s");
        assert!(value["held_for_secs"].as_f64().unwrap() >= 0.0);
    }

    // -- cascade cleanup ----------------------------------------------------

    #[test]
    fn test_release_all_client_locks() {
        let mgr = manager();
        assert!(mgr.acquire_exclusive(&key("1"), &client("a"), "", 60.0, true));
        assert!(mgr.acquire_shared_read(&key("2"), &client("a"), ""));
        assert!(mgr.acquire_exclusive(&key("3"), &client("b"), "", 60.0, true));

        assert_eq!(mgr.release_all_client_locks(&client("a")), 2);
        assert!(!mgr.lock_status(&key("1")).is_held);
        assert!(!mgr.lock_status(&key("2")).is_held);
        assert!(mgr.lock_status(&key("3")).is_held);
    }
}
