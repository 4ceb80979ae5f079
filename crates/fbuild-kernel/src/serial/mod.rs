//! Shared serial session manager.
//!
//! One session per open OS port: the first opener creates the session and
//! its background reader thread; later clients attach to the same session.
//! Many readers drain a shared line buffer; at most one writer holds the
//! port at a time. Output arriving from the device is appended to the
//! session buffer and published on the event bus as a SERIAL broadcast.
//!
//! # Thread model
//!
//! One reader thread per open port. It takes the connection mutex only
//! around the (short-timeout) read and the session lock only while
//! appending to the buffer; it never touches the manager map except to
//! remove its own session on a fatal I/O error.

mod provider;

pub use provider::{
    LoopbackHandle, LoopbackProvider, SerialConnection, SerialPortProvider, SystemSerialProvider,
};

use std::collections::{HashMap, HashSet, VecDeque};
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use fbuild_config::SerialConfig;
use fbuild_core::ClientId;
use fbuild_events::{DaemonEvent, EventBus};
use fbuild_protocol::encode_bytes;

use crate::error::{KernelError, KernelResult};

/// Introspection record for one session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionInfo {
    /// OS port path.
    pub port: String,
    /// Baud rate of the open handle.
    pub baud: u32,
    /// Whether the OS handle is open.
    pub is_open: bool,
    /// Attached reader count.
    pub reader_count: usize,
    /// Current writer, when one holds the port.
    pub writer_client_id: Option<ClientId>,
    /// Complete lines currently buffered.
    pub buffer_lines: usize,
    /// Seconds since the session was created.
    pub uptime_secs: f64,
}

#[derive(Debug)]
struct SessionState {
    open: bool,
    readers: HashSet<ClientId>,
    writer: Option<ClientId>,
    lines: VecDeque<String>,
    partial: String,
}

struct SerialSession {
    port: String,
    baud: u32,
    created_at: Instant,
    state: Mutex<SessionState>,
    writer_freed: Condvar,
    conn: Mutex<Option<Box<dyn SerialConnection>>>,
    stop: AtomicBool,
}

impl std::fmt::Debug for SerialSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerialSession")
            .field("port", &self.port)
            .field("baud", &self.baud)
            .finish_non_exhaustive()
    }
}

impl SerialSession {
    /// Append device output to the buffer and publish it. Complete lines
    /// enter the ring (oldest evicted beyond `max_lines`); the trailing
    /// partial line is carried until its newline arrives.
    fn ingest(&self, data: &[u8], bus: &EventBus, max_lines: usize) {
        {
            let mut state = self.state.lock().expect("session mutex poisoned");
            state.partial.push_str(&String::from_utf8_lossy(data));
            while let Some(pos) = state.partial.find('\n') {
                let line: String = state.partial.drain(..=pos).collect();
                state.lines.push_back(line.trim_end_matches(['\r', '\n']).to_owned());
                while state.lines.len() > max_lines {
                    state.lines.pop_front();
                }
            }
        }
        bus.publish(DaemonEvent::SerialOutput {
            port: self.port.clone(),
            data: encode_bytes(data),
        });
    }

    fn info(&self) -> SessionInfo {
        let state = self.state.lock().expect("session mutex poisoned");
        SessionInfo {
            port: self.port.clone(),
            baud: self.baud,
            is_open: state.open,
            reader_count: state.readers.len(),
            writer_client_id: state.writer.clone(),
            buffer_lines: state.lines.len(),
            uptime_secs: self.created_at.elapsed().as_secs_f64(),
        }
    }

    /// Mark closed and drop the OS handle. Readers are cleared by the
    /// caller who knows why.
    fn shut(&self) {
        self.stop.store(true, Ordering::SeqCst);
        self.state.lock().expect("session mutex poisoned").open = false;
        *self.conn.lock().expect("conn mutex poisoned") = None;
        self.writer_freed.notify_all();
    }
}

type SessionMap = Arc<Mutex<HashMap<String, Arc<SerialSession>>>>;

/// The shared serial manager.
pub struct SharedSerialManager {
    sessions: SessionMap,
    provider: Arc<dyn SerialPortProvider>,
    bus: EventBus,
    config: SerialConfig,
}

impl std::fmt::Debug for SharedSerialManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedSerialManager").finish_non_exhaustive()
    }
}

impl SharedSerialManager {
    /// Create a manager over the given provider.
    #[must_use]
    pub fn new(provider: Arc<dyn SerialPortProvider>, bus: EventBus, config: SerialConfig) -> Self {
        Self {
            sessions: Arc::new(Mutex::new(HashMap::new())),
            provider,
            bus,
            config,
        }
    }

    /// Open a port, or join the session if it is already open. The first
    /// opener's baud rate sticks. Returns false when the OS open fails.
    pub fn open_port(&self, port: &str, baud: u32, client_id: &ClientId) -> bool {
        {
            let sessions = self.sessions.lock().expect("session map mutex poisoned");
            if let Some(session) = sessions.get(port)
                && session.state.lock().expect("session mutex poisoned").open
            {
                debug!(port, %client_id, "joining existing serial session");
                return true;
            }
        }

        let conn = match self.provider.open(port, baud) {
            Ok(conn) => conn,
            Err(e) => {
                warn!(port, error = %e, "failed to open serial port");
                return false;
            },
        };

        let session = Arc::new(SerialSession {
            port: port.to_owned(),
            baud,
            created_at: Instant::now(),
            state: Mutex::new(SessionState {
                open: true,
                readers: HashSet::new(),
                writer: None,
                lines: VecDeque::new(),
                partial: String::new(),
            }),
            writer_freed: Condvar::new(),
            conn: Mutex::new(Some(conn)),
            stop: AtomicBool::new(false),
        });

        self.sessions
            .lock()
            .expect("session map mutex poisoned")
            .insert(port.to_owned(), Arc::clone(&session));

        spawn_reader_thread(
            Arc::clone(&session),
            Arc::clone(&self.sessions),
            self.bus.clone(),
            self.config.max_buffer_lines,
        );

        info!(port, baud, %client_id, "serial session created");
        true
    }

    /// Attach a client as a reader. Idempotent: repeated attaches keep a
    /// reader-set size of one for that client.
    pub fn attach_reader(&self, port: &str, client_id: &ClientId) -> bool {
        let Some(session) = self.session(port) else {
            return false;
        };
        let mut state = session.state.lock().expect("session mutex poisoned");
        if !state.open {
            return false;
        }
        state.readers.insert(client_id.clone());
        debug!(port, %client_id, readers = state.readers.len(), "reader attached");
        true
    }

    /// Detach a reader. When the last reader leaves (and no writer holds
    /// the port), the session closes. Repeated detaches return false.
    pub fn detach_reader(&self, port: &str, client_id: &ClientId) -> bool {
        let Some(session) = self.session(port) else {
            return false;
        };
        let close_now = {
            let mut state = session.state.lock().expect("session mutex poisoned");
            if !state.readers.remove(client_id) {
                return false;
            }
            debug!(port, %client_id, readers = state.readers.len(), "reader detached");
            self.config.close_on_last_reader && state.readers.is_empty() && state.writer.is_none()
        };
        if close_now {
            close_session(&self.sessions, &session, &self.bus, "last reader detached");
        }
        true
    }

    /// Acquire the writer slot, waiting up to `timeout_secs`. Reentrant
    /// for the current writer. `timeout_secs = 0` is non-blocking.
    pub fn acquire_writer(&self, port: &str, client_id: &ClientId, timeout_secs: f64) -> bool {
        let Some(session) = self.session(port) else {
            return false;
        };
        let deadline =
            Instant::now() + Duration::from_secs_f64(timeout_secs.clamp(0.0, 24.0 * 3600.0));
        let mut state = session.state.lock().expect("session mutex poisoned");
        loop {
            if !state.open {
                return false;
            }
            if state.writer.is_none() {
                state.writer = Some(client_id.clone());
                debug!(port, %client_id, "writer acquired");
                return true;
            }
            if state.writer.as_ref() == Some(client_id) {
                // Reentrant: the current writer keeps its slot.
                return true;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return false;
            }
            let (guard, _) = session
                .writer_freed
                .wait_timeout(state, remaining)
                .expect("session mutex poisoned");
            state = guard;
        }
    }

    /// Release the writer slot. Returns false when the caller is not the
    /// writer.
    pub fn release_writer(&self, port: &str, client_id: &ClientId) -> bool {
        let Some(session) = self.session(port) else {
            return false;
        };
        let close_now = {
            let mut state = session.state.lock().expect("session mutex poisoned");
            if state.writer.as_ref() != Some(client_id) {
                return false;
            }
            state.writer = None;
            session.writer_freed.notify_all();
            debug!(port, %client_id, "writer released");
            self.config.close_on_last_reader && state.readers.is_empty()
        };
        if close_now {
            close_session(&self.sessions, &session, &self.bus, "last reader detached");
        }
        true
    }

    /// Write bytes to the port. The caller must hold the writer slot.
    ///
    /// # Errors
    ///
    /// Returns [`KernelError::Serial`] when the caller is not the writer,
    /// the session is closed, or the OS write fails.
    pub fn write(&self, port: &str, client_id: &ClientId, data: &[u8]) -> KernelResult<usize> {
        let session = self.session(port).ok_or_else(|| KernelError::Serial {
            port: port.to_owned(),
            message: "no session for port".to_owned(),
        })?;
        {
            let state = session.state.lock().expect("session mutex poisoned");
            if !state.open {
                return Err(KernelError::Serial {
                    port: port.to_owned(),
                    message: "session is closed".to_owned(),
                });
            }
            if state.writer.as_ref() != Some(client_id) {
                return Err(KernelError::Serial {
                    port: port.to_owned(),
                    message: "writer not held".to_owned(),
                });
            }
        }
        let mut conn = session.conn.lock().expect("conn mutex poisoned");
        let conn = conn.as_mut().ok_or_else(|| KernelError::Serial {
            port: port.to_owned(),
            message: "session is closed".to_owned(),
        })?;
        conn.write(data).map_err(|e| KernelError::Serial {
            port: port.to_owned(),
            message: e.to_string(),
        })
    }

    /// Drain up to `max_lines` buffered lines. Only attached readers see
    /// data; others get an empty list.
    #[must_use]
    pub fn read_buffer(&self, port: &str, client_id: &ClientId, max_lines: usize) -> Vec<String> {
        let Some(session) = self.session(port) else {
            return Vec::new();
        };
        let mut state = session.state.lock().expect("session mutex poisoned");
        if !state.readers.contains(client_id) {
            return Vec::new();
        }
        let n = max_lines.min(state.lines.len());
        state.lines.drain(..n).collect()
    }

    /// Feed device output into a session directly (reader threads call
    /// this path internally; exposed for tests and replay tooling).
    pub fn broadcast_output(&self, port: &str, data: &[u8]) {
        if let Some(session) = self.session(port) {
            session.ingest(data, &self.bus, self.config.max_buffer_lines);
        }
    }

    /// Close a port explicitly.
    ///
    /// # Errors
    ///
    /// Returns [`KernelError::PortBusy`] while readers remain attached or a
    /// writer holds the port.
    pub fn close_port(&self, port: &str) -> KernelResult<bool> {
        let Some(session) = self.session(port) else {
            return Ok(false);
        };
        {
            let state = session.state.lock().expect("session mutex poisoned");
            if !state.readers.is_empty() || state.writer.is_some() {
                return Err(KernelError::PortBusy {
                    port: port.to_owned(),
                    readers: state.readers.len(),
                    has_writer: state.writer.is_some(),
                });
            }
        }
        close_session(&self.sessions, &session, &self.bus, "closed explicitly");
        Ok(true)
    }

    /// Cascade removal of a client from every session: reader sets and
    /// writer slots. Sessions left with no readers close.
    pub fn disconnect_client(&self, client_id: &ClientId) {
        let sessions: Vec<Arc<SerialSession>> = {
            let map = self.sessions.lock().expect("session map mutex poisoned");
            map.values().cloned().collect()
        };
        for session in sessions {
            let close_now = {
                let mut state = session.state.lock().expect("session mutex poisoned");
                let was_reader = state.readers.remove(client_id);
                let was_writer = state.writer.as_ref() == Some(client_id);
                if was_writer {
                    state.writer = None;
                    session.writer_freed.notify_all();
                }
                (was_reader || was_writer)
                    && self.config.close_on_last_reader
                    && state.readers.is_empty()
                    && state.writer.is_none()
            };
            if close_now {
                close_session(&self.sessions, &session, &self.bus, "client disconnected");
            }
        }
    }

    /// Introspect one session.
    #[must_use]
    pub fn get_session_info(&self, port: &str) -> Option<SessionInfo> {
        self.session(port).map(|s| s.info())
    }

    /// Introspect all sessions.
    #[must_use]
    pub fn get_all_sessions(&self) -> Vec<SessionInfo> {
        let map = self.sessions.lock().expect("session map mutex poisoned");
        map.values().map(|s| s.info()).collect()
    }

    fn session(&self, port: &str) -> Option<Arc<SerialSession>> {
        self.sessions
            .lock()
            .expect("session map mutex poisoned")
            .get(port)
            .cloned()
    }
}

/// Close a session: stop its thread, drop the handle, clear readers,
/// remove it from the map and announce the closure.
fn close_session(sessions: &SessionMap, session: &Arc<SerialSession>, bus: &EventBus, reason: &str) {
    session.shut();
    session
        .state
        .lock()
        .expect("session mutex poisoned")
        .readers
        .clear();
    sessions
        .lock()
        .expect("session map mutex poisoned")
        .remove(&session.port);
    info!(port = %session.port, reason, "serial session closed");
    bus.publish(DaemonEvent::SerialClosed {
        port: session.port.clone(),
        reason: reason.to_owned(),
    });
}

/// Spawn the per-port reader thread.
fn spawn_reader_thread(
    session: Arc<SerialSession>,
    sessions: SessionMap,
    bus: EventBus,
    max_lines: usize,
) {
    let port = session.port.clone();
    std::thread::Builder::new()
        .name(format!("serial-{port}"))
        .spawn(move || {
            let mut buf = [0u8; 4096];
            while !session.stop.load(Ordering::SeqCst) {
                let read = {
                    let mut conn = session.conn.lock().expect("conn mutex poisoned");
                    match conn.as_mut() {
                        Some(conn) => conn.read(&mut buf),
                        None => break,
                    }
                };
                match read {
                    Ok(0) => {},
                    Ok(n) => session.ingest(&buf[..n], &bus, max_lines),
                    Err(e) if e.kind() == io::ErrorKind::TimedOut => {},
                    Err(e) => {
                        if session.stop.load(Ordering::SeqCst) {
                            break;
                        }
                        warn!(port = %session.port, error = %e, "serial I/O error, closing session");
                        close_session(&sessions, &session, &bus, &format!("I/O error: {e}"));
                        break;
                    },
                }
            }
            debug!(port = %session.port, "reader thread exiting");
        })
        .expect("failed to spawn serial reader thread");
}
