//! Serial transport abstraction.
//!
//! The session manager owns sessions and buffers; actually talking to the
//! OS goes through [`SerialPortProvider`]. Production uses the
//! `serialport` crate; tests use [`LoopbackProvider`], which lets a test
//! inject device output and observe writes without hardware.

use std::io;
use std::sync::Arc;
use std::sync::mpsc;
use std::time::Duration;

use tracing::debug;

/// Read timeout used by per-port reader threads. Short enough that a
/// session close is noticed promptly, long enough to avoid spinning.
pub const READ_TIMEOUT: Duration = Duration::from_millis(100);

/// An open serial connection.
///
/// `read` blocks up to [`READ_TIMEOUT`] and signals an idle interval with
/// `ErrorKind::TimedOut`; the reader thread treats that as "no data yet",
/// not an error.
pub trait SerialConnection: Send {
    /// Read available bytes. A timeout yields `ErrorKind::TimedOut`.
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;
    /// Write bytes to the device.
    fn write(&mut self, data: &[u8]) -> io::Result<usize>;
}

/// Opens serial connections.
pub trait SerialPortProvider: Send + Sync {
    /// Open `port` at `baud`.
    ///
    /// # Errors
    ///
    /// Returns an I/O error when the port cannot be opened.
    fn open(&self, port: &str, baud: u32) -> io::Result<Box<dyn SerialConnection>>;
}

// ---------------------------------------------------------------------------
// System provider
// ---------------------------------------------------------------------------

/// Provider backed by the `serialport` crate.
#[derive(Debug, Default)]
pub struct SystemSerialProvider;

struct SystemConnection {
    inner: Box<dyn serialport::SerialPort>,
}

impl SerialConnection for SystemConnection {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.read(buf)
    }

    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        let written = self.inner.write(data)?;
        self.inner.flush()?;
        Ok(written)
    }
}

impl SerialPortProvider for SystemSerialProvider {
    fn open(&self, port: &str, baud: u32) -> io::Result<Box<dyn SerialConnection>> {
        let inner = serialport::new(port, baud)
            .timeout(READ_TIMEOUT)
            .open()
            .map_err(|e| io::Error::other(e.to_string()))?;
        debug!(port, baud, "serial port opened");
        Ok(Box::new(SystemConnection { inner }))
    }
}

// ---------------------------------------------------------------------------
// Loopback provider (tests)
// ---------------------------------------------------------------------------

/// In-memory provider: reads come from an injectable channel, writes are
/// captured for inspection.
#[derive(Debug, Default, Clone)]
pub struct LoopbackProvider {
    inner: Arc<std::sync::Mutex<LoopbackState>>,
}

#[derive(Debug, Default)]
struct LoopbackState {
    /// Per-port injectors created on open.
    ports: std::collections::HashMap<String, LoopbackHandleInner>,
    /// Ports that refuse to open.
    broken: std::collections::HashSet<String>,
}

#[derive(Debug)]
struct LoopbackHandleInner {
    to_device: Arc<std::sync::Mutex<Vec<u8>>>,
    from_device: mpsc::Sender<Vec<u8>>,
}

/// Test handle for one opened loopback port.
#[derive(Debug, Clone)]
pub struct LoopbackHandle {
    written: Arc<std::sync::Mutex<Vec<u8>>>,
    injector: mpsc::Sender<Vec<u8>>,
}

impl LoopbackHandle {
    /// Bytes the daemon wrote to the device so far.
    #[must_use]
    pub fn written(&self) -> Vec<u8> {
        self.written.lock().expect("loopback mutex poisoned").clone()
    }

    /// Inject bytes as if the device produced them.
    pub fn inject(&self, data: &[u8]) {
        let _ = self.injector.send(data.to_vec());
    }
}

struct LoopbackConnection {
    written: Arc<std::sync::Mutex<Vec<u8>>>,
    incoming: mpsc::Receiver<Vec<u8>>,
    pending: Vec<u8>,
}

impl SerialConnection for LoopbackConnection {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.pending.is_empty() {
            match self.incoming.recv_timeout(READ_TIMEOUT) {
                Ok(data) => self.pending = data,
                Err(mpsc::RecvTimeoutError::Timeout) => {
                    return Err(io::Error::new(io::ErrorKind::TimedOut, "no data"));
                },
                Err(mpsc::RecvTimeoutError::Disconnected) => {
                    return Err(io::Error::new(io::ErrorKind::BrokenPipe, "device gone"));
                },
            }
        }
        let n = self.pending.len().min(buf.len());
        buf[..n].copy_from_slice(&self.pending[..n]);
        self.pending.drain(..n);
        Ok(n)
    }

    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.written
            .lock()
            .expect("loopback mutex poisoned")
            .extend_from_slice(data);
        Ok(data.len())
    }
}

impl LoopbackProvider {
    /// Create an empty loopback provider.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `port` fail to open.
    pub fn break_port(&self, port: &str) {
        self.inner
            .lock()
            .expect("loopback mutex poisoned")
            .broken
            .insert(port.to_owned());
    }

    /// Get the test handle for a port opened through this provider.
    #[must_use]
    pub fn handle(&self, port: &str) -> Option<LoopbackHandle> {
        let state = self.inner.lock().expect("loopback mutex poisoned");
        state.ports.get(port).map(|h| LoopbackHandle {
            written: Arc::clone(&h.to_device),
            injector: h.from_device.clone(),
        })
    }
}

impl SerialPortProvider for LoopbackProvider {
    fn open(&self, port: &str, _baud: u32) -> io::Result<Box<dyn SerialConnection>> {
        let mut state = self.inner.lock().expect("loopback mutex poisoned");
        if state.broken.contains(port) {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("no such port: {port}"),
            ));
        }
        let (tx, rx) = mpsc::channel();
        let written = Arc::new(std::sync::Mutex::new(Vec::new()));
        state.ports.insert(
            port.to_owned(),
            LoopbackHandleInner {
                to_device: Arc::clone(&written),
                from_device: tx,
            },
        );
        Ok(Box::new(LoopbackConnection {
            written,
            incoming: rx,
            pending: Vec::new(),
        }))
    }
}
