//! fbuild Client - async library for talking to the fbuild daemon.
//!
//! [`DaemonClient::connect`] performs the CONNECT exchange, starts a read
//! pump that correlates responses to in-flight requests by `request_id`,
//! and starts a background heartbeat. Broadcast frames are fanned out to
//! [`DaemonClient::subscribe_broadcasts`] receivers.
//!
//! ```rust,no_run
//! use fbuild_client::{ClientInfo, DaemonClient};
//!
//! # async fn demo() -> Result<(), fbuild_client::ClientError> {
//! let client = DaemonClient::connect("127.0.0.1:9876", ClientInfo::default()).await?;
//! let reply = client
//!     .acquire_lock("/home/dev/blinky", "esp32dev", "/dev/ttyUSB0", "exclusive", 60.0, "flash")
//!     .await?;
//! assert_eq!(reply["success"], true);
//! client.disconnect().await;
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]

mod error;

pub use error::ClientError;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{Value, json};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use fbuild_core::{ClientId, RequestId};
use fbuild_protocol::{FrameReader, Message, MessageType, encode_bytes};

/// Default bound on one request/response round trip.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Default heartbeat cadence.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(1);

/// Identity a client presents at CONNECT.
#[derive(Debug, Clone)]
pub struct ClientInfo {
    /// This process's id.
    pub pid: u32,
    /// This host's name.
    pub hostname: String,
    /// Client software version.
    pub version: String,
}

impl Default for ClientInfo {
    fn default() -> Self {
        Self {
            pid: std::process::id(),
            hostname: std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_owned()),
            version: env!("CARGO_PKG_VERSION").to_owned(),
        }
    }
}

type PendingMap = Arc<Mutex<HashMap<RequestId, oneshot::Sender<Value>>>>;

/// A connected daemon client.
pub struct DaemonClient {
    client_id: ClientId,
    writer: Arc<tokio::sync::Mutex<OwnedWriteHalf>>,
    pending: PendingMap,
    broadcasts: broadcast::Sender<Value>,
    closed: Arc<AtomicBool>,
    read_task: JoinHandle<()>,
    heartbeat_task: JoinHandle<()>,
}

impl DaemonClient {
    /// Connect to the daemon and perform the CONNECT exchange.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError`] on connection failure, a rejected CONNECT,
    /// or a timeout.
    pub async fn connect(
        addr: impl tokio::net::ToSocketAddrs,
        info: ClientInfo,
    ) -> Result<Self, ClientError> {
        let stream = TcpStream::connect(addr).await?;
        let (read_half, write_half) = stream.into_split();

        let writer = Arc::new(tokio::sync::Mutex::new(write_half));
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let (broadcasts, _) = broadcast::channel(256);
        let closed = Arc::new(AtomicBool::new(false));

        let read_task = tokio::spawn(read_pump(
            read_half,
            Arc::clone(&pending),
            broadcasts.clone(),
            Arc::clone(&closed),
        ));

        // CONNECT before the heartbeat starts; the server assigns our id.
        let connect_reply = send_request(
            &writer,
            &pending,
            MessageType::Connect,
            None,
            json!({
                "pid": info.pid,
                "hostname": info.hostname,
                "version": info.version,
            }),
        )
        .await?;
        if connect_reply["success"] != Value::Bool(true) {
            read_task.abort();
            return Err(ClientError::Rejected(
                connect_reply["message"].as_str().unwrap_or("connect refused").to_owned(),
            ));
        }
        let client_id = connect_reply["client_id"]
            .as_str()
            .map(ClientId::new)
            .ok_or_else(|| ClientError::Protocol("connect reply missing client_id".to_owned()))?;
        debug!(%client_id, "connected to daemon");

        let heartbeat_task = tokio::spawn(heartbeat_pump(
            Arc::clone(&writer),
            client_id.clone(),
            Arc::clone(&closed),
        ));

        Ok(Self {
            client_id,
            writer,
            pending,
            broadcasts,
            closed,
            read_task,
            heartbeat_task,
        })
    }

    /// The server-assigned client id.
    #[must_use]
    pub fn client_id(&self) -> &ClientId {
        &self.client_id
    }

    /// Receive broadcast frames (the `data` object of each BROADCAST).
    #[must_use]
    pub fn subscribe_broadcasts(&self) -> broadcast::Receiver<Value> {
        self.broadcasts.subscribe()
    }

    /// Send one typed request and await its response payload.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError`] on transport failure or timeout. A
    /// `{"success": false}` payload is returned as `Ok`; callers decide
    /// how to react.
    pub async fn request(&self, msg_type: MessageType, data: Value) -> Result<Value, ClientError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ClientError::Closed);
        }
        send_request(
            &self.writer,
            &self.pending,
            msg_type,
            Some(self.client_id.clone()),
            data,
        )
        .await
    }

    // -- typed helpers ------------------------------------------------------

    /// Acquire a configuration lock.
    pub async fn acquire_lock(
        &self,
        project_dir: &str,
        environment: &str,
        port: &str,
        lock_type: &str,
        timeout: f64,
        description: &str,
    ) -> Result<Value, ClientError> {
        self.request(
            MessageType::LockAcquire,
            json!({
                "project_dir": project_dir,
                "environment": environment,
                "port": port,
                "lock_type": lock_type,
                "timeout": timeout,
                "description": description,
            }),
        )
        .await
    }

    /// Acquire without blocking; fails immediately when contended.
    pub async fn try_acquire_lock(
        &self,
        project_dir: &str,
        environment: &str,
        port: &str,
        lock_type: &str,
        description: &str,
    ) -> Result<Value, ClientError> {
        self.request(
            MessageType::LockAcquire,
            json!({
                "project_dir": project_dir,
                "environment": environment,
                "port": port,
                "lock_type": lock_type,
                "timeout": 0.0,
                "blocking": false,
                "description": description,
            }),
        )
        .await
    }

    /// Release a configuration lock.
    pub async fn release_lock(
        &self,
        project_dir: &str,
        environment: &str,
        port: &str,
    ) -> Result<Value, ClientError> {
        self.request(
            MessageType::LockRelease,
            json!({ "project_dir": project_dir, "environment": environment, "port": port }),
        )
        .await
    }

    /// Query a configuration lock.
    pub async fn lock_status(
        &self,
        project_dir: &str,
        environment: &str,
        port: &str,
    ) -> Result<Value, ClientError> {
        self.request(
            MessageType::LockStatus,
            json!({ "project_dir": project_dir, "environment": environment, "port": port }),
        )
        .await
    }

    /// List devices.
    pub async fn list_devices(&self, refresh: bool) -> Result<Value, ClientError> {
        self.request(MessageType::DeviceList, json!({ "refresh": refresh }))
            .await
    }

    /// Acquire a device lease.
    pub async fn lease_device(
        &self,
        device_id: &str,
        lease_type: &str,
        description: &str,
        allows_monitors: bool,
    ) -> Result<Value, ClientError> {
        self.request(
            MessageType::DeviceLease,
            json!({
                "device_id": device_id,
                "lease_type": lease_type,
                "description": description,
                "allows_monitors": allows_monitors,
                "timeout": 0.0,
            }),
        )
        .await
    }

    /// Release a device lease.
    pub async fn release_lease(&self, lease_id: &str) -> Result<Value, ClientError> {
        self.request(MessageType::DeviceRelease, json!({ "lease_id": lease_id }))
            .await
    }

    /// Preempt the exclusive lease on a device. The reason must be
    /// non-empty or the daemon refuses.
    pub async fn preempt_device(&self, device_id: &str, reason: &str) -> Result<Value, ClientError> {
        self.request(
            MessageType::DevicePreempt,
            json!({ "device_id": device_id, "reason": reason }),
        )
        .await
    }

    /// Query one device.
    pub async fn device_status(&self, device_id: &str) -> Result<Value, ClientError> {
        self.request(MessageType::DeviceStatus, json!({ "device_id": device_id }))
            .await
    }

    /// Attach to a serial session.
    pub async fn serial_attach(&self, port: &str, baud_rate: u32) -> Result<Value, ClientError> {
        self.request(
            MessageType::SerialAttach,
            json!({ "port": port, "baud_rate": baud_rate, "as_reader": true }),
        )
        .await
    }

    /// Detach from a serial session.
    pub async fn serial_detach(&self, port: &str) -> Result<Value, ClientError> {
        self.request(MessageType::SerialDetach, json!({ "port": port })).await
    }

    /// Write bytes, acquiring the writer slot around the write.
    pub async fn serial_write(&self, port: &str, data: &[u8]) -> Result<Value, ClientError> {
        self.request(
            MessageType::SerialWrite,
            json!({
                "port": port,
                "data": encode_bytes(data),
                "acquire_writer": true,
            }),
        )
        .await
    }

    /// Drain buffered output lines.
    pub async fn serial_read_buffer(
        &self,
        port: &str,
        max_lines: usize,
    ) -> Result<Value, ClientError> {
        self.request(
            MessageType::SerialReadBuffer,
            json!({ "port": port, "max_lines": max_lines }),
        )
        .await
    }

    /// Ask whether deployed firmware is current.
    pub async fn firmware_query(
        &self,
        port: &str,
        source_hash: &str,
        build_flags_hash: Option<&str>,
    ) -> Result<Value, ClientError> {
        self.request(
            MessageType::FirmwareQuery,
            json!({
                "port": port,
                "source_hash": source_hash,
                "build_flags_hash": build_flags_hash,
            }),
        )
        .await
    }

    /// Record a completed deployment.
    #[allow(clippy::too_many_arguments)]
    pub async fn firmware_record(
        &self,
        port: &str,
        firmware_hash: &str,
        source_hash: &str,
        build_flags_hash: &str,
        project_dir: &str,
        environment: &str,
    ) -> Result<Value, ClientError> {
        self.request(
            MessageType::FirmwareRecord,
            json!({
                "port": port,
                "firmware_hash": firmware_hash,
                "source_hash": source_hash,
                "build_flags_hash": build_flags_hash,
                "project_dir": project_dir,
                "environment": environment,
            }),
        )
        .await
    }

    /// Subscribe to event categories, optionally narrowed by a filter key.
    pub async fn subscribe(
        &self,
        event_types: &[&str],
        filter_key: Option<&str>,
    ) -> Result<Value, ClientError> {
        self.request(
            MessageType::Subscribe,
            json!({ "event_types": event_types, "filter_key": filter_key }),
        )
        .await
    }

    /// Unsubscribe from event categories.
    pub async fn unsubscribe(&self, event_types: &[&str]) -> Result<Value, ClientError> {
        self.request(MessageType::Unsubscribe, json!({ "event_types": event_types }))
            .await
    }

    /// Graceful goodbye: stops the heartbeat, tells the daemon, and tears
    /// the connection down.
    pub async fn disconnect(self) {
        self.closed.store(true, Ordering::SeqCst);
        let _ = self
            .request_raw_best_effort(MessageType::Disconnect, json!({ "reason": "client shutdown" }))
            .await;
        self.heartbeat_task.abort();
        self.read_task.abort();
        let mut writer = self.writer.lock().await;
        let _ = writer.shutdown().await;
    }

    async fn request_raw_best_effort(&self, msg_type: MessageType, data: Value) -> bool {
        let message = Message {
            msg_type,
            client_id: Some(self.client_id.clone()),
            request_id: Some(RequestId::generate()),
            timestamp: fbuild_protocol::wire_timestamp(),
            data,
        };
        let mut writer = self.writer.lock().await;
        writer.write_all(&message.encode()).await.is_ok()
    }
}

impl std::fmt::Debug for DaemonClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DaemonClient")
            .field("client_id", &self.client_id)
            .finish_non_exhaustive()
    }
}

impl Drop for DaemonClient {
    fn drop(&mut self) {
        self.closed.store(true, Ordering::SeqCst);
        self.heartbeat_task.abort();
        self.read_task.abort();
    }
}

/// Send one request and wait for the correlated response.
async fn send_request(
    writer: &Arc<tokio::sync::Mutex<OwnedWriteHalf>>,
    pending: &PendingMap,
    msg_type: MessageType,
    client_id: Option<ClientId>,
    data: Value,
) -> Result<Value, ClientError> {
    let message = Message::request(msg_type, client_id, data);
    let request_id = message
        .request_id
        .clone()
        .expect("request constructor always sets request_id");

    let (tx, rx) = oneshot::channel();
    pending
        .lock()
        .expect("pending map mutex poisoned")
        .insert(request_id.clone(), tx);

    {
        let mut writer = writer.lock().await;
        writer.write_all(&message.encode()).await?;
        writer.flush().await?;
    }

    let reply = tokio::time::timeout(REQUEST_TIMEOUT, rx).await;
    match reply {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(_)) => Err(ClientError::Closed),
        Err(_) => {
            pending
                .lock()
                .expect("pending map mutex poisoned")
                .remove(&request_id);
            Err(ClientError::Timeout)
        },
    }
}

/// Read frames and route them: responses to their waiters, broadcasts to
/// the fan-out channel.
async fn read_pump(
    mut reader: OwnedReadHalf,
    pending: PendingMap,
    broadcasts: broadcast::Sender<Value>,
    closed: Arc<AtomicBool>,
) {
    let mut frames = FrameReader::new();
    let mut buf = vec![0u8; 65536];
    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        for frame in frames.push(&buf[..n]) {
            let Ok(frame) = frame else { continue };
            let Ok(message) = Message::decode(&frame) else {
                warn!("undecodable frame from daemon");
                continue;
            };
            match message.msg_type {
                MessageType::Response | MessageType::Error => {
                    if let Some(request_id) = &message.request_id {
                        let waiter = pending
                            .lock()
                            .expect("pending map mutex poisoned")
                            .remove(request_id);
                        if let Some(waiter) = waiter {
                            let _ = waiter.send(message.data);
                        }
                    }
                },
                MessageType::Broadcast => {
                    let _ = broadcasts.send(message.data);
                },
                other => debug!(msg_type = %other, "ignoring unexpected frame"),
            }
        }
    }
    closed.store(true, Ordering::SeqCst);
    debug!("read pump stopped");
}

/// Beat once per interval until closed.
async fn heartbeat_pump(
    writer: Arc<tokio::sync::Mutex<OwnedWriteHalf>>,
    client_id: ClientId,
    closed: Arc<AtomicBool>,
) {
    loop {
        tokio::time::sleep(HEARTBEAT_INTERVAL).await;
        if closed.load(Ordering::SeqCst) {
            break;
        }
        let message = Message::request(MessageType::Heartbeat, Some(client_id.clone()), json!({}));
        let mut writer = writer.lock().await;
        if writer.write_all(&message.encode()).await.is_err() {
            closed.store(true, Ordering::SeqCst);
            break;
        }
    }
    debug!("heartbeat pump stopped");
}
