//! The daemon server: transport, framing, routing and broadcast fan-out.
//!
//! One task per connection reads newline-delimited JSON frames, dispatches
//! each message to its handler and writes the reply. Background tasks
//! sweep dead heartbeats and pump bus events out to wire subscribers.
//!
//! # Locking
//!
//! The client map lock is held only to insert, remove, or snapshot
//! connections. Actual sends serialize per-client through each
//! connection's own writer mutex, so one slow client never blocks a
//! broadcast to the others. Handlers that block (lock or writer
//! acquisition with a timeout) run on `spawn_blocking` threads.

mod handlers;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use fbuild_core::ClientId;
use fbuild_events::DaemonEvent;
use fbuild_protocol::{FrameReader, Message, MessageType, SubscriptionType};

use crate::context::DaemonContext;
use crate::error::{KernelError, KernelResult};

/// Read chunk size for connection reads.
const READ_BUFFER_SIZE: usize = 65536;

/// Bound on one outbound write.
const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// One connected client.
pub(crate) struct ClientConn {
    pub(crate) client_id: ClientId,
    peer: String,
    writer: tokio::sync::Mutex<BoxedWriter>,
    last_heartbeat: std::sync::Mutex<Instant>,
    pub(crate) subscriptions: std::sync::Mutex<HashSet<SubscriptionType>>,
    pub(crate) filter_key: std::sync::Mutex<Option<String>>,
    connected: AtomicBool,
}

impl ClientConn {
    fn new(client_id: ClientId, peer: String, writer: BoxedWriter) -> Self {
        Self {
            client_id,
            peer,
            writer: tokio::sync::Mutex::new(writer),
            last_heartbeat: std::sync::Mutex::new(Instant::now()),
            subscriptions: std::sync::Mutex::new(HashSet::new()),
            filter_key: std::sync::Mutex::new(None),
            connected: AtomicBool::new(true),
        }
    }

    pub(crate) fn touch(&self) {
        *self
            .last_heartbeat
            .lock()
            .expect("heartbeat mutex poisoned") = Instant::now();
    }

    fn is_alive(&self, timeout: Duration) -> bool {
        self.connected.load(Ordering::SeqCst)
            && self
                .last_heartbeat
                .lock()
                .expect("heartbeat mutex poisoned")
                .elapsed()
                <= timeout
    }

    /// Send one frame through this client's writer mutex.
    async fn send(&self, message: &Message) -> bool {
        if !self.connected.load(Ordering::SeqCst) {
            return false;
        }
        let bytes = message.encode();
        let mut writer = self.writer.lock().await;
        let result = tokio::time::timeout(WRITE_TIMEOUT, async {
            writer.write_all(&bytes).await?;
            writer.flush().await
        })
        .await;
        match result {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                debug!(client_id = %self.client_id, error = %e, "send failed");
                false
            },
            Err(_) => {
                warn!(client_id = %self.client_id, "send timed out");
                false
            },
        }
    }

    fn wants(&self, event: &DaemonEvent) -> bool {
        let subscriptions = self
            .subscriptions
            .lock()
            .expect("subscriptions mutex poisoned");
        let event_type = event.subscription_type();
        if !subscriptions.contains(&SubscriptionType::All) && !subscriptions.contains(&event_type) {
            return false;
        }
        drop(subscriptions);

        // A filter key narrows delivery for events that carry one.
        let filter = self.filter_key.lock().expect("filter mutex poisoned");
        match (filter.as_deref(), event.filter_key()) {
            (Some(wanted), Some(actual)) => wanted == actual,
            _ => true,
        }
    }
}

/// Handle to a running server.
#[derive(Debug)]
pub struct ServerHandle {
    /// Bound TCP address (useful when the configured port was 0).
    pub local_addr: std::net::SocketAddr,
    shutdown: broadcast::Sender<()>,
}

impl ServerHandle {
    /// Signal the server to stop accepting and close all connections.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(());
    }
}

/// The daemon server.
pub struct DaemonServer {
    context: Arc<DaemonContext>,
    clients: tokio::sync::Mutex<HashMap<ClientId, Arc<ClientConn>>>,
    shutdown: broadcast::Sender<()>,
}

impl DaemonServer {
    /// Create a server over the given context.
    #[must_use]
    pub fn new(context: Arc<DaemonContext>) -> Arc<Self> {
        let (shutdown, _) = broadcast::channel(4);
        Arc::new(Self {
            context,
            clients: tokio::sync::Mutex::new(HashMap::new()),
            shutdown,
        })
    }

    /// Number of connected clients.
    pub async fn client_count(&self) -> usize {
        self.clients.lock().await.len()
    }

    /// Bind listeners and spawn the accept, heartbeat and broadcast tasks.
    ///
    /// # Errors
    ///
    /// Returns [`KernelError::Bind`] when the TCP listener cannot bind.
    pub async fn serve(self: &Arc<Self>) -> KernelResult<ServerHandle> {
        let bind_addr = format!(
            "{}:{}",
            self.context.config.network.host, self.context.config.network.port
        );
        let listener = TcpListener::bind(&bind_addr)
            .await
            .map_err(|source| KernelError::Bind {
                addr: bind_addr.clone(),
                source,
            })?;
        let local_addr = listener.local_addr().map_err(|source| KernelError::Bind {
            addr: bind_addr,
            source,
        })?;
        info!(%local_addr, "daemon server listening");

        let server = Arc::clone(self);
        tokio::spawn(async move { server.accept_loop(listener).await });

        #[cfg(unix)]
        if self.context.config.network.unix_socket {
            self.spawn_unix_listener();
        }

        let server = Arc::clone(self);
        tokio::spawn(async move { server.heartbeat_monitor().await });

        let server = Arc::clone(self);
        tokio::spawn(async move { server.event_pump().await });

        Ok(ServerHandle {
            local_addr,
            shutdown: self.shutdown.clone(),
        })
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        let mut shutdown = self.shutdown.subscribe();
        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let (read_half, write_half) = stream.into_split();
                        self.start_connection(
                            Box::new(read_half),
                            Box::new(write_half),
                            peer.to_string(),
                        )
                        .await;
                    },
                    Err(e) => warn!(error = %e, "failed to accept TCP connection"),
                },
            }
        }
        self.close_all_clients("Server shutting down").await;
        info!("accept loop stopped");
    }

    #[cfg(unix)]
    fn spawn_unix_listener(self: &Arc<Self>) {
        let path = self.context.home.socket_path();
        if path.exists() {
            let _ = std::fs::remove_file(&path);
        }
        let listener = match tokio::net::UnixListener::bind(&path) {
            Ok(l) => l,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "failed to bind Unix socket");
                return;
            },
        };
        info!(path = %path.display(), "daemon server listening on Unix socket");

        let server = Arc::clone(self);
        tokio::spawn(async move {
            let mut shutdown = server.shutdown.subscribe();
            loop {
                tokio::select! {
                    _ = shutdown.recv() => break,
                    accepted = listener.accept() => match accepted {
                        Ok((stream, _)) => {
                            let (read_half, write_half) = stream.into_split();
                            server
                                .start_connection(
                                    Box::new(read_half),
                                    Box::new(write_half),
                                    "unix-socket".to_owned(),
                                )
                                .await;
                        },
                        Err(e) => warn!(error = %e, "failed to accept Unix connection"),
                    },
                }
            }
            let _ = std::fs::remove_file(&path);
        });
    }

    async fn start_connection(self: &Arc<Self>, reader: BoxedReader, writer: BoxedWriter, peer: String) {
        let client_id = ClientId::generate();
        info!(%client_id, peer, "new connection");
        let conn = Arc::new(ClientConn::new(client_id.clone(), peer, writer));
        self.clients.lock().await.insert(client_id, Arc::clone(&conn));

        let server = Arc::clone(self);
        tokio::spawn(async move {
            server.connection_loop(reader, Arc::clone(&conn)).await;
            server
                .disconnect_client(&conn.client_id, "Connection closed")
                .await;
        });
    }

    /// Read frames until the client goes away or times out.
    async fn connection_loop(self: &Arc<Self>, mut reader: BoxedReader, conn: Arc<ClientConn>) {
        let heartbeat_timeout =
            Duration::from_secs_f64(self.context.config.heartbeat.timeout_secs);
        let mut frames = FrameReader::new();
        let mut buf = vec![0u8; READ_BUFFER_SIZE];
        let mut shutdown = self.shutdown.subscribe();

        loop {
            let read = tokio::select! {
                _ = shutdown.recv() => break,
                read = tokio::time::timeout(heartbeat_timeout * 2, reader.read(&mut buf)) => read,
            };
            match read {
                Err(_elapsed) => {
                    if !conn.is_alive(heartbeat_timeout) {
                        warn!(client_id = %conn.client_id, "heartbeat timeout on read path");
                        break;
                    }
                },
                Ok(Ok(0)) => {
                    debug!(client_id = %conn.client_id, "client closed connection");
                    break;
                },
                Ok(Ok(n)) => {
                    for frame in frames.push(&buf[..n]) {
                        match frame {
                            Ok(frame) => self.process_frame(&conn, &frame).await,
                            Err(e) => {
                                // Format errors get an ERROR reply; the
                                // connection survives.
                                let _ = conn.send(&Message::error(None, e.to_string())).await;
                            },
                        }
                    }
                },
                Ok(Err(e)) => {
                    debug!(client_id = %conn.client_id, error = %e, "read error");
                    break;
                },
            }
        }
    }

    async fn process_frame(self: &Arc<Self>, conn: &Arc<ClientConn>, frame: &[u8]) {
        let message = match Message::decode(frame) {
            Ok(message) => message,
            Err(e) => {
                let _ = conn.send(&Message::error(None, e.to_string())).await;
                return;
            },
        };
        debug!(client_id = %conn.client_id, msg_type = %message.msg_type, "processing message");

        match message.msg_type {
            MessageType::Response | MessageType::Error | MessageType::Broadcast => {
                let _ = conn
                    .send(&Message::error(
                        message.request_id,
                        format!("unexpected message type: {}", message.msg_type),
                    ))
                    .await;
            },
            msg_type => {
                let response = self
                    .dispatch(conn, msg_type, message.data)
                    .await;
                let _ = conn.send(&Message::response(message.request_id, response)).await;
            },
        }
    }

    /// Background sweep disconnecting clients whose heartbeat lapsed.
    async fn heartbeat_monitor(self: Arc<Self>) {
        let timeout = Duration::from_secs_f64(self.context.config.heartbeat.timeout_secs);
        let mut shutdown = self.shutdown.subscribe();
        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                () = tokio::time::sleep(timeout / 2) => {},
            }
            let dead: Vec<ClientId> = {
                let clients = self.clients.lock().await;
                clients
                    .values()
                    .filter(|c| !c.is_alive(timeout))
                    .map(|c| c.client_id.clone())
                    .collect()
            };
            for client_id in dead {
                warn!(%client_id, "client heartbeat timeout, disconnecting");
                self.disconnect_client(&client_id, "Heartbeat timeout").await;
            }
        }
        debug!("heartbeat monitor stopped");
    }

    /// Forward bus events to subscribed clients.
    async fn event_pump(self: Arc<Self>) {
        let mut events = self.context.bus.subscribe();
        let mut shutdown = self.shutdown.subscribe();
        loop {
            let event = tokio::select! {
                _ = shutdown.recv() => break,
                event = events.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };
            self.broadcast_event(&event).await;
        }
        debug!("event pump stopped");
    }

    /// Deliver one event to every subscribed client. The client map lock
    /// is held only for the snapshot.
    pub(crate) async fn broadcast_event(&self, event: &DaemonEvent) -> usize {
        let conns: Vec<Arc<ClientConn>> = {
            let clients = self.clients.lock().await;
            clients.values().cloned().collect()
        };
        let frame = Message::broadcast(event.event_name(), event.payload());
        let mut sent = 0;
        for conn in conns {
            if conn.wants(event) && conn.send(&frame).await {
                sent += 1;
            }
        }
        debug!(event = event.event_name(), sent, "event broadcast");
        sent
    }

    /// Send a frame to one specific client.
    pub(crate) async fn send_to_client(&self, client_id: &ClientId, message: &Message) -> bool {
        let conn = {
            let clients = self.clients.lock().await;
            clients.get(client_id).cloned()
        };
        match conn {
            Some(conn) => conn.send(message).await,
            None => false,
        }
    }

    /// Disconnect a client and run cascade cleanup.
    pub(crate) async fn disconnect_client(&self, client_id: &ClientId, reason: &str) {
        let Some(conn) = self.clients.lock().await.remove(client_id) else {
            return;
        };
        conn.connected.store(false, Ordering::SeqCst);
        info!(%client_id, peer = %conn.peer, reason, "client disconnected");

        self.context.cleanup_client(client_id);
        self.context.bus.publish(DaemonEvent::ClientDisconnected {
            client_id: client_id.clone(),
            reason: reason.to_owned(),
        });
        self.context.refresh_status_runtime_info();
    }

    async fn close_all_clients(&self, reason: &str) {
        let ids: Vec<ClientId> = {
            let clients = self.clients.lock().await;
            clients.keys().cloned().collect()
        };
        for client_id in ids {
            self.disconnect_client(&client_id, reason).await;
        }
    }
}

impl std::fmt::Debug for DaemonServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DaemonServer").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fbuild_core::{ConfigKey, DeviceId};

    fn test_conn() -> ClientConn {
        let (_, writer) = tokio::io::duplex(1024);
        ClientConn::new(ClientId::new("c1"), "test".to_owned(), Box::new(writer))
    }

    fn lock_event() -> DaemonEvent {
        DaemonEvent::LockAcquired {
            client_id: ClientId::new("other"),
            key: ConfigKey::new("/p", "e", ""),
            lock_type: "exclusive".to_owned(),
        }
    }

    fn serial_event(port: &str) -> DaemonEvent {
        DaemonEvent::SerialOutput {
            port: port.to_owned(),
            data: String::new(),
        }
    }

    #[tokio::test]
    async fn test_unsubscribed_conn_wants_nothing() {
        let conn = test_conn();
        assert!(!conn.wants(&lock_event()));
        assert!(!conn.wants(&serial_event("/dev/ttyUSB0")));
    }

    #[tokio::test]
    async fn test_all_subscription_matches_every_category() {
        let conn = test_conn();
        conn.subscriptions
            .lock()
            .unwrap()
            .insert(SubscriptionType::All);
        assert!(conn.wants(&lock_event()));
        assert!(conn.wants(&serial_event("/dev/ttyUSB0")));
    }

    #[tokio::test]
    async fn test_filter_key_narrows_keyed_events_only() {
        let conn = test_conn();
        conn.subscriptions
            .lock()
            .unwrap()
            .extend([SubscriptionType::Serial, SubscriptionType::Locks]);
        *conn.filter_key.lock().unwrap() = Some("/dev/ttyUSB0".to_owned());

        assert!(conn.wants(&serial_event("/dev/ttyUSB0")));
        assert!(!conn.wants(&serial_event("/dev/ttyACM9")));
        // Events without a filter key are not narrowed.
        assert!(conn.wants(&lock_event()));
    }

    #[tokio::test]
    async fn test_device_events_filter_by_device_id() {
        let conn = test_conn();
        conn.subscriptions
            .lock()
            .unwrap()
            .insert(SubscriptionType::Devices);
        *conn.filter_key.lock().unwrap() = Some("usb-001".to_owned());

        let matching = DaemonEvent::DevicePreempted {
            device_id: DeviceId::new("usb-001"),
            preempted_by: ClientId::new("c2"),
            preempted_client_id: None,
            reason: "takeover".to_owned(),
        };
        let other = DaemonEvent::DevicePreempted {
            device_id: DeviceId::new("usb-002"),
            preempted_by: ClientId::new("c2"),
            preempted_client_id: None,
            reason: "takeover".to_owned(),
        };
        assert!(conn.wants(&matching));
        assert!(!conn.wants(&other));
    }

    #[tokio::test]
    async fn test_heartbeat_liveness_window() {
        let conn = test_conn();
        assert!(conn.is_alive(Duration::from_secs(1)));
        std::thread::sleep(Duration::from_millis(30));
        assert!(!conn.is_alive(Duration::from_millis(10)));
        conn.touch();
        assert!(conn.is_alive(Duration::from_millis(10)));
    }
}
