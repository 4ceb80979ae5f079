//! Message handlers.
//!
//! Each handler is a function from `(connection, data)` to a response
//! payload; [`DaemonServer::dispatch`] matches on the message tag. A
//! handler never returns a transport error: anything that goes wrong
//! becomes a `{"success": false, "message": ...}` payload.

use std::sync::Arc;

use serde_json::{Value, json};
use tracing::{info, warn};

use fbuild_core::{ClientId, DeviceId};
use fbuild_events::DaemonEvent;
use fbuild_protocol::{
    ConnectData, DeviceLeaseData, DevicePreemptData, DeviceReleaseData, FirmwareQueryData,
    FirmwareRecordData, LockAcquireData, LockReleaseData, LockType, Message, MessageType,
    ProtocolError, SerialAttachData, SerialDetachData, SerialReadData, SerialWriteData,
    SerialWriterData, SubscribeData, SubscriptionType, decode_bytes, decode_payload,
};

use crate::registry::ClientMetadata;
use crate::server::{ClientConn, DaemonServer};

/// Shorthand for a `{"success": false}` payload.
fn failure(message: impl Into<String>) -> Value {
    json!({ "success": false, "message": message.into() })
}

fn payload_error(e: &ProtocolError) -> Value {
    failure(e.to_string())
}

impl DaemonServer {
    /// Route one message to its handler.
    pub(crate) async fn dispatch(
        self: &Arc<Self>,
        conn: &Arc<ClientConn>,
        msg_type: MessageType,
        data: Value,
    ) -> Value {
        match msg_type {
            MessageType::Connect => self.handle_connect(conn, data).await,
            MessageType::Heartbeat => self.handle_heartbeat(conn),
            MessageType::Disconnect => self.handle_disconnect(conn, &data),
            MessageType::LockAcquire => self.handle_lock_acquire(conn, data).await,
            MessageType::LockRelease => self.handle_lock_release(conn, data),
            MessageType::LockStatus => self.handle_lock_status(data),
            MessageType::FirmwareQuery => self.handle_firmware_query(data),
            MessageType::FirmwareRecord => self.handle_firmware_record(data),
            MessageType::SerialAttach => self.handle_serial_attach(conn, data),
            MessageType::SerialDetach => self.handle_serial_detach(conn, data),
            MessageType::SerialAcquireWriter => self.handle_serial_acquire_writer(conn, data).await,
            MessageType::SerialReleaseWriter => self.handle_serial_release_writer(conn, data),
            MessageType::SerialWrite => self.handle_serial_write(conn, data).await,
            MessageType::SerialReadBuffer => self.handle_serial_read_buffer(conn, data),
            MessageType::DeviceList => self.handle_device_list(&data),
            MessageType::DeviceLease => self.handle_device_lease(conn, data).await,
            MessageType::DeviceRelease => self.handle_device_release(conn, data),
            MessageType::DevicePreempt => self.handle_device_preempt(conn, data).await,
            MessageType::DeviceStatus => self.handle_device_status(data),
            MessageType::Subscribe => self.handle_subscribe(conn, data, true),
            MessageType::Unsubscribe => self.handle_subscribe(conn, data, false),
            MessageType::Response | MessageType::Error | MessageType::Broadcast => {
                failure(format!("unexpected message type: {msg_type}"))
            },
        }
    }

    // -- session lifecycle --------------------------------------------------

    async fn handle_connect(self: &Arc<Self>, conn: &Arc<ClientConn>, data: Value) -> Value {
        let data: ConnectData = match decode_payload(MessageType::Connect, data) {
            Ok(data) => data,
            Err(e) => return payload_error(&e),
        };
        conn.touch();
        self.context.registry.register(
            conn.client_id.clone(),
            ClientMetadata {
                pid: data.pid,
                hostname: data.hostname,
                version: data.version,
            },
        );
        info!(client_id = %conn.client_id, pid = data.pid, "client connected");

        self.context.bus.publish(DaemonEvent::ClientConnected {
            client_id: conn.client_id.clone(),
        });
        self.context.refresh_status_runtime_info();

        json!({
            "success": true,
            "client_id": conn.client_id,
            "message": "Connected successfully",
            "total_clients": self.context.registry.client_count(),
        })
    }

    fn handle_heartbeat(&self, conn: &Arc<ClientConn>) -> Value {
        conn.touch();
        self.context.registry.heartbeat(&conn.client_id);
        json!({
            "success": true,
            "message": "Heartbeat acknowledged",
            "timestamp": fbuild_protocol::wire_timestamp(),
        })
    }

    fn handle_disconnect(self: &Arc<Self>, conn: &Arc<ClientConn>, data: &Value) -> Value {
        let reason = data
            .get("reason")
            .and_then(Value::as_str)
            .unwrap_or("Client requested disconnect")
            .to_owned();
        // Disconnect after the response has gone out.
        let server = Arc::clone(self);
        let client_id = conn.client_id.clone();
        tokio::spawn(async move {
            server.disconnect_client(&client_id, &reason).await;
        });
        json!({ "success": true, "message": "Disconnect acknowledged" })
    }

    // -- locks --------------------------------------------------------------

    async fn handle_lock_acquire(self: &Arc<Self>, conn: &Arc<ClientConn>, data: Value) -> Value {
        let data: LockAcquireData = match decode_payload(MessageType::LockAcquire, data) {
            Ok(data) => data,
            Err(e) => return payload_error(&e),
        };
        let key = data.key();
        let client_id = conn.client_id.clone();

        let acquired = match data.lock_type {
            LockType::Exclusive => {
                let context = Arc::clone(&self.context);
                let key = key.clone();
                let client = client_id.clone();
                let description = data.description.clone();
                // Blocking wait runs off the reactor.
                tokio::task::spawn_blocking(move || {
                    context.locks.acquire_exclusive(
                        &key,
                        &client,
                        &description,
                        data.timeout,
                        data.blocking,
                    )
                })
                .await
                .unwrap_or(false)
            },
            LockType::SharedRead => {
                self.context
                    .locks
                    .acquire_shared_read(&key, &client_id, &data.description)
            },
        };

        if acquired {
            info!(%client_id, key = %key, lock_type = data.lock_type.as_str(), "lock acquired");
            self.context.bus.publish(DaemonEvent::LockAcquired {
                client_id,
                key,
                lock_type: data.lock_type.as_str().to_owned(),
            });
            self.context.refresh_status_runtime_info();
            json!({
                "success": true,
                "message": format!("{} lock acquired", data.lock_type.as_str()),
                "lock_state": format!("locked_{}", data.lock_type.as_str()),
            })
        } else {
            let status = self.context.locks.lock_status(&key);
            json!({
                "success": false,
                "message": "Lock not available",
                "lock_state": status.state,
                "holder_count": status.holder_count,
                "waiting_count": status.waiting_count,
            })
        }
    }

    fn handle_lock_release(&self, conn: &Arc<ClientConn>, data: Value) -> Value {
        let data: LockReleaseData = match decode_payload(MessageType::LockRelease, data) {
            Ok(data) => data,
            Err(e) => return payload_error(&e),
        };
        let key = data.key();
        if self.context.locks.release(&key, &conn.client_id) {
            info!(client_id = %conn.client_id, key = %key, "lock released");
            self.context.bus.publish(DaemonEvent::LockReleased {
                client_id: conn.client_id.clone(),
                key,
            });
            self.context.refresh_status_runtime_info();
            json!({ "success": true, "message": "Lock released", "lock_state": "unlocked" })
        } else {
            failure("Client does not hold this lock")
        }
    }

    fn handle_lock_status(&self, data: Value) -> Value {
        let data: LockReleaseData = match decode_payload(MessageType::LockStatus, data) {
            Ok(data) => data,
            Err(e) => return payload_error(&e),
        };
        let status = self.context.locks.lock_status(&data.key());
        match serde_json::to_value(&status) {
            Ok(Value::Object(mut map)) => {
                map.insert("success".to_owned(), Value::Bool(true));
                Value::Object(map)
            },
            _ => failure("failed to serialize lock status"),
        }
    }

    // -- firmware -----------------------------------------------------------

    fn handle_firmware_query(&self, data: Value) -> Value {
        let data: FirmwareQueryData = match decode_payload(MessageType::FirmwareQuery, data) {
            Ok(data) => data,
            Err(e) => return payload_error(&e),
        };
        let result = self.context.ledger.query(
            &data.port,
            &data.source_hash,
            data.build_flags_hash.as_deref(),
        );
        match result.prior_entry {
            Some(entry) => json!({
                "success": true,
                "is_current": result.is_current,
                "needs_redeploy": result.needs_redeploy,
                "firmware_hash": entry.firmware_hash,
                "project_dir": entry.project_dir,
                "environment": entry.environment,
                "upload_timestamp": entry.upload_timestamp,
                "message": if result.is_current { "Firmware current" } else { "Firmware needs update" },
            }),
            None => json!({
                "success": true,
                "is_current": false,
                "needs_redeploy": true,
                "message": "No firmware deployment recorded for this port",
            }),
        }
    }

    fn handle_firmware_record(&self, data: Value) -> Value {
        let data: FirmwareRecordData = match decode_payload(MessageType::FirmwareRecord, data) {
            Ok(data) => data,
            Err(e) => return payload_error(&e),
        };
        let entry = self.context.ledger.record_deployment(
            &data.port,
            &data.firmware_hash,
            &data.source_hash,
            &data.project_dir,
            &data.environment,
            &data.build_flags_hash,
        );
        self.context.bus.publish(DaemonEvent::FirmwareRecorded {
            port: entry.port.clone(),
            environment: entry.environment.clone(),
            firmware_hash: entry.firmware_hash.clone(),
        });
        json!({
            "success": true,
            "message": "Deployment recorded",
            "port": entry.port,
            "upload_timestamp": entry.upload_timestamp,
        })
    }

    // -- serial -------------------------------------------------------------

    fn handle_serial_attach(&self, conn: &Arc<ClientConn>, data: Value) -> Value {
        let data: SerialAttachData = match decode_payload(MessageType::SerialAttach, data) {
            Ok(data) => data,
            Err(e) => return payload_error(&e),
        };
        let opened = self
            .context
            .serial
            .open_port(&data.port, data.baud_rate, &conn.client_id);
        let attached = if data.as_reader {
            self.context.serial.attach_reader(&data.port, &conn.client_id)
        } else {
            opened
        };

        if attached {
            self.context.bus.publish(DaemonEvent::SerialAttached {
                port: data.port.clone(),
                client_id: conn.client_id.clone(),
                as_reader: data.as_reader,
            });
            let info = self.context.serial.get_session_info(&data.port);
            json!({
                "success": true,
                "message": "Attached to serial port",
                "is_open": info.as_ref().is_some_and(|i| i.is_open),
                "reader_count": info.as_ref().map_or(0, |i| i.reader_count),
                "has_writer": info.as_ref().is_some_and(|i| i.writer_client_id.is_some()),
            })
        } else {
            failure("Failed to attach to serial port")
        }
    }

    fn handle_serial_detach(&self, conn: &Arc<ClientConn>, data: Value) -> Value {
        let data: SerialDetachData = match decode_payload(MessageType::SerialDetach, data) {
            Ok(data) => data,
            Err(e) => return payload_error(&e),
        };
        if self.context.serial.detach_reader(&data.port, &conn.client_id) {
            self.context.bus.publish(DaemonEvent::SerialDetached {
                port: data.port,
                client_id: conn.client_id.clone(),
            });
            json!({ "success": true, "message": "Detached from serial port" })
        } else {
            failure("Client not attached to this port")
        }
    }

    async fn handle_serial_acquire_writer(
        self: &Arc<Self>,
        conn: &Arc<ClientConn>,
        data: Value,
    ) -> Value {
        let data: SerialWriterData = match decode_payload(MessageType::SerialAcquireWriter, data) {
            Ok(data) => data,
            Err(e) => return payload_error(&e),
        };
        let timeout = data
            .timeout
            .unwrap_or(self.context.config.serial.writer_timeout_secs);
        let context = Arc::clone(&self.context);
        let client_id = conn.client_id.clone();
        let port = data.port.clone();
        let acquired =
            tokio::task::spawn_blocking(move || context.serial.acquire_writer(&port, &client_id, timeout))
                .await
                .unwrap_or(false);
        if acquired {
            json!({ "success": true, "message": "Writer acquired", "port": data.port })
        } else {
            failure("Could not acquire writer access")
        }
    }

    fn handle_serial_release_writer(&self, conn: &Arc<ClientConn>, data: Value) -> Value {
        let data: SerialWriterData = match decode_payload(MessageType::SerialReleaseWriter, data) {
            Ok(data) => data,
            Err(e) => return payload_error(&e),
        };
        if self.context.serial.release_writer(&data.port, &conn.client_id) {
            json!({ "success": true, "message": "Writer released" })
        } else {
            failure("Client does not hold the writer")
        }
    }

    async fn handle_serial_write(self: &Arc<Self>, conn: &Arc<ClientConn>, data: Value) -> Value {
        let data: SerialWriteData = match decode_payload(MessageType::SerialWrite, data) {
            Ok(data) => data,
            Err(e) => return payload_error(&e),
        };
        let bytes = match decode_bytes(&data.data) {
            Ok(bytes) => bytes,
            Err(e) => return failure(e.to_string()),
        };

        if data.acquire_writer {
            let context = Arc::clone(&self.context);
            let client_id = conn.client_id.clone();
            let port = data.port.clone();
            let timeout = self.context.config.serial.writer_timeout_secs;
            let acquired = tokio::task::spawn_blocking(move || {
                context.serial.acquire_writer(&port, &client_id, timeout)
            })
            .await
            .unwrap_or(false);
            if !acquired {
                return failure("Could not acquire writer access");
            }
        }

        let result = self.context.serial.write(&data.port, &conn.client_id, &bytes);

        if data.acquire_writer {
            self.context.serial.release_writer(&data.port, &conn.client_id);
        }

        match result {
            Ok(written) => json!({
                "success": true,
                "message": format!("Wrote {written} bytes"),
                "bytes_written": written,
            }),
            Err(e) => failure(e.to_string()),
        }
    }

    fn handle_serial_read_buffer(&self, conn: &Arc<ClientConn>, data: Value) -> Value {
        let data: SerialReadData = match decode_payload(MessageType::SerialReadBuffer, data) {
            Ok(data) => data,
            Err(e) => return payload_error(&e),
        };
        let lines = self
            .context
            .serial
            .read_buffer(&data.port, &conn.client_id, data.max_lines);
        let info = self.context.serial.get_session_info(&data.port);
        json!({
            "success": true,
            "message": format!("Read {} lines", lines.len()),
            "lines": lines,
            "buffer_size": info.map_or(0, |i| i.buffer_lines),
        })
    }

    // -- devices ------------------------------------------------------------

    fn handle_device_list(&self, data: &Value) -> Value {
        let include_disconnected = data
            .get("include_disconnected")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let refresh = data.get("refresh").and_then(Value::as_bool).unwrap_or(false);

        if refresh {
            self.context.devices.refresh_devices();
        }
        let devices = self.context.devices.list_devices(include_disconnected);
        json!({
            "success": true,
            "message": format!("Found {} device(s)", devices.len()),
            "total_devices": devices.len(),
            "total_leases": self.context.devices.lease_count(),
            "devices": devices,
        })
    }

    async fn handle_device_lease(self: &Arc<Self>, conn: &Arc<ClientConn>, data: Value) -> Value {
        let data: DeviceLeaseData = match decode_payload(MessageType::DeviceLease, data) {
            Ok(data) => data,
            Err(e) => return payload_error(&e),
        };

        let lease = match data.lease_type.as_str() {
            "exclusive" => {
                let context = Arc::clone(&self.context);
                let device_id = data.device_id.clone();
                let client_id = conn.client_id.clone();
                let description = data.description.clone();
                let allows_monitors = data.allows_monitors;
                let timeout = data.timeout;
                tokio::task::spawn_blocking(move || {
                    context.devices.acquire_exclusive(
                        &device_id,
                        &client_id,
                        &description,
                        allows_monitors,
                        timeout,
                    )
                })
                .await
                .unwrap_or(None)
            },
            "monitor" => {
                self.context
                    .devices
                    .acquire_monitor(&data.device_id, &conn.client_id, &data.description)
            },
            other => {
                return failure(format!(
                    "Invalid lease type: {other}. Must be 'exclusive' or 'monitor'"
                ));
            },
        };

        match lease {
            Some(lease) => {
                self.context.bus.publish(DaemonEvent::LeaseAcquired {
                    client_id: conn.client_id.clone(),
                    device_id: lease.device_id.clone(),
                    lease_id: lease.lease_id.clone(),
                    lease_type: lease.lease_type.as_str().to_owned(),
                });
                json!({
                    "success": true,
                    "message": format!("{} lease acquired", lease.lease_type.as_str()),
                    "lease_id": lease.lease_id,
                    "device_id": lease.device_id,
                    "lease_type": lease.lease_type.as_str(),
                    "allows_monitors": lease.allows_monitors,
                })
            },
            None => {
                let status = self.context.devices.device_status(&data.device_id);
                json!({
                    "success": false,
                    "message": "Lease not available",
                    "device_id": data.device_id,
                    "lease_type": data.lease_type,
                    "is_connected": status.get("is_connected").cloned().unwrap_or(Value::Bool(false)),
                    "has_exclusive": !status.get("exclusive_lease").is_none_or(Value::is_null),
                })
            },
        }
    }

    fn handle_device_release(&self, conn: &Arc<ClientConn>, data: Value) -> Value {
        let data: DeviceReleaseData = match decode_payload(MessageType::DeviceRelease, data) {
            Ok(data) => data,
            Err(e) => return payload_error(&e),
        };
        if self.context.devices.release_lease(&data.lease_id, &conn.client_id) {
            self.context.bus.publish(DaemonEvent::LeaseReleased {
                client_id: conn.client_id.clone(),
                lease_id: data.lease_id.clone(),
            });
            json!({ "success": true, "message": "Lease released", "lease_id": data.lease_id })
        } else {
            json!({
                "success": false,
                "message": "Lease not found or not owned by this client",
                "lease_id": data.lease_id,
            })
        }
    }

    async fn handle_device_preempt(self: &Arc<Self>, conn: &Arc<ClientConn>, data: Value) -> Value {
        let data: DevicePreemptData = match decode_payload(MessageType::DevicePreempt, data) {
            Ok(data) => data,
            Err(e) => return payload_error(&e),
        };
        if data.reason.trim().is_empty() {
            return failure("reason is required and must not be empty");
        }

        let Some((lease, preempted)) =
            self.context
                .devices
                .preempt_device(&data.device_id, &conn.client_id, &data.reason)
        else {
            return json!({
                "success": false,
                "message": "Preemption failed - device not found",
                "device_id": data.device_id,
            });
        };

        warn!(
            device_id = %data.device_id,
            new_holder = %conn.client_id,
            preempted = ?preempted,
            reason = %data.reason,
            "device preempted"
        );

        // The preempted client hears about it before the new holder's
        // response goes out.
        if let Some(preempted_id) = &preempted {
            self.notify_preempted(preempted_id, &data.device_id, &conn.client_id, &data.reason)
                .await;
        }

        self.context.bus.publish(DaemonEvent::DevicePreempted {
            device_id: data.device_id.clone(),
            preempted_by: conn.client_id.clone(),
            preempted_client_id: preempted.clone(),
            reason: data.reason.clone(),
        });

        json!({
            "success": true,
            "message": match &preempted {
                Some(id) => format!("Device preempted from {id}"),
                None => "Device lease granted".to_owned(),
            },
            "device_id": data.device_id,
            "preempted_client_id": preempted,
            "lease_id": lease.lease_id,
            "lease_type": "exclusive",
        })
    }

    /// Direct notification to a client losing its exclusive lease.
    async fn notify_preempted(
        &self,
        preempted_id: &ClientId,
        device_id: &DeviceId,
        new_holder: &ClientId,
        reason: &str,
    ) {
        let frame = Message::broadcast(
            "device_preemption",
            json!({
                "device_id": device_id,
                "preempted_by": new_holder,
                "reason": reason,
            }),
        );
        if !self.send_to_client(preempted_id, &frame).await {
            warn!(client_id = %preempted_id, "preempted client unreachable for notification");
        }
    }

    fn handle_device_status(&self, data: Value) -> Value {
        let Some(device_id) = data.get("device_id").and_then(Value::as_str) else {
            return failure("device_id is required");
        };
        let status = self.context.devices.device_status(&DeviceId::new(device_id));
        match status {
            Value::Object(mut map) => {
                map.insert("success".to_owned(), Value::Bool(true));
                Value::Object(map)
            },
            _ => failure("failed to serialize device status"),
        }
    }

    // -- subscriptions -------------------------------------------------------

    fn handle_subscribe(&self, conn: &Arc<ClientConn>, data: Value, subscribe: bool) -> Value {
        let msg_type = if subscribe {
            MessageType::Subscribe
        } else {
            MessageType::Unsubscribe
        };
        let data: SubscribeData = match decode_payload(msg_type, data) {
            Ok(data) => data,
            Err(e) => return payload_error(&e),
        };

        {
            let mut subscriptions = conn
                .subscriptions
                .lock()
                .expect("subscriptions mutex poisoned");
            for name in &data.event_types {
                match SubscriptionType::parse(name) {
                    Ok(event_type) => {
                        if subscribe {
                            subscriptions.insert(event_type);
                        } else {
                            subscriptions.remove(&event_type);
                        }
                    },
                    Err(_) => warn!(event_type = %name, "unknown subscription type ignored"),
                }
            }
        }
        if subscribe {
            *conn.filter_key.lock().expect("filter mutex poisoned") = data.filter_key;
        }

        let current: Vec<&'static str> = conn
            .subscriptions
            .lock()
            .expect("subscriptions mutex poisoned")
            .iter()
            .map(|s| s.as_str())
            .collect();
        json!({
            "success": true,
            "message": if subscribe { "Subscribed" } else { "Unsubscribed" },
            "subscriptions": current,
        })
    }
}
