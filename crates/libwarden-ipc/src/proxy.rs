//! Stdio-to-IPC proxy client
//!
//! Bridges a local line-delimited request/response stream (usually the
//! process's stdin/stdout) to the daemon connection. The proxy owns
//! reconnection, bounded buffering and heartbeats, and survives daemon
//! restarts: requests issued while disconnected are buffered and delivered
//! after reconnection. A caller is never left hanging: every request ends
//! in exactly one real response or one synthetic error on local output.
//!
//! Everything runs on a single task; the in-memory maps need no locking.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use serde_json::{json, Value};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, trace, warn};

use crate::config::IpcConfig;
use crate::error::{codes, IpcError};
use crate::protocol::{self, LineBuffer, ProtocolMessage};
use crate::transport::{self, IpcStream};
use crate::version::parse_version;

/// How often pending deadlines and buffer staleness are checked
const SWEEP_INTERVAL: Duration = Duration::from_millis(100);

/// Largest backoff doubling; beyond this the delay stays flat
const MAX_BACKOFF_SHIFT: u32 = 10;

/// Lifecycle events surfaced to the embedding application
#[derive(Debug, Clone, PartialEq)]
pub enum ProxyEvent {
    /// Handshake completed
    Connected { daemon_version: String },
    /// The daemon connection dropped
    Disconnected { reason: String },
    /// A reconnect attempt is scheduled
    Reconnecting { attempt: u32, delay: Duration },
    /// The daemon advertised a newer version
    UpgradeAvailable { version: String },
    /// The daemon announced it is going away
    ShuttingDown { reason: String, grace_period_ms: u64 },
    /// The proxy stopped
    Stopped,
}

/// Cancels a running proxy; cloneable and idempotent
#[derive(Debug, Clone)]
pub struct ProxyHandle {
    shutdown: broadcast::Sender<()>,
}

impl ProxyHandle {
    /// Stop the proxy. Safe to call more than once.
    pub fn stop(&self) {
        let _ = self.shutdown.send(());
    }
}

/// A request awaiting its response
#[derive(Debug)]
struct PendingRequest {
    deadline: Instant,
    original_payload: Value,
}

/// A request held while disconnected
#[derive(Debug)]
struct BufferedMessage {
    request_id: String,
    line: String,
    enqueued: Instant,
}

/// The proxy client
pub struct ProxyClient {
    config: IpcConfig,
    client_id: String,
    client_version: String,
    protocol_version: u32,
    shutdown: broadcast::Sender<()>,
    events: Option<mpsc::Sender<ProxyEvent>>,
}

impl ProxyClient {
    /// Create a proxy for this process's version.
    pub fn new(
        config: IpcConfig,
        client_version: &str,
        protocol_version: u32,
    ) -> Result<Self, IpcError> {
        if parse_version(client_version).is_none() {
            return Err(IpcError::InvalidVersion(client_version.to_string()));
        }
        let (shutdown, _) = broadcast::channel(1);
        Ok(Self {
            config,
            client_id: uuid::Uuid::new_v4().to_string(),
            client_version: client_version.to_string(),
            protocol_version,
            shutdown,
            events: None,
        })
    }

    /// Handle for stopping the proxy from another task
    pub fn handle(&self) -> ProxyHandle {
        ProxyHandle {
            shutdown: self.shutdown.clone(),
        }
    }

    /// Subscribe to lifecycle events. Events are dropped, not awaited, if
    /// the receiver lags; they must never block forwarding.
    pub fn events(&mut self) -> mpsc::Receiver<ProxyEvent> {
        let (tx, rx) = mpsc::channel(64);
        self.events = Some(tx);
        rx
    }

    fn emit(&self, event: ProxyEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.try_send(event);
        }
    }

    /// Run the proxy until local input closes and drains, `stop()` is
    /// called, the handshake is refused, or reconnect attempts are
    /// exhausted.
    pub async fn run<I, O>(mut self, mut input: I, mut output: O) -> Result<(), IpcError>
    where
        I: AsyncRead + Unpin,
        O: AsyncWrite + Unpin,
    {
        let mut pending: HashMap<String, PendingRequest> = HashMap::new();
        let mut offline: VecDeque<BufferedMessage> = VecDeque::new();
        let mut offline_bytes: usize = 0;
        let mut input_buf = LineBuffer::new(self.config.input_buffer_limit);
        let mut input_open = true;
        let mut shutdown_rx = self.shutdown.subscribe();
        let mut attempt: u32 = 0;

        loop {
            // Connect and shake hands, backing off on transient failures
            let (stream, daemon_version) = match self.connect_and_handshake().await {
                Ok(ok) => ok,
                Err(e @ (IpcError::HandshakeRefused { .. } | IpcError::VersionMismatch { .. })) => {
                    // Retrying cannot fix an incompatible pairing
                    self.fail_all(&mut pending, &mut offline, &mut output, codes::VERSION_MISMATCH)
                        .await;
                    return Err(e);
                }
                Err(e) => {
                    attempt += 1;
                    if attempt > self.config.max_reconnect_attempts {
                        warn!(attempts = attempt - 1, "Reconnect attempts exhausted");
                        self.fail_all(
                            &mut pending,
                            &mut offline,
                            &mut output,
                            codes::RECONNECT_EXHAUSTED,
                        )
                        .await;
                        return Err(IpcError::ReconnectExhausted {
                            attempts: attempt - 1,
                        });
                    }
                    let delay = reconnect_delay(self.config.reconnect_base_delay, attempt - 1);
                    debug!(attempt, delay_ms = delay.as_millis() as u64, error = %e, "Reconnecting");
                    self.emit(ProxyEvent::Reconnecting { attempt, delay });
                    match self
                        .wait_disconnected(
                            delay,
                            &mut input,
                            &mut output,
                            &mut input_buf,
                            &mut input_open,
                            &mut pending,
                            &mut offline,
                            &mut offline_bytes,
                            &mut shutdown_rx,
                        )
                        .await?
                    {
                        Wait::Elapsed => continue,
                        Wait::Drained => {
                            self.emit(ProxyEvent::Stopped);
                            return Ok(());
                        }
                        Wait::Stopped => {
                            self.fail_all(&mut pending, &mut offline, &mut output, codes::STOPPED)
                                .await;
                            self.emit(ProxyEvent::Stopped);
                            return Ok(());
                        }
                    }
                }
            };

            attempt = 0;
            let mut stream = stream;
            if !self
                .flush_offline(
                    &mut offline,
                    &mut offline_bytes,
                    &mut pending,
                    &mut output,
                    &mut stream,
                )
                .await?
            {
                self.emit(ProxyEvent::Disconnected {
                    reason: "connection lost while flushing buffered requests".to_string(),
                });
                continue;
            }

            self.emit(ProxyEvent::Connected {
                daemon_version: daemon_version.clone(),
            });
            info!(daemon_version = %daemon_version, "Attached to daemon");

            // Connected loop; breaks back out to the reconnect path
            let disconnect_reason = self
                .serve_connection(
                    &mut stream,
                    &mut input,
                    &mut output,
                    &mut input_buf,
                    &mut input_open,
                    &mut pending,
                    &mut offline,
                    &mut offline_bytes,
                    &mut shutdown_rx,
                )
                .await?;

            match disconnect_reason {
                Disconnect::Stopped => {
                    self.fail_all(&mut pending, &mut offline, &mut output, codes::STOPPED)
                        .await;
                    self.emit(ProxyEvent::Stopped);
                    return Ok(());
                }
                Disconnect::InputDrained => {
                    self.emit(ProxyEvent::Stopped);
                    return Ok(());
                }
                Disconnect::ConnectionLost { reason } => {
                    self.emit(ProxyEvent::Disconnected {
                        reason: reason.clone(),
                    });
                    debug!(reason = %reason, "Daemon connection lost");
                }
                Disconnect::PlannedRestart { grace } => {
                    // A planned upgrade: wait out the grace period, then
                    // reconnect with a fresh attempt budget
                    self.emit(ProxyEvent::Disconnected {
                        reason: "daemon restarting".to_string(),
                    });
                    match self
                        .wait_disconnected(
                            grace,
                            &mut input,
                            &mut output,
                            &mut input_buf,
                            &mut input_open,
                            &mut pending,
                            &mut offline,
                            &mut offline_bytes,
                            &mut shutdown_rx,
                        )
                        .await?
                    {
                        Wait::Elapsed => {}
                        Wait::Drained => {
                            self.emit(ProxyEvent::Stopped);
                            return Ok(());
                        }
                        Wait::Stopped => {
                            self.fail_all(&mut pending, &mut offline, &mut output, codes::STOPPED)
                                .await;
                            self.emit(ProxyEvent::Stopped);
                            return Ok(());
                        }
                    }
                }
            }
        }
    }

    /// One session against a live connection. Returns why it ended.
    #[allow(clippy::too_many_arguments)]
    async fn serve_connection<I, O>(
        &self,
        stream: &mut IpcStream,
        input: &mut I,
        output: &mut O,
        input_buf: &mut LineBuffer,
        input_open: &mut bool,
        pending: &mut HashMap<String, PendingRequest>,
        offline: &mut VecDeque<BufferedMessage>,
        offline_bytes: &mut usize,
        shutdown_rx: &mut broadcast::Receiver<()>,
    ) -> Result<Disconnect, IpcError>
    where
        I: AsyncRead + Unpin,
        O: AsyncWrite + Unpin,
    {
        let (mut conn_rx, mut conn_tx): (ReadHalf<&mut IpcStream>, WriteHalf<&mut IpcStream>) =
            tokio::io::split(stream);
        let mut recv_buf = LineBuffer::new(self.config.recv_buffer_limit);
        let mut heartbeat = tokio::time::interval(self.config.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        heartbeat.reset(); // first tick after one full interval
        let mut sweep = tokio::time::interval(SWEEP_INTERVAL);
        let mut in_chunk = [0u8; 8192];
        let mut conn_chunk = [0u8; 8192];

        loop {
            tokio::select! {
                read = input.read(&mut in_chunk), if *input_open => {
                    match read {
                        Ok(0) => {
                            trace!("Local input closed");
                            *input_open = false;
                            if pending.is_empty() && offline.is_empty() {
                                return Ok(Disconnect::InputDrained);
                            }
                        }
                        Ok(n) => {
                            let lines = match input_buf.push(&in_chunk[..n]) {
                                Ok(lines) => lines,
                                Err(limit) => {
                                    warn!(limit, "Local input buffer overflow; clearing");
                                    self.write_line(
                                        output,
                                        &synthetic_error(None, codes::BUFFER_OVERFLOW,
                                            "local input exceeded its buffer cap without a newline"),
                                    ).await?;
                                    continue;
                                }
                            };
                            let mut lines = lines.into_iter();
                            while let Some(line) = lines.next() {
                                if let Err(reason) = self
                                    .forward_local_line(&line, &mut conn_tx, output, pending)
                                    .await?
                                {
                                    // Requeue this line and the rest; they
                                    // go out after reconnection
                                    self.buffer_local_line(&line, pending, offline, offline_bytes, output)
                                        .await?;
                                    for rest in lines {
                                        self.buffer_local_line(&rest, pending, offline, offline_bytes, output)
                                            .await?;
                                    }
                                    return Ok(Disconnect::ConnectionLost { reason });
                                }
                            }
                        }
                        Err(e) => {
                            warn!(error = %e, "Local input error");
                            *input_open = false;
                        }
                    }
                }

                read = conn_rx.read(&mut conn_chunk) => {
                    let n = match read {
                        Ok(0) => return Ok(Disconnect::ConnectionLost {
                            reason: "connection closed by daemon".to_string(),
                        }),
                        Ok(n) => n,
                        Err(e) => return Ok(Disconnect::ConnectionLost {
                            reason: e.to_string(),
                        }),
                    };
                    let lines = match recv_buf.push(&conn_chunk[..n]) {
                        Ok(lines) => lines,
                        Err(limit) => {
                            warn!(limit, "Receive buffer overflow; clearing");
                            self.write_line(
                                output,
                                &synthetic_error(None, codes::BUFFER_OVERFLOW,
                                    "daemon stream exceeded the receive buffer cap without a delimiter"),
                            ).await?;
                            continue;
                        }
                    };
                    for line in lines {
                        if let Some(end) = self.handle_daemon_line(&line, output, pending).await? {
                            return Ok(end);
                        }
                    }
                    if !*input_open && pending.is_empty() && offline.is_empty() {
                        return Ok(Disconnect::InputDrained);
                    }
                }

                _ = heartbeat.tick() => {
                    let beat = ProtocolMessage::heartbeat(self.client_id.clone());
                    let line = protocol::encode(&beat)?;
                    if let Err(e) = conn_tx.write_all(line.as_bytes()).await {
                        return Ok(Disconnect::ConnectionLost { reason: e.to_string() });
                    }
                    let _ = conn_tx.flush().await;
                    trace!("Heartbeat sent");
                }

                _ = sweep.tick() => {
                    self.expire_pending(pending, output).await?;
                    self.drop_stale_offline(offline, offline_bytes, pending, output).await?;
                    if !*input_open && pending.is_empty() && offline.is_empty() {
                        return Ok(Disconnect::InputDrained);
                    }
                }

                _ = shutdown_rx.recv() => {
                    return Ok(Disconnect::Stopped);
                }
            }
        }
    }

    /// Wrap one local line in a Request and send it. A write failure comes
    /// back as `Ok(Err(reason))` with the pending entry rolled back, so the
    /// caller can re-buffer the raw line and switch to the reconnect path.
    async fn forward_local_line<O>(
        &self,
        line: &str,
        conn_tx: &mut (impl AsyncWrite + Unpin),
        output: &mut O,
        pending: &mut HashMap<String, PendingRequest>,
    ) -> Result<Result<(), String>, IpcError>
    where
        O: AsyncWrite + Unpin,
    {
        if line.trim().is_empty() {
            return Ok(Ok(()));
        }
        let payload: Value = match serde_json::from_str(line) {
            Ok(v) => v,
            Err(e) => {
                debug!(error = %e, "Unparseable local request line");
                self.write_line(
                    output,
                    &synthetic_error(None, codes::INTERNAL, "request line is not valid JSON"),
                )
                .await?;
                return Ok(Ok(()));
            }
        };

        let request_id = uuid::Uuid::new_v4().to_string();
        let message = ProtocolMessage::Request {
            request_id: request_id.clone(),
            client_id: self.client_id.clone(),
            payload: payload.clone(),
        };
        pending.insert(
            request_id.clone(),
            PendingRequest {
                deadline: Instant::now() + self.config.request_timeout,
                original_payload: payload,
            },
        );

        let wire = protocol::encode(&message)?;
        if let Err(e) = conn_tx.write_all(wire.as_bytes()).await {
            // Undelivered; the caller re-buffers the raw line instead
            pending.remove(&request_id);
            return Ok(Err(e.to_string()));
        }
        let _ = conn_tx.flush().await;
        trace!(request_id = %request_id, "Request forwarded");
        Ok(Ok(()))
    }

    /// Dispatch one inbound frame. Returns a `Disconnect` when the frame
    /// ends the session (daemon shutdown).
    async fn handle_daemon_line<O>(
        &self,
        line: &str,
        output: &mut O,
        pending: &mut HashMap<String, PendingRequest>,
    ) -> Result<Option<Disconnect>, IpcError>
    where
        O: AsyncWrite + Unpin,
    {
        let Some(message) = protocol::parse_line(line) else {
            // One bad frame is logged and skipped, never fatal
            debug!(line_len = line.len(), "Dropping unparseable frame");
            return Ok(None);
        };

        match message {
            ProtocolMessage::Response {
                request_id,
                payload,
            } => {
                if pending.remove(&request_id).is_some() {
                    let mut text = serde_json::to_string(&payload)?;
                    text.push('\n');
                    output.write_all(text.as_bytes()).await?;
                    output.flush().await?;
                    trace!(request_id = %request_id, "Response delivered");
                } else {
                    debug!(request_id = %request_id, "Unmatched response discarded");
                }
            }
            ProtocolMessage::Error {
                code,
                message,
                request_id: Some(request_id),
            } => {
                if let Some(entry) = pending.remove(&request_id) {
                    self.write_line(
                        output,
                        &synthetic_error(Some(&entry.original_payload), &code, &message),
                    )
                    .await?;
                }
            }
            ProtocolMessage::Error { code, message, .. } => {
                warn!(code = %code, message = %message, "Daemon error");
            }
            ProtocolMessage::HeartbeatAck { .. } => {
                trace!("Heartbeat acknowledged");
            }
            ProtocolMessage::UpgradePending { new_version } => {
                self.emit(ProxyEvent::UpgradeAvailable {
                    version: new_version,
                });
            }
            ProtocolMessage::Shutdown {
                reason,
                grace_period_ms,
            } => {
                info!(reason = %reason, grace_period_ms, "Daemon announced shutdown");
                self.emit(ProxyEvent::ShuttingDown {
                    reason: reason.clone(),
                    grace_period_ms,
                });
                if reason.contains("upgrade") {
                    return Ok(Some(Disconnect::PlannedRestart {
                        grace: Duration::from_millis(grace_period_ms),
                    }));
                }
                return Ok(Some(Disconnect::ConnectionLost {
                    reason: format!("daemon shutdown: {}", reason),
                }));
            }
            other => {
                debug!(message_type = other.message_type(), "Unexpected message ignored");
            }
        }
        Ok(None)
    }

    /// Connect to the daemon and complete the handshake within its timeout
    async fn connect_and_handshake(&self) -> Result<(IpcStream, String), IpcError> {
        let mut stream =
            transport::connect(&self.config.endpoint, self.config.handshake_timeout).await?;

        let hello = ProtocolMessage::handshake(
            self.client_id.clone(),
            self.client_version.clone(),
            self.protocol_version,
            vec!["json-rpc-passthrough".to_string()],
        );
        let line = protocol::encode(&hello)?;

        let exchange = async {
            stream.write_all(line.as_bytes()).await?;
            stream.flush().await?;

            // Accumulate partial reads until a full frame arrives
            let mut buf = LineBuffer::new(64 * 1024);
            let mut chunk = [0u8; 4096];
            loop {
                let n = stream.read(&mut chunk).await?;
                if n == 0 {
                    return Err(IpcError::ConnectionFailed(
                        "connection closed during handshake".to_string(),
                    ));
                }
                let lines = buf.push(&chunk[..n]).map_err(|limit| IpcError::BufferOverflow {
                    buffer: "handshake",
                    limit,
                })?;
                for frame in lines {
                    if let Some(message) = protocol::parse_line(&frame) {
                        return Ok(message);
                    }
                }
            }
        };

        let ack = match tokio::time::timeout(self.config.handshake_timeout, exchange).await {
            Ok(Ok(message)) => message,
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                return Err(IpcError::Timeout {
                    operation: "handshake",
                    timeout_ms: self.config.handshake_timeout.as_millis() as u64,
                })
            }
        };

        match ack {
            ProtocolMessage::HandshakeAck {
                success: true,
                daemon_version,
                protocol_version,
                upgrade_recommended,
                ..
            } => {
                if protocol_version != self.protocol_version {
                    return Err(IpcError::VersionMismatch {
                        reason: format!(
                            "daemon speaks protocol {}, this client speaks {}",
                            protocol_version, self.protocol_version
                        ),
                        upgrade_recommended: protocol_version > self.protocol_version,
                    });
                }
                if upgrade_recommended {
                    self.emit(ProxyEvent::UpgradeAvailable {
                        version: daemon_version.clone(),
                    });
                }
                Ok((stream, daemon_version))
            }
            ProtocolMessage::HandshakeAck { error, .. } => Err(IpcError::HandshakeRefused {
                reason: error.unwrap_or_else(|| "unspecified".to_string()),
            }),
            other => Err(IpcError::ConnectionFailed(format!(
                "expected handshake_ack, got {}",
                other.message_type()
            ))),
        }
    }

    /// Sit out a delay while disconnected, still consuming local input into
    /// the reconnect buffer so callers are not blocked on a dead pipe.
    #[allow(clippy::too_many_arguments)]
    async fn wait_disconnected<I, O>(
        &self,
        delay: Duration,
        input: &mut I,
        output: &mut O,
        input_buf: &mut LineBuffer,
        input_open: &mut bool,
        pending: &mut HashMap<String, PendingRequest>,
        offline: &mut VecDeque<BufferedMessage>,
        offline_bytes: &mut usize,
        shutdown_rx: &mut broadcast::Receiver<()>,
    ) -> Result<Wait, IpcError>
    where
        I: AsyncRead + Unpin,
        O: AsyncWrite + Unpin,
    {
        let deadline = Instant::now() + delay;
        let mut chunk = [0u8; 8192];
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            tokio::select! {
                _ = tokio::time::sleep(remaining) => return Ok(Wait::Elapsed),

                read = input.read(&mut chunk), if *input_open => {
                    match read {
                        Ok(0) => {
                            *input_open = false;
                            if pending.is_empty() && offline.is_empty() {
                                return Ok(Wait::Drained);
                            }
                        }
                        Ok(n) => {
                            let lines = match input_buf.push(&chunk[..n]) {
                                Ok(lines) => lines,
                                Err(limit) => {
                                    warn!(limit, "Local input buffer overflow; clearing");
                                    self.write_line(
                                        output,
                                        &synthetic_error(None, codes::BUFFER_OVERFLOW,
                                            "local input exceeded its buffer cap without a newline"),
                                    ).await?;
                                    continue;
                                }
                            };
                            for line in lines {
                                self.buffer_local_line(&line, pending, offline, offline_bytes, output)
                                    .await?;
                            }
                        }
                        Err(e) => {
                            warn!(error = %e, "Local input error");
                            *input_open = false;
                        }
                    }
                }

                _ = shutdown_rx.recv() => return Ok(Wait::Stopped),
            }
        }
    }

    /// Queue one local line for delivery after reconnection, evicting the
    /// oldest buffered requests rather than refusing the newest.
    async fn buffer_local_line<O>(
        &self,
        line: &str,
        pending: &mut HashMap<String, PendingRequest>,
        offline: &mut VecDeque<BufferedMessage>,
        offline_bytes: &mut usize,
        output: &mut O,
    ) -> Result<(), IpcError>
    where
        O: AsyncWrite + Unpin,
    {
        if line.trim().is_empty() {
            return Ok(());
        }
        let payload: Value = match serde_json::from_str(line) {
            Ok(v) => v,
            Err(e) => {
                debug!(error = %e, "Unparseable local request line");
                self.write_line(
                    output,
                    &synthetic_error(None, codes::INTERNAL, "request line is not valid JSON"),
                )
                .await?;
                return Ok(());
            }
        };
        let request_id = uuid::Uuid::new_v4().to_string();
        let message = ProtocolMessage::Request {
            request_id: request_id.clone(),
            client_id: self.client_id.clone(),
            payload: payload.clone(),
        };
        let wire = protocol::encode(&message)?;

        // A message that cannot fit even an empty buffer is refused
        // outright; evicting everything else would not make room
        if wire.len() > self.config.offline_buffer_limit {
            debug!(len = wire.len(), "Request larger than the reconnect buffer");
            self.write_line(
                output,
                &synthetic_error(
                    Some(&payload),
                    codes::BUFFER_OVERFLOW,
                    "request exceeds the reconnect buffer capacity",
                ),
            )
            .await?;
            return Ok(());
        }

        while *offline_bytes + wire.len() > self.config.offline_buffer_limit {
            let Some(evicted) = offline.pop_front() else {
                break;
            };
            *offline_bytes = offline_bytes.saturating_sub(evicted.line.len());
            if let Some(entry) = pending.remove(&evicted.request_id) {
                self.write_line(
                    output,
                    &synthetic_error(
                        Some(&entry.original_payload),
                        codes::BUFFER_OVERFLOW,
                        "evicted from the reconnect buffer by newer requests",
                    ),
                )
                .await?;
            }
        }

        pending.insert(
            request_id.clone(),
            PendingRequest {
                deadline: Instant::now() + self.config.request_timeout,
                original_payload: payload,
            },
        );
        *offline_bytes += wire.len();
        offline.push_back(BufferedMessage {
            request_id: request_id.clone(),
            line: wire,
            enqueued: Instant::now(),
        });
        debug!(request_id = %request_id, "Request buffered while disconnected");
        Ok(())
    }

    /// Deliver everything buffered while disconnected. Stale entries get a
    /// synthetic error instead of being forwarded late. Returns false when
    /// the connection drops mid-flush; the undelivered message stays queued.
    async fn flush_offline<O>(
        &self,
        offline: &mut VecDeque<BufferedMessage>,
        offline_bytes: &mut usize,
        pending: &mut HashMap<String, PendingRequest>,
        output: &mut O,
        stream: &mut IpcStream,
    ) -> Result<bool, IpcError>
    where
        O: AsyncWrite + Unpin,
    {
        while let Some(message) = offline.pop_front() {
            *offline_bytes = offline_bytes.saturating_sub(message.line.len());
            if message.enqueued.elapsed() > self.config.offline_max_age {
                if let Some(entry) = pending.remove(&message.request_id) {
                    self.write_line(
                        output,
                        &synthetic_error(
                            Some(&entry.original_payload),
                            codes::EXPIRED_IN_BUFFER,
                            "request expired while waiting for reconnection",
                        ),
                    )
                    .await?;
                }
                continue;
            }
            if let Err(e) = stream.write_all(message.line.as_bytes()).await {
                debug!(error = %e, "Connection dropped while flushing buffered requests");
                *offline_bytes += message.line.len();
                offline.push_front(message);
                return Ok(false);
            }
            // The response clock starts at delivery, not enqueue
            if let Some(entry) = pending.get_mut(&message.request_id) {
                entry.deadline = Instant::now() + self.config.request_timeout;
            }
            debug!(request_id = %message.request_id, "Buffered request delivered");
        }
        let _ = stream.flush().await;
        Ok(true)
    }

    /// Emit exactly one timeout error for each pending request past its
    /// deadline
    async fn expire_pending<O>(
        &self,
        pending: &mut HashMap<String, PendingRequest>,
        output: &mut O,
    ) -> Result<(), IpcError>
    where
        O: AsyncWrite + Unpin,
    {
        let now = Instant::now();
        let expired: Vec<String> = pending
            .iter()
            .filter(|(_, p)| p.deadline <= now)
            .map(|(id, _)| id.clone())
            .collect();
        for request_id in expired {
            if let Some(entry) = pending.remove(&request_id) {
                debug!(request_id = %request_id, "Request timed out");
                self.write_line(
                    output,
                    &synthetic_error(
                        Some(&entry.original_payload),
                        codes::TIMEOUT,
                        "no response from daemon within the request timeout",
                    ),
                )
                .await?;
            }
        }
        Ok(())
    }

    /// Drop buffered requests past the staleness threshold
    async fn drop_stale_offline<O>(
        &self,
        offline: &mut VecDeque<BufferedMessage>,
        offline_bytes: &mut usize,
        pending: &mut HashMap<String, PendingRequest>,
        output: &mut O,
    ) -> Result<(), IpcError>
    where
        O: AsyncWrite + Unpin,
    {
        loop {
            let stale = offline
                .front()
                .is_some_and(|front| front.enqueued.elapsed() > self.config.offline_max_age);
            if !stale {
                break;
            }
            let Some(message) = offline.pop_front() else {
                break;
            };
            *offline_bytes = offline_bytes.saturating_sub(message.line.len());
            if let Some(entry) = pending.remove(&message.request_id) {
                self.write_line(
                    output,
                    &synthetic_error(
                        Some(&entry.original_payload),
                        codes::EXPIRED_IN_BUFFER,
                        "request expired while waiting for reconnection",
                    ),
                )
                .await?;
            }
        }
        Ok(())
    }

    /// Terminal failure of all outstanding work, one error per request
    async fn fail_all<O>(
        &self,
        pending: &mut HashMap<String, PendingRequest>,
        offline: &mut VecDeque<BufferedMessage>,
        output: &mut O,
        code: &str,
    ) where
        O: AsyncWrite + Unpin,
    {
        offline.clear();
        for (_, entry) in pending.drain() {
            let line = synthetic_error(
                Some(&entry.original_payload),
                code,
                "request abandoned",
            );
            let _ = self.write_line(output, &line).await;
        }
    }

    async fn write_line<O>(&self, output: &mut O, line: &str) -> Result<(), IpcError>
    where
        O: AsyncWrite + Unpin,
    {
        output.write_all(line.as_bytes()).await?;
        output.write_all(b"\n").await?;
        output.flush().await?;
        Ok(())
    }
}

/// Why a connected session ended
#[derive(Debug)]
enum Disconnect {
    Stopped,
    InputDrained,
    ConnectionLost { reason: String },
    PlannedRestart { grace: Duration },
}

/// How a disconnected wait ended
#[derive(Debug)]
enum Wait {
    Elapsed,
    Stopped,
    Drained,
}

/// Exponential backoff: base * 2^attempt, shift-capped
fn reconnect_delay(base: Duration, attempt: u32) -> Duration {
    base * (1u32 << attempt.min(MAX_BACKOFF_SHIFT))
}

/// A JSON-RPC-shaped error line for local output. The original payload's
/// `id` is echoed when it has one so the caller can correlate.
fn synthetic_error(original: Option<&Value>, code: &str, message: &str) -> String {
    let id = original
        .and_then(|p| p.get("id"))
        .cloned()
        .unwrap_or(Value::Null);
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "error": { "code": code, "message": message },
    })
    .to_string()
}
