//! In-process mock daemon for tests
//!
//! Speaks just enough of the wire protocol to exercise instance
//! verification, bootstrap probes and the proxy client: handshakes,
//! heartbeats, instance verification and echoing request payloads back as
//! responses.

use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::protocol::{self, LineBuffer, ProtocolMessage};
use crate::transport::{IpcListener, IpcStream};

/// A shutdown announcement the mock sends after acking a handshake, then
/// drops the connection, the way a real daemon goes away for an upgrade
#[derive(Debug, Clone)]
pub(crate) struct ShutdownNotice {
    pub delay: Duration,
    pub reason: String,
    pub grace_period_ms: u64,
}

#[derive(Debug, Clone)]
pub(crate) struct MockOptions {
    pub daemon_version: String,
    pub protocol_version: u32,
    /// Refuse handshakes with this reason instead of acking
    pub refuse_reason: Option<String>,
    /// Swallow requests without responding (for timeout tests)
    pub hold_requests: bool,
    /// Announce a shutdown after each accepted handshake
    pub shutdown_after: Option<ShutdownNotice>,
}

impl Default for MockOptions {
    fn default() -> Self {
        Self {
            daemon_version: "2.6.0".to_string(),
            protocol_version: 1,
            refuse_reason: None,
            hold_requests: false,
            shutdown_after: None,
        }
    }
}

pub(crate) struct MockDaemon {
    task: JoinHandle<()>,
    shutdown: broadcast::Sender<()>,
}

impl MockDaemon {
    pub(crate) async fn start(endpoint: &str, instance_id: &str) -> Self {
        Self::start_with(endpoint, instance_id, MockOptions::default()).await
    }

    pub(crate) async fn start_with(
        endpoint: &str,
        instance_id: &str,
        options: MockOptions,
    ) -> Self {
        let listener = IpcListener::bind(endpoint)
            .await
            .expect("mock daemon bind");
        let (shutdown, _) = broadcast::channel(1);
        let mut shutdown_rx = shutdown.subscribe();
        let instance_id = instance_id.to_string();

        let conn_shutdown = shutdown.clone();
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    accepted = listener.accept() => {
                        let Ok(stream) = accepted else { break };
                        let instance_id = instance_id.clone();
                        let options = options.clone();
                        let mut conn_shutdown_rx = conn_shutdown.subscribe();
                        tokio::spawn(async move {
                            tokio::select! {
                                _ = serve_connection(stream, instance_id, options) => {}
                                // Dropping the stream disconnects the peer
                                _ = conn_shutdown_rx.recv() => {}
                            }
                        });
                    }
                    _ = shutdown_rx.recv() => break,
                }
            }
        });

        Self { task, shutdown }
    }

    pub(crate) async fn stop(self) {
        let _ = self.shutdown.send(());
        let _ = self.task.await;
    }
}

async fn serve_connection(
    mut stream: IpcStream,
    instance_id: String,
    options: MockOptions,
) -> std::io::Result<()> {
    let mut buf = LineBuffer::new(1024 * 1024);
    let mut chunk = [0u8; 4096];

    loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Ok(());
        }
        let lines = match buf.push(&chunk[..n]) {
            Ok(lines) => lines,
            Err(_) => return Ok(()),
        };

        for line in lines {
            let Some(message) = protocol::parse_line(&line) else {
                continue;
            };
            let is_handshake = matches!(message, ProtocolMessage::Handshake { .. });
            let reply = match message {
                ProtocolMessage::InstanceVerifyRequest => {
                    Some(ProtocolMessage::InstanceVerifyReply {
                        instance_id: instance_id.clone(),
                    })
                }
                ProtocolMessage::Handshake { client_id, .. } => {
                    if let Some(reason) = &options.refuse_reason {
                        Some(ProtocolMessage::HandshakeAck {
                            success: false,
                            assigned_client_id: client_id,
                            daemon_version: options.daemon_version.clone(),
                            protocol_version: options.protocol_version,
                            upgrade_recommended: false,
                            error: Some(reason.clone()),
                        })
                    } else {
                        Some(ProtocolMessage::HandshakeAck {
                            success: true,
                            assigned_client_id: client_id,
                            daemon_version: options.daemon_version.clone(),
                            protocol_version: options.protocol_version,
                            upgrade_recommended: false,
                            error: None,
                        })
                    }
                }
                ProtocolMessage::Heartbeat { .. } => Some(ProtocolMessage::HeartbeatAck {
                    timestamp: protocol::unix_ms(),
                }),
                ProtocolMessage::Request {
                    request_id,
                    payload,
                    ..
                } => {
                    if options.hold_requests {
                        None
                    } else {
                        Some(ProtocolMessage::Response {
                            request_id,
                            payload,
                        })
                    }
                }
                _ => None,
            };

            if let Some(reply) = reply {
                let line = protocol::encode(&reply).expect("mock encode");
                stream.write_all(line.as_bytes()).await?;
                stream.flush().await?;
            }

            if is_handshake && options.refuse_reason.is_none() {
                if let Some(notice) = &options.shutdown_after {
                    // Delay so the client is out of its handshake read
                    // before the announcement lands
                    tokio::time::sleep(notice.delay).await;
                    let shutdown = ProtocolMessage::Shutdown {
                        reason: notice.reason.clone(),
                        grace_period_ms: notice.grace_period_ms,
                    };
                    let line = protocol::encode(&shutdown).expect("mock encode");
                    stream.write_all(line.as_bytes()).await?;
                    stream.flush().await?;
                    return Ok(());
                }
            }
        }
    }
}
