//! Wire protocol message types and framing
//!
//! Every message is a single line of UTF-8 JSON terminated by `\n`. The
//! `type` field tags the variant. Parsing is total: a malformed line or an
//! unrecognized `type` yields `None` so read loops can log-and-skip instead
//! of tearing the connection down for one bad frame.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::IpcError;

/// All messages exchanged between proxy clients and the daemon
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProtocolMessage {
    /// Opens a client session; first message after connecting
    Handshake {
        client_id: String,
        client_version: String,
        protocol_version: u32,
        capabilities: Vec<String>,
    },

    /// Daemon's reply to a handshake
    HandshakeAck {
        success: bool,
        assigned_client_id: String,
        daemon_version: String,
        protocol_version: u32,
        upgrade_recommended: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },

    /// A forwarded client request; `payload` is opaque to this subsystem
    Request {
        request_id: String,
        client_id: String,
        payload: Value,
    },

    /// Daemon's answer to a request, correlated by `request_id`
    Response { request_id: String, payload: Value },

    /// Periodic liveness probe from a client
    Heartbeat { client_id: String, timestamp: u64 },

    /// Daemon's echo of a heartbeat
    HeartbeatAck { timestamp: u64 },

    /// Daemon is going away; clients may reconnect after the grace period
    Shutdown { reason: String, grace_period_ms: u64 },

    /// An error, optionally targeting a specific in-flight request
    Error {
        code: String,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
    },

    /// A newer daemon binary is staged; a planned restart will follow
    UpgradePending { new_version: String },

    /// Asks the peer to prove which daemon instance it is. Deliberately
    /// carries no expected id: the peer must volunteer its own.
    InstanceVerifyRequest,

    /// The peer's own instance token
    InstanceVerifyReply { instance_id: String },
}

impl ProtocolMessage {
    /// Get the message type as a string (for logging and filtering)
    pub fn message_type(&self) -> &'static str {
        match self {
            ProtocolMessage::Handshake { .. } => "handshake",
            ProtocolMessage::HandshakeAck { .. } => "handshake_ack",
            ProtocolMessage::Request { .. } => "request",
            ProtocolMessage::Response { .. } => "response",
            ProtocolMessage::Heartbeat { .. } => "heartbeat",
            ProtocolMessage::HeartbeatAck { .. } => "heartbeat_ack",
            ProtocolMessage::Shutdown { .. } => "shutdown",
            ProtocolMessage::Error { .. } => "error",
            ProtocolMessage::UpgradePending { .. } => "upgrade_pending",
            ProtocolMessage::InstanceVerifyRequest => "instance_verify_request",
            ProtocolMessage::InstanceVerifyReply { .. } => "instance_verify_reply",
        }
    }

    /// Create a handshake message
    pub fn handshake(
        client_id: String,
        client_version: String,
        protocol_version: u32,
        capabilities: Vec<String>,
    ) -> Self {
        ProtocolMessage::Handshake {
            client_id,
            client_version,
            protocol_version,
            capabilities,
        }
    }

    /// Create a request wrapping an opaque payload with a fresh request id
    pub fn request(client_id: String, payload: Value) -> Self {
        ProtocolMessage::Request {
            request_id: uuid::Uuid::new_v4().to_string(),
            client_id,
            payload,
        }
    }

    /// Create a heartbeat stamped with the current time
    pub fn heartbeat(client_id: String) -> Self {
        ProtocolMessage::Heartbeat {
            client_id,
            timestamp: unix_ms(),
        }
    }

    /// Create an error message
    pub fn error(code: &str, message: String, request_id: Option<String>) -> Self {
        ProtocolMessage::Error {
            code: code.to_string(),
            message,
            request_id,
        }
    }
}

/// Serialize a message as one newline-terminated line.
///
/// serde_json escapes control characters inside strings, so the encoded form
/// can never contain an embedded raw newline.
pub fn encode(message: &ProtocolMessage) -> Result<String, IpcError> {
    let mut line = serde_json::to_string(message)?;
    debug_assert!(!line.contains('\n'));
    line.push('\n');
    Ok(line)
}

/// Parse one line into a message. Total: malformed JSON or an unknown
/// `type` yields `None`.
pub fn parse_line(line: &str) -> Option<ProtocolMessage> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return None;
    }
    serde_json::from_str(trimmed).ok()
}

/// Current time in milliseconds since the Unix epoch
pub fn unix_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Line accumulator shared by the transport receive path and the local
/// input path. Capped: feeding more bytes than `limit` without a delimiter
/// clears the buffer and reports overflow, trading completeness for
/// liveness.
#[derive(Debug)]
pub struct LineBuffer {
    buf: Vec<u8>,
    limit: usize,
}

impl LineBuffer {
    /// Create a buffer with the given byte ceiling
    pub fn new(limit: usize) -> Self {
        Self {
            buf: Vec::new(),
            limit,
        }
    }

    /// Append bytes and drain any complete lines.
    ///
    /// Returns the completed lines (without the trailing `\n`), or an error
    /// if the undelimited remainder exceeded the cap. On overflow the buffer
    /// is cleared; subsequent well-formed frames parse normally.
    pub fn push(&mut self, data: &[u8]) -> Result<Vec<String>, usize> {
        self.buf.extend_from_slice(data);

        let mut lines = Vec::new();
        while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buf.drain(..=pos).collect();
            let text = String::from_utf8_lossy(&line[..line.len() - 1]).into_owned();
            lines.push(text);
        }

        if self.buf.len() > self.limit {
            self.buf.clear();
            return Err(self.limit);
        }

        Ok(lines)
    }

    /// Bytes currently held without a delimiter
    pub fn pending_len(&self) -> usize {
        self.buf.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_encode_is_single_line() {
        let msg = ProtocolMessage::request(
            "client-1".to_string(),
            json!({"method": "tools/list", "text": "line one\nline two"}),
        );
        let encoded = encode(&msg).unwrap();
        assert!(encoded.ends_with('\n'));
        // The payload newline must be escaped, not embedded
        assert_eq!(encoded.matches('\n').count(), 1);
    }

    #[test]
    fn test_roundtrip() {
        let msg = ProtocolMessage::HandshakeAck {
            success: true,
            assigned_client_id: "c-42".to_string(),
            daemon_version: "2.6.0".to_string(),
            protocol_version: 1,
            upgrade_recommended: false,
            error: None,
        };
        let encoded = encode(&msg).unwrap();
        let parsed = parse_line(&encoded).unwrap();
        assert_eq!(parsed, msg);
    }

    #[test]
    fn test_parse_is_total() {
        assert!(parse_line("not json at all").is_none());
        assert!(parse_line("{\"type\":\"warp_core_breach\"}").is_none());
        assert!(parse_line("{\"type\":\"request\"}").is_none()); // missing fields
        assert!(parse_line("").is_none());
        assert!(parse_line("   ").is_none());
    }

    #[test]
    fn test_parse_instance_verify() {
        let parsed = parse_line("{\"type\":\"instance_verify_reply\",\"instance_id\":\"abc\"}");
        assert_eq!(
            parsed,
            Some(ProtocolMessage::InstanceVerifyReply {
                instance_id: "abc".to_string()
            })
        );
    }

    #[test]
    fn test_request_ids_are_fresh() {
        let a = ProtocolMessage::request("c".to_string(), json!({}));
        let b = ProtocolMessage::request("c".to_string(), json!({}));
        let (ProtocolMessage::Request { request_id: ra, .. }, ProtocolMessage::Request { request_id: rb, .. }) =
            (a, b)
        else {
            panic!("expected requests");
        };
        assert_ne!(ra, rb);
    }

    #[test]
    fn test_line_buffer_splits_frames() {
        let mut buf = LineBuffer::new(1024);
        let lines = buf.push(b"{\"a\":1}\n{\"b\":").unwrap();
        assert_eq!(lines, vec!["{\"a\":1}".to_string()]);
        let lines = buf.push(b"2}\n").unwrap();
        assert_eq!(lines, vec!["{\"b\":2}".to_string()]);
        assert_eq!(buf.pending_len(), 0);
    }

    #[test]
    fn test_line_buffer_overflow_clears_and_recovers() {
        let mut buf = LineBuffer::new(8);
        assert!(buf.push(b"0123456789abcdef").is_err());
        assert_eq!(buf.pending_len(), 0);
        // Well-formed frames parse correctly afterward
        let lines = buf.push(b"ok\n").unwrap();
        assert_eq!(lines, vec!["ok".to_string()]);
    }
}
