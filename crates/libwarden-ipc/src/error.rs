//! IPC error types

use thiserror::Error;

/// Errors that can occur during IPC operations
#[derive(Error, Debug)]
pub enum IpcError {
    /// Connection failed
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Operation timed out
    #[error("{operation} timed out after {timeout_ms}ms")]
    Timeout { operation: &'static str, timeout_ms: u64 },

    /// Daemon lock is held by another live daemon
    #[error("Daemon lock held by process {pid} (instance {instance_id})")]
    AlreadyLocked { pid: u32, instance_id: String },

    /// Lock update lost the optimistic-concurrency race
    #[error("Lock update conflicted with a concurrent writer after {attempts} attempts")]
    UpdateConflict { attempts: u32 },

    /// Lock creation kept colliding with writers whose record never
    /// became readable
    #[error("Lock acquisition raced with competing writers after {attempts} attempts")]
    AcquireConflict { attempts: u32 },

    /// Handshake was refused by the daemon
    #[error("Handshake refused: {reason}")]
    HandshakeRefused { reason: String },

    /// Client and daemon versions are incompatible
    #[error("Version mismatch: {reason}")]
    VersionMismatch { reason: String, upgrade_recommended: bool },

    /// A version string could not be parsed
    #[error("Invalid version string: {0:?}")]
    InvalidVersion(String),

    /// A buffer exceeded its configured ceiling and was cleared
    #[error("{buffer} overflowed its {limit}-byte cap and was cleared")]
    BufferOverflow { buffer: &'static str, limit: usize },

    /// Reconnect attempts exhausted; pending work failed terminally
    #[error("Reconnect attempts exhausted after {attempts} tries")]
    ReconnectExhausted { attempts: u32 },

    /// Invalid transport endpoint
    #[error("Invalid endpoint: {0}")]
    InvalidEndpoint(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Error codes carried in wire `Error` messages and synthetic local responses
pub mod codes {
    pub const TIMEOUT: &str = "timeout";
    pub const EXPIRED_IN_BUFFER: &str = "expired_during_reconnection";
    pub const BUFFER_OVERFLOW: &str = "buffer_overflow";
    pub const RECONNECT_EXHAUSTED: &str = "reconnect_exhausted";
    pub const STOPPED: &str = "stopped";
    pub const VERSION_MISMATCH: &str = "version_mismatch";
    pub const INTERNAL: &str = "internal";
}
