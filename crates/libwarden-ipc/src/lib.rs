//! Shared-daemon coordination for warden
//!
//! Many short-lived warden processes (editor windows, CLI invocations) share
//! a single long-running daemon. This crate provides the pieces that make
//! that sharing safe without a central coordinator:
//!
//! - Wire protocol types and newline-delimited JSON framing (`protocol`)
//! - Semantic version parsing and compatibility rules (`version`)
//! - The crash-safe, PID-reuse-safe daemon lock (`lock`)
//! - The startup decision procedure: daemon, proxy or standalone (`bootstrap`)
//! - A stdio-to-IPC proxy client with reconnection and buffering (`proxy`)
//! - Endpoint parsing and duplex stream types (`transport`)

pub mod bootstrap;
pub mod config;
pub mod error;
pub mod lock;
pub mod protocol;
pub mod proxy;
pub mod transport;
pub mod version;

#[cfg(test)]
pub(crate) mod testutil;

pub use bootstrap::{Bootstrap, Mode, ModeDecision};
pub use config::IpcConfig;
pub use error::IpcError;
pub use lock::{AcquireOutcome, LockCandidate, LockManager, LockRecord};
pub use protocol::ProtocolMessage;
pub use proxy::{ProxyClient, ProxyEvent, ProxyHandle};
pub use version::{Compatibility, ParsedVersion, VersionMatcher};

/// Wire protocol version; handshakes across different values are refused
pub const PROTOCOL_VERSION: u32 = 1;
