//! Tunables for the IPC subsystem
//!
//! Everything has a sane default so the subsystem works unconfigured. The
//! environment can force standalone mode or move the socket/lock paths.

use std::path::PathBuf;
use std::time::Duration;

use crate::transport;

/// Force standalone mode (disable daemon sharing entirely)
pub const ENV_NO_DAEMON: &str = "WARDEN_NO_DAEMON";
/// Override the transport endpoint
pub const ENV_SOCKET: &str = "WARDEN_SOCKET";
/// Override the lock artifact path
pub const ENV_LOCK_PATH: &str = "WARDEN_LOCK_PATH";

/// Timeouts, budgets and buffer ceilings
#[derive(Debug, Clone)]
pub struct IpcConfig {
    /// Where the lock artifact lives
    pub lock_path: PathBuf,
    /// Endpoint the daemon listens on (recorded in the lock)
    pub endpoint: String,
    /// Daemon sharing disabled; every process runs standalone
    pub daemon_disabled: bool,

    /// Handshake must complete within this window
    pub handshake_timeout: Duration,
    /// Health probe (connect + ping round-trip) budget
    pub health_check_timeout: Duration,
    /// Probe round-trips slower than this mark the daemon as a zombie
    pub health_latency_threshold: Duration,
    /// Instance verification round-trip budget
    pub verify_timeout: Duration,
    /// Overall per-request deadline
    pub request_timeout: Duration,
    /// Interval between client heartbeats
    pub heartbeat_interval: Duration,

    /// First reconnect delay; doubles per attempt
    pub reconnect_base_delay: Duration,
    /// Reconnect attempts before pending work fails terminally
    pub max_reconnect_attempts: u32,
    /// Retries for the optimistic lock update loop
    pub lock_update_retries: u32,

    /// Cap on undelimited bytes from the transport
    pub recv_buffer_limit: usize,
    /// Cap on undelimited bytes from local input
    pub input_buffer_limit: usize,
    /// Byte cap on requests held while disconnected
    pub offline_buffer_limit: usize,
    /// Buffered requests older than this are dropped, not forwarded
    pub offline_max_age: Duration,
}

impl Default for IpcConfig {
    fn default() -> Self {
        Self {
            lock_path: default_lock_path(),
            endpoint: transport::default_endpoint(),
            daemon_disabled: false,
            handshake_timeout: Duration::from_secs(5),
            health_check_timeout: Duration::from_secs(2),
            health_latency_threshold: Duration::from_millis(1_000),
            verify_timeout: Duration::from_secs(2),
            request_timeout: Duration::from_secs(30),
            heartbeat_interval: Duration::from_secs(15),
            reconnect_base_delay: Duration::from_millis(500),
            max_reconnect_attempts: 5,
            lock_update_retries: 3,
            recv_buffer_limit: 1024 * 1024,
            input_buffer_limit: 1024 * 1024,
            offline_buffer_limit: 256 * 1024,
            offline_max_age: Duration::from_secs(30),
        }
    }
}

impl IpcConfig {
    /// Defaults with environment overrides applied
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.daemon_disabled = env_flag(ENV_NO_DAEMON);
        if let Ok(endpoint) = std::env::var(ENV_SOCKET) {
            if !endpoint.is_empty() {
                config.endpoint = endpoint;
            }
        }
        if let Ok(path) = std::env::var(ENV_LOCK_PATH) {
            if !path.is_empty() {
                config.lock_path = PathBuf::from(path);
            }
        }
        config
    }
}

fn env_flag(name: &str) -> bool {
    match std::env::var(name) {
        Ok(value) => matches!(value.as_str(), "1" | "true" | "TRUE" | "yes" | "YES"),
        Err(_) => false,
    }
}

/// Default per-user lock artifact path, beside the default socket
fn default_lock_path() -> PathBuf {
    if let Ok(runtime_dir) = std::env::var("XDG_RUNTIME_DIR") {
        return PathBuf::from(runtime_dir).join("warden-daemon.lock");
    }

    #[cfg(unix)]
    {
        let uid = unsafe { libc::getuid() };
        PathBuf::from(format!("/tmp/warden-daemon-{}.lock", uid))
    }

    #[cfg(not(unix))]
    {
        std::env::temp_dir().join("warden-daemon.lock")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_sane() {
        let c = IpcConfig::default();
        assert!(!c.daemon_disabled);
        assert!(c.max_reconnect_attempts > 0);
        assert!(c.request_timeout > c.handshake_timeout);
        assert!(c.recv_buffer_limit >= 64 * 1024);
    }

    #[test]
    fn test_env_flag_values() {
        assert!(!env_flag("WARDEN_TEST_UNSET_FLAG"));
    }
}
