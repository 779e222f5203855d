//! Startup decision procedure: daemon, proxy or standalone
//!
//! Every new warden process runs [`Bootstrap::determine_mode`] before doing
//! anything else. Cheap checks run first (env toggle, lock presence, pid
//! liveness) so the common "no daemon yet" and "stale lock" cases resolve
//! without touching the transport; only a plausibly live daemon is probed.

use std::time::{Duration, Instant};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, info, warn};

use crate::config::IpcConfig;
use crate::error::IpcError;
use crate::lock::{AcquireOutcome, LockCandidate, LockManager, LockRecord};
use crate::protocol::{self, LineBuffer, ProtocolMessage};
use crate::transport;
use crate::version::{parse_version, VersionMatcher};

/// What this process should become
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// No valid daemon exists; become it
    Daemon,
    /// A verified live daemon exists; forward to it
    Proxy,
    /// Daemon sharing is administratively disabled
    Standalone,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Daemon => "daemon",
            Mode::Proxy => "proxy",
            Mode::Standalone => "standalone",
        }
    }
}

/// The verdict, with the evidence that produced it
#[derive(Debug)]
pub struct ModeDecision {
    pub mode: Mode,
    pub reason: String,
    /// The verified daemon's record, present for proxy verdicts
    pub existing: Option<LockRecord>,
}

/// Bootstraps a process into its role
pub struct Bootstrap {
    config: IpcConfig,
    lock: LockManager,
    version: String,
    protocol_version: u32,
}

impl Bootstrap {
    /// Create a bootstrap for this process's version.
    ///
    /// An unparseable version is a build defect and is rejected here rather
    /// than surfacing mid-handshake.
    pub fn new(config: IpcConfig, version: &str, protocol_version: u32) -> Result<Self, IpcError> {
        if parse_version(version).is_none() {
            return Err(IpcError::InvalidVersion(version.to_string()));
        }
        let lock = LockManager::new(&config);
        Ok(Self {
            config,
            lock,
            version: version.to_string(),
            protocol_version,
        })
    }

    /// Access the lock manager (for release on shutdown)
    pub fn lock_manager(&mut self) -> &mut LockManager {
        &mut self.lock
    }

    /// Decide this process's role
    pub async fn determine_mode(&self) -> ModeDecision {
        if self.config.daemon_disabled {
            return ModeDecision {
                mode: Mode::Standalone,
                reason: "daemon sharing disabled".to_string(),
                existing: None,
            };
        }

        let record = match self.lock.read_lock() {
            Some(record) => record,
            None => {
                return ModeDecision {
                    mode: Mode::Daemon,
                    reason: "no existing daemon".to_string(),
                    existing: None,
                }
            }
        };

        if !LockManager::is_process_alive(record.pid) {
            debug!(pid = record.pid, "Lock owner is dead");
            return ModeDecision {
                mode: Mode::Daemon,
                reason: format!("stale lock, pid {} dead", record.pid),
                existing: None,
            };
        }

        let check = self.lock.verify_instance(&record).await;
        if !check.valid {
            debug!(pid = record.pid, reason = check.reason, "Lock owner failed verification");
            return ModeDecision {
                mode: Mode::Daemon,
                reason: format!("unverifiable lock owner: {}", check.reason),
                existing: None,
            };
        }

        match self.health_probe(&record).await {
            Ok(latency) => {
                debug!(
                    pid = record.pid,
                    latency_ms = latency.as_millis() as u64,
                    "Existing daemon is healthy"
                );
                ModeDecision {
                    mode: Mode::Proxy,
                    reason: "verified live daemon".to_string(),
                    existing: Some(record),
                }
            }
            Err(reason) => {
                warn!(pid = record.pid, reason = %reason, "Existing daemon failed health probe");
                ModeDecision {
                    mode: Mode::Daemon,
                    reason: format!("zombie process: {}", reason),
                    existing: None,
                }
            }
        }
    }

    /// Connect and complete one heartbeat round-trip within the configured
    /// budget; a slow answer is as bad as none.
    async fn health_probe(&self, record: &LockRecord) -> Result<Duration, String> {
        let start = Instant::now();
        let budget = self.config.health_check_timeout;

        let round_trip = async {
            let mut stream = transport::connect(&record.transport_address, budget)
                .await
                .map_err(|e| e.to_string())?;

            let ping = ProtocolMessage::heartbeat("bootstrap-probe".to_string());
            let line = protocol::encode(&ping).map_err(|e| e.to_string())?;
            stream
                .write_all(line.as_bytes())
                .await
                .map_err(|e| e.to_string())?;
            stream.flush().await.map_err(|e| e.to_string())?;

            let mut buf = LineBuffer::new(4096);
            let mut chunk = [0u8; 1024];
            loop {
                let n = stream.read(&mut chunk).await.map_err(|e| e.to_string())?;
                if n == 0 {
                    return Err("connection closed before heartbeat ack".to_string());
                }
                for line in buf.push(&chunk[..n]).map_err(|_| "oversized reply".to_string())? {
                    if let Some(ProtocolMessage::HeartbeatAck { .. }) = protocol::parse_line(&line)
                    {
                        return Ok(());
                    }
                }
            }
        };

        match tokio::time::timeout(budget, round_trip).await {
            Ok(Ok(())) => {
                let latency = start.elapsed();
                if latency > self.config.health_latency_threshold {
                    Err(format!("ping took {}ms", latency.as_millis()))
                } else {
                    Ok(latency)
                }
            }
            Ok(Err(reason)) => Err(reason),
            Err(_) => Err(format!("no ping reply within {}ms", budget.as_millis())),
        }
    }

    /// Companion to a daemon verdict: compute `min_client_version` from the
    /// running version and take the lock. Losing to a concurrent competitor
    /// is recoverable; the caller should re-run [`determine_mode`].
    ///
    /// [`determine_mode`]: Bootstrap::determine_mode
    pub async fn acquire_daemon_lock(&mut self) -> Result<LockRecord, IpcError> {
        let matcher = VersionMatcher::new(&self.version, self.protocol_version)?;
        let candidate = LockCandidate {
            transport_address: self.config.endpoint.clone(),
            daemon_version: self.version.clone(),
            protocol_version: self.protocol_version,
            min_client_version: matcher.min_client_version(),
        };

        match self.lock.acquire_lock(&candidate).await? {
            AcquireOutcome::Acquired(record) => {
                info!(
                    pid = record.pid,
                    endpoint = %record.transport_address,
                    "Became the daemon"
                );
                Ok(record)
            }
            AcquireOutcome::AlreadyLocked(existing) => {
                info!(pid = existing.pid, "Lost the daemon race");
                Err(IpcError::AlreadyLocked {
                    pid: existing.pid,
                    instance_id: existing.instance_id,
                })
            }
        }
    }
}
