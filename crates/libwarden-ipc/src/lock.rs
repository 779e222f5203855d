//! The daemon singleton lock
//!
//! At most one warden daemon runs per user. The lock artifact is a JSON
//! file at a well-known path naming the current owner: its pid, transport
//! endpoint and a random per-lifetime `instance_id`. Acquisition is a
//! two-phase temp-write plus atomic create-if-absent (hard link), which
//! avoids the read-then-write race of check-then-create. PID liveness alone
//! is not trusted: the OS reuses pids, so a competitor must also fail an
//! instance-verification round-trip before a lock is declared stale.

use std::fs;
use std::io;
use std::path::PathBuf;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, warn};

use crate::config::IpcConfig;
use crate::error::IpcError;
use crate::protocol::{self, LineBuffer, ProtocolMessage};
use crate::transport;

/// The sole persisted artifact of the subsystem
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LockRecord {
    /// Process ID of the daemon that owns the lock
    pub pid: u32,
    /// Endpoint the daemon listens on (e.g. "ipc:///run/user/1000/warden-daemon.sock")
    pub transport_address: String,
    /// When the daemon started (Unix timestamp in ms)
    pub started_at_ms: u64,
    /// Daemon's semantic version
    pub daemon_version: String,
    /// Clients currently attached; maintained by the owner via `update_lock`
    pub connected_clients: u32,
    /// Wire protocol version the daemon speaks
    pub protocol_version: u32,
    /// Oldest client version accepted (`major.minor.0` of `daemon_version`)
    pub min_client_version: String,
    /// Random token unique per daemon lifetime; never reused even when the
    /// OS reuses the pid. Empty on records written by legacy builds.
    #[serde(default)]
    pub instance_id: String,
}

/// What a would-be daemon offers when trying to take the lock
#[derive(Debug, Clone)]
pub struct LockCandidate {
    pub transport_address: String,
    pub daemon_version: String,
    pub protocol_version: u32,
    pub min_client_version: String,
}

/// Outcome of an acquisition attempt
#[derive(Debug)]
pub enum AcquireOutcome {
    /// We own the lock now
    Acquired(LockRecord),
    /// A verified live daemon already holds it
    AlreadyLocked(LockRecord),
}

/// Fields the owning daemon may mutate in place
#[derive(Debug, Clone, Default)]
pub struct LockUpdate {
    pub connected_clients: Option<u32>,
    pub transport_address: Option<String>,
}

/// Result of instance verification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InstanceCheck {
    pub valid: bool,
    pub reason: &'static str,
}

impl InstanceCheck {
    fn valid(reason: &'static str) -> Self {
        Self { valid: true, reason }
    }

    fn invalid(reason: &'static str) -> Self {
        Self {
            valid: false,
            reason,
        }
    }
}

/// Manages the shared lock artifact
#[derive(Debug)]
pub struct LockManager {
    lock_path: PathBuf,
    verify_timeout: Duration,
    update_retries: u32,
    /// Set after a successful acquire; releases and updates check against it
    held: Option<LockRecord>,
}

impl LockManager {
    /// Create a manager for the configured lock path
    pub fn new(config: &IpcConfig) -> Self {
        Self {
            lock_path: config.lock_path.clone(),
            verify_timeout: config.verify_timeout,
            update_retries: config.lock_update_retries,
            held: None,
        }
    }

    /// The path of the lock artifact
    pub fn lock_path(&self) -> &std::path::Path {
        &self.lock_path
    }

    /// Parse the shared artifact. Absence and structural garbage both read
    /// as "no lock"; neither is an error.
    pub fn read_lock(&self) -> Option<LockRecord> {
        let contents = match fs::read_to_string(&self.lock_path) {
            Ok(c) => c,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return None,
            Err(e) => {
                debug!(path = %self.lock_path.display(), error = %e, "Lock artifact unreadable");
                return None;
            }
        };

        match serde_json::from_str(&contents) {
            Ok(record) => Some(record),
            Err(e) => {
                debug!(path = %self.lock_path.display(), error = %e, "Lock artifact malformed");
                None
            }
        }
    }

    /// Liveness only, not identity: a live process with this pid may be an
    /// unrelated one that inherited it.
    pub fn is_process_alive(pid: u32) -> bool {
        #[cfg(unix)]
        {
            // Signal 0 probes existence; EPERM means alive but not ours
            let rc = unsafe { libc::kill(pid as libc::pid_t, 0) };
            rc == 0 || io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
        }

        #[cfg(not(unix))]
        {
            // No cheap probe here; instance verification makes the call
            let _ = pid;
            true
        }
    }

    /// Identity check defeating PID reuse. The request deliberately does not
    /// reveal the expected id; the peer must volunteer its own, and anything
    /// other than an exact match (including silence) is invalid.
    pub async fn verify_instance(&self, record: &LockRecord) -> InstanceCheck {
        if !Self::is_process_alive(record.pid) {
            return InstanceCheck::invalid("pid_dead");
        }

        if record.instance_id.is_empty() {
            // Legacy record; the pid check is all we have
            return InstanceCheck::valid("no_instance_id");
        }

        match self.peer_instance_id(&record.transport_address).await {
            Some(id) if id == record.instance_id => InstanceCheck::valid("instance_match"),
            Some(_) => InstanceCheck::invalid("pid_alive_instance_mismatch"),
            None => InstanceCheck::invalid("connection_failed"),
        }
    }

    /// Short-lived round-trip asking the peer for its instance id
    async fn peer_instance_id(&self, endpoint: &str) -> Option<String> {
        let round_trip = async {
            let mut stream = transport::connect(endpoint, self.verify_timeout).await.ok()?;
            let line = protocol::encode(&ProtocolMessage::InstanceVerifyRequest).ok()?;
            stream.write_all(line.as_bytes()).await.ok()?;
            stream.flush().await.ok()?;

            let mut buf = LineBuffer::new(4096);
            let mut chunk = [0u8; 1024];
            loop {
                let n = stream.read(&mut chunk).await.ok()?;
                if n == 0 {
                    return None;
                }
                for line in buf.push(&chunk[..n]).ok()? {
                    match protocol::parse_line(&line) {
                        Some(ProtocolMessage::InstanceVerifyReply { instance_id }) => {
                            return Some(instance_id);
                        }
                        // An unparseable or off-script peer cannot be
                        // trusted to be the real daemon
                        _ => return None,
                    }
                }
            }
        };

        tokio::time::timeout(self.verify_timeout, round_trip)
            .await
            .ok()
            .flatten()
    }

    /// Try to become the daemon.
    ///
    /// Assigns a fresh instance id and our own pid, then attempts the atomic
    /// create. If a competitor's record is already in place it is verified;
    /// an invalid incumbent is deleted and creation retried exactly once.
    pub async fn acquire_lock(
        &mut self,
        candidate: &LockCandidate,
    ) -> Result<AcquireOutcome, IpcError> {
        let record = LockRecord {
            pid: std::process::id(),
            transport_address: candidate.transport_address.clone(),
            started_at_ms: protocol::unix_ms(),
            daemon_version: candidate.daemon_version.clone(),
            connected_clients: 0,
            protocol_version: candidate.protocol_version,
            min_client_version: candidate.min_client_version.clone(),
            instance_id: uuid::Uuid::new_v4().to_string(),
        };

        for attempt in 0..2 {
            if self.try_create(&record)? {
                debug!(pid = record.pid, instance_id = %record.instance_id, "Daemon lock acquired");
                self.held = Some(record.clone());
                return Ok(AcquireOutcome::Acquired(record));
            }

            // Not an error: a competitor holds or held the lock
            let existing = match self.read_lock() {
                Some(existing) => existing,
                None => continue, // disappeared between link and read; retry
            };

            let check = self.verify_instance(&existing).await;
            if check.valid {
                debug!(
                    pid = existing.pid,
                    reason = check.reason,
                    "Daemon lock held by a verified owner"
                );
                return Ok(AcquireOutcome::AlreadyLocked(existing));
            }

            if attempt == 0 {
                debug!(
                    pid = existing.pid,
                    reason = check.reason,
                    "Clearing stale daemon lock"
                );
                match fs::remove_file(&self.lock_path) {
                    Ok(()) => {}
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                    Err(e) => return Err(e.into()),
                }
            } else {
                // Beaten again after clearing a stale lock; yield to the
                // other competitor
                return Ok(AcquireOutcome::AlreadyLocked(existing));
            }
        }

        // Both creation attempts raced with writers that then vanished
        Err(IpcError::AcquireConflict { attempts: 2 })
    }

    /// Write the record to a private temp file, then atomically link it to
    /// the shared path. Returns false when the target already exists, which
    /// is the one failure distinct from real I/O errors.
    fn try_create(&self, record: &LockRecord) -> Result<bool, IpcError> {
        let temp = self.temp_path();
        write_private(&temp, &serde_json::to_string_pretty(record)?)?;

        let result = match fs::hard_link(&temp, &self.lock_path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(e.into()),
        };

        let _ = fs::remove_file(&temp);
        result
    }

    fn temp_path(&self) -> PathBuf {
        let nonce: u32 = rand::thread_rng().gen();
        self.lock_path.with_file_name(format!(
            ".warden-lock.{}.{:08x}.tmp",
            std::process::id(),
            nonce
        ))
    }

    /// Remove the artifact if we still own it. Idempotent: an absent
    /// artifact or one owned by someone else is left alone, successfully.
    pub fn release_lock(&mut self) -> Result<(), IpcError> {
        let ours = match self.held.take() {
            Some(record) => record,
            None => return Ok(()),
        };

        // Final re-read immediately before deletion guards against a racing
        // update between verification and unlink
        match self.read_lock() {
            Some(current)
                if current.pid == ours.pid && current.instance_id == ours.instance_id =>
            {
                match fs::remove_file(&self.lock_path) {
                    Ok(()) => Ok(()),
                    Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
                    Err(e) => Err(e.into()),
                }
            }
            Some(current) => {
                debug!(
                    pid = current.pid,
                    "Lock superseded by another daemon; leaving it"
                );
                Ok(())
            }
            None => Ok(()),
        }
    }

    /// Optimistic-concurrency in-place mutation by the owner.
    ///
    /// The version token is `(started_at_ms, instance_id)`: the merged
    /// record only replaces the artifact if a re-read shows the token and
    /// pid unchanged. Bounded retries with jittered backoff; a persistent
    /// conflict is reported, never silently overwritten.
    pub async fn update_lock(&mut self, update: &LockUpdate) -> Result<LockRecord, IpcError> {
        let own_pid = std::process::id();

        for attempt in 0..self.update_retries {
            let current = match self.read_lock() {
                Some(c) => c,
                None => return Err(IpcError::UpdateConflict { attempts: attempt + 1 }),
            };
            if current.pid != own_pid {
                warn!(pid = current.pid, "Lock no longer ours; refusing update");
                return Err(IpcError::UpdateConflict { attempts: attempt + 1 });
            }

            let token = (current.started_at_ms, current.instance_id.clone());

            let mut merged = current;
            if let Some(clients) = update.connected_clients {
                merged.connected_clients = clients;
            }
            if let Some(ref addr) = update.transport_address {
                merged.transport_address = addr.clone();
            }

            let temp = self.temp_path();
            write_private(&temp, &serde_json::to_string_pretty(&merged)?)?;

            let unchanged = self
                .read_lock()
                .map(|r| r.pid == own_pid && (r.started_at_ms, r.instance_id) == token)
                .unwrap_or(false);

            if unchanged {
                // rename overwrites in place; intended here, the token check
                // just confirmed ownership
                fs::rename(&temp, &self.lock_path)?;
                self.held = Some(merged.clone());
                return Ok(merged);
            }

            let _ = fs::remove_file(&temp);
            let jitter = rand::thread_rng().gen_range(10..50);
            tokio::time::sleep(Duration::from_millis(jitter * (attempt as u64 + 1))).await;
        }

        Err(IpcError::UpdateConflict {
            attempts: self.update_retries,
        })
    }
}

/// Write a file readable only by the owner
fn write_private(path: &std::path::Path, contents: &str) -> Result<(), IpcError> {
    #[cfg(unix)]
    {
        use std::io::Write;
        use std::os::unix::fs::OpenOptionsExt;
        let mut file = fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)?;
        file.write_all(contents.as_bytes())?;
        Ok(())
    }

    #[cfg(not(unix))]
    {
        fs::write(path, contents)?;
        Ok(())
    }
}
