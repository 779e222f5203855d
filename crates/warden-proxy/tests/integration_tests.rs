//! Integration tests for warden daemon coordination
//!
//! Exercises the lock, bootstrap and update paths through the public
//! library API, with a minimal in-test responder standing in for the
//! daemon where a verification or health round-trip is required.

use std::time::Duration;

use tempfile::tempdir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::task::JoinHandle;

use libwarden_ipc::lock::{AcquireOutcome, LockCandidate, LockManager, LockUpdate};
use libwarden_ipc::protocol::{self, LineBuffer, ProtocolMessage};
use libwarden_ipc::transport::IpcListener;
use libwarden_ipc::{Bootstrap, IpcConfig, Mode};

fn test_config(dir: &tempfile::TempDir) -> IpcConfig {
    IpcConfig {
        lock_path: dir.path().join("daemon.lock"),
        endpoint: format!("ipc://{}/daemon.sock", dir.path().display()),
        verify_timeout: Duration::from_millis(500),
        health_check_timeout: Duration::from_millis(500),
        ..IpcConfig::default()
    }
}

fn candidate(config: &IpcConfig) -> LockCandidate {
    LockCandidate {
        transport_address: config.endpoint.clone(),
        daemon_version: "2.6.0".to_string(),
        protocol_version: 1,
        min_client_version: "2.6.0".to_string(),
    }
}

/// Answers instance verification and heartbeats at the endpoint, the two
/// round-trips a live daemon must win to keep its lock
async fn spawn_responder(endpoint: &str, instance_id: &str) -> JoinHandle<()> {
    let listener = IpcListener::bind(endpoint).await.expect("responder bind");
    let instance_id = instance_id.to_string();

    tokio::spawn(async move {
        loop {
            let Ok(mut stream) = listener.accept().await else {
                return;
            };
            let instance_id = instance_id.clone();
            tokio::spawn(async move {
                let mut buf = LineBuffer::new(64 * 1024);
                let mut chunk = [0u8; 4096];
                loop {
                    let Ok(n) = stream.read(&mut chunk).await else {
                        return;
                    };
                    if n == 0 {
                        return;
                    }
                    let Ok(lines) = buf.push(&chunk[..n]) else {
                        return;
                    };
                    for line in lines {
                        let reply = match protocol::parse_line(&line) {
                            Some(ProtocolMessage::InstanceVerifyRequest) => {
                                Some(ProtocolMessage::InstanceVerifyReply {
                                    instance_id: instance_id.clone(),
                                })
                            }
                            Some(ProtocolMessage::Heartbeat { .. }) => {
                                Some(ProtocolMessage::HeartbeatAck {
                                    timestamp: protocol::unix_ms(),
                                })
                            }
                            _ => None,
                        };
                        if let Some(reply) = reply {
                            let line = protocol::encode(&reply).expect("encode");
                            if stream.write_all(line.as_bytes()).await.is_err() {
                                return;
                            }
                            let _ = stream.flush().await;
                        }
                    }
                }
            });
        }
    })
}

/// Lock can be acquired, read back and released
#[tokio::test]
async fn test_lock_lifecycle() {
    let temp = tempdir().unwrap();
    let config = test_config(&temp);
    let mut manager = LockManager::new(&config);

    let outcome = manager.acquire_lock(&candidate(&config)).await.unwrap();
    let AcquireOutcome::Acquired(record) = outcome else {
        panic!("expected to acquire a fresh lock");
    };
    assert!(config.lock_path.exists());
    assert_eq!(record.pid, std::process::id());
    assert!(!record.instance_id.is_empty());

    let read_back = manager.read_lock().unwrap();
    assert_eq!(read_back, record);

    manager.release_lock().unwrap();
    assert!(!config.lock_path.exists());
}

/// A verifiable live owner keeps the lock against a second claimant
#[cfg(unix)]
#[tokio::test]
async fn test_second_claimant_refused_while_owner_answers() {
    let temp = tempdir().unwrap();
    let config = test_config(&temp);

    let mut first = LockManager::new(&config);
    let AcquireOutcome::Acquired(record) = first.acquire_lock(&candidate(&config)).await.unwrap()
    else {
        panic!("first acquisition must succeed");
    };

    // The owner answers verification with its own instance id
    let responder = spawn_responder(&config.endpoint, &record.instance_id).await;

    let mut second = LockManager::new(&config);
    let outcome = second.acquire_lock(&candidate(&config)).await.unwrap();
    let AcquireOutcome::AlreadyLocked(existing) = outcome else {
        panic!("second acquisition must be refused");
    };
    assert_eq!(existing.instance_id, record.instance_id);

    responder.abort();
    first.release_lock().unwrap();
}

/// A lock whose owner pid is dead is taken over
#[tokio::test]
async fn test_dead_owner_lock_takeover() {
    let temp = tempdir().unwrap();
    let config = test_config(&temp);

    let mut child = std::process::Command::new("true").spawn().unwrap();
    let dead_pid = child.id();
    child.wait().unwrap();

    let stale = serde_json::json!({
        "pid": dead_pid,
        "transport_address": config.endpoint,
        "started_at_ms": 0,
        "daemon_version": "2.5.0",
        "connected_clients": 0,
        "protocol_version": 1,
        "min_client_version": "2.5.0",
        "instance_id": "long-gone",
    });
    std::fs::write(&config.lock_path, stale.to_string()).unwrap();

    let mut manager = LockManager::new(&config);
    let outcome = manager.acquire_lock(&candidate(&config)).await.unwrap();
    let AcquireOutcome::Acquired(record) = outcome else {
        panic!("stale lock must be taken over");
    };
    assert_eq!(record.pid, std::process::id());
    assert_ne!(record.instance_id, "long-gone");

    manager.release_lock().unwrap();
}

/// Bootstrap verdicts: empty state elects a daemon, the env toggle forces
/// standalone
#[tokio::test]
async fn test_bootstrap_verdicts() {
    let temp = tempdir().unwrap();

    let bootstrap = Bootstrap::new(test_config(&temp), "2.6.0", 1).unwrap();
    let decision = bootstrap.determine_mode().await;
    assert_eq!(decision.mode, Mode::Daemon);

    let disabled = IpcConfig {
        daemon_disabled: true,
        ..test_config(&temp)
    };
    let bootstrap = Bootstrap::new(disabled, "2.6.0", 1).unwrap();
    let decision = bootstrap.determine_mode().await;
    assert_eq!(decision.mode, Mode::Standalone);
}

/// A second process sees a healthy, verifiable daemon and elects proxy
#[cfg(unix)]
#[tokio::test]
async fn test_bootstrap_elects_proxy_against_live_daemon() {
    let temp = tempdir().unwrap();
    let config = test_config(&temp);

    let mut owner = Bootstrap::new(config.clone(), "2.6.3", 1).unwrap();
    let record = owner.acquire_daemon_lock().await.unwrap();
    assert_eq!(record.min_client_version, "2.6.0");

    let responder = spawn_responder(&config.endpoint, &record.instance_id).await;

    let newcomer = Bootstrap::new(config.clone(), "2.6.0", 1).unwrap();
    let decision = newcomer.determine_mode().await;
    assert_eq!(decision.mode, Mode::Proxy);
    let existing = decision.existing.unwrap();
    assert_eq!(existing.instance_id, record.instance_id);

    responder.abort();
    owner.lock_manager().release_lock().unwrap();
}

/// The owner can update mutable fields in place without losing the record
#[tokio::test]
async fn test_owner_updates_client_count() {
    let temp = tempdir().unwrap();
    let config = test_config(&temp);
    let mut manager = LockManager::new(&config);

    let AcquireOutcome::Acquired(_) = manager.acquire_lock(&candidate(&config)).await.unwrap()
    else {
        panic!("acquisition must succeed");
    };

    let updated = manager
        .update_lock(&LockUpdate {
            connected_clients: Some(3),
            ..LockUpdate::default()
        })
        .await
        .unwrap();
    assert_eq!(updated.connected_clients, 3);

    let read_back = manager.read_lock().unwrap();
    assert_eq!(read_back.connected_clients, 3);
    assert_eq!(read_back.pid, std::process::id());

    manager.release_lock().unwrap();
}

/// Release is idempotent and never deletes a lock that was taken over
#[tokio::test]
async fn test_release_respects_new_owner() {
    let temp = tempdir().unwrap();
    let config = test_config(&temp);
    let mut manager = LockManager::new(&config);

    let AcquireOutcome::Acquired(_) = manager.acquire_lock(&candidate(&config)).await.unwrap()
    else {
        panic!("acquisition must succeed");
    };

    // Another daemon replaced the artifact while we were running
    let usurper = serde_json::json!({
        "pid": std::process::id(),
        "transport_address": config.endpoint,
        "started_at_ms": protocol::unix_ms(),
        "daemon_version": "2.7.0",
        "connected_clients": 0,
        "protocol_version": 1,
        "min_client_version": "2.7.0",
        "instance_id": "the-new-owner",
    });
    std::fs::write(&config.lock_path, usurper.to_string()).unwrap();

    manager.release_lock().unwrap();
    // The usurper's record survives our release
    assert!(config.lock_path.exists());

    // A second release is a no-op
    manager.release_lock().unwrap();
}
