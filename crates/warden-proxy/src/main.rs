//! warden-proxy - daemon coordination front end
//!
//! Decides at startup whether this process should become the daemon, attach
//! to an existing one as a stdio proxy, or run standalone, and exposes the
//! lock artifact for inspection. The daemon service itself lives elsewhere;
//! a daemon verdict here hands off with a distinct exit code.

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use libwarden_ipc::lock::LockManager;
use libwarden_ipc::protocol::{self, ProtocolMessage};
use libwarden_ipc::{transport, Bootstrap, IpcConfig, Mode, ProxyClient, ProxyEvent};

/// Exit code for a "become the daemon" verdict; the supervisor that spawned
/// us reacts by starting the daemon service and retrying
const EXIT_BECOME_DAEMON: u8 = 3;
/// Exit code for a standalone verdict
const EXIT_STANDALONE: u8 = 4;

#[derive(Parser)]
#[command(name = "warden-proxy", about = "Warden daemon coordination", version)]
struct Cli {
    /// Transport endpoint override (e.g. ipc:///tmp/warden-daemon.sock)
    #[arg(long, global = true)]
    endpoint: Option<String>,

    /// Lock artifact path override
    #[arg(long, global = true)]
    lock_path: Option<PathBuf>,

    /// Machine-readable output
    #[arg(long, global = true)]
    json: bool,

    /// Suppress non-essential output
    #[arg(long, short, global = true)]
    quiet: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "warn", global = true)]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Bootstrap, then bridge stdin/stdout to the daemon
    Proxy,
    /// Print the bootstrap verdict without acting on it
    Mode,
    /// Inspect the daemon lock artifact
    Status,
    /// Ask the running daemon to shut down
    Stop,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&cli.log_level))
        .unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let mut config = IpcConfig::from_env();
    if let Some(endpoint) = &cli.endpoint {
        config.endpoint = endpoint.clone();
    }
    if let Some(lock_path) = &cli.lock_path {
        config.lock_path = lock_path.clone();
    }

    match &cli.command {
        Command::Proxy => run_proxy(&cli, config).await,
        Command::Mode => run_mode(&cli, config).await,
        Command::Status => run_status(&cli, config),
        Command::Stop => run_stop(&cli, config).await,
    }
}

async fn run_proxy(cli: &Cli, config: IpcConfig) -> ExitCode {
    let bootstrap = match Bootstrap::new(
        config.clone(),
        env!("CARGO_PKG_VERSION"),
        libwarden_ipc::PROTOCOL_VERSION,
    ) {
        Ok(bootstrap) => bootstrap,
        Err(e) => {
            error!("Bootstrap failed: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let decision = bootstrap.determine_mode().await;
    info!(mode = decision.mode.as_str(), reason = %decision.reason, "Bootstrap verdict");

    match decision.mode {
        Mode::Daemon => {
            print_verdict(cli, "daemon", &decision.reason);
            ExitCode::from(EXIT_BECOME_DAEMON)
        }
        Mode::Standalone => {
            print_verdict(cli, "standalone", &decision.reason);
            ExitCode::from(EXIT_STANDALONE)
        }
        Mode::Proxy => {
            let mut client = match ProxyClient::new(
                config,
                env!("CARGO_PKG_VERSION"),
                libwarden_ipc::PROTOCOL_VERSION,
            ) {
                Ok(client) => client,
                Err(e) => {
                    error!("Proxy setup failed: {}", e);
                    return ExitCode::FAILURE;
                }
            };

            let handle = client.handle();
            let mut events = client.events();
            tokio::spawn(async move {
                while let Some(event) = events.recv().await {
                    log_event(&event);
                }
            });

            let run = client.run(tokio::io::stdin(), tokio::io::stdout());
            tokio::pin!(run);

            let result = tokio::select! {
                result = &mut run => result,
                _ = shutdown_signal() => {
                    info!("Received shutdown signal");
                    handle.stop();
                    (&mut run).await
                }
            };

            match result {
                Ok(()) => ExitCode::SUCCESS,
                Err(e) => {
                    error!("Proxy terminated: {}", e);
                    ExitCode::FAILURE
                }
            }
        }
    }
}

async fn run_mode(cli: &Cli, config: IpcConfig) -> ExitCode {
    let bootstrap = match Bootstrap::new(
        config,
        env!("CARGO_PKG_VERSION"),
        libwarden_ipc::PROTOCOL_VERSION,
    ) {
        Ok(bootstrap) => bootstrap,
        Err(e) => {
            error!("Bootstrap failed: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let decision = bootstrap.determine_mode().await;
    print_verdict(cli, decision.mode.as_str(), &decision.reason);
    ExitCode::SUCCESS
}

fn run_status(cli: &Cli, config: IpcConfig) -> ExitCode {
    let manager = LockManager::new(&config);

    match manager.read_lock() {
        Some(record) => {
            let alive = LockManager::is_process_alive(record.pid);
            if cli.json {
                println!(
                    "{}",
                    serde_json::json!({
                        "running": alive,
                        "pid": record.pid,
                        "instance_id": record.instance_id,
                        "transport_address": record.transport_address,
                        "daemon_version": record.daemon_version,
                        "protocol_version": record.protocol_version,
                        "min_client_version": record.min_client_version,
                        "connected_clients": record.connected_clients,
                        "started_at_ms": record.started_at_ms,
                    })
                );
            } else if !cli.quiet {
                if alive {
                    println!("Daemon is running");
                } else {
                    println!("Daemon lock present but owner pid {} is dead", record.pid);
                }
                println!("  PID:              {}", record.pid);
                println!("  Instance:         {}", record.instance_id);
                println!("  Endpoint:         {}", record.transport_address);
                println!("  Version:          {}", record.daemon_version);
                println!("  Protocol:         {}", record.protocol_version);
                println!("  Min client:       {}", record.min_client_version);
                println!("  Clients:          {}", record.connected_clients);
                println!("  Started:          {}", format_timestamp(record.started_at_ms));
            }
        }
        None => {
            if cli.json {
                println!("{}", serde_json::json!({"running": false}));
            } else if !cli.quiet {
                println!("Daemon is not running");
            }
        }
    }

    ExitCode::SUCCESS
}

async fn run_stop(cli: &Cli, config: IpcConfig) -> ExitCode {
    let manager = LockManager::new(&config);

    let Some(record) = manager.read_lock() else {
        if cli.json {
            println!("{}", serde_json::json!({"stopped": false, "reason": "not running"}));
        } else if !cli.quiet {
            println!("Daemon is not running");
        }
        return ExitCode::SUCCESS;
    };

    match send_shutdown(&record.transport_address).await {
        Ok(()) => {
            if cli.json {
                println!("{}", serde_json::json!({"stopped": true, "pid": record.pid}));
            } else if !cli.quiet {
                println!("Daemon stopped (PID {})", record.pid);
            }
            ExitCode::SUCCESS
        }
        Err(e) => {
            // Unreachable daemon plus a dead owner means a stale artifact
            if !LockManager::is_process_alive(record.pid) {
                warn!(pid = record.pid, "Removing stale lock for dead daemon");
                let _ = std::fs::remove_file(&config.lock_path);
                if cli.json {
                    println!(
                        "{}",
                        serde_json::json!({"stopped": false, "reason": "stale lock removed"})
                    );
                } else if !cli.quiet {
                    println!("Daemon not reachable (cleaned up stale lock)");
                }
                ExitCode::SUCCESS
            } else {
                error!("Failed to reach daemon: {}", e);
                ExitCode::FAILURE
            }
        }
    }
}

/// Connect and deliver a shutdown request with no grace period
async fn send_shutdown(endpoint: &str) -> Result<(), libwarden_ipc::IpcError> {
    use tokio::io::AsyncWriteExt;

    let mut stream = transport::connect(endpoint, Duration::from_secs(2)).await?;
    let message = ProtocolMessage::Shutdown {
        reason: "stop requested".to_string(),
        grace_period_ms: 0,
    };
    let line = protocol::encode(&message)?;
    stream.write_all(line.as_bytes()).await?;
    stream.flush().await?;
    Ok(())
}

fn print_verdict(cli: &Cli, mode: &str, reason: &str) {
    if cli.json {
        println!("{}", serde_json::json!({"mode": mode, "reason": reason}));
    } else if !cli.quiet {
        println!("{} ({})", mode, reason);
    }
}

fn log_event(event: &ProxyEvent) {
    match event {
        ProxyEvent::Connected { daemon_version } => {
            info!(daemon_version = %daemon_version, "Connected to daemon");
        }
        ProxyEvent::Disconnected { reason } => {
            warn!(reason = %reason, "Disconnected from daemon");
        }
        ProxyEvent::Reconnecting { attempt, delay } => {
            info!(attempt, delay_ms = delay.as_millis() as u64, "Reconnecting");
        }
        ProxyEvent::UpgradeAvailable { version } => {
            warn!(version = %version, "A newer daemon version is available");
        }
        ProxyEvent::ShuttingDown { reason, grace_period_ms } => {
            warn!(reason = %reason, grace_period_ms, "Daemon is shutting down");
        }
        ProxyEvent::Stopped => {
            info!("Proxy stopped");
        }
    }
}

fn format_timestamp(ts_ms: u64) -> String {
    use chrono::{TimeZone, Utc};
    match Utc.timestamp_millis_opt(ts_ms as i64) {
        chrono::LocalResult::Single(dt) => dt.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
        _ => format!("{}ms", ts_ms),
    }
}

/// Resolves when SIGINT or SIGTERM arrives
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
