// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Daemon lifecycle: bind the listening socket, accept
//! connections, and run the snapshot/ledger/watchdog/supervisor tasks
//! until shutdown.

use std::os::unix::fs::{FileTypeExt, PermissionsExt};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::net::UnixListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::connection::{handle_connection, ConnectionContext};
use crate::ledger::{FileLedger, LedgerEvent, Watchdog};
use crate::registry::AgentRegistry;
use crate::router::Router;
use crate::snapshot::SnapshotWriter;
use crate::storage::{RemoteStorageAdapter, SqliteStorageAdapter, StorageAdapter};
use crate::supervisor::{ProcessSpawner, SupervisingOrchestrator};

/// Bind the daemon's Unix socket at `path`, refusing to unlink anything
/// that isn't already a socket.
fn bind_socket(path: &std::path::Path) -> anyhow::Result<UnixListener> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    if let Ok(metadata) = std::fs::metadata(path) {
        if !metadata.file_type().is_socket() {
            anyhow::bail!(
                "refusing to start: {} exists and is not a socket",
                path.display()
            );
        }
        std::fs::remove_file(path)?;
    }
    let listener = UnixListener::bind(path)?;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    Ok(listener)
}

fn write_pid_file(path: &std::path::Path) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, std::process::id().to_string())?;
    Ok(())
}

/// Run the daemon to completion: bind, accept, and drive every background
/// task until SIGINT/SIGTERM requests shutdown.
pub async fn run(config: Config) -> anyhow::Result<()> {
    config.validate()?;

    let socket_path = config.socket_path();
    let listener = bind_socket(&socket_path)?;
    write_pid_file(&config.pid_file_path())?;
    std::fs::create_dir_all(config.state_dir())?;
    std::fs::create_dir_all(config.inbox_dir())?;
    std::fs::create_dir_all(config.archive_dir())?;

    // The file ledger is always local embedded SQL regardless of which
    // message-storage backend is configured (spec: the ledger's durability
    // never depends on the cloud storage tier).
    let sqlite: Arc<SqliteStorageAdapter> = Arc::new(SqliteStorageAdapter::open(&config.ledger_db_path())?);
    let storage: Arc<dyn StorageAdapter> = match &config.storage_url {
        Some(url) => Arc::new(RemoteStorageAdapter::connect(url)?),
        None => sqlite.clone() as Arc<dyn StorageAdapter>,
    };
    let router = Router::new(storage.clone(), config.default_sync_timeout_ms);
    let registry = Arc::new(AgentRegistry::load(config.state_dir().join("agents.json")));

    let shutdown = CancellationToken::new();

    let ledger = Arc::new(FileLedger::new(sqlite.shared_connection(), 5, 1024 * 1024));
    ledger.recover_on_start().await?;

    let spawner = Arc::new(ProcessSpawner {
        binary_path: std::env::current_exe()
            .ok()
            .and_then(|p| p.parent().map(|d| d.join("relay-agent")))
            .unwrap_or_else(|| std::path::PathBuf::from("relay-agent")),
        daemon_socket: socket_path.clone(),
        workspace_id: config.workspace_id.clone(),
    });
    let supervisor = SupervisingOrchestrator::with_workspace(
        router.clone(),
        spawner,
        Duration::from_secs(config.health_interval_secs),
        config.cpu_alert_threshold,
        Duration::from_secs(config.alert_cooldown_secs),
        config.workspace_id.clone(),
    );

    let (spawn_tx, spawn_rx) = mpsc::unbounded_channel();
    let ctx = Arc::new(ConnectionContext {
        router: router.clone(),
        storage: storage.clone() as Arc<dyn StorageAdapter>,
        registry: registry.clone(),
        heartbeat_interval: Duration::from_millis(config.heartbeat_ms),
        heartbeat_misses: config.heartbeat_misses,
        spawn_tx: Some(spawn_tx),
        started_at: Instant::now(),
    });

    let snapshot_writer = SnapshotWriter::new(
        config.state_dir(),
        router.clone(),
        Duration::from_millis(config.snapshot_ms),
    );

    let watchdog = Arc::new(Watchdog::new(config.inbox_dir(), ledger.clone(), Duration::from_secs(2)));
    let (ledger_events_tx, ledger_events_rx) = mpsc::channel(64);

    let mut tasks = tokio::task::JoinSet::new();
    tasks.spawn(supervisor.clone().run(shutdown.clone()));
    tasks.spawn(supervisor.clone().run_health_poll(shutdown.clone()));
    tasks.spawn(supervisor.clone().run_spawn_queue(spawn_rx, shutdown.clone()));
    tasks.spawn(snapshot_writer.run(shutdown.clone()));
    tasks.spawn(watchdog.run(ledger_events_tx, shutdown.clone()));
    tasks.spawn(drive_ledger_events(
        ledger.clone(),
        ledger_events_rx,
        ctx.clone(),
        config.archive_dir(),
        shutdown.clone(),
    ));
    tasks.spawn(accept_loop(listener, ctx.clone(), config.frame_cap, shutdown.clone()));
    tasks.spawn(wait_for_signal(shutdown.clone()));

    info!(socket = %socket_path.display(), "relayd listening");

    while let Some(result) = tasks.join_next().await {
        if let Err(e) = result {
            if !e.is_cancelled() {
                error!(err = %e, "daemon task panicked");
            }
        }
    }

    let _ = std::fs::remove_file(&socket_path);
    let _ = std::fs::remove_file(config.pid_file_path());
    Ok(())
}

async fn wait_for_signal(shutdown: CancellationToken) {
    let mut sigterm = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
        Ok(sig) => sig,
        Err(e) => {
            warn!(err = %e, "failed to install SIGTERM handler");
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
        _ = shutdown.cancelled() => return,
    }
    info!("shutdown requested");
    shutdown.cancel();
}

async fn accept_loop(
    listener: UnixListener,
    ctx: Arc<ConnectionContext>,
    frame_cap: usize,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, _addr)) => {
                        let ctx = ctx.clone();
                        let shutdown = shutdown.clone();
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(stream, ctx, frame_cap, shutdown).await {
                                warn!(err = %e, "connection ended with error");
                            }
                        });
                    }
                    Err(e) => {
                        warn!(err = %e, "failed to accept connection");
                    }
                }
            }
        }
    }
}

/// Translate claimed ledger events into Router/supervisor actions through
/// a synthetic connection identity — the watchdog has no socket of its
/// own, so it drives the same APIs a real connection would.
async fn drive_ledger_events(
    ledger: Arc<FileLedger>,
    mut events_rx: mpsc::Receiver<LedgerEvent>,
    ctx: Arc<ConnectionContext>,
    archive_dir: std::path::PathBuf,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            event = events_rx.recv() => {
                let Some(event) = event else { break };
                match event {
                    LedgerEvent::Deliver { record, headers, body } => {
                        match record.message_type.as_str() {
                            "spawn" => {
                                if let (Some(name), Some(cli)) = (headers.name, headers.cli) {
                                    if let Some(tx) = &ctx.spawn_tx {
                                        ctx.router.mark_spawning(&name);
                                        let _ = tx.send(crate::supervisor::SpawnRequest {
                                            name,
                                            cli,
                                            program: None,
                                            model: headers.model,
                                            task: None,
                                            cwd: headers.cwd,
                                            team: None,
                                        });
                                    }
                                }
                                let _ = ledger.mark_delivered(&record.id).await;
                                archive_delivered(&ledger, &archive_dir, &record).await;
                            }
                            "release" => {
                                ctx.router.force_remove_agent(&record.agent_name);
                                let _ = ledger.mark_delivered(&record.id).await;
                                archive_delivered(&ledger, &archive_dir, &record).await;
                            }
                            _ => {
                                if let Some(to) = headers.to {
                                    let recipients = ctx.router.resolve_recipients(&record.agent_name, &to);
                                    if recipients.is_empty() {
                                        let _ = ledger.mark_failed(&record.id, "recipient not connected").await;
                                    } else {
                                        // The outbox owner need not have a live socket of its
                                        // own, so route() is given a throwaway virtual
                                        // connection carrying just its identity.
                                        let (virtual_tx, _virtual_rx) = mpsc::channel(1);
                                        let virtual_conn = crate::router::ConnHandle::new(
                                            record.agent_name.clone(),
                                            relay_proto::EntityType::Agent,
                                            String::new(),
                                            String::new(),
                                            virtual_tx,
                                        );
                                        let env = relay_proto::Envelope::new(relay_proto::Payload::Send {
                                            body,
                                            thread: headers.thread,
                                        })
                                        .to(to);
                                        ctx.router.route(&virtual_conn, env).await;
                                        let _ = ledger.mark_delivered(&record.id).await;
                                        archive_delivered(&ledger, &archive_dir, &record).await;
                                    }
                                } else {
                                    let _ = ledger.mark_failed(&record.id, "missing TO header").await;
                                }
                            }
                        }
                    }
                    LedgerEvent::ClaimFailed { record_id, error } => {
                        warn!(record_id, error, "failed to claim ledger record");
                    }
                }
            }
        }
    }
}

/// Move a delivered outbox file out of `inbox/<agent>/` into
/// `archive/<agent>/` and record the moved path, completing the
/// `pending -> processing -> delivered -> archived` lifecycle. Best-effort:
/// a failed move or a concurrent archive of the same record just leaves the
/// file in place with `delivered` status, which `recover_on_start` treats
/// as settled rather than re-claimable.
async fn archive_delivered(ledger: &Arc<FileLedger>, archive_dir: &std::path::Path, record: &crate::ledger::LedgerRecord) {
    let source = std::path::PathBuf::from(&record.source_path);
    let Some(file_name) = source.file_name() else { return };
    let dest_dir = archive_dir.join(&record.agent_name);
    if let Err(e) = tokio::fs::create_dir_all(&dest_dir).await {
        warn!(err = %e, agent = %record.agent_name, "failed to create archive directory");
        return;
    }
    let dest = dest_dir.join(file_name);
    if let Err(e) = tokio::fs::rename(&source, &dest).await {
        warn!(err = %e, source = %source.display(), "failed to archive delivered outbox file");
        return;
    }
    if let Err(e) = ledger.mark_archived(&record.id, &dest).await {
        warn!(err = %e, record_id = %record.id, "failed to record archived ledger status");
    }
}
