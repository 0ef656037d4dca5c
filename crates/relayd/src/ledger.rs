// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! File ledger & outbox watchdog: durable exactly-once
//! delivery for messages dropped as files into `outbox/<agent>/`.
//!
//! Shares the `SqliteStorageAdapter`'s connection rather than opening a
//! second database, keeping "the storage adapter is the only component
//! that mutates persistent state" literal — the ledger's
//! tables just happen to live in the same file, behind the same mutex.

use std::fs;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Context;
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use rand::Rng;
use rusqlite::{params, Connection, OptionalExtension};
use sha2::{Digest, Sha256};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// `pending|processing` are "active"; only one active record may exist
/// per canonical source path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileStatus {
    Pending,
    Processing,
    Delivered,
    Failed,
    Archived,
}

impl FileStatus {
    fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Delivered => "delivered",
            Self::Failed => "failed",
            Self::Archived => "archived",
        }
    }

    fn from_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "processing" => Some(Self::Processing),
            "delivered" => Some(Self::Delivered),
            "failed" => Some(Self::Failed),
            "archived" => Some(Self::Archived),
            _ => None,
        }
    }

    fn is_active(self) -> bool {
        matches!(self, Self::Pending | Self::Processing)
    }
}

#[derive(Debug, Clone)]
pub struct LedgerRecord {
    pub id: String,
    pub source_path: String,
    pub symlink_path: Option<String>,
    pub agent_name: String,
    pub message_type: String,
    pub status: FileStatus,
    pub retries: u32,
    pub max_retries: u32,
    pub discovered_at: i64,
    pub content_hash: Option<String>,
    pub file_size: u64,
}

/// Outbox message kinds: `msg` (default), `spawn`, `release`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Msg,
    Spawn,
    Release,
}

impl MessageKind {
    fn from_str(s: &str) -> Option<Self> {
        match s {
            "msg" => Some(Self::Msg),
            "spawn" => Some(Self::Spawn),
            "release" => Some(Self::Release),
            _ => None,
        }
    }
}

/// Parsed headers from an outbox file's `TO:`/`KIND:`/
/// `THREAD:`/`NAME:`/`CLI:`/`CWD:`/`MODEL:` header block.
#[derive(Debug, Clone, Default)]
pub struct OutboxHeaders {
    pub to: Option<String>,
    pub kind: MessageKindOrDefault,
    pub thread: Option<String>,
    pub name: Option<String>,
    pub cli: Option<String>,
    pub cwd: Option<String>,
    pub model: Option<String>,
}

#[derive(Debug, Clone, Copy)]
pub struct MessageKindOrDefault(pub MessageKind);

impl Default for MessageKindOrDefault {
    fn default() -> Self {
        Self(MessageKind::Msg)
    }
}

pub struct ParsedOutboxFile {
    pub headers: OutboxHeaders,
    pub body: String,
}

/// Split a file's headers from its body on the first blank line.
pub fn parse_outbox_file(raw: &str) -> anyhow::Result<ParsedOutboxFile> {
    let (header_block, body) = raw.split_once("\n\n").unwrap_or((raw, ""));
    let mut headers = OutboxHeaders::default();
    for line in header_block.lines() {
        let Some((key, value)) = line.split_once(':') else { continue };
        let value = value.trim().to_owned();
        match key.trim().to_ascii_uppercase().as_str() {
            "TO" => headers.to = Some(value),
            "KIND" => {
                headers.kind = MessageKindOrDefault(
                    MessageKind::from_str(&value.to_ascii_lowercase())
                        .ok_or_else(|| anyhow::anyhow!("unknown outbox KIND '{value}'"))?,
                )
            }
            "THREAD" => headers.thread = Some(value),
            "NAME" => headers.name = Some(value),
            "CLI" => headers.cli = Some(value),
            "CWD" => headers.cwd = Some(value),
            "MODEL" => headers.model = Some(value),
            _ => {}
        }
    }
    match headers.kind.0 {
        MessageKind::Msg if headers.to.is_none() => {
            anyhow::bail!("outbox message missing required TO header")
        }
        MessageKind::Spawn if headers.name.is_none() || headers.cli.is_none() => {
            anyhow::bail!("outbox spawn missing required NAME/CLI headers")
        }
        _ => {}
    }
    Ok(ParsedOutboxFile { headers, body: body.to_owned() })
}

fn new_file_id() -> String {
    let mut bytes = [0u8; 6];
    rand::rng().fill(&mut bytes);
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// Durable state machine over `relay_files`, sharing the connection the
/// embedded `SqliteStorageAdapter` owns.
pub struct FileLedger {
    conn: Arc<Mutex<Connection>>,
    max_retries: u32,
    pub max_file_size: u64,
}

impl FileLedger {
    pub fn new(conn: Arc<Mutex<Connection>>, max_retries: u32, max_file_size: u64) -> Self {
        Self { conn, max_retries, max_file_size }
    }

    async fn with_conn<T, F>(&self, f: F) -> anyhow::Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> anyhow::Result<T> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let guard = conn.lock().map_err(|_| anyhow::anyhow!("ledger mutex poisoned"))?;
            f(&guard)
        })
        .await
        .context("ledger blocking task panicked")?
    }

    /// Register a newly-discovered outbox file. Returns `None` when an
    /// active record already exists for this canonical path; rejects reserved agent names.
    pub async fn register(
        &self,
        source_path: &Path,
        agent_name: &str,
        message_type: &str,
    ) -> anyhow::Result<Option<String>> {
        if relay_proto::RESERVED_AGENT_NAMES.contains(&agent_name) {
            anyhow::bail!("'{agent_name}' is a reserved agent name, rejecting outbox registration");
        }
        let canonical = fs::canonicalize(source_path)
            .with_context(|| format!("canonicalizing {}", source_path.display()))?;
        let metadata = fs::metadata(&canonical)
            .with_context(|| format!("reading metadata for {}", canonical.display()))?;
        let content = fs::read(&canonical)
            .with_context(|| format!("reading outbox file {}", canonical.display()))?;
        if content.len() as u64 > self.max_file_size {
            anyhow::bail!(
                "outbox file {} exceeds max size ({} > {})",
                canonical.display(),
                content.len(),
                self.max_file_size
            );
        }
        let content_hash = format!("{:x}", Sha256::digest(&content));
        let path_str = canonical.to_string_lossy().into_owned();
        let agent_name = agent_name.to_owned();
        let message_type = message_type.to_owned();
        let file_size = content.len() as u64;
        let mtime_ns = metadata.mtime() as i64 * 1_000_000_000 + metadata.mtime_nsec();
        let inode = metadata.ino() as i64;
        let max_retries = self.max_retries;

        self.with_conn(move |conn| {
            let already_active: Option<String> = conn
                .query_row(
                    "SELECT id FROM relay_files WHERE source_path = ?1 AND status IN ('pending', 'processing')",
                    params![path_str],
                    |row| row.get(0),
                )
                .optional()?;
            if already_active.is_some() {
                return Ok(None);
            }

            let id = new_file_id();
            conn.execute(
                "INSERT INTO relay_files
                    (id, source_path, symlink_path, agent_name, message_type, status, retries,
                     max_retries, discovered_at, content_hash, file_size, file_mtime_ns, file_inode)
                 VALUES (?1, ?2, NULL, ?3, ?4, 'pending', 0, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    id,
                    path_str,
                    agent_name,
                    message_type,
                    max_retries,
                    relay_proto::now_ms(),
                    content_hash,
                    file_size as i64,
                    mtime_ns,
                    inode,
                ],
            )?;
            Ok(Some(id))
        })
        .await
    }

    /// Atomically claim a pending record: `UPDATE ... WHERE status =
    /// 'pending' AND retries < maxRetries RETURNING *`, so at most one
    /// worker wins.
    pub async fn claim(&self, file_id: &str) -> anyhow::Result<Option<LedgerRecord>> {
        let file_id = file_id.to_owned();
        self.with_conn(move |conn| {
            conn.query_row(
                "UPDATE relay_files
                 SET status = 'processing', retries = retries + 1
                 WHERE id = ?1 AND status = 'pending' AND retries < max_retries
                 RETURNING id, source_path, symlink_path, agent_name, message_type, status,
                           retries, max_retries, discovered_at, content_hash, file_size",
                params![file_id],
                |row| {
                    let status_str: String = row.get("status")?;
                    Ok(LedgerRecord {
                        id: row.get("id")?,
                        source_path: row.get("source_path")?,
                        symlink_path: row.get("symlink_path")?,
                        agent_name: row.get("agent_name")?,
                        message_type: row.get("message_type")?,
                        status: FileStatus::from_str(&status_str).unwrap_or(FileStatus::Pending),
                        retries: row.get::<_, i64>("retries")? as u32,
                        max_retries: row.get::<_, i64>("max_retries")? as u32,
                        discovered_at: row.get("discovered_at")?,
                        content_hash: row.get("content_hash")?,
                        file_size: row.get::<_, i64>("file_size")? as u64,
                    })
                },
            )
            .optional()
            .context("claiming ledger record")
        })
        .await
    }

    pub async fn mark_delivered(&self, file_id: &str) -> anyhow::Result<()> {
        let file_id = file_id.to_owned();
        self.with_conn(move |conn| {
            conn.execute(
                "UPDATE relay_files SET status = 'delivered', processed_at = ?1
                 WHERE id = ?2 AND status = 'processing'",
                params![relay_proto::now_ms(), file_id],
            )?;
            Ok(())
        })
        .await
    }

    /// On failure: revert to `pending` if retries remain, else `failed`.
    pub async fn mark_failed(&self, file_id: &str, error: &str) -> anyhow::Result<()> {
        let (file_id, error) = (file_id.to_owned(), error.to_owned());
        let max_retries = self.max_retries;
        self.with_conn(move |conn| {
            let retries: Option<i64> = conn
                .query_row(
                    "SELECT retries FROM relay_files WHERE id = ?1",
                    params![file_id],
                    |row| row.get(0),
                )
                .optional()?;
            let Some(retries) = retries else { return Ok(()) };
            let next_status = if (retries as u32) < max_retries { "pending" } else { "failed" };
            conn.execute(
                "UPDATE relay_files SET status = ?1, error = ?2 WHERE id = ?3",
                params![next_status, error, file_id],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn mark_archived(&self, file_id: &str, archived_path: &Path) -> anyhow::Result<()> {
        let (file_id, archived_path) = (file_id.to_owned(), archived_path.to_string_lossy().into_owned());
        self.with_conn(move |conn| {
            conn.execute(
                "UPDATE relay_files SET status = 'archived', archived_at = ?1, symlink_path = ?2
                 WHERE id = ?3 AND status = 'delivered'",
                params![relay_proto::now_ms(), archived_path, file_id],
            )?;
            Ok(())
        })
        .await
    }

    /// Crash recovery: reset `processing` rows to
    /// `pending`; rows whose source file vanished go to `failed`.
    pub async fn recover_on_start(&self) -> anyhow::Result<()> {
        self.with_conn(|conn| {
            conn.execute("UPDATE relay_files SET status = 'pending' WHERE status = 'processing'", [])?;

            let mut stmt =
                conn.prepare("SELECT id, source_path FROM relay_files WHERE status IN ('pending')")?;
            let rows: Vec<(String, String)> = stmt
                .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
                .filter_map(|r| r.ok())
                .collect();
            for (id, source_path) in rows {
                if !Path::new(&source_path).exists() {
                    conn.execute(
                        "UPDATE relay_files SET status = 'failed', error = 'source file missing on recovery' WHERE id = ?1",
                        params![id],
                    )?;
                }
            }
            Ok(())
        })
        .await
    }
}

/// One message translated from an outbox file, ready to be handed to the
/// Router/supervisor by the daemon's dispatch loop.
#[derive(Debug, Clone)]
pub enum LedgerEvent {
    Deliver { record: LedgerRecord, headers: OutboxHeaders, body: String },
    ClaimFailed { record_id: String, error: String },
}

/// Watches `outbox/<agent>/` directories for new files, combining a
/// filesystem notify-watcher with a periodic polling fallback.
pub struct Watchdog {
    outbox_root: PathBuf,
    ledger: Arc<FileLedger>,
    poll_interval: Duration,
}

impl Watchdog {
    pub fn new(outbox_root: PathBuf, ledger: Arc<FileLedger>, poll_interval: Duration) -> Self {
        Self { outbox_root, ledger, poll_interval }
    }

    fn scan_once(&self) -> Vec<(PathBuf, String)> {
        let mut found = Vec::new();
        let Ok(agent_dirs) = fs::read_dir(&self.outbox_root) else { return found };
        for agent_dir in agent_dirs.flatten() {
            let Ok(file_type) = agent_dir.file_type() else { continue };
            if !file_type.is_dir() {
                continue;
            }
            let agent_name = agent_dir.file_name().to_string_lossy().into_owned();
            let Ok(files) = fs::read_dir(agent_dir.path()) else { continue };
            for file in files.flatten() {
                if file.path().is_file() {
                    found.push((file.path(), agent_name.clone()));
                }
            }
        }
        found
    }

    /// Discover and claim every eligible file once. Returns translated
    /// events for the daemon's dispatch loop to apply to the Router.
    pub async fn poll_once(&self) -> Vec<LedgerEvent> {
        let mut events = Vec::new();
        for (path, agent_name) in self.scan_once() {
            let raw = match fs::read_to_string(&path) {
                Ok(raw) => raw,
                Err(e) => {
                    warn!(path = %path.display(), err = %e, "failed to read outbox file");
                    continue;
                }
            };
            let parsed = match parse_outbox_file(&raw) {
                Ok(parsed) => parsed,
                Err(e) => {
                    warn!(path = %path.display(), err = %e, "malformed outbox file, skipping");
                    continue;
                }
            };
            let message_type = match parsed.headers.kind.0 {
                MessageKind::Msg => "msg",
                MessageKind::Spawn => "spawn",
                MessageKind::Release => "release",
            };
            let file_id = match self.ledger.register(&path, &agent_name, message_type).await {
                Ok(Some(id)) => id,
                Ok(None) => continue,
                Err(e) => {
                    warn!(path = %path.display(), err = %e, "failed to register outbox file");
                    continue;
                }
            };
            match self.ledger.claim(&file_id).await {
                Ok(Some(record)) => events.push(LedgerEvent::Deliver { record, headers: parsed.headers, body: parsed.body }),
                Ok(None) => debug!(file_id, "lost claim race, another worker owns this file"),
                Err(e) => events.push(LedgerEvent::ClaimFailed { record_id: file_id, error: e.to_string() }),
            }
        }
        events
    }

    /// Run the watchdog loop until `shutdown` fires: a `notify` watcher
    /// wakes an immediate poll, with `poll_interval` as a bounded polling
    /// fallback in case events are coalesced or dropped.
    pub async fn run(self: Arc<Self>, events_tx: mpsc::Sender<LedgerEvent>, shutdown: CancellationToken) {
        let (wake_tx, mut wake_rx) = mpsc::channel(16);
        let _watcher = self.setup_notify_watcher(wake_tx);

        let mut ticker = tokio::time::interval(self.poll_interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = wake_rx.recv() => {}
                _ = shutdown.cancelled() => break,
            }
            for event in self.poll_once().await {
                if events_tx.send(event).await.is_err() {
                    return;
                }
            }
        }
    }

    fn setup_notify_watcher(&self, wake_tx: mpsc::Sender<()>) -> Option<RecommendedWatcher> {
        if !self.outbox_root.exists() {
            return None;
        }
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            if res.is_ok() {
                let _ = wake_tx.try_send(());
            }
        })
        .ok()?;
        if let Err(e) = watcher.watch(&self.outbox_root, RecursiveMode::Recursive) {
            warn!(err = %e, "failed to start outbox filesystem watcher, relying on polling");
            return None;
        }
        Some(watcher)
    }
}

#[cfg(test)]
#[path = "ledger_tests.rs"]
mod tests;
