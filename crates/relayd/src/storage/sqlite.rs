// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Embedded SQLite storage adapter.
//!
//! Grounded in `Humans-Not-Required-local-agent-chat::db::Db` — the only
//! repo in the retrieval pack that models exactly this shape: a
//! `rusqlite::Connection` behind a mutex, `PRAGMA journal_mode=WAL`, and
//! idempotent `ALTER TABLE ... ADD COLUMN` migrations guarded with `.ok()`.
//! The teacher itself carries no SQL dependency, so this is an enrichment
//! from the sibling example repo rather than an invented crate.
//!
//! This connection is also the single writer behind the file ledger
//! (`relayd::ledger`) — sharing one database keeps "the storage adapter
//! is the only component that mutates persistent state"
//! literally true, since the ledger's tables live in the same file.

use std::path::Path;
use std::sync::{Arc, Mutex};

use anyhow::Context;
use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use sha2::{Digest, Sha256};

use super::{
    MessageFilter, MessageRecord, MessageStatus, QueryOrder, SessionResumeState, StorageAdapter,
    StorageHealth,
};

/// One embedded migration: a name (used as the idempotency key) and the
/// canonical `CREATE TABLE`/`CREATE INDEX` text to run.
struct Migration {
    name: &'static str,
    sql: &'static str,
}

const MIGRATIONS: &[Migration] = &[
    Migration {
        name: "messages",
        sql: "CREATE TABLE IF NOT EXISTS messages (
            id TEXT PRIMARY KEY,
            from_agent TEXT NOT NULL,
            to_agent TEXT NOT NULL,
            body TEXT NOT NULL,
            thread TEXT,
            ts INTEGER NOT NULL,
            status TEXT NOT NULL,
            is_broadcast INTEGER NOT NULL DEFAULT 0,
            reply_count INTEGER NOT NULL DEFAULT 0,
            channel TEXT,
            seq INTEGER
        );
        CREATE INDEX IF NOT EXISTS idx_messages_to ON messages(to_agent, status);
        CREATE INDEX IF NOT EXISTS idx_messages_thread ON messages(thread);",
    },
    Migration {
        name: "sessions",
        sql: "CREATE TABLE IF NOT EXISTS sessions (
            agent_name TEXT NOT NULL,
            session_id TEXT NOT NULL,
            resume_token TEXT NOT NULL UNIQUE,
            started_at INTEGER NOT NULL,
            ended_at INTEGER,
            PRIMARY KEY (agent_name, session_id)
        );",
    },
    Migration {
        name: "sequences",
        sql: "CREATE TABLE IF NOT EXISTS sequences (
            agent TEXT NOT NULL,
            topic TEXT NOT NULL,
            peer TEXT NOT NULL,
            max_seq INTEGER NOT NULL DEFAULT 0,
            PRIMARY KEY (agent, topic, peer)
        );",
    },
    Migration {
        name: "channel_membership",
        sql: "CREATE TABLE IF NOT EXISTS channel_membership (
            channel TEXT NOT NULL,
            agent_name TEXT NOT NULL,
            PRIMARY KEY (channel, agent_name)
        );",
    },
    Migration {
        name: "relay_files",
        sql: "CREATE TABLE IF NOT EXISTS relay_files (
            id TEXT PRIMARY KEY,
            source_path TEXT NOT NULL,
            symlink_path TEXT,
            agent_name TEXT NOT NULL,
            message_type TEXT NOT NULL,
            status TEXT NOT NULL,
            retries INTEGER NOT NULL DEFAULT 0,
            max_retries INTEGER NOT NULL DEFAULT 5,
            discovered_at INTEGER NOT NULL,
            processed_at INTEGER,
            archived_at INTEGER,
            error TEXT,
            content_hash TEXT,
            file_size INTEGER NOT NULL DEFAULT 0,
            file_mtime_ns INTEGER NOT NULL DEFAULT 0,
            file_inode INTEGER NOT NULL DEFAULT 0
        );
        CREATE INDEX IF NOT EXISTS idx_relay_files_path_status ON relay_files(source_path, status);",
    },
    Migration {
        name: "orchestrator_state",
        sql: "CREATE TABLE IF NOT EXISTS orchestrator_state (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );",
    },
    Migration {
        name: "pending_operations",
        sql: "CREATE TABLE IF NOT EXISTS pending_operations (
            id TEXT PRIMARY KEY,
            kind TEXT NOT NULL,
            payload TEXT NOT NULL,
            created_at INTEGER NOT NULL
        );",
    },
];

fn checksum(sql: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(sql.as_bytes());
    format!("{:x}", hasher.finalize())
}

fn run_migrations(conn: &Connection) -> anyhow::Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            name TEXT PRIMARY KEY,
            checksum TEXT NOT NULL
        );",
    )
    .context("creating schema_migrations table")?;

    for migration in MIGRATIONS {
        let want = checksum(migration.sql);
        let existing: Option<String> = conn
            .query_row(
                "SELECT checksum FROM schema_migrations WHERE name = ?1",
                params![migration.name],
                |row| row.get(0),
            )
            .optional()
            .context("reading schema_migrations")?;

        match existing {
            Some(got) if got != want => {
                anyhow::bail!(
                    "schema migration '{}' checksum mismatch: on-disk={} expected={}",
                    migration.name,
                    got,
                    want
                );
            }
            Some(_) => continue,
            None => {
                conn.execute_batch(migration.sql)
                    .with_context(|| format!("applying migration '{}'", migration.name))?;
                conn.execute(
                    "INSERT INTO schema_migrations (name, checksum) VALUES (?1, ?2)",
                    params![migration.name, want],
                )
                .context("recording migration checksum")?;
            }
        }
    }
    Ok(())
}

/// The default storage back-end: a single embedded SQLite database.
pub struct SqliteStorageAdapter {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStorageAdapter {
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).context("creating data directory")?;
        }
        let conn = Connection::open(path).context("opening sqlite database")?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")
            .context("setting pragmas")?;
        run_migrations(&conn)?;
        Ok(Self { conn: Arc::new(Mutex::new(conn)) })
    }

    pub fn open_in_memory() -> anyhow::Result<Self> {
        let conn = Connection::open_in_memory().context("opening in-memory sqlite database")?;
        conn.execute_batch("PRAGMA foreign_keys=ON;").context("setting pragmas")?;
        run_migrations(&conn)?;
        Ok(Self { conn: Arc::new(Mutex::new(conn)) })
    }

    /// Exposes the shared connection so the file ledger (`relayd::ledger`)
    /// can use the same database as its single writer, sharing one
    /// embedded database.
    pub fn shared_connection(&self) -> Arc<Mutex<Connection>> {
        self.conn.clone()
    }

    async fn with_conn<T, F>(&self, f: F) -> anyhow::Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> anyhow::Result<T> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let guard = conn.lock().map_err(|_| anyhow::anyhow!("sqlite mutex poisoned"))?;
            f(&guard)
        })
        .await
        .context("sqlite blocking task panicked")?
    }
}

fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<MessageRecord> {
    let status_str: String = row.get("status")?;
    Ok(MessageRecord {
        id: row.get("id")?,
        from: row.get("from_agent")?,
        to: row.get("to_agent")?,
        body: row.get("body")?,
        thread: row.get("thread")?,
        ts: row.get("ts")?,
        status: MessageStatus::from_str(&status_str).unwrap_or(MessageStatus::Pending),
        is_broadcast: row.get::<_, i64>("is_broadcast")? != 0,
        reply_count: row.get::<_, i64>("reply_count")? as u32,
        channel: row.get("channel")?,
        seq: row.get::<_, Option<i64>>("seq")?.map(|n| n as u64),
    })
}

#[async_trait]
impl StorageAdapter for SqliteStorageAdapter {
    async fn append_message(&self, record: &MessageRecord) -> anyhow::Result<()> {
        let record = record.clone();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO messages (id, from_agent, to_agent, body, thread, ts, status, is_broadcast, reply_count, channel, seq)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
                 ON CONFLICT(id) DO NOTHING",
                params![
                    record.id,
                    record.from,
                    record.to,
                    record.body,
                    record.thread,
                    record.ts,
                    record.status.as_str(),
                    record.is_broadcast as i64,
                    record.reply_count,
                    record.channel,
                    record.seq.map(|n| n as i64),
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn query_messages(&self, filter: &MessageFilter) -> anyhow::Result<Vec<MessageRecord>> {
        let filter = filter.clone();
        self.with_conn(move |conn| {
            let mut sql = String::from("SELECT * FROM messages WHERE 1=1");
            let mut binds: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

            if let Some(from) = &filter.from {
                sql.push_str(" AND from_agent = ?");
                binds.push(Box::new(from.clone()));
            }
            if let Some(to) = &filter.to {
                sql.push_str(" AND to_agent = ?");
                binds.push(Box::new(to.clone()));
            }
            if let Some(thread) = &filter.thread {
                sql.push_str(" AND thread = ?");
                binds.push(Box::new(thread.clone()));
            }
            if let Some(since) = filter.since_ts {
                sql.push_str(" AND ts >= ?");
                binds.push(Box::new(since));
            }
            if let Some(status) = filter.status {
                sql.push_str(" AND status = ?");
                binds.push(Box::new(status.as_str().to_owned()));
            }
            if filter.unread_only {
                sql.push_str(" AND status IN ('pending', 'delivered')");
            }
            sql.push_str(match filter.order {
                QueryOrder::Ascending => " ORDER BY ts ASC",
                QueryOrder::Descending => " ORDER BY ts DESC",
            });
            if let Some(limit) = filter.limit {
                sql.push_str(&format!(" LIMIT {}", limit.min(10_000)));
            }

            let mut stmt = conn.prepare(&sql)?;
            let param_refs: Vec<&dyn rusqlite::ToSql> = binds.iter().map(|b| b.as_ref()).collect();
            let rows = stmt.query_map(param_refs.as_slice(), row_to_record)?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            Ok(out)
        })
        .await
    }

    async fn mark_status(&self, message_id: &str, status: MessageStatus) -> anyhow::Result<()> {
        let message_id = message_id.to_owned();
        self.with_conn(move |conn| {
            conn.execute(
                "UPDATE messages SET status = ?1 WHERE id = ?2",
                params![status.as_str(), message_id],
            )?;
            Ok(())
        })
        .await
    }

    async fn start_session(
        &self,
        agent_name: &str,
        session_id: &str,
        resume_token: &str,
    ) -> anyhow::Result<()> {
        let (agent_name, session_id, resume_token) =
            (agent_name.to_owned(), session_id.to_owned(), resume_token.to_owned());
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO sessions (agent_name, session_id, resume_token, started_at, ended_at)
                 VALUES (?1, ?2, ?3, ?4, NULL)
                 ON CONFLICT(agent_name, session_id) DO UPDATE SET resume_token = excluded.resume_token",
                params![agent_name, session_id, resume_token, relay_proto::now_ms()],
            )?;
            Ok(())
        })
        .await
    }

    async fn end_session(&self, session_id: &str) -> anyhow::Result<()> {
        let session_id = session_id.to_owned();
        self.with_conn(move |conn| {
            conn.execute(
                "UPDATE sessions SET ended_at = ?1 WHERE session_id = ?2",
                params![relay_proto::now_ms(), session_id],
            )?;
            Ok(())
        })
        .await
    }

    async fn lookup_session_by_resume_token(
        &self,
        agent_name: &str,
        resume_token: &str,
    ) -> anyhow::Result<Option<SessionResumeState>> {
        let (agent_name, resume_token) = (agent_name.to_owned(), resume_token.to_owned());
        self.with_conn(move |conn| {
            let session_id: Option<String> = conn
                .query_row(
                    "SELECT session_id FROM sessions WHERE agent_name = ?1 AND resume_token = ?2",
                    params![agent_name, resume_token],
                    |row| row.get(0),
                )
                .optional()?;
            let Some(session_id) = session_id else { return Ok(None) };

            let mut stmt = conn.prepare(
                "SELECT topic, peer, max_seq FROM sequences WHERE agent = ?1",
            )?;
            let seeds = stmt
                .query_map(params![agent_name], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?, row.get::<_, i64>(2)? as u64))
                })?
                .filter_map(|r| r.ok())
                .collect();

            Ok(Some(SessionResumeState { session_id, resume_token, seed_sequences: seeds }))
        })
        .await
    }

    async fn max_seq(&self, agent: &str, topic: &str, peer: &str) -> anyhow::Result<u64> {
        let (agent, topic, peer) = (agent.to_owned(), topic.to_owned(), peer.to_owned());
        self.with_conn(move |conn| {
            let n: Option<i64> = conn
                .query_row(
                    "SELECT max_seq FROM sequences WHERE agent = ?1 AND topic = ?2 AND peer = ?3",
                    params![agent, topic, peer],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(n.unwrap_or(0) as u64)
        })
        .await
    }

    async fn record_seq(&self, agent: &str, topic: &str, peer: &str, seq: u64) -> anyhow::Result<()> {
        let (agent, topic, peer) = (agent.to_owned(), topic.to_owned(), peer.to_owned());
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO sequences (agent, topic, peer, max_seq) VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(agent, topic, peer) DO UPDATE SET max_seq = MAX(max_seq, excluded.max_seq)",
                params![agent, topic, peer, seq as i64],
            )?;
            Ok(())
        })
        .await
    }

    async fn remove_agent(&self, name: &str) -> anyhow::Result<()> {
        let name = name.to_owned();
        self.with_conn(move |conn| {
            conn.execute("DELETE FROM sessions WHERE agent_name = ?1", params![name])?;
            conn.execute("DELETE FROM channel_membership WHERE agent_name = ?1", params![name])?;
            Ok(())
        })
        .await
    }

    async fn remove_messages_for_agent(&self, name: &str) -> anyhow::Result<()> {
        let name = name.to_owned();
        self.with_conn(move |conn| {
            conn.execute(
                "DELETE FROM messages WHERE from_agent = ?1 OR to_agent = ?1",
                params![name],
            )?;
            Ok(())
        })
        .await
    }

    async fn get_channel_members(&self, channel: &str) -> anyhow::Result<Vec<String>> {
        let channel = channel.to_owned();
        self.with_conn(move |conn| {
            let mut stmt =
                conn.prepare("SELECT agent_name FROM channel_membership WHERE channel = ?1")?;
            let rows = stmt.query_map(params![channel], |row| row.get(0))?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            Ok(out)
        })
        .await
    }

    async fn set_channel_members(&self, channel: &str, members: &[String]) -> anyhow::Result<()> {
        let channel = channel.to_owned();
        let members = members.to_vec();
        self.with_conn(move |conn| {
            conn.execute("DELETE FROM channel_membership WHERE channel = ?1", params![channel])?;
            for member in members {
                conn.execute(
                    "INSERT OR IGNORE INTO channel_membership (channel, agent_name) VALUES (?1, ?2)",
                    params![channel, member],
                )?;
            }
            Ok(())
        })
        .await
    }

    async fn health(&self) -> StorageHealth {
        let ok = self.with_conn(|conn| Ok(conn.execute_batch("SELECT 1").is_ok())).await.unwrap_or(false);
        StorageHealth { ok, driver: "sqlite" }
    }
}

#[cfg(test)]
#[path = "sqlite_tests.rs"]
mod tests;
