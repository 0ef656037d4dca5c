// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The replaceable storage back-end: message history,
//! sessions, per-stream sequence high-water marks, and channel
//! membership. `SqliteStorageAdapter` is the default, always-available
//! implementation; `RemoteStorageAdapter` documents the cloud-database
//! selection point without implementing it.

pub mod remote;
pub mod sqlite;

pub use remote::RemoteStorageAdapter;
pub use sqlite::SqliteStorageAdapter;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageStatus {
    Pending,
    Delivered,
    Acked,
    Read,
    Failed,
}

impl MessageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Delivered => "delivered",
            Self::Acked => "acked",
            Self::Read => "read",
            Self::Failed => "failed",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "delivered" => Some(Self::Delivered),
            "acked" => Some(Self::Acked),
            "read" => Some(Self::Read),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// Storage-layer rendering of a persisted message record.
#[derive(Debug, Clone)]
pub struct MessageRecord {
    pub id: String,
    pub from: String,
    pub to: String,
    pub body: String,
    pub thread: Option<String>,
    pub ts: i64,
    pub status: MessageStatus,
    pub is_broadcast: bool,
    pub reply_count: u32,
    pub channel: Option<String>,
    /// The per-stream sequence this message was delivered with, when it
    /// was addressed to exactly one recipient. `None` for broadcast,
    /// channel, and topic-fanout sends (each recipient gets its own seq)
    /// and for messages that were never delivered (recipient offline).
    /// `replay_pending` reuses this value instead of minting a fresh one
    /// so a resumed session sees the same seq it would have on first
    /// delivery.
    pub seq: Option<u64>,
}

/// Sort order for `query_messages`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QueryOrder {
    #[default]
    Ascending,
    Descending,
}

/// Filters accepted by `MESSAGES_QUERY` / `INBOX`.
#[derive(Debug, Clone, Default)]
pub struct MessageFilter {
    pub from: Option<String>,
    pub to: Option<String>,
    pub thread: Option<String>,
    pub since_ts: Option<i64>,
    pub limit: Option<u32>,
    pub order: QueryOrder,
    pub unread_only: bool,
    pub status: Option<MessageStatus>,
}

/// Per-session resume state returned when a HELLO carries a valid token.
#[derive(Debug, Clone)]
pub struct SessionResumeState {
    pub session_id: String,
    pub resume_token: String,
    pub seed_sequences: Vec<(String, String, u64)>,
}

/// A liveness/driver summary for the HEALTH query.
#[derive(Debug, Clone)]
pub struct StorageHealth {
    pub ok: bool,
    pub driver: &'static str,
}

/// The replaceable back-end contract. Every mutation to
/// durable state in the daemon goes through an implementation of this
/// trait: it is the only component that may mutate persistent state.
#[async_trait]
pub trait StorageAdapter: Send + Sync {
    async fn append_message(&self, record: &MessageRecord) -> anyhow::Result<()>;
    async fn query_messages(&self, filter: &MessageFilter) -> anyhow::Result<Vec<MessageRecord>>;
    async fn mark_status(&self, message_id: &str, status: MessageStatus) -> anyhow::Result<()>;

    async fn start_session(
        &self,
        agent_name: &str,
        session_id: &str,
        resume_token: &str,
    ) -> anyhow::Result<()>;
    async fn end_session(&self, session_id: &str) -> anyhow::Result<()>;
    async fn lookup_session_by_resume_token(
        &self,
        agent_name: &str,
        resume_token: &str,
    ) -> anyhow::Result<Option<SessionResumeState>>;

    async fn max_seq(&self, agent: &str, topic: &str, peer: &str) -> anyhow::Result<u64>;
    /// Persist the high-water mark for the `(agent, topic, peer)` stream so
    /// a resumed session after a daemon restart seeds from durable state
    /// rather than starting back at zero. A no-op if `seq` is not greater
    /// than what is already on disk.
    async fn record_seq(&self, agent: &str, topic: &str, peer: &str, seq: u64) -> anyhow::Result<()>;

    async fn remove_agent(&self, name: &str) -> anyhow::Result<()>;
    async fn remove_messages_for_agent(&self, name: &str) -> anyhow::Result<()>;

    async fn get_channel_members(&self, channel: &str) -> anyhow::Result<Vec<String>>;
    async fn set_channel_members(&self, channel: &str, members: &[String]) -> anyhow::Result<()>;

    async fn health(&self) -> StorageHealth;
}

#[cfg(test)]
#[path = "mod_tests.rs"]
mod tests;
