// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Documents the cloud-database selection point without implementing it.
//! `Config::storage_url` (`CLOUD_DATABASE_URL` / `--database-url`) exists
//! so a deployment can point the daemon at a remote store, but the relay
//! mediates local PTY traffic and a networked storage tier is out of
//! scope. Constructing this adapter always fails with
//! a diagnostic rather than silently falling back to SQLite, so a
//! misconfigured `--database-url` is never masked.

use async_trait::async_trait;

use super::{
    MessageFilter, MessageRecord, MessageStatus, SessionResumeState, StorageAdapter, StorageHealth,
};

pub struct RemoteStorageAdapter {
    url: String,
}

impl RemoteStorageAdapter {
    pub fn connect(url: &str) -> anyhow::Result<Self> {
        anyhow::bail!(
            "remote storage adapter for '{url}' is not implemented; omit --storage-url/--database-url to use the embedded sqlite store"
        )
    }
}

#[async_trait]
impl StorageAdapter for RemoteStorageAdapter {
    async fn append_message(&self, _record: &MessageRecord) -> anyhow::Result<()> {
        anyhow::bail!("remote storage adapter ({}) is not implemented", self.url)
    }

    async fn query_messages(&self, _filter: &MessageFilter) -> anyhow::Result<Vec<MessageRecord>> {
        anyhow::bail!("remote storage adapter ({}) is not implemented", self.url)
    }

    async fn mark_status(&self, _message_id: &str, _status: MessageStatus) -> anyhow::Result<()> {
        anyhow::bail!("remote storage adapter ({}) is not implemented", self.url)
    }

    async fn start_session(
        &self,
        _agent_name: &str,
        _session_id: &str,
        _resume_token: &str,
    ) -> anyhow::Result<()> {
        anyhow::bail!("remote storage adapter ({}) is not implemented", self.url)
    }

    async fn end_session(&self, _session_id: &str) -> anyhow::Result<()> {
        anyhow::bail!("remote storage adapter ({}) is not implemented", self.url)
    }

    async fn lookup_session_by_resume_token(
        &self,
        _agent_name: &str,
        _resume_token: &str,
    ) -> anyhow::Result<Option<SessionResumeState>> {
        anyhow::bail!("remote storage adapter ({}) is not implemented", self.url)
    }

    async fn max_seq(&self, _agent: &str, _topic: &str, _peer: &str) -> anyhow::Result<u64> {
        anyhow::bail!("remote storage adapter ({}) is not implemented", self.url)
    }

    async fn record_seq(&self, _agent: &str, _topic: &str, _peer: &str, _seq: u64) -> anyhow::Result<()> {
        anyhow::bail!("remote storage adapter ({}) is not implemented", self.url)
    }

    async fn remove_agent(&self, _name: &str) -> anyhow::Result<()> {
        anyhow::bail!("remote storage adapter ({}) is not implemented", self.url)
    }

    async fn remove_messages_for_agent(&self, _name: &str) -> anyhow::Result<()> {
        anyhow::bail!("remote storage adapter ({}) is not implemented", self.url)
    }

    async fn get_channel_members(&self, _channel: &str) -> anyhow::Result<Vec<String>> {
        anyhow::bail!("remote storage adapter ({}) is not implemented", self.url)
    }

    async fn set_channel_members(&self, _channel: &str, _members: &[String]) -> anyhow::Result<()> {
        anyhow::bail!("remote storage adapter ({}) is not implemented", self.url)
    }

    async fn health(&self) -> StorageHealth {
        StorageHealth { ok: false, driver: "remote" }
    }
}

#[cfg(test)]
#[path = "remote_tests.rs"]
mod tests;
