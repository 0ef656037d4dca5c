// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Durable agent registry: created or
//! updated when a Connection becomes ACTIVE, persisted atomically, and
//! removed only by explicit `REMOVE_AGENT` or operator action — never on
//! plain disconnect.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// One durable registry row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRegistryEntry {
    pub name: String,
    pub cli: Option<String>,
    pub program: Option<String>,
    pub model: Option<String>,
    pub task: Option<String>,
    pub cwd: Option<String>,
    pub team: Option<String>,
    pub last_seen_ms: i64,
    pub resume_token: String,
}

/// In-memory table backed by an `agents.json` snapshot (temp+rename),
/// using the same atomic temp-file-then-rename pattern as the other snapshots.
pub struct AgentRegistry {
    path: PathBuf,
    entries: Mutex<HashMap<String, AgentRegistryEntry>>,
}

impl AgentRegistry {
    /// Load an existing snapshot, if any, or start empty.
    pub fn load(path: PathBuf) -> Self {
        let entries = std::fs::read_to_string(&path)
            .ok()
            .and_then(|s| serde_json::from_str::<Vec<AgentRegistryEntry>>(&s).ok())
            .map(|list| list.into_iter().map(|e| (e.name.clone(), e)).collect())
            .unwrap_or_default();
        Self { path, entries: Mutex::new(entries) }
    }

    /// Insert or update an entry, then persist the whole table atomically.
    pub fn upsert(&self, entry: AgentRegistryEntry) {
        self.entries.lock().insert(entry.name.clone(), entry);
        self.persist();
    }

    pub fn touch(&self, name: &str, ts_ms: i64) {
        if let Some(entry) = self.entries.lock().get_mut(name) {
            entry.last_seen_ms = ts_ms;
            self.persist();
        }
    }

    pub fn remove(&self, name: &str) -> bool {
        let removed = self.entries.lock().remove(name).is_some();
        if removed {
            self.persist();
        }
        removed
    }

    pub fn get(&self, name: &str) -> Option<AgentRegistryEntry> {
        self.entries.lock().get(name).cloned()
    }

    pub fn list(&self) -> Vec<AgentRegistryEntry> {
        let mut v: Vec<_> = self.entries.lock().values().cloned().collect();
        v.sort_by(|a, b| a.name.cmp(&b.name));
        v
    }

    fn persist(&self) {
        let list = self.list();
        if let Err(e) = write_atomic_json(&self.path, &list) {
            tracing::warn!(err = %e, path = %self.path.display(), "failed to persist agent registry snapshot");
        }
    }
}

/// Write `value` to `path.tmp` then rename into place. Ignores
/// `ENOENT` on cleanup of the temp file, since a concurrent shutdown may
/// have already removed the parent directory.
pub fn write_atomic_json<T: Serialize>(path: &Path, value: &T) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("tmp");
    let bytes = serde_json::to_vec_pretty(value)?;
    std::fs::write(&tmp, &bytes)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(test)]
#[path = "registry_tests.rs"]
mod tests;
