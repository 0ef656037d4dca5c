// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Periodic state snapshots: `connected-agents.json`
//! and `processing-state.json`, written to `path.tmp` then renamed every
//! `snapshot_ms`, suppressed once the daemon starts shutting down so the
//! writer never races a concurrent directory cleanup.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::registry::write_atomic_json;
use crate::router::Router;

#[derive(Debug, Serialize)]
struct ConnectedAgentsSnapshot {
    agents: Vec<String>,
    users: Vec<String>,
    updated_at: i64,
}

#[derive(Debug, Serialize)]
struct ProcessingStateSnapshot {
    processing_agents: Vec<String>,
    updated_at: i64,
}

/// Owns the `shutting_down` flag: set it before tearing down the state
/// directory so periodic snapshot writes don't race with directory
/// cleanup, and runs the periodic write loop.
pub struct SnapshotWriter {
    state_dir: PathBuf,
    router: Arc<Router>,
    interval: Duration,
    shutting_down: Arc<AtomicBool>,
}

impl SnapshotWriter {
    pub fn new(state_dir: PathBuf, router: Arc<Router>, interval: Duration) -> Self {
        Self { state_dir, router, interval, shutting_down: Arc::new(AtomicBool::new(false)) }
    }

    pub fn shutting_down_flag(&self) -> Arc<AtomicBool> {
        self.shutting_down.clone()
    }

    fn write_once(&self) {
        if self.shutting_down.load(Ordering::Relaxed) {
            return;
        }
        let (agents, users) = self.router.connected_agents();
        let connected =
            ConnectedAgentsSnapshot { agents, users, updated_at: relay_proto::now_ms() };
        if let Err(e) =
            write_atomic_json(&self.state_dir.join("connected-agents.json"), &connected)
        {
            tracing::warn!(err = %e, "failed to write connected-agents.json");
        }

        let processing = ProcessingStateSnapshot {
            processing_agents: self.router.processing_agents(),
            updated_at: relay_proto::now_ms(),
        };
        if let Err(e) =
            write_atomic_json(&self.state_dir.join("processing-state.json"), &processing)
        {
            tracing::warn!(err = %e, "failed to write processing-state.json");
        }
    }

    /// Run the periodic snapshot loop until `shutdown` fires.
    pub async fn run(self, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => self.write_once(),
                _ = shutdown.cancelled() => {
                    self.shutting_down.store(true, Ordering::Relaxed);
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
#[path = "snapshot_tests.rs"]
mod tests;
