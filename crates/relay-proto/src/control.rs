// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The per-agent PTY control socket protocol: request and
//! response schemas for `inject`/`status`/`shutdown`, plus the unsolicited
//! `backpressure` notification. Shared between `relay-agent` (the server)
//! and `relayd` (a client, for health polling) so the two binaries can
//! never drift on the wire shape.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// A request sent to a per-agent control socket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlRequest {
    Inject {
        id: String,
        from: String,
        body: String,
        #[serde(default)]
        priority: Priority,
    },
    Status {},
    Shutdown {},
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
}

/// Lifecycle of one queued injection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InjectStatus {
    Queued,
    Injecting,
    Delivered,
    Failed,
}

/// A response from, or unsolicited event pushed by, a per-agent control
/// socket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlResponse {
    InjectResult {
        id: String,
        status: InjectStatus,
        timestamp: i64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    Status {
        agent_idle: bool,
        queue_length: u32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cursor_position: Option<u32>,
        last_output_ms: i64,
        /// Enrichment beyond the minimal response shape, consumed by
        /// `relayd`'s supervisor in place of a real `MemoryMonitor`
        /// collaborator.
        rss_bytes: u64,
        cpu_percent: f64,
    },
    ShutdownAck {},
    /// Unsolicited: pushed whenever the inject queue crosses a watermark.
    Backpressure {
        queue_length: u32,
        accept: bool,
    },
}

/// Maximum length of a `sockaddr_un` path on Linux, including the NUL
/// terminator's implicit byte.
const SUN_PATH_MAX: usize = 107;

/// Deterministic per-agent control socket path:
/// workspace-namespaced when a workspace id is configured, otherwise
/// project-local, hashed down to fit `sockaddr_un` when it would
/// otherwise exceed 107 bytes.
pub fn control_socket_path(workspace_id: Option<&str>, agent_name: &str) -> PathBuf {
    let path = match workspace_id {
        Some(id) => PathBuf::from("/tmp/relay").join(id).join("agents").join(format!("{agent_name}.sock")),
        None => PathBuf::from(".relay").join("agents").join(format!("{agent_name}.sock")),
    };
    shorten_if_needed(path)
}

fn shorten_if_needed(path: PathBuf) -> PathBuf {
    let s = path.to_string_lossy();
    if s.len() <= SUN_PATH_MAX {
        return path;
    }
    let mut hasher = Sha256::new();
    hasher.update(s.as_bytes());
    let digest = hasher.finalize();
    let hex: String = digest.iter().take(8).map(|b| format!("{b:02x}")).collect();
    std::env::temp_dir().join(format!("relay-agent-{hex}.sock"))
}

#[cfg(test)]
#[path = "control_tests.rs"]
mod tests;
