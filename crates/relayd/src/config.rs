// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::path::PathBuf;

use clap::Parser;

/// The daemon that owns the listening socket, the Router, and the
/// supervising orchestrator.
#[derive(Debug, Parser)]
#[command(name = "relayd", version, about)]
pub struct Config {
    /// Unix domain socket path for agent/user connections.
    #[arg(long, env = "AGENT_RELAY_SOCKET")]
    pub socket: Option<PathBuf>,

    /// Workspace id; when set, namespaces the socket, inbox, and state
    /// directories under `/tmp/relay/{workspace_id}/...`.
    #[arg(
        long,
        env = "WORKSPACE_ID",
        alias = "relay-workspace-id",
        value_name = "ID"
    )]
    pub workspace_id: Option<String>,

    /// Root data directory for state snapshots, pid file, and the embedded
    /// ledger database.
    #[arg(long, env = "AGENT_RELAY_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    /// Storage connection string for a remote SQL backend. When unset, the
    /// embedded SQLite adapter is used.
    #[arg(
        long,
        env = "CLOUD_DATABASE_URL",
        alias = "database-url",
        alias = "agent-relay-storage-url"
    )]
    pub storage_url: Option<String>,

    /// Maximum frame size in bytes accepted on any envelope stream.
    #[arg(long, env = "AGENT_RELAY_FRAME_CAP", default_value_t = relay_proto::DEFAULT_FRAME_CAP)]
    pub frame_cap: usize,

    /// Heartbeat PING interval in milliseconds.
    #[arg(long, env = "AGENT_RELAY_HEARTBEAT_MS", default_value_t = 10_000)]
    pub heartbeat_ms: u64,

    /// Number of consecutive missed heartbeats before a connection is closed.
    #[arg(long, env = "AGENT_RELAY_HEARTBEAT_MISSES", default_value_t = 3)]
    pub heartbeat_misses: u32,

    /// State-snapshot write interval in milliseconds.
    #[arg(long, env = "AGENT_RELAY_SNAPSHOT_MS", default_value_t = 500)]
    pub snapshot_ms: u64,

    /// Per-correlation blocking-SEND default timeout in milliseconds, used
    /// when the caller does not specify `payload_meta.sync.timeoutMs`.
    #[arg(long, env = "AGENT_RELAY_SYNC_TIMEOUT_MS", default_value_t = 30_000)]
    pub default_sync_timeout_ms: u64,

    /// Health-check cadence for the supervising orchestrator, seconds.
    #[arg(long, env = "AGENT_RELAY_HEALTH_INTERVAL_SECS", default_value_t = 10)]
    pub health_interval_secs: u64,

    /// CPU alert threshold as a percentage of one core.
    #[arg(long, env = "AGENT_CPU_ALERT_THRESHOLD", default_value_t = 300.0)]
    pub cpu_alert_threshold: f64,

    /// Resource-alert cooldown window, seconds.
    #[arg(long, env = "AGENT_RELAY_ALERT_COOLDOWN_SECS", default_value_t = 60)]
    pub alert_cooldown_secs: u64,

    /// Log format (json or text).
    #[arg(long, env = "AGENT_RELAY_LOG_FORMAT", default_value = "json")]
    pub log_format: String,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, env = "AGENT_RELAY_LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

impl Config {
    /// Validate the configuration after parsing: hard-error,
    /// validate-before-doing-anything.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.frame_cap == 0 {
            anyhow::bail!("--frame-cap must be greater than zero");
        }
        if self.heartbeat_misses == 0 {
            anyhow::bail!("--heartbeat-misses must be greater than zero");
        }
        Ok(())
    }

    /// Root directory for this daemon's state: `--data-dir`, or
    /// `/tmp/relay/{workspace_id}` when a workspace id is configured, or
    /// a project-local `.relay` directory otherwise.
    pub fn root_dir(&self) -> PathBuf {
        if let Some(dir) = &self.data_dir {
            return dir.clone();
        }
        match &self.workspace_id {
            Some(id) => PathBuf::from("/tmp/relay").join(id),
            None => PathBuf::from(".relay"),
        }
    }

    pub fn socket_path(&self) -> PathBuf {
        self.socket.clone().unwrap_or_else(|| self.root_dir().join("relay.sock"))
    }

    pub fn pid_file_path(&self) -> PathBuf {
        self.root_dir().join("relay.pid")
    }

    pub fn state_dir(&self) -> PathBuf {
        self.root_dir().join("state")
    }

    pub fn inbox_dir(&self) -> PathBuf {
        self.root_dir().join("inbox")
    }

    /// Where delivered outbox files are moved once archived, mirroring the
    /// per-agent subdirectory layout of `inbox_dir`.
    pub fn archive_dir(&self) -> PathBuf {
        self.root_dir().join("archive")
    }

    pub fn ledger_db_path(&self) -> PathBuf {
        self.root_dir().join("ledger.sqlite3")
    }
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
