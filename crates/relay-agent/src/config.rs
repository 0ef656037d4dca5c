// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Configuration for one `relay-agent` process: which program to run on
//! the PTY, how to identify itself to the daemon, and where its control
//! socket lives.

use std::path::PathBuf;

use clap::Parser;

/// One agent's PTY orchestrator: owns a single child process and mediates
/// between its PTY and the relay daemon.
#[derive(Debug, Parser)]
#[command(name = "relay-agent", version, about)]
pub struct Config {
    /// Program (and arguments) to run on the PTY, e.g. `claude --resume`.
    #[arg(long = "program", required = true, num_args = 1..)]
    pub program: Vec<String>,

    /// Agent name this process registers under.
    #[arg(long, env = "AGENT_RELAY_NAME", alias = "relay-agent-name")]
    pub agent_name: Option<String>,

    /// CLI binary name reported in HELLO (defaults to the program's first
    /// argument, e.g. `claude`).
    #[arg(long)]
    pub cli: Option<String>,

    /// Unix domain socket of the relay daemon to connect to.
    #[arg(long, env = "AGENT_RELAY_SOCKET")]
    pub daemon_socket: Option<PathBuf>,

    /// Workspace id; namespaces the control socket path the same way the
    /// daemon namespaces its own state.
    #[arg(
        long,
        env = "WORKSPACE_ID",
        alias = "relay-workspace-id",
        alias = "agent-relay-workspace-id",
        value_name = "ID"
    )]
    pub workspace_id: Option<String>,

    /// Override the control socket path instead of deriving it.
    #[arg(long)]
    pub control_socket: Option<PathBuf>,

    /// Model identifier reported in HELLO, for registry display.
    #[arg(long)]
    pub model: Option<String>,

    /// Free-form task description reported in HELLO.
    #[arg(long)]
    pub task: Option<String>,

    /// Working directory for the spawned child; defaults to the current one.
    #[arg(long)]
    pub cwd: Option<String>,

    /// Team label reported in HELLO.
    #[arg(long)]
    pub team: Option<String>,

    /// CPU limit as a percentage of one core; when set, the child is
    /// confined to a cgroup on Linux.
    #[arg(long, env = "AGENT_CPU_LIMIT_PERCENT")]
    pub cpu_limit_percent: Option<f64>,

    /// Minimum silence period (ms) after first output before the child is
    /// considered "CLI-ready".
    #[arg(long, default_value_t = 1_500)]
    pub silence_ms: u64,

    /// Heartbeat PING interval expected from the daemon; used only to size
    /// reconnect backoff, not to emit PINGs ourselves.
    #[arg(long, default_value_t = 10_000)]
    pub heartbeat_ms: u64,

    /// Max frame size accepted on either socket.
    #[arg(long, default_value_t = relay_proto::DEFAULT_FRAME_CAP)]
    pub frame_cap: usize,

    /// Inject queue high-water mark: above this, backpressure is refused.
    #[arg(long, default_value_t = 50)]
    pub queue_high_water: usize,

    /// Inject queue low-water mark: at or below this, backpressure clears.
    #[arg(long, default_value_t = 10)]
    pub queue_low_water: usize,

    /// Log format (json or text).
    #[arg(long, env = "AGENT_RELAY_LOG_FORMAT", default_value = "json")]
    pub log_format: String,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, env = "AGENT_RELAY_LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

impl Config {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.program.is_empty() {
            anyhow::bail!("--program requires at least one argument");
        }
        if self.agent_name.as_deref().map(str::is_empty).unwrap_or(true) {
            anyhow::bail!("agent name required: pass --agent-name or set AGENT_RELAY_NAME/RELAY_AGENT_NAME");
        }
        if self.queue_low_water >= self.queue_high_water {
            anyhow::bail!("--queue-low-water must be less than --queue-high-water");
        }
        if relay_proto::RESERVED_AGENT_NAMES.contains(&self.agent_name.as_deref().unwrap_or_default()) {
            anyhow::bail!("agent name {:?} is reserved", self.agent_name);
        }
        Ok(())
    }

    pub fn agent_name(&self) -> &str {
        self.agent_name.as_deref().unwrap_or_default()
    }

    pub fn cli_name(&self) -> String {
        self.cli.clone().unwrap_or_else(|| self.program[0].clone())
    }

    pub fn daemon_socket_path(&self) -> PathBuf {
        self.daemon_socket.clone().unwrap_or_else(|| match &self.workspace_id {
            Some(id) => PathBuf::from("/tmp/relay").join(id).join("relay.sock"),
            None => PathBuf::from(".relay/relay.sock"),
        })
    }

    pub fn control_socket_path(&self) -> PathBuf {
        self.control_socket
            .clone()
            .unwrap_or_else(|| relay_proto::control_socket_path(self.workspace_id.as_deref(), self.agent_name()))
    }
}

/// `RELAY_AGENT_NAME`, checked when `--agent-name`/`AGENT_RELAY_NAME` is
/// unset.
pub fn resolve_agent_name(config: &mut Config) {
    if config.agent_name.is_none() {
        config.agent_name = std::env::var("RELAY_AGENT_NAME").ok();
    }
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
