// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! relay-agent: the per-agent PTY orchestrator. Owns
//! one child process on a pseudo-terminal, parses its output for outbound
//! commands, injects incoming messages as keystrokes, and exposes the
//! per-agent control socket.

pub mod cgroup;
pub mod config;
pub mod control;
pub mod health;
pub mod injection;
pub mod orchestrator;
pub mod parser;
pub mod pty;
pub mod relay_client;

pub use config::Config;

/// Initialize tracing from `config.log_format`/`config.log_level`, same
/// discipline as `relayd::init_tracing`.
pub fn init_tracing(config: &Config) {
    use tracing_subscriber::fmt;
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let result = match config.log_format.as_str() {
        "json" => fmt::fmt().with_env_filter(filter).json().try_init(),
        _ => fmt::fmt().with_env_filter(filter).try_init(),
    };
    drop(result);
}

/// Run one orchestrator to completion.
pub async fn run(config: Config, shutdown: tokio_util::sync::CancellationToken) -> anyhow::Result<()> {
    orchestrator::run(config, shutdown).await
}
