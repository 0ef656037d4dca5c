// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! relayd: the daemon half of the agent relay plane. Owns the listening Unix socket, the Router, the storage
//! adapter, the file ledger and watchdog, and the supervising
//! orchestrator.

pub mod config;
pub mod connection;
pub mod daemon;
pub mod ledger;
pub mod registry;
pub mod router;
pub mod snapshot;
pub mod storage;
pub mod supervisor;

pub use config::Config;

/// Initialize tracing from `config.log_format`/`config.log_level`.
/// Uses `try_init` so it's safe to call more than once, e.g. from tests.
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

/// Run the daemon to completion.
pub async fn run(config: Config) -> anyhow::Result<()> {
    daemon::run(config).await
}
