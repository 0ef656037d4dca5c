// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use relay_agent::config::resolve_agent_name;
use relay_agent::Config;

#[tokio::main]
async fn main() {
    let mut config = Config::parse();
    resolve_agent_name(&mut config);

    if let Err(e) = config.validate() {
        eprintln!("invalid configuration: {e:#}");
        std::process::exit(1);
    }

    relay_agent::init_tracing(&config);

    let shutdown = CancellationToken::new();
    tokio::spawn(wait_for_signal(shutdown.clone()));

    if let Err(e) = relay_agent::run(config, shutdown).await {
        error!("fatal: {e:#}");
        std::process::exit(1);
    }
}

async fn wait_for_signal(shutdown: CancellationToken) {
    let mut sigterm = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
        Ok(sig) => sig,
        Err(e) => {
            warn!(err = %e, "failed to install SIGTERM handler");
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
        _ = shutdown.cancelled() => return,
    }
    info!("shutdown requested");
    shutdown.cancel();
}
