// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use clap::Parser;
use tracing::error;

use relayd::Config;

#[tokio::main]
async fn main() {
    let config = Config::parse();

    if let Err(e) = config.validate() {
        eprintln!("invalid configuration: {e:#}");
        std::process::exit(1);
    }

    relayd::init_tracing(&config);

    if let Err(e) = relayd::run(config).await {
        error!("fatal: {e:#}");
        std::process::exit(1);
    }
}
