// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use clap::Parser;
use tracing::error;

use swb::module::ModuleLibrary;
use swb::Cli;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    // The stock binary ships an empty module library; embedders register
    // their descriptors and call `swb::run` themselves.
    if let Err(e) = swb::run(cli, ModuleLibrary::new()).await {
        error!("fatal: {e:#}");
        std::process::exit(1);
    }
}
