// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Switchboard: a control plane that federates remote HTTP device clients
//! into one polled world, evaluates reactive modules on a fixed tick, and
//! streams the evolving I/O table to websocket observers alongside a
//! remote-control protocol.

pub mod client;
pub mod command;
pub mod config;
pub mod device;
pub mod engine;
pub mod error;
pub mod module;
pub mod snapshot;
pub mod supervisor;
pub mod transport;

#[cfg(test)]
pub(crate) mod test_support;


use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::ConfigStore;
use crate::engine::Engine;
use crate::module::ModuleLibrary;
use crate::snapshot::IoHub;
use crate::supervisor::AppSupervisor;
use crate::transport::{build_router, free_tcp_port, ServerState};

/// I/O federation engine with a websocket control plane.
#[derive(Debug, Parser)]
#[command(name = "swb", version, about)]
pub struct Cli {
    /// JSON config file (created when missing).
    #[arg(short = 'c', long = "config", env = "SWB_CONFIG")]
    pub config: Option<PathBuf>,

    /// Port for the ws server; overrides the config. Defaults to the
    /// config's `ws_port`, or a free OS-allocated port.
    #[arg(short = 'p', long = "port", env = "SWB_PORT")]
    pub port: Option<u16>,
}

/// Run the engine until shutdown. `library` supplies the module
/// descriptors `addmodule` and the config's `modules` key may reference.
pub async fn run(cli: Cli, library: ModuleLibrary) -> anyhow::Result<()> {
    let config = Arc::new(ConfigStore::new());
    if let Some(ref path) = cli.config {
        config.load(path)?;
    }

    let shutdown = CancellationToken::new();
    let hub = Arc::new(IoHub::new());
    let engine = Arc::new(Engine::new(Arc::clone(&config), Arc::clone(&hub), library));
    let supervisor = Arc::new(AppSupervisor::new());

    // Resolve the ws port: CLI flag beats config; otherwise the OS picks.
    let port = match (cli.port, config.ws_port()) {
        (Some(port), _) if port != 0 => port,
        (None, Some(port)) => port,
        _ => free_tcp_port()?,
    };
    config.set_ws_port(port);

    // Clients come up before modules so every device the modules bind
    // against exists; both are fatal at startup.
    engine.init_clients().await?;
    engine.init_modules().await?;

    let state = Arc::new(ServerState {
        engine: Arc::clone(&engine),
        config: Arc::clone(&config),
        supervisor: Arc::clone(&supervisor),
        hub,
        shutdown: shutdown.clone(),
    });
    let router = build_router(state);
    let listener = TcpListener::bind(("127.0.0.1", port)).await?;
    info!("switchboard ws server listening on port {port}");

    tokio::spawn(Arc::clone(&engine).run(shutdown.clone()));

    // Ctrl-C flips the terminate flag observed between ticks and drains
    // the ws server.
    let signal_shutdown = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown requested");
            signal_shutdown.cancel();
        }
    });

    axum::serve(listener, router).with_graceful_shutdown(shutdown.clone().cancelled_owned()).await?;

    shutdown.cancel();
    supervisor.shutdown();
    Ok(())
}
