// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! HTTP + WebSocket transport: one axum router carrying the two fan-out
//! streams (`/ws_iodata`, `/ws_ctrl`) on a single port.

pub mod ws_ctrl;
pub mod ws_iodata;

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use axum::routing::get;
use axum::Router;
use futures_util::stream::SplitSink;
use futures_util::SinkExt;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;

use swb_proto::ServerMessage;

use crate::command::CommandCx;
use crate::config::ConfigStore;
use crate::engine::Engine;
use crate::snapshot::IoHub;
use crate::supervisor::AppSupervisor;

/// Shared state behind the ws routes.
pub struct ServerState {
    pub engine: Arc<Engine>,
    pub config: Arc<ConfigStore>,
    pub supervisor: Arc<AppSupervisor>,
    pub hub: Arc<IoHub>,
    pub shutdown: CancellationToken,
}

impl ServerState {
    pub fn command_cx(&self) -> CommandCx {
        CommandCx {
            engine: Arc::clone(&self.engine),
            config: Arc::clone(&self.config),
            supervisor: Arc::clone(&self.supervisor),
        }
    }
}

/// Build the axum `Router` with both ws routes.
pub fn build_router(state: Arc<ServerState>) -> Router {
    Router::new()
        .route("/ws_iodata", get(ws_iodata::ws_handler))
        .route("/ws_ctrl", get(ws_ctrl::ws_handler))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Serialize and send one frame; `Err` means the subscriber is gone.
pub(crate) async fn send_frame(
    tx: &mut SplitSink<WebSocket, Message>,
    msg: &ServerMessage,
) -> Result<(), ()> {
    let Ok(text) = serde_json::to_string(msg) else {
        return Err(());
    };
    tx.send(Message::Text(text.into())).await.map_err(|_| ())
}

/// Let the OS pick a free TCP port.
pub fn free_tcp_port() -> anyhow::Result<u16> {
    let listener = std::net::TcpListener::bind(("127.0.0.1", 0))?;
    Ok(listener.local_addr()?.port())
}

#[cfg(test)]
#[path = "transport_tests.rs"]
mod tests;
