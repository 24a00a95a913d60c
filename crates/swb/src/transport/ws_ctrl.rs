// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! `/ws_ctrl` — full-control subscribers.
//!
//! A ctrl connection receives everything the iodata stream carries, plus
//! `update_config` on connect and after every config mutation, and may send
//! command frames decoded by a per-connection [`Decoder`]. Command effects
//! on engine state take the engine lock, so concurrent connections are
//! serialised there; within one connection commands are strictly
//! sequential.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use futures_util::{SinkExt, StreamExt};
use tracing::debug;

use swb_proto::ServerMessage;

use crate::command::Decoder;
use crate::transport::{send_frame, ServerState};

/// `GET /ws_ctrl` — WebSocket upgrade for control subscribers.
pub async fn ws_handler(
    State(state): State<Arc<ServerState>>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_ws(socket, state))
}

async fn handle_ws(socket: WebSocket, state: Arc<ServerState>) {
    let mut io_rx = state.hub.subscribe();
    let mut cfg_rx = state.config.subscribe();
    let cx = state.command_cx();
    let mut decoder = Decoder::new();
    let (mut ws_tx, mut ws_rx) = socket.split();

    // Connect backfill: current table, then current config.
    let table = state.hub.current_table();
    if send_frame(&mut ws_tx, &ServerMessage::UpdateTable { table }).await.is_err() {
        return;
    }
    let config = state.config.snapshot_json();
    if send_frame(&mut ws_tx, &ServerMessage::UpdateConfig { config }).await.is_err() {
        return;
    }

    loop {
        tokio::select! {
            _ = state.shutdown.cancelled() => break,

            event = io_rx.recv() => {
                match event {
                    Ok(msg) => {
                        if send_frame(&mut ws_tx, &msg).await.is_err() {
                            break;
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!(skipped, "ctrl subscriber lagged on iodata, dropping");
                        break;
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }

            event = cfg_rx.recv() => {
                // Config frames are full snapshots, so a lagged receiver just
                // resends the latest state instead of disconnecting.
                let config = match event {
                    Ok(config) => config,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {
                        state.config.snapshot_json()
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                };
                if send_frame(&mut ws_tx, &ServerMessage::UpdateConfig { config }).await.is_err() {
                    break;
                }
            }

            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        for response in decoder.decode(&cx, text.as_str()).await {
                            if send_frame(&mut ws_tx, &response).await.is_err() {
                                return;
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(_)) => break,
                    _ => {}
                }
            }
        }
    }

    let _ = ws_tx.close().await;
}
