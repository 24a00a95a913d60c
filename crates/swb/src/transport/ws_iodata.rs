// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! `/ws_iodata` — read-only subscribers to the I/O state stream.
//!
//! On connect a subscriber receives the current table as `update_table`,
//! then every reset/diff the snapshot builder emits. Delivery is
//! best-effort: a subscriber that lags behind the broadcast buffer is
//! disconnected and starts over from a fresh reset when it reconnects.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use futures_util::{SinkExt, StreamExt};
use tracing::debug;

use swb_proto::ServerMessage;

use crate::transport::{send_frame, ServerState};

/// `GET /ws_iodata` — WebSocket upgrade for iodata subscribers.
pub async fn ws_handler(
    State(state): State<Arc<ServerState>>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_ws(socket, state))
}

async fn handle_ws(socket: WebSocket, state: Arc<ServerState>) {
    let mut io_rx = state.hub.subscribe();
    let (mut ws_tx, mut ws_rx) = socket.split();

    // Backfill: the freshly connected subscriber starts from the full table.
    let table = state.hub.current_table();
    if send_frame(&mut ws_tx, &ServerMessage::UpdateTable { table }).await.is_err() {
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
                        debug!(skipped, "iodata subscriber lagged, dropping");
                        break;
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }

            // Subscribers send nothing actionable; watch only for close.
            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(_)) => break,
                    _ => {}
                }
            }
        }
    }

    let _ = ws_tx.close().await;
}
