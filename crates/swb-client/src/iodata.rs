// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The iodata-only subscriber tier.

use std::sync::Arc;

use futures_util::StreamExt;
use parking_lot::Mutex;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};

use swb_proto::{FieldUpdate, ServerMessage, StateTable};

use crate::table::TableMirror;
use crate::RECONNECT_DELAY;

/// Callbacks driven by the iodata stream. All default to no-ops so a
/// handler implements only what it cares about.
pub trait IoDataHandler: Send {
    fn connected(&mut self) {}

    fn disconnected(&mut self) {}

    /// The table structure changed; `table` is the full new state.
    fn reset_io_data(&mut self, table: &StateTable) {
        let _ = table;
    }

    /// Incremental update; `table` already has `updates` applied.
    fn update_io_data(&mut self, table: &StateTable, updates: &[FieldUpdate]) {
        let _ = (table, updates);
    }
}

/// Subscriber that maintains a [`TableMirror`] from `/ws_iodata`.
pub struct IoDataClient {
    host: String,
    port: u16,
    autokill: bool,
    mirror: Arc<Mutex<TableMirror>>,
}

impl IoDataClient {
    pub fn new(host: &str, port: u16) -> Self {
        Self {
            host: host.to_owned(),
            port,
            autokill: false,
            mirror: Arc::new(Mutex::new(TableMirror::new())),
        }
    }

    /// When set, a disconnect ends `run` with an error instead of
    /// reconnecting, so the hosting process can terminate.
    pub fn autokill(mut self, autokill: bool) -> Self {
        self.autokill = autokill;
        self
    }

    /// Shared handle on the mirrored table.
    pub fn mirror(&self) -> Arc<Mutex<TableMirror>> {
        Arc::clone(&self.mirror)
    }

    /// Connect and mirror until the stream ends. Reconnects with a 1 s
    /// backoff unless `autokill` is set.
    pub async fn run(&self, handler: &mut dyn IoDataHandler) -> anyhow::Result<()> {
        let url = format!("ws://{}:{}/ws_iodata", self.host, self.port);

        loop {
            match connect_async(&url).await {
                Ok((stream, _)) => {
                    handler.connected();
                    drive_stream(stream, &self.mirror, handler).await;
                    handler.disconnected();
                }
                Err(e) => {
                    debug!(url = %url, err = %e, "iodata connect failed");
                }
            }

            if self.autokill {
                anyhow::bail!("iodata connection to {url} closed");
            }

            self.mirror.lock().clear();
            tokio::time::sleep(RECONNECT_DELAY).await;
        }
    }
}

/// Pump one connected stream into the mirror and handler.
async fn drive_stream<S>(
    mut stream: S,
    mirror: &Arc<Mutex<TableMirror>>,
    handler: &mut dyn IoDataHandler,
) where
    S: futures_util::Stream<
            Item = Result<Message, tokio_tungstenite::tungstenite::Error>,
        > + Unpin,
{
    while let Some(msg) = stream.next().await {
        let text = match msg {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => continue,
        };
        let Ok(frame) = serde_json::from_str::<ServerMessage>(text.as_str()) else {
            warn!("unparseable iodata frame ignored");
            continue;
        };
        dispatch_io_frame(frame, mirror, handler);
    }
}

/// Apply one iodata frame; shared with the ctrl tier.
pub(crate) fn dispatch_io_frame<H: IoDataHandler + ?Sized>(
    frame: ServerMessage,
    mirror: &Arc<Mutex<TableMirror>>,
    handler: &mut H,
) -> Option<ServerMessage> {
    match frame {
        ServerMessage::UpdateTable { table } => {
            let mut mirror = mirror.lock();
            mirror.reset(table);
            handler.reset_io_data(mirror.table());
            None
        }
        ServerMessage::UpdateFields { fields } => {
            let mut mirror = mirror.lock();
            mirror.apply(&fields);
            handler.update_io_data(mirror.table(), &fields);
            None
        }
        other => Some(other),
    }
}
