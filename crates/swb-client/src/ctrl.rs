// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The ctrl subscriber tier: everything the iodata tier mirrors, plus the
//! engine config and a command channel.
//!
//! Commands go out as `{command, args}` frames; their `response` frames are
//! streamed back through the receiver [`CtrlHandle::send`] returns, ending
//! with the frame whose `command_finished` is set. A response with
//! `get_input` asks for [`CtrlHandle::user_input`].

use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};

use swb_proto::{CommandResponse, ServerMessage};

use crate::iodata::{dispatch_io_frame, IoDataHandler};
use crate::table::TableMirror;
use crate::RECONNECT_DELAY;

/// Callbacks driven by the ctrl stream.
pub trait CtrlHandler: IoDataHandler {
    /// The engine config changed; `config` is the full snapshot.
    fn update_current_config(&mut self, config: &Value) {
        let _ = config;
    }
}

enum Outbound {
    Command {
        command: String,
        args: Vec<Value>,
        responses: mpsc::UnboundedSender<CommandResponse>,
    },
    UserInput {
        text: String,
    },
}

/// Cloneable command channel into a running [`CtrlClient`].
#[derive(Clone)]
pub struct CtrlHandle {
    tx: mpsc::UnboundedSender<Outbound>,
}

impl CtrlHandle {
    /// Issue a command; the receiver yields its response frames until the
    /// finishing one, then closes.
    pub fn send(&self, command: &str, args: Vec<Value>) -> mpsc::UnboundedReceiver<CommandResponse> {
        let (responses, rx) = mpsc::unbounded_channel();
        let _ = self.tx.send(Outbound::Command {
            command: command.to_owned(),
            args,
            responses,
        });
        rx
    }

    /// Answer a `get_input` response of the command in flight.
    pub fn user_input(&self, text: &str) {
        let _ = self.tx.send(Outbound::UserInput { text: text.to_owned() });
    }
}

/// Subscriber with full control: table mirror, config mirror, commands.
pub struct CtrlClient {
    host: String,
    port: u16,
    autokill: bool,
    mirror: Arc<Mutex<TableMirror>>,
    config: Arc<Mutex<Value>>,
    handle: CtrlHandle,
    outbound_rx: mpsc::UnboundedReceiver<Outbound>,
}

impl CtrlClient {
    pub fn new(host: &str, port: u16) -> Self {
        let (tx, outbound_rx) = mpsc::unbounded_channel();
        Self {
            host: host.to_owned(),
            port,
            autokill: false,
            mirror: Arc::new(Mutex::new(TableMirror::new())),
            config: Arc::new(Mutex::new(Value::Null)),
            handle: CtrlHandle { tx },
            outbound_rx,
        }
    }

    pub fn autokill(mut self, autokill: bool) -> Self {
        self.autokill = autokill;
        self
    }

    pub fn mirror(&self) -> Arc<Mutex<TableMirror>> {
        Arc::clone(&self.mirror)
    }

    /// Last received config snapshot (`Null` before the first one).
    pub fn config(&self) -> Value {
        self.config.lock().clone()
    }

    pub fn handle(&self) -> CtrlHandle {
        self.handle.clone()
    }

    /// Connect and serve until the stream ends; reconnects with a 1 s
    /// backoff unless `autokill` is set.
    pub async fn run(&mut self, handler: &mut dyn CtrlHandler) -> anyhow::Result<()> {
        let url = format!("ws://{}:{}/ws_ctrl", self.host, self.port);

        loop {
            match connect_async(&url).await {
                Ok((stream, _)) => {
                    handler.connected();
                    self.drive(stream, handler).await;
                    handler.disconnected();
                }
                Err(e) => {
                    debug!(url = %url, err = %e, "ctrl connect failed");
                }
            }

            if self.autokill {
                anyhow::bail!("ctrl connection to {url} closed");
            }

            self.mirror.lock().clear();
            *self.config.lock() = Value::Null;
            tokio::time::sleep(RECONNECT_DELAY).await;
        }
    }

    async fn drive<S>(&mut self, stream: S, handler: &mut dyn CtrlHandler)
    where
        S: futures_util::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>>
            + futures_util::Sink<Message, Error = tokio_tungstenite::tungstenite::Error>
            + Unpin,
    {
        let (mut ws_tx, mut ws_rx) = stream.split();
        // Response sink of the command currently in flight.
        let mut in_flight: Option<mpsc::UnboundedSender<CommandResponse>> = None;

        loop {
            tokio::select! {
                outbound = self.outbound_rx.recv() => {
                    let frame = match outbound {
                        Some(Outbound::Command { command, args, responses }) => {
                            in_flight = Some(responses);
                            json!({ "command": command, "args": args })
                        }
                        Some(Outbound::UserInput { text }) => {
                            json!({ "command": "user_input", "text": text })
                        }
                        None => break,
                    };
                    let Ok(text) = serde_json::to_string(&frame) else { continue };
                    if ws_tx.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }

                msg = ws_rx.next() => {
                    let text = match msg {
                        Some(Ok(Message::Text(text))) => text,
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Err(_)) => break,
                        Some(Ok(_)) => continue,
                    };
                    let Ok(frame) = serde_json::from_str::<ServerMessage>(text.as_str()) else {
                        warn!("unparseable ctrl frame ignored");
                        continue;
                    };

                    // Table frames feed the mirror; the rest are ctrl-only.
                    let Some(frame) = dispatch_io_frame(frame, &self.mirror, handler) else {
                        continue;
                    };
                    match frame {
                        ServerMessage::UpdateConfig { config } => {
                            *self.config.lock() = config.clone();
                            handler.update_current_config(&config);
                        }
                        ServerMessage::Response(response) => {
                            let finished = response.command_finished;
                            if let Some(ref tx) = in_flight {
                                let _ = tx.send(response);
                            } else {
                                debug!("response frame with no command in flight");
                            }
                            if finished {
                                in_flight = None;
                            }
                        }
                        _ => {}
                    }
                }
            }
        }
    }
}
