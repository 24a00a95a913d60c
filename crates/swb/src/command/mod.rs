// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Resumable command decoder for the ctrl stream.
//!
//! Each ctrl connection owns one [`Decoder`]. A command either runs to
//! completion in a single decode pass or suspends as a [`PendingCommand`]
//! waiting for a `user_input` frame; the decoder advances it when the input
//! arrives. A new command arriving while one is suspended is rejected
//! without disturbing the suspended one.

pub mod apps;
pub mod clients;
pub mod modules;
pub mod settings;

use std::sync::Arc;

use serde_json::Value;
use tracing::warn;

use swb_proto::{CommandResponse, CommandStatus, ServerMessage};

use crate::config::ConfigStore;
use crate::engine::Engine;
use crate::supervisor::AppSupervisor;

/// Shared handles every command works against.
#[derive(Clone)]
pub struct CommandCx {
    pub engine: Arc<Engine>,
    pub config: Arc<ConfigStore>,
    pub supervisor: Arc<AppSupervisor>,
}

// -- Responses ----------------------------------------------------------------

/// Collects the `response` frames produced by one decode pass.
#[derive(Debug, Default)]
pub struct Responder {
    out: Vec<ServerMessage>,
}

impl Responder {
    fn push(&mut self, text: String, finished: bool, prompt: bool, status: Option<CommandStatus>) {
        self.out.push(ServerMessage::Response(CommandResponse {
            display_text: text,
            command_finished: finished,
            get_input: prompt,
            command_status: status,
        }));
    }

    /// Progress line; the command keeps running.
    pub fn text(&mut self, text: impl Into<String>) {
        self.push(text.into(), false, false, None);
    }

    /// Final line of a successful command.
    pub fn finished(&mut self, text: impl Into<String>) {
        self.push(text.into(), true, false, None);
    }

    /// Ask the user for input; the command suspends.
    pub fn prompt(&mut self, text: impl Into<String>) {
        self.push(text.into(), false, true, None);
    }

    /// Warning that still needs an answer.
    pub fn warn_prompt(&mut self, text: impl Into<String>) {
        self.push(text.into(), false, true, Some(CommandStatus::Warning));
    }

    /// Final line of a command that completed with a caveat.
    pub fn warn_finished(&mut self, text: impl Into<String>) {
        self.push(text.into(), true, false, Some(CommandStatus::Warning));
    }

    /// Final line of a failed command.
    pub fn error(&mut self, text: impl Into<String>) {
        self.push(text.into(), true, false, Some(CommandStatus::Error));
    }

    pub fn into_messages(self) -> Vec<ServerMessage> {
        self.out
    }
}

// -- Pending commands ---------------------------------------------------------

/// A multi-step command suspended on user input.
pub enum PendingCommand {
    Remove(clients::RemoveFlow),
    Launch(apps::LaunchFlow),
}

impl PendingCommand {
    async fn resume(
        self,
        input: &str,
        cx: &CommandCx,
        out: &mut Responder,
    ) -> Option<PendingCommand> {
        match self {
            PendingCommand::Remove(flow) => flow.resume(input, cx, out).await,
            PendingCommand::Launch(flow) => flow.resume(input, cx, out).await,
        }
    }
}

// -- Decoder ------------------------------------------------------------------

/// Per-connection command decoder. Idle until a command arrives; suspended
/// while a command waits for input.
#[derive(Default)]
pub struct Decoder {
    pending: Option<PendingCommand>,
}

impl Decoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// True while a command is waiting for `user_input`.
    pub fn waiting_for_input(&self) -> bool {
        self.pending.is_some()
    }

    /// Decode one incoming ctrl frame and return the responses to send.
    pub async fn decode(&mut self, cx: &CommandCx, raw: &str) -> Vec<ServerMessage> {
        let mut out = Responder::default();

        let Ok(msg) = serde_json::from_str::<Value>(raw) else {
            out.error(format!("Internal error: invalid JSON input \"{raw}\""));
            return out.into_messages();
        };
        let Some(command) = msg.get("command").and_then(Value::as_str) else {
            out.error("Internal error: message has no \"command\" field");
            return out.into_messages();
        };

        if command == "user_input" {
            let text = msg.get("text").and_then(Value::as_str).unwrap_or_default();
            match self.pending.take() {
                Some(pending) => {
                    self.pending = pending.resume(text, cx, &mut out).await;
                }
                None => {
                    out.error(format!(
                        "Internal error: unknown destination for user input \"{text}\""
                    ));
                }
            }
            return out.into_messages();
        }

        if self.pending.is_some() {
            // A command is suspended on input. Interruption policy: reject
            // the newcomer, keep the suspended command resumable.
            warn!(command, "command rejected while another is waiting for input");
            out.error(format!(
                "Command \"{command}\" rejected: another command is waiting for input"
            ));
            return out.into_messages();
        }

        let args = parse_args(&msg);
        self.pending = dispatch(command, args, cx, &mut out).await;
        out.into_messages()
    }
}

/// Command args arrive as a JSON list; scalars are accepted and rendered
/// as their string form.
fn parse_args(msg: &Value) -> Vec<String> {
    msg.get("args")
        .and_then(Value::as_array)
        .map(|args| {
            args.iter()
                .map(|v| match v {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                })
                .collect()
        })
        .unwrap_or_default()
}

async fn dispatch(
    command: &str,
    args: Vec<String>,
    cx: &CommandCx,
    out: &mut Responder,
) -> Option<PendingCommand> {
    match command {
        "addclient" => clients::addclient(cx, &args, out).await,
        "updateclient" => clients::updateclient(cx, &args, out).await,
        "remove" => return clients::remove(cx, &args, out).await,
        "addmodule" => modules::addmodule(cx, &args, out).await,
        "enable" => modules::enable(cx, &args, out).await,
        "disable" => modules::disable(cx, &args, out).await,
        "launchapp" => return apps::launchapp(cx, &args, out).await,
        "killapp" => apps::killapp(cx, &args, out).await,
        "set" => settings::set(cx, &args, out).await,
        "start" => settings::start(cx, out).await,
        "stop" => settings::stop(cx, out).await,
        other => out.error(format!("Unknown command: {other}")),
    }
    None
}

#[cfg(test)]
#[path = "decoder_tests.rs"]
mod tests;
