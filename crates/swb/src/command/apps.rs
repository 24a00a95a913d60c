// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! `launchapp` and `killapp`.
//!
//! `launchapp` is the longest command flow in the system: negotiate the
//! app's arguments (`--getconf`), prompt for the ones the supervisor cannot
//! pre-fill, spawn the process, and, when a client port was allocated,
//! wait for the app's device endpoint and register it as a client.

use std::collections::VecDeque;
use std::time::Duration;

use crate::client::DeviceClient;
use crate::config::AppConfig;
use crate::supervisor::{plan_launch, ArgPrompt};

use super::{CommandCx, PendingCommand, Responder};

/// Attempts made against a freshly launched app's `/devices_info`.
const REGISTER_ATTEMPTS: u32 = 5;
const REGISTER_INTERVAL: Duration = Duration::from_secs(1);

/// `launchapp <app>`
pub async fn launchapp(
    cx: &CommandCx,
    args: &[String],
    out: &mut Responder,
) -> Option<PendingCommand> {
    if args.len() != 1 {
        out.error("\"launchapp\" expects: launchapp [app]");
        return None;
    }
    let app = &args[0];

    if cx.supervisor.record(app).is_some() {
        out.error(format!("App \"{app}\" is already running"));
        return None;
    }

    let descriptor = match cx.supervisor.getconf(app).await {
        Ok(descriptor) => descriptor,
        Err(e) => {
            out.error(format!("Could not launch app \"{app}\": {e}"));
            return None;
        }
    };

    let ws_port = cx.config.ws_port().unwrap_or_default();
    let plan = match plan_launch(app, &descriptor, ws_port) {
        Ok(plan) => plan,
        Err(e) => {
            out.error(format!("Could not launch app \"{app}\": {e}"));
            return None;
        }
    };

    let flow = LaunchFlow {
        app: app.clone(),
        command: plan.command,
        client_port: plan.client_port,
        prompts: plan.prompts.into(),
        awaiting: Awaiting::Nothing,
    };
    flow.advance(cx, out).await
}

/// `killapp <app>` — TERM the process group and unwind the client it
/// brought with it.
pub async fn killapp(cx: &CommandCx, args: &[String], out: &mut Responder) {
    if args.len() != 1 {
        out.error("\"killapp\" expects: killapp [app]");
        return;
    }
    let app = &args[0];

    let record = match cx.supervisor.kill(app) {
        Ok(record) => record,
        Err(e) => {
            out.error(format!("Could not kill app \"{app}\": {e}"));
            return;
        }
    };

    if let Some(ref alias) = record.client_alias {
        match cx.engine.remove_client(alias).await {
            Ok(()) => cx.config.remove_client(alias),
            Err(e) => out.text(format!("Could not remove client \"{alias}\": {e}")),
        }
    }
    cx.config.remove_app(app);
    out.finished(format!("Killed app \"{app}\""));
}

// -- Launch flow --------------------------------------------------------------

enum Awaiting {
    Nothing,
    Arg(ArgPrompt),
    Alias,
}

/// The suspended state of one `launchapp` invocation.
pub struct LaunchFlow {
    app: String,
    command: String,
    client_port: Option<u16>,
    prompts: VecDeque<ArgPrompt>,
    awaiting: Awaiting,
}

impl LaunchFlow {
    /// Emit the next prompt. Once all arguments are settled, spawn the app
    /// and move on to client registration.
    async fn advance(
        mut self,
        cx: &CommandCx,
        out: &mut Responder,
    ) -> Option<PendingCommand> {
        if let Some(prompt) = self.prompts.pop_front() {
            out.prompt(prompt_text(&prompt));
            self.awaiting = Awaiting::Arg(prompt);
            return Some(PendingCommand::Launch(self));
        }

        if let Err(e) = cx
            .supervisor
            .spawn(&self.app, &self.command, self.client_port, None)
            .await
        {
            out.error(format!("Could not launch app \"{}\": {e}", self.app));
            return None;
        }

        if self.client_port.is_some() {
            out.prompt("Please enter a client alias for this app: ");
            self.awaiting = Awaiting::Alias;
            return Some(PendingCommand::Launch(self));
        }

        cx.config.add_app(
            &self.app,
            AppConfig { command: self.command.clone(), client_port: None, client_alias: None },
        );
        out.finished(format!("Successfully launched app \"{}\"", self.app));
        None
    }

    pub async fn resume(
        mut self,
        input: &str,
        cx: &CommandCx,
        out: &mut Responder,
    ) -> Option<PendingCommand> {
        match std::mem::replace(&mut self.awaiting, Awaiting::Nothing) {
            Awaiting::Nothing => {
                out.error("Internal error: launch flow received unexpected input");
                None
            }
            Awaiting::Arg(prompt) => self.apply_arg(prompt, input, cx, out).await,
            Awaiting::Alias => self.register_client(input, cx, out).await,
        }
    }

    async fn apply_arg(
        mut self,
        prompt: ArgPrompt,
        input: &str,
        cx: &CommandCx,
        out: &mut Responder,
    ) -> Option<PendingCommand> {
        let accepted = match &prompt {
            ArgPrompt::Flag { flag, .. } => match input.trim().to_lowercase().as_str() {
                "y" => {
                    self.command.push_str(&format!(" {flag}"));
                    true
                }
                "n" => true,
                _ => false,
            },
            ArgPrompt::Value { flag, .. } => {
                let value = input.trim();
                // Empty input falls back to the app's own default.
                if !value.is_empty() {
                    self.command.push_str(&format!(" {flag} {value}"));
                }
                true
            }
        };

        if !accepted {
            out.text("Invalid input");
            out.prompt(prompt_text(&prompt));
            self.awaiting = Awaiting::Arg(prompt);
            return Some(PendingCommand::Launch(self));
        }
        self.advance(cx, out).await
    }

    /// The app exposes a device endpoint: wait for it to come up, then
    /// register it as a client under the supplied alias. Failure rolls the
    /// launch back.
    async fn register_client(
        mut self,
        input: &str,
        cx: &CommandCx,
        out: &mut Responder,
    ) -> Option<PendingCommand> {
        let alias = input.trim().to_owned();
        if alias.is_empty() {
            out.prompt("Please enter a client alias for this app: ");
            self.awaiting = Awaiting::Alias;
            return Some(PendingCommand::Launch(self));
        }

        let port = self.client_port.unwrap_or_default();
        let url = format!("http://localhost:{port}");

        let device_client = DeviceClient::new(reqwest::Client::new(), &url);
        let mut reachable = false;
        for attempt in 0..REGISTER_ATTEMPTS {
            if device_client.poll_info().await.is_ok() {
                reachable = true;
                break;
            }
            if attempt + 1 < REGISTER_ATTEMPTS {
                tokio::time::sleep(REGISTER_INTERVAL).await;
            }
        }

        if !reachable {
            let _ = cx.supervisor.kill(&self.app);
            out.error(format!(
                "App client {url} did not come up; launch of \"{}\" rolled back",
                self.app
            ));
            return None;
        }

        match cx.engine.add_client(&url, &alias, None).await {
            Ok(_) => {
                cx.supervisor.set_client_alias(&self.app, &alias);
                cx.config.add_client(&alias, &url, None);
                cx.config.add_app(
                    &self.app,
                    AppConfig {
                        command: self.command.clone(),
                        client_port: self.client_port,
                        client_alias: Some(alias.clone()),
                    },
                );
                out.finished(format!(
                    "Successfully launched app \"{}\" and added client \"{alias}\"",
                    self.app
                ));
            }
            Err(e) => {
                let _ = cx.supervisor.kill(&self.app);
                out.error(format!(
                    "Unable to add app client \"{alias}({url})\": {e}; launch rolled back"
                ));
            }
        }
        None
    }
}

fn prompt_text(prompt: &ArgPrompt) -> String {
    match prompt {
        ArgPrompt::Flag { help, .. } => format!("{help}? [y/n] "),
        ArgPrompt::Value { help, default, .. } => match default {
            Some(default) => format!("Please enter a value for the {help} [{default}]: "),
            None => format!("Please enter a value for the {help}: "),
        },
    }
}
