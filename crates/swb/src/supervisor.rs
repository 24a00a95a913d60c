// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! App supervisor: launches external observer/client processes, negotiates
//! their arguments over the `--getconf` contract, and tears them down by
//! process group.
//!
//! Every supervised app understands `--getconf`: it prints a JSON descriptor
//! of its recognised arguments and exits. The descriptor maps a display name
//! to `{"args": ["--flag", "-f"], "kwargs": {"help": …, "action"?, "default"?}}`.
//! Four names are reserved and pre-filled by the supervisor: `WSIOData port`,
//! `WSIOData host`, `Client port`, and `autokill`.

use std::collections::BTreeMap;
use std::process::Stdio;
use std::time::Duration;

use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::Value;
use tracing::{info, warn};

use crate::error::{engine_bail, EngineError, EngineResult};

/// How long a healthy app has to survive after spawn.
const CRASH_WINDOW: Duration = Duration::from_secs(1);

/// How long `--getconf` may take before the app counts as hung.
const GETCONF_TIMEOUT: Duration = Duration::from_secs(1);

// -- Argument descriptor ------------------------------------------------------

/// One recognised argument in an app's `--getconf` descriptor.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ArgInfo {
    /// Long flag first, aliases after.
    pub args: Vec<String>,
    #[serde(default)]
    pub kwargs: ArgKwargs,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ArgKwargs {
    #[serde(default)]
    pub help: String,
    /// `"store_true"` marks a boolean flag.
    #[serde(default)]
    pub action: Option<String>,
    #[serde(default)]
    pub default: Option<Value>,
}

pub type AppArgs = BTreeMap<String, ArgInfo>;

/// A question the UI must answer before an app can launch.
#[derive(Debug, Clone, PartialEq)]
pub enum ArgPrompt {
    /// Boolean flag; answered y/n.
    Flag { name: String, flag: String, help: String },
    /// Valued argument, optionally with a default used on empty input.
    Value { name: String, flag: String, help: String, default: Option<String> },
}

/// The negotiated part of a launch: pre-filled command, any allocated
/// client port, and the arguments still needing user input.
#[derive(Debug, Clone, PartialEq)]
pub struct LaunchPlan {
    pub command: String,
    pub client_port: Option<u16>,
    pub prompts: Vec<ArgPrompt>,
}

/// Pre-fill the well-known arguments and collect prompts for the rest.
pub fn plan_launch(app: &str, args: &AppArgs, ws_port: u16) -> EngineResult<LaunchPlan> {
    let mut command = app.to_owned();
    let mut client_port = None;
    let mut prompts = Vec::new();

    for (name, info) in args {
        let Some(flag) = info.args.first() else {
            engine_bail!("Argument \"{name}\" of app \"{app}\" has no flag");
        };

        match name.as_str() {
            "WSIOData port" => command.push_str(&format!(" {flag} {ws_port}")),
            "WSIOData host" => command.push_str(&format!(" {flag} localhost")),
            "Client port" => {
                let port = crate::transport::free_tcp_port()
                    .map_err(|e| EngineError::new(format!("Unable to allocate a port: {e}")))?;
                client_port = Some(port);
                command.push_str(&format!(" {flag} {port}"));
            }
            "autokill" => command.push_str(&format!(" {flag}")),
            _ => {
                let help = info.kwargs.help.clone();
                if info.kwargs.action.as_deref() == Some("store_true") {
                    prompts.push(ArgPrompt::Flag {
                        name: name.clone(),
                        flag: flag.clone(),
                        help,
                    });
                } else {
                    prompts.push(ArgPrompt::Value {
                        name: name.clone(),
                        flag: flag.clone(),
                        help,
                        default: info.kwargs.default.as_ref().map(crate::client::wire_string),
                    });
                }
            }
        }
    }

    Ok(LaunchPlan { command, client_port, prompts })
}

// -- Supervisor ---------------------------------------------------------------

/// A supervised child process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppRecord {
    pub command: String,
    /// Process group id (the child leads its own group).
    pub pgid: i32,
    pub client_port: Option<u16>,
    pub client_alias: Option<String>,
}

#[derive(Default)]
pub struct AppSupervisor {
    apps: Mutex<BTreeMap<String, AppRecord>>,
}

impl AppSupervisor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `<app> --getconf` and parse the argument descriptor. The app
    /// must exit promptly; a hang or a non-zero exit fails the launch.
    pub async fn getconf(&self, app: &str) -> EngineResult<AppArgs> {
        let child = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(format!("{app} --getconf"))
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .spawn();
        let child = match child {
            Ok(child) => child,
            Err(e) => engine_bail!("Unable to run app \"{app}\": {e}"),
        };

        let output = match tokio::time::timeout(GETCONF_TIMEOUT, child.wait_with_output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => engine_bail!("App \"{app}\" failed while getting config options: {e}"),
            Err(_) => engine_bail!("App \"{app}\" hangs when getting config options"),
        };

        if !output.status.success() {
            engine_bail!("App \"{app}\" exited with an error while getting config options");
        }

        serde_json::from_slice(&output.stdout)
            .map_err(|_| EngineError::new(format!("Unable to parse config definitions of app \"{app}\"")))
    }

    /// Spawn the populated command in a new process group and verify it
    /// survives the crash window before recording it.
    pub async fn spawn(
        &self,
        app: &str,
        command: &str,
        client_port: Option<u16>,
        client_alias: Option<String>,
    ) -> EngineResult<()> {
        if self.apps.lock().contains_key(app) {
            engine_bail!("App \"{app}\" is already running");
        }

        info!(app, command, "launching app");
        let child = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(command)
            .process_group(0)
            .spawn();
        let mut child = match child {
            Ok(child) => child,
            Err(e) => engine_bail!("Unable to launch \"{command}\": {e}"),
        };

        tokio::time::sleep(CRASH_WINDOW).await;
        if let Ok(Some(status)) = child.try_wait() {
            engine_bail!(
                "App terminated unexpectedly ({status}) with command: {command}"
            );
        }

        let Some(pid) = child.id() else {
            engine_bail!("App \"{app}\" exited before it could be recorded");
        };

        self.apps.lock().insert(
            app.to_owned(),
            AppRecord {
                command: command.to_owned(),
                pgid: pid as i32,
                client_port,
                client_alias,
            },
        );

        // Reap the child when it exits; teardown goes through killpg.
        tokio::spawn(async move {
            let _ = child.wait().await;
        });
        Ok(())
    }

    /// Record the alias of the client an app brought with it, once known.
    pub fn set_client_alias(&self, app: &str, alias: &str) {
        if let Some(record) = self.apps.lock().get_mut(app) {
            record.client_alias = Some(alias.to_owned());
        }
    }

    pub fn record(&self, app: &str) -> Option<AppRecord> {
        self.apps.lock().get(app).cloned()
    }

    pub fn running_apps(&self) -> Vec<String> {
        self.apps.lock().keys().cloned().collect()
    }

    /// The app owning the given client alias, if any. `remove` refuses such
    /// clients; they go away with `killapp`.
    pub fn app_owning_client(&self, alias: &str) -> Option<String> {
        self.apps
            .lock()
            .iter()
            .find(|(_, record)| record.client_alias.as_deref() == Some(alias))
            .map(|(name, _)| name.clone())
    }

    /// TERM the app's process group and drop its record. Returns the record
    /// so the caller can unwind the client and config entries.
    pub fn kill(&self, app: &str) -> EngineResult<AppRecord> {
        let Some(record) = self.apps.lock().remove(app) else {
            engine_bail!("Unknown app \"{app}\"");
        };

        info!(app, pgid = record.pgid, "killing app");
        terminate_group(record.pgid);
        Ok(record)
    }

    /// Kill every supervised process group. Called on engine teardown.
    pub fn shutdown(&self) {
        let apps = std::mem::take(&mut *self.apps.lock());
        for (app, record) in apps {
            info!(app, pgid = record.pgid, "terminating supervised app");
            terminate_group(record.pgid);
        }
    }
}

fn terminate_group(pgid: i32) {
    if let Err(e) = killpg(Pid::from_raw(pgid), Signal::SIGTERM) {
        warn!(pgid, "failed to signal process group: {e}");
    }
}

#[cfg(test)]
#[path = "supervisor_tests.rs"]
mod tests;
