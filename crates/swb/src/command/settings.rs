// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! `set`, `start`, `stop`.

use serde_json::{json, Value};

use crate::config::ConfigKey;

use super::{CommandCx, Responder};

/// `set <device|config-key> <value>` — drive an output device or change a
/// config option.
pub async fn set(cx: &CommandCx, args: &[String], out: &mut Responder) {
    if args.len() != 2 {
        out.error("\"set\" expects: set [device|config] [value]");
        return;
    }
    let (target, value) = (&args[0], &args[1]);

    if cx.engine.device_exists(target).await {
        match cx.engine.set_device(target, Value::String(value.clone())).await {
            Ok(()) => out.finished(format!("Set {target} to {value}")),
            Err(e) => out.error(format!("Could not set \"{target}\": {e}")),
        }
        return;
    }

    if ConfigKey::parse(target) == Some(ConfigKey::PollPeriod) {
        match cx.config.set(ConfigKey::PollPeriod, json!(value)) {
            Ok(()) => out.finished(format!("Set {target} to {value}")),
            Err(e) => out.error(e.message().to_owned()),
        }
        return;
    }

    out.error(format!("Invalid set target \"{target}\""));
}

/// `start` — begin evaluating modules each tick.
pub async fn start(cx: &CommandCx, out: &mut Responder) {
    if cx.config.poll_period() <= 0.0 {
        out.error("Unable to start switchboard as poll_period is not set");
        return;
    }
    if cx.engine.running().await {
        out.warn_finished("Switchboard is already running");
        return;
    }

    cx.engine.set_running(true).await;
    cx.config.set_running(true);
    out.finished("Switchboard started");
}

/// `stop` — stop evaluating modules; polling and fan-out continue.
pub async fn stop(cx: &CommandCx, out: &mut Responder) {
    if !cx.engine.running().await {
        out.warn_finished("Switchboard is not running");
        return;
    }

    cx.engine.set_running(false).await;
    cx.config.set_running(false);
    out.finished("Switchboard stopped");
}
