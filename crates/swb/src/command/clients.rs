// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! `addclient`, `updateclient`, and the module/client `remove` dispatch.

use super::{CommandCx, PendingCommand, Responder};

/// `addclient <url> <alias> [poll_period]`
pub async fn addclient(cx: &CommandCx, args: &[String], out: &mut Responder) {
    if args.len() < 2 || args.len() > 3 {
        out.error("\"addclient\" expects: addclient [url] [alias] [poll period]");
        return;
    }
    let url = normalize_url(&args[0]);
    let alias = &args[1];

    let poll_period = match parse_poll_period(args.get(2)) {
        Ok(period) => period,
        Err(reason) => {
            out.error(reason);
            return;
        }
    };

    match cx.engine.add_client(&url, alias, poll_period).await {
        Ok(added) => {
            cx.config.add_client(alias, &url, poll_period);
            out.text("Adding devices:");
            for device in &added.devices {
                out.text(format!("\t{device}"));
            }
            out.finished(format!("Successfully added client \"{alias}({url})\""));
        }
        Err(e) => out.error(format!("Could not add client \"{alias}({url})\": {e}")),
    }
}

/// `updateclient <alias> [poll_period|none]` — re-fetch the device
/// catalogue, optionally changing the poll period.
pub async fn updateclient(cx: &CommandCx, args: &[String], out: &mut Responder) {
    if args.is_empty() || args.len() > 2 {
        out.error("\"updateclient\" expects: updateclient [alias] [poll period|none]");
        return;
    }
    let alias = &args[0];

    let poll_period = match args.get(1) {
        None => cx.engine.client_poll_period(alias).await,
        Some(raw) if raw.eq_ignore_ascii_case("none") => None,
        Some(raw) => match parse_poll_period(Some(raw)) {
            Ok(period) => period,
            Err(reason) => {
                out.error(reason);
                return;
            }
        },
    };

    match cx.engine.update_client(alias, poll_period).await {
        Ok(added) => {
            cx.config.add_client(alias, &added.url, poll_period);
            out.finished(format!("Successfully updated client \"{alias}\""));
        }
        Err(e) => out.error(format!("Could not update client \"{alias}\": {e}")),
    }
}

/// `remove <module|client>` — removing a client that modules depend on
/// asks for confirmation first.
pub async fn remove(
    cx: &CommandCx,
    args: &[String],
    out: &mut Responder,
) -> Option<PendingCommand> {
    if args.len() != 1 {
        out.error("\"remove\" expects: remove [module|client]");
        return None;
    }
    let target = &args[0];

    if cx.engine.module_exists(target).await {
        match cx.engine.remove_module(target).await {
            Ok(()) => {
                cx.config.remove_module(target);
                out.finished(format!("Removed module \"{target}\""));
            }
            Err(e) => out.error(format!("Could not remove module \"{target}\": {e}")),
        }
        return None;
    }

    if !cx.engine.client_exists(target).await {
        out.error(format!(
            "\"{target}\" is neither a registered module nor a client alias"
        ));
        return None;
    }

    if let Some(app) = cx.supervisor.app_owning_client(target) {
        out.error(format!(
            "Client \"{target}\" was added by app \"{app}\"; use killapp to remove it"
        ));
        return None;
    }

    let modules = match cx.engine.modules_using_client(target).await {
        Ok(modules) => modules,
        Err(e) => {
            out.error(format!("Could not remove client \"{target}\": {e}"));
            return None;
        }
    };

    if modules.is_empty() {
        remove_client_now(cx, target, &[], out).await;
        return None;
    }

    out.warn_prompt(format!(
        "Removing client \"{target}\" will also remove module(s): {}. Continue? [y/n] ",
        modules.join(", ")
    ));
    Some(PendingCommand::Remove(RemoveFlow { alias: target.clone(), modules }))
}

/// The `remove <client>` confirmation, suspended on y/n.
pub struct RemoveFlow {
    alias: String,
    modules: Vec<String>,
}

impl RemoveFlow {
    pub async fn resume(
        self,
        input: &str,
        cx: &CommandCx,
        out: &mut Responder,
    ) -> Option<PendingCommand> {
        match input.trim().to_lowercase().as_str() {
            "y" => {
                remove_client_now(cx, &self.alias, &self.modules, out).await;
                None
            }
            "n" => {
                out.finished(format!("Not removing client \"{}\"", self.alias));
                None
            }
            _ => {
                out.prompt("Invalid input. Continue? [y/n] ");
                Some(PendingCommand::Remove(self))
            }
        }
    }
}

async fn remove_client_now(cx: &CommandCx, alias: &str, modules: &[String], out: &mut Responder) {
    for module in modules {
        match cx.engine.remove_module(module).await {
            Ok(()) => {
                cx.config.remove_module(module);
                out.text(format!("Removed module \"{module}\""));
            }
            Err(e) => out.text(format!("Could not remove module \"{module}\": {e}")),
        }
    }

    match cx.engine.remove_client(alias).await {
        Ok(()) => {
            cx.config.remove_client(alias);
            out.finished(format!("Removed client \"{alias}\""));
        }
        Err(e) => out.error(format!("Could not remove client \"{alias}\": {e}")),
    }
}

fn normalize_url(raw: &str) -> String {
    if raw.starts_with("http://") || raw.starts_with("https://") {
        raw.to_owned()
    } else {
        format!("http://{raw}")
    }
}

fn parse_poll_period(raw: Option<&String>) -> Result<Option<f64>, String> {
    match raw {
        None => Ok(None),
        Some(raw) => match raw.parse::<f64>() {
            Ok(period) if period > 0.0 => Ok(Some(period)),
            _ => Err(format!("Invalid poll period \"{raw}\": must be a positive float")),
        },
    }
}
