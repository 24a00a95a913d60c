// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! `addmodule`, `enable`, `disable`.

use super::{CommandCx, Responder};

/// `addmodule <reference>` — register and enable a module from the library.
pub async fn addmodule(cx: &CommandCx, args: &[String], out: &mut Responder) {
    if args.len() != 1 {
        out.error("\"addmodule\" expects: addmodule [module]");
        return;
    }
    let reference = &args[0];

    match cx.engine.upsert_module(reference, true).await {
        Ok(()) => {
            cx.config.add_module(reference);
            out.finished(format!("Successfully added module \"{reference}\""));
        }
        Err(e) => out.error(format!("Could not add module \"{reference}\": {e}")),
    }
}

/// `enable <module>`
pub async fn enable(cx: &CommandCx, args: &[String], out: &mut Responder) {
    if args.len() != 1 {
        out.error("\"enable\" expects: enable [module]");
        return;
    }
    let reference = &args[0];

    match cx.engine.enable_module(reference).await {
        Ok(()) => {
            cx.config.enable_module(reference);
            out.finished(format!("Enabled module \"{reference}\""));
        }
        Err(e) => out.error(format!("Could not enable module \"{reference}\": {e}")),
    }
}

/// `disable <module>` — a no-op on an already-disabled module.
pub async fn disable(cx: &CommandCx, args: &[String], out: &mut Responder) {
    if args.len() != 1 {
        out.error("\"disable\" expects: disable [module]");
        return;
    }
    let reference = &args[0];

    match cx.engine.disable_module(reference).await {
        Ok(()) => {
            cx.config.disable_module(reference);
            out.finished(format!("Disabled module \"{reference}\""));
        }
        Err(e) => out.error(format!("Could not disable module \"{reference}\": {e}")),
    }
}
