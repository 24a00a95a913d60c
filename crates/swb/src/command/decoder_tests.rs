// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::sync::Arc;

use serde_json::json;

use swb_proto::{CommandResponse, CommandStatus, ServerMessage};

use super::{CommandCx, Decoder};
use crate::config::ConfigStore;
use crate::engine::Engine;
use crate::module::{ModuleDef, ModuleIo, ModuleLibrary};
use crate::snapshot::IoHub;
use crate::supervisor::AppSupervisor;
use crate::test_support::spawn_fake;

fn cx_with(library: ModuleLibrary) -> CommandCx {
    let config = Arc::new(ConfigStore::new());
    let hub = Arc::new(IoHub::new());
    CommandCx {
        engine: Arc::new(Engine::new(Arc::clone(&config), hub, library)),
        config,
        supervisor: Arc::new(AppSupervisor::new()),
    }
}

fn counter_library() -> ModuleLibrary {
    let mut library = ModuleLibrary::new();
    let def = ModuleDef::function(|| {
        Box::new(|io: &mut ModuleIo| -> anyhow::Result<()> {
            if let Some(out) = io.output(0) {
                out.set_value(json!(1))?;
            }
            Ok(())
        })
    })
    .with_outputs(["tick.out.s"]);
    library.register("demo.counter", def).expect("register");
    library
}

/// Unwrap the single response frame a pass produced.
fn single(messages: Vec<ServerMessage>) -> CommandResponse {
    assert_eq!(messages.len(), 1, "expected one response, got {messages:?}");
    match messages.into_iter().next() {
        Some(ServerMessage::Response(resp)) => resp,
        other => unreachable!("expected a response frame, got {other:?}"),
    }
}

fn last(messages: &[ServerMessage]) -> &CommandResponse {
    match messages.last() {
        Some(ServerMessage::Response(resp)) => resp,
        other => unreachable!("expected a response frame, got {other:?}"),
    }
}

#[tokio::test]
async fn invalid_json_is_an_internal_error() {
    let cx = cx_with(ModuleLibrary::new());
    let mut decoder = Decoder::new();

    let resp = single(decoder.decode(&cx, "not json").await);
    assert_eq!(resp.command_status, Some(CommandStatus::Error));
    assert!(resp.command_finished);
    assert!(resp.display_text.contains("invalid JSON input"));
}

#[tokio::test]
async fn unknown_command_is_rejected() {
    let cx = cx_with(ModuleLibrary::new());
    let mut decoder = Decoder::new();

    let resp = single(decoder.decode(&cx, r#"{"command":"frobnicate","args":[]}"#).await);
    assert_eq!(resp.command_status, Some(CommandStatus::Error));
    assert!(resp.display_text.contains("Unknown command: frobnicate"));
}

#[tokio::test]
async fn user_input_while_idle_is_an_internal_error() {
    let cx = cx_with(ModuleLibrary::new());
    let mut decoder = Decoder::new();

    let resp = single(
        decoder.decode(&cx, r#"{"command":"user_input","text":"y"}"#).await,
    );
    assert_eq!(resp.command_status, Some(CommandStatus::Error));
    assert!(resp.display_text.contains("unknown destination for user input"));
}

#[tokio::test]
async fn start_and_stop_round_trip_with_warnings_on_repeats() {
    let cx = cx_with(ModuleLibrary::new());
    let mut decoder = Decoder::new();

    let resp = single(decoder.decode(&cx, r#"{"command":"start","args":[]}"#).await);
    assert_eq!(resp.command_status, None);
    assert!(cx.engine.running().await);
    assert!(cx.config.running());

    let resp = single(decoder.decode(&cx, r#"{"command":"start","args":[]}"#).await);
    assert_eq!(resp.command_status, Some(CommandStatus::Warning));

    let resp = single(decoder.decode(&cx, r#"{"command":"stop","args":[]}"#).await);
    assert_eq!(resp.command_status, None);
    assert!(!cx.engine.running().await);

    let resp = single(decoder.decode(&cx, r#"{"command":"stop","args":[]}"#).await);
    assert_eq!(resp.command_status, Some(CommandStatus::Warning));
}

#[tokio::test]
async fn set_updates_poll_period_but_rejects_unknown_targets() {
    let cx = cx_with(ModuleLibrary::new());
    let mut decoder = Decoder::new();

    let resp = single(
        decoder.decode(&cx, r#"{"command":"set","args":["poll_period","0.5"]}"#).await,
    );
    assert_eq!(resp.command_status, None);
    assert_eq!(cx.config.poll_period(), 0.5);

    let resp = single(
        decoder.decode(&cx, r#"{"command":"set","args":["nonsense","1"]}"#).await,
    );
    assert_eq!(resp.command_status, Some(CommandStatus::Error));
    assert!(resp.display_text.contains("Invalid set target"));
}

#[tokio::test]
async fn addmodule_registers_and_persists() {
    let cx = cx_with(counter_library());
    let mut decoder = Decoder::new();

    let resp = single(
        decoder.decode(&cx, r#"{"command":"addmodule","args":["demo.counter"]}"#).await,
    );
    assert_eq!(resp.command_status, None, "got: {}", resp.display_text);
    assert!(cx.engine.module_exists("demo.counter").await);
    assert!(cx.config.data().modules.contains_key("demo.counter"));

    let resp = single(
        decoder.decode(&cx, r#"{"command":"disable","args":["demo.counter"]}"#).await,
    );
    assert_eq!(resp.command_status, None);
    // Disabling twice stays a clean no-op.
    let resp = single(
        decoder.decode(&cx, r#"{"command":"disable","args":["demo.counter"]}"#).await,
    );
    assert_eq!(resp.command_status, None);

    let resp = single(
        decoder.decode(&cx, r#"{"command":"enable","args":["missing"]}"#).await,
    );
    assert_eq!(resp.command_status, Some(CommandStatus::Error));
}

#[tokio::test]
async fn remove_dispatches_to_modules_without_confirmation() {
    let cx = cx_with(counter_library());
    let mut decoder = Decoder::new();

    decoder.decode(&cx, r#"{"command":"addmodule","args":["demo.counter"]}"#).await;
    let resp = single(
        decoder.decode(&cx, r#"{"command":"remove","args":["demo.counter"]}"#).await,
    );
    assert_eq!(resp.command_status, None);
    assert!(!cx.engine.module_exists("demo.counter").await);
    assert!(!decoder.waiting_for_input());
}

#[tokio::test]
async fn remove_unknown_target_is_an_error() {
    let cx = cx_with(ModuleLibrary::new());
    let mut decoder = Decoder::new();

    let resp = single(decoder.decode(&cx, r#"{"command":"remove","args":["ghost"]}"#).await);
    assert_eq!(resp.command_status, Some(CommandStatus::Error));
    assert!(resp.display_text.contains("neither a registered module nor a client"));
}

async fn cx_with_dependent_client() -> CommandCx {
    let mut library = ModuleLibrary::new();
    let def = ModuleDef::function(|| {
        Box::new(|io: &mut ModuleIo| -> anyhow::Result<()> {
            let _ = io.input(0).map(|s| s.value());
            Ok(())
        })
    })
    .with_inputs(["c1.in.i"]);
    library.register("demo.watcher", def).expect("register");

    let cx = cx_with(library);
    let (fake, url) = spawn_fake().await;
    fake.add_device("in.i", true, false);
    fake.set_value("in.i", json!(0));
    cx.engine.add_client(&url, "c1", None).await.expect("add client");
    cx.config.add_client("c1", &url, None);
    cx.engine.upsert_module("demo.watcher", true).await.expect("upsert");
    cx.config.add_module("demo.watcher");
    cx
}

#[tokio::test]
async fn remove_client_with_dependents_asks_for_confirmation() {
    let cx = cx_with_dependent_client().await;
    let mut decoder = Decoder::new();

    let messages = decoder.decode(&cx, r#"{"command":"remove","args":["c1"]}"#).await;
    let resp = last(&messages);
    assert!(resp.get_input, "should prompt: {}", resp.display_text);
    assert_eq!(resp.command_status, Some(CommandStatus::Warning));
    assert!(resp.display_text.contains("demo.watcher"));
    assert!(decoder.waiting_for_input());

    // Confirming removes the module and the client.
    let messages = decoder.decode(&cx, r#"{"command":"user_input","text":"y"}"#).await;
    assert!(last(&messages).command_finished);
    assert!(!cx.engine.module_exists("demo.watcher").await);
    assert!(!cx.engine.client_exists("c1").await);
    assert!(!cx.config.data().clients.contains_key("c1"));
    assert!(!cx.config.data().modules.contains_key("demo.watcher"));
    assert!(!decoder.waiting_for_input());
}

#[tokio::test]
async fn remove_client_declined_leaves_state_unchanged() {
    let cx = cx_with_dependent_client().await;
    let mut decoder = Decoder::new();

    decoder.decode(&cx, r#"{"command":"remove","args":["c1"]}"#).await;
    let messages = decoder.decode(&cx, r#"{"command":"user_input","text":"n"}"#).await;
    assert!(last(&messages).command_finished);
    assert!(cx.engine.module_exists("demo.watcher").await);
    assert!(cx.engine.client_exists("c1").await);
}

#[tokio::test]
async fn invalid_confirmation_input_reprompts() {
    let cx = cx_with_dependent_client().await;
    let mut decoder = Decoder::new();

    decoder.decode(&cx, r#"{"command":"remove","args":["c1"]}"#).await;
    let messages = decoder.decode(&cx, r#"{"command":"user_input","text":"maybe"}"#).await;
    assert!(last(&messages).get_input);
    assert!(decoder.waiting_for_input());

    let messages = decoder.decode(&cx, r#"{"command":"user_input","text":"y"}"#).await;
    assert!(last(&messages).command_finished);
}

#[tokio::test]
async fn new_commands_are_rejected_while_waiting_for_input() {
    let cx = cx_with_dependent_client().await;
    let mut decoder = Decoder::new();

    decoder.decode(&cx, r#"{"command":"remove","args":["c1"]}"#).await;
    let resp = single(decoder.decode(&cx, r#"{"command":"start","args":[]}"#).await);
    assert_eq!(resp.command_status, Some(CommandStatus::Error));
    assert!(resp.display_text.contains("waiting for input"));

    // The suspended command is still resumable.
    assert!(decoder.waiting_for_input());
    let messages = decoder.decode(&cx, r#"{"command":"user_input","text":"n"}"#).await;
    assert!(last(&messages).command_finished);
    assert!(cx.engine.client_exists("c1").await);
}

#[tokio::test]
async fn launchapp_negotiates_prompts_and_killapp_unwinds() {
    let cx = cx_with(ModuleLibrary::new());
    let mut decoder = Decoder::new();

    // A fake app: --getconf prints one unreserved argument, any other
    // invocation just stays alive.
    let dir = tempfile::tempdir().expect("tempdir");
    let script = dir.path().join("fakeapp");
    std::fs::write(
        &script,
        "#!/bin/sh\n\
         if [ \"$1\" = \"--getconf\" ]; then\n\
         echo '{\"Log file\": {\"args\": [\"--file\"], \"kwargs\": {\"help\": \"log file\"}}}'\n\
         exit 0\n\
         fi\n\
         sleep 30\n",
    )
    .expect("write script");
    make_executable(&script);
    let app = script.display().to_string();

    let frame = json!({"command": "launchapp", "args": [app]}).to_string();
    let messages = decoder.decode(&cx, &frame).await;
    let prompt = last(&messages);
    assert!(prompt.get_input, "got: {}", prompt.display_text);
    assert!(prompt.display_text.contains("log file"));
    assert!(decoder.waiting_for_input());

    let frame = json!({"command": "user_input", "text": "out.log"}).to_string();
    let messages = decoder.decode(&cx, &frame).await;
    let done = last(&messages);
    assert!(done.command_finished, "got: {}", done.display_text);
    assert_eq!(done.command_status, None, "got: {}", done.display_text);

    let record = cx.supervisor.record(&app).expect("app recorded");
    assert!(record.command.contains("--file out.log"));
    assert!(cx.config.data().apps.contains_key(&app));

    let frame = json!({"command": "killapp", "args": [app]}).to_string();
    let messages = decoder.decode(&cx, &frame).await;
    assert!(last(&messages).command_finished);
    assert!(cx.supervisor.running_apps().is_empty());
    assert!(cx.config.data().apps.is_empty());
}

#[tokio::test]
async fn remove_refuses_clients_owned_by_apps() {
    let cx = cx_with_dependent_client().await;
    // Pretend an app owns c1.
    cx.supervisor
        .spawn("fakeapp", "sleep 30", None, Some("c1".to_owned()))
        .await
        .expect("spawn");

    let mut decoder = Decoder::new();
    let resp = single(decoder.decode(&cx, r#"{"command":"remove","args":["c1"]}"#).await);
    assert_eq!(resp.command_status, Some(CommandStatus::Error));
    assert!(resp.display_text.contains("killapp"));

    cx.supervisor.shutdown();
}

fn make_executable(path: &std::path::Path) {
    use std::os::unix::fs::PermissionsExt;
    let mut perms = std::fs::metadata(path).expect("metadata").permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(path, perms).expect("chmod");
}
