// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! End-to-end scenarios: fake device clients, a real ws server, explicit
//! ticks.

use std::time::Duration;

use serde_json::{json, Value};

use swb::module::{ModuleDef, ModuleIo, ModuleLibrary};
use swb_client::{CtrlClient, CtrlHandler, IoDataClient, IoDataHandler};
use swb_proto::{CommandResponse, CommandStatus, ServerMessage};
use swb_specs::{recv_msg, send_msg, spawn_device_client, TestRig};

fn library() -> ModuleLibrary {
    let mut library = ModuleLibrary::new();

    let doubler = || {
        ModuleDef::function(|| {
            Box::new(|io: &mut ModuleIo| -> anyhow::Result<()> {
                let value = io.input(0).and_then(|s| s.value().as_i64()).unwrap_or(0);
                if let Some(out) = io.output(0) {
                    out.set_value(json!(value * 2))?;
                }
                Ok(())
            })
        })
        .with_inputs(["c1.in.i"])
    };

    library
        .register("demo.doubler", doubler().with_outputs(["c2.out.o"]))
        .expect("register doubler");
    library
        .register(
            "demo.doubler_guarded",
            doubler().with_output_error_values([("c2.out.o", Some(json!(-1)))]),
        )
        .expect("register guarded doubler");

    let sink = || {
        ModuleDef::function(|| {
            Box::new(|io: &mut ModuleIo| -> anyhow::Result<()> {
                if let Some(out) = io.output(0) {
                    out.set_value(json!(0))?;
                }
                Ok(())
            })
        })
        .with_outputs(["c.x.o"])
    };
    library.register("m1", sink()).expect("register m1");
    library.register("m2", sink()).expect("register m2");

    let watcher = ModuleDef::function(|| {
        Box::new(|io: &mut ModuleIo| -> anyhow::Result<()> {
            let _ = io.input(0).map(|s| s.value());
            Ok(())
        })
    })
    .with_inputs(["c1.in.i"]);
    library.register("demo.watcher", watcher).expect("register watcher");

    library
}

/// Scenario 1: one healthy client, one tick, fresh subscriber sees the
/// full table.
#[tokio::test]
async fn tick_with_one_healthy_client_publishes_the_table() {
    let rig = TestRig::start(library()).await;
    let (fake, url) = spawn_device_client().await;
    fake.add_device("in.i", true, false);
    fake.set_value("in.i", json!(7));

    rig.engine.add_client(&url, "c1", None).await.expect("add client");
    rig.engine.tick_once().await;

    let mut ws = rig.ws_iodata().await;
    let ServerMessage::UpdateTable { table } = recv_msg(&mut ws).await else {
        unreachable!("fresh subscriber must receive update_table first");
    };
    assert_eq!(table.len(), 1);
    assert_eq!(table[0].client_alias, "c1");
    assert_eq!(table[0].client_url, url);
    assert_eq!(table[0].devices.len(), 1);
    assert_eq!(table[0].devices[0].name, "c1.in.i");
    assert_eq!(table[0].devices[0].value, json!(7));
    assert_eq!(table[0].devices[0].last_set_value, Value::Null);
}

/// Scenario 2: a changed reading arrives as one update_fields diff.
#[tokio::test]
async fn changed_value_arrives_as_a_diff() {
    let rig = TestRig::start(library()).await;
    let (fake, url) = spawn_device_client().await;
    fake.add_device("in.i", true, false);
    fake.set_value("in.i", json!(7));

    rig.engine.add_client(&url, "c1", None).await.expect("add client");
    rig.engine.tick_once().await;

    let mut ws = rig.ws_iodata().await;
    assert!(matches!(recv_msg(&mut ws).await, ServerMessage::UpdateTable { .. }));

    fake.set_value("in.i", json!(8));
    rig.engine.tick_once().await;

    let ServerMessage::UpdateFields { fields } = recv_msg(&mut ws).await else {
        unreachable!("expected update_fields");
    };
    assert_eq!(fields.len(), 1);
    assert_eq!(fields[0].device, "c1.in.i");
    assert_eq!(fields[0].value, json!(8));
    assert_eq!(fields[0].last_set_value, Value::Null);
    assert!(fields[0].last_update_time > 0);
}

/// Scenario 3: a module reads one client and drives an output on another.
#[tokio::test]
async fn module_drives_remote_output() {
    let rig = TestRig::start(library()).await;

    let (source, source_url) = spawn_device_client().await;
    source.add_device("in.i", true, false);
    source.set_value("in.i", json!(5));

    let (sink, sink_url) = spawn_device_client().await;
    sink.add_device("out.o", false, true);

    rig.engine.add_client(&source_url, "c1", None).await.expect("add c1");
    rig.engine.add_client(&sink_url, "c2", None).await.expect("add c2");
    rig.engine.upsert_module("demo.doubler", true).await.expect("upsert");
    rig.engine.set_running(true).await;

    rig.engine.tick_once().await;

    let sets = sink.sets();
    assert_eq!(sets.len(), 1);
    assert_eq!(sets[0].name, "out.o");
    assert_eq!(sets[0].value, "10");
}

/// Scenario 4: the declared error-value is driven exactly once per error
/// episode, and evaluation resumes on recovery.
#[tokio::test]
async fn error_value_is_latched_until_recovery() {
    let rig = TestRig::start(library()).await;

    let (source, source_url) = spawn_device_client().await;
    source.add_device("in.i", true, false);
    source.set_value("in.i", json!(5));

    let (sink, sink_url) = spawn_device_client().await;
    sink.add_device("out.o", false, true);

    rig.engine.add_client(&source_url, "c1", None).await.expect("add c1");
    rig.engine.add_client(&sink_url, "c2", None).await.expect("add c2");
    rig.engine.upsert_module("demo.doubler_guarded", true).await.expect("upsert");
    rig.engine.set_running(true).await;

    source.set_device_error("in.i", "broken");
    rig.engine.tick_once().await;
    rig.engine.tick_once().await;
    rig.engine.tick_once().await;

    // One PUT of the error value, no matter how long the error persists.
    let sets = sink.sets();
    assert_eq!(sets.len(), 1, "got: {sets:?}");
    assert_eq!(sets[0].value, "-1");

    source.set_value("in.i", json!(5));
    rig.engine.tick_once().await;

    let sets = sink.sets();
    assert_eq!(sets.len(), 2);
    assert_eq!(sets[1].value, "10");
}

/// Scenario 5: a second driver for the same output is rejected over
/// ws_ctrl; the first registration is untouched.
#[tokio::test]
async fn duplicate_driver_is_rejected_over_ctrl() {
    let rig = TestRig::start(library()).await;
    let (fake, url) = spawn_device_client().await;
    fake.add_device("x.o", false, true);
    rig.engine.add_client(&url, "c", None).await.expect("add client");
    rig.engine.upsert_module("m1", true).await.expect("m1");

    let mut ws = rig.ws_ctrl().await;
    // Connect backfill: table then config.
    assert!(matches!(recv_msg(&mut ws).await, ServerMessage::UpdateTable { .. }));
    assert!(matches!(recv_msg(&mut ws).await, ServerMessage::UpdateConfig { .. }));

    send_msg(&mut ws, &json!({"command": "addmodule", "args": ["m2"]})).await;
    let response = next_response(&mut ws).await;
    assert_eq!(response.command_status, Some(CommandStatus::Error));
    assert!(response.display_text.contains("already being driven by module m1"));

    let statuses = rig.engine.module_statuses().await;
    assert_eq!(statuses.len(), 1);
    assert_eq!(statuses[0].name, "m1");
    assert!(statuses[0].enabled);
}

/// Scenario 6, confirmed: removing a client a module depends on prompts,
/// and `y` removes both.
#[tokio::test]
async fn interactive_remove_confirmed_removes_client_and_module() {
    let rig = TestRig::start(library()).await;
    let (fake, url) = spawn_device_client().await;
    fake.add_device("in.i", true, false);
    fake.set_value("in.i", json!(0));

    rig.engine.add_client(&url, "c1", None).await.expect("add client");
    rig.config.add_client("c1", &url, None);
    rig.engine.upsert_module("demo.watcher", true).await.expect("upsert");
    rig.config.add_module("demo.watcher");

    let mut ctrl = CtrlClient::new("127.0.0.1", rig.port);
    let handle = ctrl.handle();
    tokio::spawn(async move {
        let mut handler = NullHandler;
        let _ = ctrl.run(&mut handler).await;
    });

    let mut responses = handle.send("remove", vec![json!("c1")]);
    let first = responses.recv().await.expect("prompt response");
    assert!(first.get_input);
    assert_eq!(first.command_status, Some(CommandStatus::Warning));
    assert!(first.display_text.contains("demo.watcher"));

    handle.user_input("y");
    let mut finished = false;
    while let Some(response) = responses.recv().await {
        if response.command_finished {
            finished = true;
            break;
        }
    }
    assert!(finished);

    assert!(!rig.engine.client_exists("c1").await);
    assert!(!rig.engine.module_exists("demo.watcher").await);
    assert!(!rig.config.data().clients.contains_key("c1"));
    assert!(!rig.config.data().modules.contains_key("demo.watcher"));
}

/// Scenario 6, declined: `n` leaves everything in place.
#[tokio::test]
async fn interactive_remove_declined_changes_nothing() {
    let rig = TestRig::start(library()).await;
    let (fake, url) = spawn_device_client().await;
    fake.add_device("in.i", true, false);
    fake.set_value("in.i", json!(0));

    rig.engine.add_client(&url, "c1", None).await.expect("add client");
    rig.engine.upsert_module("demo.watcher", true).await.expect("upsert");

    let mut ctrl = CtrlClient::new("127.0.0.1", rig.port);
    let handle = ctrl.handle();
    tokio::spawn(async move {
        let mut handler = NullHandler;
        let _ = ctrl.run(&mut handler).await;
    });

    let mut responses = handle.send("remove", vec![json!("c1")]);
    let first = responses.recv().await.expect("prompt response");
    assert!(first.get_input);

    handle.user_input("n");
    let last = responses.recv().await.expect("final response");
    assert!(last.command_finished);
    assert!(last.display_text.contains("Not removing"));

    assert!(rig.engine.client_exists("c1").await);
    assert!(rig.engine.module_exists("demo.watcher").await);
}

/// start/stop over ctrl flip `running` and broadcast the config change.
#[tokio::test]
async fn start_command_broadcasts_updated_config() {
    let rig = TestRig::start(library()).await;

    let mut ws = rig.ws_ctrl().await;
    assert!(matches!(recv_msg(&mut ws).await, ServerMessage::UpdateTable { .. }));
    assert!(matches!(recv_msg(&mut ws).await, ServerMessage::UpdateConfig { .. }));

    send_msg(&mut ws, &json!({"command": "start", "args": []})).await;

    let mut saw_running = false;
    let mut saw_finished = false;
    for _ in 0..4 {
        match recv_msg(&mut ws).await {
            ServerMessage::UpdateConfig { config } => {
                if config["running"] == json!(true) {
                    saw_running = true;
                }
            }
            ServerMessage::Response(response) => {
                assert_eq!(response.command_status, None);
                saw_finished = response.command_finished;
            }
            _ => {}
        }
        if saw_running && saw_finished {
            break;
        }
    }
    assert!(saw_running && saw_finished);
    assert!(rig.engine.running().await);
}

/// The iodata client library reconstructs the table from reset + diffs.
#[tokio::test]
async fn iodata_client_mirror_tracks_the_engine() {
    let rig = TestRig::start(library()).await;
    let (fake, url) = spawn_device_client().await;
    fake.add_device("in.i", true, false);
    fake.set_value("in.i", json!(1));

    rig.engine.add_client(&url, "c1", None).await.expect("add client");
    rig.engine.tick_once().await;

    let client = IoDataClient::new("127.0.0.1", rig.port);
    let mirror = client.mirror();
    tokio::spawn(async move {
        let mut handler = NullHandler;
        let _ = client.run(&mut handler).await;
    });

    wait_for(|| mirror.lock().device("c1.in.i").map(|d| d.value.clone()) == Some(json!(1))).await;

    fake.set_value("in.i", json!(2));
    rig.engine.tick_once().await;
    wait_for(|| mirror.lock().device("c1.in.i").map(|d| d.value.clone()) == Some(json!(2))).await;

    assert_eq!(
        mirror.lock().client("c1").map(|c| c.client_url.clone()),
        Some(url)
    );
}

// -- helpers ------------------------------------------------------------------

struct NullHandler;
impl IoDataHandler for NullHandler {}
impl CtrlHandler for NullHandler {}

/// Skip table/config traffic until the next command response.
async fn next_response(ws: &mut swb_specs::WsStream) -> CommandResponse {
    for _ in 0..16 {
        if let ServerMessage::Response(response) = recv_msg(ws).await {
            return response;
        }
    }
    unreachable!("no response frame within 16 messages");
}

async fn wait_for(mut condition: impl FnMut() -> bool) {
    for _ in 0..100 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(condition(), "condition not met within 5s");
}
