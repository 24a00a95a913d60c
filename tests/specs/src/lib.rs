// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Test harness for end-to-end scenario tests.
//!
//! Boots a full switchboard (engine, config store, supervisor, ws server)
//! on a fresh port, next to any number of fake device clients speaking the
//! device-client HTTP protocol. Ticks are driven explicitly by the tests so
//! every scenario is deterministic.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, put};
use axum::{Json, Router};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

use futures_util::{SinkExt, StreamExt};

use swb::config::ConfigStore;
use swb::engine::Engine;
use swb::module::ModuleLibrary;
use swb::snapshot::IoHub;
use swb::supervisor::AppSupervisor;
use swb::transport::{build_router, ServerState};
use swb_proto::{
    DeviceInfo, DeviceReading, DevicesInfoReply, DevicesValueReply, ServerMessage, SetReply,
    SetRequest,
};

const RECV_TIMEOUT: Duration = Duration::from_secs(5);

// -- Fake device client -------------------------------------------------------

/// Handle on a fake device client. Clone freely; state is shared.
#[derive(Clone, Default)]
pub struct FakeDeviceClient(Arc<parking_lot::Mutex<FakeInner>>);

#[derive(Default)]
struct FakeInner {
    infos: Vec<DeviceInfo>,
    /// local name → Ok(value) | Err(error string)
    values: HashMap<String, Result<Value, String>>,
    fail_values: bool,
    sets: Vec<SetRequest>,
}

impl FakeDeviceClient {
    pub fn add_device(&self, name: &str, readable: bool, writeable: bool) {
        self.0.lock().infos.push(DeviceInfo { name: name.to_owned(), readable, writeable });
    }

    pub fn set_value(&self, name: &str, value: Value) {
        self.0.lock().values.insert(name.to_owned(), Ok(value));
    }

    pub fn set_device_error(&self, name: &str, error: &str) {
        self.0.lock().values.insert(name.to_owned(), Err(error.to_owned()));
    }

    pub fn fail_values(&self, fail: bool) {
        self.0.lock().fail_values = fail;
    }

    /// Every `PUT /device_set` body received, in order.
    pub fn sets(&self) -> Vec<SetRequest> {
        self.0.lock().sets.clone()
    }
}

async fn info_handler(State(state): State<FakeDeviceClient>) -> Response {
    Json(DevicesInfoReply { devices: state.0.lock().infos.clone() }).into_response()
}

async fn values_handler(State(state): State<FakeDeviceClient>) -> Response {
    let inner = state.0.lock();
    if inner.fail_values {
        return axum::http::StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }
    let devices = inner
        .values
        .iter()
        .map(|(name, value)| match value {
            Ok(v) => DeviceReading { name: name.clone(), value: Some(v.clone()), error: None },
            Err(e) => DeviceReading { name: name.clone(), value: None, error: Some(e.clone()) },
        })
        .collect();
    Json(DevicesValueReply::Devices { devices }).into_response()
}

async fn set_handler(
    State(state): State<FakeDeviceClient>,
    Json(req): Json<SetRequest>,
) -> Response {
    state.0.lock().sets.push(req);
    Json(SetReply::default()).into_response()
}

/// Serve a fake device client on a fresh port; returns the handle and URL.
pub async fn spawn_device_client() -> (FakeDeviceClient, String) {
    let fake = FakeDeviceClient::default();
    let app = Router::new()
        .route("/devices_info", get(info_handler))
        .route("/devices_value", get(values_handler))
        .route("/device_set", put(set_handler))
        .with_state(fake.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("bind fake client");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });

    (fake, format!("http://{addr}"))
}

// -- Switchboard rig ----------------------------------------------------------

pub type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// A full switchboard instance on a fresh port, ticked by hand.
pub struct TestRig {
    pub engine: Arc<Engine>,
    pub config: Arc<ConfigStore>,
    pub supervisor: Arc<AppSupervisor>,
    pub hub: Arc<IoHub>,
    pub port: u16,
    pub shutdown: CancellationToken,
}

impl TestRig {
    pub async fn start(library: ModuleLibrary) -> TestRig {
        let config = Arc::new(ConfigStore::new());
        let hub = Arc::new(IoHub::new());
        let engine = Arc::new(Engine::new(Arc::clone(&config), Arc::clone(&hub), library));
        let supervisor = Arc::new(AppSupervisor::new());
        let shutdown = CancellationToken::new();

        let state = Arc::new(ServerState {
            engine: Arc::clone(&engine),
            config: Arc::clone(&config),
            supervisor: Arc::clone(&supervisor),
            hub: Arc::clone(&hub),
            shutdown: shutdown.clone(),
        });
        let router = build_router(state);

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("bind rig");
        let port = listener.local_addr().expect("local addr").port();
        config.set_ws_port(port);

        let serve_shutdown = shutdown.clone();
        tokio::spawn(async move {
            let _ = axum::serve(listener, router)
                .with_graceful_shutdown(serve_shutdown.cancelled_owned())
                .await;
        });

        TestRig { engine, config, supervisor, hub, port, shutdown }
    }

    pub async fn ws_iodata(&self) -> WsStream {
        connect(&format!("ws://127.0.0.1:{}/ws_iodata", self.port)).await
    }

    pub async fn ws_ctrl(&self) -> WsStream {
        connect(&format!("ws://127.0.0.1:{}/ws_ctrl", self.port)).await
    }
}

impl Drop for TestRig {
    fn drop(&mut self) {
        self.shutdown.cancel();
        self.supervisor.shutdown();
    }
}

async fn connect(url: &str) -> WsStream {
    let (stream, _) = tokio::time::timeout(RECV_TIMEOUT, connect_async(url))
        .await
        .expect("ws connect timed out")
        .expect("ws connect failed");
    stream
}

/// Receive the next text frame as a [`ServerMessage`].
pub async fn recv_msg(ws: &mut WsStream) -> ServerMessage {
    loop {
        let msg = tokio::time::timeout(RECV_TIMEOUT, ws.next())
            .await
            .expect("ws recv timed out")
            .expect("ws stream ended")
            .expect("ws recv failed");
        match msg {
            Message::Text(text) => {
                return serde_json::from_str(text.as_str()).expect("unparseable server frame");
            }
            Message::Ping(_) | Message::Pong(_) => continue,
            other => unreachable!("unexpected ws frame: {other:?}"),
        }
    }
}

/// Send a raw JSON frame.
pub async fn send_msg(ws: &mut WsStream, frame: &Value) {
    let text = serde_json::to_string(frame).expect("serialize frame");
    ws.send(Message::Text(text.into())).await.expect("ws send failed");
}
