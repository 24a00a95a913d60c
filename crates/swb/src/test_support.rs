// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Shared test fixtures: an in-process fake device client speaking the
//! device-client HTTP protocol.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::State;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, put};
use axum::{Json, Router};
use serde_json::Value;

use swb_proto::{
    DeviceInfo, DeviceReading, DevicesInfoReply, DevicesValueReply, SetReply, SetRequest,
};

/// Handle on a fake device client. Clone freely; state is shared.
#[derive(Clone, Default)]
pub struct FakeClient(Arc<parking_lot::Mutex<FakeInner>>);

#[derive(Default)]
struct FakeInner {
    infos: Vec<DeviceInfo>,
    /// local name → Ok(value) | Err(error string)
    values: HashMap<String, Result<Value, String>>,
    fail_info: bool,
    fail_values: bool,
    client_error: Option<String>,
    sets: Vec<SetRequest>,
}

impl FakeClient {
    pub fn add_device(&self, name: &str, readable: bool, writeable: bool) {
        self.0.lock().infos.push(DeviceInfo { name: name.to_owned(), readable, writeable });
    }

    pub fn set_value(&self, name: &str, value: Value) {
        self.0.lock().values.insert(name.to_owned(), Ok(value));
    }

    pub fn set_device_error(&self, name: &str, error: &str) {
        self.0.lock().values.insert(name.to_owned(), Err(error.to_owned()));
    }

    pub fn set_client_error(&self, error: Option<&str>) {
        self.0.lock().client_error = error.map(str::to_owned);
    }

    pub fn fail_values(&self, fail: bool) {
        self.0.lock().fail_values = fail;
    }

    pub fn fail_info(&self, fail: bool) {
        self.0.lock().fail_info = fail;
    }

    pub fn sets(&self) -> Vec<SetRequest> {
        self.0.lock().sets.clone()
    }
}

async fn info_handler(State(state): State<FakeClient>) -> Response {
    let inner = state.0.lock();
    if inner.fail_info {
        return axum::http::StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }
    Json(DevicesInfoReply { devices: inner.infos.clone() }).into_response()
}

async fn values_handler(State(state): State<FakeClient>) -> Response {
    let inner = state.0.lock();
    if inner.fail_values {
        return axum::http::StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }
    if let Some(ref error) = inner.client_error {
        return Json(DevicesValueReply::Error { error: error.clone() }).into_response();
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

async fn set_handler(State(state): State<FakeClient>, Json(req): Json<SetRequest>) -> Response {
    state.0.lock().sets.push(req);
    Json(SetReply::default()).into_response()
}

/// Serve a fake device client on a fresh port; returns the handle and URL.
pub async fn spawn_fake() -> (FakeClient, String) {
    let fake = FakeClient::default();
    let app = Router::new()
        .route("/devices_info", get(info_handler))
        .route("/devices_value", get(values_handler))
        .route("/device_set", put(set_handler))
        .with_state(fake.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });

    (fake, format!("http://{addr}"))
}
