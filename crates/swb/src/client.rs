// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Remote client proxy: one HTTP device endpoint, its owned devices, poll
//! gating, and the error cascade from client to devices.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use tracing::{info, warn};

use swb_proto::{DevicesInfoReply, DevicesValueReply, SetReply, SetRequest};

use crate::device::Device;

const INFO_TIMEOUT: Duration = Duration::from_secs(3);
const VALUES_TIMEOUT: Duration = Duration::from_secs(5);
const SET_TIMEOUT: Duration = Duration::from_secs(1);

// -- HTTP wrapper -------------------------------------------------------------

/// Bounded HTTP wrapper for the three device-client endpoints.
pub struct DeviceClient {
    http: reqwest::Client,
    base_url: String,
}

impl DeviceClient {
    pub fn new(http: reqwest::Client, base_url: &str) -> Self {
        Self { http, base_url: base_url.trim_end_matches('/').to_owned() }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// `GET /devices_info` — fetch the device catalogue.
    pub async fn poll_info(&self) -> anyhow::Result<DevicesInfoReply> {
        let resp = self
            .http
            .get(self.url("/devices_info"))
            .timeout(INFO_TIMEOUT)
            .send()
            .await?;
        let reply = resp.error_for_status()?.json().await?;
        Ok(reply)
    }

    /// `GET /devices_value` — fetch current readings.
    pub async fn poll_values(&self) -> anyhow::Result<DevicesValueReply> {
        let resp = self
            .http
            .get(self.url("/devices_value"))
            .timeout(VALUES_TIMEOUT)
            .send()
            .await?;
        let reply = resp.error_for_status()?.json().await?;
        Ok(reply)
    }

    /// `PUT /device_set` — drive one output on the remote client.
    pub async fn set(&self, local_name: &str, value: &Value) -> anyhow::Result<SetReply> {
        let body = SetRequest { name: local_name.to_owned(), value: wire_string(value) };
        let resp = self
            .http
            .put(self.url("/device_set"))
            .timeout(SET_TIMEOUT)
            .json(&body)
            .send()
            .await?;
        let reply = resp.error_for_status()?.json().await?;
        Ok(reply)
    }
}

/// Stringified form a value takes in a `/device_set` body. Strings pass
/// through; everything else uses its canonical JSON rendering.
pub fn wire_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

// -- Client record ------------------------------------------------------------

/// A registered remote client: alias, URL, owned devices, poll gating,
/// and error state cascaded onto the devices.
pub struct Client {
    pub url: String,
    pub alias: String,
    pub connected: bool,
    pub error: Option<String>,
    /// Poll period in seconds; `None` polls on every tick.
    pub poll_period: Option<f64>,
    last_polled: Option<Instant>,
    /// Owned devices, keyed by global name. Destroyed with the client.
    pub devices: BTreeMap<String, Arc<Device>>,
}

impl Client {
    pub fn new(
        url: &str,
        alias: &str,
        devices: BTreeMap<String, Arc<Device>>,
        poll_period: Option<f64>,
    ) -> Self {
        Self {
            url: url.to_owned(),
            alias: alias.to_owned(),
            connected: false,
            error: None,
            poll_period,
            last_polled: None,
            devices,
        }
    }

    /// Poll gate: with no period set, poll every tick; otherwise only once
    /// the period has elapsed on the wall clock since the last poll. This is
    /// independent of the engine's own tick period.
    pub fn do_update(&mut self) -> bool {
        let Some(period) = self.poll_period else {
            return true;
        };

        let due = match self.last_polled {
            None => true,
            Some(at) => at.elapsed() > Duration::from_secs_f64(period),
        };
        if due {
            self.last_polled = Some(Instant::now());
        }
        due
    }

    /// Enter the error state: remember the message and stamp every owned
    /// device so modules reading them see the failure. Logged once per
    /// transition, not per tick.
    pub fn on_error(&mut self, msg: &str) {
        if self.error.as_deref() == Some(msg) {
            return;
        }
        warn!(client = %self.url, "client error: {msg}");
        self.error = Some(msg.to_owned());

        for device in self.devices.values() {
            device.set_error(format!("Client error \"{msg}\""));
        }
    }

    /// Leave the error state, clearing the cascaded device errors.
    pub fn on_no_error(&mut self) {
        if self.error.is_none() {
            return;
        }
        info!(client = %self.url, "client no longer in error state");
        self.error = None;

        for device in self.devices.values() {
            device.clear_error();
        }
    }
}

#[cfg(test)]
#[path = "client_tests.rs"]
mod tests;
