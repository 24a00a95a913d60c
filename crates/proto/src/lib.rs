// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Wire types shared by the switchboard engine and its observers.
//!
//! Covers the three surfaces that cross a process boundary: the canonical
//! I/O state table and its diffs, the JSON frames on the `/ws_iodata` and
//! `/ws_ctrl` websocket streams, and the HTTP bodies of the device-client
//! protocol (`/devices_info`, `/devices_value`, `/device_set`).

use serde::{Deserialize, Serialize};
use serde_json::Value;

// -- State table --------------------------------------------------------------

/// Canonical, deterministically ordered snapshot of every device in the
/// system: clients sorted by alias, devices sorted by global name.
pub type StateTable = Vec<ClientEntry>;

/// One client's slice of the state table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientEntry {
    pub client_url: String,
    pub client_alias: String,
    pub devices: Vec<DeviceEntry>,
}

/// One device row in the state table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceEntry {
    pub name: String,
    pub value: Value,
    pub last_set_value: Value,
    pub last_update_time: u64,
}

/// A single-device diff against the last emitted table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldUpdate {
    pub device: String,
    pub value: Value,
    pub last_set_value: Value,
    pub last_update_time: u64,
}

// -- Websocket frames ---------------------------------------------------------

/// Server-to-observer frames on both ws streams.
///
/// `/ws_iodata` carries `update_table` and `update_fields`; `/ws_ctrl`
/// additionally carries `update_config` and per-command `response` frames.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum ServerMessage {
    UpdateTable { table: StateTable },
    UpdateFields { fields: Vec<FieldUpdate> },
    UpdateConfig { config: Value },
    Response(CommandResponse),
}

/// One step of a command's output on the ctrl stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandResponse {
    pub display_text: String,
    pub command_finished: bool,
    pub get_input: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command_status: Option<CommandStatus>,
}

/// Non-OK command outcomes. OK is the absence of a status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CommandStatus {
    Warning,
    Error,
}

// -- Device-client HTTP protocol ----------------------------------------------

/// One device in a client's `GET /devices_info` catalogue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub name: String,
    pub readable: bool,
    pub writeable: bool,
}

/// `GET /devices_info` response body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DevicesInfoReply {
    pub devices: Vec<DeviceInfo>,
}

/// One reading in a `GET /devices_value` response. A healthy reading
/// carries `value`; an unhealthy one carries `error` instead.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceReading {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// `GET /devices_value` response body: either a device list or a
/// client-wide error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DevicesValueReply {
    Error { error: String },
    Devices { devices: Vec<DeviceReading> },
}

/// `PUT /device_set` request body. The value crosses the wire stringified.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SetRequest {
    pub name: String,
    pub value: String,
}

/// `PUT /device_set` response body: empty on success.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SetReply {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

// -- Time ---------------------------------------------------------------------

/// Return current epoch millis.
pub fn epoch_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
