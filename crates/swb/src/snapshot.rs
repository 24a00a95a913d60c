// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! State table + diff engine.
//!
//! Receives the entire I/O state every tick and converts its progression
//! into `update_table` (reset) and `update_fields` (diff) events, fanned out
//! to ws subscribers over a broadcast channel. The cached table is the sort
//! key: observers that apply diffs in order to the last reset reconstruct
//! the engine's table exactly.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::broadcast;

use swb_proto::{ClientEntry, DeviceEntry, FieldUpdate, ServerMessage, StateTable};

use crate::client::Client;
use crate::device::Device;

/// Fan-out hub for the iodata stream.
pub struct IoHub {
    tx: broadcast::Sender<ServerMessage>,
    /// Cached table; `None` after a structural reset.
    table: Mutex<Option<StateTable>>,
}

impl Default for IoHub {
    fn default() -> Self {
        Self::new()
    }
}

impl IoHub {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(256);
        Self { tx, table: Mutex::new(None) }
    }

    /// Subscribe to iodata events.
    pub fn subscribe(&self) -> broadcast::Receiver<ServerMessage> {
        self.tx.subscribe()
    }

    /// The table a freshly connected subscriber should be sent.
    pub fn current_table(&self) -> StateTable {
        self.table.lock().clone().unwrap_or_default()
    }

    /// Invalidate the cached table. Called whenever clients or devices are
    /// added or removed; the next snapshot emits a full reset.
    pub fn reset_table(&self) {
        *self.table.lock() = None;
    }

    /// Fold one tick's state into the stream: a full `update_table` after a
    /// reset, an `update_fields` diff when rows changed, nothing otherwise.
    /// Returns the emitted event (tests read it directly).
    pub fn take_snapshot(
        &self,
        clients: &BTreeMap<String, Client>,
        devices: &BTreeMap<String, Arc<Device>>,
    ) -> Option<ServerMessage> {
        let mut cached = self.table.lock();

        let event = match cached.as_mut() {
            Some(table) => {
                let fields = diff_table(table, devices);
                if fields.is_empty() {
                    return None;
                }
                ServerMessage::UpdateFields { fields }
            }
            None => {
                let table = make_state_table(clients);
                *cached = Some(table.clone());
                ServerMessage::UpdateTable { table }
            }
        };

        drop(cached);
        let _ = self.tx.send(event.clone());
        Some(event)
    }
}

/// Build a brand new canonical table: clients sorted by alias, each
/// client's devices sorted by global name.
fn make_state_table(clients: &BTreeMap<String, Client>) -> StateTable {
    clients
        .values()
        .map(|client| ClientEntry {
            client_url: client.url.clone(),
            client_alias: client.alias.clone(),
            devices: client
                .devices
                .iter()
                .map(|(name, device)| {
                    let (value, last_set_value, last_update_time) = device.table_fields();
                    DeviceEntry { name: name.clone(), value, last_set_value, last_update_time }
                })
                .collect(),
        })
        .collect()
}

/// Diff the cached table against live device state, updating the cache in
/// place and returning the changed rows in table order.
fn diff_table(
    table: &mut StateTable,
    devices: &BTreeMap<String, Arc<Device>>,
) -> Vec<FieldUpdate> {
    let mut updates = Vec::new();

    for client_entry in table.iter_mut() {
        for entry in client_entry.devices.iter_mut() {
            let Some(device) = devices.get(&entry.name) else {
                continue;
            };
            let (value, last_set_value, last_update_time) = device.table_fields();
            if entry.value != value
                || entry.last_set_value != last_set_value
                || entry.last_update_time != last_update_time
            {
                entry.value = value.clone();
                entry.last_set_value = last_set_value.clone();
                entry.last_update_time = last_update_time;
                updates.push(FieldUpdate {
                    device: entry.name.clone(),
                    value,
                    last_set_value,
                    last_update_time,
                });
            }
        }
    }

    updates
}

#[cfg(test)]
#[path = "snapshot_tests.rs"]
mod tests;
