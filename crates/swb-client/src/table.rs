// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Observer-side mirror of the canonical state table, with alias and
//! device-name lookups kept in step with resets and diffs.

use std::collections::HashMap;

use swb_proto::{ClientEntry, DeviceEntry, FieldUpdate, StateTable};

#[derive(Debug, Default)]
pub struct TableMirror {
    table: StateTable,
    /// alias → index into `table`
    clients: HashMap<String, usize>,
    /// device name → (client index, device index)
    devices: HashMap<String, (usize, usize)>,
}

impl TableMirror {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a freshly received table, sorting it into canonical order
    /// and rebuilding the lookup maps.
    pub fn reset(&mut self, mut table: StateTable) {
        table.sort_by(|a, b| a.client_alias.cmp(&b.client_alias));
        for client in table.iter_mut() {
            client.devices.sort_by(|a, b| a.name.cmp(&b.name));
        }

        self.clients.clear();
        self.devices.clear();
        for (ci, client) in table.iter().enumerate() {
            self.clients.insert(client.client_alias.clone(), ci);
            for (di, device) in client.devices.iter().enumerate() {
                self.devices.insert(device.name.clone(), (ci, di));
            }
        }
        self.table = table;
    }

    /// Apply an `update_fields` diff. Unknown device names are ignored;
    /// they belong to a table revision this mirror never saw.
    pub fn apply(&mut self, updates: &[FieldUpdate]) {
        for update in updates {
            let Some(&(ci, di)) = self.devices.get(&update.device) else {
                continue;
            };
            if let Some(entry) =
                self.table.get_mut(ci).and_then(|c| c.devices.get_mut(di))
            {
                entry.value = update.value.clone();
                entry.last_set_value = update.last_set_value.clone();
                entry.last_update_time = update.last_update_time;
            }
        }
    }

    /// Drop everything (used on disconnect).
    pub fn clear(&mut self) {
        self.table.clear();
        self.clients.clear();
        self.devices.clear();
    }

    pub fn table(&self) -> &StateTable {
        &self.table
    }

    pub fn client(&self, alias: &str) -> Option<&ClientEntry> {
        self.clients.get(alias).and_then(|&ci| self.table.get(ci))
    }

    pub fn device(&self, name: &str) -> Option<&DeviceEntry> {
        self.devices
            .get(name)
            .and_then(|&(ci, di)| self.table.get(ci).and_then(|c| c.devices.get(di)))
    }

    pub fn device_names(&self) -> impl Iterator<Item = &str> {
        self.devices.keys().map(String::as_str)
    }
}

#[cfg(test)]
#[path = "table_tests.rs"]
mod tests;
