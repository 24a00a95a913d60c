// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Device model: named I/O points with direction suffixes, the signal
//! handles modules see, and the pending-set queue that carries writes to
//! remote clients out of module evaluation.

use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;

use swb_proto::{epoch_ms, DeviceInfo};

use crate::error::{engine_bail, EngineResult};

// -- Suffix grammar -----------------------------------------------------------

/// Direction suffix of a device name: `<alias>.<local>(.<local>)*.<suffix>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Suffix {
    /// `.i` — readable only.
    Input,
    /// `.o` — writable only.
    Output,
    /// `.io` — readable and writable.
    InputOutput,
    /// `.s` — engine-internal signal, readable and writable in-process.
    Signal,
}

impl Suffix {
    /// Parse the suffix off a device name. `None` when the name has no dot
    /// or the trailing token is not a valid suffix.
    pub fn of(name: &str) -> Option<Suffix> {
        match name.rsplit_once('.')?.1 {
            "i" => Some(Suffix::Input),
            "o" => Some(Suffix::Output),
            "io" => Some(Suffix::InputOutput),
            "s" => Some(Suffix::Signal),
            _ => None,
        }
    }

    pub fn is_input(self) -> bool {
        matches!(self, Suffix::Input | Suffix::InputOutput | Suffix::Signal)
    }

    pub fn is_output(self) -> bool {
        matches!(self, Suffix::Output | Suffix::InputOutput | Suffix::Signal)
    }
}

// -- Pending sets -------------------------------------------------------------

/// A write destined for a remote client, recorded during module evaluation
/// and flushed by the engine after the module pass of the tick.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingSet {
    pub client_url: String,
    /// Global device name (for logging).
    pub device: String,
    /// Name as the remote client knows it (alias prefix stripped).
    pub local_name: String,
    pub value: Value,
}

/// Queue of writes awaiting flush. Module bodies are synchronous; their
/// output writes land here and the engine issues the HTTP PUTs afterwards,
/// still within the same tick.
#[derive(Debug, Default)]
pub struct SetQueue {
    pending: Mutex<Vec<PendingSet>>,
}

impl SetQueue {
    pub fn push(&self, set: PendingSet) {
        self.pending.lock().push(set);
    }

    pub fn drain(&self) -> Vec<PendingSet> {
        std::mem::take(&mut self.pending.lock())
    }
}

// -- Device -------------------------------------------------------------------

#[derive(Debug)]
enum Backend {
    /// In-process signal device: writes land directly on `value`.
    Signal,
    /// Device owned by a remote client: writes are queued as PUTs.
    Remote { client_url: String, queue: Arc<SetQueue> },
}

#[derive(Debug, Default)]
struct DeviceState {
    value: Value,
    previous_value: Value,
    last_set_value: Value,
    last_update_time: u64,
    error: Option<String>,
    /// Module currently claiming this device as an output.
    driven_by: Option<String>,
}

/// A named I/O point. The name and direction are immutable once created;
/// all mutable state sits behind a small lock so signal handles can be
/// cheap clones of `Arc<Device>`.
#[derive(Debug)]
pub struct Device {
    name: String,
    suffix: Suffix,
    backend: Backend,
    state: Mutex<DeviceState>,
}

impl Device {
    /// Create an engine-internal signal device. The name must end in `.s`.
    pub fn new_signal(name: &str) -> EngineResult<Arc<Device>> {
        match Suffix::of(name) {
            Some(Suffix::Signal) => {}
            _ => engine_bail!(
                "Invalid device suffix for \"{name}\": internal signals must end in \".s\""
            ),
        }

        Ok(Arc::new(Device {
            name: name.to_owned(),
            suffix: Suffix::Signal,
            backend: Backend::Signal,
            state: Mutex::new(DeviceState { last_update_time: epoch_ms(), ..Default::default() }),
        }))
    }

    /// Create a device backed by a remote client. `name` is the global name
    /// (alias prefix already applied); `info` is the catalogue entry the
    /// client published. Fails when the suffix contradicts the advertised
    /// readable/writeable flags.
    pub fn new_remote(
        name: &str,
        info: &DeviceInfo,
        client_url: &str,
        queue: Arc<SetQueue>,
    ) -> EngineResult<Arc<Device>> {
        let suffix = match Suffix::of(name) {
            Some(s @ (Suffix::Input | Suffix::Output | Suffix::InputOutput)) => s,
            _ => engine_bail!(
                "Invalid suffix for device \"{name}\": remote devices must end in .i, .o or .io"
            ),
        };

        if suffix.is_input() && !info.readable {
            engine_bail!(
                "Invalid device name: \"{name}\" is an input but the client does not list it as readable"
            );
        }
        if suffix.is_output() && !info.writeable {
            engine_bail!(
                "Invalid device name: \"{name}\" is an output but the client does not list it as writeable"
            );
        }

        Ok(Arc::new(Device {
            name: name.to_owned(),
            suffix,
            backend: Backend::Remote { client_url: client_url.to_owned(), queue },
            state: Mutex::new(DeviceState { last_update_time: epoch_ms(), ..Default::default() }),
        }))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Name as the owning client knows it: the global name with the leading
    /// alias token stripped.
    pub fn local_name(&self) -> &str {
        self.name.split_once('.').map(|(_, rest)| rest).unwrap_or(&self.name)
    }

    pub fn suffix(&self) -> Suffix {
        self.suffix
    }

    pub fn is_input(&self) -> bool {
        self.suffix.is_input()
    }

    pub fn is_output(&self) -> bool {
        self.suffix.is_output()
    }

    /// URL of the owning client, `None` for in-process signals.
    pub fn client_url(&self) -> Option<&str> {
        match &self.backend {
            Backend::Remote { client_url, .. } => Some(client_url),
            Backend::Signal => None,
        }
    }

    /// Engine-only path for merging a polled reading: shifts
    /// `previous_value`, installs the new value, stamps the update time.
    pub fn update_value(&self, value: Value) {
        let mut state = self.state.lock();
        state.previous_value = std::mem::replace(&mut state.value, value);
        state.last_update_time = epoch_ms();
    }

    /// Module/external write path. Fails on non-output devices. Stamps
    /// `last_set_value` and the update time, then either applies the value
    /// in-process (signals) or queues a remote PUT.
    pub fn set_value(&self, value: Value) -> EngineResult<()> {
        if !self.is_output() {
            engine_bail!("Cannot set value of \"{}\": not an output device", self.name);
        }

        let mut state = self.state.lock();
        state.last_set_value = value.clone();
        state.last_update_time = epoch_ms();

        match &self.backend {
            Backend::Signal => {
                state.value = value;
            }
            Backend::Remote { client_url, queue } => {
                drop(state);
                queue.push(PendingSet {
                    client_url: client_url.clone(),
                    device: self.name.clone(),
                    local_name: self.local_name().to_owned(),
                    value,
                });
            }
        }
        Ok(())
    }

    pub fn value(&self) -> Value {
        self.state.lock().value.clone()
    }

    pub fn has_changed(&self) -> bool {
        let state = self.state.lock();
        state.value != state.previous_value
    }

    pub fn error(&self) -> Option<String> {
        self.state.lock().error.clone()
    }

    pub fn set_error(&self, message: impl Into<String>) {
        self.state.lock().error = Some(message.into());
    }

    pub fn clear_error(&self) {
        self.state.lock().error = None;
    }

    /// The module currently driving this device, if any.
    pub fn driver(&self) -> Option<String> {
        self.state.lock().driven_by.clone()
    }

    pub fn set_driver(&self, module: &str) {
        self.state.lock().driven_by = Some(module.to_owned());
    }

    /// Release the driver claim if `module` holds it.
    pub fn release_driver(&self, module: &str) {
        let mut state = self.state.lock();
        if state.driven_by.as_deref() == Some(module) {
            state.driven_by = None;
        }
    }

    /// The three fields the state table carries for this device.
    pub fn table_fields(&self) -> (Value, Value, u64) {
        let state = self.state.lock();
        (state.value.clone(), state.last_set_value.clone(), state.last_update_time)
    }
}

// -- Signals ------------------------------------------------------------------

/// Read-only module-facing view of a device.
#[derive(Debug, Clone)]
pub struct InputSignal {
    device: Arc<Device>,
}

impl InputSignal {
    /// Build a read handle; fails on non-readable devices.
    pub fn new(device: Arc<Device>) -> EngineResult<InputSignal> {
        if !device.is_input() {
            engine_bail!("Device \"{}\" is not readable", device.name());
        }
        Ok(InputSignal { device })
    }

    pub fn name(&self) -> &str {
        self.device.name()
    }

    /// Last good value. When `error()` is non-empty the value is stale;
    /// callers decide whether to trust it.
    pub fn value(&self) -> Value {
        self.device.value()
    }

    pub fn has_changed(&self) -> bool {
        self.device.has_changed()
    }

    pub fn error(&self) -> Option<String> {
        self.device.error()
    }
}

/// Write-only module-facing view of a device.
#[derive(Debug, Clone)]
pub struct OutputSignal {
    device: Arc<Device>,
}

impl OutputSignal {
    /// Build a write handle; fails on non-writable devices.
    pub fn new(device: Arc<Device>) -> EngineResult<OutputSignal> {
        if !device.is_output() {
            engine_bail!("Device \"{}\" is not writeable", device.name());
        }
        Ok(OutputSignal { device })
    }

    pub fn name(&self) -> &str {
        self.device.name()
    }

    pub fn set_value(&self, value: Value) -> EngineResult<()> {
        self.device.set_value(value)
    }

    pub fn error(&self) -> Option<String> {
        self.device.error()
    }
}

#[cfg(test)]
#[path = "device_tests.rs"]
mod tests;
