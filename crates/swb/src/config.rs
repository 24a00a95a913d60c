// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Typed, validated configuration store.
//!
//! Keys are a closed enumeration; every mutation is validated with a
//! human-readable reason, persisted back to the JSON file (when one is
//! loaded), and broadcast to subscribers so the ctrl stream can push
//! `update_config` frames. No filesystem semantics leak past this module.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::info;

use crate::error::{engine_bail, EngineResult};

/// Default tick period, in effect until the config says otherwise.
pub const DEFAULT_POLL_PERIOD: &str = "1.0";

// -- Typed config data --------------------------------------------------------

/// One entry in the `clients` map.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientConfig {
    pub url: String,
    /// Per-client poll period in seconds; absent means "poll every tick".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub poll_period: Option<f64>,
}

/// One entry in the `modules` map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModuleState {
    Enabled,
    Disabled,
}

/// One entry in the `apps` map.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    /// The literal launch command, arguments populated.
    pub command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_alias: Option<String>,
}

/// The whole configuration; also the on-disk JSON shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigData {
    /// Stringified positive float, > 0.1 seconds.
    pub poll_period: String,
    pub clients: BTreeMap<String, ClientConfig>,
    pub modules: BTreeMap<String, ModuleState>,
    /// Absent until a port is chosen (CLI flag, config, or OS-allocated).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ws_port: Option<u16>,
    pub apps: BTreeMap<String, AppConfig>,
    pub running: bool,
    pub logging: Value,
}

impl Default for ConfigData {
    fn default() -> Self {
        Self {
            poll_period: DEFAULT_POLL_PERIOD.to_owned(),
            clients: BTreeMap::new(),
            modules: BTreeMap::new(),
            ws_port: None,
            apps: BTreeMap::new(),
            running: false,
            logging: Value::Object(Default::default()),
        }
    }
}

// -- Keys ---------------------------------------------------------------------

/// The closed set of configuration keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigKey {
    PollPeriod,
    Clients,
    Modules,
    WsPort,
    Apps,
    Running,
    Logging,
}

impl ConfigKey {
    pub const ALL: [ConfigKey; 7] = [
        ConfigKey::PollPeriod,
        ConfigKey::Clients,
        ConfigKey::Modules,
        ConfigKey::WsPort,
        ConfigKey::Apps,
        ConfigKey::Running,
        ConfigKey::Logging,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ConfigKey::PollPeriod => "poll_period",
            ConfigKey::Clients => "clients",
            ConfigKey::Modules => "modules",
            ConfigKey::WsPort => "ws_port",
            ConfigKey::Apps => "apps",
            ConfigKey::Running => "running",
            ConfigKey::Logging => "logging",
        }
    }

    pub fn parse(name: &str) -> Option<ConfigKey> {
        Self::ALL.into_iter().find(|k| k.as_str() == name)
    }

    /// Validate a candidate value for this key, with a display-ready reason
    /// on rejection.
    fn validate(self, value: &Value) -> EngineResult<()> {
        match self {
            ConfigKey::PollPeriod => {
                let ok = value
                    .as_str()
                    .and_then(|s| s.parse::<f64>().ok())
                    .is_some_and(|p| p > 0.1);
                if !ok {
                    engine_bail!(
                        "Invalid value {value} for config option \"poll_period\": must be a stringified float > 0.1"
                    );
                }
            }
            ConfigKey::Clients => {
                require_map::<ClientConfig>(self, value)?;
            }
            ConfigKey::Modules => {
                require_map::<ModuleState>(self, value)?;
            }
            ConfigKey::WsPort => {
                let ok = value.as_u64().is_some_and(|p| p > 0 && p < 65536);
                if !ok {
                    engine_bail!(
                        "Invalid value {value} for config option \"ws_port\": must be an integer > 0 and < 65536"
                    );
                }
            }
            ConfigKey::Apps => {
                require_map::<AppConfig>(self, value)?;
            }
            ConfigKey::Running => {
                if !value.is_boolean() {
                    engine_bail!(
                        "Invalid value {value} for config option \"running\": must be a boolean"
                    );
                }
            }
            ConfigKey::Logging => {
                if !value.is_object() {
                    engine_bail!(
                        "Invalid value {value} for config option \"logging\": must be an object"
                    );
                }
            }
        }
        Ok(())
    }
}

fn require_map<T: serde::de::DeserializeOwned>(key: ConfigKey, value: &Value) -> EngineResult<()> {
    if !value.is_object() {
        engine_bail!(
            "Invalid value for config option \"{}\": must be an object",
            key.as_str()
        );
    }
    if let Err(e) = serde_json::from_value::<BTreeMap<String, T>>(value.clone()) {
        engine_bail!("Invalid value for config option \"{}\": {e}", key.as_str());
    }
    Ok(())
}

// -- Store --------------------------------------------------------------------

struct Inner {
    data: ConfigData,
    path: Option<PathBuf>,
}

/// The configuration store. Mutations validate, persist, and notify.
pub struct ConfigStore {
    inner: Mutex<Inner>,
    tx: broadcast::Sender<Value>,
}

impl Default for ConfigStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigStore {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(16);
        Self { inner: Mutex::new(Inner { data: ConfigData::default(), path: None }), tx }
    }

    /// Subscribe to config-change notifications. Every successful mutation
    /// broadcasts the full config as JSON.
    pub fn subscribe(&self) -> broadcast::Receiver<Value> {
        self.tx.subscribe()
    }

    /// Load the JSON config file. A missing file is created with the
    /// defaults; an existing file has every key checked for presence, type,
    /// and value predicate before any of it is adopted.
    pub fn load(&self, path: &Path) -> anyhow::Result<()> {
        if !path.exists() {
            let mut inner = self.inner.lock();
            inner.path = Some(path.to_owned());
            save_locked(&inner)?;
            return Ok(());
        }

        let contents = std::fs::read_to_string(path)?;
        let raw: Value = serde_json::from_str(&contents)?;

        for key in ConfigKey::ALL {
            // ws_port is optional: it is only written once a port is chosen.
            let Some(value) = raw.get(key.as_str()) else {
                if key == ConfigKey::WsPort {
                    continue;
                }
                anyhow::bail!("Config parameter \"{}\" not in config file", key.as_str());
            };
            key.validate(value)?;
        }

        let data: ConfigData = serde_json::from_value(raw)?;
        let mut inner = self.inner.lock();
        inner.data = data;
        inner.path = Some(path.to_owned());
        Ok(())
    }

    /// JSON view of one key.
    pub fn get(&self, key: ConfigKey) -> Value {
        let json = self.snapshot_json();
        json.get(key.as_str()).cloned().unwrap_or(Value::Null)
    }

    /// The full config as JSON (the `update_config` payload).
    pub fn snapshot_json(&self) -> Value {
        serde_json::to_value(&self.inner.lock().data).unwrap_or(Value::Null)
    }

    pub fn data(&self) -> ConfigData {
        self.inner.lock().data.clone()
    }

    /// Set one key from a JSON value; validated, persisted, broadcast.
    pub fn set(&self, key: ConfigKey, value: Value) -> EngineResult<()> {
        key.validate(&value)?;
        info!(key = key.as_str(), %value, "setting config value");

        let mut inner = self.inner.lock();
        let data = serde_json::to_value(&inner.data).unwrap_or_default();
        let mut map = match data {
            Value::Object(map) => map,
            _ => Default::default(),
        };
        map.insert(key.as_str().to_owned(), value);
        match serde_json::from_value::<ConfigData>(Value::Object(map)) {
            Ok(data) => inner.data = data,
            Err(e) => engine_bail!("Invalid value for config option \"{}\": {e}", key.as_str()),
        }
        self.commit(inner);
        Ok(())
    }

    pub fn poll_period(&self) -> f64 {
        self.inner
            .lock()
            .data
            .poll_period
            .parse::<f64>()
            .unwrap_or(1.0)
    }

    pub fn ws_port(&self) -> Option<u16> {
        self.inner.lock().data.ws_port
    }

    pub fn set_ws_port(&self, port: u16) {
        let mut inner = self.inner.lock();
        inner.data.ws_port = Some(port);
        self.commit(inner);
    }

    pub fn running(&self) -> bool {
        self.inner.lock().data.running
    }

    pub fn set_running(&self, running: bool) {
        let mut inner = self.inner.lock();
        inner.data.running = running;
        self.commit(inner);
    }

    pub fn add_client(&self, alias: &str, url: &str, poll_period: Option<f64>) {
        let mut inner = self.inner.lock();
        inner
            .data
            .clients
            .insert(alias.to_owned(), ClientConfig { url: url.to_owned(), poll_period });
        self.commit(inner);
    }

    pub fn remove_client(&self, alias: &str) {
        let mut inner = self.inner.lock();
        if inner.data.clients.remove(alias).is_some() {
            self.commit(inner);
        }
    }

    pub fn add_module(&self, module: &str) {
        let mut inner = self.inner.lock();
        inner.data.modules.insert(module.to_owned(), ModuleState::Enabled);
        self.commit(inner);
    }

    pub fn remove_module(&self, module: &str) {
        let mut inner = self.inner.lock();
        inner.data.modules.remove(module);
        self.commit(inner);
    }

    pub fn enable_module(&self, module: &str) {
        let mut inner = self.inner.lock();
        inner.data.modules.insert(module.to_owned(), ModuleState::Enabled);
        self.commit(inner);
    }

    pub fn disable_module(&self, module: &str) {
        let mut inner = self.inner.lock();
        inner.data.modules.insert(module.to_owned(), ModuleState::Disabled);
        self.commit(inner);
    }

    pub fn add_app(&self, name: &str, app: AppConfig) {
        let mut inner = self.inner.lock();
        inner.data.apps.insert(name.to_owned(), app);
        self.commit(inner);
    }

    pub fn remove_app(&self, name: &str) {
        let mut inner = self.inner.lock();
        if inner.data.apps.remove(name).is_some() {
            self.commit(inner);
        }
    }

    /// Persist and notify after a successful mutation. Consumes the guard so
    /// the broadcast happens with the lock already released.
    fn commit(&self, inner: parking_lot::MutexGuard<'_, Inner>) {
        if let Err(e) = save_locked(&inner) {
            tracing::warn!(err = %e, "failed to persist config");
        }
        let snapshot = serde_json::to_value(&inner.data).unwrap_or(Value::Null);
        drop(inner);
        let _ = self.tx.send(snapshot);
    }
}

fn save_locked(inner: &Inner) -> anyhow::Result<()> {
    if let Some(ref path) = inner.path {
        let contents = serde_json::to_string_pretty(&inner.data)?;
        std::fs::write(path, contents)?;
    }
    Ok(())
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
