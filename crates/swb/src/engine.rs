// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The engine: a fixed-cadence tick loop (poll → evaluate → flush → snapshot)
//! plus the serialised control-plane mutations.
//!
//! One `tokio::sync::Mutex` guards the world (clients, devices, modules),
//! so every mutation is serialised against the tick. The only suspension
//! points inside the lock are bounded HTTP calls to device clients.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use indexmap::IndexMap;
use serde_json::Value;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use swb_proto::DevicesValueReply;

use crate::client::{Client, DeviceClient};
use crate::config::ConfigStore;
use crate::device::{Device, SetQueue};
use crate::error::{engine_bail, EngineError, EngineResult};
use crate::module::{Module, ModuleLibrary};
use crate::snapshot::IoHub;

/// Everything guarded by the engine lock.
#[derive(Default)]
struct World {
    clients: BTreeMap<String, Client>,
    devices: BTreeMap<String, Arc<Device>>,
    /// Registration order is evaluation order.
    modules: IndexMap<String, Module>,
    running: bool,
}

/// Outcome of a client upsert, for command display.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddedClient {
    pub alias: String,
    pub url: String,
    pub devices: Vec<String>,
}

/// A one-line status row for `list`-style consumers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleStatus {
    pub name: String,
    pub enabled: bool,
    pub error: Option<String>,
}

pub struct Engine {
    world: Mutex<World>,
    config: Arc<ConfigStore>,
    hub: Arc<IoHub>,
    library: ModuleLibrary,
    http: reqwest::Client,
    set_queue: Arc<SetQueue>,
}

impl Engine {
    pub fn new(config: Arc<ConfigStore>, hub: Arc<IoHub>, library: ModuleLibrary) -> Self {
        Self {
            world: Mutex::new(World::default()),
            config,
            hub,
            library,
            http: reqwest::Client::new(),
            set_queue: Arc::new(SetQueue::default()),
        }
    }

    // -- Startup --------------------------------------------------------------

    /// Register every client named in the config. Failures are fatal at
    /// startup: a config that names an unreachable or inconsistent client
    /// aborts with a diagnostic.
    pub async fn init_clients(&self) -> anyhow::Result<()> {
        let clients = self.config.data().clients;
        if clients.is_empty() {
            return Ok(());
        }

        info!("initialising switchboard clients");
        for (alias, cc) in clients {
            self.add_client(&cc.url, &alias, cc.poll_period)
                .await
                .map_err(|e| anyhow::anyhow!("Error adding client {alias}({}): {e}", cc.url))?;
        }
        Ok(())
    }

    /// Register every module named in the config, then restore `running`.
    /// Unknown references are fatal at startup.
    pub async fn init_modules(&self) -> anyhow::Result<()> {
        let modules = self.config.data().modules;
        if !modules.is_empty() {
            info!("initialising switchboard modules");
            for (reference, state) in modules {
                let enabled = state == crate::config::ModuleState::Enabled;
                self.upsert_module(&reference, enabled)
                    .await
                    .map_err(|e| anyhow::anyhow!("Error adding module {reference}: {e}"))?;
            }
        }

        self.world.lock().await.running = self.config.running();
        Ok(())
    }

    // -- Tick loop ------------------------------------------------------------

    /// Drive ticks at the configured cadence until shutdown.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let mut prev_cycle = Instant::now();
        loop {
            let period = Duration::from_secs_f64(self.config.poll_period());
            let wait = period.saturating_sub(prev_cycle.elapsed());
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(wait) => {}
            }
            prev_cycle = Instant::now();
            self.tick_once().await;
        }
        debug!("engine loop terminated");
    }

    /// One tick: poll due clients, evaluate modules in registration order,
    /// flush queued output writes, and fold the result into the iodata
    /// stream.
    pub async fn tick_once(&self) {
        let mut world = self.world.lock().await;

        self.update_devices_values(&mut world).await;

        if world.running {
            for module in world.modules.values_mut() {
                module.tick();
            }
        }

        self.flush_pending_sets().await;
        self.hub.take_snapshot(&world.clients, &world.devices);
    }

    async fn update_devices_values(&self, world: &mut World) {
        let due: Vec<String> = world
            .clients
            .values_mut()
            .filter_map(|c| c.do_update().then(|| c.alias.clone()))
            .collect();

        for alias in due {
            let url = match world.clients.get(&alias) {
                Some(c) => c.url.clone(),
                None => continue,
            };
            let reply = DeviceClient::new(self.http.clone(), &url).poll_values().await;

            let Some(client) = world.clients.get_mut(&alias) else {
                continue;
            };
            match reply {
                Err(e) => {
                    client.connected = false;
                    debug!(client = %url, err = %e, "poll failed");
                    client.on_error(&format!("Unable to access client {url}"));
                }
                Ok(DevicesValueReply::Error { error }) => {
                    client.connected = true;
                    client.on_error(&format!("Error for client {url}: {error}"));
                }
                Ok(DevicesValueReply::Devices { devices }) => {
                    client.connected = true;
                    if let Some(reason) = devices
                        .iter()
                        .find(|d| d.value.is_none() && d.error.is_none())
                        .map(|d| {
                            format!(
                                "Error for client {url}: device {} has no value or error field",
                                d.name
                            )
                        })
                    {
                        client.on_error(&reason);
                        continue;
                    }

                    client.on_no_error();
                    for reading in devices {
                        merge_device_reading(client, &alias, reading);
                    }
                }
            }
        }
    }

    /// Drain the pending-set queue and issue the remote PUTs, still within
    /// the tick. Transport failures are logged; the next poll surfaces the
    /// client state.
    async fn flush_pending_sets(&self) {
        for set in self.set_queue.drain() {
            let client = DeviceClient::new(self.http.clone(), &set.client_url);
            match client.set(&set.local_name, &set.value).await {
                Ok(reply) => {
                    if let Some(error) = reply.error {
                        warn!(device = %set.device, "device set rejected: {error}");
                    }
                }
                Err(e) => {
                    warn!(
                        device = %set.device,
                        value = %set.value,
                        "failed to set output value: {e}"
                    );
                }
            }
        }
    }

    // -- Clients --------------------------------------------------------------

    /// Register a new client. Alias and URL must both be unused.
    pub async fn add_client(
        &self,
        url: &str,
        alias: &str,
        poll_period: Option<f64>,
    ) -> EngineResult<AddedClient> {
        let mut world = self.world.lock().await;

        if world.clients.contains_key(alias) {
            engine_bail!("Client with alias \"{alias}\" already exists");
        }
        if let Some(existing) = world.clients.values().find(|c| c.url == url) {
            engine_bail!(
                "Client with URL \"{url}\" already exists with alias {}",
                existing.alias
            );
        }

        info!(alias, url, ?poll_period, "adding client");
        self.upsert_client(&mut world, url, alias, poll_period).await
    }

    /// Re-fetch an existing client's catalogue from its recorded URL and
    /// replace its devices.
    pub async fn update_client(
        &self,
        alias: &str,
        poll_period: Option<f64>,
    ) -> EngineResult<AddedClient> {
        let mut world = self.world.lock().await;

        let Some(client) = world.clients.get(alias) else {
            engine_bail!("Unknown client alias \"{alias}\"");
        };
        let url = client.url.clone();

        info!(alias, url, "updating client");
        self.upsert_client(&mut world, &url, alias, poll_period).await
    }

    /// Insert or replace a client under the strong exception guarantee: the
    /// catalogue fetch, per-client duplicate checks, cross-client uniqueness
    /// checks, and device construction must all succeed before any state is
    /// touched.
    async fn upsert_client(
        &self,
        world: &mut World,
        url: &str,
        alias: &str,
        poll_period: Option<f64>,
    ) -> EngineResult<AddedClient> {
        let info = DeviceClient::new(self.http.clone(), url)
            .poll_info()
            .await
            .map_err(|e| EngineError::new(format!("Unable to connect to {url}/devices_info: {e}")))?;

        let mut new_devices: BTreeMap<String, Arc<Device>> = BTreeMap::new();
        for device_info in &info.devices {
            // The alias prefix keeps identical device names on different
            // clients distinct.
            let name = format!("{alias}.{}", device_info.name);

            if new_devices.contains_key(&name) {
                engine_bail!("Device \"{name}\" exists twice on client {url}");
            }
            if let Some(existing) = world.devices.get(&name) {
                if existing.client_url() != Some(url) {
                    engine_bail!(
                        "Device \"{name}\" already exists for client {}",
                        existing.client_url().unwrap_or("<internal>")
                    );
                }
            }

            let device =
                Device::new_remote(&name, device_info, url, Arc::clone(&self.set_queue))?;
            new_devices.insert(name, device);
        }

        // All checks passed. Replace any previous incarnation of this alias
        // and commit the new devices.
        if world.clients.contains_key(alias) {
            remove_client_locked(world, alias);
        }
        world.devices.extend(new_devices.clone());
        let added = AddedClient {
            alias: alias.to_owned(),
            url: url.to_owned(),
            devices: new_devices.keys().cloned().collect(),
        };
        world
            .clients
            .insert(alias.to_owned(), Client::new(url, alias, new_devices, poll_period));

        // Load initial values, then rebind modules against the new table.
        self.update_devices_values(world).await;
        rebind_modules(world);
        self.hub.reset_table();

        Ok(added)
    }

    /// Remove a client and destroy its devices. Modules using them go into
    /// error state until a later structural change satisfies them again.
    pub async fn remove_client(&self, alias: &str) -> EngineResult<()> {
        let mut world = self.world.lock().await;
        if !world.clients.contains_key(alias) {
            engine_bail!("Unknown client alias \"{alias}\"");
        }

        remove_client_locked(&mut world, alias);
        rebind_modules(&mut world);
        self.hub.reset_table();
        Ok(())
    }

    /// Names of the modules whose declared I/O touches the given client.
    pub async fn modules_using_client(&self, alias: &str) -> EngineResult<Vec<String>> {
        let world = self.world.lock().await;
        let Some(client) = world.clients.get(alias) else {
            engine_bail!("Unknown client alias \"{alias}\"");
        };

        Ok(world
            .modules
            .values()
            .filter(|m| m.io_names().any(|name| client.devices.contains_key(name)))
            .map(|m| m.name().to_owned())
            .collect())
    }

    pub async fn client_aliases(&self) -> Vec<String> {
        self.world.lock().await.clients.keys().cloned().collect()
    }

    pub async fn client_exists(&self, alias: &str) -> bool {
        self.world.lock().await.clients.contains_key(alias)
    }

    /// Poll period of a registered client, `None` for per-tick polling.
    pub async fn client_poll_period(&self, alias: &str) -> Option<f64> {
        self.world.lock().await.clients.get(alias).and_then(|c| c.poll_period)
    }

    // -- Modules --------------------------------------------------------------

    /// Resolve a module reference against the library, instantiate a fresh
    /// body, and bind it. On any binding failure the module is not
    /// registered and the engine state is unchanged.
    pub async fn upsert_module(&self, reference: &str, enabled: bool) -> EngineResult<()> {
        let Some(def) = self.library.resolve(reference) else {
            engine_bail!("Unknown module reference \"{reference}\"");
        };

        info!(module = reference, enabled, "adding module");
        let mut module = Module::instantiate(reference, def, enabled);

        let mut world = self.world.lock().await;
        module.bind(&mut world.devices)?;

        // When replacing an earlier registration, release driver claims on
        // outputs the new binding no longer covers.
        let stale: Vec<String> = world
            .modules
            .get(reference)
            .map(|old| old.io_names().map(str::to_owned).collect())
            .unwrap_or_default();
        let kept: Vec<String> = module.io_names().map(str::to_owned).collect();
        for name in stale {
            if !kept.contains(&name) {
                if let Some(dev) = world.devices.get(&name) {
                    dev.release_driver(reference);
                }
            }
        }

        // `insert` keeps an existing registration's slot, so re-upserting a
        // module does not move it in the evaluation order.
        world.modules.insert(reference.to_owned(), module);
        Ok(())
    }

    pub async fn remove_module(&self, reference: &str) -> EngineResult<()> {
        let mut world = self.world.lock().await;
        let Some(module) = world.modules.shift_remove(reference) else {
            engine_bail!("Unknown module \"{reference}\"");
        };
        module.release_claims(&world.devices);
        info!(module = reference, "removed module");
        Ok(())
    }

    pub async fn enable_module(&self, reference: &str) -> EngineResult<()> {
        let mut world = self.world.lock().await;
        match world.modules.get_mut(reference) {
            Some(module) => {
                module.enable();
                Ok(())
            }
            None => Err(EngineError::new(format!("Unknown module \"{reference}\""))),
        }
    }

    pub async fn disable_module(&self, reference: &str) -> EngineResult<()> {
        let mut world = self.world.lock().await;
        match world.modules.get_mut(reference) {
            Some(module) => {
                module.disable();
                Ok(())
            }
            None => Err(EngineError::new(format!("Unknown module \"{reference}\""))),
        }
    }

    pub async fn module_exists(&self, reference: &str) -> bool {
        self.world.lock().await.modules.contains_key(reference)
    }

    pub async fn module_statuses(&self) -> Vec<ModuleStatus> {
        let world = self.world.lock().await;
        world
            .modules
            .values()
            .map(|m| ModuleStatus {
                name: m.name().to_owned(),
                enabled: m.enabled,
                error: m.error().map(str::to_owned),
            })
            .collect()
    }

    // -- Devices --------------------------------------------------------------

    /// External write to a single output device. The remote PUT is issued
    /// before this returns.
    pub async fn set_device(&self, name: &str, value: Value) -> EngineResult<()> {
        let world = self.world.lock().await;
        let Some(device) = world.devices.get(name) else {
            engine_bail!("Unknown device \"{name}\"");
        };
        device.set_value(value)?;
        drop(world);

        self.flush_pending_sets().await;
        Ok(())
    }

    pub async fn device_exists(&self, name: &str) -> bool {
        self.world.lock().await.devices.contains_key(name)
    }

    // -- Running flag ----------------------------------------------------------

    pub async fn running(&self) -> bool {
        self.world.lock().await.running
    }

    pub async fn set_running(&self, running: bool) {
        self.world.lock().await.running = running;
    }
}

/// Drop a client and every device it owns. Caller rebinds modules and
/// resets the table afterwards.
fn remove_client_locked(world: &mut World, alias: &str) {
    if let Some(client) = world.clients.remove(alias) {
        for name in client.devices.keys() {
            world.devices.remove(name);
        }
    }
}

/// Re-bind every registered module after a structural change. A module
/// whose bindings became unsatisfiable keeps its registration and waits in
/// error state; the transition is logged by `bind`.
fn rebind_modules(world: &mut World) {
    for module in world.modules.values_mut() {
        if let Err(e) = module.bind(&mut world.devices) {
            warn!(module = %module.name(), "module unbound after structural change: {e}");
        }
    }
}

fn merge_device_reading(client: &mut Client, alias: &str, reading: swb_proto::DeviceReading) {
    let global = format!("{alias}.{}", reading.name);
    let Some(device) = client.devices.get(&global) else {
        debug!(device = %global, "reading for unknown device ignored");
        return;
    };

    if let Some(error) = reading.error {
        if device.error().is_none() {
            warn!(device = %global, "device has reported an error: {error}");
        }
        device.set_error(error);
    } else if let Some(value) = reading.value {
        if device.error().is_some() {
            warn!(device = %global, "device no longer reporting error");
            device.clear_error();
        }
        device.update_value(value);
    }
}

#[cfg(test)]
#[path = "engine_tests.rs"]
mod tests;
