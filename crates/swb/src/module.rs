// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Reactive modules: registered descriptors bound to typed signals,
//! evaluated once per tick with error gating and single-driver enforcement.
//!
//! A module is declared as a [`ModuleDef`] in a [`ModuleLibrary`] before the
//! engine starts. `upsert_module` instantiates the descriptor into a
//! [`Module`] and binds its declared inputs/outputs to live devices; binding
//! is an explicit step with the strong exception guarantee: a failed bind
//! leaves the device table and driver claims untouched.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use indexmap::IndexMap;
use serde_json::Value;
use tracing::{info, warn};

use crate::device::{Device, InputSignal, OutputSignal, Suffix};
use crate::error::{engine_bail, EngineResult};

// -- Body ---------------------------------------------------------------------

/// The signals and statics a module body works against during evaluation.
///
/// Inputs and outputs appear in declaration order. Statics persist across
/// ticks and rebinds for the lifetime of the registration.
pub struct ModuleIo {
    inputs: Vec<InputSignal>,
    outputs: Vec<OutputSignal>,
    statics: BTreeMap<String, Value>,
}

impl ModuleIo {
    pub fn input(&self, index: usize) -> Option<&InputSignal> {
        self.inputs.get(index)
    }

    pub fn output(&self, index: usize) -> Option<&OutputSignal> {
        self.outputs.get(index)
    }

    pub fn inputs(&self) -> &[InputSignal] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[OutputSignal] {
        &self.outputs
    }

    pub fn static_value(&self, name: &str) -> Option<&Value> {
        self.statics.get(name)
    }

    pub fn set_static(&mut self, name: &str, value: Value) {
        self.statics.insert(name.to_owned(), value);
    }
}

/// A module body. Free-function modules are closures over no state (their
/// mutable state lives in the statics); method modules are structs carrying
/// per-registration state.
pub trait ModuleBody: Send {
    fn evaluate(&mut self, io: &mut ModuleIo) -> anyhow::Result<()>;
}

impl<F> ModuleBody for F
where
    F: FnMut(&mut ModuleIo) -> anyhow::Result<()> + Send,
{
    fn evaluate(&mut self, io: &mut ModuleIo) -> anyhow::Result<()> {
        self(io)
    }
}

type BodyFactory = Arc<dyn Fn() -> Box<dyn ModuleBody> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BodyKind {
    Function,
    Method,
}

// -- Descriptor ---------------------------------------------------------------

/// A registered module descriptor: declared I/O, optional statics, and a
/// factory producing the body. Upserting a reference instantiates a fresh
/// body (the compiled analogue of re-import on upsert).
#[derive(Clone)]
pub struct ModuleDef {
    inputs: Vec<String>,
    /// Output name → optional error-value driven (once) when an upstream
    /// error is first detected.
    outputs: IndexMap<String, Option<Value>>,
    static_variables: BTreeMap<String, Value>,
    evaluate_if_error: bool,
    kind: BodyKind,
    factory: BodyFactory,
}

impl ModuleDef {
    /// Descriptor for a free-function module.
    pub fn function<F>(body: F) -> Self
    where
        F: Fn() -> Box<dyn ModuleBody> + Send + Sync + 'static,
    {
        Self {
            inputs: Vec::new(),
            outputs: IndexMap::new(),
            static_variables: BTreeMap::new(),
            evaluate_if_error: false,
            kind: BodyKind::Function,
            factory: Arc::new(body),
        }
    }

    /// Descriptor for a method module (a stateful body struct). Statics are
    /// forbidden on these; the struct carries its own state.
    pub fn method<F>(body: F) -> Self
    where
        F: Fn() -> Box<dyn ModuleBody> + Send + Sync + 'static,
    {
        Self { kind: BodyKind::Method, ..Self::function(body) }
    }

    pub fn with_inputs<I, S>(mut self, inputs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.inputs = inputs.into_iter().map(Into::into).collect();
        self
    }

    /// Declare outputs without error-values.
    pub fn with_outputs<I, S>(mut self, outputs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.outputs = outputs.into_iter().map(|n| (n.into(), None)).collect();
        self
    }

    /// Declare outputs with optional error-values.
    pub fn with_output_error_values<I, S>(mut self, outputs: I) -> Self
    where
        I: IntoIterator<Item = (S, Option<Value>)>,
        S: Into<String>,
    {
        self.outputs = outputs.into_iter().map(|(n, v)| (n.into(), v)).collect();
        self
    }

    pub fn with_statics<I, S>(mut self, statics: I) -> Self
    where
        I: IntoIterator<Item = (S, Value)>,
        S: Into<String>,
    {
        self.static_variables = statics.into_iter().map(|(n, v)| (n.into(), v)).collect();
        self
    }

    pub fn evaluate_if_error(mut self, evaluate: bool) -> Self {
        self.evaluate_if_error = evaluate;
        self
    }
}

/// The set of module descriptors known to this binary, keyed by the
/// reference used in config files and `addmodule` commands.
#[derive(Default, Clone)]
pub struct ModuleLibrary {
    defs: HashMap<String, ModuleDef>,
}

impl ModuleLibrary {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a descriptor. Enforces the decoration-time constraints:
    /// unique reference, no statics on method modules.
    pub fn register(&mut self, reference: &str, def: ModuleDef) -> EngineResult<()> {
        if def.kind == BodyKind::Method && !def.static_variables.is_empty() {
            engine_bail!(
                "Static variables are not permitted for module \"{reference}\": method modules carry their own state"
            );
        }
        if self.defs.contains_key(reference) {
            engine_bail!("Module \"{reference}\" is already registered");
        }
        self.defs.insert(reference.to_owned(), def);
        Ok(())
    }

    pub fn resolve(&self, reference: &str) -> Option<&ModuleDef> {
        self.defs.get(reference)
    }
}

// -- Bound module -------------------------------------------------------------

struct Bound {
    io: ModuleIo,
    /// (output index, error value) pairs driven once when an upstream error
    /// is first detected.
    error_sets: Vec<(usize, Value)>,
}

/// A registered, instantiated module.
pub struct Module {
    name: String,
    inputs: Vec<String>,
    outputs: IndexMap<String, Option<Value>>,
    statics_init: BTreeMap<String, Value>,
    evaluate_if_error: bool,
    body: Box<dyn ModuleBody>,
    pub enabled: bool,
    /// Current blocking error (device cascade or body failure), if any.
    error: Option<String>,
    /// The error came from the body, not from a device.
    runtime_fault: bool,
    /// Error-values have been driven for the current error episode.
    latched: bool,
    bound: Option<Bound>,
}

impl Module {
    /// Instantiate a descriptor. Binding happens separately.
    pub fn instantiate(name: &str, def: &ModuleDef, enabled: bool) -> Self {
        Self {
            name: name.to_owned(),
            inputs: def.inputs.clone(),
            outputs: def.outputs.clone(),
            statics_init: def.static_variables.clone(),
            evaluate_if_error: def.evaluate_if_error,
            body: (def.factory)(),
            enabled,
            error: None,
            runtime_fault: false,
            latched: false,
            bound: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn is_bound(&self) -> bool {
        self.bound.is_some()
    }

    /// Every device name this module touches, inputs then outputs.
    pub fn io_names(&self) -> impl Iterator<Item = &str> {
        self.inputs.iter().map(String::as_str).chain(self.outputs.keys().map(String::as_str))
    }

    /// Bind declared inputs/outputs against the device table.
    ///
    /// Missing `.s` names are auto-created as in-process signal devices; any
    /// other missing name fails. Inputs must be readable, outputs writable
    /// and not driven by another module. Neither the device table nor any
    /// driver claim is mutated unless every check passes.
    pub fn bind(&mut self, devices: &mut BTreeMap<String, Arc<Device>>) -> EngineResult<()> {
        match self.try_bind(devices) {
            Ok(()) => {
                self.error = None;
                self.runtime_fault = false;
                self.latched = false;
                Ok(())
            }
            Err(e) => {
                self.bound = None;
                self.error = Some(e.message().to_owned());
                Err(e)
            }
        }
    }

    fn try_bind(&mut self, devices: &mut BTreeMap<String, Arc<Device>>) -> EngineResult<()> {
        let mut staged: BTreeMap<String, Arc<Device>> = BTreeMap::new();

        let resolve = |name: &str, staged: &mut BTreeMap<String, Arc<Device>>| {
            if let Some(dev) = devices.get(name).or_else(|| staged.get(name)) {
                return Ok(Arc::clone(dev));
            }
            if Suffix::of(name) == Some(Suffix::Signal) {
                info!(signal = name, module = %self.name, "creating internal signal device");
                let dev = Device::new_signal(name)?;
                staged.insert(name.to_owned(), Arc::clone(&dev));
                return Ok(dev);
            }
            engine_bail!("Unknown io device \"{name}\" declared by module {}", self.name)
        };

        let mut input_devices = Vec::with_capacity(self.inputs.len());
        for input in &self.inputs {
            let dev = resolve(input, &mut staged)?;
            if !dev.is_input() {
                engine_bail!(
                    "Cannot use {input} as an input to module {}: the device isn't readable",
                    self.name
                );
            }
            input_devices.push(dev);
        }

        let mut output_devices = Vec::with_capacity(self.outputs.len());
        for output in self.outputs.keys() {
            let dev = resolve(output, &mut staged)?;
            if !dev.is_output() {
                engine_bail!(
                    "Cannot use {output} as an output to module {}: the device isn't writeable",
                    self.name
                );
            }
            if let Some(driver) = dev.driver() {
                if driver != self.name {
                    engine_bail!(
                        "Cannot drive device {output} with module {}: it is already being driven by module {driver}",
                        self.name
                    );
                }
            }
            output_devices.push(dev);
        }

        // All checks passed; commit. Auto-created signals join the table,
        // driver claims are recorded, and the argument vector materialises.
        devices.extend(staged);

        let inputs = input_devices
            .into_iter()
            .map(InputSignal::new)
            .collect::<EngineResult<Vec<_>>>()?;
        let outputs = output_devices
            .iter()
            .map(|dev| {
                dev.set_driver(&self.name);
                OutputSignal::new(Arc::clone(dev))
            })
            .collect::<EngineResult<Vec<_>>>()?;

        // Statics survive rebinds; a fresh bind seeds them from the declared
        // initial values.
        let statics = match self.bound.take() {
            Some(old) => old.io.statics,
            None => self.statics_init.clone(),
        };

        let error_sets = if self.evaluate_if_error {
            Vec::new()
        } else {
            self.outputs
                .values()
                .enumerate()
                .filter_map(|(idx, ev)| ev.clone().map(|v| (idx, v)))
                .collect()
        };

        self.bound = Some(Bound { io: ModuleIo { inputs, outputs, statics }, error_sets });
        Ok(())
    }

    /// Release this module's driver claims. Called when the module is
    /// removed or replaced so its outputs become drivable again.
    pub fn release_claims(&self, devices: &BTreeMap<String, Arc<Device>>) {
        for output in self.outputs.keys() {
            if let Some(dev) = devices.get(output) {
                dev.release_driver(&self.name);
            }
        }
    }

    /// One evaluation pass. Disabled or unbound modules do nothing.
    ///
    /// Unless `evaluate_if_error` is set, the bound signals are scanned for
    /// device errors first: the first error found blocks the body, drives
    /// the declared error-values exactly once per episode, and is recorded
    /// as the module's error until it clears. A body failure is recorded
    /// the same way and suppresses evaluation until the module is
    /// re-enabled or an upstream error cycle clears it.
    pub fn tick(&mut self) {
        if !self.enabled {
            return;
        }
        let Some(bound) = &mut self.bound else {
            return;
        };

        if !self.evaluate_if_error {
            let failed = bound
                .io
                .inputs
                .iter()
                .map(|s| (s.name().to_owned(), s.error()))
                .chain(bound.io.outputs.iter().map(|s| (s.name().to_owned(), s.error())))
                .find_map(|(name, err)| err.map(|e| (name, e)));

            if let Some((device, err)) = failed {
                if self.error.as_deref() != Some(err.as_str()) {
                    warn!(
                        module = %self.name,
                        device = %device,
                        "disabling module due to device error: {err}"
                    );
                }
                if !self.latched {
                    for (idx, value) in &bound.error_sets {
                        if let Some(signal) = bound.io.outputs.get(*idx) {
                            if let Err(e) = signal.set_value(value.clone()) {
                                warn!(module = %self.name, err = %e, "failed to drive error value");
                            }
                        }
                    }
                    self.latched = true;
                }
                self.error = Some(err);
                self.runtime_fault = false;
                return;
            }

            self.latched = false;
            if self.error.is_some() && !self.runtime_fault {
                info!(module = %self.name, "error resolved, re-enabling module");
                self.error = None;
            }
        }

        if self.runtime_fault {
            return;
        }

        if let Err(e) = self.body.evaluate(&mut bound.io) {
            warn!(module = %self.name, "module body failed: {e:#}");
            self.error = Some(format!("{e:#}"));
            self.runtime_fault = true;
        }
    }

    /// Enable evaluation. Clears a recorded body failure; a device-error
    /// block stays until the devices recover.
    pub fn enable(&mut self) {
        self.enabled = true;
        if self.runtime_fault {
            self.error = None;
            self.runtime_fault = false;
        }
        if let Some(ref err) = self.error {
            warn!(module = %self.name, "module enabled but will not run due to error: {err}");
        }
    }

    /// Disable evaluation. Idempotent.
    pub fn disable(&mut self) {
        self.enabled = false;
    }
}

#[cfg(test)]
#[path = "module_tests.rs"]
mod tests;
