//! Devices driven by application handlers.
//!
//! The broker core never looks inside a device; handlers translate
//! messages into calls on these traits.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use crate::dispatcher::Dispatcher;
use crate::error::HandlerError;

/// Name of the signal a DESD keeps its stored energy under.
const STORAGE_SIGNAL: &str = "storage";

/// Message type that steps a local DESD.
pub const DESD_STEP: &str = "desd.step";

/// Payload of a `desd.step` message.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StepRequest {
    pub step: f64,
}

pub trait Device: Send + Sync {
    fn id(&self) -> &str;
    fn kind(&self) -> &'static str;
}

/// A device with one numeric setting that can be nudged.
pub trait AdjustableDevice: Device {
    fn value(&self) -> f64;

    fn adjust(&self, delta: f64);

    /// Adjust by one unit.
    fn step(&self) {
        self.adjust(1.0);
    }
}

/// Named signal values backing a device.
#[derive(Debug, Default)]
pub(crate) struct SignalTable {
    values: Mutex<HashMap<String, f64>>,
}

impl SignalTable {
    /// Unset signals read as 0.
    pub(crate) fn get(&self, signal: &str) -> f64 {
        self.values
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(signal)
            .copied()
            .unwrap_or(0.0)
    }

    pub(crate) fn set(&self, signal: &str, value: f64) {
        self.values
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(signal.to_string(), value);
    }

    /// Read-modify-write under one lock; returns the new value.
    pub(crate) fn add(&self, signal: &str, delta: f64) -> f64 {
        let mut values = self.values.lock().unwrap_or_else(|e| e.into_inner());
        let slot = values.entry(signal.to_string()).or_insert(0.0);
        *slot += delta;
        *slot
    }
}

/// Distributed energy storage device.
///
/// Only the storage level is public; the raw signal table is not.
#[derive(Debug)]
pub struct Desd {
    id: String,
    signals: SignalTable,
}

impl Desd {
    pub fn new(id: impl Into<String>) -> Self {
        Self::with_storage(id, 0.0)
    }

    pub fn with_storage(id: impl Into<String>, storage: f64) -> Self {
        let signals = SignalTable::default();
        signals.set(STORAGE_SIGNAL, storage);
        Self {
            id: id.into(),
            signals,
        }
    }

    pub fn storage(&self) -> f64 {
        self.signals.get(STORAGE_SIGNAL)
    }

    /// Increase stored energy by `step` (negative to discharge).
    pub fn step_storage(&self, step: f64) {
        let storage = self.signals.add(STORAGE_SIGNAL, step);
        tracing::debug!(device = %self.id, step, storage, "desd: storage stepped");
    }
}

impl Device for Desd {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> &'static str {
        "desd"
    }
}

impl AdjustableDevice for Desd {
    fn value(&self) -> f64 {
        self.storage()
    }

    fn adjust(&self, delta: f64) {
        self.step_storage(delta);
    }
}

/// Route inbound `desd.step` messages to `desd`.
pub fn register_desd_handler(dispatcher: &Dispatcher, desd: Arc<Desd>) {
    dispatcher.register_read_handler(DESD_STEP, move |message, _| {
        let request: StepRequest = message.decode_json()?;
        if !request.step.is_finite() {
            return Err(HandlerError::failed(format!(
                "non-finite step {}",
                request.step
            )));
        }
        desd.step_storage(request.step);
        Ok(())
    });
}
