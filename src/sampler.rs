//! The sampler clock.
//!
//! A single scheduler clock drives every registered device. Each tick
//! is identified by the current unix second, so sampling periods stay
//! aligned across gateway restarts. Devices share no mutable state;
//! their refreshes run concurrently, and a per-device mutex serializes
//! structural edits against the refresh cycle.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::future::join_all;
use tokio::sync::{watch, Mutex};
use tokio::time::MissedTickBehavior;

use crate::core::error::{GatewayError, Result};
use crate::device::Device;

pub use crate::core::tick::{is_due, tick_id_from_period};

/// Shared handle to one registered device.
///
/// Hosts lock it for structural edits; the sampler locks it for the
/// refresh cycle. The mutex is the serialization point required
/// between the two.
pub type DeviceHandle = Arc<Mutex<Device>>;

/// Current tick number: seconds since the unix epoch.
pub fn current_tick() -> u64 {
    Utc::now().timestamp().max(0) as u64
}

/// Tick-driven scheduler over a set of devices.
pub struct Sampler {
    devices: HashMap<String, DeviceHandle>,
    base_period: Duration,
}

impl Sampler {
    /// Create a sampler with the default one-second base resolution.
    pub fn new() -> Self {
        Self::with_base_period(Duration::from_secs(1))
    }

    /// Create a sampler with an explicit base resolution.
    pub fn with_base_period(base_period: Duration) -> Self {
        Self {
            devices: HashMap::new(),
            base_period,
        }
    }

    /// Register a device and return its shared handle.
    pub fn add_device(&mut self, device: Device) -> Result<DeviceHandle> {
        let id = device.id().to_string();
        if self.devices.contains_key(&id) {
            return Err(GatewayError::DuplicateId(id));
        }
        let handle = Arc::new(Mutex::new(device));
        self.devices.insert(id, handle.clone());
        Ok(handle)
    }

    /// Remove a device. Returns its handle so the host can drain it.
    pub fn remove_device(&mut self, id: &str) -> Result<DeviceHandle> {
        self.devices
            .remove(id)
            .ok_or_else(|| GatewayError::NotFound(id.to_string()))
    }

    /// Shared handle of one registered device.
    pub fn device(&self, id: &str) -> Option<&DeviceHandle> {
        self.devices.get(id)
    }

    /// Number of registered devices.
    pub fn device_count(&self) -> usize {
        self.devices.len()
    }

    /// Refresh every registered device for one tick.
    ///
    /// Refreshes run concurrently; `Device::refresh` swallows its own
    /// failures, so one faulty device never affects the rest.
    pub async fn tick_once(&self, tick: u64) {
        let refreshes = self.devices.values().map(|handle| async move {
            handle.lock().await.refresh(tick).await;
        });
        join_all(refreshes).await;
    }

    /// Drive ticks until the shutdown signal flips to `true`.
    ///
    /// Ticks that pile up while a refresh runs long are skipped, not
    /// replayed; the tick number always reflects the current time.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.base_period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    // A dropped sender stops the loop like a shutdown
                    if changed.is_err() || *shutdown.borrow() {
                        tracing::debug!("sampler stopping");
                        break;
                    }
                }
                _ = interval.tick() => {
                    self.tick_once(current_tick()).await;
                }
            }
        }
    }
}

impl Default for Sampler {
    fn default() -> Self {
        Self::new()
    }
}
