use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;

use idr_reconcile::{DeviceStateQuery, ResultSubmitter, SourceConnector};
use idr_schemas::{DeviceState, DeviceUpdate, RawObservation};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|p| p.into_inner())
}

/// Connector that returns a fixed snapshot, or a fixed error.
pub struct StaticConnector {
    name: String,
    snapshot: Mutex<Vec<RawObservation>>,
    error: Mutex<Option<String>>,
}

impl StaticConnector {
    pub fn new(name: impl Into<String>, snapshot: Vec<RawObservation>) -> Self {
        Self {
            name: name.into(),
            snapshot: Mutex::new(snapshot),
            error: Mutex::new(None),
        }
    }

    pub fn set_snapshot(&self, snapshot: Vec<RawObservation>) {
        *lock(&self.snapshot) = snapshot;
    }

    /// Every later fetch fails with `msg` (or succeeds again with `None`).
    pub fn set_error(&self, msg: Option<&str>) {
        *lock(&self.error) = msg.map(str::to_string);
    }
}

#[async_trait]
impl SourceConnector for StaticConnector {
    fn name(&self) -> &str {
        &self.name
    }

    async fn fetch(&self) -> anyhow::Result<Vec<RawObservation>> {
        if let Some(msg) = lock(&self.error).clone() {
            anyhow::bail!("{} fetch failed: {msg}", self.name);
        }
        Ok(lock(&self.snapshot).clone())
    }
}

/// Device-state query over a fixed list. Every source sees the same list.
#[derive(Default)]
pub struct StaticDeviceStates {
    states: Mutex<Vec<DeviceState>>,
}

impl StaticDeviceStates {
    pub fn new(states: Vec<DeviceState>) -> Self {
        Self {
            states: Mutex::new(states),
        }
    }

    pub fn set(&self, states: Vec<DeviceState>) {
        *lock(&self.states) = states;
    }
}

#[async_trait]
impl DeviceStateQuery for StaticDeviceStates {
    async fn get_device_states_by_source(&self, _source: &str) -> anyhow::Result<Vec<DeviceState>> {
        Ok(lock(&self.states).clone())
    }
}

/// Submitter that keeps every batch it accepted. Can be told to fail.
#[derive(Default)]
pub struct RecordingSubmitter {
    batches: Mutex<Vec<Vec<DeviceUpdate>>>,
    fail: Mutex<Option<String>>,
}

impl RecordingSubmitter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failure(&self, msg: Option<&str>) {
        *lock(&self.fail) = msg.map(str::to_string);
    }

    pub fn batches(&self) -> Vec<Vec<DeviceUpdate>> {
        lock(&self.batches).clone()
    }

    /// Every submitted update, flattened in submit order.
    pub fn submitted(&self) -> Vec<DeviceUpdate> {
        lock(&self.batches).iter().flatten().cloned().collect()
    }
}

#[async_trait]
impl ResultSubmitter for RecordingSubmitter {
    async fn submit_batch_sweep_results(&self, events: &[DeviceUpdate]) -> anyhow::Result<()> {
        if let Some(msg) = lock(&self.fail).clone() {
            anyhow::bail!("submit rejected: {msg}");
        }
        lock(&self.batches).push(events.to_vec());
        Ok(())
    }
}
