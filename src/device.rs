//! Devices tracked by the pool and the predicates used to select them.
//!
//! A [`Device`] is created by the [`DevicePool`](crate::pool::DevicePool) the
//! first time a connector reports its serial, and shared as `Arc<Device>`
//! between the pool, the scheduler and the driver that currently holds it.
//!
//! # State Ownership
//!
//! | Field | Mutated by | Guarded by |
//! |-------|------------|------------|
//! | allocation state | `DevicePool` only | pool list lock + device lock |
//! | test device state | pool (discovery), recovering client | watch channel |
//! | recover state | pool (discovery), recovering client | device lock |

pub mod state;

use std::fmt;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::debug;

use crate::pool::DevicePool;

pub use state::{AllocationState, ConnectivityState, DeviceEvent, TestDeviceState, transition};

/// Product forms a device requirement may ask for.
pub const SUPPORTED_LABELS: &[&str] = &["phone", "watch", "car", "tv", "tablet", "ivi", "2in1"];

/// Label given to devices whose product form was not reported.
pub const DEFAULT_LABEL: &str = "phone";

/// Network address of the connector server a device is reached through.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

#[derive(Debug)]
struct DeviceStatus {
    allocation: AllocationState,
    recover_state: bool,
}

/// A device reachable through a connector.
pub struct Device {
    serial: String,
    endpoint: Endpoint,
    label: String,
    alias: Option<String>,
    status: Mutex<DeviceStatus>,
    test_state: watch::Sender<TestDeviceState>,
    pool: Weak<DevicePool>,
}

impl Device {
    /// Creates a device in the `Unknown` allocation state.
    ///
    /// `pool` is a lookup-only back-reference; pass `Weak::new()` for a
    /// device that does not belong to any pool.
    pub fn new(
        serial: impl Into<String>,
        endpoint: Endpoint,
        label: Option<String>,
        test_state: TestDeviceState,
        pool: Weak<DevicePool>,
    ) -> Self {
        let (tx, _rx) = watch::channel(test_state);
        Self {
            serial: serial.into(),
            endpoint,
            label: label.unwrap_or_else(|| DEFAULT_LABEL.to_string()),
            alias: None,
            status: Mutex::new(DeviceStatus {
                allocation: AllocationState::Unknown,
                recover_state: true,
            }),
            test_state: tx,
            pool,
        }
    }

    pub(crate) fn with_alias(mut self, alias: Option<String>) -> Self {
        self.alias = alias;
        self
    }

    pub fn serial(&self) -> &str {
        &self.serial
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn alias(&self) -> Option<&str> {
        self.alias.as_deref()
    }

    /// The pool that owns this device, if it is still alive.
    pub fn pool(&self) -> Option<Arc<DevicePool>> {
        self.pool.upgrade()
    }

    pub fn allocation_state(&self) -> AllocationState {
        self.status_guard().allocation
    }

    /// Only the pool changes allocation state.
    pub(crate) fn set_allocation_state(&self, state: AllocationState) {
        self.status_guard().allocation = state;
    }

    pub fn test_state(&self) -> TestDeviceState {
        *self.test_state.borrow()
    }

    pub fn set_test_state(&self, state: TestDeviceState) {
        self.test_state.send_replace(state);
    }

    pub fn recover_state(&self) -> bool {
        self.status_guard().recover_state
    }

    /// Sets whether operations on this device may be attempted.
    ///
    /// Disabling recovery also marks the device `NotAvailable` so that a
    /// later release parks it as `Unavailable` instead of `Available`.
    pub fn set_recover_state(&self, recover: bool) {
        {
            let mut status = self.status_guard();
            if status.recover_state == recover {
                return;
            }
            status.recover_state = recover;
        }
        debug!("Set device {} recover state to {}", self.serial, recover);
        if !recover {
            self.set_test_state(TestDeviceState::NotAvailable);
        }
    }

    /// Waits until the device reports `Online`, up to `timeout`.
    pub async fn wait_for_online(&self, timeout: Duration) -> bool {
        let mut rx = self.test_state.subscribe();
        matches!(
            tokio::time::timeout(timeout, rx.wait_for(|s| s.is_online())).await,
            Ok(Ok(_))
        )
    }

    /// Snapshot of the device for listings.
    pub fn info(&self) -> DeviceInfo {
        DeviceInfo {
            serial: self.serial.clone(),
            alias: self.alias.clone(),
            label: self.label.clone(),
            host: self.endpoint.host.clone(),
            port: self.endpoint.port,
            test_state: self.test_state(),
            allocation_state: self.allocation_state(),
        }
    }

    fn status_guard(&self) -> std::sync::MutexGuard<'_, DeviceStatus> {
        // The status is plain data; a poisoned lock still holds a usable value.
        self.status.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("serial", &self.serial)
            .field("endpoint", &self.endpoint)
            .field("label", &self.label)
            .field("test_state", &self.test_state())
            .field("allocation_state", &self.allocation_state())
            .finish()
    }
}

/// Serializable view of a device, as printed by `devrunner list`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub serial: String,
    pub alias: Option<String>,
    pub label: String,
    pub host: String,
    pub port: u16,
    pub test_state: TestDeviceState,
    pub allocation_state: AllocationState,
}

/// Device requirement declared by a test driver descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceRequirement {
    /// Required product form, e.g. `phone`.
    #[serde(default)]
    pub label: Option<String>,

    /// Explicit serials the driver may run on. Empty means any.
    #[serde(default)]
    pub serials: Vec<String>,

    /// Number of devices the driver needs.
    #[serde(default = "default_count")]
    pub count: usize,
}

fn default_count() -> usize {
    1
}

impl Default for DeviceRequirement {
    fn default() -> Self {
        Self {
            label: None,
            serials: Vec::new(),
            count: 1,
        }
    }
}

impl DeviceRequirement {
    /// Returns a description of why this requirement can never be met, if any.
    pub fn static_error(&self) -> Option<String> {
        if self.count == 0 {
            return Some("device count must be at least 1".to_string());
        }
        if let Some(label) = &self.label
            && !SUPPORTED_LABELS.contains(&label.as_str())
        {
            return Some(format!("unsupported device label '{}'", label));
        }
        if !self.serials.is_empty() && self.serials.len() < self.count {
            return Some(format!(
                "{} devices required but only {} serials allowed",
                self.count,
                self.serials.len()
            ));
        }
        None
    }

    /// Builds the selector used for one allocation call.
    pub fn selector(&self) -> DeviceSelector {
        DeviceSelector {
            label: self.label.clone(),
            serials: self.serials.clone(),
            count: self.count,
        }
    }
}

/// Immutable match predicate used for a single allocation call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceSelector {
    pub label: Option<String>,
    pub serials: Vec<String>,
    pub count: usize,
}

impl DeviceSelector {
    /// Selector matching any available device.
    pub fn any() -> Self {
        Self {
            label: None,
            serials: Vec::new(),
            count: 1,
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn with_serial(mut self, serial: impl Into<String>) -> Self {
        self.serials.push(serial.into());
        self
    }

    /// Returns true if `device` can be allocated for this selector right now.
    pub fn matches(&self, device: &Device) -> bool {
        if device.allocation_state() != AllocationState::Available || !device.recover_state() {
            return false;
        }
        if !self.serials.is_empty() && !self.serials.iter().any(|s| s == device.serial()) {
            return false;
        }
        match &self.label {
            Some(label) => label == device.label(),
            None => true,
        }
    }
}

impl fmt::Display for DeviceSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "label={}", self.label.as_deref().unwrap_or("any"))?;
        if !self.serials.is_empty() {
            write!(f, " serials=[{}]", self.serials.join(","))?;
        }
        write!(f, " count={}", self.count)
    }
}
