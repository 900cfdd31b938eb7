//! Device connectivity and allocation states.
//!
//! This module holds the allocation state machine: a pure function from
//! `(AllocationState, DeviceEvent)` to the next [`AllocationState`]. It has no
//! side effects and knows nothing about locks, pools or notification; the
//! [`DevicePool`](crate::pool::DevicePool) is the only caller that applies its
//! results to a device.
//!
//! # Transition Table
//!
//! | Event | From | To |
//! |-------|------|----|
//! | `ConnectedOnline`, `StateChangeOnline` | `Allocated` | `Allocated` |
//! | `ConnectedOnline`, `StateChangeOnline` | any other | `CheckingAvailability` |
//! | `ConnectedOffline`, `StateChangeOffline`, `Disconnected` | `Allocated` | `Allocated` |
//! | `ConnectedOffline`, `StateChangeOffline`, `Disconnected` | any other | `Unknown` |
//! | `AllocateRequest` | `Available` | `Allocated` |
//! | `FreeAvailable` | `Allocated` | `Available` |
//! | `FreeUnavailable` | `Allocated` | `Unavailable` |
//! | `AvailableCheckPassed` | `CheckingAvailability` | `Available` |
//! | `AvailableCheckIgnored` | `CheckingAvailability` | `Unavailable` |
//!
//! Every pair not listed leaves the state unchanged.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Connectivity state of a device as seen by the test framework.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestDeviceState {
    /// Device is connected and accepting commands.
    Online,
    /// Device is known to the connector but not responding.
    Offline,
    /// Device has dropped off the connector.
    NotAvailable,
    /// Device is connected but has not authorized this host.
    Unauthorized,
    /// State could not be determined.
    Unknown,
}

impl TestDeviceState {
    /// Maps the raw state reported by a connector onto a test device state.
    pub fn from_connectivity(raw: ConnectivityState) -> Self {
        match raw {
            ConnectivityState::Connected | ConnectivityState::Ready => Self::Online,
            ConnectivityState::Offline => Self::Offline,
            ConnectivityState::Unauthorized => Self::Unauthorized,
            ConnectivityState::Disconnected => Self::NotAvailable,
            ConnectivityState::Unknown => Self::Unknown,
        }
    }

    pub fn is_online(self) -> bool {
        self == Self::Online
    }
}

impl fmt::Display for TestDeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Online => "online",
            Self::Offline => "offline",
            Self::NotAvailable => "not_available",
            Self::Unauthorized => "unauthorized",
            Self::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// Raw connectivity state as printed by the connector (`list targets -v`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectivityState {
    Connected,
    Ready,
    Offline,
    Unauthorized,
    Disconnected,
    Unknown,
}

impl ConnectivityState {
    /// Parses a connector state column. Matching is case-insensitive and
    /// anything unrecognized maps to [`ConnectivityState::Unknown`].
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "connected" | "online" | "device" => Self::Connected,
            "ready" => Self::Ready,
            "offline" => Self::Offline,
            "unauthorized" => Self::Unauthorized,
            "disconnected" => Self::Disconnected,
            _ => Self::Unknown,
        }
    }
}

/// Allocation state of a device inside the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AllocationState {
    Unknown,
    Available,
    CheckingAvailability,
    Allocated,
    Unavailable,
}

impl fmt::Display for AllocationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Unknown => "unknown",
            Self::Available => "available",
            Self::CheckingAvailability => "checking_availability",
            Self::Allocated => "allocated",
            Self::Unavailable => "unavailable",
        };
        f.write_str(s)
    }
}

/// Events that drive the allocation state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceEvent {
    AllocateRequest,
    FreeAvailable,
    FreeUnavailable,
    ConnectedOnline,
    ConnectedOffline,
    StateChangeOnline,
    StateChangeOffline,
    Disconnected,
    AvailableCheckPassed,
    AvailableCheckIgnored,
}

/// Computes the next allocation state.
///
/// Unhandled `(state, event)` pairs return `old` unchanged.
pub fn transition(old: AllocationState, event: DeviceEvent) -> AllocationState {
    use AllocationState as S;
    use DeviceEvent as E;

    match (old, event) {
        (S::Allocated, E::ConnectedOnline | E::StateChangeOnline) => S::Allocated,
        (_, E::ConnectedOnline | E::StateChangeOnline) => S::CheckingAvailability,

        (S::Allocated, E::ConnectedOffline | E::StateChangeOffline | E::Disconnected) => {
            S::Allocated
        }
        (_, E::ConnectedOffline | E::StateChangeOffline | E::Disconnected) => S::Unknown,

        (S::Available, E::AllocateRequest) => S::Allocated,
        (S::Allocated, E::FreeAvailable) => S::Available,
        (S::Allocated, E::FreeUnavailable) => S::Unavailable,

        (S::CheckingAvailability, E::AvailableCheckPassed) => S::Available,
        (S::CheckingAvailability, E::AvailableCheckIgnored) => S::Unavailable,

        (state, _) => state,
    }
}
