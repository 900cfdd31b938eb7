//! Transport to devices through a connector server.
//!
//! A connector server (hdc, adb, ...) multiplexes many devices behind one
//! `host:port` endpoint. devrunner never speaks the connector's wire
//! protocol itself; it shells out to the connector binary, the way
//! [`HdcConnector`] does, behind the [`Transport`] trait.
//!
//! # Error Classes
//!
//! Callers care about two kinds of failure, and [`TransportError`] exposes
//! a classifier for each:
//!
//! | Classifier | Variants | Meaning |
//! |------------|----------|---------|
//! | [`is_connection`](TransportError::is_connection) | `Connection` | the link to the connector broke; probe the server |
//! | [`is_device_fault`](TransportError::is_device_fault) | `DeviceNotFound` | the server is fine, the device dropped |
//!
//! Everything else (timeouts, rejected commands) is retried as-is.

pub mod hdc;
pub mod watcher;

pub use hdc::HdcConnector;
pub use watcher::DeviceWatcher;

use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::config::ConnectorConfig;
use crate::device::Endpoint;
use crate::pool::ObservedDevice;

/// Why a connection-class failure happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionKind {
    Reset,
    Refused,
    Aborted,
}

impl fmt::Display for ConnectionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Reset => "reset",
            Self::Refused => "refused",
            Self::Aborted => "aborted",
        };
        f.write_str(s)
    }
}

/// Errors returned by a [`Transport`].
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Connection {kind}: {message}")]
    Connection {
        kind: ConnectionKind,
        message: String,
    },

    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("Command rejected: {0}")]
    Rejected(String),

    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    #[error("Failed to run connector: {0}")]
    Spawn(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl TransportError {
    /// Connection reset, refused or aborted.
    pub fn is_connection(&self) -> bool {
        match self {
            Self::Connection { .. } => true,
            Self::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionRefused
                    | std::io::ErrorKind::ConnectionAborted
            ),
            _ => false,
        }
    }

    /// The connector is reachable but the device is gone.
    pub fn is_device_fault(&self) -> bool {
        matches!(self, Self::DeviceNotFound(_))
    }
}

pub type TransportResult<T> = std::result::Result<T, TransportError>;

/// Operations a connector server offers.
///
/// Implementations must be safe to call from many workers at once; one
/// transport serves every device behind its endpoint.
#[async_trait]
pub trait Transport: Send + Sync {
    /// The connector server this transport talks to.
    fn endpoint(&self) -> &Endpoint;

    /// Runs a shell command on the device and returns its output.
    async fn execute(
        &self,
        serial: &str,
        command: &str,
        timeout: Duration,
    ) -> TransportResult<String>;

    /// Copies a host file to the device.
    async fn push(
        &self,
        serial: &str,
        local: &Path,
        remote: &str,
        timeout: Duration,
    ) -> TransportResult<()>;

    /// Copies a device file to the host.
    async fn pull(
        &self,
        serial: &str,
        remote: &str,
        local: &Path,
        timeout: Duration,
    ) -> TransportResult<()>;

    async fn install(&self, serial: &str, package: &Path) -> TransportResult<()>;

    async fn uninstall(&self, serial: &str, bundle: &str) -> TransportResult<()>;

    async fn reboot(&self, serial: &str) -> TransportResult<()>;

    /// Lists the devices currently attached to the connector server.
    async fn list_targets(&self) -> TransportResult<Vec<ObservedDevice>>;

    /// Returns true if the connector server accepts connections.
    async fn is_running(&self) -> bool;
}

/// Transports keyed by endpoint.
#[derive(Clone, Default)]
pub struct ConnectorSet {
    transports: HashMap<Endpoint, Arc<dyn Transport>>,
}

impl ConnectorSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds one [`HdcConnector`] per configured connector.
    pub fn from_config(configs: &[ConnectorConfig]) -> Self {
        let mut set = Self::new();
        for config in configs {
            set.insert(Arc::new(HdcConnector::from_config(config)));
        }
        set
    }

    /// Adds a transport, replacing any previous one for the same endpoint.
    pub fn insert(&mut self, transport: Arc<dyn Transport>) {
        self.transports
            .insert(transport.endpoint().clone(), transport);
    }

    pub fn get(&self, endpoint: &Endpoint) -> Option<Arc<dyn Transport>> {
        self.transports.get(endpoint).cloned()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn Transport>> {
        self.transports.values()
    }

    pub fn len(&self) -> usize {
        self.transports.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transports.is_empty()
    }
}

impl fmt::Debug for ConnectorSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.transports.keys()).finish()
    }
}
