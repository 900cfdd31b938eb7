//! Device operations with bounded retry and recovery.
//!
//! Drivers never talk to a [`Transport`] directly; they get a
//! [`DeviceClient`] bound to one allocated device. The production client,
//! [`RecoveringDeviceClient`], wraps every operation in the same policy:
//!
//! ```text
//!   recover_state == false ──────────────────────────► RecoveryDisabled
//!   attempt ─► ok ───────────────────────────────────► value
//!      │
//!      └─► error ─┬─ connection ─► probe server ─ down ─► TransportDown
//!                 │                    │                  (whole endpoint
//!                 │                    up                  unrecoverable)
//!                 │                    ▼
//!                 ├─ device fault ─► recover ─ fail ────► Unavailable
//!                 │                    │
//!                 │                    ok
//!                 ▼                    ▼
//!               other ─────────► next attempt (up to 3, reboot once)
//! ```
//!
//! Recovery waits for the device to report `Online` again and restarts
//! device log capture through a [`LogCollector`].

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::config::RecoveryConfig;
use crate::connector::{ConnectorSet, Transport, TransportError};
use crate::device::{Device, Endpoint};

/// Errors from device operations.
#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    #[error("Recovery disabled for device {0}")]
    RecoveryDisabled(String),

    #[error("Connector {endpoint} is down, device {serial} unreachable")]
    TransportDown { serial: String, endpoint: Endpoint },

    #[error("Device {serial} unavailable: {reason}")]
    Unavailable { serial: String, reason: String },

    #[error("No connector configured for {0}")]
    NoTransport(Endpoint),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl DeviceError {
    /// True if the device cannot be used again in this run.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::RecoveryDisabled(_) | Self::TransportDown { .. } | Self::Unavailable { .. }
        )
    }
}

pub type DeviceResult<T> = std::result::Result<T, DeviceError>;

/// How many attempts an operation gets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryMode {
    /// The configured attempt count.
    Default,
    /// A single attempt; used for operations that must not repeat, like reboot.
    Once,
}

/// Progress of a recovery, reported to [`RecoveryObserver`]s.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryEvent {
    Started { serial: String, cause: String },
    Succeeded { serial: String },
    Failed { serial: String, reason: String },
}

/// Receives recovery notifications. Errors and panics are logged and dropped.
pub trait RecoveryObserver: Send + Sync {
    fn on_recovery(&self, event: &RecoveryEvent) -> anyhow::Result<()>;
}

/// Hook that restarts device log capture after a recovery.
#[async_trait]
pub trait LogCollector: Send + Sync {
    async fn restart(&self, device: &Device) -> anyhow::Result<()>;
}

/// Log collector that does nothing.
pub struct NoopLogCollector;

#[async_trait]
impl LogCollector for NoopLogCollector {
    async fn restart(&self, _device: &Device) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Operations a driver can run against its device.
#[async_trait]
pub trait DeviceClient: Send + Sync {
    fn device(&self) -> &Arc<Device>;

    async fn execute(&self, command: &str, timeout: Duration) -> DeviceResult<String>;

    async fn push(&self, local: &Path, remote: &str, timeout: Duration) -> DeviceResult<()>;

    async fn pull(&self, remote: &str, local: &Path, timeout: Duration) -> DeviceResult<()>;

    async fn install(&self, package: &Path) -> DeviceResult<()>;

    async fn uninstall(&self, bundle: &str) -> DeviceResult<()>;

    async fn reboot(&self) -> DeviceResult<()>;
}

/// A [`DeviceClient`] that retries and recovers.
pub struct RecoveringDeviceClient {
    device: Arc<Device>,
    transport: Arc<dyn Transport>,
    attempts: usize,
    online_timeout: Duration,
    observers: Vec<Arc<dyn RecoveryObserver>>,
    log_collector: Arc<dyn LogCollector>,
}

impl RecoveringDeviceClient {
    pub fn new(device: Arc<Device>, transport: Arc<dyn Transport>, config: &RecoveryConfig) -> Self {
        Self {
            device,
            transport,
            attempts: config.attempts.max(1),
            online_timeout: config.online_timeout(),
            observers: Vec::new(),
            log_collector: Arc::new(NoopLogCollector),
        }
    }

    pub fn with_online_timeout(mut self, timeout: Duration) -> Self {
        self.online_timeout = timeout;
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn RecoveryObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    pub fn with_log_collector(mut self, collector: Arc<dyn LogCollector>) -> Self {
        self.log_collector = collector;
        self
    }

    /// Runs `op` under the retry and recovery policy.
    async fn perform<T, F, Fut>(&self, action: &str, mode: RetryMode, op: F) -> DeviceResult<T>
    where
        T: Send,
        F: Fn() -> Fut + Send + Sync,
        Fut: Future<Output = Result<T, TransportError>> + Send,
    {
        let serial = self.device.serial();
        if !self.device.recover_state() {
            return Err(DeviceError::RecoveryDisabled(serial.to_string()));
        }

        let attempts = match mode {
            RetryMode::Default => self.attempts,
            RetryMode::Once => 1,
        };

        let mut attempt = 1;
        loop {
            let err = match op().await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };
            warn!(
                "{} on {} failed (attempt {}/{}): {}",
                action, serial, attempt, attempts, err
            );

            if err.is_connection() {
                if !self.transport.is_running().await {
                    return Err(self.transport_down());
                }
                self.recover(&err).await?;
            } else if err.is_device_fault() {
                self.recover(&err).await?;
            }

            if attempt >= attempts {
                return Err(err.into());
            }
            attempt += 1;
        }
    }

    fn transport_down(&self) -> DeviceError {
        let endpoint = self.device.endpoint().clone();
        match self.device.pool() {
            Some(pool) => {
                pool.mark_endpoint_unrecoverable(&endpoint);
            }
            None => self.device.set_recover_state(false),
        }
        self.notify(&RecoveryEvent::Failed {
            serial: self.device.serial().to_string(),
            reason: format!("connector {} is down", endpoint),
        });
        DeviceError::TransportDown {
            serial: self.device.serial().to_string(),
            endpoint,
        }
    }

    async fn recover(&self, cause: &TransportError) -> DeviceResult<()> {
        let serial = self.device.serial().to_string();
        info!("Recovering device {}", serial);
        self.notify(&RecoveryEvent::Started {
            serial: serial.clone(),
            cause: cause.to_string(),
        });

        if !self.device.wait_for_online(self.online_timeout).await {
            let reason = format!("not online within {:?}", self.online_timeout);
            self.device.set_recover_state(false);
            self.notify(&RecoveryEvent::Failed {
                serial: serial.clone(),
                reason: reason.clone(),
            });
            return Err(DeviceError::Unavailable { serial, reason });
        }

        if let Err(e) = self.log_collector.restart(&self.device).await {
            warn!("Failed to restart log capture on {}: {:#}", serial, e);
        }

        debug!("Device {} recovered", serial);
        self.notify(&RecoveryEvent::Succeeded { serial });
        Ok(())
    }

    fn notify(&self, event: &RecoveryEvent) {
        for observer in &self.observers {
            match std::panic::catch_unwind(AssertUnwindSafe(|| observer.on_recovery(event))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("Recovery observer failed: {:#}", e),
                Err(_) => warn!("Recovery observer panicked on {:?}", event),
            }
        }
    }
}

#[async_trait]
impl DeviceClient for RecoveringDeviceClient {
    fn device(&self) -> &Arc<Device> {
        &self.device
    }

    async fn execute(&self, command: &str, timeout: Duration) -> DeviceResult<String> {
        let serial = self.device.serial();
        self.perform("execute", RetryMode::Default, move || {
            self.transport.execute(serial, command, timeout)
        })
        .await
    }

    async fn push(&self, local: &Path, remote: &str, timeout: Duration) -> DeviceResult<()> {
        let serial = self.device.serial();
        self.perform("push", RetryMode::Default, move || {
            self.transport.push(serial, local, remote, timeout)
        })
        .await
    }

    async fn pull(&self, remote: &str, local: &Path, timeout: Duration) -> DeviceResult<()> {
        let serial = self.device.serial();
        self.perform("pull", RetryMode::Default, move || {
            self.transport.pull(serial, remote, local, timeout)
        })
        .await
    }

    async fn install(&self, package: &Path) -> DeviceResult<()> {
        let serial = self.device.serial();
        self.perform("install", RetryMode::Default, move || {
            self.transport.install(serial, package)
        })
        .await
    }

    async fn uninstall(&self, bundle: &str) -> DeviceResult<()> {
        let serial = self.device.serial();
        self.perform("uninstall", RetryMode::Default, move || {
            self.transport.uninstall(serial, bundle)
        })
        .await
    }

    async fn reboot(&self) -> DeviceResult<()> {
        let serial = self.device.serial();
        self.perform("reboot", RetryMode::Once, move || self.transport.reboot(serial))
            .await
    }
}

/// Creates [`RecoveringDeviceClient`]s for allocated devices.
#[derive(Clone)]
pub struct ClientFactory {
    connectors: ConnectorSet,
    recovery: RecoveryConfig,
    observers: Vec<Arc<dyn RecoveryObserver>>,
    log_collector: Arc<dyn LogCollector>,
}

impl ClientFactory {
    pub fn new(connectors: ConnectorSet, recovery: RecoveryConfig) -> Self {
        Self {
            connectors,
            recovery,
            observers: Vec::new(),
            log_collector: Arc::new(NoopLogCollector),
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn RecoveryObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    pub fn with_log_collector(mut self, collector: Arc<dyn LogCollector>) -> Self {
        self.log_collector = collector;
        self
    }

    pub fn connectors(&self) -> &ConnectorSet {
        &self.connectors
    }

    pub fn client(&self, device: Arc<Device>) -> DeviceResult<RecoveringDeviceClient> {
        let transport = self
            .connectors
            .get(device.endpoint())
            .ok_or_else(|| DeviceError::NoTransport(device.endpoint().clone()))?;

        let mut client = RecoveringDeviceClient::new(device, transport, &self.recovery)
            .with_log_collector(Arc::clone(&self.log_collector));
        for observer in &self.observers {
            client = client.with_observer(Arc::clone(observer));
        }
        Ok(client)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::connector::ConnectionKind;
    use crate::device::TestDeviceState;
    use crate::test_support::{FakeTransport, pool_with_devices};

    #[derive(Default)]
    struct RecordingObserver {
        events: Mutex<Vec<RecoveryEvent>>,
    }

    impl RecoveryObserver for RecordingObserver {
        fn on_recovery(&self, event: &RecoveryEvent) -> anyhow::Result<()> {
            self.events.lock().unwrap().push(event.clone());
            Ok(())
        }
    }

    struct PanickingObserver;

    impl RecoveryObserver for PanickingObserver {
        fn on_recovery(&self, _event: &RecoveryEvent) -> anyhow::Result<()> {
            panic!("observer bug");
        }
    }

    #[derive(Default)]
    struct CountingCollector {
        restarts: AtomicUsize,
    }

    #[async_trait]
    impl LogCollector for CountingCollector {
        async fn restart(&self, _device: &Device) -> anyhow::Result<()> {
            self.restarts.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn reset() -> TransportError {
        TransportError::Connection {
            kind: ConnectionKind::Reset,
            message: "reset by peer".to_string(),
        }
    }

    fn client_for(
        transport: &Arc<FakeTransport>,
        device: Arc<Device>,
    ) -> RecoveringDeviceClient {
        let transport: Arc<dyn Transport> = transport.clone();
        RecoveringDeviceClient::new(device, transport, &RecoveryConfig::default())
            .with_online_timeout(Duration::from_millis(50))
    }

    #[tokio::test]
    async fn test_execute_success() {
        let (pool, transport) = pool_with_devices(&["SN1"]);
        transport.push_response(Ok("hello\n".to_string()));
        let client = client_for(&transport, pool.find("SN1").unwrap());

        let out = client.execute("echo hello", Duration::from_secs(1)).await.unwrap();
        assert_eq!(out, "hello\n");
        assert_eq!(transport.calls(), 1);
        assert_eq!(transport.commands(), vec!["SN1: echo hello"]);
    }

    #[tokio::test]
    async fn test_file_transfer_passes_timeout() {
        let (pool, transport) = pool_with_devices(&["SN1"]);
        let client = client_for(&transport, pool.find("SN1").unwrap());

        client
            .push(Path::new("/tmp/a.hap"), "/data/a.hap", Duration::from_secs(30))
            .await
            .unwrap();
        client
            .pull("/data/log", Path::new("/tmp/log"), Duration::from_secs(90))
            .await
            .unwrap();
        assert_eq!(
            transport.commands(),
            vec![
                "SN1: push /tmp/a.hap /data/a.hap (30s)",
                "SN1: pull /data/log /tmp/log (90s)",
            ]
        );
    }

    #[tokio::test]
    async fn test_recovery_disabled_fails_fast() {
        let (pool, transport) = pool_with_devices(&["SN1"]);
        let device = pool.find("SN1").unwrap();
        device.set_recover_state(false);
        let client = client_for(&transport, device);

        let err = client.execute("ls", Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, DeviceError::RecoveryDisabled(_)));
        assert_eq!(transport.calls(), 0);
    }

    #[tokio::test]
    async fn test_connection_error_with_server_down() {
        let (pool, transport) = pool_with_devices(&["SN1", "SN2"]);
        transport.push_response(Err(reset()));
        transport.set_running(false);
        let observer = Arc::new(RecordingObserver::default());
        let client = client_for(&transport, pool.find("SN1").unwrap())
            .with_observer(observer.clone());

        let err = client.execute("ls", Duration::from_secs(1)).await.unwrap_err();

        assert!(matches!(err, DeviceError::TransportDown { .. }));
        assert!(err.is_terminal());
        assert_eq!(transport.calls(), 1);
        // Every device behind the dead server is unrecoverable.
        assert!(!pool.find("SN1").unwrap().recover_state());
        assert!(!pool.find("SN2").unwrap().recover_state());
        assert!(matches!(
            observer.events.lock().unwrap().as_slice(),
            [RecoveryEvent::Failed { .. }]
        ));
    }

    #[tokio::test]
    async fn test_connection_error_recovers_and_retries() {
        let (pool, transport) = pool_with_devices(&["SN1"]);
        transport.push_response(Err(reset()));
        transport.push_response(Ok("done".to_string()));
        let observer = Arc::new(RecordingObserver::default());
        let collector = Arc::new(CountingCollector::default());
        let client = client_for(&transport, pool.find("SN1").unwrap())
            .with_observer(observer.clone())
            .with_log_collector(collector.clone());

        let out = client.execute("ls", Duration::from_secs(1)).await.unwrap();

        assert_eq!(out, "done");
        assert_eq!(transport.calls(), 2);
        assert_eq!(collector.restarts.load(Ordering::SeqCst), 1);
        let events = observer.events.lock().unwrap();
        assert!(matches!(
            events.as_slice(),
            [RecoveryEvent::Started { .. }, RecoveryEvent::Succeeded { .. }]
        ));
    }

    #[tokio::test]
    async fn test_device_gone_becomes_unavailable() {
        let (pool, transport) = pool_with_devices(&["SN1"]);
        let device = pool.find("SN1").unwrap();
        device.set_test_state(TestDeviceState::Offline);
        transport.push_response(Err(TransportError::DeviceNotFound("SN1".to_string())));
        let client = client_for(&transport, Arc::clone(&device));

        let err = client.execute("ls", Duration::from_secs(1)).await.unwrap_err();

        assert!(matches!(err, DeviceError::Unavailable { .. }));
        assert_eq!(transport.calls(), 1);
        assert!(!device.recover_state());
        assert_eq!(device.test_state(), TestDeviceState::NotAvailable);

        // Later calls fail fast.
        let err = client.execute("ls", Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, DeviceError::RecoveryDisabled(_)));
    }

    #[tokio::test]
    async fn test_other_errors_retry_without_recovery() {
        let (pool, transport) = pool_with_devices(&["SN1"]);
        for _ in 0..3 {
            transport.push_response(Err(TransportError::Timeout(Duration::from_secs(1))));
        }
        let observer = Arc::new(RecordingObserver::default());
        let client = client_for(&transport, pool.find("SN1").unwrap())
            .with_observer(observer.clone());

        let err = client.execute("ls", Duration::from_secs(1)).await.unwrap_err();

        assert!(matches!(err, DeviceError::Transport(TransportError::Timeout(_))));
        assert!(!err.is_terminal());
        assert_eq!(transport.calls(), 3);
        assert!(observer.events.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_reboot_is_attempted_once() {
        let (pool, transport) = pool_with_devices(&["SN1"]);
        transport.push_response(Err(TransportError::Rejected("busy".to_string())));
        let client = client_for(&transport, pool.find("SN1").unwrap());

        assert!(client.reboot().await.is_err());
        assert_eq!(transport.calls(), 1);
    }

    #[tokio::test]
    async fn test_panicking_observer_is_isolated() {
        let (pool, transport) = pool_with_devices(&["SN1"]);
        transport.push_response(Err(reset()));
        transport.push_response(Ok(String::new()));
        let recorder = Arc::new(RecordingObserver::default());
        let client = client_for(&transport, pool.find("SN1").unwrap())
            .with_observer(Arc::new(PanickingObserver))
            .with_observer(recorder.clone());

        client.execute("ls", Duration::from_secs(1)).await.unwrap();
        assert_eq!(recorder.events.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_factory_requires_transport() {
        let (pool, transport) = pool_with_devices(&["SN1"]);
        let device = pool.find("SN1").unwrap();

        let empty = ClientFactory::new(ConnectorSet::new(), RecoveryConfig::default());
        assert!(matches!(
            empty.client(Arc::clone(&device)),
            Err(DeviceError::NoTransport(_))
        ));

        let mut connectors = ConnectorSet::new();
        connectors.insert(transport);
        let factory = ClientFactory::new(connectors, RecoveryConfig::default());
        let client = factory.client(device).unwrap();
        assert_eq!(client.device().serial(), "SN1");
    }
}
