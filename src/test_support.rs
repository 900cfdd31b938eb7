//! In-crate test doubles.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::config::PoolConfig;
use crate::connector::{ConnectionKind, Transport, TransportError, TransportResult};
use crate::device::{ConnectivityState, Endpoint};
use crate::driver::{Driver, DriverContext, DriverError, Verdict};
use crate::lifecycle::{LifeStageListener, StageEvent};
use crate::pool::{DevicePool, DiscoveryKind, ObservedDevice};

/// Scripted transport. Responses are consumed in order; once the script is
/// empty every operation succeeds with empty output.
pub(crate) struct FakeTransport {
    endpoint: Endpoint,
    targets: Mutex<Vec<ObservedDevice>>,
    responses: Mutex<VecDeque<TransportResult<String>>>,
    running: AtomicBool,
    calls: AtomicUsize,
    commands: Mutex<Vec<String>>,
    delay: Mutex<Duration>,
}

impl FakeTransport {
    pub(crate) fn new(endpoint: Endpoint) -> Self {
        Self {
            endpoint,
            targets: Mutex::new(Vec::new()),
            responses: Mutex::new(VecDeque::new()),
            running: AtomicBool::new(true),
            calls: AtomicUsize::new(0),
            commands: Mutex::new(Vec::new()),
            delay: Mutex::new(Duration::ZERO),
        }
    }

    pub(crate) fn set_targets(&self, targets: Vec<ObservedDevice>) {
        *self.targets.lock().unwrap() = targets;
    }

    pub(crate) fn set_running(&self, running: bool) {
        self.running.store(running, Ordering::SeqCst);
    }

    pub(crate) fn push_response(&self, response: TransportResult<String>) {
        self.responses.lock().unwrap().push_back(response);
    }

    /// Time every `execute` takes before answering.
    pub(crate) fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = delay;
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub(crate) fn commands(&self) -> Vec<String> {
        self.commands.lock().unwrap().clone()
    }

    fn next(&self, record: String) -> TransportResult<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.commands.lock().unwrap().push(record);
        self.responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(String::new()))
    }
}

#[async_trait]
impl Transport for FakeTransport {
    fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    async fn execute(
        &self,
        serial: &str,
        command: &str,
        _timeout: Duration,
    ) -> TransportResult<String> {
        let delay = *self.delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.next(format!("{}: {}", serial, command))
    }

    async fn push(
        &self,
        serial: &str,
        local: &Path,
        remote: &str,
        timeout: Duration,
    ) -> TransportResult<()> {
        self.next(format!(
            "{}: push {} {} ({}s)",
            serial,
            local.display(),
            remote,
            timeout.as_secs()
        ))
        .map(|_| ())
    }

    async fn pull(
        &self,
        serial: &str,
        remote: &str,
        local: &Path,
        timeout: Duration,
    ) -> TransportResult<()> {
        self.next(format!(
            "{}: pull {} {} ({}s)",
            serial,
            remote,
            local.display(),
            timeout.as_secs()
        ))
        .map(|_| ())
    }

    async fn install(&self, serial: &str, package: &Path) -> TransportResult<()> {
        self.next(format!("{}: install {}", serial, package.display()))
            .map(|_| ())
    }

    async fn uninstall(&self, serial: &str, bundle: &str) -> TransportResult<()> {
        self.next(format!("{}: uninstall {}", serial, bundle))
            .map(|_| ())
    }

    async fn reboot(&self, serial: &str) -> TransportResult<()> {
        self.next(format!("{}: reboot", serial)).map(|_| ())
    }

    async fn list_targets(&self) -> TransportResult<Vec<ObservedDevice>> {
        if !self.running.load(Ordering::SeqCst) {
            return Err(TransportError::Connection {
                kind: ConnectionKind::Refused,
                message: "server down".to_string(),
            });
        }
        Ok(self.targets.lock().unwrap().clone())
    }

    async fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

pub(crate) fn local_endpoint() -> Endpoint {
    Endpoint::new("127.0.0.1", 8710)
}

/// A pool with the given serials connected and online, plus the fake
/// transport they are reachable through.
pub(crate) fn pool_with_devices(serials: &[&str]) -> (Arc<DevicePool>, Arc<FakeTransport>) {
    pool_with_config(serials, PoolConfig::default())
}

pub(crate) fn pool_with_config(
    serials: &[&str],
    config: PoolConfig,
) -> (Arc<DevicePool>, Arc<FakeTransport>) {
    let pool = DevicePool::new(config);
    let transport = Arc::new(FakeTransport::new(local_endpoint()));
    for serial in serials {
        pool.on_device_observed(
            DiscoveryKind::Connected,
            &ObservedDevice::new(*serial, local_endpoint(), ConnectivityState::Connected),
        );
    }
    (pool, transport)
}

/// Driver whose behavior is set by descriptor parameters:
///
/// - `result`: `pass` (default), `fail`, `error` or `panic`
/// - `sleep_ms`: time spent running
/// - `fail_times`: fail the first n runs of a descriptor id
pub(crate) struct FakeDriver {
    running: AtomicUsize,
    peak: AtomicUsize,
    runs: Mutex<HashMap<String, u32>>,
    order: Mutex<Vec<String>>,
}

impl FakeDriver {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            running: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            runs: Mutex::new(HashMap::new()),
            order: Mutex::new(Vec::new()),
        })
    }

    pub(crate) fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    pub(crate) fn runs(&self, descriptor_id: &str) -> u32 {
        self.runs
            .lock()
            .unwrap()
            .get(descriptor_id)
            .copied()
            .unwrap_or(0)
    }

    pub(crate) fn order(&self) -> Vec<String> {
        self.order.lock().unwrap().clone()
    }
}

#[async_trait]
impl Driver for FakeDriver {
    fn name(&self) -> &str {
        "fake"
    }

    fn validate(&self, params: &BTreeMap<String, String>) -> Result<(), String> {
        match params.get("result").map(String::as_str) {
            None | Some("pass" | "fail" | "error" | "panic") => Ok(()),
            Some(other) => Err(format!("unknown result '{}'", other)),
        }
    }

    async fn run(&self, ctx: &DriverContext) -> Result<Verdict, DriverError> {
        let id = ctx.descriptor().id.clone();
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        let run = {
            let mut runs = self.runs.lock().unwrap();
            let count = runs.entry(id.clone()).or_insert(0);
            *count += 1;
            *count
        };
        self.order.lock().unwrap().push(id);

        if let Some(ms) = ctx.param("sleep_ms").and_then(|v| v.parse().ok()) {
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }
        self.running.fetch_sub(1, Ordering::SeqCst);

        let fail_times: u32 = ctx
            .param("fail_times")
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        if run <= fail_times {
            return Ok(Verdict::Failed(format!("run {} failed", run)));
        }

        match ctx.param("result").unwrap_or("pass") {
            "fail" => Ok(Verdict::Failed("asked to fail".to_string())),
            "error" => Err(DriverError::Execution("asked to error".to_string())),
            "panic" => panic!("asked to panic"),
            _ => Ok(Verdict::Passed),
        }
    }
}

/// Records every stage event it sees.
#[derive(Default)]
pub(crate) struct EventRecorder {
    events: Mutex<Vec<StageEvent>>,
}

impl EventRecorder {
    pub(crate) fn events(&self) -> Vec<StageEvent> {
        self.events.lock().unwrap().clone()
    }

    pub(crate) fn kinds(&self) -> Vec<&'static str> {
        self.events.lock().unwrap().iter().map(|e| e.kind()).collect()
    }
}

impl LifeStageListener for EventRecorder {
    fn on_event(&self, event: &StageEvent) -> anyhow::Result<()> {
        self.events.lock().unwrap().push(event.clone());
        Ok(())
    }
}
