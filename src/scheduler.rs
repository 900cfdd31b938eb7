//! Task scheduling and execution.
//!
//! The [`TaskScheduler`] takes a [`Task`], allocates devices for each of its
//! driver descriptors, and runs the drivers with bounded concurrency.
//!
//! # Architecture
//!
//! ```text
//!   submit(task)
//!        │
//!        ▼
//!   validate ── error ──► every descriptor Failed
//!        │
//!   expand repeat
//!        │
//!        ▼
//!   dispatch loop ─── at capacity ──► wait for completion / poll
//!        │          ─── terminated ──► rest NotExecuted
//!        │          ─── no device ───► Blocked, rest NotExecuted
//!        ▼
//!   apply_device ──► worker task ──► driver.run ──► release devices
//!                                                        │
//!                                      CompletionMessage ▼
//!                                   CompletionMonitor (one task)
//!        │
//!        ▼
//!   TaskReport ──► Reporter ──► TaskEnded ──► auto retry?
//! ```
//!
//! Workers are tokio tasks; the dispatcher never holds the pool's list lock
//! while waiting. A scheduler runs one task at a time.
//!
//! Termination is only observed by the dispatcher. A driver that was handed
//! its devices always runs to its own verdict.

pub mod history;
pub mod monitor;
pub mod retry;
pub mod task;

pub use history::{CommandHistory, HistoryEntry, MAX_HISTORY};
pub use monitor::CompletionMessage;
pub use retry::{AutoRetry, MAX_AUTO_RETRY, RetryState};
pub use task::{Task, TaskConfig, TestDriverDescriptor, expand_repeat};

use std::collections::{HashMap, HashSet, VecDeque};
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use chrono::Utc;
use futures::FutureExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::client::{ClientFactory, DeviceClient};
use crate::config::RunnerConfig;
use crate::device::Device;
use crate::driver::{Driver, DriverContext, DriverRegistry, StageEmitter, Verdict};
use crate::lifecycle::{LifeStageBus, StageEvent, panic_message};
use crate::pool::DevicePool;
use crate::report::{DriverOutcome, DriverResult, NullReporter, Reporter, Summary, TaskReport};
use monitor::{CompletionMonitor, CompletionState};

/// Why a task, or part of it, did not run.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TaskError {
    #[error("parameter error: {0}")]
    Parameter(String),

    #[error("no device available for {descriptor} ({selector})")]
    DeviceUnavailable { descriptor: String, selector: String },

    #[error("execution terminated")]
    Cancelled,
}

/// Runs tasks against a device pool.
pub struct TaskScheduler {
    pool: Arc<DevicePool>,
    clients: ClientFactory,
    drivers: DriverRegistry,
    bus: Arc<LifeStageBus>,
    reporter: Arc<dyn Reporter>,
    config: RunnerConfig,
    retry: AutoRetry,
    cancel: Mutex<CancellationToken>,
    executing: AtomicBool,
    history: Mutex<CommandHistory>,
}

struct RunOutcome {
    results: HashMap<String, DriverResult>,
    error: Option<TaskError>,
    cancelled: bool,
}

impl TaskScheduler {
    pub fn new(
        pool: Arc<DevicePool>,
        clients: ClientFactory,
        drivers: DriverRegistry,
        config: RunnerConfig,
    ) -> Self {
        Self {
            pool,
            clients,
            drivers,
            bus: Arc::new(LifeStageBus::new()),
            reporter: Arc::new(NullReporter),
            config,
            retry: AutoRetry::new(),
            cancel: Mutex::new(CancellationToken::new()),
            executing: AtomicBool::new(false),
            history: Mutex::new(CommandHistory::default()),
        }
    }

    pub fn with_reporter(mut self, reporter: Arc<dyn Reporter>) -> Self {
        self.reporter = reporter;
        self
    }

    pub fn with_bus(mut self, bus: Arc<LifeStageBus>) -> Self {
        self.bus = bus;
        self
    }

    pub fn pool(&self) -> &Arc<DevicePool> {
        &self.pool
    }

    pub fn bus(&self) -> &Arc<LifeStageBus> {
        &self.bus
    }

    pub fn history(&self) -> Vec<HistoryEntry> {
        lock(&self.history).entries()
    }

    pub fn retry_state(&self) -> RetryState {
        self.retry.state()
    }

    pub fn is_executing(&self) -> bool {
        self.executing.load(Ordering::SeqCst)
    }

    /// Stops dispatching new drivers and disables auto retry.
    ///
    /// Drivers already running finish normally; pending ones are reported
    /// `NotExecuted`.
    pub fn terminate(&self) {
        info!("Terminating task execution");
        self.retry.terminate();
        lock(&self.cancel).cancel();
    }

    /// Runs `task`, then re-runs it while auto retry asks for it.
    ///
    /// Returns one report per run, first run first.
    pub async fn submit(&self, task: Task) -> Vec<TaskReport> {
        self.retry.arm(task.config.auto_retry);

        let mut reports = Vec::new();
        let mut current = task;
        let mut round = 0;
        loop {
            let (report, error) = self.run_task(&current, round).await;
            // A rejected task would be rejected again.
            let again = match error {
                Some(TaskError::Parameter(_)) => false,
                _ => self
                    .retry
                    .on_finished(report.summary.needs_retry() && !report.cancelled),
            };
            reports.push(report);
            if !again {
                break;
            }
            round += 1;
            info!("Auto retry {} of task {}", round, current.name);
            current = current.retry();
        }
        reports
    }

    /// Runs `task` once. Always returns a report.
    pub async fn execute(&self, task: &Task) -> TaskReport {
        self.run_task(task, 0).await.0
    }

    async fn run_task(
        &self,
        task: &Task,
        retry_round: u32,
    ) -> (TaskReport, Option<TaskError>) {
        let started_at = Utc::now();
        let start = Instant::now();
        let cancel = self.begin(task);

        let validation = self.validate(task);
        let descriptors = match validation {
            Ok(()) => expand_repeat(&task.descriptors, task.config.repeat),
            Err(_) => task.descriptors.clone(),
        };

        info!(
            "Starting task {} ({}) with {} drivers",
            task.name,
            task.id,
            descriptors.len()
        );
        self.bus.notify_stage(&StageEvent::TaskStarted {
            task_id: task.id.clone(),
            name: task.name.clone(),
            descriptors: descriptors.len(),
        });

        let outcome = match validation {
            Ok(()) => self.run_loop(task, &descriptors, &cancel).await,
            Err(e) => {
                error!("Task {} rejected: {}", task.name, e);
                let results = descriptors
                    .iter()
                    .map(|d| {
                        let result = unfinished(d, DriverOutcome::Failed, e.to_string());
                        self.emit_suite(&task.id, &result);
                        (d.id.clone(), result)
                    })
                    .collect();
                RunOutcome {
                    results,
                    error: Some(e),
                    cancelled: false,
                }
            }
        };

        let RunOutcome {
            mut results,
            error,
            cancelled,
        } = outcome;
        let results: Vec<DriverResult> = descriptors
            .iter()
            .map(|d| {
                results.remove(&d.id).unwrap_or_else(|| {
                    unfinished(d, DriverOutcome::Blocked, "driver did not report a result")
                })
            })
            .collect();

        let summary = Summary::from_results(&results);
        let report = TaskReport {
            task_id: task.id.clone(),
            name: task.name.clone(),
            retry_round,
            started_at,
            duration_ms: start.elapsed().as_millis() as u64,
            results,
            summary,
            error: error.as_ref().map(|e| e.to_string()),
            cancelled,
            report_dir: task.config.report_dir.clone(),
            descriptors,
        };
        info!(
            "Task {} finished: {} passed, {} failed, {} blocked, {} not executed",
            task.name, summary.passed, summary.failed, summary.blocked, summary.not_executed
        );

        if let Err(e) = self.reporter.on_task_complete(&report).await {
            warn!("Failed to report task {}: {:#}", task.name, e);
        }
        self.bus.notify_stage(&StageEvent::TaskEnded {
            task_id: task.id.clone(),
            name: task.name.clone(),
            summary,
            cancelled,
        });
        self.executing.store(false, Ordering::SeqCst);

        (report, error)
    }

    fn begin(&self, task: &Task) -> CancellationToken {
        let token = CancellationToken::new();
        *lock(&self.cancel) = token.clone();
        self.executing.store(true, Ordering::SeqCst);
        lock(&self.history).record(task);
        token
    }

    /// Collects every problem that would stop the task from running.
    fn validate(&self, task: &Task) -> Result<(), TaskError> {
        let mut errors = Vec::new();
        if task.descriptors.is_empty() {
            errors.push("task has no drivers".to_string());
        }

        let mut seen = HashSet::new();
        for descriptor in &task.descriptors {
            let id = &descriptor.id;
            if !seen.insert(id.as_str()) {
                errors.push(format!("{}: duplicate id", id));
                continue;
            }
            if let Some(e) = &descriptor.error {
                errors.push(format!("{}: {}", id, e));
                continue;
            }
            if let Some(e) = descriptor.requirement.static_error() {
                errors.push(format!("{}: {}", id, e));
                continue;
            }
            match self.drivers.get(&descriptor.driver) {
                None => errors.push(format!("{}: unknown driver '{}'", id, descriptor.driver)),
                Some(driver) => {
                    if let Err(e) = driver.validate(&descriptor.params) {
                        errors.push(format!("{}: {}", id, e));
                    }
                }
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(TaskError::Parameter(errors.join("; ")))
        }
    }

    async fn run_loop(
        &self,
        task: &Task,
        descriptors: &[TestDriverDescriptor],
        cancel: &CancellationToken,
    ) -> RunOutcome {
        let (tx, rx) = mpsc::unbounded_channel();
        let state = Arc::new(CompletionState::default());
        let mut monitor = CompletionMonitor::start(rx, Arc::clone(&state));
        let max_concurrent = self.config.max_concurrent.max(1);

        let mut results = HashMap::new();
        let mut error = None;
        let mut cancelled = false;
        let mut pending: VecDeque<&TestDriverDescriptor> = descriptors.iter().collect();

        while !pending.is_empty() {
            monitor.ensure_running();

            if cancel.is_cancelled() {
                info!(
                    "Task {} terminated, {} drivers not executed",
                    task.name,
                    pending.len()
                );
                cancelled = true;
                let reason = TaskError::Cancelled.to_string();
                for descriptor in pending.drain(..) {
                    self.skip(task, descriptor, &reason, &mut results);
                }
                break;
            }

            if state.in_flight() >= max_concurrent {
                self.wait_for_capacity(&state, max_concurrent).await;
                continue;
            }

            let Some(descriptor) = pending.pop_front() else {
                break;
            };
            let Some(driver) = self.drivers.get(&descriptor.driver) else {
                let result = unfinished(
                    descriptor,
                    DriverOutcome::Blocked,
                    format!("unknown driver '{}'", descriptor.driver),
                );
                self.emit_suite(&task.id, &result);
                results.insert(descriptor.id.clone(), result);
                continue;
            };

            match self.allocate(descriptor, cancel).await {
                Ok(devices) => {
                    debug!(
                        "Dispatching {} on {:?}",
                        descriptor.id,
                        devices.iter().map(|d| d.serial()).collect::<Vec<_>>()
                    );
                    state.dispatched(&descriptor.id);
                    let worker = Worker {
                        pool: Arc::clone(&self.pool),
                        clients: self.clients.clone(),
                        bus: Arc::clone(&self.bus),
                        driver,
                        task_id: task.id.clone(),
                        report_dir: task.config.report_dir.clone(),
                        tx: tx.clone(),
                    };
                    tokio::spawn(worker.run(descriptor.clone(), devices));
                }
                Err(TaskError::Cancelled) => {
                    // Put it back; the next pass reports it with the rest.
                    pending.push_front(descriptor);
                }
                Err(e) => {
                    error!("Stopping task {}: {}", task.name, e);
                    let result = unfinished(descriptor, DriverOutcome::Blocked, e.to_string());
                    self.emit_suite(&task.id, &result);
                    results.insert(descriptor.id.clone(), result);

                    let reason = format!("not executed: {}", e);
                    for descriptor in pending.drain(..) {
                        self.skip(task, descriptor, &reason, &mut results);
                    }
                    error = Some(e);
                    break;
                }
            }
        }

        drop(tx);
        monitor.wait().await;
        if monitor.restarts() > 0 {
            warn!("Completion monitor restarted {} times", monitor.restarts());
        }
        results.extend(state.take_results());

        RunOutcome {
            results,
            error,
            cancelled,
        }
    }

    async fn wait_for_capacity(&self, state: &CompletionState, max_concurrent: usize) {
        let notified = state.completed().notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        if state.in_flight() < max_concurrent {
            return;
        }
        debug!("{} drivers running, waiting for a slot", state.in_flight());
        let _ = tokio::time::timeout(self.config.capacity_poll(), notified).await;
    }

    /// Allocates every device a descriptor needs, or none of them.
    async fn allocate(
        &self,
        descriptor: &TestDriverDescriptor,
        cancel: &CancellationToken,
    ) -> Result<Vec<Arc<Device>>, TaskError> {
        let selector = descriptor.requirement.selector();
        let mut devices = Vec::with_capacity(selector.count);

        for _ in 0..selector.count {
            let applied = tokio::select! {
                device = self.pool.apply_device(&selector) => device.ok_or_else(|| {
                    TaskError::DeviceUnavailable {
                        descriptor: descriptor.id.clone(),
                        selector: selector.to_string(),
                    }
                }),
                _ = cancel.cancelled() => Err(TaskError::Cancelled),
            };
            match applied {
                Ok(device) => devices.push(device),
                Err(e) => {
                    for device in &devices {
                        self.pool.release_device(device);
                    }
                    return Err(e);
                }
            }
        }
        Ok(devices)
    }

    fn skip(
        &self,
        task: &Task,
        descriptor: &TestDriverDescriptor,
        reason: &str,
        results: &mut HashMap<String, DriverResult>,
    ) {
        let result = unfinished(descriptor, DriverOutcome::NotExecuted, reason);
        self.emit_suite(&task.id, &result);
        results.insert(descriptor.id.clone(), result);
    }

    /// Started and ended events for a descriptor that never reached a worker.
    fn emit_suite(&self, task_id: &str, result: &DriverResult) {
        self.bus.notify_stage(&StageEvent::SuiteStarted {
            task_id: task_id.to_string(),
            descriptor_id: result.descriptor_id.clone(),
            driver: result.driver.clone(),
        });
        self.bus.notify_stage(&StageEvent::SuiteEnded {
            task_id: task_id.to_string(),
            descriptor_id: result.descriptor_id.clone(),
            outcome: result.outcome,
            error: result.error.clone(),
        });
    }
}

/// Everything one worker task owns.
struct Worker {
    pool: Arc<DevicePool>,
    clients: ClientFactory,
    bus: Arc<LifeStageBus>,
    driver: Arc<dyn Driver>,
    task_id: String,
    report_dir: Option<PathBuf>,
    tx: mpsc::UnboundedSender<CompletionMessage>,
}

impl Worker {
    async fn run(self, descriptor: TestDriverDescriptor, devices: Vec<Arc<Device>>) {
        let start = Instant::now();
        self.bus.notify_stage(&StageEvent::SuiteStarted {
            task_id: self.task_id.clone(),
            descriptor_id: descriptor.id.clone(),
            driver: descriptor.driver.clone(),
        });

        let (outcome, error) = self.drive(&descriptor, &devices).await;

        for device in &devices {
            self.pool.release_device(device);
        }

        let mut result = DriverResult::new(&descriptor.id, &descriptor.driver, outcome);
        result.error = error;
        result.serials = devices.iter().map(|d| d.serial().to_string()).collect();
        result.duration_ms = start.elapsed().as_millis() as u64;

        self.bus.notify_stage(&StageEvent::SuiteEnded {
            task_id: self.task_id.clone(),
            descriptor_id: descriptor.id.clone(),
            outcome,
            error: result.error.clone(),
        });

        if self.tx.send(CompletionMessage::new(result)).is_err() {
            warn!("Completion queue closed before {} finished", descriptor.id);
        }
    }

    async fn drive(
        &self,
        descriptor: &TestDriverDescriptor,
        devices: &[Arc<Device>],
    ) -> (DriverOutcome, Option<String>) {
        let mut clients: Vec<Arc<dyn DeviceClient>> = Vec::with_capacity(devices.len());
        for device in devices {
            match self.clients.client(Arc::clone(device)) {
                Ok(client) => clients.push(Arc::new(client)),
                Err(e) => return (DriverOutcome::Blocked, Some(e.to_string())),
            }
        }

        let ctx = DriverContext::new(
            descriptor.clone(),
            clients,
            StageEmitter::new(Arc::clone(&self.bus), descriptor.id.clone()),
        )
        .with_report_dir(self.report_dir.clone());

        match AssertUnwindSafe(self.driver.run(&ctx)).catch_unwind().await {
            Ok(Ok(Verdict::Passed)) => (DriverOutcome::Passed, None),
            Ok(Ok(Verdict::Failed(message))) => (DriverOutcome::Failed, Some(message)),
            Ok(Err(e)) => {
                warn!("Driver {} blocked: {}", descriptor.id, e);
                (DriverOutcome::Blocked, Some(e.to_string()))
            }
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                error!("Driver {} panicked: {}", descriptor.id, message);
                (
                    DriverOutcome::Blocked,
                    Some(format!("driver panicked: {}", message)),
                )
            }
        }
    }
}

/// Result for a descriptor that did not run to completion on a worker.
fn unfinished(
    descriptor: &TestDriverDescriptor,
    outcome: DriverOutcome,
    error: impl Into<String>,
) -> DriverResult {
    DriverResult::new(&descriptor.id, &descriptor.driver, outcome).with_error(error)
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}
