//! Configuration schema definitions for devrunner.
//!
//! Two kinds of TOML documents are described here: the runner configuration
//! (`devrunner.toml`), which sets up connectors, the device pool and the
//! scheduler, and task files, which list the test drivers to run.
//!
//! # Schema Overview
//!
//! ```text
//! Config (root)
//! ├── RunnerConfig        - Scheduler settings (concurrency, auto-retry)
//! ├── PoolConfig          - Allow list, aliases, allocation backoff
//! ├── RecoveryConfig      - Device recovery attempts and timeouts
//! ├── ConnectorConfig[]   - One entry per connector server
//! └── ReportConfig        - Output and reporting settings
//!
//! TaskFile (root)
//! ├── TaskSection         - Name, repeat, auto-retry, report directory
//! └── DriverSpec[]        - One entry per test driver descriptor
//! ```

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::device::DeviceRequirement;

/// Root runner configuration.
///
/// Every section is optional; an empty file yields a runner with one local
/// connector-less pool and default scheduling limits.
///
/// # TOML Structure
///
/// ```toml
/// [runner]
/// max_concurrent = 5
///
/// [pool]
/// allow_list = ["SN0001", "SN0002"]
///
/// [[connectors]]
/// binary = "hdc"
/// host = "127.0.0.1"
/// port = 8710
///
/// [report]
/// output_dir = "reports"
/// ```
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub runner: RunnerConfig,

    #[serde(default)]
    pub pool: PoolConfig,

    #[serde(default)]
    pub recovery: RecoveryConfig,

    /// Connector servers to watch for devices.
    #[serde(default)]
    pub connectors: Vec<ConnectorConfig>,

    #[serde(default)]
    pub report: ReportConfig,
}

/// Scheduler settings.
///
/// # Defaults
///
/// | Field | Default |
/// |-------|---------|
/// | `max_concurrent` | 5 |
/// | `capacity_poll_ms` | 3000 |
/// | `auto_retry` | 0 (disabled) |
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RunnerConfig {
    /// Maximum number of drivers running at once.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,

    /// How long the dispatcher sleeps at capacity before re-checking, in
    /// milliseconds. A completing driver wakes it earlier.
    #[serde(default = "default_capacity_poll_ms")]
    pub capacity_poll_ms: u64,

    /// Default auto-retry budget for tasks that do not set their own.
    ///
    /// Capped at 10.
    #[serde(default)]
    pub auto_retry: u32,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
            capacity_poll_ms: default_capacity_poll_ms(),
            auto_retry: 0,
        }
    }
}

impl RunnerConfig {
    pub fn capacity_poll(&self) -> Duration {
        Duration::from_millis(self.capacity_poll_ms)
    }
}

fn default_max_concurrent() -> usize {
    5
}

fn default_capacity_poll_ms() -> u64 {
    3000
}

/// Device pool settings.
///
/// # Defaults
///
/// | Field | Default |
/// |-------|---------|
/// | `allow_list` | empty (every device is usable) |
/// | `aliases` | empty |
/// | `apply_attempts` | 4 |
/// | `apply_backoff_unit_ms` | 1000 |
///
/// Attempt `n` of an allocation waits `(n * 2 + 1) × apply_backoff_unit_ms`
/// before the next scan, so the defaults wait 1s, 3s and 5s.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PoolConfig {
    /// Serials allowed to run tests. Devices not on the list are tracked
    /// but never allocated. An empty list allows every device.
    #[serde(default)]
    pub allow_list: Vec<String>,

    /// Human-readable names keyed by serial.
    #[serde(default)]
    pub aliases: HashMap<String, String>,

    #[serde(default = "default_apply_attempts")]
    pub apply_attempts: usize,

    #[serde(default = "default_apply_backoff_unit_ms")]
    pub apply_backoff_unit_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            allow_list: Vec::new(),
            aliases: HashMap::new(),
            apply_attempts: default_apply_attempts(),
            apply_backoff_unit_ms: default_apply_backoff_unit_ms(),
        }
    }
}

impl PoolConfig {
    pub fn apply_backoff_unit(&self) -> Duration {
        Duration::from_millis(self.apply_backoff_unit_ms)
    }
}

fn default_apply_attempts() -> usize {
    4
}

fn default_apply_backoff_unit_ms() -> u64 {
    1000
}

/// Device recovery settings used by the recovering client.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RecoveryConfig {
    /// Attempts per device operation, including the first one.
    #[serde(default = "default_recovery_attempts")]
    pub attempts: usize,

    /// How long recovery waits for a device to come back online.
    #[serde(default = "default_online_timeout_secs")]
    pub online_timeout_secs: u64,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            attempts: default_recovery_attempts(),
            online_timeout_secs: default_online_timeout_secs(),
        }
    }
}

impl RecoveryConfig {
    pub fn online_timeout(&self) -> Duration {
        Duration::from_secs(self.online_timeout_secs)
    }
}

fn default_recovery_attempts() -> usize {
    3
}

fn default_online_timeout_secs() -> u64 {
    20
}

/// One connector server.
///
/// # Example
///
/// ```toml
/// [[connectors]]
/// binary = "/opt/toolchains/hdc"
/// host = "192.168.1.20"
/// port = 8710
/// poll_interval_ms = 1000
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ConnectorConfig {
    /// Connector executable, optionally with leading arguments.
    #[serde(default = "default_binary")]
    pub binary: String,

    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Interval between device list polls.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Upper bound for a single connector command.
    #[serde(default = "default_command_timeout_secs")]
    pub command_timeout_secs: u64,
}

impl Default for ConnectorConfig {
    fn default() -> Self {
        Self {
            binary: default_binary(),
            host: default_host(),
            port: default_port(),
            poll_interval_ms: default_poll_interval_ms(),
            command_timeout_secs: default_command_timeout_secs(),
        }
    }
}

fn default_binary() -> String {
    "hdc".to_string()
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8710
}

fn default_poll_interval_ms() -> u64 {
    2000
}

fn default_command_timeout_secs() -> u64 {
    300
}

/// Where and how task reports are written.
///
/// # Defaults
///
/// | Field | Default |
/// |-------|---------|
/// | `output_dir` | `"reports"` |
/// | `json` | `true` |
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ReportConfig {
    /// Directory under which each task gets its own report directory.
    #[serde(default = "default_report_dir")]
    pub output_dir: PathBuf,

    /// Whether to write `report.json` for every task.
    #[serde(default = "default_true")]
    pub json: bool,
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            output_dir: default_report_dir(),
            json: true,
        }
    }
}

fn default_report_dir() -> PathBuf {
    PathBuf::from("reports")
}

fn default_true() -> bool {
    true
}

/// A task file.
///
/// ```toml
/// [task]
/// name = "smoke"
/// repeat = 2
///
/// [[drivers]]
/// id = "boot"
/// driver = "shell"
/// device = { label = "phone" }
/// params = { command = "param get const.product.name", expect = "rk3568" }
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TaskFile {
    pub task: TaskSection,

    #[serde(default)]
    pub drivers: Vec<DriverSpec>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TaskSection {
    pub name: String,

    /// Number of rounds to run every driver. Values of 0 and 1 both mean once.
    #[serde(default = "default_repeat")]
    pub repeat: u32,

    /// Auto-retry budget; falls back to `[runner] auto_retry` when absent.
    #[serde(default)]
    pub auto_retry: Option<u32>,

    /// Report directory; defaults to `<output_dir>/<name>-<timestamp>`.
    #[serde(default)]
    pub report_dir: Option<PathBuf>,
}

fn default_repeat() -> u32 {
    1
}

/// One test driver descriptor as written in a task file.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DriverSpec {
    /// Unique id within the task.
    pub id: String,

    /// Registered driver name, e.g. `shell`.
    pub driver: String,

    #[serde(default)]
    pub device: DeviceRequirement,

    /// Free-form driver parameters.
    #[serde(default)]
    pub params: BTreeMap<String, String>,
}
