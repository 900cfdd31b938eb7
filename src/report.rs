//! Task results and reporters.
//!
//! Every run of [`TaskScheduler::execute`](crate::scheduler::TaskScheduler::execute)
//! ends in a [`TaskReport`], which is handed to a [`Reporter`]. Live progress
//! is shown separately by [`ProgressListener`], which listens to stage
//! events rather than waiting for the report.

pub mod json;
pub mod progress;

pub use json::JsonReporter;
pub use progress::ProgressListener;

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::scheduler::TestDriverDescriptor;

/// How a test driver descriptor ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DriverOutcome {
    Passed,
    Failed,
    /// The driver could not complete: driver error, panic, or no device.
    Blocked,
    /// The descriptor was never dispatched.
    NotExecuted,
}

impl DriverOutcome {
    pub fn label(self) -> &'static str {
        match self {
            Self::Passed => "PASS",
            Self::Failed => "FAIL",
            Self::Blocked => "BLCK",
            Self::NotExecuted => "SKIP",
        }
    }
}

/// Result of one test driver descriptor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriverResult {
    pub descriptor_id: String,
    pub driver: String,
    pub outcome: DriverOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Devices the driver ran on.
    #[serde(default)]
    pub serials: Vec<String>,
    pub duration_ms: u64,
}

impl DriverResult {
    pub fn new(descriptor_id: impl Into<String>, driver: impl Into<String>, outcome: DriverOutcome) -> Self {
        Self {
            descriptor_id: descriptor_id.into(),
            driver: driver.into(),
            outcome,
            error: None,
            serials: Vec::new(),
            duration_ms: 0,
        }
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn duration(&self) -> Duration {
        Duration::from_millis(self.duration_ms)
    }
}

/// Outcome counts for a task.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Summary {
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub blocked: usize,
    pub not_executed: usize,
}

impl Summary {
    pub fn from_results(results: &[DriverResult]) -> Self {
        let mut summary = Self {
            total: results.len(),
            ..Default::default()
        };
        for result in results {
            match result.outcome {
                DriverOutcome::Passed => summary.passed += 1,
                DriverOutcome::Failed => summary.failed += 1,
                DriverOutcome::Blocked => summary.blocked += 1,
                DriverOutcome::NotExecuted => summary.not_executed += 1,
            }
        }
        summary
    }

    /// True if anything did not pass.
    pub fn needs_retry(&self) -> bool {
        self.failed + self.blocked + self.not_executed > 0
    }
}

/// The report of one task run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskReport {
    pub task_id: String,
    pub name: String,
    /// 0 for the first run, n for the n-th automatic retry.
    #[serde(default)]
    pub retry_round: u32,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub results: Vec<DriverResult>,
    pub summary: Summary,
    /// Task-level error, such as a parameter error that stopped dispatch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub cancelled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub report_dir: Option<PathBuf>,
    /// The descriptors that ran, after repeat expansion. Lets a later
    /// invocation rerun what did not pass.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub descriptors: Vec<TestDriverDescriptor>,
}

impl TaskReport {
    pub fn duration(&self) -> Duration {
        Duration::from_millis(self.duration_ms)
    }

    /// Returns true if every descriptor passed.
    pub fn success(&self) -> bool {
        self.error.is_none() && !self.summary.needs_retry()
    }

    /// Process exit code for this report.
    pub fn exit_code(&self) -> i32 {
        if self.success() { 0 } else { 1 }
    }

    pub fn result(&self, descriptor_id: &str) -> Option<&DriverResult> {
        self.results.iter().find(|r| r.descriptor_id == descriptor_id)
    }

    /// Descriptors whose result is anything but Passed, in run order.
    pub fn unpassed_descriptors(&self) -> Vec<TestDriverDescriptor> {
        self.descriptors
            .iter()
            .filter(|d| {
                self.result(&d.id)
                    .is_none_or(|r| r.outcome != DriverOutcome::Passed)
            })
            .cloned()
            .collect()
    }
}

/// Receives finished task reports.
#[async_trait]
pub trait Reporter: Send + Sync {
    async fn on_task_complete(&self, report: &TaskReport) -> anyhow::Result<()>;
}

/// A reporter that does nothing.
pub struct NullReporter;

#[async_trait]
impl Reporter for NullReporter {
    async fn on_task_complete(&self, _report: &TaskReport) -> anyhow::Result<()> {
        Ok(())
    }
}

/// A reporter that forwards to several reporters.
///
/// Every reporter runs even if an earlier one fails; the first error is
/// returned.
pub struct MultiReporter {
    reporters: Vec<Box<dyn Reporter>>,
}

impl MultiReporter {
    pub fn new() -> Self {
        Self {
            reporters: Vec::new(),
        }
    }

    pub fn with_reporter<R: Reporter + 'static>(mut self, reporter: R) -> Self {
        self.reporters.push(Box::new(reporter));
        self
    }
}

impl Default for MultiReporter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Reporter for MultiReporter {
    async fn on_task_complete(&self, report: &TaskReport) -> anyhow::Result<()> {
        let mut first_error = None;
        for reporter in &self.reporters {
            if let Err(e) = reporter.on_task_complete(report).await {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

/// Prints a summary of each task to the console.
pub struct ConsoleReporter {
    verbose: bool,
}

impl ConsoleReporter {
    pub fn new(verbose: bool) -> Self {
        Self { verbose }
    }
}

#[async_trait]
impl Reporter for ConsoleReporter {
    async fn on_task_complete(&self, report: &TaskReport) -> anyhow::Result<()> {
        print_summary(report, self.verbose);
        Ok(())
    }
}

/// Prints pass/fail counts with colored output, then any problems.
pub fn print_summary(report: &TaskReport, verbose: bool) {
    let summary = &report.summary;

    println!();
    if report.retry_round > 0 {
        println!("Task {} (retry {}):", report.name, report.retry_round);
    } else {
        println!("Task {}:", report.name);
    }
    println!("  Total:        {}", summary.total);
    println!("  Passed:       {}", console::style(summary.passed).green());
    println!("  Failed:       {}", console::style(summary.failed).red());
    println!("  Blocked:      {}", console::style(summary.blocked).red().bold());
    if summary.not_executed > 0 {
        println!("  Not Executed: {}", console::style(summary.not_executed).yellow());
    }
    println!("  Duration:     {:?}", report.duration());

    if let Some(dir) = &report.report_dir {
        println!("  Reports:      {}", dir.display());
    }

    if report.success() {
        println!();
        println!("{}", console::style("All drivers passed!").green().bold());
        return;
    }

    println!();
    if report.cancelled {
        println!("{}", console::style("Task was terminated.").yellow().bold());
    } else if let Some(error) = &report.error {
        println!("{}", console::style(error).red().bold());
    } else {
        println!("{}", console::style("Some drivers did not pass.").red().bold());
    }

    println!();
    for result in &report.results {
        if result.outcome == DriverOutcome::Passed && !verbose {
            continue;
        }
        let label = match result.outcome {
            DriverOutcome::Passed => console::style(result.outcome.label()).green(),
            DriverOutcome::Failed => console::style(result.outcome.label()).red(),
            DriverOutcome::Blocked => console::style(result.outcome.label()).red().bold(),
            DriverOutcome::NotExecuted => console::style(result.outcome.label()).yellow(),
        };
        println!("  {} {}", label, result.descriptor_id);
        if let Some(error) = &result.error {
            println!("       {}", console::style(error).dim());
        }
    }
}
