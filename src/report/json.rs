//! JSON report files.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::info;

use super::{Reporter, TaskReport};

pub const REPORT_FILE: &str = "report.json";

/// Writes each task report as `report.json`.
///
/// Reports go to the task's own report directory when it has one, otherwise
/// to `<output_dir>/<task_id>/`. Retries get their own `retry-<n>` directory
/// so the first run's report is kept.
pub struct JsonReporter {
    output_dir: PathBuf,
}

impl JsonReporter {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
        }
    }

    pub fn report_path(&self, report: &TaskReport) -> PathBuf {
        let base = report
            .report_dir
            .clone()
            .unwrap_or_else(|| self.output_dir.join(&report.task_id));
        let dir = if report.retry_round > 0 {
            base.join(format!("retry-{}", report.retry_round))
        } else {
            base
        };
        dir.join(REPORT_FILE)
    }
}

#[async_trait]
impl Reporter for JsonReporter {
    async fn on_task_complete(&self, report: &TaskReport) -> Result<()> {
        let path = self.report_path(report);
        write_report(&path, report)?;
        info!("Wrote report to {}", path.display());
        Ok(())
    }
}

fn write_report(path: &Path, report: &TaskReport) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create report directory: {}", parent.display()))?;
    }
    let content = serde_json::to_string_pretty(report).context("Failed to serialize report")?;
    std::fs::write(path, content)
        .with_context(|| format!("Failed to write report: {}", path.display()))?;
    Ok(())
}

/// Reads a report written by [`JsonReporter`].
pub fn read_report(path: &Path) -> Result<TaskReport> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read report: {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("Invalid report: {}", path.display()))
}
