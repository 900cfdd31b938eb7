//! Recently submitted tasks.
//!
//! A running scheduler records every task it starts. A later invocation
//! rebuilds the same list from the JSON reports under the output directory.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::warn;

use super::Task;
use crate::report::json::{REPORT_FILE, read_report};
use crate::report::{Summary, TaskReport};

pub const MAX_HISTORY: usize = 50;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HistoryEntry {
    pub task_id: String,
    pub name: String,
    pub report_dir: Option<PathBuf>,
    pub submitted_at: DateTime<Utc>,
    /// Known once the task has finished.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<Summary>,
}

impl HistoryEntry {
    fn from_report(report: &TaskReport, dir: &Path) -> Self {
        Self {
            task_id: report.task_id.clone(),
            name: report.name.clone(),
            report_dir: Some(dir.to_path_buf()),
            submitted_at: report.started_at,
            summary: Some(report.summary),
        }
    }

    /// Path of the entry's `report.json`, if it has a report directory.
    pub fn report_path(&self) -> Option<PathBuf> {
        self.report_dir.as_ref().map(|dir| dir.join(REPORT_FILE))
    }
}

/// The last [`MAX_HISTORY`] tasks, oldest first.
#[derive(Debug, Default)]
pub struct CommandHistory {
    entries: VecDeque<HistoryEntry>,
}

impl CommandHistory {
    /// Rebuilds history from the reports in `output_dir`.
    ///
    /// Looks at `<dir>/report.json` and `<dir>/retry-<n>/report.json` for
    /// every directory in `output_dir`. Unreadable reports are skipped with a
    /// warning. A missing `output_dir` yields an empty history.
    pub fn from_reports(output_dir: &Path) -> anyhow::Result<Self> {
        let mut history = Self::default();
        if !output_dir.exists() {
            return Ok(history);
        }

        let mut found = Vec::new();
        for dir in subdirectories(output_dir)? {
            collect_report(&dir, &mut found);
            for retry in subdirectories(&dir)? {
                let is_retry = retry
                    .file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.starts_with("retry-"));
                if is_retry {
                    collect_report(&retry, &mut found);
                }
            }
        }

        found.sort_by_key(|entry| entry.submitted_at);
        for entry in found {
            history.push(entry);
        }
        Ok(history)
    }

    pub fn record(&mut self, task: &Task) {
        self.push(HistoryEntry {
            task_id: task.id.clone(),
            name: task.name.clone(),
            report_dir: task.config.report_dir.clone(),
            submitted_at: Utc::now(),
            summary: None,
        });
    }

    fn push(&mut self, entry: HistoryEntry) {
        self.entries.push_back(entry);
        while self.entries.len() > MAX_HISTORY {
            self.entries.pop_front();
        }
    }

    pub fn entries(&self) -> Vec<HistoryEntry> {
        self.entries.iter().cloned().collect()
    }

    pub fn last(&self) -> Option<&HistoryEntry> {
        self.entries.back()
    }

    /// The newest entry whose task id is `task_id` or starts with it.
    pub fn find(&self, task_id: &str) -> Option<&HistoryEntry> {
        if task_id.is_empty() {
            return None;
        }
        self.entries
            .iter()
            .rev()
            .find(|entry| entry.task_id.starts_with(task_id))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn subdirectories(dir: &Path) -> anyhow::Result<Vec<PathBuf>> {
    let entries = std::fs::read_dir(dir)
        .with_context(|| format!("Failed to read directory: {}", dir.display()))?;
    let mut dirs = Vec::new();
    for entry in entries {
        let path = entry
            .with_context(|| format!("Failed to read directory: {}", dir.display()))?
            .path();
        if path.is_dir() {
            dirs.push(path);
        }
    }
    Ok(dirs)
}

fn collect_report(dir: &Path, found: &mut Vec<HistoryEntry>) {
    let path = dir.join(REPORT_FILE);
    if !path.is_file() {
        return;
    }
    match read_report(&path) {
        Ok(report) => found.push(HistoryEntry::from_report(&report, dir)),
        Err(e) => warn!("Skipping report: {:#}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::report::tests::sample_report;
    use crate::report::{DriverOutcome, JsonReporter, Reporter};

    #[test]
    fn test_keeps_last_fifty() {
        let mut history = CommandHistory::default();
        for i in 0..60 {
            history.record(&Task::new(format!("t{}", i), Vec::new()));
        }

        assert_eq!(history.len(), MAX_HISTORY);
        let entries = history.entries();
        assert_eq!(entries[0].name, "t10");
        assert_eq!(history.last().unwrap().name, "t59");
    }

    #[test]
    fn test_find_by_id_prefix() {
        let mut history = CommandHistory::default();
        let first = Task::new("first", Vec::new());
        let second = Task::new("second", Vec::new());
        history.record(&first);
        history.record(&second);

        assert_eq!(history.find(&first.id).unwrap().name, "first");
        assert_eq!(history.find(&second.id[..8]).unwrap().name, "second");
        assert!(history.find("not-a-task").is_none());
        assert!(history.find("").is_none());
    }

    #[tokio::test]
    async fn test_from_reports() {
        let dir = tempfile::tempdir().unwrap();
        let reporter = JsonReporter::new(dir.path());

        let mut older = sample_report(&[DriverOutcome::Failed]);
        older.task_id = "aaa".to_string();
        older.started_at = Utc::now() - chrono::Duration::minutes(5);
        reporter.on_task_complete(&older).await.unwrap();

        let mut retried = older.clone();
        retried.task_id = "bbb".to_string();
        retried.report_dir = Some(dir.path().join("aaa"));
        retried.retry_round = 1;
        retried.started_at = Utc::now() - chrono::Duration::minutes(4);
        reporter.on_task_complete(&retried).await.unwrap();

        let mut newer = sample_report(&[DriverOutcome::Passed, DriverOutcome::Passed]);
        newer.task_id = "ccc".to_string();
        reporter.on_task_complete(&newer).await.unwrap();

        std::fs::create_dir_all(dir.path().join("broken")).unwrap();
        std::fs::write(dir.path().join("broken").join(REPORT_FILE), "{").unwrap();
        std::fs::create_dir_all(dir.path().join("empty")).unwrap();

        let history = CommandHistory::from_reports(dir.path()).unwrap();

        let ids: Vec<_> = history.entries().into_iter().map(|e| e.task_id).collect();
        assert_eq!(ids, vec!["aaa", "bbb", "ccc"]);
        let retry = history.find("bbb").unwrap();
        assert!(retry.report_dir.as_ref().unwrap().ends_with("aaa/retry-1"));
        assert!(retry.report_path().unwrap().is_file());
        assert_eq!(history.last().unwrap().summary.unwrap().passed, 2);
    }

    #[test]
    fn test_from_missing_output_dir() {
        let dir = tempfile::tempdir().unwrap();
        let history = CommandHistory::from_reports(&dir.path().join("nowhere")).unwrap();
        assert!(history.is_empty());
    }
}
