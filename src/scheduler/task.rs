//! Tasks and test driver descriptors.

use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::bail;
use serde::{Deserialize, Serialize};

use crate::config::{Config, TaskFile};
use crate::device::DeviceRequirement;
use crate::report::TaskReport;

/// One unit of work for a driver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestDriverDescriptor {
    /// Unique within the task; repeated copies get a `_<round>` suffix.
    pub id: String,
    /// Registered driver name.
    pub driver: String,
    pub requirement: DeviceRequirement,
    pub params: BTreeMap<String, String>,
    /// Problem found when the task was built. A descriptor with an error
    /// fails the whole task at submission.
    pub error: Option<String>,
    /// Repeat round, starting at 1, for expanded copies.
    pub round: Option<u32>,
}

impl TestDriverDescriptor {
    pub fn new(id: impl Into<String>, driver: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            driver: driver.into(),
            requirement: DeviceRequirement::default(),
            params: BTreeMap::new(),
            error: None,
            round: None,
        }
    }

    pub fn with_requirement(mut self, requirement: DeviceRequirement) -> Self {
        self.requirement = requirement;
        self
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    /// A copy for repeat round `round`.
    pub fn repeated(&self, round: u32) -> Self {
        Self {
            id: format!("{}_{}", self.id, round),
            round: Some(round),
            ..self.clone()
        }
    }
}

/// Per-task execution settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskConfig {
    /// Rounds to run; 0 and 1 both run once.
    pub repeat: u32,
    /// Auto-retry budget requested by this task.
    pub auto_retry: u32,
    pub report_dir: Option<PathBuf>,
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            repeat: 1,
            auto_retry: 0,
            report_dir: None,
        }
    }
}

/// A named, ordered set of driver descriptors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub name: String,
    pub descriptors: Vec<TestDriverDescriptor>,
    pub config: TaskConfig,
}

impl Task {
    pub fn new(name: impl Into<String>, descriptors: Vec<TestDriverDescriptor>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.into(),
            descriptors,
            config: TaskConfig::default(),
        }
    }

    pub fn with_config(mut self, config: TaskConfig) -> Self {
        self.config = config;
        self
    }

    /// Builds a task from a task file, filling gaps from the runner config.
    ///
    /// Device requirements that can never be met are recorded on their
    /// descriptor rather than rejected here, so the scheduler reports them.
    pub fn from_file(file: TaskFile, config: &Config) -> Self {
        let descriptors = file
            .drivers
            .into_iter()
            .map(|spec| {
                let error = spec.device.static_error();
                TestDriverDescriptor {
                    id: spec.id,
                    driver: spec.driver,
                    requirement: spec.device,
                    params: spec.params,
                    error,
                    round: None,
                }
            })
            .collect();

        let report_dir = file.task.report_dir.unwrap_or_else(|| {
            let stamp = chrono::Local::now().format("%Y-%m-%d-%H-%M-%S");
            config
                .report
                .output_dir
                .join(format!("{}-{}", file.task.name, stamp))
        });

        Self::new(file.task.name, descriptors).with_config(TaskConfig {
            repeat: file.task.repeat,
            auto_retry: file.task.auto_retry.unwrap_or(config.runner.auto_retry),
            report_dir: Some(report_dir),
        })
    }

    /// A task that reruns what a finished run left behind.
    ///
    /// With `only_unpassed` only descriptors that did not pass are kept,
    /// otherwise every descriptor of the report runs again. Descriptors were
    /// stored after repeat expansion, so the new task does not repeat.
    pub fn from_report(report: &TaskReport, only_unpassed: bool) -> anyhow::Result<Self> {
        if report.descriptors.is_empty() {
            bail!("report of task {} lists no descriptors", report.task_id);
        }
        let descriptors = if only_unpassed {
            report.unpassed_descriptors()
        } else {
            report.descriptors.clone()
        };
        if descriptors.is_empty() {
            bail!("every descriptor of task {} passed", report.task_id);
        }

        Ok(Self::new(report.name.clone(), descriptors))
    }

    /// The task re-issued by auto-retry: same descriptors, no repeat.
    pub fn retry(&self) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            config: TaskConfig {
                repeat: 1,
                ..self.config.clone()
            },
            ..self.clone()
        }
    }
}

/// Expands descriptors for `repeat` rounds, round by round.
///
/// With `repeat <= 1` the descriptors are returned unchanged.
pub fn expand_repeat(descriptors: &[TestDriverDescriptor], repeat: u32) -> Vec<TestDriverDescriptor> {
    if repeat <= 1 {
        return descriptors.to_vec();
    }
    (1..=repeat)
        .flat_map(|round| descriptors.iter().map(move |d| d.repeated(round)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::load_task_str;

    #[test]
    fn test_expand_repeat_round_major() {
        let descriptors = vec![
            TestDriverDescriptor::new("a", "shell"),
            TestDriverDescriptor::new("b", "shell"),
        ];

        let expanded = expand_repeat(&descriptors, 3);
        let ids: Vec<_> = expanded.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, vec!["a_1", "b_1", "a_2", "b_2", "a_3", "b_3"]);
        assert_eq!(expanded[4].round, Some(3));

        assert_eq!(expand_repeat(&descriptors, 1), descriptors);
        assert_eq!(expand_repeat(&descriptors, 0), descriptors);
    }

    #[test]
    fn test_expanded_copies_are_independent() {
        let descriptors = vec![TestDriverDescriptor::new("a", "shell").with_param("k", "v")];
        let mut expanded = expand_repeat(&descriptors, 2);
        expanded[0].params.insert("k".to_string(), "changed".to_string());

        assert_eq!(expanded[1].params["k"], "v");
        assert_eq!(descriptors[0].params["k"], "v");
    }

    #[test]
    fn test_from_file() {
        let file = load_task_str(
            r#"
            [task]
            name = "smoke"
            repeat = 2

            [[drivers]]
            id = "ok"
            driver = "shell"

            [[drivers]]
            id = "bad"
            driver = "shell"
            device = { count = 0 }
            "#,
        )
        .unwrap();
        let mut config = Config::default();
        config.runner.auto_retry = 4;

        let task = Task::from_file(file, &config);

        assert_eq!(task.name, "smoke");
        assert_eq!(task.config.repeat, 2);
        assert_eq!(task.config.auto_retry, 4);
        assert!(task.descriptors[0].error.is_none());
        assert!(task.descriptors[1].error.is_some());
        let dir = task.config.report_dir.unwrap();
        assert!(dir.starts_with("reports"));
        assert!(dir.to_string_lossy().contains("smoke-"));
    }

    #[test]
    fn test_from_report_keeps_unpassed() {
        use crate::report::DriverOutcome;
        use crate::report::tests::sample_report;

        let report = sample_report(&[
            DriverOutcome::Passed,
            DriverOutcome::Blocked,
            DriverOutcome::Failed,
        ]);

        let task = Task::from_report(&report, true).unwrap();
        assert_ne!(task.id, report.task_id);
        assert_eq!(task.name, "smoke");
        let ids: Vec<_> = task.descriptors.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, vec!["d1", "d2"]);
        assert_eq!(task.descriptors[0].params["command"], "true");
        assert_eq!(task.config.repeat, 1);

        let all = Task::from_report(&report, false).unwrap();
        assert_eq!(all.descriptors.len(), 3);
    }

    #[test]
    fn test_from_report_with_nothing_to_rerun() {
        use crate::report::DriverOutcome;
        use crate::report::tests::sample_report;

        let passed = sample_report(&[DriverOutcome::Passed]);
        let err = Task::from_report(&passed, true).unwrap_err();
        assert!(err.to_string().contains("passed"));

        let mut bare = sample_report(&[DriverOutcome::Failed]);
        bare.descriptors.clear();
        assert!(Task::from_report(&bare, true).is_err());
    }

    #[test]
    fn test_retry_clears_repeat() {
        let task = Task::new("t", vec![TestDriverDescriptor::new("a", "shell")]).with_config(
            TaskConfig {
                repeat: 5,
                auto_retry: 2,
                report_dir: None,
            },
        );
        let retry = task.retry();

        assert_ne!(retry.id, task.id);
        assert_eq!(retry.name, task.name);
        assert_eq!(retry.descriptors, task.descriptors);
        assert_eq!(retry.config.repeat, 1);
        assert_eq!(retry.config.auto_retry, 2);
    }
}
