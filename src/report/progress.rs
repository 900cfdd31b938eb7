//! Terminal progress bar driven by stage events.

use std::sync::Mutex;

use indicatif::{ProgressBar, ProgressStyle};

use super::DriverOutcome;
use crate::lifecycle::{LifeStageListener, StageEvent};

/// Shows one progress bar per task and prints a line for every driver that
/// does not pass (or every driver, when verbose).
pub struct ProgressListener {
    progress: Mutex<Option<ProgressBar>>,
    verbose: bool,
}

impl ProgressListener {
    pub fn new(verbose: bool) -> Self {
        Self {
            progress: Mutex::new(None),
            verbose,
        }
    }

    fn bar(&self) -> std::sync::MutexGuard<'_, Option<ProgressBar>> {
        self.progress.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl LifeStageListener for ProgressListener {
    fn on_event(&self, event: &StageEvent) -> anyhow::Result<()> {
        match event {
            StageEvent::TaskStarted {
                name, descriptors, ..
            } => {
                let pb = ProgressBar::new(*descriptors as u64);
                pb.set_style(
                    ProgressStyle::default_bar()
                        .template(
                            "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}",
                        )?
                        .progress_chars("#>-"),
                );
                pb.set_message(name.clone());
                *self.bar() = Some(pb);
            }
            StageEvent::SuiteStarted { descriptor_id, .. } if self.verbose => {
                if let Some(pb) = self.bar().as_ref() {
                    pb.println(format!("Running: {}", descriptor_id));
                }
            }
            StageEvent::SuiteEnded {
                descriptor_id,
                outcome,
                error,
                ..
            } => {
                if let Some(pb) = self.bar().as_ref() {
                    pb.inc(1);
                    let status = match outcome {
                        DriverOutcome::Passed => console::style(outcome.label()).green(),
                        DriverOutcome::Failed => console::style(outcome.label()).red(),
                        DriverOutcome::Blocked => console::style(outcome.label()).red().bold(),
                        DriverOutcome::NotExecuted => console::style(outcome.label()).yellow(),
                    };
                    if self.verbose || *outcome != DriverOutcome::Passed {
                        match error {
                            Some(error) => pb.println(format!(
                                "{} {} {}",
                                status,
                                descriptor_id,
                                console::style(error).dim()
                            )),
                            None => pb.println(format!("{} {}", status, descriptor_id)),
                        }
                    }
                }
            }
            StageEvent::TaskEnded { .. } => {
                if let Some(pb) = self.bar().take() {
                    pb.finish_and_clear();
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "progress"
    }
}
