//! Test drivers.
//!
//! A [`Driver`] runs one test driver descriptor on the devices the scheduler
//! allocated for it. Drivers are looked up by name in a [`DriverRegistry`];
//! the built-in [`ShellDriver`] is registered as `shell`.
//!
//! A driver reports its verdict through its return value:
//!
//! | Return | Outcome |
//! |--------|---------|
//! | `Ok(Verdict::Passed)` | Passed |
//! | `Ok(Verdict::Failed(_))` | Failed |
//! | `Err(DriverError)` or panic | Blocked |

pub mod shell;

pub use shell::ShellDriver;

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;

use crate::client::{DeviceClient, DeviceError};
use crate::lifecycle::{LifeStageBus, StageEvent};
use crate::scheduler::TestDriverDescriptor;

/// Errors a driver can end with. All of them block the descriptor.
#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    #[error(transparent)]
    Device(#[from] DeviceError),

    #[error("Invalid parameters: {0}")]
    InvalidParams(String),

    #[error("Execution failed: {0}")]
    Execution(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Verdict of a driver that ran to completion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Passed,
    Failed(String),
}

/// A kind of test driver.
#[async_trait]
pub trait Driver: Send + Sync {
    fn name(&self) -> &str;

    /// Checks parameters before anything runs. An error here fails the whole
    /// task at submission.
    fn validate(&self, _params: &BTreeMap<String, String>) -> Result<(), String> {
        Ok(())
    }

    async fn run(&self, ctx: &DriverContext) -> Result<Verdict, DriverError>;
}

/// Reports test cases of one descriptor to the life-stage bus.
#[derive(Clone)]
pub struct StageEmitter {
    bus: Arc<LifeStageBus>,
    descriptor_id: String,
}

impl StageEmitter {
    pub fn new(bus: Arc<LifeStageBus>, descriptor_id: impl Into<String>) -> Self {
        Self {
            bus,
            descriptor_id: descriptor_id.into(),
        }
    }

    pub fn case_started(&self, case: &str) {
        self.bus.notify_stage(&StageEvent::CaseStarted {
            descriptor_id: self.descriptor_id.clone(),
            case: case.to_string(),
        });
    }

    pub fn case_ended(&self, case: &str, passed: bool, message: Option<String>) {
        self.bus.notify_stage(&StageEvent::CaseEnded {
            descriptor_id: self.descriptor_id.clone(),
            case: case.to_string(),
            passed,
            message,
        });
    }
}

/// Everything a driver gets for one run.
pub struct DriverContext {
    descriptor: TestDriverDescriptor,
    devices: Vec<Arc<dyn DeviceClient>>,
    stages: StageEmitter,
    report_dir: Option<PathBuf>,
}

impl DriverContext {
    pub fn new(
        descriptor: TestDriverDescriptor,
        devices: Vec<Arc<dyn DeviceClient>>,
        stages: StageEmitter,
    ) -> Self {
        Self {
            descriptor,
            devices,
            stages,
            report_dir: None,
        }
    }

    pub fn with_report_dir(mut self, dir: Option<PathBuf>) -> Self {
        self.report_dir = dir;
        self
    }

    pub fn descriptor(&self) -> &TestDriverDescriptor {
        &self.descriptor
    }

    pub fn param(&self, key: &str) -> Option<&str> {
        self.descriptor.params.get(key).map(String::as_str)
    }

    /// Clients for the allocated devices, in allocation order.
    pub fn devices(&self) -> &[Arc<dyn DeviceClient>] {
        &self.devices
    }

    pub fn stages(&self) -> &StageEmitter {
        &self.stages
    }

    pub fn report_dir(&self) -> Option<&Path> {
        self.report_dir.as_deref()
    }
}

/// Drivers by name.
#[derive(Clone, Default)]
pub struct DriverRegistry {
    drivers: HashMap<String, Arc<dyn Driver>>,
}

impl DriverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with the built-in drivers.
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(ShellDriver));
        registry
    }

    /// Registers a driver under its own name, replacing any earlier one.
    pub fn register(&mut self, driver: Arc<dyn Driver>) {
        self.drivers.insert(driver.name().to_string(), driver);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Driver>> {
        self.drivers.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.drivers.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.drivers.keys().cloned().collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry() {
        let registry = DriverRegistry::with_builtin();
        assert!(registry.contains("shell"));
        assert_eq!(registry.names(), vec!["shell"]);
        assert!(registry.get("xts").is_none());
    }

    #[test]
    fn test_context_params() {
        let mut descriptor = TestDriverDescriptor::new("a", "shell");
        descriptor
            .params
            .insert("command".to_string(), "ls".to_string());
        let ctx = DriverContext::new(
            descriptor,
            Vec::new(),
            StageEmitter::new(Arc::new(LifeStageBus::new()), "a"),
        );

        assert_eq!(ctx.param("command"), Some("ls"));
        assert_eq!(ctx.param("missing"), None);
        assert!(ctx.report_dir().is_none());
    }
}
