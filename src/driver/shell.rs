//! Driver that runs one shell command on each allocated device.
//!
//! Parameters:
//!
//! | Key | Required | Meaning |
//! |-----|----------|---------|
//! | `command` | yes | command line run on the device |
//! | `expect` | no | substring the output must contain |
//! | `timeout_secs` | no | per-device command timeout, default 60 |
//!
//! Each device is reported as one test case named `<descriptor>@<serial>`.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use super::{Driver, DriverContext, DriverError, Verdict};

const DEFAULT_TIMEOUT_SECS: u64 = 60;

pub struct ShellDriver;

impl ShellDriver {
    fn timeout(params: &BTreeMap<String, String>) -> Result<Duration, String> {
        match params.get("timeout_secs") {
            None => Ok(Duration::from_secs(DEFAULT_TIMEOUT_SECS)),
            Some(raw) => raw
                .parse::<u64>()
                .map(Duration::from_secs)
                .map_err(|_| format!("timeout_secs '{}' is not a number", raw)),
        }
    }
}

#[async_trait]
impl Driver for ShellDriver {
    fn name(&self) -> &str {
        "shell"
    }

    fn validate(&self, params: &BTreeMap<String, String>) -> Result<(), String> {
        match params.get("command") {
            Some(command) if !command.trim().is_empty() => {}
            _ => return Err("missing required parameter 'command'".to_string()),
        }
        Self::timeout(params).map(|_| ())
    }

    async fn run(&self, ctx: &DriverContext) -> Result<Verdict, DriverError> {
        let params = &ctx.descriptor().params;
        let command = ctx
            .param("command")
            .ok_or_else(|| DriverError::InvalidParams("missing 'command'".to_string()))?;
        let timeout = Self::timeout(params).map_err(DriverError::InvalidParams)?;
        let expect = ctx.param("expect");

        if ctx.devices().is_empty() {
            return Err(DriverError::Execution("no device allocated".to_string()));
        }

        let mut failures = Vec::new();
        for client in ctx.devices() {
            let case = format!("{}@{}", ctx.descriptor().id, client.device().serial());
            ctx.stages().case_started(&case);

            let output = match client.execute(command, timeout).await {
                Ok(output) => output,
                Err(e) => {
                    ctx.stages().case_ended(&case, false, Some(e.to_string()));
                    return Err(e.into());
                }
            };
            debug!("{} output: {}", case, output.trim());

            match expect {
                Some(expected) if !output.contains(expected) => {
                    let message = format!("output does not contain '{}'", expected);
                    ctx.stages().case_ended(&case, false, Some(message.clone()));
                    failures.push(format!("{}: {}", client.device().serial(), message));
                }
                _ => ctx.stages().case_ended(&case, true, None),
            }
        }

        if failures.is_empty() {
            Ok(Verdict::Passed)
        } else {
            Ok(Verdict::Failed(failures.join("; ")))
        }
    }
}
