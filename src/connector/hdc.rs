//! Transport backed by the `hdc` command-line client.
//!
//! Every operation spawns the connector binary with `-s host:port` and, for
//! device operations, `-t <serial>`:
//!
//! ```text
//! hdc -s 127.0.0.1:8710 -t SN0001 shell "param get const.product.name"
//! hdc -s 127.0.0.1:8710 -t SN0001 file send ./app.hap /data/local/tmp/
//! hdc -s 127.0.0.1:8710 list targets -v
//! ```
//!
//! The client reports most failures as text, so output is classified into
//! [`TransportError`] variants before the exit status is considered.

use std::path::Path;
use std::process::Stdio;
use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use tokio::net::TcpStream;
use tracing::{debug, warn};

use super::{ConnectionKind, Transport, TransportError, TransportResult};
use crate::config::ConnectorConfig;
use crate::device::{ConnectivityState, Endpoint};
use crate::pool::ObservedDevice;

/// `<serial> <transport> <state> [<host> [<connector>]]`
static TARGET_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?P<serial>\S+)\s+(?P<link>USB|TCP|UART|BT)\s+(?P<state>\S+)")
        .expect("target line pattern is valid")
});

const PROBE_TIMEOUT: Duration = Duration::from_secs(2);
const INSTALL_TIMEOUT: Duration = Duration::from_secs(600);
const LIST_TIMEOUT: Duration = Duration::from_secs(10);

/// Shells out to a connector binary for every operation.
pub struct HdcConnector {
    /// Binary plus any leading arguments, e.g. `"hdc"` or `"sudo hdc"`.
    binary: String,
    endpoint: Endpoint,
    command_timeout: Duration,
}

impl HdcConnector {
    pub fn new(binary: impl Into<String>, endpoint: Endpoint) -> Self {
        Self {
            binary: binary.into(),
            endpoint,
            command_timeout: Duration::from_secs(300),
        }
    }

    pub fn from_config(config: &ConnectorConfig) -> Self {
        Self::new(
            config.binary.clone(),
            Endpoint::new(config.host.clone(), config.port),
        )
        .with_timeout(Duration::from_secs(config.command_timeout_secs))
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    /// Full argument vector for one invocation.
    fn command_parts(&self, serial: Option<&str>, args: &[&str]) -> Vec<String> {
        let mut parts =
            shell_words::split(&self.binary).unwrap_or_else(|_| vec![self.binary.clone()]);
        parts.push("-s".to_string());
        parts.push(self.endpoint.to_string());
        if let Some(serial) = serial {
            parts.push("-t".to_string());
            parts.push(serial.to_string());
        }
        parts.extend(args.iter().map(|a| a.to_string()));
        parts
    }

    async fn run(
        &self,
        serial: Option<&str>,
        args: &[&str],
        timeout: Duration,
    ) -> TransportResult<String> {
        let parts = self.command_parts(serial, args);
        debug!("Running connector: {:?}", parts);

        let mut cmd = tokio::process::Command::new(&parts[0]);
        cmd.args(&parts[1..]);
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);

        let output = tokio::time::timeout(timeout, cmd.output())
            .await
            .map_err(|_| TransportError::Timeout(timeout))?
            .map_err(|e| TransportError::Spawn(format!("{}: {}", parts[0], e)))?;

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr);

        if let Some(err) = classify_output(&format!("{}{}", stdout, stderr), serial) {
            return Err(err);
        }
        if !output.status.success() {
            let message = if stderr.trim().is_empty() {
                stdout.trim().to_string()
            } else {
                stderr.trim().to_string()
            };
            return Err(TransportError::Rejected(message));
        }

        Ok(stdout)
    }
}

#[async_trait]
impl Transport for HdcConnector {
    fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    async fn execute(
        &self,
        serial: &str,
        command: &str,
        timeout: Duration,
    ) -> TransportResult<String> {
        self.run(Some(serial), &["shell", command], timeout).await
    }

    async fn push(
        &self,
        serial: &str,
        local: &Path,
        remote: &str,
        timeout: Duration,
    ) -> TransportResult<()> {
        let local = local.to_string_lossy();
        self.run(Some(serial), &["file", "send", &local, remote], timeout)
            .await
            .map(|_| ())
    }

    async fn pull(
        &self,
        serial: &str,
        remote: &str,
        local: &Path,
        timeout: Duration,
    ) -> TransportResult<()> {
        let local = local.to_string_lossy();
        self.run(Some(serial), &["file", "recv", remote, &local], timeout)
            .await
            .map(|_| ())
    }

    async fn install(&self, serial: &str, package: &Path) -> TransportResult<()> {
        let package = package.to_string_lossy();
        self.run(Some(serial), &["install", "-r", &package], INSTALL_TIMEOUT)
            .await
            .map(|_| ())
    }

    async fn uninstall(&self, serial: &str, bundle: &str) -> TransportResult<()> {
        self.run(Some(serial), &["uninstall", bundle], self.command_timeout)
            .await
            .map(|_| ())
    }

    async fn reboot(&self, serial: &str) -> TransportResult<()> {
        self.run(Some(serial), &["target", "boot"], self.command_timeout)
            .await
            .map(|_| ())
    }

    async fn list_targets(&self) -> TransportResult<Vec<ObservedDevice>> {
        let stdout = self.run(None, &["list", "targets", "-v"], LIST_TIMEOUT).await?;
        Ok(parse_targets(&stdout, &self.endpoint))
    }

    async fn is_running(&self) -> bool {
        let addr = self.endpoint.to_string();
        match tokio::time::timeout(PROBE_TIMEOUT, TcpStream::connect(&addr)).await {
            Ok(Ok(_)) => true,
            Ok(Err(e)) => {
                warn!("Connector {} is not accepting connections: {}", addr, e);
                false
            }
            Err(_) => {
                warn!("Connector {} did not answer within {:?}", addr, PROBE_TIMEOUT);
                false
            }
        }
    }
}

/// Maps connector output onto a transport error, if it reports one.
fn classify_output(output: &str, serial: Option<&str>) -> Option<TransportError> {
    let lower = output.to_ascii_lowercase();

    let connection = if lower.contains("connection reset") {
        Some(ConnectionKind::Reset)
    } else if lower.contains("connection refused") || lower.contains("connect server failed") {
        Some(ConnectionKind::Refused)
    } else if lower.contains("connection aborted") {
        Some(ConnectionKind::Aborted)
    } else {
        None
    };
    if let Some(kind) = connection {
        return Some(TransportError::Connection {
            kind,
            message: output.trim().to_string(),
        });
    }

    if lower.contains("device not found") || lower.contains("device not founded") {
        return Some(TransportError::DeviceNotFound(
            serial.unwrap_or_default().to_string(),
        ));
    }

    let first = output.lines().next().unwrap_or_default().trim();
    if first.to_ascii_lowercase().starts_with("[fail]") {
        return Some(TransportError::Rejected(first.to_string()));
    }

    None
}

/// Parses `list targets -v` output.
pub(crate) fn parse_targets(output: &str, endpoint: &Endpoint) -> Vec<ObservedDevice> {
    output
        .lines()
        .filter_map(|line| {
            let caps = TARGET_LINE.captures(line.trim())?;
            Some(ObservedDevice::new(
                &caps["serial"],
                endpoint.clone(),
                ConnectivityState::parse(&caps["state"]),
            ))
        })
        .collect()
}
