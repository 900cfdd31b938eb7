//! Configuration loading for devrunner.
//!
//! Runner configuration and task files are both TOML. See
//! [`schema`] for the accepted keys and their defaults.

pub mod schema;

pub use schema::*;

use std::path::Path;

use anyhow::{Context, Result, bail};

/// Loads the runner configuration from a TOML file.
///
/// # Errors
///
/// Returns an error if the file cannot be read, is not valid TOML, or does
/// not match the schema.
///
/// # Example
///
/// ```no_run
/// use devrunner::config::load_config;
/// use std::path::Path;
///
/// let config = load_config(Path::new("devrunner.toml"))?;
/// println!("Max concurrent: {}", config.runner.max_concurrent);
/// # Ok::<(), anyhow::Error>(())
/// ```
pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

    Ok(config)
}

/// Loads the runner configuration from a TOML string.
///
/// ```
/// use devrunner::config::load_config_str;
///
/// let config = load_config_str(r#"
///     [runner]
///     max_concurrent = 2
///
///     [[connectors]]
///     port = 9000
/// "#)?;
///
/// assert_eq!(config.runner.max_concurrent, 2);
/// assert_eq!(config.connectors[0].binary, "hdc");
/// # Ok::<(), anyhow::Error>(())
/// ```
pub fn load_config_str(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).context("Failed to parse config")?;

    Ok(config)
}

/// Loads a task file.
pub fn load_task(path: &Path) -> Result<TaskFile> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read task file: {}", path.display()))?;

    parse_task(&content).with_context(|| format!("Invalid task file: {}", path.display()))
}

/// Loads a task file from a TOML string.
pub fn load_task_str(content: &str) -> Result<TaskFile> {
    parse_task(content).context("Invalid task file")
}

fn parse_task(content: &str) -> Result<TaskFile> {
    let file: TaskFile = toml::from_str(content)?;

    if file.drivers.is_empty() {
        bail!("task '{}' declares no drivers", file.task.name);
    }
    let mut seen = std::collections::HashSet::new();
    for spec in &file.drivers {
        if !seen.insert(spec.id.as_str()) {
            bail!("duplicate driver id '{}'", spec.id);
        }
    }

    Ok(file)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = load_config_str("").unwrap();

        assert_eq!(config.runner.max_concurrent, 5);
        assert_eq!(config.runner.capacity_poll_ms, 3000);
        assert_eq!(config.runner.auto_retry, 0);
        assert_eq!(config.pool.apply_attempts, 4);
        assert_eq!(config.pool.apply_backoff_unit_ms, 1000);
        assert_eq!(config.recovery.attempts, 3);
        assert_eq!(config.recovery.online_timeout_secs, 20);
        assert!(config.connectors.is_empty());
        assert!(config.report.json);
    }

    #[test]
    fn test_full_config() {
        let config = load_config_str(
            r#"
            [runner]
            max_concurrent = 2
            auto_retry = 3

            [pool]
            allow_list = ["SN1", "SN2"]
            apply_backoff_unit_ms = 50
            aliases = { SN1 = "left-bench" }

            [[connectors]]
            binary = "/opt/hdc"
            host = "10.0.0.5"

            [[connectors]]
            port = 9000

            [report]
            output_dir = "out"
            json = false
            "#,
        )
        .unwrap();

        assert_eq!(config.runner.auto_retry, 3);
        assert_eq!(config.pool.allow_list, vec!["SN1", "SN2"]);
        assert_eq!(config.pool.aliases["SN1"], "left-bench");
        assert_eq!(config.connectors.len(), 2);
        assert_eq!(config.connectors[0].port, 8710);
        assert_eq!(config.connectors[1].host, "127.0.0.1");
        assert_eq!(config.report.output_dir, std::path::PathBuf::from("out"));
        assert!(!config.report.json);
    }

    #[test]
    fn test_invalid_config() {
        assert!(load_config_str("[runner]\nmax_concurrent = \"many\"").is_err());
    }

    #[test]
    fn test_load_task() {
        let file = load_task_str(
            r#"
            [task]
            name = "smoke"
            repeat = 3

            [[drivers]]
            id = "boot"
            driver = "shell"
            device = { label = "tablet", count = 1 }
            params = { command = "echo ok", expect = "ok" }

            [[drivers]]
            id = "idle"
            driver = "shell"
            params = { command = "true" }
            "#,
        )
        .unwrap();

        assert_eq!(file.task.name, "smoke");
        assert_eq!(file.task.repeat, 3);
        assert_eq!(file.task.auto_retry, None);
        assert_eq!(file.drivers.len(), 2);
        assert_eq!(file.drivers[0].device.label.as_deref(), Some("tablet"));
        assert_eq!(file.drivers[1].device.count, 1);
        assert_eq!(file.drivers[0].params["expect"], "ok");
    }

    #[test]
    fn test_task_rejects_duplicates_and_empty() {
        let dup = r#"
            [task]
            name = "t"
            [[drivers]]
            id = "a"
            driver = "shell"
            [[drivers]]
            id = "a"
            driver = "shell"
        "#;
        let err = load_task_str(dup).unwrap_err();
        assert!(format!("{:#}", err).contains("duplicate driver id"));

        assert!(load_task_str("[task]\nname = \"t\"").is_err());
    }

    #[test]
    fn test_load_task_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("task.toml");
        std::fs::write(
            &path,
            "[task]\nname = \"f\"\n[[drivers]]\nid = \"x\"\ndriver = \"shell\"\n",
        )
        .unwrap();

        let file = load_task(&path).unwrap();
        assert_eq!(file.drivers[0].id, "x");
        assert!(load_task(&dir.path().join("missing.toml")).is_err());
    }
}
