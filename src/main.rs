//! devrunner CLI - run test drivers on connected devices.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{Level, info, warn};
use tracing_subscriber::FmtSubscriber;

use devrunner::client::ClientFactory;
use devrunner::config::{self, Config, ConnectorConfig};
use devrunner::connector::{ConnectorSet, DeviceWatcher, HdcConnector, Transport};
use devrunner::driver::DriverRegistry;
use devrunner::pool::DevicePool;
use devrunner::report::json::{REPORT_FILE, read_report};
use devrunner::report::{ConsoleReporter, JsonReporter, MultiReporter, ProgressListener};
use devrunner::scheduler::{CommandHistory, Task, TaskScheduler};

const DEFAULT_CONFIG: &str = "devrunner.toml";

#[derive(Parser)]
#[command(name = "devrunner")]
#[command(about = "Run test drivers on connected devices", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = DEFAULT_CONFIG)]
    config: PathBuf,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a task file
    Run {
        /// Task file path
        #[arg(required_unless_present = "retry")]
        task: Option<PathBuf>,

        /// Rerun what did not pass in an earlier report (directory or report.json)
        #[arg(long, value_name = "REPORT", conflicts_with = "task")]
        retry: Option<PathBuf>,

        /// Override maximum concurrent drivers
        #[arg(short, long)]
        parallel: Option<usize>,

        /// Override the task's repeat count
        #[arg(long)]
        repeat: Option<u32>,

        /// Override the auto-retry budget
        #[arg(long)]
        auto_retry: Option<u32>,
    },

    /// List connected devices
    List {
        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// List recent tasks, or show one task's results
    History {
        /// Task id, or a prefix of one
        task_id: Option<String>,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Validate the configuration and, optionally, a task file
    Validate {
        /// Task file to check against the configuration
        task: Option<PathBuf>,
    },

    /// Initialize a new configuration file
    Init {
        /// Connector server host
        #[arg(long, default_value = "127.0.0.1")]
        host: String,

        /// Connector server port
        #[arg(long, default_value_t = 8710)]
        port: u16,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Commands::Run {
            task,
            retry,
            parallel,
            repeat,
            auto_retry,
        } => {
            let source = match (task, retry) {
                (_, Some(report)) => TaskSource::Report(report),
                (Some(task), None) => TaskSource::File(task),
                (None, None) => bail!("a task file or --retry is required"),
            };
            run_task(&cli.config, source, parallel, repeat, auto_retry, cli.verbose).await
        }
        Commands::List { format } => list_devices(&cli.config, &format).await,
        Commands::History { task_id, format } => {
            show_history(&cli.config, task_id.as_deref(), &format)
        }
        Commands::Validate { task } => validate(&cli.config, task.as_deref()),
        Commands::Init { host, port } => init_config(&cli.config, &host, port),
    }
}

/// Loads the configuration, falling back to defaults when the default file
/// is absent.
fn load_config(path: &Path) -> Result<Config> {
    if !path.exists() && path == Path::new(DEFAULT_CONFIG) {
        info!("No {} found, using defaults", DEFAULT_CONFIG);
        return Ok(Config::default());
    }
    let config = config::load_config(path)
        .with_context(|| format!("Failed to load config from {}", path.display()))?;
    info!("Loaded configuration from {}", path.display());
    Ok(config)
}

fn connector_configs(config: &Config) -> Vec<ConnectorConfig> {
    if config.connectors.is_empty() {
        vec![ConnectorConfig::default()]
    } else {
        config.connectors.clone()
    }
}

/// Polls every connector once, then keeps watching until `cancel` fires.
async fn start_watchers(
    connectors: &ConnectorSet,
    configs: &[ConnectorConfig],
    pool: &Arc<DevicePool>,
    cancel: &CancellationToken,
) {
    for transport in connectors.iter() {
        let interval = configs
            .iter()
            .find(|c| c.host == transport.endpoint().host && c.port == transport.endpoint().port)
            .map(|c| Duration::from_millis(c.poll_interval_ms))
            .unwrap_or(Duration::from_secs(2));
        let mut watcher = DeviceWatcher::new(Arc::clone(transport), Arc::clone(pool), interval);
        watcher.poll_once().await;
        watcher.spawn(cancel.clone());
    }
}

/// Where `run` gets its task from.
enum TaskSource {
    File(PathBuf),
    /// A report directory or `report.json` of an earlier run.
    Report(PathBuf),
}

fn load_task(source: &TaskSource, config: &Config) -> Result<Task> {
    match source {
        TaskSource::File(path) => {
            let file = config::load_task(path)?;
            Ok(Task::from_file(file, config))
        }
        TaskSource::Report(path) => {
            let path = if path.is_dir() {
                path.join(REPORT_FILE)
            } else {
                path.clone()
            };
            let report = read_report(&path)?;
            let mut task = Task::from_report(&report, true)
                .with_context(|| format!("Nothing to rerun from {}", path.display()))?;
            task.config.auto_retry = config.runner.auto_retry;
            let stamp = chrono::Local::now().format("%Y-%m-%d-%H-%M-%S");
            task.config.report_dir = Some(
                config
                    .report
                    .output_dir
                    .join(format!("{}-rerun-{}", task.name, stamp)),
            );
            info!(
                "Rerunning {} drivers of task {}",
                task.descriptors.len(),
                report.task_id
            );
            Ok(task)
        }
    }
}

async fn run_task(
    config_path: &Path,
    source: TaskSource,
    parallel: Option<usize>,
    repeat: Option<u32>,
    auto_retry: Option<u32>,
    verbose: bool,
) -> Result<()> {
    let mut config = load_config(config_path)?;
    if let Some(parallel) = parallel {
        config.runner.max_concurrent = parallel;
    }

    let mut task = load_task(&source, &config)?;
    if let Some(repeat) = repeat {
        task.config.repeat = repeat;
    }
    if let Some(auto_retry) = auto_retry {
        task.config.auto_retry = auto_retry;
    }

    let configs = connector_configs(&config);
    let connectors = ConnectorSet::from_config(&configs);
    let pool = DevicePool::new(config.pool.clone());
    let cancel = CancellationToken::new();
    start_watchers(&connectors, &configs, &pool, &cancel).await;
    info!("{} devices in pool", pool.len());

    let mut reporter = MultiReporter::new().with_reporter(ConsoleReporter::new(verbose));
    if config.report.json {
        reporter = reporter.with_reporter(JsonReporter::new(config.report.output_dir.clone()));
    }

    let scheduler = Arc::new(
        TaskScheduler::new(
            Arc::clone(&pool),
            ClientFactory::new(connectors, config.recovery.clone()),
            DriverRegistry::with_builtin(),
            config.runner.clone(),
        )
        .with_reporter(Arc::new(reporter)),
    );
    scheduler
        .bus()
        .add_listener(Arc::new(ProgressListener::new(verbose)));

    {
        let scheduler = Arc::clone(&scheduler);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupted, finishing running drivers");
                scheduler.terminate();
            }
        });
    }

    let reports = scheduler.submit(task).await;
    cancel.cancel();

    for entry in scheduler.history() {
        match &entry.report_dir {
            Some(dir) => info!("Task {} reports in {}", entry.task_id, dir.display()),
            None => info!("Task {} finished", entry.task_id),
        }
    }

    let code = reports.last().map_or(1, |r| r.exit_code());
    std::process::exit(code);
}

async fn list_devices(config_path: &Path, format: &str) -> Result<()> {
    let config = load_config(config_path)?;
    let configs = connector_configs(&config);
    let pool = DevicePool::new(config.pool.clone());

    for connector in &configs {
        let transport: Arc<dyn Transport> = Arc::new(HdcConnector::from_config(connector));
        if !transport.is_running().await {
            warn!("Connector server {} is not running", transport.endpoint());
            continue;
        }
        let mut watcher = DeviceWatcher::new(
            transport,
            Arc::clone(&pool),
            Duration::from_millis(connector.poll_interval_ms),
        );
        watcher.poll_once().await;
    }

    let devices = pool.devices();
    match format {
        "json" => {
            let json = serde_json::to_string_pretty(&devices)?;
            println!("{}", json);
        }
        _ => {
            println!("Found {} devices:", devices.len());
            for device in &devices {
                let alias = device
                    .alias
                    .as_ref()
                    .map(|a| format!(" ({})", a))
                    .unwrap_or_default();
                println!(
                    "  {}{} [{}] {}:{} {:?} {:?}",
                    device.serial,
                    alias,
                    device.label,
                    device.host,
                    device.port,
                    device.test_state,
                    device.allocation_state
                );
            }
        }
    }

    Ok(())
}

fn show_history(config_path: &Path, task_id: Option<&str>, format: &str) -> Result<()> {
    let config = load_config(config_path)?;
    let history = CommandHistory::from_reports(&config.report.output_dir)?;

    let Some(task_id) = task_id else {
        if format == "json" {
            println!("{}", serde_json::to_string_pretty(&history.entries())?);
            return Ok(());
        }
        println!("Command history:");
        println!("{:<38}{:<24}{:<22}{:<18}Report", "TaskId", "Name", "Started", "Pass/Total");
        for entry in history.entries() {
            let counts = entry
                .summary
                .map(|s| format!("{}/{}", s.passed, s.total))
                .unwrap_or_default();
            let dir = entry
                .report_dir
                .as_ref()
                .map(|d| d.display().to_string())
                .unwrap_or_default();
            println!(
                "{:<38}{:<24}{:<22}{:<18}{}",
                entry.task_id,
                entry.name,
                entry.submitted_at.format("%Y-%m-%d %H:%M:%S"),
                counts,
                dir
            );
        }
        return Ok(());
    };

    let Some(entry) = history.find(task_id) else {
        bail!(
            "No task {} in {}",
            task_id,
            config.report.output_dir.display()
        );
    };
    let Some(path) = entry.report_path() else {
        bail!("Task {} has no report", entry.task_id);
    };
    let report = read_report(&path)?;

    if format == "json" {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }
    println!("{:<16}{}", "TaskId:", report.task_id);
    println!("{:<16}{}", "Name:", report.name);
    println!("{:<16}{}", "ReportPath:", path.display());
    println!("{:<16}{}", "Retry round:", report.retry_round);
    if let Some(error) = &report.error {
        println!("{:<16}{}", "Error:", error);
    }
    println!();
    for result in &report.results {
        let error = result
            .error
            .as_deref()
            .map(|e| format!(" ({})", e))
            .unwrap_or_default();
        println!(
            "  [{}] {} {}{}",
            result.outcome.label(),
            result.descriptor_id,
            result.driver,
            error
        );
    }
    let s = report.summary;
    println!();
    println!(
        "{} passed, {} failed, {} blocked, {} not executed",
        s.passed, s.failed, s.blocked, s.not_executed
    );
    Ok(())
}

fn validate(config_path: &Path, task_path: Option<&Path>) -> Result<()> {
    let config = match config::load_config(config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Configuration error: {:#}", e);
            std::process::exit(1);
        }
    };

    println!("Configuration is valid!");
    println!();
    println!("Settings:");
    println!("  Max concurrent: {}", config.runner.max_concurrent);
    println!("  Auto retry: {}", config.runner.auto_retry);
    println!("  Apply attempts: {}", config.pool.apply_attempts);
    println!("  Recovery attempts: {}", config.recovery.attempts);
    for connector in connector_configs(&config) {
        println!(
            "  Connector: {} at {}:{}",
            connector.binary, connector.host, connector.port
        );
    }

    let Some(task_path) = task_path else {
        return Ok(());
    };
    if let Err(e) = check_task(task_path, &config) {
        eprintln!("Task error: {:#}", e);
        std::process::exit(1);
    }
    Ok(())
}

/// Checks a task file the way the scheduler would before running it.
fn check_task(path: &Path, config: &Config) -> Result<()> {
    let file = config::load_task(path)?;
    let task = Task::from_file(file, config);
    let drivers = DriverRegistry::with_builtin();

    let mut errors = Vec::new();
    for descriptor in &task.descriptors {
        if let Some(e) = &descriptor.error {
            errors.push(format!("{}: {}", descriptor.id, e));
            continue;
        }
        match drivers.get(&descriptor.driver) {
            None => errors.push(format!(
                "{}: unknown driver '{}' (available: {})",
                descriptor.id,
                descriptor.driver,
                drivers.names().join(", ")
            )),
            Some(driver) => {
                if let Err(e) = driver.validate(&descriptor.params) {
                    errors.push(format!("{}: {}", descriptor.id, e));
                }
            }
        }
    }
    if !errors.is_empty() {
        bail!("{}", errors.join("; "));
    }

    println!();
    println!("Task {} is valid:", task.name);
    println!("  Drivers: {}", task.descriptors.len());
    println!("  Repeat: {}", task.config.repeat);
    println!("  Auto retry: {}", task.config.auto_retry);
    Ok(())
}

fn init_config(path: &Path, host: &str, port: u16) -> Result<()> {
    let config = format!(
        r#"# devrunner configuration file

[runner]
max_concurrent = 5
capacity_poll_ms = 3000
auto_retry = 0

[pool]
# Only these serials become available; empty allows every device
allow_list = []
apply_attempts = 4
apply_backoff_unit_ms = 1000

[pool.aliases]
# SN0001 = "bench-phone"

[recovery]
attempts = 3
online_timeout_secs = 20

[[connectors]]
binary = "hdc"
host = "{}"
port = {}
poll_interval_ms = 2000
command_timeout_secs = 300

[report]
output_dir = "reports"
json = true
"#,
        host, port
    );

    if path.exists() {
        eprintln!(
            "{} already exists. Remove it first or edit manually.",
            path.display()
        );
        std::process::exit(1);
    }

    std::fs::write(path, config)
        .with_context(|| format!("Failed to write {}", path.display()))?;
    println!("Created {}", path.display());
    println!();
    println!("Write a task file, then run:");
    println!("  devrunner run smoke.toml");
    println!("Rerun what did not pass with:");
    println!("  devrunner run --retry reports/<task dir>");

    Ok(())
}
