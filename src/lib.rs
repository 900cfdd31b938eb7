//! devrunner: a host-driven test runner for connected devices.
//!
//! Devices are reached through connector servers (such as `hdc`). The host
//! keeps a pool of the devices those servers report, and runs test drivers
//! against them with bounded concurrency.
//!
//! # Architecture
//!
//! The main components are:
//!
//! - **Connectors**: Talk to connector servers and watch their device lists
//! - **Pool**: Tracks devices and hands them out to one driver at a time
//! - **Client**: Device operations with automatic recovery
//! - **Scheduler**: Validates tasks, allocates devices, runs drivers
//! - **Lifecycle**: Stage events for listeners such as progress bars
//! - **Report**: Task reports for the console and JSON files
//!
//! # Example
//!
//! ```no_run
//! use devrunner::client::ClientFactory;
//! use devrunner::config::load_config;
//! use devrunner::connector::ConnectorSet;
//! use devrunner::driver::DriverRegistry;
//! use devrunner::pool::DevicePool;
//! use devrunner::scheduler::TaskScheduler;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = load_config(std::path::Path::new("devrunner.toml"))?;
//!     let pool = DevicePool::new(config.pool.clone());
//!     let clients = ClientFactory::new(
//!         ConnectorSet::from_config(&config.connectors),
//!         config.recovery.clone(),
//!     );
//!     let scheduler = TaskScheduler::new(
//!         pool,
//!         clients,
//!         DriverRegistry::with_builtin(),
//!         config.runner.clone(),
//!     );
//!     // ... start device watchers, then submit tasks ...
//!     Ok(())
//! }
//! ```

pub mod client;
pub mod config;
pub mod connector;
pub mod device;
pub mod driver;
pub mod lifecycle;
pub mod pool;
pub mod report;
pub mod scheduler;

#[cfg(test)]
pub(crate) mod test_support;

// Re-export commonly used types
pub use client::{ClientFactory, DeviceClient, RecoveringDeviceClient};
pub use config::{Config, load_config, load_task};
pub use device::{Device, DeviceRequirement, DeviceSelector};
pub use driver::{Driver, DriverContext, DriverRegistry, Verdict};
pub use lifecycle::{LifeStageBus, LifeStageListener, StageEvent};
pub use pool::DevicePool;
pub use report::{DriverOutcome, Reporter, TaskReport};
pub use scheduler::{Task, TaskScheduler, TestDriverDescriptor};
