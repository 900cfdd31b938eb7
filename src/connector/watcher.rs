//! Polling device watcher.
//!
//! Connectors only expose a snapshot of attached devices, so the watcher
//! polls [`Transport::list_targets`] and turns the difference between two
//! snapshots into discovery events for the pool.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::Transport;
use crate::pool::{DevicePool, DiscoveryKind, ObservedDevice};

/// Feeds one connector's device list into a [`DevicePool`].
pub struct DeviceWatcher {
    transport: Arc<dyn Transport>,
    pool: Arc<DevicePool>,
    interval: Duration,
    known: HashMap<String, ObservedDevice>,
}

impl DeviceWatcher {
    pub fn new(transport: Arc<dyn Transport>, pool: Arc<DevicePool>, interval: Duration) -> Self {
        Self {
            transport,
            pool,
            interval,
            known: HashMap::new(),
        }
    }

    /// Runs the poll loop on its own task until `cancel` fires.
    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(cancel))
    }

    pub async fn run(mut self, cancel: CancellationToken) {
        info!("Watching devices on {}", self.transport.endpoint());
        loop {
            self.poll_once().await;
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.interval) => {}
            }
        }
        debug!("Device watcher for {} stopped", self.transport.endpoint());
    }

    /// Takes one snapshot and reports what changed since the last one.
    ///
    /// A failed poll keeps the previous snapshot, so a flaky listing does not
    /// disconnect every device.
    pub async fn poll_once(&mut self) -> usize {
        let current = match self.transport.list_targets().await {
            Ok(current) => current,
            Err(e) => {
                warn!(
                    "Failed to list devices on {}: {}",
                    self.transport.endpoint(),
                    e
                );
                return 0;
            }
        };

        let changes = diff_targets(&self.known, &current);
        for (kind, observed) in &changes {
            self.pool.on_device_observed(*kind, observed);
        }
        self.known = current
            .into_iter()
            .map(|d| (d.serial.clone(), d))
            .collect();
        changes.len()
    }
}

/// Discovery events that turn `previous` into `current`.
///
/// New serials are `Connected`, serials whose state changed are `Changed`,
/// and serials that vanished are `Disconnected`.
pub(crate) fn diff_targets(
    previous: &HashMap<String, ObservedDevice>,
    current: &[ObservedDevice],
) -> Vec<(DiscoveryKind, ObservedDevice)> {
    let mut changes = Vec::new();

    for device in current {
        match previous.get(&device.serial) {
            None => changes.push((DiscoveryKind::Connected, device.clone())),
            Some(old) if old.state != device.state => {
                changes.push((DiscoveryKind::Changed, device.clone()))
            }
            Some(_) => {}
        }
    }

    let mut gone: Vec<_> = previous
        .values()
        .filter(|old| !current.iter().any(|d| d.serial == old.serial))
        .cloned()
        .collect();
    gone.sort_by(|a, b| a.serial.cmp(&b.serial));
    changes.extend(gone.into_iter().map(|d| (DiscoveryKind::Disconnected, d)));

    changes
}
