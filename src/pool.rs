//! Device pool: discovery ingestion and exclusive allocation.
//!
//! The [`DevicePool`] owns every [`Device`] reported by the configured
//! connectors. Discovery watchers push connectivity changes in through
//! [`on_device_observed`](DevicePool::on_device_observed); the scheduler takes
//! devices out with [`apply_device`](DevicePool::apply_device) and hands them
//! back with [`release_device`](DevicePool::release_device).
//!
//! # Synchronization
//!
//! ```text
//!   watcher threads ──► on_device_observed ─┐
//!                                           ▼
//!                                   ┌──────────────┐
//!   scheduler ──► apply_device ───► │  list lock   │ ◄── release_device
//!        ▲                          │ (Vec<Device>)│
//!        │                          └──────┬───────┘
//!        │                                 │ became Available
//!        │                                 ▼
//!        └──── woken / backoff ──── allocation_cond (Notify)
//! ```
//!
//! The list lock is a plain mutex held only for short, non-async sections;
//! every state machine transition happens while it is held. Waiting for an
//! available device happens on a separate [`Notify`], so a blocked allocator
//! never stops discovery events from updating the list.

use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::config::PoolConfig;
use crate::device::{
    AllocationState, ConnectivityState, Device, DeviceEvent, DeviceInfo, DeviceSelector,
    Endpoint, TestDeviceState, transition,
};

/// Kind of discovery event reported by a watcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscoveryKind {
    Connected,
    Changed,
    Disconnected,
}

/// A device as reported by a discovery watcher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObservedDevice {
    pub serial: String,
    pub endpoint: Endpoint,
    pub state: ConnectivityState,
    /// Product form, when the connector reports one.
    #[serde(default)]
    pub label: Option<String>,
}

impl ObservedDevice {
    pub fn new(serial: impl Into<String>, endpoint: Endpoint, state: ConnectivityState) -> Self {
        Self {
            serial: serial.into(),
            endpoint,
            state,
            label: None,
        }
    }
}

/// The pool of devices available for testing.
///
/// Construct one pool per process with [`DevicePool::new`] and share the
/// returned `Arc` with the scheduler and the watchers.
pub struct DevicePool {
    config: PoolConfig,
    devices: Mutex<Vec<Arc<Device>>>,
    allocation_cond: Notify,
    self_ref: Weak<DevicePool>,
}

impl DevicePool {
    /// Creates an empty pool.
    pub fn new(config: PoolConfig) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            config,
            devices: Mutex::new(Vec::new()),
            allocation_cond: Notify::new(),
            self_ref: weak.clone(),
        })
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Ingests a discovery event for one device.
    ///
    /// Creates the device on first sight, updates its connectivity state and
    /// runs the matching state machine event. Disconnect events for serials
    /// the pool has never seen are ignored.
    pub fn on_device_observed(&self, kind: DiscoveryKind, observed: &ObservedDevice) {
        let test_state = match kind {
            DiscoveryKind::Disconnected => TestDeviceState::NotAvailable,
            _ => TestDeviceState::from_connectivity(observed.state),
        };

        let mut list = self.lock_list();
        let device = match kind {
            DiscoveryKind::Disconnected => match find_in(&list, &observed.serial) {
                Some(device) => device,
                None => {
                    debug!("Ignoring disconnect of unknown device {}", observed.serial);
                    return;
                }
            },
            _ => self.find_or_create(&mut list, observed, test_state),
        };

        device.set_test_state(test_state);
        let online = test_state.is_online();
        // Restored before the transition so woken allocators can match it.
        match kind {
            DiscoveryKind::Connected => device.set_recover_state(true),
            DiscoveryKind::Changed if online => device.set_recover_state(true),
            _ => {}
        }
        let event = match (kind, online) {
            (DiscoveryKind::Connected, true) => DeviceEvent::ConnectedOnline,
            (DiscoveryKind::Connected, false) => DeviceEvent::ConnectedOffline,
            (DiscoveryKind::Changed, true) => DeviceEvent::StateChangeOnline,
            (DiscoveryKind::Changed, false) => DeviceEvent::StateChangeOffline,
            (DiscoveryKind::Disconnected, _) => DeviceEvent::Disconnected,
        };
        self.handle_device_event(&mut list, &device, event);
        drop(list);

        info!(
            "Device {:?}: {} {} state {}",
            kind,
            device.serial(),
            device.endpoint(),
            test_state
        );
    }

    /// Allocates a device matching `selector`, waiting with backoff if none
    /// is available yet.
    ///
    /// Uses the configured number of attempts (4 by default). Returns `None`
    /// when no device matched after the last attempt; callers treat that as a
    /// fatal parameter error rather than retrying.
    pub async fn apply_device(&self, selector: &DeviceSelector) -> Option<Arc<Device>> {
        self.apply_device_with_attempts(selector, self.config.apply_attempts)
            .await
    }

    /// Like [`apply_device`](Self::apply_device) with an explicit attempt count.
    ///
    /// Attempt `n` (0-based) that finds nothing waits up to
    /// `(n * 2 + 1) × unit` for a device to become available. The last
    /// attempt does not wait.
    pub async fn apply_device_with_attempts(
        &self,
        selector: &DeviceSelector,
        max_attempts: usize,
    ) -> Option<Arc<Device>> {
        let max_attempts = max_attempts.max(1);

        for attempt in 0..max_attempts {
            // Register interest before scanning so a release between the scan
            // and the wait is not missed.
            let notified = self.allocation_cond.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(device) = self.allocate_matching(selector) {
                return Some(device);
            }
            if attempt + 1 == max_attempts {
                break;
            }

            let wait = self.backoff(attempt);
            debug!(
                "No device matches {}, waiting {:?} (attempt {}/{})",
                selector,
                wait,
                attempt + 1,
                max_attempts
            );
            let _ = tokio::time::timeout(wait, notified).await;
        }

        warn!("No device available for {}", selector);
        None
    }

    /// Returns an allocated device to the pool.
    pub fn release_device(&self, device: &Arc<Device>) {
        let mut list = self.lock_list();
        let event = if device.test_state().is_online() {
            DeviceEvent::FreeAvailable
        } else {
            DeviceEvent::FreeUnavailable
        };
        let state = self.handle_device_event(&mut list, device, event);
        debug!("Free device {}: {}", device.serial(), state);
    }

    /// Allocates a specific device if it is online.
    ///
    /// Returns true if the device is allocated afterwards.
    pub fn lock_device(&self, device: &Arc<Device>) -> bool {
        let mut list = self.lock_list();
        if device.test_state().is_online() {
            self.handle_device_event(&mut list, device, DeviceEvent::AllocateRequest);
        }
        device.allocation_state() == AllocationState::Allocated
    }

    /// Drops a device from the pool. Removing an absent device is a no-op.
    pub fn remove(&self, device: &Arc<Device>) {
        let mut list = self.lock_list();
        remove_from(&mut list, device);
    }

    /// Disables recovery for every device reached through `endpoint`.
    ///
    /// Called when the connector server itself is unreachable. Returns the
    /// number of devices affected.
    pub fn mark_endpoint_unrecoverable(&self, endpoint: &Endpoint) -> usize {
        let list = self.lock_list();
        let mut count = 0;
        for device in list.iter().filter(|d| d.endpoint() == endpoint) {
            device.set_recover_state(false);
            count += 1;
        }
        if count > 0 {
            warn!("Connector {} is down, {} devices unrecoverable", endpoint, count);
        }
        count
    }

    pub fn find(&self, serial: &str) -> Option<Arc<Device>> {
        find_in(&self.lock_list(), serial)
    }

    /// Snapshot of every listed device, in pool order.
    pub fn devices(&self) -> Vec<DeviceInfo> {
        self.lock_list().iter().map(|d| d.info()).collect()
    }

    pub fn len(&self) -> usize {
        self.lock_list().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock_list().is_empty()
    }

    fn backoff(&self, attempt: usize) -> Duration {
        let factor = u32::try_from(attempt)
            .unwrap_or(u32::MAX)
            .saturating_mul(2)
            .saturating_add(1);
        self.config
            .apply_backoff_unit()
            .checked_mul(factor)
            .unwrap_or(Duration::MAX)
    }

    fn allocate_matching(&self, selector: &DeviceSelector) -> Option<Arc<Device>> {
        let mut list = self.lock_list();
        let device = list.iter().find(|d| selector.matches(d)).cloned()?;
        self.handle_device_event(&mut list, &device, DeviceEvent::AllocateRequest);
        debug!("Allocate device {}", device.serial());
        Some(device)
    }

    fn is_allowed(&self, serial: &str) -> bool {
        self.config.allow_list.is_empty() || self.config.allow_list.iter().any(|s| s == serial)
    }

    fn find_or_create(
        &self,
        list: &mut Vec<Arc<Device>>,
        observed: &ObservedDevice,
        test_state: TestDeviceState,
    ) -> Arc<Device> {
        if let Some(device) = find_in(list, &observed.serial) {
            return device;
        }

        let device = Arc::new(
            Device::new(
                observed.serial.clone(),
                observed.endpoint.clone(),
                observed.label.clone(),
                test_state,
                self.self_ref.clone(),
            )
            .with_alias(self.config.aliases.get(&observed.serial).cloned()),
        );
        debug!(
            "Create device {} at {} ({})",
            device.serial(),
            device.endpoint(),
            device.label()
        );
        self.insert_sorted(list, Arc::clone(&device));
        device
    }

    /// Keeps allow-listed devices first, in allow-list order.
    fn insert_sorted(&self, list: &mut Vec<Arc<Device>>, device: Arc<Device>) {
        let rank = |serial: &str| self.config.allow_list.iter().position(|s| s == serial);

        let Some(own) = rank(device.serial()) else {
            list.push(device);
            return;
        };
        let index = list
            .iter()
            .position(|other| match rank(other.serial()) {
                None => true,
                Some(theirs) => own < theirs,
            })
            .unwrap_or(list.len());
        list.insert(index, device);
    }

    /// Applies `event` to `device` and returns its resulting state.
    ///
    /// Must be called with the list lock held (enforced by taking the guarded
    /// list by reference).
    fn handle_device_event(
        &self,
        list: &mut Vec<Arc<Device>>,
        device: &Arc<Device>,
        event: DeviceEvent,
    ) -> AllocationState {
        let old = device.allocation_state();
        let mut new = transition(old, event);

        if new == AllocationState::CheckingAvailability {
            let check = if self.is_allowed(device.serial()) {
                DeviceEvent::AvailableCheckPassed
            } else {
                DeviceEvent::AvailableCheckIgnored
            };
            new = transition(new, check);
        }

        if old != new {
            device.set_allocation_state(new);
            debug!("Device {} {:?}: {} -> {}", device.serial(), event, old, new);
            if new == AllocationState::Available {
                self.allocation_cond.notify_waiters();
            }
        }

        if new == AllocationState::Unknown {
            remove_from(list, device);
        }
        new
    }

    fn lock_list(&self) -> MutexGuard<'_, Vec<Arc<Device>>> {
        self.devices.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn find_in(list: &[Arc<Device>], serial: &str) -> Option<Arc<Device>> {
    list.iter().find(|d| d.serial() == serial).cloned()
}

fn remove_from(list: &mut Vec<Arc<Device>>, device: &Arc<Device>) {
    let before = list.len();
    list.retain(|d| !Arc::ptr_eq(d, device));
    if list.len() != before {
        debug!("Remove device {}", device.serial());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::time::Instant;

    fn endpoint() -> Endpoint {
        Endpoint::new("127.0.0.1", 8710)
    }

    fn pool_with(allow_list: &[&str], unit_ms: u64) -> Arc<DevicePool> {
        DevicePool::new(PoolConfig {
            allow_list: allow_list.iter().map(|s| s.to_string()).collect(),
            apply_backoff_unit_ms: unit_ms,
            ..Default::default()
        })
    }

    fn connect(pool: &DevicePool, serial: &str) {
        pool.on_device_observed(
            DiscoveryKind::Connected,
            &ObservedDevice::new(serial, endpoint(), ConnectivityState::Connected),
        );
    }

    #[test]
    fn test_connected_online_becomes_available() {
        let pool = pool_with(&[], 10);
        connect(&pool, "SN1");

        let device = pool.find("SN1").unwrap();
        assert_eq!(device.allocation_state(), AllocationState::Available);
        assert_eq!(device.test_state(), TestDeviceState::Online);
        assert!(device.recover_state());
        assert!(Arc::ptr_eq(&device.pool().unwrap(), &pool));
    }

    #[test]
    fn test_connected_offline_is_not_listed() {
        let pool = pool_with(&[], 10);
        pool.on_device_observed(
            DiscoveryKind::Connected,
            &ObservedDevice::new("SN1", endpoint(), ConnectivityState::Offline),
        );
        assert!(pool.is_empty());
    }

    #[test]
    fn test_repeated_connect_is_idempotent() {
        let pool = pool_with(&[], 10);
        connect(&pool, "SN1");
        let first = pool.find("SN1").unwrap();
        connect(&pool, "SN1");

        assert_eq!(pool.len(), 1);
        assert!(Arc::ptr_eq(&first, &pool.find("SN1").unwrap()));
        assert_eq!(first.allocation_state(), AllocationState::Available);
    }

    #[tokio::test]
    async fn test_allow_list_isolation() {
        let pool = pool_with(&["SN1"], 5);
        connect(&pool, "SN1");
        connect(&pool, "OTHER");

        // Ignored devices stay visible in listings.
        let listed: Vec<_> = pool.devices().into_iter().map(|d| d.serial).collect();
        assert_eq!(listed, vec!["SN1".to_string(), "OTHER".to_string()]);

        let other = pool.find("OTHER").unwrap();
        assert_eq!(other.allocation_state(), AllocationState::Unavailable);

        // Going offline and back online runs the check again, still ignored.
        pool.on_device_observed(
            DiscoveryKind::Changed,
            &ObservedDevice::new("OTHER", endpoint(), ConnectivityState::Unauthorized),
        );
        assert!(pool.find("OTHER").is_none());
        connect(&pool, "OTHER");
        assert_eq!(
            pool.find("OTHER").unwrap().allocation_state(),
            AllocationState::Unavailable
        );

        let selector = DeviceSelector::any().with_serial("OTHER");
        assert!(pool.apply_device_with_attempts(&selector, 2).await.is_none());
    }

    #[test]
    fn test_allow_list_ordering() {
        let pool = pool_with(&["A", "B", "C"], 10);
        connect(&pool, "X");
        connect(&pool, "C");
        connect(&pool, "A");
        connect(&pool, "B");

        let order: Vec<_> = pool.devices().into_iter().map(|d| d.serial).collect();
        assert_eq!(order, vec!["A", "B", "C", "X"]);
    }

    #[tokio::test]
    async fn test_apply_returns_immediately_when_available() {
        let pool = pool_with(&[], 1000);
        connect(&pool, "SN1");

        let start = Instant::now();
        let device = pool.apply_device(&DeviceSelector::any()).await.unwrap();
        assert!(start.elapsed() < Duration::from_millis(500));
        assert_eq!(device.allocation_state(), AllocationState::Allocated);
    }

    #[tokio::test]
    async fn test_apply_backoff_schedule_then_none() {
        let pool = pool_with(&[], 20);

        let start = Instant::now();
        let device = pool.apply_device(&DeviceSelector::any()).await;
        let elapsed = start.elapsed();

        assert!(device.is_none());
        // 4 attempts wait 1 + 3 + 5 units; the last attempt does not wait.
        assert!(elapsed >= Duration::from_millis(180), "{:?}", elapsed);
        assert!(elapsed < Duration::from_millis(1500), "{:?}", elapsed);
    }

    #[test]
    fn test_backoff_saturates() {
        let pool = pool_with(&[], 20);
        assert_eq!(pool.backoff(0), Duration::from_millis(20));
        assert_eq!(pool.backoff(3), Duration::from_millis(140));
        assert_eq!(pool.backoff(usize::MAX), Duration::from_millis(20) * u32::MAX);

        let pool = DevicePool::new(PoolConfig {
            apply_backoff_unit_ms: u64::MAX,
            ..Default::default()
        });
        assert_eq!(pool.backoff(usize::MAX), Duration::MAX);
    }

    #[tokio::test]
    async fn test_second_allocator_waits_for_release() {
        let pool = pool_with(&[], 200);
        connect(&pool, "SN1");
        let selector = DeviceSelector::any();

        let first = pool.apply_device(&selector).await.unwrap();

        let waiter = {
            let pool = Arc::clone(&pool);
            let selector = selector.clone();
            tokio::spawn(async move { pool.apply_device(&selector).await })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        pool.release_device(&first);
        let second = waiter.await.unwrap().unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(second.allocation_state(), AllocationState::Allocated);
    }

    #[tokio::test]
    async fn test_waiter_woken_by_discovery() {
        let pool = pool_with(&[], 500);

        let waiter = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move { pool.apply_device(&DeviceSelector::any()).await })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;

        let start = Instant::now();
        connect(&pool, "SN1");
        let device = waiter.await.unwrap().unwrap();

        assert_eq!(device.serial(), "SN1");
        // Woken by the notification, not by the 500ms backoff timer.
        assert!(start.elapsed() < Duration::from_millis(400));
    }

    #[tokio::test]
    async fn test_release_offline_device_parks_unavailable() {
        let pool = pool_with(&[], 10);
        connect(&pool, "SN1");
        let device = pool.apply_device(&DeviceSelector::any()).await.unwrap();

        // Disconnect while allocated keeps the allocation.
        pool.on_device_observed(
            DiscoveryKind::Disconnected,
            &ObservedDevice::new("SN1", endpoint(), ConnectivityState::Disconnected),
        );
        assert_eq!(device.allocation_state(), AllocationState::Allocated);
        assert_eq!(pool.len(), 1);

        pool.release_device(&device);
        assert_eq!(device.allocation_state(), AllocationState::Unavailable);

        // Coming back online makes it available again.
        pool.on_device_observed(
            DiscoveryKind::Changed,
            &ObservedDevice::new("SN1", endpoint(), ConnectivityState::Connected),
        );
        assert_eq!(device.allocation_state(), AllocationState::Available);
    }

    #[test]
    fn test_disconnect_available_device_removes_it() {
        let pool = pool_with(&[], 10);
        connect(&pool, "SN1");
        let device = pool.find("SN1").unwrap();

        pool.on_device_observed(
            DiscoveryKind::Disconnected,
            &ObservedDevice::new("SN1", endpoint(), ConnectivityState::Disconnected),
        );
        assert!(pool.is_empty());

        // Removing again is a no-op.
        pool.remove(&device);
        pool.on_device_observed(
            DiscoveryKind::Disconnected,
            &ObservedDevice::new("SN1", endpoint(), ConnectivityState::Disconnected),
        );
        assert!(pool.is_empty());
    }

    #[test]
    fn test_lock_device() {
        let pool = pool_with(&[], 10);
        connect(&pool, "SN1");
        let device = pool.find("SN1").unwrap();

        assert!(pool.lock_device(&device));
        assert_eq!(device.allocation_state(), AllocationState::Allocated);
    }

    #[test]
    fn test_mark_endpoint_unrecoverable() {
        let pool = pool_with(&[], 10);
        connect(&pool, "SN1");
        connect(&pool, "SN2");
        pool.on_device_observed(
            DiscoveryKind::Connected,
            &ObservedDevice::new(
                "REMOTE",
                Endpoint::new("10.0.0.2", 8710),
                ConnectivityState::Connected,
            ),
        );

        assert_eq!(pool.mark_endpoint_unrecoverable(&endpoint()), 2);
        assert!(!pool.find("SN1").unwrap().recover_state());
        assert!(!pool.find("SN2").unwrap().recover_state());
        assert!(pool.find("REMOTE").unwrap().recover_state());
    }

    #[test]
    fn test_aliases_applied_on_create() {
        let mut config = PoolConfig::default();
        config
            .aliases
            .insert("SN1".to_string(), "bench-phone".to_string());
        let pool = DevicePool::new(config);
        connect(&pool, "SN1");

        assert_eq!(pool.devices()[0].alias.as_deref(), Some("bench-phone"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_mutual_exclusion_under_contention() {
        let pool = pool_with(&[], 5);
        connect(&pool, "SN1");
        connect(&pool, "SN2");

        let held: Arc<std::sync::Mutex<HashSet<String>>> = Arc::default();
        let mut handles = Vec::new();

        for _ in 0..12 {
            let pool = Arc::clone(&pool);
            let held = Arc::clone(&held);
            handles.push(tokio::spawn(async move {
                let device = pool
                    .apply_device_with_attempts(&DeviceSelector::any(), 50)
                    .await
                    .expect("device eventually available");
                assert!(
                    held.lock().unwrap().insert(device.serial().to_string()),
                    "device {} allocated twice",
                    device.serial()
                );
                tokio::time::sleep(Duration::from_millis(5)).await;
                held.lock().unwrap().remove(device.serial());
                pool.release_device(&device);
            }));
        }

        for handle in handles {
            handle.await.unwrap();
        }
    }
}
