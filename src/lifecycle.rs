//! Life-stage events and their listeners.
//!
//! The scheduler and the drivers report progress as [`StageEvent`]s on a
//! [`LifeStageBus`]. Delivery is synchronous and in registration order, so a
//! listener sees a task's events in the order they happened:
//!
//! ```text
//! TaskStarted
//! ├── SuiteStarted (descriptor a)
//! │   ├── CaseStarted / CaseEnded ...   (emitted by the driver)
//! │   └── SuiteEnded (descriptor a)
//! ├── SuiteStarted (descriptor b)
//! │   └── SuiteEnded (descriptor b)
//! TaskEnded
//! ```
//!
//! Suites of concurrently running descriptors interleave with each other;
//! within one descriptor the nesting above always holds.
//!
//! ## Isolation
//! A listener that returns an error or panics is logged and skipped; the
//! remaining listeners still receive the event.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use serde::Serialize;
use tracing::warn;

use crate::report::{DriverOutcome, Summary};

/// A point in the life of a task.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "stage", rename_all = "snake_case")]
pub enum StageEvent {
    TaskStarted {
        task_id: String,
        name: String,
        descriptors: usize,
    },
    TaskEnded {
        task_id: String,
        name: String,
        summary: Summary,
        cancelled: bool,
    },
    SuiteStarted {
        task_id: String,
        descriptor_id: String,
        driver: String,
    },
    SuiteEnded {
        task_id: String,
        descriptor_id: String,
        outcome: DriverOutcome,
        error: Option<String>,
    },
    CaseStarted {
        descriptor_id: String,
        case: String,
    },
    CaseEnded {
        descriptor_id: String,
        case: String,
        passed: bool,
        message: Option<String>,
    },
}

impl StageEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::TaskStarted { .. } => "task_started",
            Self::TaskEnded { .. } => "task_ended",
            Self::SuiteStarted { .. } => "suite_started",
            Self::SuiteEnded { .. } => "suite_ended",
            Self::CaseStarted { .. } => "case_started",
            Self::CaseEnded { .. } => "case_ended",
        }
    }
}

/// Receives stage events.
pub trait LifeStageListener: Send + Sync {
    fn on_event(&self, event: &StageEvent) -> anyhow::Result<()>;

    fn name(&self) -> &str {
        "listener"
    }
}

/// Handle returned by [`LifeStageBus::add_listener`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Registry and synchronous fan-out for [`LifeStageListener`]s.
#[derive(Default)]
pub struct LifeStageBus {
    listeners: RwLock<Vec<(ListenerId, Arc<dyn LifeStageListener>)>>,
    next_id: AtomicU64,
}

impl LifeStageBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_listener(&self, listener: Arc<dyn LifeStageListener>) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.write().push((id, listener));
        id
    }

    /// Returns false if the listener was already removed.
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        let mut listeners = self.write();
        let before = listeners.len();
        listeners.retain(|(other, _)| *other != id);
        listeners.len() != before
    }

    pub fn clear(&self) {
        self.write().clear();
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Delivers `event` to every listener in registration order.
    pub fn notify_stage(&self, event: &StageEvent) {
        // Snapshot so listeners may register or remove listeners while handling.
        let listeners: Vec<_> = self.read().iter().map(|(_, l)| Arc::clone(l)).collect();

        for listener in listeners {
            match std::panic::catch_unwind(AssertUnwindSafe(|| listener.on_event(event))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(
                    "Listener {} failed on {}: {:#}",
                    listener.name(),
                    event.kind(),
                    e
                ),
                Err(panic) => warn!(
                    "Listener {} panicked on {}: {}",
                    listener.name(),
                    event.kind(),
                    panic_message(panic.as_ref())
                ),
            }
        }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Vec<(ListenerId, Arc<dyn LifeStageListener>)>> {
        self.listeners.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(
        &self,
    ) -> std::sync::RwLockWriteGuard<'_, Vec<(ListenerId, Arc<dyn LifeStageListener>)>> {
        self.listeners.write().unwrap_or_else(|e| e.into_inner())
    }
}

pub(crate) fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(msg) = panic.downcast_ref::<&'static str>() {
        (*msg).to_string()
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}
