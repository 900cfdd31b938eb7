//! Background consumer of driver completions.
//!
//! Workers send a [`CompletionMessage`] when their driver finishes. A single
//! monitor task drains the queue in arrival order, records the result and
//! frees the in-flight slot, waking the dispatcher if it is at capacity.
//!
//! The receiver lives behind an async mutex owned by the monitor handle, so
//! if the monitor task dies a replacement picks up the same queue without
//! losing queued messages.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use tokio::sync::{Notify, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::report::DriverResult;

/// Sent by a worker when its driver finished.
#[derive(Debug, Clone)]
pub struct CompletionMessage {
    pub descriptor_id: String,
    pub result: DriverResult,
    pub finished_at: DateTime<Utc>,
}

impl CompletionMessage {
    pub fn new(result: DriverResult) -> Self {
        Self {
            descriptor_id: result.descriptor_id.clone(),
            result,
            finished_at: Utc::now(),
        }
    }
}

/// Bookkeeping shared by the dispatcher and the monitor.
#[derive(Default)]
pub(crate) struct CompletionState {
    in_flight: Mutex<HashSet<String>>,
    results: Mutex<HashMap<String, DriverResult>>,
    completed: Notify,
}

impl CompletionState {
    pub(crate) fn dispatched(&self, descriptor_id: &str) {
        lock(&self.in_flight).insert(descriptor_id.to_string());
    }

    pub(crate) fn in_flight(&self) -> usize {
        lock(&self.in_flight).len()
    }

    pub(crate) fn completed(&self) -> &Notify {
        &self.completed
    }

    fn complete(&self, message: CompletionMessage) {
        debug!(
            "Driver {} finished: {:?}",
            message.descriptor_id, message.result.outcome
        );
        lock(&self.in_flight).remove(&message.descriptor_id);
        lock(&self.results).insert(message.descriptor_id, message.result);
        self.completed.notify_one();
    }

    pub(crate) fn take_results(&self) -> HashMap<String, DriverResult> {
        std::mem::take(&mut *lock(&self.results))
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

type SharedReceiver = Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<CompletionMessage>>>;

/// Handle to the monitor task.
pub(crate) struct CompletionMonitor {
    receiver: SharedReceiver,
    state: Arc<CompletionState>,
    handle: Option<JoinHandle<()>>,
    restarts: usize,
}

impl CompletionMonitor {
    pub(crate) fn start(
        receiver: mpsc::UnboundedReceiver<CompletionMessage>,
        state: Arc<CompletionState>,
    ) -> Self {
        let mut monitor = Self {
            receiver: Arc::new(tokio::sync::Mutex::new(receiver)),
            state,
            handle: None,
            restarts: 0,
        };
        monitor.spawn();
        monitor
    }

    fn spawn(&mut self) {
        let receiver = Arc::clone(&self.receiver);
        let state = Arc::clone(&self.state);
        self.handle = Some(tokio::spawn(async move {
            loop {
                let message = receiver.lock().await.recv().await;
                match message {
                    Some(message) => state.complete(message),
                    None => break,
                }
            }
        }));
    }

    pub(crate) fn is_alive(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    pub(crate) fn restarts(&self) -> usize {
        self.restarts
    }

    /// Restarts the monitor if it died. Returns true if it was restarted.
    ///
    /// Only valid while work remains: a monitor that finished because every
    /// sender is gone would exit again immediately.
    pub(crate) fn ensure_running(&mut self) -> bool {
        if self.is_alive() {
            return false;
        }
        warn!("Completion monitor is not running, restarting");
        self.restarts += 1;
        self.spawn();
        true
    }

    /// Waits until the queue is closed and drained, restarting the monitor
    /// as often as it dies on the way.
    pub(crate) async fn wait(&mut self) {
        loop {
            let Some(handle) = self.handle.take() else {
                self.spawn();
                continue;
            };
            match handle.await {
                Ok(()) => return,
                Err(e) => {
                    warn!("Completion monitor died: {}", e);
                    self.restarts += 1;
                    self.spawn();
                }
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn abort(&self) {
        if let Some(handle) = &self.handle {
            handle.abort();
        }
    }
}
