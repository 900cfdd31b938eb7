//! Automatic task retry countdown.

use std::sync::Mutex;

use tracing::{debug, info};

/// Upper bound for any auto-retry budget.
pub const MAX_AUTO_RETRY: u32 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryState {
    /// No task has asked for retries, or the last run needed none.
    Unarmed,
    /// Retries left.
    Armed(u32),
    /// The budget ran out or the scheduler was terminated. Never re-arms.
    Exhausted,
}

/// Countdown shared by every task a scheduler runs.
///
/// The first task that asks for auto-retry arms it. Each run that still
/// has failures spends one retry; a clean run disarms it again.
pub struct AutoRetry {
    state: Mutex<RetryState>,
}

impl AutoRetry {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(RetryState::Unarmed),
        }
    }

    pub fn state(&self) -> RetryState {
        *self.lock()
    }

    /// Arms the countdown with `budget` (capped at [`MAX_AUTO_RETRY`]).
    ///
    /// Only an unarmed countdown can be armed. Returns true if it was.
    pub fn arm(&self, budget: u32) -> bool {
        let mut state = self.lock();
        if budget == 0 || *state != RetryState::Unarmed {
            return false;
        }
        let budget = budget.min(MAX_AUTO_RETRY);
        info!("Auto retry armed with {} attempts", budget);
        *state = RetryState::Armed(budget);
        true
    }

    /// Records a finished run and returns true if it should be retried.
    pub fn on_finished(&self, needs_retry: bool) -> bool {
        let mut state = self.lock();
        match *state {
            RetryState::Armed(_) if !needs_retry => {
                debug!("Run passed, auto retry disarmed");
                *state = RetryState::Unarmed;
                false
            }
            RetryState::Armed(left) => {
                let left = left.saturating_sub(1);
                *state = if left == 0 {
                    RetryState::Exhausted
                } else {
                    RetryState::Armed(left)
                };
                info!("Auto retry, {} attempts left", left);
                true
            }
            RetryState::Unarmed | RetryState::Exhausted => false,
        }
    }

    /// Disables auto retry for good.
    pub fn terminate(&self) {
        *self.lock() = RetryState::Exhausted;
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RetryState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for AutoRetry {
    fn default() -> Self {
        Self::new()
    }
}
