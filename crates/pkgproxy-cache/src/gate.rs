//! One-shot completion event for in-flight fetches.

use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

/// Busy marker for one key.
///
/// Starts closed; [`open`](Gate::open) releases every current and future
/// waiter and tells them whether the owner stored new content. Only the
/// first `open` counts.
#[derive(Debug, Default)]
pub(crate) struct Gate {
    outcome: Mutex<Option<bool>>,
    cond: Condvar,
}

impl Gate {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Block until the gate is opened; `true` if the owner stored content.
    pub(crate) fn wait(&self) -> bool {
        let mut outcome = self.lock();
        loop {
            if let Some(stored) = *outcome {
                return stored;
            }
            outcome = self.cond.wait(outcome).unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Release all waiters.
    pub(crate) fn open(&self, stored: bool) {
        self.lock().get_or_insert(stored);
        self.cond.notify_all();
    }

    fn lock(&self) -> MutexGuard<'_, Option<bool>> {
        self.outcome.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
