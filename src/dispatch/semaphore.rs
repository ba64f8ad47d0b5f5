use std::sync::{Condvar, Mutex};
use std::time::Duration;

use crate::cancel::CancelToken;

/// How often a blocked `acquire` rechecks the cancellation token.
const CANCEL_POLL: Duration = Duration::from_millis(20);

/// Counting semaphore bounding concurrent VLM calls.
pub(crate) struct Semaphore {
    available: Mutex<usize>,
    released: Condvar,
    capacity: usize,
}

/// Held for the duration of one VLM call. Dropping it returns the slot.
pub(crate) struct Permit<'a> {
    semaphore: &'a Semaphore,
}

impl Semaphore {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            available: Mutex::new(capacity),
            released: Condvar::new(),
            capacity,
        }
    }

    /// Block until a slot is free. Returns `None` if `cancel` trips first.
    pub(crate) fn acquire(&self, cancel: &CancelToken) -> Option<Permit<'_>> {
        let mut available = self
            .available
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        loop {
            if cancel.is_cancelled() {
                return None;
            }
            if *available > 0 {
                *available -= 1;
                return Some(Permit { semaphore: self });
            }
            available = match self.released.wait_timeout(available, CANCEL_POLL) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
    }

    pub(crate) fn in_use(&self) -> usize {
        let available = self
            .available
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        self.capacity - *available
    }
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        let mut available = self
            .semaphore
            .available
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *available += 1;
        self.semaphore.released.notify_one();
    }
}
