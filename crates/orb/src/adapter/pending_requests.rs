//! Adapter-wide outstanding request counter

use std::time::Instant;
use parking_lot::{Condvar, Mutex};

/// Counts requests dispatched into one adapter so shutdown can drain them
#[derive(Default)]
pub struct PendingRequests {
    count: Mutex<usize>,
    drained: Condvar,
}

impl PendingRequests {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count a request until the returned guard is dropped
    pub fn enter(&self) -> PendingRequestGuard<'_> {
        *self.count.lock() += 1;
        PendingRequestGuard { pending: self }
    }

    fn exit(&self) {
        let mut count = self.count.lock();
        *count = count.saturating_sub(1);
        if *count == 0 {
            self.drained.notify_all();
        }
    }

    /// Current number of outstanding requests
    pub fn count(&self) -> usize {
        *self.count.lock()
    }

    /// Block until no requests are outstanding
    ///
    /// Returns false if `deadline` passed first.
    pub fn wait_drained(&self, deadline: Option<Instant>) -> bool {
        let mut count = self.count.lock();
        while *count > 0 {
            match deadline {
                Some(deadline) => {
                    if self.drained.wait_until(&mut count, deadline).timed_out() {
                        return *count == 0;
                    }
                }
                None => self.drained.wait(&mut count),
            }
        }
        true
    }
}

/// Outstanding request, uncounted on drop
pub struct PendingRequestGuard<'a> {
    pending: &'a PendingRequests,
}

impl Drop for PendingRequestGuard<'_> {
    fn drop(&mut self) {
        self.pending.exit();
    }
}
