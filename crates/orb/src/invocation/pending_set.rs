//! Tracking of outstanding deferred invocations

use std::sync::Arc;
use parking_lot::Mutex;
use tracing::debug;

use super::client_invocation::{ClientInvocation, InvocationState};
use crate::types::{OrbError, OrderViolation, Result};

/// Deferred invocations whose replies have not been consumed
///
/// Invocations tracked with [`ClientInvocation::track_in`] join the set
/// when sent deferred and leave it when their reply is consumed.
#[derive(Default)]
pub struct PendingInvocationSet {
    invocations: Mutex<Vec<Arc<ClientInvocation>>>,
}

impl PendingInvocationSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track `invocation`; returns false if it is already tracked
    pub fn add_deferred(&self, invocation: Arc<ClientInvocation>) -> bool {
        let mut invocations = self.invocations.lock();
        if invocations.iter().any(|i| i.id() == invocation.id()) {
            return false;
        }
        invocations.push(invocation);
        true
    }

    /// Stop tracking `invocation`; removing twice is harmless
    pub fn remove_deferred(&self, invocation: &ClientInvocation) -> bool {
        let mut invocations = self.invocations.lock();
        let before = invocations.len();
        invocations.retain(|i| i.id() != invocation.id());
        invocations.len() != before
    }

    pub fn contains(&self, invocation: &ClientInvocation) -> bool {
        self.invocations.lock().iter().any(|i| i.id() == invocation.id())
    }

    pub fn len(&self) -> usize {
        self.invocations.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.invocations.lock().is_empty()
    }

    /// Poll every tracked invocation once
    ///
    /// Returns true if at least one reply is ready for collection.
    pub fn poll_all(&self) -> Result<bool> {
        let snapshot = self.snapshot()?;
        let mut ready = false;
        for invocation in snapshot {
            match invocation.poll_response() {
                Ok(true) => ready = true,
                Ok(false) => {}
                Err(OrbError::BadInvOrder(OrderViolation::ResponseAlreadyReceived)) => {
                    // Consumed directly by its owner
                    self.remove_deferred(&invocation);
                }
                Err(err) => return Err(err),
            }
        }
        Ok(ready)
    }

    /// Consume the reply of the next completed invocation
    ///
    /// Prefers an invocation whose reply has already arrived; otherwise
    /// blocks on the oldest one. The returned invocation is `Done` and its
    /// outcome is available through [`ClientInvocation::result`].
    pub fn take_next_completed(&self) -> Result<Arc<ClientInvocation>> {
        loop {
            let next = {
                let invocations = self.invocations.lock();
                invocations
                    .iter()
                    .find(|i| i.state() == InvocationState::Received)
                    .or_else(|| invocations.first())
                    .cloned()
            };
            let Some(next) = next else {
                return Err(OrbError::BadInvOrder(OrderViolation::RequestNotSent));
            };

            let outcome = next.get_response();
            self.remove_deferred(&next);
            match outcome {
                Err(OrbError::BadInvOrder(
                    violation @ (OrderViolation::ResponseAlreadyReceived
                    | OrderViolation::SynchronousRequest
                    | OrderViolation::RequestNotSent),
                )) => {
                    debug!("dropping invocation {} from pending set: {}", next.id(), violation);
                }
                _ => return Ok(next),
            }
        }
    }

    /// Send every invocation deferred, tracking each in this set
    pub fn send_multiple_deferred(self: &Arc<Self>, invocations: &[Arc<ClientInvocation>]) -> Result<()> {
        for invocation in invocations {
            invocation.track_in(self);
            invocation.send_deferred()?;
        }
        Ok(())
    }

    /// Send every invocation oneway
    pub fn send_multiple_oneway(&self, invocations: &[Arc<ClientInvocation>]) -> Result<()> {
        for invocation in invocations {
            invocation.send_oneway()?;
        }
        Ok(())
    }

    fn snapshot(&self) -> Result<Vec<Arc<ClientInvocation>>> {
        let invocations = self.invocations.lock();
        if invocations.is_empty() {
            return Err(OrbError::BadInvOrder(OrderViolation::RequestNotSent));
        }
        Ok(invocations.clone())
    }
}

impl std::fmt::Debug for PendingInvocationSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingInvocationSet")
            .field("pending", &self.len())
            .finish()
    }
}
