//! Per-object activation state
//!
//! Each active object map slot is an [`ObjectEntry`]: a small state machine
//! guarded by its own mutex, paired one-to-one with a condition variable
//! that is signalled on every transition.
//!
//! ```text
//!  ActivatePending ──bind──► Active ──begin_deactivate──► DeactivatePending
//!        │                                                       │
//!        └───────abandon──────────► Deactivated ◄──finish────────┘
//!                                              (outstanding == 0)
//! ```

use std::time::Instant;
use parking_lot::{Condvar, Mutex, MutexGuard};
use thiserror::Error;

use crate::dispatch::servant::ServantHandle;
use crate::types::ObjectKey;

/// Activation state of an object entry
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EntryState {
    /// Reserved by an activation that has not bound its servant yet
    ActivatePending,
    /// Servant bound, requests admitted
    Active,
    /// Deactivation requested, waiting for outstanding requests to finish
    DeactivatePending,
    /// Servant unbound; the entry is gone from the map
    Deactivated,
}

impl EntryState {
    /// Whether the state is transient and will settle on its own
    pub fn is_pending(&self) -> bool {
        matches!(self, EntryState::ActivatePending | EntryState::DeactivatePending)
    }
}

/// Rejected entry transition
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("invalid entry transition from {from:?} to {to:?}")]
pub struct InvalidTransition {
    pub from: EntryState,
    pub to: EntryState,
}

/// Mutable part of an entry, only reachable through the entry lock
pub struct EntrySlot {
    state: EntryState,
    servant: Option<ServantHandle>,
    outstanding: u32,
    /// Deactivation was started by an adapter or manager cleanup
    cleanup: bool,
}

impl EntrySlot {
    pub fn state(&self) -> EntryState {
        self.state
    }

    pub fn outstanding(&self) -> u32 {
        self.outstanding
    }

    pub fn servant(&self) -> Option<&ServantHandle> {
        self.servant.as_ref()
    }

    /// Whether the pending deactivation belongs to a cleanup
    pub fn cleanup_in_progress(&self) -> bool {
        self.cleanup
    }

    fn check(&self, expected: EntryState, to: EntryState) -> Result<(), InvalidTransition> {
        if self.state == expected {
            Ok(())
        } else {
            Err(InvalidTransition { from: self.state, to })
        }
    }

    /// ActivatePending -> Active
    pub fn bind(&mut self, servant: ServantHandle) -> Result<(), InvalidTransition> {
        self.check(EntryState::ActivatePending, EntryState::Active)?;
        self.servant = Some(servant);
        self.state = EntryState::Active;
        Ok(())
    }

    /// ActivatePending -> Deactivated, for an activation that failed
    pub fn abandon(&mut self) -> Result<(), InvalidTransition> {
        self.check(EntryState::ActivatePending, EntryState::Deactivated)?;
        self.state = EntryState::Deactivated;
        Ok(())
    }

    /// Active -> DeactivatePending
    ///
    /// `cleanup` is reported to the etherealizer when the deactivation
    /// finishes. Returns true if no requests are outstanding and the
    /// deactivation can be finished right away.
    pub fn begin_deactivate(&mut self, cleanup: bool) -> Result<bool, InvalidTransition> {
        self.check(EntryState::Active, EntryState::DeactivatePending)?;
        self.state = EntryState::DeactivatePending;
        self.cleanup = cleanup;
        Ok(self.outstanding == 0)
    }

    /// DeactivatePending -> Deactivated, handing back the servant
    pub fn finish_deactivate(&mut self) -> Result<ServantHandle, InvalidTransition> {
        let invalid = InvalidTransition {
            from: self.state,
            to: EntryState::Deactivated,
        };
        if self.state != EntryState::DeactivatePending || self.outstanding != 0 {
            return Err(invalid);
        }
        let servant = self.servant.take().ok_or(invalid)?;
        self.state = EntryState::Deactivated;
        Ok(servant)
    }

    /// Count a request against an active entry
    pub fn acquire(&mut self) -> Option<ServantHandle> {
        if self.state != EntryState::Active {
            return None;
        }
        let servant = self.servant.clone()?;
        self.outstanding += 1;
        Some(servant)
    }

    /// Finish a counted request
    ///
    /// Returns `Some(true)` when this was the last request of a pending
    /// deactivation, `None` when nothing was outstanding.
    pub fn release(&mut self) -> Option<bool> {
        self.outstanding = self.outstanding.checked_sub(1)?;
        Some(self.outstanding == 0 && self.state == EntryState::DeactivatePending)
    }
}

/// One slot of the active object map
pub struct ObjectEntry {
    key: ObjectKey,
    slot: Mutex<EntrySlot>,
    changed: Condvar,
}

impl ObjectEntry {
    /// Create an entry reserved for activation
    pub fn new(key: ObjectKey) -> Self {
        Self {
            key,
            slot: Mutex::new(EntrySlot {
                state: EntryState::ActivatePending,
                servant: None,
                outstanding: 0,
                cleanup: false,
            }),
            changed: Condvar::new(),
        }
    }

    pub fn key(&self) -> &ObjectKey {
        &self.key
    }

    /// Lock the entry
    pub fn lock(&self) -> MutexGuard<'_, EntrySlot> {
        self.slot.lock()
    }

    /// Wake every thread waiting on this entry
    pub fn notify(&self) {
        self.changed.notify_all();
    }

    /// Current state
    pub fn state(&self) -> EntryState {
        self.slot.lock().state
    }

    /// Current outstanding request count
    pub fn outstanding(&self) -> u32 {
        self.slot.lock().outstanding
    }

    /// Block while the entry is in a pending state
    ///
    /// Returns false if `deadline` passed with the entry still pending.
    pub fn wait_settled(
        &self,
        slot: &mut MutexGuard<'_, EntrySlot>,
        deadline: Option<Instant>,
    ) -> bool {
        self.wait_while(slot, deadline, EntryState::is_pending)
    }

    /// Block while `blocked` holds for the entry state
    ///
    /// Returns false if `deadline` passed while still blocked.
    pub fn wait_while(
        &self,
        slot: &mut MutexGuard<'_, EntrySlot>,
        deadline: Option<Instant>,
        blocked: impl Fn(&EntryState) -> bool,
    ) -> bool {
        while blocked(&slot.state) {
            match deadline {
                Some(deadline) => {
                    if self.changed.wait_until(slot, deadline).timed_out() {
                        return !blocked(&slot.state);
                    }
                }
                None => self.changed.wait(slot),
            }
        }
        true
    }
}

impl std::fmt::Debug for ObjectEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let slot = self.slot.lock();
        f.debug_struct("ObjectEntry")
            .field("key", &self.key)
            .field("state", &slot.state)
            .field("outstanding", &slot.outstanding)
            .finish()
    }
}
