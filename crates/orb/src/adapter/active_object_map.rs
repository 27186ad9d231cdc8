//! Active object map
//!
//! Maps object keys to [`ObjectEntry`] slots and serializes activation,
//! deactivation and request counting against concurrent dispatch.
//!
//! Locking uses two levels. The map lock is held only to look up, insert
//! or remove entries. The entry lock guards a single object's state. An
//! entry lock may be held while taking the map lock, never the reverse.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use parking_lot::{Mutex, MutexGuard, RwLock};
use tracing::{debug, trace, warn};

use super::object_entry::{EntrySlot, EntryState, ObjectEntry};
use crate::dispatch::servant::{Etherealizer, ServantHandle, ServantId};
use crate::types::{ObjectKey, OrbError, OrderViolation, Result};

/// Default bound on waits for a pending entry to settle during lookup
pub const DEFAULT_SETTLE_TIMEOUT: Duration = Duration::from_secs(5);

/// Map of active objects for one adapter
pub struct ActiveObjectMap {
    entries: RwLock<HashMap<ObjectKey, Arc<ObjectEntry>>>,
    /// Keys each servant is active under
    servant_keys: Mutex<HashMap<ServantId, Vec<ObjectKey>>>,
    unique_ids: bool,
    etherealizer: RwLock<Option<Arc<dyn Etherealizer>>>,
    /// Bound on `activate` waiting out a pending deactivation; `None` waits forever
    activation_wait: Option<Duration>,
    settle_timeout: Duration,
}

/// A servant unbound from its entry, ready to be etherealized
struct Unbound {
    servant: ServantHandle,
    cleanup: bool,
    remaining: bool,
}

impl ActiveObjectMap {
    /// Create a new map
    ///
    /// With `unique_ids` set a servant may be active under at most one key.
    pub fn new(unique_ids: bool) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            servant_keys: Mutex::new(HashMap::new()),
            unique_ids,
            etherealizer: RwLock::new(None),
            activation_wait: None,
            settle_timeout: DEFAULT_SETTLE_TIMEOUT,
        }
    }

    /// Bound the time `activate` waits for a pending deactivation
    pub fn with_activation_wait(mut self, wait: Option<Duration>) -> Self {
        self.activation_wait = wait;
        self
    }

    /// Bound the time lookups wait for a pending entry
    pub fn with_settle_timeout(mut self, timeout: Duration) -> Self {
        self.settle_timeout = timeout;
        self
    }

    /// Install the callback run when servants are unbound
    pub fn set_etherealizer(&self, etherealizer: Arc<dyn Etherealizer>) {
        *self.etherealizer.write() = Some(etherealizer);
    }

    /// Whether a servant may only be active under one key
    pub fn has_unique_ids(&self) -> bool {
        self.unique_ids
    }

    /// Bind `servant` to `key`
    ///
    /// Waits for a pending deactivation of the same key to finish and then
    /// retries.
    pub fn activate(&self, key: ObjectKey, servant: ServantHandle) -> Result<()> {
        let deadline = self.activation_wait.map(|wait| Instant::now() + wait);

        loop {
            let (entry, created) = self.reserve(&key);
            let mut slot = entry.lock();

            match slot.state() {
                EntryState::ActivatePending if created => {
                    if let Err(err) = self.register_servant(&key, &servant) {
                        // Give the slot back so the key can be activated later
                        let _ = slot.abandon();
                        self.remove_entry(&entry);
                        drop(slot);
                        entry.notify();
                        return Err(err);
                    }
                    let bound = slot.bind(servant);
                    drop(slot);
                    entry.notify();
                    bound.map_err(|e| OrbError::Unknown(e.to_string()))?;
                    debug!("activated object {}", key);
                    return Ok(());
                }
                EntryState::Active => return Err(OrbError::ObjectAlreadyActive(key)),
                EntryState::ActivatePending | EntryState::DeactivatePending => {
                    trace!("activate of {} waiting for {:?} to settle", key, slot.state());
                    if !entry.wait_settled(&mut slot, deadline) {
                        return Err(OrbError::transient(format!(
                            "object {} still being deactivated",
                            key
                        )));
                    }
                }
                // Entry was removed from the map before we locked it; look again
                EntryState::Deactivated => {}
            }
        }
    }

    /// Request deactivation of `key`
    ///
    /// With no requests outstanding the servant is unbound and etherealized
    /// before returning. Otherwise the last [`release`](Self::release)
    /// finishes the deactivation.
    pub fn deactivate(&self, key: &ObjectKey) -> Result<()> {
        let entry = self
            .lookup(key)
            .ok_or_else(|| OrbError::ObjectNotActive(key.clone()))?;
        let mut slot = entry.lock();
        let drained = slot
            .begin_deactivate(false)
            .map_err(|_| OrbError::ObjectNotActive(key.clone()))?;

        if drained {
            let finished = self.finish(&entry, &mut slot);
            drop(slot);
            entry.notify();
            let unbound = finished?;
            debug!("deactivated object {}", key);
            self.etherealize(key, unbound);
        } else {
            debug!(
                "deactivation of {} deferred, {} requests outstanding",
                key,
                slot.outstanding()
            );
            drop(slot);
            entry.notify();
        }
        Ok(())
    }

    /// Servant bound to `key`, if active
    ///
    /// Waits a bounded time for a pending entry to settle.
    pub fn resolve(&self, key: &ObjectKey) -> Option<ServantHandle> {
        let deadline = Instant::now() + self.settle_timeout;
        loop {
            let entry = self.lookup(key)?;
            let mut slot = entry.lock();
            if !entry.wait_settled(&mut slot, Some(deadline)) {
                return None;
            }
            match slot.state() {
                EntryState::Active => return slot.servant().cloned(),
                EntryState::Deactivated => continue,
                _ => return None,
            }
        }
    }

    /// Count a request against `key` and lend out its servant
    ///
    /// Must be paired with exactly one [`release`](Self::release).
    pub fn acquire(&self, key: &ObjectKey) -> Result<ServantHandle> {
        self.acquire_entry(key).map(|(_, servant)| servant)
    }

    /// Finish a request counted by [`acquire`](Self::acquire)
    pub fn release(&self, key: &ObjectKey) -> Result<()> {
        let entry = self
            .lookup(key)
            .ok_or(OrbError::BadInvOrder(OrderViolation::UnbalancedRelease))?;
        self.release_entry(&entry)
    }

    /// Acquire `key` for the lifetime of the returned guard
    pub fn enter(&self, key: &ObjectKey) -> Result<RequestGuard<'_>> {
        let (entry, servant) = self.acquire_entry(key)?;
        Ok(RequestGuard {
            map: self,
            entry,
            servant,
        })
    }

    /// Deactivate every active object, etherealizing with cleanup in progress
    ///
    /// Objects with outstanding requests are etherealized by their last release.
    pub fn etherealize_all(&self) {
        let entries: Vec<Arc<ObjectEntry>> = self.entries.read().values().cloned().collect();

        for entry in entries {
            let mut slot = entry.lock();
            match slot.begin_deactivate(true) {
                Ok(true) => {
                    let finished = self.finish(&entry, &mut slot);
                    drop(slot);
                    entry.notify();
                    match finished {
                        Ok(unbound) => self.etherealize(entry.key(), unbound),
                        Err(e) => warn!("failed to deactivate {}: {}", entry.key(), e),
                    }
                }
                Ok(false) => {
                    drop(slot);
                    entry.notify();
                }
                Err(_) => {}
            }
        }
    }

    /// Key `servant` is active under, if exactly one is known
    pub fn servant_to_key(&self, servant: &ServantHandle) -> Option<ObjectKey> {
        let keys = self.servant_keys.lock();
        match keys.get(&ServantId::of(servant)) {
            Some(keys) if keys.len() == 1 => keys.first().cloned(),
            _ => None,
        }
    }

    /// State of the entry for `key`
    pub fn state_of(&self, key: &ObjectKey) -> Option<EntryState> {
        self.lookup(key).map(|entry| entry.state())
    }

    /// Outstanding requests against `key`
    pub fn outstanding(&self, key: &ObjectKey) -> u32 {
        self.lookup(key).map(|entry| entry.outstanding()).unwrap_or(0)
    }

    /// Keys currently in the map, in any state
    pub fn keys(&self) -> Vec<ObjectKey> {
        self.entries.read().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    fn lookup(&self, key: &ObjectKey) -> Option<Arc<ObjectEntry>> {
        self.entries.read().get(key).cloned()
    }

    /// Existing entry for `key`, or a new ActivatePending one
    fn reserve(&self, key: &ObjectKey) -> (Arc<ObjectEntry>, bool) {
        let mut entries = self.entries.write();
        match entries.get(key) {
            Some(entry) => (entry.clone(), false),
            None => {
                let entry = Arc::new(ObjectEntry::new(key.clone()));
                entries.insert(key.clone(), entry.clone());
                (entry, true)
            }
        }
    }

    /// Remove `entry` from the map if it is still the one stored under its key
    fn remove_entry(&self, entry: &Arc<ObjectEntry>) {
        let mut entries = self.entries.write();
        if entries
            .get(entry.key())
            .map_or(false, |current| Arc::ptr_eq(current, entry))
        {
            entries.remove(entry.key());
        }
    }

    fn register_servant(&self, key: &ObjectKey, servant: &ServantHandle) -> Result<()> {
        let mut servant_keys = self.servant_keys.lock();
        let keys = servant_keys.entry(ServantId::of(servant)).or_default();
        if self.unique_ids {
            if let Some(existing) = keys.first() {
                return Err(OrbError::ServantAlreadyActive(existing.clone()));
            }
        }
        keys.push(key.clone());
        Ok(())
    }

    /// Returns whether the servant is still active under other keys
    fn unregister_servant(&self, key: &ObjectKey, servant: &ServantHandle) -> bool {
        let mut servant_keys = self.servant_keys.lock();
        let id = ServantId::of(servant);
        let remaining = match servant_keys.get_mut(&id) {
            Some(keys) => {
                keys.retain(|k| k != key);
                !keys.is_empty()
            }
            None => false,
        };
        if !remaining {
            servant_keys.remove(&id);
        }
        remaining
    }

    /// DeactivatePending -> Deactivated, with the entry lock held
    fn finish(
        &self,
        entry: &Arc<ObjectEntry>,
        slot: &mut MutexGuard<'_, EntrySlot>,
    ) -> Result<Unbound> {
        let cleanup = slot.cleanup_in_progress();
        let servant = slot
            .finish_deactivate()
            .map_err(|e| OrbError::Unknown(e.to_string()))?;
        self.remove_entry(entry);
        let remaining = self.unregister_servant(entry.key(), &servant);
        Ok(Unbound {
            servant,
            cleanup,
            remaining,
        })
    }

    fn etherealize(&self, key: &ObjectKey, unbound: Unbound) {
        let etherealizer = self.etherealizer.read().clone();
        match etherealizer {
            Some(etherealizer) => {
                debug!("etherealizing {} (cleanup: {})", key, unbound.cleanup);
                etherealizer.etherealize(key, unbound.servant, unbound.cleanup, unbound.remaining);
            }
            None => trace!("released servant for {}", key),
        }
    }

    fn acquire_entry(&self, key: &ObjectKey) -> Result<(Arc<ObjectEntry>, ServantHandle)> {
        let deadline = Instant::now() + self.settle_timeout;
        loop {
            let entry = self
                .lookup(key)
                .ok_or_else(|| OrbError::ObjectNotExist(key.clone()))?;
            let mut slot = entry.lock();
            let settled = entry.wait_while(&mut slot, Some(deadline), |state| {
                *state == EntryState::ActivatePending
            });
            if !settled {
                return Err(OrbError::transient(format!(
                    "activation of {} still pending",
                    key
                )));
            }
            match slot.state() {
                EntryState::Active => {
                    let servant = slot
                        .acquire()
                        .ok_or_else(|| OrbError::ObjectNotExist(key.clone()))?;
                    trace!("acquired {} ({} outstanding)", key, slot.outstanding());
                    drop(slot);
                    return Ok((entry, servant));
                }
                EntryState::Deactivated => continue,
                _ => return Err(OrbError::ObjectNotExist(key.clone())),
            }
        }
    }

    fn release_entry(&self, entry: &Arc<ObjectEntry>) -> Result<()> {
        let mut slot = entry.lock();
        let last = slot
            .release()
            .ok_or(OrbError::BadInvOrder(OrderViolation::UnbalancedRelease))?;
        trace!("released {} ({} outstanding)", entry.key(), slot.outstanding());

        if last {
            let finished = self.finish(entry, &mut slot);
            drop(slot);
            entry.notify();
            let unbound = finished?;
            debug!("deferred deactivation of {} complete", entry.key());
            self.etherealize(entry.key(), unbound);
        }
        Ok(())
    }
}

impl Default for ActiveObjectMap {
    fn default() -> Self {
        Self::new(true)
    }
}

/// An acquired object, released on drop
pub struct RequestGuard<'a> {
    map: &'a ActiveObjectMap,
    entry: Arc<ObjectEntry>,
    servant: ServantHandle,
}

impl RequestGuard<'_> {
    pub fn key(&self) -> &ObjectKey {
        self.entry.key()
    }

    /// The servant lent to this request
    pub fn servant(&self) -> &ServantHandle {
        &self.servant
    }
}

impl Drop for RequestGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.map.release_entry(&self.entry) {
            warn!("release of {} failed: {}", self.entry.key(), e);
        }
    }
}
