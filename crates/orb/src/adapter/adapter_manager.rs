//! Adapter manager
//!
//! An [`AdapterManager`] controls request admission for every adapter it
//! owns. New managers start out holding requests.
//!
//! ```text
//!           ┌──────────── activate ────────────┐
//!           ▼                                  │
//!        Active ◄──► Holding ◄──► Discarding ──┘
//!           │           │            │
//!           └───────────┴────────────┴──deactivate──► Inactive
//! ```

use std::sync::Arc;
use std::time::{Duration, Instant};
use parking_lot::{Condvar, Mutex, RwLock};
use tracing::{debug, info};
use uuid::Uuid;

use super::object_adapter::ObjectAdapter;
use crate::config::{AdapterManagerConfig, AdapterPolicies};
use crate::dispatch::current;
use crate::types::{OrbError, OrderViolation, Result};

/// Admission state of an adapter manager
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ManagerState {
    /// Requests are dispatched
    Active,
    /// Requests wait until the manager becomes active again
    Holding,
    /// Requests fail immediately with a transient error
    Discarding,
    /// Requests fail permanently; terminal
    Inactive,
}

impl ManagerState {
    pub(crate) fn as_u8(self) -> u8 {
        match self {
            ManagerState::Active => 0,
            ManagerState::Holding => 1,
            ManagerState::Discarding => 2,
            ManagerState::Inactive => 3,
        }
    }

    pub(crate) fn from_u8(value: u8) -> Self {
        match value {
            0 => ManagerState::Active,
            1 => ManagerState::Holding,
            2 => ManagerState::Discarding,
            _ => ManagerState::Inactive,
        }
    }
}

/// Callback run after every state change with the manager id and new state
pub type StateObserver = Arc<dyn Fn(&str, ManagerState) + Send + Sync>;

/// Admission controller for a group of adapters
pub struct AdapterManager {
    id: String,
    state: Mutex<ManagerState>,
    changed: Condvar,
    adapters: RwLock<Vec<Arc<ObjectAdapter>>>,
    observers: RwLock<Vec<StateObserver>>,
}

impl AdapterManager {
    /// Create a manager with the default configuration
    pub fn new(id: impl Into<String>) -> Arc<Self> {
        Self::with_config(id, &AdapterManagerConfig::default())
    }

    /// Create a manager with a generated id
    pub fn anonymous() -> Arc<Self> {
        Self::new(format!("AdapterManager-{}", Uuid::new_v4()))
    }

    pub fn with_config(id: impl Into<String>, config: &AdapterManagerConfig) -> Arc<Self> {
        Arc::new(Self {
            id: id.into(),
            state: Mutex::new(config.initial_state),
            changed: Condvar::new(),
            adapters: RwLock::new(Vec::new()),
            observers: RwLock::new(Vec::new()),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Current state
    pub fn state(&self) -> ManagerState {
        *self.state.lock()
    }

    /// Start dispatching requests, releasing any held ones
    pub fn activate(&self) -> Result<()> {
        self.change_state(ManagerState::Active, false, false)
    }

    /// Hold new requests until the next `activate`
    ///
    /// With `wait` set, returns once requests already in progress finish.
    pub fn hold_requests(&self, wait: bool) -> Result<()> {
        self.change_state(ManagerState::Holding, wait, false)
    }

    /// Reject new requests with a transient error
    ///
    /// With `wait` set, returns once requests already in progress finish.
    pub fn discard_requests(&self, wait: bool) -> Result<()> {
        self.change_state(ManagerState::Discarding, wait, false)
    }

    /// Shut down for good
    ///
    /// With `etherealize` set every servant of every owned adapter is
    /// unbound and etherealized, after in-progress requests finish.
    pub fn deactivate(&self, etherealize: bool, wait: bool) -> Result<()> {
        self.change_state(ManagerState::Inactive, wait, etherealize)
    }

    /// Register a callback run after every state change
    pub fn add_state_observer(&self, observer: StateObserver) {
        self.observers.write().push(observer);
    }

    /// Create an adapter owned by this manager
    pub fn create_adapter(
        self: &Arc<Self>,
        name: impl Into<String>,
        server_id: impl Into<String>,
        endpoint: impl Into<String>,
        policies: AdapterPolicies,
    ) -> Result<Arc<ObjectAdapter>> {
        let state = self.state.lock();
        if *state == ManagerState::Inactive {
            return Err(OrbError::AdapterInactive);
        }
        let adapter = Arc::new(ObjectAdapter::new(
            name.into(),
            server_id.into(),
            endpoint.into(),
            policies,
            self,
            *state,
        )?);
        self.adapters.write().push(adapter.clone());
        drop(state);

        info!(
            "adapter {} ({}) created under manager {}",
            adapter.name(),
            adapter.instance(),
            self.id
        );
        Ok(adapter)
    }

    /// Drop an adapter from this manager
    pub(crate) fn remove_adapter(&self, adapter: &ObjectAdapter) {
        self.adapters
            .write()
            .retain(|owned| !std::ptr::eq(Arc::as_ptr(owned), adapter));
    }

    /// Adapters owned by this manager
    pub fn adapters(&self) -> Vec<Arc<ObjectAdapter>> {
        self.adapters.read().clone()
    }

    /// Requests in progress across all owned adapters
    pub fn outstanding_requests(&self) -> usize {
        self.adapters
            .read()
            .iter()
            .map(|adapter| adapter.outstanding_requests())
            .sum()
    }

    /// Block until no owned adapter has requests in progress
    pub fn wait_pending_requests(&self) {
        // Snapshot so adapters can be added or destroyed while we wait
        for adapter in self.adapters() {
            adapter.wait_pending_requests();
        }
    }

    /// Admission check for one request
    ///
    /// Blocks while holding, bounded by `hold_timeout`. Holding past the
    /// timeout and discarding yield transient errors; inactive is permanent.
    pub fn validate_state(&self, hold_timeout: Option<Duration>) -> Result<()> {
        self.validate_state_until(hold_timeout.map(|timeout| Instant::now() + timeout))
    }

    /// Admission check holding at most until `deadline`
    ///
    /// Callers that check repeatedly for one request pass the same deadline.
    pub fn validate_state_until(&self, deadline: Option<Instant>) -> Result<()> {
        let mut state = self.state.lock();
        loop {
            match *state {
                ManagerState::Active => return Ok(()),
                ManagerState::Discarding => {
                    return Err(OrbError::transient(format!(
                        "adapter manager {} is discarding requests",
                        self.id
                    )))
                }
                ManagerState::Inactive => return Err(OrbError::AdapterInactive),
                ManagerState::Holding => match deadline {
                    Some(deadline) => {
                        if self.changed.wait_until(&mut state, deadline).timed_out()
                            && *state == ManagerState::Holding
                        {
                            return Err(OrbError::transient(format!(
                                "request held by adapter manager {} timed out",
                                self.id
                            )));
                        }
                    }
                    None => self.changed.wait(&mut state),
                },
            }
        }
    }

    fn change_state(&self, new: ManagerState, wait: bool, etherealize: bool) -> Result<()> {
        let previous = {
            let mut state = self.state.lock();
            if *state == ManagerState::Inactive {
                return Err(OrbError::AdapterInactive);
            }
            if *state == new {
                return Ok(());
            }
            if wait && current::in_upcall_for(&self.id) {
                return Err(OrbError::BadInvOrder(OrderViolation::InvocationInProgress));
            }
            let previous = *state;
            *state = new;
            self.changed.notify_all();
            previous
        };
        info!("adapter manager {}: {:?} -> {:?}", self.id, previous, new);

        let adapters = self.adapters();
        for adapter in &adapters {
            adapter.manager_state_changed(new);
        }

        let observers = self.observers.read().clone();
        for observer in observers {
            observer(&self.id, new);
        }

        if wait {
            debug!("adapter manager {} draining requests", self.id);
            for adapter in &adapters {
                adapter.wait_pending_requests();
            }
        }
        if new == ManagerState::Inactive && etherealize {
            for adapter in &adapters {
                adapter.etherealize_all();
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for AdapterManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdapterManager")
            .field("id", &self.id)
            .field("state", &self.state())
            .finish()
    }
}
