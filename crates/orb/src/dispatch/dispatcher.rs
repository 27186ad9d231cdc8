//! Request dispatcher
//!
//! Routes an incoming request to the servant named by its object key:
//! admission check, servant lookup, request counting, upcall, release.

use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use bytes::Bytes;
use parking_lot::RwLock;
use tracing::{debug, trace, warn};

use super::current::{UpcallContext, UpcallScope};
use super::servant::UpcallOutcome;
use crate::adapter::{ManagerState, ObjectAdapter};
use crate::config::DispatcherConfig;
use crate::types::{
    ObjectKey, ObjectKeyData, ObjectRef, OrbError, Result, UpcallException,
};

/// Dispatch statistics
#[derive(Debug, Default)]
pub struct DispatchStats {
    pub requests_received: AtomicU64,
    pub requests_completed: AtomicU64,
    pub requests_forwarded: AtomicU64,
    pub requests_rejected: AtomicU64,
    pub requests_failed: AtomicU64,
    pub upcall_panics: AtomicU64,
}

impl DispatchStats {
    pub fn snapshot(&self) -> DispatchStatsSnapshot {
        DispatchStatsSnapshot {
            requests_received: self.requests_received.load(Ordering::Relaxed),
            requests_completed: self.requests_completed.load(Ordering::Relaxed),
            requests_forwarded: self.requests_forwarded.load(Ordering::Relaxed),
            requests_rejected: self.requests_rejected.load(Ordering::Relaxed),
            requests_failed: self.requests_failed.load(Ordering::Relaxed),
            upcall_panics: self.upcall_panics.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of dispatch statistics
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchStatsSnapshot {
    pub requests_received: u64,
    pub requests_completed: u64,
    pub requests_forwarded: u64,
    pub requests_rejected: u64,
    pub requests_failed: u64,
    pub upcall_panics: u64,
}

/// Answer to a locate request
#[derive(Debug, Clone, PartialEq)]
pub enum LocateStatus {
    /// The object is active here
    ObjectHere,
    /// Nothing known about the key
    UnknownObject,
    /// The object lives elsewhere
    ObjectForward { target: ObjectRef, permanent: bool },
}

/// Request dispatcher
///
/// Holds the adapters registered for dispatch by name, plus forward
/// tables consulted for keys no registered adapter owns.
pub struct Dispatcher {
    server_id: String,
    config: DispatcherConfig,
    adapters: RwLock<HashMap<String, Arc<ObjectAdapter>>>,
    /// Per-key forwards
    forwards: RwLock<HashMap<ObjectKey, ObjectRef>>,
    /// Endpoints serving adapters that are not registered here
    adapter_forwards: RwLock<HashMap<String, String>>,
    stats: DispatchStats,
}

impl Dispatcher {
    /// Create a dispatcher for keys created by `server_id`
    pub fn new(server_id: impl Into<String>) -> Self {
        Self::with_config(server_id, DispatcherConfig::default())
    }

    pub fn with_config(server_id: impl Into<String>, config: DispatcherConfig) -> Self {
        Self {
            server_id: server_id.into(),
            config,
            adapters: RwLock::new(HashMap::new()),
            forwards: RwLock::new(HashMap::new()),
            adapter_forwards: RwLock::new(HashMap::new()),
            stats: DispatchStats::default(),
        }
    }

    pub fn server_id(&self) -> &str {
        &self.server_id
    }

    pub fn stats(&self) -> &DispatchStats {
        &self.stats
    }

    /// Make an adapter reachable, replacing any earlier adapter with the same name
    pub fn register_adapter(&self, adapter: Arc<ObjectAdapter>) {
        debug!(
            "registering adapter {} ({}) for dispatch",
            adapter.name(),
            adapter.instance()
        );
        self.adapters
            .write()
            .insert(adapter.name().to_string(), adapter);
    }

    /// Remove an adapter from dispatch
    pub fn unregister_adapter(&self, name: &str) -> Option<Arc<ObjectAdapter>> {
        self.adapters.write().remove(name)
    }

    /// Registered adapter by name
    pub fn adapter(&self, name: &str) -> Option<Arc<ObjectAdapter>> {
        self.adapters.read().get(name).cloned()
    }

    /// Forward requests for `key` to `target`
    pub fn register_forward(&self, key: ObjectKey, target: ObjectRef) {
        self.forwards.write().insert(key, target);
    }

    pub fn unregister_forward(&self, key: &ObjectKey) {
        self.forwards.write().remove(key);
    }

    /// Forward requests for adapter `name` to `endpoint` while it is not registered here
    pub fn register_adapter_forward(&self, name: impl Into<String>, endpoint: impl Into<String>) {
        self.adapter_forwards.write().insert(name.into(), endpoint.into());
    }

    /// Dispatch one request
    pub fn dispatch(&self, key: &ObjectKey, operation: &str, args: Bytes) -> Result<UpcallOutcome> {
        self.stats.requests_received.fetch_add(1, Ordering::Relaxed);

        let result = self.dispatch_inner(key, operation, args);
        match &result {
            Ok(UpcallOutcome::LocationForward { .. }) => {
                self.stats.requests_forwarded.fetch_add(1, Ordering::Relaxed);
            }
            Ok(_) => {
                self.stats.requests_completed.fetch_add(1, Ordering::Relaxed);
            }
            Err(OrbError::Transient { .. }) | Err(OrbError::AdapterInactive) => {
                self.stats.requests_rejected.fetch_add(1, Ordering::Relaxed);
            }
            Err(_) => {
                self.stats.requests_failed.fetch_add(1, Ordering::Relaxed);
            }
        }
        result
    }

    /// Find where `key` lives without invoking anything
    pub fn locate(&self, key: &ObjectKey) -> LocateStatus {
        match self.route(key) {
            Route::Local(adapter, data) => match adapter.active_object_map().resolve(&data.object_id) {
                Some(_) => LocateStatus::ObjectHere,
                None => LocateStatus::UnknownObject,
            },
            Route::Forward { target, permanent } => LocateStatus::ObjectForward { target, permanent },
            Route::Unknown => LocateStatus::UnknownObject,
        }
    }

    fn dispatch_inner(&self, key: &ObjectKey, operation: &str, args: Bytes) -> Result<UpcallOutcome> {
        let (adapter, data) = match self.route(key) {
            Route::Local(adapter, data) => (adapter, data),
            Route::Forward { target, permanent } => {
                debug!("forwarding {} to {}", key, target);
                return Ok(UpcallOutcome::LocationForward { target, permanent });
            }
            Route::Unknown => return Err(OrbError::ObjectNotExist(key.clone())),
        };
        let manager = adapter.manager().ok_or(OrbError::AdapterInactive)?;

        // Count the request only once it is admitted. The state is checked
        // again after counting so a concurrent drain cannot miss it. One
        // hold deadline covers every pass.
        let hold_deadline = self.config.hold_timeout.map(|timeout| Instant::now() + timeout);
        let _pending = loop {
            manager.validate_state_until(hold_deadline)?;
            let pending = adapter.pending().enter();
            match manager.state() {
                ManagerState::Active => break pending,
                ManagerState::Holding => continue,
                ManagerState::Discarding => {
                    return Err(OrbError::transient(format!(
                        "adapter {} is discarding requests",
                        adapter.name()
                    )))
                }
                ManagerState::Inactive => return Err(OrbError::AdapterInactive),
            }
        };

        let guard = adapter.active_object_map().enter(&data.object_id)?;
        trace!("upcall {}::{} on {}", adapter.name(), operation, data.object_id);

        let result = {
            let _scope = UpcallScope::enter(UpcallContext {
                manager_id: manager.id().to_string(),
                adapter: adapter.name().to_string(),
                object_id: data.object_id.clone(),
                operation: operation.to_string(),
            });
            let servant = guard.servant();
            panic::catch_unwind(AssertUnwindSafe(|| servant.invoke(operation, args)))
        };
        drop(guard);

        match result {
            Ok(Ok(reply)) => Ok(UpcallOutcome::Reply(reply)),
            Ok(Err(UpcallException::User { id, body })) => {
                Ok(UpcallOutcome::UserException { id, body })
            }
            Ok(Err(UpcallException::Forward(target))) => Ok(UpcallOutcome::LocationForward {
                target,
                permanent: false,
            }),
            Ok(Err(UpcallException::System(err))) => Err(err),
            Err(payload) => {
                self.stats.upcall_panics.fetch_add(1, Ordering::Relaxed);
                let message = panic_message(payload.as_ref());
                warn!(
                    "upcall {}::{} on {} panicked: {}",
                    adapter.name(),
                    operation,
                    data.object_id,
                    message
                );
                Err(OrbError::Unknown(format!("servant panicked: {}", message)))
            }
        }
    }

    fn route(&self, key: &ObjectKey) -> Route {
        if let Some(target) = self.forwards.read().get(key) {
            return Route::Forward {
                target: target.clone(),
                permanent: false,
            };
        }

        let data = match ObjectKeyData::parse(key) {
            Ok(data) if data.server_id == self.server_id => data,
            _ => return Route::Unknown,
        };

        if let Some(adapter) = self.adapter(&data.adapter) {
            if adapter.instance() == data.instance && !adapter.is_destroyed() {
                return Route::Local(adapter, data);
            }
            if let Some(target) = self.adapter_forward(key, &data) {
                return target;
            }
            if adapter.is_destroyed() {
                return Route::Unknown;
            }
            // Key from an earlier incarnation of an adapter that is registered again
            return Route::Forward {
                target: adapter.create_reference(&data.object_id, ""),
                permanent: true,
            };
        }

        self.adapter_forward(key, &data).unwrap_or(Route::Unknown)
    }

    fn adapter_forward(&self, key: &ObjectKey, data: &ObjectKeyData) -> Option<Route> {
        self.adapter_forwards
            .read()
            .get(&data.adapter)
            .map(|endpoint| Route::Forward {
                target: ObjectRef::new("", endpoint.as_str(), key.clone()),
                permanent: false,
            })
    }
}

enum Route {
    Local(Arc<ObjectAdapter>, ObjectKeyData),
    Forward { target: ObjectRef, permanent: bool },
    Unknown,
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
