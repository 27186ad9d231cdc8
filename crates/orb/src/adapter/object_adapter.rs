//! Object adapters
//!
//! An [`ObjectAdapter`] is a named namespace of object ids with its own
//! active object map, request counter and policies. Its admission state
//! is controlled by the owning [`AdapterManager`].

use bytes::Bytes;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, info};
use uuid::Uuid;

use super::active_object_map::ActiveObjectMap;
use super::adapter_manager::{AdapterManager, ManagerState};
use super::pending_requests::PendingRequests;
use crate::config::{AdapterPolicies, IdAssignment, IdUniqueness};
use crate::dispatch::current;
use crate::dispatch::servant::{Etherealizer, ServantHandle};
use crate::types::{ObjectKey, ObjectKeyData, ObjectRef, OrbError, OrderViolation, Result};

/// A named group of objects sharing policies and an adapter manager
pub struct ObjectAdapter {
    name: String,
    /// Distinguishes this incarnation from earlier adapters with the same name
    instance: Uuid,
    server_id: String,
    endpoint: String,
    /// Encoded server id, adapter name and instance in front of every key
    key_prefix: Bytes,
    policies: AdapterPolicies,
    map: ActiveObjectMap,
    pending: PendingRequests,
    manager: Weak<AdapterManager>,
    manager_id: String,
    /// Last state announced by the manager
    admission: AtomicU8,
    destroyed: AtomicBool,
}

impl ObjectAdapter {
    pub(crate) fn new(
        name: String,
        server_id: String,
        endpoint: String,
        policies: AdapterPolicies,
        manager: &Arc<AdapterManager>,
        state: ManagerState,
    ) -> Result<Self> {
        let instance = Uuid::new_v4();
        let key_prefix = ObjectKeyData::key_prefix(&server_id, &name, instance)?;
        let map = ActiveObjectMap::new(policies.id_uniqueness == IdUniqueness::Unique)
            .with_activation_wait(policies.activation_wait)
            .with_settle_timeout(policies.settle_timeout);
        Ok(Self {
            name,
            instance,
            server_id,
            endpoint,
            key_prefix,
            policies,
            map,
            pending: PendingRequests::new(),
            manager: Arc::downgrade(manager),
            manager_id: manager.id().to_string(),
            admission: AtomicU8::new(state.as_u8()),
            destroyed: AtomicBool::new(false),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn instance(&self) -> Uuid {
        self.instance
    }

    pub fn server_id(&self) -> &str {
        &self.server_id
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn policies(&self) -> &AdapterPolicies {
        &self.policies
    }

    /// Owning manager, unless it has been dropped
    pub fn manager(&self) -> Option<Arc<AdapterManager>> {
        self.manager.upgrade()
    }

    pub fn manager_id(&self) -> &str {
        &self.manager_id
    }

    pub fn active_object_map(&self) -> &ActiveObjectMap {
        &self.map
    }

    pub fn pending(&self) -> &PendingRequests {
        &self.pending
    }

    /// Install the callback run when servants of this adapter are unbound
    pub fn set_etherealizer(&self, etherealizer: Arc<dyn Etherealizer>) {
        self.map.set_etherealizer(etherealizer);
    }

    /// Activate `servant` under a generated object id
    pub fn activate_object(&self, servant: ServantHandle) -> Result<ObjectKey> {
        if self.policies.id_assignment != IdAssignment::System {
            return Err(OrbError::WrongPolicy(
                "activate_object requires system assigned ids".to_string(),
            ));
        }
        let id = ObjectKey::generate();
        self.activate_object_with_id(id.clone(), servant)?;
        Ok(id)
    }

    /// Activate `servant` under `id`
    pub fn activate_object_with_id(&self, id: ObjectKey, servant: ServantHandle) -> Result<()> {
        self.check_alive()?;
        self.map.activate(id, servant)
    }

    /// Deactivate the object with `id`
    pub fn deactivate_object(&self, id: &ObjectKey) -> Result<()> {
        self.check_alive()?;
        self.map.deactivate(id)
    }

    /// Servant active under `id`
    pub fn id_to_servant(&self, id: &ObjectKey) -> Result<ServantHandle> {
        self.map
            .resolve(id)
            .ok_or_else(|| OrbError::ObjectNotActive(id.clone()))
    }

    /// Object id `servant` is active under
    pub fn servant_to_id(&self, servant: &ServantHandle) -> Result<ObjectKey> {
        if self.policies.id_uniqueness != IdUniqueness::Unique {
            return Err(OrbError::WrongPolicy(
                "servant_to_id requires unique ids".to_string(),
            ));
        }
        self.map
            .servant_to_key(servant)
            .ok_or(OrbError::ServantNotActive)
    }

    /// Full object key for `id`, as presented to the dispatcher
    pub fn object_key(&self, id: &ObjectKey) -> ObjectKey {
        ObjectKeyData::with_prefix(&self.key_prefix, id)
    }

    /// Reference to the object with `id`
    pub fn create_reference(&self, id: &ObjectKey, type_id: &str) -> ObjectRef {
        ObjectRef::new(type_id, &self.endpoint, self.object_key(id))
    }

    /// Requests currently dispatched into this adapter
    pub fn outstanding_requests(&self) -> usize {
        self.pending.count()
    }

    /// Block until no requests are in progress
    pub fn wait_pending_requests(&self) {
        self.pending.wait_drained(None);
    }

    /// Deactivate and etherealize every active object
    pub fn etherealize_all(&self) {
        debug!("etherealizing all objects of adapter {}", self.name);
        self.map.etherealize_all();
    }

    /// Last admission state announced by the manager
    pub fn admission_state(&self) -> ManagerState {
        ManagerState::from_u8(self.admission.load(Ordering::SeqCst))
    }

    pub(crate) fn manager_state_changed(&self, state: ManagerState) {
        self.admission.store(state.as_u8(), Ordering::SeqCst);
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    /// Destroy the adapter
    ///
    /// Keys it created stop resolving immediately. With `wait` set, returns
    /// once requests in progress finish; with `etherealize` set every
    /// active servant is etherealized.
    pub fn destroy(&self, etherealize: bool, wait: bool) -> Result<()> {
        if wait && current::in_upcall_for(&self.manager_id) {
            return Err(OrbError::BadInvOrder(OrderViolation::InvocationInProgress));
        }
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        info!("destroying adapter {} ({})", self.name, self.instance);

        if let Some(manager) = self.manager() {
            manager.remove_adapter(self);
        }
        if wait {
            self.wait_pending_requests();
        }
        if etherealize {
            self.etherealize_all();
        }
        Ok(())
    }

    fn check_alive(&self) -> Result<()> {
        if self.is_destroyed() {
            return Err(OrbError::ObjectNotExist(ObjectKey::from(self.name.as_str())));
        }
        Ok(())
    }
}

impl std::fmt::Debug for ObjectAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectAdapter")
            .field("name", &self.name)
            .field("instance", &self.instance)
            .field("objects", &self.map.len())
            .field("outstanding", &self.pending.count())
            .finish()
    }
}
