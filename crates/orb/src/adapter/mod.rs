//! Object adapter runtime
//!
//! Maps object ids to servants and controls request admission:
//! - [`ActiveObjectMap`] / [`ObjectEntry`]: per-object activation state
//! - [`ObjectAdapter`]: a named id namespace with policies
//! - [`AdapterManager`]: hold / discard / activate / deactivate for a group of adapters

pub mod active_object_map;
pub mod adapter_manager;
pub mod object_adapter;
pub mod object_entry;
pub mod pending_requests;

pub use active_object_map::{ActiveObjectMap, RequestGuard};
pub use adapter_manager::{AdapterManager, ManagerState, StateObserver};
pub use object_adapter::ObjectAdapter;
pub use object_entry::{EntryState, InvalidTransition, ObjectEntry};
pub use pending_requests::{PendingRequestGuard, PendingRequests};
