//! Servant trait and upcall types
//!
//! Servants are the in-process implementations bound to object keys.

use std::any::Any;
use std::sync::Arc;
use bytes::Bytes;

use crate::types::{ObjectKey, ObjectRef, UpcallException};

/// Result of a single upcall into a servant
pub type UpcallResult = std::result::Result<Bytes, UpcallException>;

/// Trait for servant implementations
///
/// Servants receive already-decoded operation names and opaque argument
/// buffers; decoding the arguments is the skeleton's business. A servant
/// may be invoked from several dispatch threads at once and must provide
/// its own synchronization for internal state.
pub trait Servant: Send + Sync + 'static {
    /// Repository id of the most derived interface
    fn repository_id(&self) -> &str;

    /// Invoke an operation on this servant
    fn invoke(&self, operation: &str, args: Bytes) -> UpcallResult;

    /// Cast to Any for downcasting
    fn as_any(&self) -> &dyn Any;
}

/// Shared handle to a servant
pub type ServantHandle = Arc<dyn Servant>;

/// Identity of a servant instance, used by the unique id policy
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ServantId(usize);

impl ServantId {
    /// Identity of the servant behind a handle
    pub fn of(servant: &ServantHandle) -> Self {
        Self(Arc::as_ptr(servant) as *const () as usize)
    }
}

/// Callback invoked when a servant is permanently unbound from a key
pub trait Etherealizer: Send + Sync {
    /// Clean up after `servant` was deactivated as `key`
    ///
    /// `cleanup_in_progress` is set when the owning adapter or manager is
    /// shutting down. `remaining_activations` is set when the servant is
    /// still active under other keys.
    fn etherealize(
        &self,
        key: &ObjectKey,
        servant: ServantHandle,
        cleanup_in_progress: bool,
        remaining_activations: bool,
    );
}

/// Outcome of a dispatched request
#[derive(Debug, Clone, PartialEq)]
pub enum UpcallOutcome {
    /// Normal reply
    Reply(Bytes),
    /// The servant raised a user exception
    UserException { id: String, body: Bytes },
    /// The target lives elsewhere; the client should retry there
    LocationForward { target: ObjectRef, permanent: bool },
}

impl UpcallOutcome {
    /// Check if this outcome is a normal reply
    pub fn is_reply(&self) -> bool {
        matches!(self, UpcallOutcome::Reply(_))
    }
}
