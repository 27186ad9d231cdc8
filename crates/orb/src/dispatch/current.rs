//! Per-thread upcall context
//!
//! Every dispatched upcall pushes an [`UpcallContext`] for the duration of
//! the servant call. Servants can inspect the innermost context, and the
//! adapter manager uses it to refuse blocking transitions that would wait
//! on the calling upcall itself.

use std::cell::RefCell;
use std::marker::PhantomData;

use crate::types::ObjectKey;

thread_local! {
    static UPCALLS: RefCell<Vec<UpcallContext>> = const { RefCell::new(Vec::new()) };
}

/// Description of an upcall in progress on this thread
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UpcallContext {
    /// Id of the adapter manager that admitted the request
    pub manager_id: String,
    /// Name of the adapter serving the request
    pub adapter: String,
    /// Object id inside the adapter
    pub object_id: ObjectKey,
    pub operation: String,
}

/// Marks this thread as inside an upcall until dropped
pub struct UpcallScope {
    // Scopes are tied to the thread that pushed them
    _not_send: PhantomData<*const ()>,
}

impl UpcallScope {
    pub fn enter(context: UpcallContext) -> Self {
        UPCALLS.with(|upcalls| upcalls.borrow_mut().push(context));
        Self {
            _not_send: PhantomData,
        }
    }
}

impl Drop for UpcallScope {
    fn drop(&mut self) {
        UPCALLS.with(|upcalls| {
            upcalls.borrow_mut().pop();
        });
    }
}

/// Innermost upcall on this thread
pub fn current() -> Option<UpcallContext> {
    UPCALLS.with(|upcalls| upcalls.borrow().last().cloned())
}

/// Whether this thread is inside any upcall admitted by `manager_id`
pub fn in_upcall_for(manager_id: &str) -> bool {
    UPCALLS.with(|upcalls| upcalls.borrow().iter().any(|c| c.manager_id == manager_id))
}

/// Number of nested upcalls on this thread
pub fn depth() -> usize {
    UPCALLS.with(|upcalls| upcalls.borrow().len())
}
