//! Client side request handling
//!
//! This module provides:
//! - Transport, connector and marshaler interfaces
//! - The retry policy
//! - The per-request state machine and the set of pending deferred requests
//! - An in-process transport dispatching into a local dispatcher

pub mod client_invocation;
pub mod collocated;
pub mod pending_set;
pub mod retry;
pub mod transport;

#[cfg(test)]
pub(crate) mod testing;

pub use client_invocation::{ClientInvocation, InvocationMode, InvocationState};
pub use collocated::{CollocatedCodec, CollocatedConnector, CollocatedTransport, IncomingRequest};
pub use pending_set::PendingInvocationSet;
pub use retry::{RetryDecision, RetryMode, RetryPolicy};
pub use transport::{
    Connector, Marshaler, OutgoingRequest, PendingReply, ReplyStatus, Transport, TransportError,
    TransportResult,
};
