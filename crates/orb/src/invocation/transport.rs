//! Collaborator interfaces used by client invocations
//!
//! A [`Connector`] binds a pre-resolved [`ObjectRef`] to a [`Transport`];
//! a [`Marshaler`] converts requests and replies to and from bytes. Both
//! are supplied by the embedding application.

use std::sync::Arc;
use bytes::Bytes;
use thiserror::Error;

use crate::types::{ObjectKey, ObjectRef, OrbError, Result};

/// A request about to be encoded
#[derive(Debug, Clone, PartialEq)]
pub struct OutgoingRequest {
    /// Key of the current target
    pub key: ObjectKey,
    pub operation: String,
    pub args: Bytes,
    pub response_expected: bool,
}

/// Decoded reply
#[derive(Debug, Clone, PartialEq)]
pub enum ReplyStatus {
    /// Normal result
    NoException(Bytes),
    /// User exception raised by the servant
    UserException { id: String, body: Bytes },
    /// System exception reported by the server
    SystemException(OrbError),
    /// The target has moved
    LocationForward { target: ObjectRef, permanent: bool },
}

/// Request and reply encoding
pub trait Marshaler: Send + Sync {
    /// Encode a request
    fn encode(&self, request: &OutgoingRequest) -> Result<Bytes>;

    /// Decode a reply
    fn decode(&self, reply: Bytes) -> Result<ReplyStatus>;
}

/// Transport failure, classified by the transport
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TransportError {
    /// Safe to retry under the client's retry policy
    #[error("transient transport failure: {0}")]
    Transient(OrbError),

    /// Not retryable
    #[error("transport failure: {0}")]
    Permanent(OrbError),

    /// The target moved; retry against `target`
    #[error("redirected to {target}")]
    Redirect { target: ObjectRef, permanent: bool },
}

/// Result of a transport operation
pub type TransportResult<T> = std::result::Result<T, TransportError>;

/// Reply to a request sent without waiting
pub trait PendingReply: Send {
    /// Non-blocking check for the reply
    fn poll(&mut self) -> Option<TransportResult<Bytes>>;

    /// Block until the reply arrives
    fn wait(self: Box<Self>) -> TransportResult<Bytes>;
}

/// A bound connection to one target
pub trait Transport: Send + Sync {
    /// Send a request and wait for the reply
    fn request(&self, request: Bytes) -> TransportResult<Bytes>;

    /// Send a request that has no reply
    fn oneway(&self, request: Bytes) -> TransportResult<()>;

    /// Send a request and return without waiting for the reply
    fn deferred(&self, request: Bytes) -> TransportResult<Box<dyn PendingReply>>;
}

/// Binds references to transports
pub trait Connector: Send + Sync {
    fn bind(&self, target: &ObjectRef) -> TransportResult<Arc<dyn Transport>>;
}
