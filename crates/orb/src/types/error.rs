//! ORB error types

use bytes::Bytes;
use thiserror::Error;

use super::{ObjectKey, ObjectRef};

/// Result type for ORB operations
pub type Result<T> = std::result::Result<T, OrbError>;

/// How far a failed request got before it failed
///
/// Mirrors the completion status carried by system exceptions. The strict
/// retry mode only resends requests that are known not to have executed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CompletionStatus {
    /// The request never reached the target
    No,
    /// The target executed the request
    Yes,
    /// Unknown
    Maybe,
}

/// Minor code of a usage-order error
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum OrderViolation {
    /// The invocation already completed
    RequestAlreadySent,
    /// The invocation is in flight
    DuplicateSend,
    /// A response was requested for an invocation that was never sent
    RequestNotSent,
    /// The response was already consumed
    ResponseAlreadyReceived,
    /// Polling or waiting on an invocation that was not sent deferred
    SynchronousRequest,
    /// A blocking adapter manager transition was requested from inside one of its own upcalls
    InvocationInProgress,
    /// `release` without a matching `acquire`
    UnbalancedRelease,
}

impl OrderViolation {
    /// Human readable description of the violation
    pub fn describe(&self) -> &'static str {
        match self {
            OrderViolation::RequestAlreadySent => "request has already been sent",
            OrderViolation::DuplicateSend => "request is currently being sent",
            OrderViolation::RequestNotSent => "request has not been sent",
            OrderViolation::ResponseAlreadyReceived => "response has already been received",
            OrderViolation::SynchronousRequest => "request was not sent deferred",
            OrderViolation::InvocationInProgress => "invocation in progress",
            OrderViolation::UnbalancedRelease => "release without matching acquire",
        }
    }
}

impl std::fmt::Display for OrderViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.describe())
    }
}

/// Broad handling class of an [`OrbError`]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Programmer error: operation called in a state that forbids it. Never retried.
    UsageOrder,
    /// Safe to retry
    Transient,
    /// Terminal
    Permanent,
}

/// ORB errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum OrbError {
    /// An object is already active under this key
    #[error("object already active: {0}")]
    ObjectAlreadyActive(ObjectKey),

    /// The servant is already active under another key (unique id policy)
    #[error("servant already active as {0}")]
    ServantAlreadyActive(ObjectKey),

    /// The servant is not active in this adapter
    #[error("servant not active")]
    ServantNotActive,

    /// No active object under this key
    #[error("object not active: {0}")]
    ObjectNotActive(ObjectKey),

    /// The object does not exist on this server
    #[error("object does not exist: {0}")]
    ObjectNotExist(ObjectKey),

    /// The adapter manager has been deactivated
    #[error("adapter manager is inactive")]
    AdapterInactive,

    /// Operation not permitted by the adapter's policies
    #[error("wrong policy: {0}")]
    WrongPolicy(String),

    /// Operation invoked in a state that forbids it
    #[error("bad invocation order: {0}")]
    BadInvOrder(OrderViolation),

    /// Transient failure, safe to retry
    #[error("transient failure ({completion:?}): {reason}")]
    Transient {
        reason: String,
        completion: CompletionStatus,
    },

    /// Communication failure
    #[error("communication failure ({completion:?}): {reason}")]
    CommFailure {
        reason: String,
        completion: CompletionStatus,
    },

    /// Request or reply could not be encoded or decoded
    #[error("marshaling error: {0}")]
    Marshal(String),

    /// The servant raised a user exception
    #[error("user exception: {id}")]
    UserException { id: String, body: Bytes },

    /// The upcall failed in a way the ORB does not understand (including panics)
    #[error("unknown exception: {0}")]
    Unknown(String),

    /// Redirect chain exceeded the configured hop limit
    #[error("too many location forwards ({0})")]
    TooManyForwards(u32),

    /// All permitted transmissions failed
    #[error("retries exhausted after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: Box<OrbError> },

    /// Invalid configuration value
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl OrbError {
    /// Create a transient error that did not reach the target
    pub fn transient(reason: impl Into<String>) -> Self {
        OrbError::Transient {
            reason: reason.into(),
            completion: CompletionStatus::No,
        }
    }

    /// Create a communication failure
    pub fn comm_failure(reason: impl Into<String>, completion: CompletionStatus) -> Self {
        OrbError::CommFailure {
            reason: reason.into(),
            completion,
        }
    }

    /// Handling class of this error
    pub fn category(&self) -> ErrorCategory {
        match self {
            OrbError::BadInvOrder(_)
            | OrbError::ObjectAlreadyActive(_)
            | OrbError::ObjectNotActive(_) => ErrorCategory::UsageOrder,
            OrbError::Transient { .. } => ErrorCategory::Transient,
            _ => ErrorCategory::Permanent,
        }
    }

    /// Check if this is a transient failure
    pub fn is_transient(&self) -> bool {
        matches!(self, OrbError::Transient { .. })
    }

    /// Completion status, for errors that carry one
    pub fn completion(&self) -> Option<CompletionStatus> {
        match self {
            OrbError::Transient { completion, .. } | OrbError::CommFailure { completion, .. } => {
                Some(*completion)
            }
            _ => None,
        }
    }
}

/// Exception raised by a servant during an upcall
#[derive(Debug, Clone, PartialEq)]
pub enum UpcallException {
    /// A user exception declared by the operation
    User { id: String, body: Bytes },
    /// A system exception
    System(OrbError),
    /// The servant asks the client to retry at another reference
    Forward(ObjectRef),
}

impl From<OrbError> for UpcallException {
    fn from(err: OrbError) -> Self {
        UpcallException::System(err)
    }
}
