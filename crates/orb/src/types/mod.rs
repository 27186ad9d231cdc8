//! Core ORB data types

pub mod error;
pub mod object_key;
pub mod object_ref;

pub use error::{
    CompletionStatus, ErrorCategory, OrbError, OrderViolation, Result, UpcallException,
};
pub use object_key::{ObjectKey, ObjectKeyData};
pub use object_ref::ObjectRef;
