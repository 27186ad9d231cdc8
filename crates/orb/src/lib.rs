//! Object request broker core
//!
//! This crate provides the request dispatch and object lifecycle core of
//! a CORBA-style object request broker: mapping object keys to servants,
//! controlling request admission, and driving outgoing invocations
//! through retries and location forwards.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │              OrbServer               OrbClient              │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Dispatcher            │  ClientInvocation                  │
//! │  - key routing         │  - sync / oneway / deferred        │
//! │  - forward tables      │  - retry policy                    │
//! │  - upcall context      │  - location forwards               │
//! ├────────────────────────┤  PendingInvocationSet              │
//! │  AdapterManager        │                                    │
//! │  - hold / discard      ├────────────────────────────────────┤
//! │  - activate / deactivate  Connector / Transport / Marshaler │
//! ├────────────────────────┤  (collocated transport included)   │
//! │  ObjectAdapter         │                                    │
//! │  - ActiveObjectMap     │                                    │
//! │  - ObjectEntry         │                                    │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Key Concepts
//!
//! - **Object key**: opaque byte string identifying an object inside a server
//! - **Servant**: the in-process implementation bound to a key
//! - **Active object map**: key to servant bindings with per-entry
//!   activation state and outstanding request counts
//! - **Adapter manager**: admission state shared by a group of adapters
//! - **Etherealize**: the callback run once a servant is permanently unbound
//!
//! # Modules
//!
//! - [`types`]: Keys, references and errors
//! - [`adapter`]: Active object map, adapters and adapter managers
//! - [`dispatch`]: Servants, upcall context and the dispatcher
//! - [`invocation`]: Client invocations, retry policy and transports
//! - [`config`]: Configuration structs and property parsing

pub mod types;
pub mod adapter;
pub mod dispatch;
pub mod invocation;
pub mod config;

mod client;
mod server;

// Re-export main types and client/server APIs
pub use types::{
    CompletionStatus, ErrorCategory, OrbError, OrderViolation, Result, UpcallException,
    ObjectKey, ObjectKeyData, ObjectRef,
};
pub use adapter::{ActiveObjectMap, AdapterManager, EntryState, ManagerState, ObjectAdapter};
pub use dispatch::{Dispatcher, Etherealizer, Servant, ServantHandle, UpcallOutcome, UpcallResult};
pub use invocation::{ClientInvocation, InvocationState, PendingInvocationSet, RetryMode, RetryPolicy};
pub use config::{AdapterPolicies, ClientConfig, IdAssignment, IdUniqueness, OrbConfig};
pub use client::OrbClient;
pub use server::{OrbServer, OrbServerBuilder, ROOT_ADAPTER};
