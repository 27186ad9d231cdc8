//! High-level client API
//!
//! Creates [`ClientInvocation`]s that share a connector, a marshaler, a
//! client configuration and one set of pending deferred requests.

use std::sync::Arc;
use bytes::Bytes;

use crate::config::ClientConfig;
use crate::invocation::{
    ClientInvocation, CollocatedCodec, CollocatedConnector, Connector, Marshaler,
    PendingInvocationSet,
};
use crate::types::{ObjectRef, Result};

/// Client side of the ORB
pub struct OrbClient {
    connector: Arc<dyn Connector>,
    marshaler: Arc<dyn Marshaler>,
    config: ClientConfig,
    pending: Arc<PendingInvocationSet>,
}

impl OrbClient {
    pub fn new(connector: Arc<dyn Connector>, marshaler: Arc<dyn Marshaler>) -> Self {
        Self::with_config(connector, marshaler, ClientConfig::default())
    }

    pub fn with_config(
        connector: Arc<dyn Connector>,
        marshaler: Arc<dyn Marshaler>,
        config: ClientConfig,
    ) -> Self {
        Self {
            connector,
            marshaler,
            config,
            pending: Arc::new(PendingInvocationSet::new()),
        }
    }

    /// Client talking to in-process servers through `connector`
    pub fn collocated(connector: Arc<CollocatedConnector>, config: ClientConfig) -> Self {
        Self::with_config(connector, Arc::new(CollocatedCodec), config)
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Deferred requests created by this client that have not been consumed
    pub fn pending(&self) -> &Arc<PendingInvocationSet> {
        &self.pending
    }

    /// Create an unsent request of `operation` on `target`
    ///
    /// Deferred sends of the request are tracked in [`OrbClient::pending`].
    pub fn create_request(
        &self,
        target: &ObjectRef,
        operation: &str,
        args: Bytes,
    ) -> Arc<ClientInvocation> {
        let invocation = ClientInvocation::new(
            target.clone(),
            operation,
            args,
            Arc::clone(&self.connector),
            Arc::clone(&self.marshaler),
            self.config.clone(),
        );
        invocation.track_in(&self.pending);
        invocation
    }

    /// Invoke `operation` and wait for the reply
    pub fn invoke(&self, target: &ObjectRef, operation: &str, args: Bytes) -> Result<Bytes> {
        self.create_request(target, operation, args).invoke()
    }

    /// Invoke `operation` without waiting for a reply
    pub fn send_oneway(&self, target: &ObjectRef, operation: &str, args: Bytes) -> Result<()> {
        self.create_request(target, operation, args).send_oneway()
    }

    /// Send every request deferred
    pub fn send_multiple_deferred(&self, invocations: &[Arc<ClientInvocation>]) -> Result<()> {
        self.pending.send_multiple_deferred(invocations)
    }

    /// Check whether any deferred reply is ready
    pub fn poll_next_response(&self) -> Result<bool> {
        self.pending.poll_all()
    }

    /// Consume the next deferred reply, blocking if none is ready
    pub fn get_next_response(&self) -> Result<Arc<ClientInvocation>> {
        self.pending.take_next_completed()
    }
}

impl std::fmt::Debug for OrbClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrbClient")
            .field("config", &self.config)
            .field("pending", &self.pending.len())
            .finish()
    }
}
