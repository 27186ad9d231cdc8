//! High-level server API
//!
//! Ties a [`Dispatcher`] to the adapter managers and adapters of one
//! server id.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use parking_lot::RwLock;
use tracing::{debug, info};

use crate::adapter::{AdapterManager, ManagerState, ObjectAdapter};
use crate::config::{AdapterPolicies, OrbConfig};
use crate::dispatch::Dispatcher;
use crate::types::{OrbError, Result};

/// Name of the adapter created by [`OrbServer::root_adapter`]
pub const ROOT_ADAPTER: &str = "RootPOA";

/// Server side of the ORB
///
/// Owns:
/// - The dispatcher routing incoming requests
/// - The root adapter manager and any further managers
/// - The adapters created through it
pub struct OrbServer {
    config: OrbConfig,
    dispatcher: Arc<Dispatcher>,
    root_manager: Arc<AdapterManager>,
    managers: RwLock<Vec<Arc<AdapterManager>>>,
    running: AtomicBool,
}

impl OrbServer {
    /// Create a server
    pub fn new(config: OrbConfig) -> Self {
        let dispatcher = Arc::new(Dispatcher::with_config(
            config.server_id.clone(),
            config.dispatcher.clone(),
        ));
        let root_manager = AdapterManager::with_config("RootPOAManager", &config.manager);
        info!(
            "ORB server {} created (endpoint {})",
            config.server_id, config.endpoint
        );
        Self {
            config,
            dispatcher,
            managers: RwLock::new(vec![Arc::clone(&root_manager)]),
            root_manager,
            running: AtomicBool::new(true),
        }
    }

    /// Create a server with default configuration
    pub fn with_server_id(server_id: impl Into<String>) -> Self {
        Self::new(OrbConfig::new(server_id))
    }

    pub fn config(&self) -> &OrbConfig {
        &self.config
    }

    pub fn server_id(&self) -> &str {
        &self.config.server_id
    }

    pub fn endpoint(&self) -> &str {
        &self.config.endpoint
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn root_manager(&self) -> &Arc<AdapterManager> {
        &self.root_manager
    }

    /// Create an additional adapter manager
    pub fn create_manager(&self, id: impl Into<String>) -> Arc<AdapterManager> {
        let manager = AdapterManager::with_config(id, &self.config.manager);
        self.managers.write().push(Arc::clone(&manager));
        manager
    }

    pub fn managers(&self) -> Vec<Arc<AdapterManager>> {
        self.managers.read().clone()
    }

    /// The root adapter, created on first use with the configured policies
    pub fn root_adapter(&self) -> Result<Arc<ObjectAdapter>> {
        if let Some(adapter) = self.dispatcher.adapter(ROOT_ADAPTER) {
            if !adapter.is_destroyed() {
                return Ok(adapter);
            }
        }
        self.create_adapter(ROOT_ADAPTER, self.config.adapter.clone())
    }

    /// Create an adapter under the root manager
    pub fn create_adapter(
        &self,
        name: &str,
        policies: AdapterPolicies,
    ) -> Result<Arc<ObjectAdapter>> {
        let manager = Arc::clone(&self.root_manager);
        self.create_adapter_in(&manager, name, policies)
    }

    /// Create an adapter under `manager` and make it reachable
    pub fn create_adapter_in(
        &self,
        manager: &Arc<AdapterManager>,
        name: &str,
        policies: AdapterPolicies,
    ) -> Result<Arc<ObjectAdapter>> {
        if !self.is_running() {
            return Err(OrbError::AdapterInactive);
        }
        let adapter = manager.create_adapter(
            name,
            &self.config.server_id,
            &self.config.endpoint,
            policies,
        )?;
        self.dispatcher.register_adapter(Arc::clone(&adapter));
        Ok(adapter)
    }

    /// Destroy the adapter called `name`
    pub fn destroy_adapter(&self, name: &str, etherealize: bool, wait: bool) -> Result<()> {
        let Some(adapter) = self.dispatcher.adapter(name) else {
            return Ok(());
        };
        adapter.destroy(etherealize, wait)?;
        self.dispatcher.unregister_adapter(name);
        Ok(())
    }

    /// Start accepting requests on the root manager
    pub fn activate(&self) -> Result<()> {
        self.root_manager.activate()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Deactivate every manager
    ///
    /// With `wait` set, returns once requests in progress have finished
    /// and every servant has been etherealized. Calling it again is a
    /// no-op.
    pub fn shutdown(&self, wait: bool) -> Result<()> {
        if !self.running.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        info!("shutting down ORB server {}", self.config.server_id);
        for manager in self.managers() {
            if manager.state() == ManagerState::Inactive {
                continue;
            }
            match manager.deactivate(true, wait) {
                Ok(()) | Err(OrbError::AdapterInactive) => {}
                Err(err) => {
                    self.running.store(true, Ordering::SeqCst);
                    return Err(err);
                }
            }
        }
        debug!("ORB server {} stopped", self.config.server_id);
        Ok(())
    }
}

impl std::fmt::Debug for OrbServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrbServer")
            .field("server_id", &self.config.server_id)
            .field("endpoint", &self.config.endpoint)
            .field("running", &self.is_running())
            .finish()
    }
}

/// Builder for [`OrbServer`]
pub struct OrbServerBuilder {
    config: OrbConfig,
}

impl OrbServerBuilder {
    pub fn new() -> Self {
        Self {
            config: OrbConfig::default(),
        }
    }

    /// Start from an existing configuration
    pub fn config(mut self, config: OrbConfig) -> Self {
        self.config = config;
        self
    }

    pub fn server_id(mut self, server_id: impl Into<String>) -> Self {
        self.config.server_id = server_id.into();
        self
    }

    pub fn endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.config.endpoint = endpoint.into();
        self
    }

    /// Policies of the root adapter
    pub fn adapter_policies(mut self, policies: AdapterPolicies) -> Self {
        self.config.adapter = policies;
        self
    }

    /// State new managers start in
    pub fn initial_state(mut self, state: ManagerState) -> Self {
        self.config.manager.initial_state = state;
        self
    }

    /// Bound on requests waiting while holding
    pub fn hold_timeout(mut self, timeout: Duration) -> Self {
        self.config.dispatcher.hold_timeout = Some(timeout);
        self
    }

    pub fn build(self) -> OrbServer {
        OrbServer::new(self.config)
    }
}

impl Default for OrbServerBuilder {
    fn default() -> Self {
        Self::new()
    }
}
