//! ORB configuration
//!
//! Configuration is built from plain structs with defaults and chained
//! setters, or parsed from flat `orb.*` properties:
//!
//! | Property | Meaning |
//! |---|---|
//! | `orb.server_id` | server id embedded in object keys |
//! | `orb.endpoint` | endpoint placed in created references |
//! | `orb.oa.id_uniqueness` | `unique` or `multiple` |
//! | `orb.oa.id_assignment` | `system` or `user` |
//! | `orb.oa.activation_wait_ms` | bound on activation waiting out a deactivation |
//! | `orb.oa.settle_timeout_ms` | bound on lookups waiting for a pending entry |
//! | `orb.oa.initial_state` | `holding` or `active` |
//! | `orb.oa.hold_timeout_ms` | bound on requests waiting while holding |
//! | `orb.client.retry.mode` | `never`, `strict` or `always` |
//! | `orb.client.retry.interval_ms` | pause between transmissions |
//! | `orb.client.retry.max_attempts` | total transmissions per invocation |
//! | `orb.client.retry.remote` | retry transient errors reported by the server |
//! | `orb.client.max_forwards` | bound on location forwards per invocation |

use std::time::Duration;
use tracing::warn;

use crate::adapter::ManagerState;
use crate::adapter::active_object_map::DEFAULT_SETTLE_TIMEOUT;
use crate::invocation::retry::{RetryMode, RetryPolicy};
use crate::types::{OrbError, Result};

/// Default bound on location forwards followed by one invocation
pub const DEFAULT_MAX_FORWARDS: u32 = 16;

/// Default endpoint for references created by an in-process server
pub const DEFAULT_ENDPOINT: &str = "local";

/// Whether a servant may be active under several object ids
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum IdUniqueness {
    Unique,
    Multiple,
}

/// Who chooses object ids
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum IdAssignment {
    /// The application supplies ids
    User,
    /// The adapter generates ids
    System,
}

/// Policies of one object adapter
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AdapterPolicies {
    pub id_uniqueness: IdUniqueness,
    pub id_assignment: IdAssignment,
    /// Bound on activation waiting out a pending deactivation; `None` waits indefinitely
    pub activation_wait: Option<Duration>,
    /// Bound on lookups waiting for a pending entry
    pub settle_timeout: Duration,
}

impl Default for AdapterPolicies {
    fn default() -> Self {
        Self {
            id_uniqueness: IdUniqueness::Unique,
            id_assignment: IdAssignment::System,
            activation_wait: None,
            settle_timeout: DEFAULT_SETTLE_TIMEOUT,
        }
    }
}

impl AdapterPolicies {
    pub fn with_id_uniqueness(mut self, id_uniqueness: IdUniqueness) -> Self {
        self.id_uniqueness = id_uniqueness;
        self
    }

    pub fn with_id_assignment(mut self, id_assignment: IdAssignment) -> Self {
        self.id_assignment = id_assignment;
        self
    }

    pub fn with_activation_wait(mut self, wait: Option<Duration>) -> Self {
        self.activation_wait = wait;
        self
    }

    pub fn with_settle_timeout(mut self, timeout: Duration) -> Self {
        self.settle_timeout = timeout;
        self
    }
}

/// Adapter manager configuration
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AdapterManagerConfig {
    /// State a new manager starts in
    pub initial_state: ManagerState,
}

impl Default for AdapterManagerConfig {
    fn default() -> Self {
        Self {
            initial_state: ManagerState::Holding,
        }
    }
}

impl AdapterManagerConfig {
    pub fn with_initial_state(mut self, state: ManagerState) -> Self {
        self.initial_state = state;
        self
    }
}

/// Dispatcher configuration
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DispatcherConfig {
    /// Bound on requests waiting while their manager is holding; `None` waits indefinitely
    pub hold_timeout: Option<Duration>,
}

impl DispatcherConfig {
    pub fn with_hold_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.hold_timeout = timeout;
        self
    }
}

/// Client invocation configuration
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClientConfig {
    pub retry: RetryPolicy,
    /// Location forwards followed before an invocation fails
    pub max_forwards: u32,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            max_forwards: DEFAULT_MAX_FORWARDS,
        }
    }
}

impl ClientConfig {
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_max_forwards(mut self, max_forwards: u32) -> Self {
        self.max_forwards = max_forwards;
        self
    }
}

/// Complete ORB configuration
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OrbConfig {
    /// Server id embedded in every object key this process creates
    pub server_id: String,
    /// Endpoint placed in created references
    pub endpoint: String,
    pub adapter: AdapterPolicies,
    pub manager: AdapterManagerConfig,
    pub dispatcher: DispatcherConfig,
    pub client: ClientConfig,
}

impl Default for OrbConfig {
    fn default() -> Self {
        Self {
            server_id: "_RootPOA".to_string(),
            endpoint: DEFAULT_ENDPOINT.to_string(),
            adapter: AdapterPolicies::default(),
            manager: AdapterManagerConfig::default(),
            dispatcher: DispatcherConfig::default(),
            client: ClientConfig::default(),
        }
    }
}

impl OrbConfig {
    /// Create a configuration with the given server id
    pub fn new(server_id: impl Into<String>) -> Self {
        Self {
            server_id: server_id.into(),
            ..Self::default()
        }
    }

    /// Parse `orb.*` properties over the defaults
    ///
    /// Keys outside the `orb.` namespace are ignored. Unknown `orb.` keys
    /// are logged and ignored.
    pub fn from_properties<I, K, V>(properties: I) -> Result<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut config = Self::default();
        for (key, value) in properties {
            config.apply_property(key.as_ref(), value.as_ref())?;
        }
        Ok(config)
    }

    /// Apply a single property
    pub fn apply_property(&mut self, key: &str, value: &str) -> Result<()> {
        let Some(name) = key.strip_prefix("orb.") else {
            return Ok(());
        };
        let value = value.trim();

        match name {
            "server_id" => {
                if value.is_empty() {
                    return Err(OrbError::InvalidConfig("orb.server_id is empty".to_string()));
                }
                self.server_id = value.to_string();
            }
            "endpoint" => self.endpoint = value.to_string(),
            "oa.id_uniqueness" => {
                self.adapter.id_uniqueness = match value.to_ascii_lowercase().as_str() {
                    "unique" => IdUniqueness::Unique,
                    "multiple" => IdUniqueness::Multiple,
                    _ => return Err(invalid(key, value)),
                }
            }
            "oa.id_assignment" => {
                self.adapter.id_assignment = match value.to_ascii_lowercase().as_str() {
                    "system" => IdAssignment::System,
                    "user" => IdAssignment::User,
                    _ => return Err(invalid(key, value)),
                }
            }
            "oa.activation_wait_ms" => {
                self.adapter.activation_wait = Some(parse_millis(key, value)?)
            }
            "oa.settle_timeout_ms" => self.adapter.settle_timeout = parse_millis(key, value)?,
            "oa.initial_state" => {
                self.manager.initial_state = match value.to_ascii_lowercase().as_str() {
                    "holding" => ManagerState::Holding,
                    "active" => ManagerState::Active,
                    _ => return Err(invalid(key, value)),
                }
            }
            "oa.hold_timeout_ms" => {
                self.dispatcher.hold_timeout = Some(parse_millis(key, value)?)
            }
            "client.retry.mode" => self.client.retry.mode = value.parse::<RetryMode>()?,
            "client.retry.interval_ms" => {
                self.client.retry.interval = parse_millis(key, value)?
            }
            "client.retry.max_attempts" => {
                let attempts = parse_u32(key, value)?;
                if attempts == 0 {
                    return Err(invalid(key, value));
                }
                self.client.retry.max_attempts = attempts;
            }
            "client.retry.remote" => self.client.retry.remote = parse_bool(key, value)?,
            "client.max_forwards" => self.client.max_forwards = parse_u32(key, value)?,
            _ => warn!("ignoring unknown property {}", key),
        }
        Ok(())
    }
}

fn invalid(key: &str, value: &str) -> OrbError {
    OrbError::InvalidConfig(format!("invalid value '{}' for {}", value, key))
}

fn parse_u32(key: &str, value: &str) -> Result<u32> {
    value.parse::<u32>().map_err(|_| invalid(key, value))
}

fn parse_millis(key: &str, value: &str) -> Result<Duration> {
    value
        .parse::<u64>()
        .map(Duration::from_millis)
        .map_err(|_| invalid(key, value))
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "yes" | "1" => Ok(true),
        "false" | "no" | "0" => Ok(false),
        _ => Err(invalid(key, value)),
    }
}
