//! Object references

use std::fmt;

use super::ObjectKey;

/// A pre-resolved reference to a remote object
///
/// Carries everything a connector needs to bind a transport: the
/// endpoint to contact, the object key to address and the repository id
/// of the most derived interface known for the target.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ObjectRef {
    /// Repository id of the target interface
    pub type_id: String,
    /// Endpoint the connector binds to
    pub endpoint: String,
    /// Object key sent with each request
    pub key: ObjectKey,
}

impl ObjectRef {
    /// Create a new reference
    pub fn new(type_id: impl Into<String>, endpoint: impl Into<String>, key: ObjectKey) -> Self {
        Self {
            type_id: type_id.into(),
            endpoint: endpoint.into(),
            key,
        }
    }
}

impl fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}/{}", self.type_id, self.endpoint, self.key)
    }
}
