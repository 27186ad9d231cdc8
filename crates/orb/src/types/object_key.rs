//! Object keys
//!
//! An [`ObjectKey`] is the opaque identifier of an object inside an
//! adapter. The dispatcher receives keys in the structured form described
//! by [`ObjectKeyData`], which names the server, adapter and adapter
//! instance the object belongs to.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt;
use uuid::Uuid;

use super::error::{OrbError, Result};

/// Opaque, immutable object identifier
///
/// Equality, hashing and ordering are structural over the bytes.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct ObjectKey(Bytes);

impl ObjectKey {
    /// Create a key from bytes
    pub fn new(bytes: impl Into<Bytes>) -> Self {
        Self(bytes.into())
    }

    /// Create a key from a static byte string
    pub const fn from_static(bytes: &'static [u8]) -> Self {
        Self(Bytes::from_static(bytes))
    }

    /// Generate a unique key from a random v4 UUID
    pub fn generate() -> Self {
        let uuid = Uuid::new_v4();
        Self(Bytes::copy_from_slice(uuid.as_bytes()))
    }

    /// Key bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Key bytes as a cheaply cloneable buffer
    pub fn to_bytes(&self) -> Bytes {
        self.0.clone()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<&str> for ObjectKey {
    fn from(s: &str) -> Self {
        Self(Bytes::copy_from_slice(s.as_bytes()))
    }
}

impl From<Vec<u8>> for ObjectKey {
    fn from(v: Vec<u8>) -> Self {
        Self(Bytes::from(v))
    }
}

impl From<Bytes> for ObjectKey {
    fn from(b: Bytes) -> Self {
        Self(b)
    }
}

impl fmt::Debug for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectKey({})", self)
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Printable keys are shown as text, everything else as hex
        match std::str::from_utf8(&self.0) {
            Ok(s) if !s.is_empty() && s.chars().all(|c| c.is_ascii_graphic()) => f.write_str(s),
            _ => {
                for b in self.0.iter() {
                    write!(f, "{:02x}", b)?;
                }
                Ok(())
            }
        }
    }
}

/// Structured contents of an object key as produced by an adapter
///
/// Wire layout:
///
/// ```text
/// magic (1) | version (1) | server_id len (4) | server_id
///           | adapter len (4) | adapter | instance (16) | object_id (rest)
/// ```
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ObjectKeyData {
    /// Identifier of the server that created the key
    pub server_id: String,
    /// Name of the owning adapter
    pub adapter: String,
    /// Identity of the adapter incarnation that created the key
    pub instance: Uuid,
    /// Object identifier inside the adapter
    pub object_id: ObjectKey,
}

impl ObjectKeyData {
    const MAGIC: u8 = 0x4f;
    const VERSION: u8 = 1;
    const FIXED_SIZE: usize = 1 + 1 + 4 + 4 + 16;

    /// Create key data
    pub fn new(
        server_id: impl Into<String>,
        adapter: impl Into<String>,
        instance: Uuid,
        object_id: ObjectKey,
    ) -> Self {
        Self {
            server_id: server_id.into(),
            adapter: adapter.into(),
            instance,
            object_id,
        }
    }

    /// Encode to buffer
    pub fn encode<B: BufMut>(&self, buf: &mut B) -> Result<()> {
        Self::encode_prefix(&self.server_id, &self.adapter, self.instance, buf)?;
        buf.put_slice(self.object_id.as_bytes());
        Ok(())
    }

    /// Encode into an object key
    pub fn to_key(&self) -> Result<ObjectKey> {
        let mut buf = BytesMut::with_capacity(
            Self::FIXED_SIZE + self.server_id.len() + self.adapter.len() + self.object_id.len(),
        );
        self.encode(&mut buf)?;
        Ok(ObjectKey(buf.freeze()))
    }

    /// Everything in front of the object id, shared by all keys of one adapter
    pub(crate) fn key_prefix(server_id: &str, adapter: &str, instance: Uuid) -> Result<Bytes> {
        let mut buf = BytesMut::with_capacity(Self::FIXED_SIZE + server_id.len() + adapter.len());
        Self::encode_prefix(server_id, adapter, instance, &mut buf)?;
        Ok(buf.freeze())
    }

    /// Append `object_id` to a prefix from [`ObjectKeyData::key_prefix`]
    pub(crate) fn with_prefix(prefix: &Bytes, object_id: &ObjectKey) -> ObjectKey {
        let mut buf = BytesMut::with_capacity(prefix.len() + object_id.len());
        buf.put_slice(prefix);
        buf.put_slice(object_id.as_bytes());
        ObjectKey(buf.freeze())
    }

    fn encode_prefix<B: BufMut>(
        server_id: &str,
        adapter: &str,
        instance: Uuid,
        buf: &mut B,
    ) -> Result<()> {
        buf.put_u8(Self::MAGIC);
        buf.put_u8(Self::VERSION);
        put_string(buf, "server_id", server_id)?;
        put_string(buf, "adapter", adapter)?;
        buf.put_slice(instance.as_bytes());
        Ok(())
    }

    /// Parse a structured key
    pub fn parse(key: &ObjectKey) -> Result<Self> {
        let mut buf = key.0.clone();
        if buf.remaining() < Self::FIXED_SIZE {
            return Err(underflow(Self::FIXED_SIZE, buf.remaining()));
        }
        let magic = buf.get_u8();
        let version = buf.get_u8();
        if magic != Self::MAGIC || version != Self::VERSION {
            return Err(OrbError::Marshal(format!(
                "not a structured object key (magic {:02x}, version {})",
                magic, version
            )));
        }
        let server_id = get_string(&mut buf)?;
        let adapter = get_string(&mut buf)?;
        if buf.remaining() < 16 {
            return Err(underflow(16, buf.remaining()));
        }
        let mut instance = [0u8; 16];
        buf.copy_to_slice(&mut instance);

        Ok(Self {
            server_id,
            adapter,
            instance: Uuid::from_bytes(instance),
            object_id: ObjectKey(buf),
        })
    }
}

fn underflow(needed: usize, have: usize) -> OrbError {
    OrbError::Marshal(format!(
        "object key underflow: need {} bytes, have {}",
        needed, have
    ))
}

fn put_string<B: BufMut>(buf: &mut B, field: &str, value: &str) -> Result<()> {
    let len = u32::try_from(value.len()).map_err(|_| {
        OrbError::Marshal(format!("object key {} is {} bytes long", field, value.len()))
    })?;
    buf.put_u32(len);
    buf.put_slice(value.as_bytes());
    Ok(())
}

fn get_string(buf: &mut Bytes) -> Result<String> {
    if buf.remaining() < 4 {
        return Err(underflow(4, buf.remaining()));
    }
    let len = buf.get_u32() as usize;
    if buf.remaining() < len {
        return Err(underflow(len, buf.remaining()));
    }
    let raw = buf.split_to(len);
    String::from_utf8(raw.to_vec())
        .map_err(|e| OrbError::Marshal(format!("object key string: {}", e)))
}
