//! Stable identifiers for content-addressed objects.

use derive_more::Display;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use tracing::{instrument, trace};

use crate::error::IdError;

/// Mode tag for a [`DataId`] constructed from literal bytes.
const TAG_DIRECT: u8 = 0;

/// Mode tag for a [`DataId`] derived from a blake3 content hash.
const TAG_BLAKE3: u8 = 1;

/// Identifiers longer than this are rejected.
///
/// Ids are stored inline in directory objects and fingerprint tables,
/// so they must stay small.
pub const MAX_ID_LEN: usize = 64;

/// The identifier of an immutable object in the content-addressed store.
///
/// Two ids compare equal iff their bytes are equal. The first byte is a mode
/// tag distinguishing ids minted from literal bytes from ids derived by
/// hashing object content; the tag participates in equality like any other
/// byte.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Display)]
#[display("{}", self.to_hex())]
pub struct DataId(Vec<u8>);

impl DataId {
    /// Construct an id from literal bytes.
    ///
    /// The caller owns uniqueness: two directs with equal bytes are the
    /// same id.
    pub fn direct(bytes: impl AsRef<[u8]>) -> Result<Self, IdError> {
        let bytes = bytes.as_ref();
        if bytes.len() + 1 > MAX_ID_LEN {
            return Err(IdError::TooLong(bytes.len() + 1));
        }
        let mut inner = Vec::with_capacity(bytes.len() + 1);
        inner.push(TAG_DIRECT);
        inner.extend_from_slice(bytes);
        Ok(Self(inner))
    }

    /// Construct an id from a blake3 hash of object content.
    pub fn from_blake3(hash: blake3::Hash) -> Self {
        let mut inner = Vec::with_capacity(33);
        inner.push(TAG_BLAKE3);
        inner.extend_from_slice(hash.as_bytes());
        Self(inner)
    }

    /// Hash a buffer and construct the id of its content.
    pub fn from_buffer(buffer: impl AsRef<[u8]>) -> Self {
        Self::from_blake3(blake3::hash(buffer.as_ref()))
    }

    /// View the id as raw bytes, including the mode tag.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// View the id as a hex string.
    pub fn to_hex(&self) -> String {
        hex::encode(&self.0)
    }

    /// Attempt to parse an id from a hex string.
    #[instrument(fields(hex = hex.as_ref()))]
    pub fn from_hex(hex: impl AsRef<str>) -> Result<Self, IdError> {
        let bytes = hex::decode(hex.as_ref()).map_err(|_| IdError::InvalidHex)?;
        trace!(len = bytes.len(), "decoded hex id");
        Self::from_raw(bytes)
    }

    /// Reconstruct an id from raw bytes previously produced by
    /// [`DataId::as_bytes`].
    pub fn from_raw(bytes: impl Into<Vec<u8>>) -> Result<Self, IdError> {
        let bytes = bytes.into();
        if bytes.is_empty() {
            return Err(IdError::Empty);
        }
        if bytes.len() > MAX_ID_LEN {
            return Err(IdError::TooLong(bytes.len()));
        }
        if bytes[0] != TAG_DIRECT && bytes[0] != TAG_BLAKE3 {
            return Err(IdError::UnknownTag(bytes[0]));
        }
        Ok(Self(bytes))
    }
}

impl std::fmt::Debug for DataId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "DataId({})", self.to_hex())
    }
}

impl From<&DataId> for DataId {
    fn from(id: &DataId) -> Self {
        id.clone()
    }
}

impl Serialize for DataId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for DataId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let hex = String::deserialize(deserializer)?;
        Self::from_hex(&hex).map_err(serde::de::Error::custom)
    }
}
