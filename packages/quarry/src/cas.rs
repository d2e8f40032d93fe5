//! The content-addressed store interface and shipped backends.
//!
//! The store is the only durable storage the engine knows about. Objects are
//! immutable `(refs, data)` pairs; `put` is idempotent and two equal objects
//! always receive the same id.

use async_trait::async_trait;
use tracing::instrument;

use crate::{
    error::CasError,
    id::DataId,
    varint::{read_uvarint, write_uvarint},
};

mod disk;
mod memory;

pub use disk::DiskStore;
pub use memory::MemoryStore;

/// An immutable object in the store: an ordered list of referenced ids plus
/// an opaque data buffer.
#[derive(Clone, PartialEq, Eq, Debug, Default)]
pub struct Object {
    pub refs: Vec<DataId>,
    pub data: Vec<u8>,
}

impl Object {
    pub fn new(refs: impl Into<Vec<DataId>>, data: impl Into<Vec<u8>>) -> Self {
        Self {
            refs: refs.into(),
            data: data.into(),
        }
    }

    /// An object with no references.
    pub fn leaf(data: impl Into<Vec<u8>>) -> Self {
        Self::new(Vec::new(), data)
    }

    /// Canonical byte form used both for hashing and for disk storage:
    /// `varint(refs.len) ++ (varint(id.len) ++ id)* ++ data`.
    pub fn canonical_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.data.len() + 16 * self.refs.len() + 8);
        write_uvarint(&mut out, self.refs.len() as u64);
        for id in &self.refs {
            let bytes = id.as_bytes();
            write_uvarint(&mut out, bytes.len() as u64);
            out.extend_from_slice(bytes);
        }
        out.extend_from_slice(&self.data);
        out
    }

    /// Parse the canonical byte form back into an object.
    pub fn from_canonical_bytes(bytes: &[u8]) -> Result<Self, CasError> {
        let mut cursor = bytes;
        let count = read_uvarint(&mut cursor)
            .ok_or_else(|| CasError::Permanent(String::from("truncated ref count")))?;
        let mut refs = Vec::with_capacity(count.min(1024) as usize);
        for _ in 0..count {
            let len = read_uvarint(&mut cursor)
                .ok_or_else(|| CasError::Permanent(String::from("truncated ref length")))?
                as usize;
            if cursor.len() < len {
                return Err(CasError::Permanent(String::from("truncated ref bytes")));
            }
            let (id, rest) = cursor.split_at(len);
            refs.push(
                DataId::from_raw(id).map_err(|err| CasError::Permanent(err.to_string()))?,
            );
            cursor = rest;
        }
        Ok(Self::new(refs, cursor))
    }
}

/// Compute the id `put` would assign to `(refs, data)`.
///
/// Pure function of the inputs; performs no I/O. All shipped backends
/// delegate to this so that ids are portable between them.
pub fn identify(refs: &[DataId], data: &[u8]) -> DataId {
    let mut hasher = blake3::Hasher::new();
    let mut prefix = Vec::with_capacity(16 * refs.len() + 8);
    write_uvarint(&mut prefix, refs.len() as u64);
    for id in refs {
        let bytes = id.as_bytes();
        write_uvarint(&mut prefix, bytes.len() as u64);
        prefix.extend_from_slice(bytes);
    }
    hasher.update(&prefix);
    hasher.update(data);
    DataId::from_blake3(hasher.finalize())
}

/// A content-addressed store.
///
/// Implementations must be safe for concurrent use; `put` must be
/// idempotent, and `get` returns `None` only when the object is genuinely
/// absent (transport failures are errors, not misses).
#[async_trait]
pub trait ContentStore: Send + Sync {
    /// Store an object, returning its id.
    async fn put(&self, refs: Vec<DataId>, data: Vec<u8>) -> Result<DataId, CasError>;

    /// Fetch an object by id, or `None` if absent.
    async fn get(&self, id: &DataId) -> Result<Option<Object>, CasError>;

    /// Check whether an object exists at the moment of the call.
    async fn contains(&self, id: &DataId) -> Result<bool, CasError>;

    /// Compute the id `put` would assign, without storing.
    fn identify(&self, refs: &[DataId], data: &[u8]) -> DataId {
        identify(refs, data)
    }
}

/// Convenience for callers that treat a missing object as a hard error.
#[instrument(skip(store))]
pub async fn must_get(store: &dyn ContentStore, id: &DataId) -> Result<Object, CasError> {
    store
        .get(id)
        .await?
        .ok_or_else(|| CasError::Permanent(format!("object does not exist: {id}")))
}
