//! In-memory content store.

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::{instrument, trace};

use crate::{
    cas::{ContentStore, Object, identify},
    error::CasError,
    id::DataId,
};

/// A store held entirely in process memory.
///
/// Useful for tests and for engines whose whole lifetime fits in one
/// process. Never returns transient errors.
#[derive(Debug, Default)]
pub struct MemoryStore {
    objects: DashMap<DataId, Object>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored objects.
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }
}

#[async_trait]
impl ContentStore for MemoryStore {
    #[instrument(name = "MemoryStore::put", skip_all)]
    async fn put(&self, refs: Vec<DataId>, data: Vec<u8>) -> Result<DataId, CasError> {
        let id = identify(&refs, &data);
        self.objects
            .entry(id.clone())
            .or_insert_with(|| Object::new(refs, data));
        trace!(%id, "stored object");
        Ok(id)
    }

    #[instrument(name = "MemoryStore::get", skip(self))]
    async fn get(&self, id: &DataId) -> Result<Option<Object>, CasError> {
        Ok(self.objects.get(id).map(|entry| entry.value().clone()))
    }

    #[instrument(name = "MemoryStore::contains", skip(self))]
    async fn contains(&self, id: &DataId) -> Result<bool, CasError> {
        Ok(self.objects.contains_key(id))
    }
}
