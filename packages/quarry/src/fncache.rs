//! The function cache: fingerprint to value id.
//!
//! Both operations are idempotent, and a miss (including an I/O error
//! during a read) is never fatal. Because values are content-addressed,
//! concurrent writers of the same fingerprint produce the same id, so write
//! races are observationally invisible.

use std::path::PathBuf;

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::{instrument, trace, warn};

use crate::id::DataId;

/// Map from key fingerprints to the ids of their computed values.
#[async_trait]
pub trait FunctionCache: Send + Sync {
    /// Look up the value id for a fingerprint; `None` on a miss.
    async fn get(&self, fingerprint: &DataId) -> Option<DataId>;

    /// Record the value id for a fingerprint. Last writer wins.
    async fn update(&self, fingerprint: &DataId, value: DataId);
}

/// In-memory cache backend.
#[derive(Debug, Default)]
pub struct MemoryFunctionCache {
    entries: DashMap<DataId, DataId>,
}

impl MemoryFunctionCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl FunctionCache for MemoryFunctionCache {
    async fn get(&self, fingerprint: &DataId) -> Option<DataId> {
        self.entries.get(fingerprint).map(|entry| entry.value().clone())
    }

    async fn update(&self, fingerprint: &DataId, value: DataId) {
        self.entries.insert(fingerprint.clone(), value);
    }
}

/// File-backed cache backend: one file per fingerprint holding the raw
/// bytes of the value id, at `<root>/<version>/<hex(fingerprint)>`.
#[derive(Debug, Clone)]
pub struct DiskFunctionCache {
    root: PathBuf,
    version: u32,
}

impl DiskFunctionCache {
    pub fn new(root: impl Into<PathBuf>, version: u32) -> Self {
        Self {
            root: root.into(),
            version,
        }
    }

    fn entry_path(&self, fingerprint: &DataId) -> PathBuf {
        self.root
            .join(self.version.to_string())
            .join(fingerprint.to_hex())
    }
}

#[async_trait]
impl FunctionCache for DiskFunctionCache {
    #[instrument(name = "DiskFunctionCache::get", skip(self))]
    async fn get(&self, fingerprint: &DataId) -> Option<DataId> {
        let path = self.entry_path(fingerprint);
        match tokio::fs::read(&path).await {
            Ok(bytes) => match DataId::from_raw(bytes) {
                Ok(id) => Some(id),
                Err(err) => {
                    warn!(%err, path = %path.display(), "corrupt cache entry; treating as miss");
                    None
                }
            },
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => None,
            Err(err) => {
                warn!(%err, path = %path.display(), "cache read failed; treating as miss");
                None
            }
        }
    }

    #[instrument(name = "DiskFunctionCache::update", skip(self))]
    async fn update(&self, fingerprint: &DataId, value: DataId) {
        let path = self.entry_path(fingerprint);
        let parent = path.parent().expect("entry path always has a parent");
        if let Err(err) = tokio::fs::create_dir_all(parent).await {
            warn!(%err, "could not create cache directory; dropping update");
            return;
        }
        // Write-then-rename keeps racing writers from interleaving; either
        // winner leaves the same content-addressed id behind.
        let tmp = parent.join(format!(
            ".{}.tmp.{}",
            fingerprint.to_hex(),
            uuid::Uuid::new_v4().simple()
        ));
        let result = async {
            tokio::fs::write(&tmp, value.as_bytes()).await?;
            tokio::fs::rename(&tmp, &path).await
        }
        .await;
        match result {
            Ok(()) => trace!(%fingerprint, %value, "recorded cache entry"),
            Err(err) => warn!(%err, "cache write failed; dropping update"),
        }
    }
}
