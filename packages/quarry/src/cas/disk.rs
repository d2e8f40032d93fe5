//! Filesystem-backed content store.

use std::path::PathBuf;

use async_trait::async_trait;
use tracing::{instrument, trace};

use crate::{
    cas::{ContentStore, Object, identify},
    error::CasError,
    id::DataId,
};

/// A store rooted at a local directory.
///
/// Objects live in a two-level fan-out by the first four hex characters of
/// their id: `<root>/<hex[0..2]>/<hex[2..4]>/<hex>`. Each file holds the
/// object's canonical byte form. Writes go to a temporary sibling and are
/// renamed into place, so concurrent `put`s of the same object are safe.
#[derive(Debug, Clone)]
pub struct DiskStore {
    root: PathBuf,
}

impl DiskStore {
    /// Open a store rooted at `root`, creating the directory if needed.
    #[instrument(name = "DiskStore::open")]
    pub async fn open(root: impl Into<PathBuf> + std::fmt::Debug) -> Result<Self, CasError> {
        let root = root.into();
        tokio::fs::create_dir_all(&root)
            .await
            .map_err(CasError::from_io)?;
        Ok(Self { root })
    }

    /// The root directory of the store.
    pub fn root(&self) -> &std::path::Path {
        &self.root
    }

    fn object_path(&self, id: &DataId) -> PathBuf {
        let hex = id.to_hex();
        self.root.join(&hex[0..2]).join(&hex[2..4]).join(hex)
    }
}

#[async_trait]
impl ContentStore for DiskStore {
    #[instrument(name = "DiskStore::put", skip_all)]
    async fn put(&self, refs: Vec<DataId>, data: Vec<u8>) -> Result<DataId, CasError> {
        let id = identify(&refs, &data);
        let path = self.object_path(&id);
        if tokio::fs::try_exists(&path)
            .await
            .map_err(CasError::from_io)?
        {
            trace!(%id, "object already stored");
            return Ok(id);
        }

        let parent = path.parent().expect("object path always has a parent");
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(CasError::from_io)?;

        // Unique temp name per writer; the final rename makes the last
        // writer win with identical bytes.
        let tmp = parent.join(format!(
            ".{}.tmp.{}",
            id.to_hex(),
            uuid::Uuid::new_v4().simple()
        ));
        let bytes = Object::new(refs, data).canonical_bytes();
        tokio::fs::write(&tmp, &bytes)
            .await
            .map_err(CasError::from_io)?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(CasError::from_io)?;
        trace!(%id, bytes = bytes.len(), "stored object");
        Ok(id)
    }

    #[instrument(name = "DiskStore::get", skip(self))]
    async fn get(&self, id: &DataId) -> Result<Option<Object>, CasError> {
        let path = self.object_path(id);
        match tokio::fs::read(&path).await {
            Ok(bytes) => Object::from_canonical_bytes(&bytes).map(Some),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(CasError::from_io(err)),
        }
    }

    #[instrument(name = "DiskStore::contains", skip(self))]
    async fn contains(&self, id: &DataId) -> Result<bool, CasError> {
        tokio::fs::try_exists(self.object_path(id))
            .await
            .map_err(CasError::from_io)
    }
}
