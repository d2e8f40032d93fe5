//! Export of stored trees back onto the local filesystem.

use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use bon::Builder;
use futures::{StreamExt, TryStreamExt, stream};
use tokio::task::spawn_blocking;
use tracing::{debug, instrument, trace};

use crate::{
    cas::{ContentStore, must_get},
    error::TreeError,
    id::DataId,
    limits::ConcurrencyLimits,
    tree::codec::{Blob, FileKind, Parsed, parse, read_chunk},
};

/// Options controlling one export.
#[derive(Builder, Default)]
pub struct ExportOptions {
    #[builder(default)]
    pub limits: ConcurrencyLimits,
}

#[derive(Debug)]
struct Work {
    id: DataId,
    kind: FileKind,
    path: PathBuf,
}

/// Materialize the tree rooted at `root` under `dest`.
///
/// Walks breadth-first, streaming objects out of the store; directory
/// levels are written concurrently within the configured limits.
#[instrument(skip(store, options), fields(dest = %dest.display()))]
pub async fn export(
    store: &dyn ContentStore,
    root: &DataId,
    dest: &Path,
    options: &ExportOptions,
) -> Result<(), TreeError> {
    export_node(store, root, FileKind::Directory, dest, options).await
}

/// Materialize a single stored object (of any kind) at `dest`.
#[instrument(skip(store, options), fields(dest = %dest.display()))]
pub async fn export_node(
    store: &dyn ContentStore,
    root: &DataId,
    kind: FileKind,
    dest: &Path,
    options: &ExportOptions,
) -> Result<(), TreeError> {
    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|err| TreeError::io(format!("create dir {}", parent.display()), err))?;
    }
    let limits = &options.limits;
    let mut level = vec![Work {
        id: root.clone(),
        kind,
        path: dest.to_path_buf(),
    }];
    let mut objects = 0usize;
    while !level.is_empty() {
        let next: Vec<Vec<Work>> = stream::iter(
            level
                .into_iter()
                .map(|work| materialize(store, work, limits)),
        )
        .buffer_unordered(limits.ssd_width())
        .try_collect()
        .await?;
        level = next.into_iter().flatten().collect();
        objects += level.len();
    }
    debug!(objects, "exported tree");
    Ok(())
}

/// Write one object to disk, returning the children still to be written.
async fn materialize(
    store: &dyn ContentStore,
    work: Work,
    limits: &ConcurrencyLimits,
) -> Result<Vec<Work>, TreeError> {
    let object = {
        let _network = limits.acquire_network().await;
        must_get(store, &work.id).await?
    };
    match parse(&work.id, &object, work.kind)? {
        Parsed::Directory(entries) => {
            tokio::fs::create_dir_all(&work.path)
                .await
                .map_err(|err| TreeError::io(format!("create dir {}", work.path.display()), err))?;
            Ok(entries
                .into_iter()
                .map(|(entry, id)| Work {
                    id,
                    kind: entry.kind,
                    path: work.path.join(entry.name),
                })
                .collect())
        }
        Parsed::File(blob) => {
            write_file(store, &work.path, &blob, limits).await?;
            Ok(Vec::new())
        }
        Parsed::Symlink(target) => {
            write_symlink(&work.path, &target).await?;
            Ok(Vec::new())
        }
    }
}

/// Create (or truncate) the file, then write each chunk at its offset.
async fn write_file(
    store: &dyn ContentStore,
    path: &Path,
    blob: &Blob,
    limits: &ConcurrencyLimits,
) -> Result<(), TreeError> {
    // Executable bit through the creation mode, subject to the host umask.
    let mode = if blob.executable { 0o777 } else { 0o666 };
    let file = {
        let path = path.to_path_buf();
        spawn_blocking(move || {
            use std::os::unix::fs::OpenOptionsExt;
            std::fs::OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .mode(mode)
                .open(&path)
                .map_err(|err| TreeError::io(format!("create file {}", path.display()), err))
        })
        .await
        .map_err(|err| TreeError::io("join file creation", std::io::Error::other(err)))??
    };
    let file = Arc::new(file);

    match blob.chunk_refs() {
        None => {
            let data = blob.read_all(store).await?;
            positional_write(Arc::clone(&file), data, 0).await?;
        }
        Some(refs) => {
            let mut offset = 0u64;
            for id in refs {
                let data = {
                    let _network = limits.acquire_network().await;
                    read_chunk(store, id).await?
                };
                let len = data.len() as u64;
                positional_write(Arc::clone(&file), data, offset).await?;
                offset += len;
            }
            trace!(path = %path.display(), bytes = offset, "wrote chunked file");
        }
    }
    Ok(())
}

async fn positional_write(
    file: Arc<std::fs::File>,
    data: Vec<u8>,
    offset: u64,
) -> Result<(), TreeError> {
    spawn_blocking(move || {
        use std::os::unix::fs::FileExt;
        file.write_all_at(&data, offset)
            .map_err(|err| TreeError::io("write chunk", err))
    })
    .await
    .map_err(|err| TreeError::io("join chunk write", std::io::Error::other(err)))?
}

/// Create the symlink, deleting a pre-existing entry and retrying once if
/// creation races with a leftover path.
async fn write_symlink(path: &Path, target: &[u8]) -> Result<(), TreeError> {
    let target = PathBuf::from(String::from_utf8_lossy(target).into_owned());
    match tokio::fs::symlink(&target, path).await {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
            tokio::fs::remove_file(path)
                .await
                .map_err(|err| TreeError::io(format!("replace symlink {}", path.display()), err))?;
            tokio::fs::symlink(&target, path)
                .await
                .map_err(|err| TreeError::io(format!("create symlink {}", path.display()), err))
        }
        Err(err) => Err(TreeError::io(
            format!("create symlink {}", path.display()),
            err,
        )),
    }
}
