//! Pure tree operations: lookup, N-way merge, insert, remove.
//!
//! All operations are structural: they build new objects and never mutate
//! stored ones.

use std::collections::BTreeMap;

use futures::future::BoxFuture;
use tracing::{instrument, trace};

use crate::{
    cas::{ContentStore, must_get},
    error::TreeError,
    id::DataId,
    tree::codec::{Compression, DirectoryEntry, FileInfo, FileKind, Parsed, Payload, parse},
};

/// Store a directory object from its children.
///
/// Children must be strictly sorted by name with no duplicates; the
/// directory size is the saturating sum of the entry sizes.
#[instrument(skip_all, fields(children = children.len()))]
pub async fn write_directory(
    store: &dyn ContentStore,
    children: Vec<(DirectoryEntry, DataId)>,
) -> Result<DataId, TreeError> {
    for pair in children.windows(2) {
        if pair[0].0.name >= pair[1].0.name {
            return Err(TreeError::InvalidPath(format!(
                "directory entries not strictly sorted: {:?} then {:?}",
                pair[0].0.name, pair[1].0.name
            )));
        }
    }
    let size = children
        .iter()
        .fold(0u64, |total, (entry, _)| total.saturating_add(entry.size));
    let (entries, refs): (Vec<_>, Vec<_>) = children.into_iter().unzip();
    let info = FileInfo {
        kind: FileKind::Directory,
        size,
        compression: Compression::None,
        payload: Payload::InlineChildren(entries),
    };
    Ok(store.put(refs, info.encode()).await?)
}

/// Store the empty directory.
pub async fn empty_directory(store: &dyn ContentStore) -> Result<DataId, TreeError> {
    write_directory(store, Vec::new()).await
}

/// Compute the logical (uncompressed, aggregate) size of a stored object.
pub async fn describe_size(
    store: &dyn ContentStore,
    id: &DataId,
    kind: FileKind,
) -> Result<u64, TreeError> {
    let object = must_get(store, id).await?;
    Ok(match parse(id, &object, kind)? {
        Parsed::File(blob) => blob.size,
        Parsed::Symlink(target) => target.len() as u64,
        Parsed::Directory(entries) => entries
            .iter()
            .fold(0u64, |total, (entry, _)| total.saturating_add(entry.size)),
    })
}

fn split_path(path: &str) -> Vec<&str> {
    path.split('/').filter(|component| !component.is_empty()).collect()
}

async fn load_directory(
    store: &dyn ContentStore,
    id: &DataId,
) -> Result<Vec<(DirectoryEntry, DataId)>, TreeError> {
    let object = must_get(store, id).await?;
    match parse(id, &object, FileKind::Directory)? {
        Parsed::Directory(entries) => Ok(entries),
        _ => Err(TreeError::Format {
            id: id.clone(),
            reason: String::from("expected a directory object"),
        }),
    }
}

/// Resolve a `/`-separated path inside a tree.
///
/// `"/"` (or the empty path) resolves to the root directory itself. Returns
/// the entry and child id, or `None` when any component is absent.
#[instrument(skip(store))]
pub async fn lookup(
    store: &dyn ContentStore,
    root: &DataId,
    path: &str,
) -> Result<Option<(DirectoryEntry, DataId)>, TreeError> {
    let components = split_path(path);
    if components.is_empty() {
        let size = describe_size(store, root, FileKind::Directory).await?;
        return Ok(Some((
            DirectoryEntry {
                name: String::from("/"),
                kind: FileKind::Directory,
                size,
            },
            root.clone(),
        )));
    }

    let mut current = root.clone();
    for (depth, component) in components.iter().enumerate() {
        let entries = load_directory(store, &current).await?;
        let Ok(index) = entries.binary_search_by(|(entry, _)| entry.name.as_str().cmp(component))
        else {
            return Ok(None);
        };
        let (entry, child) = entries[index].clone();
        if depth + 1 == components.len() {
            return Ok(Some((entry, child)));
        }
        if entry.kind != FileKind::Directory {
            return Ok(None);
        }
        current = child;
    }
    unreachable!("loop returns on the final component");
}

/// Merge `roots` (all directory trees) with last-wins semantics.
///
/// For any name, the latest tree containing it wins, unless two or more of
/// the colliding children are directories, in which case those directories
/// merge recursively (shadowing any non-directory colliders).
#[instrument(skip(store), fields(roots = roots.len()))]
pub async fn merge(store: &dyn ContentStore, roots: &[DataId]) -> Result<DataId, TreeError> {
    match roots {
        [] => empty_directory(store).await,
        [single] => Ok(single.clone()),
        _ => merge_inner(store, roots.to_vec()).await.map(|(id, _)| id),
    }
}

fn merge_inner<'a>(
    store: &'a dyn ContentStore,
    roots: Vec<DataId>,
) -> BoxFuture<'a, Result<(DataId, u64), TreeError>> {
    Box::pin(async move {
        // Rows of identically-named children, names kept sorted; candidates
        // stay in original (priority-ascending) tree order.
        let mut rows: BTreeMap<String, Vec<(DirectoryEntry, DataId)>> = BTreeMap::new();
        for root in &roots {
            for (entry, child) in load_directory(store, root).await? {
                rows.entry(entry.name.clone())
                    .or_default()
                    .push((entry, child));
            }
        }

        let mut children = Vec::with_capacity(rows.len());
        for (name, row) in rows {
            let (last, _) = row.last().expect("rows are never empty");
            let merged = if last.kind == FileKind::Directory {
                // Deduplicate colliding directories by id, then merge the
                // survivors; a single survivor passes through untouched.
                let mut directories: Vec<DataId> = Vec::new();
                for (entry, child) in &row {
                    if entry.kind == FileKind::Directory && !directories.contains(child) {
                        directories.push(child.clone());
                    }
                }
                if directories.len() >= 2 {
                    let (id, size) = merge_inner(store, directories).await?;
                    (
                        DirectoryEntry {
                            name,
                            kind: FileKind::Directory,
                            size,
                        },
                        id,
                    )
                } else {
                    let (entry, child) = row.last().cloned().expect("row non-empty");
                    (DirectoryEntry { name, ..entry }, child)
                }
            } else {
                let (entry, child) = row.last().cloned().expect("row non-empty");
                (DirectoryEntry { name, ..entry }, child)
            };
            children.push(merged);
        }

        let size = children
            .iter()
            .fold(0u64, |total, (entry, _)| total.saturating_add(entry.size));
        let id = write_directory(store, children).await?;
        trace!(%id, size, "merged directory level");
        Ok((id, size))
    })
}

/// Insert `leaf` at `path`, replacing anything already there.
///
/// The leaf is wrapped in a chain of singleton directories from the
/// innermost component outward, and the wrapper is merged over the tree.
#[instrument(skip(store))]
pub async fn insert(
    store: &dyn ContentStore,
    root: &DataId,
    path: &str,
    leaf: &DataId,
    kind: FileKind,
) -> Result<DataId, TreeError> {
    let components = split_path(path);
    let Some((last, ancestors)) = components.split_last() else {
        if kind != FileKind::Directory {
            return Err(TreeError::InvalidPath(String::from(
                "cannot insert a non-directory at the tree root",
            )));
        }
        return merge(store, &[root.clone(), leaf.clone()]).await;
    };

    let size = describe_size(store, leaf, kind).await?;
    let mut wrapped = write_directory(
        store,
        vec![(
            DirectoryEntry {
                name: (*last).to_string(),
                kind,
                size,
            },
            leaf.clone(),
        )],
    )
    .await?;
    for component in ancestors.iter().rev() {
        let size = describe_size(store, &wrapped, FileKind::Directory).await?;
        wrapped = write_directory(
            store,
            vec![(
                DirectoryEntry {
                    name: (*component).to_string(),
                    kind: FileKind::Directory,
                    size,
                },
                wrapped.clone(),
            )],
        )
        .await?;
    }
    merge(store, &[root.clone(), wrapped]).await
}

/// Remove the entry at `path`, rebuilding the spine above it.
///
/// If any intermediate component is absent the original tree is returned
/// unchanged.
#[instrument(skip(store))]
pub async fn remove(
    store: &dyn ContentStore,
    root: &DataId,
    path: &str,
) -> Result<DataId, TreeError> {
    let components = split_path(path);
    if components.is_empty() {
        return Ok(root.clone());
    }
    remove_inner(store, root.clone(), components).await
}

fn remove_inner<'a>(
    store: &'a dyn ContentStore,
    root: DataId,
    components: Vec<&'a str>,
) -> BoxFuture<'a, Result<DataId, TreeError>> {
    Box::pin(async move {
        let entries = load_directory(store, &root).await?;
        let (first, rest) = components.split_first().expect("components non-empty");
        let Ok(index) = entries.binary_search_by(|(entry, _)| entry.name.as_str().cmp(first))
        else {
            return Ok(root);
        };

        let mut children = entries;
        if rest.is_empty() {
            children.remove(index);
        } else {
            let (entry, child) = children[index].clone();
            if entry.kind != FileKind::Directory {
                return Ok(root);
            }
            let replacement = remove_inner(store, child.clone(), rest.to_vec()).await?;
            if replacement == child {
                return Ok(root);
            }
            let size = describe_size(store, &replacement, FileKind::Directory).await?;
            children[index] = (DirectoryEntry { size, ..entry }, replacement);
        }
        write_directory(store, children).await
    })
}
