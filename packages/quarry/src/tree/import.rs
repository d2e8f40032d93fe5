//! Import of local filesystem trees into the store.
//!
//! The importer runs in observable phases tracked by an atomic cell: paths
//! are assembled by a scanner thread, chunk ids are predicted without
//! keeping bytes, already-present segments are skipped, absent segments are
//! re-read and uploaded, and finally file and directory objects are built
//! depth-first from the leaves.

use std::{
    collections::{HashMap, HashSet},
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicU8, AtomicU64, Ordering},
    },
    time::{Duration, SystemTime},
};

use bon::Builder;
use futures::{StreamExt, TryStreamExt, stream};
use strum::Display;
use tokio::task::spawn_blocking;
use tracing::{debug, instrument, trace, warn};
use walkdir::WalkDir;

use crate::{
    cas::{ContentStore, identify},
    error::TreeError,
    id::DataId,
    limits::{ConcurrencyLimits, NETWORK_FLOOR},
    tree::codec::{
        Compression, DEFAULT_CHUNK_SIZE, DirectoryEntry, FileInfo, FileKind, Payload,
        should_compress,
    },
    tree::ops::write_directory,
};

/// Backoff before retrying an import after a transient store failure.
const TRANSIENT_BACKOFF: Duration = Duration::from_secs(3);

/// Requested wire format for file chunks.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Default, Display)]
#[strum(serialize_all = "lowercase")]
pub enum WireFormat {
    /// Store chunk bytes as read.
    #[default]
    Raw,
    /// Compress eligible chunks with zstd.
    Compressed,
}

/// Predicate over paths relative to the import root; `"/"` is the root.
pub type PathFilter = Arc<dyn Fn(&str) -> bool + Send + Sync>;

/// Options controlling one import.
#[derive(Builder)]
pub struct ImportOptions {
    /// Files larger than this are split into fixed-size chunks.
    #[builder(default = DEFAULT_CHUNK_SIZE)]
    pub chunk_size: u64,

    #[builder(default)]
    pub wire_format: WireFormat,

    /// Skip (rather than fail on) files that change mid-import.
    #[builder(default)]
    pub relax_consistency_checks: bool,

    /// Skip (rather than fail on) unreadable entries.
    #[builder(default)]
    pub skip_unreadable: bool,

    /// Optional filter on paths relative to the import root.
    pub filter: Option<PathFilter>,

    #[builder(default)]
    pub limits: ConcurrencyLimits,
}

impl Default for ImportOptions {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// Observable phases of an import, in execution order.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Display)]
#[repr(u8)]
pub enum ImportPhase {
    Idle = 0,
    AssemblingPaths,
    EstimatingSize,
    CheckIfUploaded,
    UploadingFiles,
    UploadingWait,
    UploadingDirs,
    ImportSucceeded,
    ImportFailed,
}

impl ImportPhase {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::AssemblingPaths,
            2 => Self::EstimatingSize,
            3 => Self::CheckIfUploaded,
            4 => Self::UploadingFiles,
            5 => Self::UploadingWait,
            6 => Self::UploadingDirs,
            7 => Self::ImportSucceeded,
            8 => Self::ImportFailed,
            _ => Self::Idle,
        }
    }
}

/// Shared progress handle for observers.
#[derive(Debug, Default)]
pub struct ImportProgress {
    phase: AtomicU8,
    files_uploaded: AtomicU64,
    bytes_uploaded: AtomicU64,
}

impl ImportProgress {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn phase(&self) -> ImportPhase {
        ImportPhase::from_u8(self.phase.load(Ordering::Acquire))
    }

    pub fn files_uploaded(&self) -> u64 {
        self.files_uploaded.load(Ordering::Relaxed)
    }

    pub fn bytes_uploaded(&self) -> u64 {
        self.bytes_uploaded.load(Ordering::Relaxed)
    }

    fn set_phase(&self, phase: ImportPhase) {
        trace!(%phase, "import phase");
        self.phase.store(phase as u8, Ordering::Release);
    }

    fn add_upload(&self, bytes: u64) {
        self.files_uploaded.fetch_add(1, Ordering::Relaxed);
        self.bytes_uploaded.fetch_add(bytes, Ordering::Relaxed);
    }
}

/// Import the tree rooted at `root` into the store, returning the id of the
/// resulting directory object.
///
/// On a transient store failure the whole import restarts after a short
/// backoff with the network queue divided by 5 (floor 10).
#[instrument(skip(store, options, progress), fields(root = %root.display()))]
pub async fn import(
    store: &dyn ContentStore,
    root: &Path,
    options: &ImportOptions,
    progress: Arc<ImportProgress>,
) -> Result<DataId, TreeError> {
    let mut limits = options.limits.clone();
    loop {
        match import_once(store, root, options, &limits, &progress).await {
            Ok(id) => {
                progress.set_phase(ImportPhase::ImportSucceeded);
                return Ok(id);
            }
            Err(TreeError::Cas(err)) if err.is_transient() => {
                let narrowed = (limits.network_width() / 5).max(NETWORK_FLOOR);
                warn!(
                    %err,
                    network = narrowed,
                    "transient store failure; restarting import with reduced concurrency"
                );
                tokio::time::sleep(TRANSIENT_BACKOFF).await;
                limits = limits.with_network_width(narrowed);
            }
            Err(err) => {
                progress.set_phase(ImportPhase::ImportFailed);
                return Err(err);
            }
        }
    }
}

#[derive(Debug)]
enum ScanKind {
    File {
        size: u64,
        mtime: Option<SystemTime>,
        executable: bool,
    },
    Directory,
    Symlink {
        target: PathBuf,
    },
}

#[derive(Debug)]
struct ScanEntry {
    rel: String,
    kind: ScanKind,
}

/// One chunk the file would become, identified without keeping bytes.
#[derive(Clone, Debug)]
struct Segment {
    compressed: bool,
    uncompressed_len: u64,
    /// Id the (possibly compressed) chunk bytes will receive.
    blob_id: DataId,
    /// Id of the zstd wrapper object, for compressed chunks.
    wrapper_id: Option<DataId>,
    /// Filled by the contains pre-pass.
    present: bool,
}

impl Segment {
    /// The id the outer file object will reference for this chunk.
    fn chunk_ref(&self) -> &DataId {
        self.wrapper_id.as_ref().unwrap_or(&self.blob_id)
    }
}

#[derive(Debug)]
struct FilePlan {
    rel: String,
    abs: PathBuf,
    size: u64,
    mtime: Option<SystemTime>,
    executable: bool,
    segments: Vec<Segment>,
    /// Set when a relaxed consistency check dropped the file.
    skipped: bool,
}

async fn import_once(
    store: &dyn ContentStore,
    root: &Path,
    options: &ImportOptions,
    limits: &ConcurrencyLimits,
    progress: &ImportProgress,
) -> Result<DataId, TreeError> {
    progress.set_phase(ImportPhase::AssemblingPaths);
    let entries = scan(root, options).await?;

    let mut directories: Vec<String> = Vec::new();
    let mut symlinks: Vec<(String, PathBuf)> = Vec::new();
    let mut plans: Vec<FilePlan> = Vec::new();
    for entry in entries {
        match entry.kind {
            ScanKind::Directory => directories.push(entry.rel),
            ScanKind::Symlink { target } => symlinks.push((entry.rel, target)),
            ScanKind::File {
                size,
                mtime,
                executable,
            } => {
                let abs = join_rel(root, &entry.rel);
                plans.push(FilePlan {
                    rel: entry.rel,
                    abs,
                    size,
                    mtime,
                    executable,
                    segments: Vec::new(),
                    skipped: false,
                });
            }
        }
    }

    progress.set_phase(ImportPhase::EstimatingSize);
    let mut plans = stream::iter(plans.into_iter().map(|plan| estimate(plan, options, limits)))
        .buffer_unordered(limits.ssd_width())
        .try_collect::<Vec<_>>()
        .await?;

    progress.set_phase(ImportPhase::CheckIfUploaded);
    for plan in &mut plans {
        let checks = stream::iter(plan.segments.iter().map(|segment| async move {
            let _permit = limits.acquire_network().await;
            store.contains(segment.chunk_ref()).await
        }))
        .buffered(limits.network_width())
        .try_collect::<Vec<_>>()
        .await?;
        for (segment, present) in plan.segments.iter_mut().zip(checks) {
            segment.present = present;
        }
    }

    progress.set_phase(ImportPhase::UploadingFiles);
    let plans = stream::iter(
        plans
            .into_iter()
            .map(|plan| upload_file(store, plan, options, limits, progress)),
    )
    .buffer_unordered(limits.ssd_width())
    .try_collect::<Vec<_>>()
    .await?;

    progress.set_phase(ImportPhase::UploadingWait);
    let files = stream::iter(
        plans
            .into_iter()
            .filter(|plan| !plan.skipped)
            .map(|plan| finish_file(store, plan, options, limits)),
    )
    .buffer_unordered(limits.network_width())
    .try_collect::<Vec<_>>()
    .await?;

    // Symlink targets are tiny; store them inline with the dirs phase.
    let mut symlink_ids: Vec<(String, DataId, u64)> = Vec::with_capacity(symlinks.len());
    for (rel, target) in symlinks {
        let bytes = target.to_string_lossy().into_owned().into_bytes();
        let _permit = limits.acquire_network().await;
        let id = store.put(Vec::new(), bytes.clone()).await?;
        symlink_ids.push((rel, id, bytes.len() as u64));
    }

    progress.set_phase(ImportPhase::UploadingDirs);
    build_directories(store, limits, directories, files, symlink_ids).await
}

fn join_rel(root: &Path, rel: &str) -> PathBuf {
    let mut path = root.to_path_buf();
    for component in rel.split('/').filter(|c| !c.is_empty()) {
        path.push(component);
    }
    path
}

async fn scan(root: &Path, options: &ImportOptions) -> Result<Vec<ScanEntry>, TreeError> {
    let root = root.to_path_buf();
    let filter = options.filter.clone();
    let skip_unreadable = options.skip_unreadable;
    spawn_blocking(move || {
        let mut entries = Vec::new();
        let walk = WalkDir::new(&root).follow_links(false).into_iter();
        let filter_root = root.clone();
        let filter = filter.clone();
        let mut walk = walk.filter_entry(move |entry| match &filter {
            None => true,
            Some(predicate) => match rel_of(&filter_root, entry.path()) {
                Some(rel) => predicate(&format!("/{rel}")),
                None => true,
            },
        });
        while let Some(entry) = walk.next() {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) if skip_unreadable => {
                    warn!(%err, "skipping unreadable entry");
                    continue;
                }
                Err(err) => {
                    let path = err.path().unwrap_or(&root).to_path_buf();
                    let source = err
                        .into_io_error()
                        .unwrap_or_else(|| std::io::Error::other("walk error"));
                    return Err(TreeError::Unreadable { path, source });
                }
            };
            if entry.path() == root {
                continue;
            }
            let Some(rel) = rel_of(&root, entry.path()) else {
                if skip_unreadable {
                    warn!(path = %entry.path().display(), "skipping non-utf8 path");
                    continue;
                }
                return Err(TreeError::Unreadable {
                    path: entry.path().to_path_buf(),
                    source: std::io::Error::other("path is not utf8"),
                });
            };

            let file_type = entry.file_type();
            let kind = if file_type.is_dir() {
                ScanKind::Directory
            } else if file_type.is_symlink() {
                match std::fs::read_link(entry.path()) {
                    Ok(target) => ScanKind::Symlink { target },
                    Err(err) if skip_unreadable => {
                        warn!(%err, path = %entry.path().display(), "skipping unreadable symlink");
                        continue;
                    }
                    Err(source) => {
                        return Err(TreeError::Unreadable {
                            path: entry.path().to_path_buf(),
                            source,
                        });
                    }
                }
            } else {
                let metadata = match entry.metadata() {
                    Ok(metadata) => metadata,
                    Err(err) if skip_unreadable => {
                        warn!(%err, path = %entry.path().display(), "skipping unreadable file");
                        continue;
                    }
                    Err(err) => {
                        return Err(TreeError::Unreadable {
                            path: entry.path().to_path_buf(),
                            source: err
                                .into_io_error()
                                .unwrap_or_else(|| std::io::Error::other("metadata error")),
                        });
                    }
                };
                ScanKind::File {
                    size: metadata.len(),
                    mtime: metadata.modified().ok(),
                    executable: is_executable(&metadata),
                }
            };
            entries.push(ScanEntry { rel, kind });
        }
        debug!(entries = entries.len(), "assembled paths");
        Ok(entries)
    })
    .await
    .map_err(|err| TreeError::io("join scanner thread", std::io::Error::other(err)))?
}

fn rel_of(root: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).ok()?;
    let mut out = String::new();
    for component in rel.components() {
        if !out.is_empty() {
            out.push('/');
        }
        out.push_str(component.as_os_str().to_str()?);
    }
    Some(out)
}

#[cfg(unix)]
fn is_executable(metadata: &std::fs::Metadata) -> bool {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & 0o111 != 0
}

/// The zstd wrapper object a compressed chunk is stored behind.
fn wrapper_info(uncompressed_len: u64) -> FileInfo {
    FileInfo {
        kind: FileKind::PlainFile,
        size: uncompressed_len,
        compression: Compression::Zstd,
        payload: Payload::FixedChunkSize(uncompressed_len),
    }
}

/// Produce a segment descriptor for one chunk, compressing if the policy
/// allows and the compressor wins.
fn identify_segment(chunk: &[u8], try_compress: bool) -> Segment {
    let uncompressed_len = chunk.len() as u64;
    if try_compress {
        // A compressor error just falls back to the raw encoding.
        if let Ok(compressed) = zstd::bulk::compress(chunk, 0) {
            if compressed.len() < chunk.len() {
                let blob_id = identify(&[], &compressed);
                let wrapper = wrapper_info(uncompressed_len);
                let wrapper_id = identify(std::slice::from_ref(&blob_id), &wrapper.encode());
                return Segment {
                    compressed: true,
                    uncompressed_len,
                    blob_id,
                    wrapper_id: Some(wrapper_id),
                    present: false,
                };
            }
        }
    }
    Segment {
        compressed: false,
        uncompressed_len,
        blob_id: identify(&[], chunk),
        wrapper_id: None,
        present: false,
    }
}

async fn estimate(
    mut plan: FilePlan,
    options: &ImportOptions,
    limits: &ConcurrencyLimits,
) -> Result<FilePlan, TreeError> {
    let _ssd = limits.acquire_ssd().await;
    let chunk_size = options.chunk_size.max(1) as usize;
    let compress_file = should_compress(
        file_name(&plan.rel),
        plan.size,
        options.wire_format == WireFormat::Compressed,
    );

    let path = plan.abs.clone();
    let chunks = spawn_blocking(move || read_chunks(&path, chunk_size))
        .await
        .map_err(|err| TreeError::io("join reader", std::io::Error::other(err)))??;

    let mut allow_compression = compress_file;
    for chunk in &chunks {
        let segment = if allow_compression {
            let _cpu = limits.acquire_cpu().await;
            identify_segment(chunk, true)
        } else {
            identify_segment(chunk, false)
        };
        // Once one chunk of a file stays raw, the rest stay raw too, so a
        // reader never sees mixed encodings produced by borderline chunks.
        if !segment.compressed {
            allow_compression = false;
        }
        plan.segments.push(segment);
    }
    trace!(rel = plan.rel, segments = plan.segments.len(), "estimated file");
    Ok(plan)
}

fn file_name(rel: &str) -> &str {
    rel.rsplit('/').next().unwrap_or(rel)
}

fn read_chunks(path: &Path, chunk_size: usize) -> Result<Vec<Vec<u8>>, TreeError> {
    use std::io::Read;
    let file = std::fs::File::open(path)
        .map_err(|err| TreeError::io(format!("open {}", path.display()), err))?;
    let mut reader = std::io::BufReader::new(file);
    let mut chunks = Vec::new();
    loop {
        let mut chunk = vec![0u8; chunk_size];
        let mut filled = 0;
        while filled < chunk_size {
            let read = reader
                .read(&mut chunk[filled..])
                .map_err(|err| TreeError::io(format!("read {}", path.display()), err))?;
            if read == 0 {
                break;
            }
            filled += read;
        }
        if filled == 0 {
            break;
        }
        chunk.truncate(filled);
        chunks.push(chunk);
    }
    if chunks.is_empty() {
        chunks.push(Vec::new());
    }
    Ok(chunks)
}

/// Re-read a file and upload its absent segments.
async fn upload_file(
    store: &dyn ContentStore,
    mut plan: FilePlan,
    options: &ImportOptions,
    limits: &ConcurrencyLimits,
    progress: &ImportProgress,
) -> Result<FilePlan, TreeError> {
    if plan.segments.iter().all(|segment| segment.present) {
        return Ok(plan);
    }

    let _ssd = limits.acquire_ssd().await;

    // The consistency check: the source must still look like it did when
    // we predicted the chunk ids.
    let metadata = tokio::fs::metadata(&plan.abs)
        .await
        .map_err(|err| TreeError::io(format!("stat {}", plan.abs.display()), err))?;
    let modified = metadata.len() != plan.size || metadata.modified().ok() != plan.mtime;
    if modified {
        if options.relax_consistency_checks {
            warn!(rel = plan.rel, "source file changed during import; skipping");
            plan.skipped = true;
            return Ok(plan);
        }
        return Err(TreeError::ModifiedFile {
            path: plan.abs.clone(),
            reason: String::from("size or mtime changed between estimate and upload"),
        });
    }

    let path = plan.abs.clone();
    let chunk_size = options.chunk_size.max(1) as usize;
    let chunks = spawn_blocking(move || read_chunks(&path, chunk_size))
        .await
        .map_err(|err| TreeError::io("join reader", std::io::Error::other(err)))??;
    if chunks.len() != plan.segments.len() {
        return Err(TreeError::ModifiedFile {
            path: plan.abs.clone(),
            reason: String::from("chunk count changed between estimate and upload"),
        });
    }

    let mut uploaded = 0u64;
    for (segment, chunk) in plan.segments.iter().zip(chunks) {
        if segment.present {
            continue;
        }
        let bytes = if segment.compressed {
            let _cpu = limits.acquire_cpu().await;
            zstd::bulk::compress(&chunk, 0)
                .map_err(|err| TreeError::io("compress chunk", err))?
        } else {
            chunk
        };
        if identify(&[], &bytes) != segment.blob_id {
            return Err(TreeError::ModifiedFile {
                path: plan.abs.clone(),
                reason: String::from("content changed between estimate and upload"),
            });
        }

        let _bytes_permit = limits.acquire_upload_bytes(bytes.len() as u64).await;
        let _network = limits.acquire_network().await;
        uploaded += bytes.len() as u64;
        let blob_id = store.put(Vec::new(), bytes).await?;
        if segment.compressed {
            let wrapper = wrapper_info(segment.uncompressed_len);
            store.put(vec![blob_id], wrapper.encode()).await?;
        }
    }
    progress.add_upload(uploaded);
    Ok(plan)
}

/// Combine a file's chunk ids into its final object.
async fn finish_file(
    store: &dyn ContentStore,
    plan: FilePlan,
    options: &ImportOptions,
    limits: &ConcurrencyLimits,
) -> Result<(String, DataId, FileKind, u64), TreeError> {
    let kind = if plan.executable {
        FileKind::Executable
    } else {
        FileKind::PlainFile
    };

    // A single raw chunk is the file: bare blob form.
    let id = if plan.segments.len() == 1 && !plan.segments[0].compressed {
        plan.segments[0].blob_id.clone()
    } else {
        let refs: Vec<DataId> = plan.segments.iter().map(|s| s.chunk_ref().clone()).collect();
        let chunk_size = if plan.segments.len() == 1 {
            plan.size
        } else {
            options.chunk_size
        };
        let info = FileInfo {
            kind,
            size: plan.size,
            compression: Compression::None,
            payload: Payload::FixedChunkSize(chunk_size),
        };
        let _network = limits.acquire_network().await;
        store.put(refs, info.encode()).await?
    };
    Ok((plan.rel, id, kind, plan.size))
}

/// Build directory objects depth-first from the leaves.
async fn build_directories(
    store: &dyn ContentStore,
    limits: &ConcurrencyLimits,
    directories: Vec<String>,
    files: Vec<(String, DataId, FileKind, u64)>,
    symlinks: Vec<(String, DataId, u64)>,
) -> Result<DataId, TreeError> {
    // parent rel -> children (name, kind, size, id)
    let mut children: HashMap<String, Vec<(String, FileKind, u64, DataId)>> = HashMap::new();
    let mut known_dirs: HashSet<String> = directories.into_iter().collect();
    known_dirs.insert(String::new());

    // Implicit parents of every known path must exist as directories even
    // if the scanner never yielded them.
    let mut all_dirs: Vec<String> = known_dirs.iter().cloned().collect();
    for dir in &all_dirs {
        let mut current = dir.as_str();
        while let Some((parent, _)) = current.rsplit_once('/') {
            known_dirs.insert(parent.to_string());
            current = parent;
        }
    }
    all_dirs = known_dirs.iter().cloned().collect();

    for (rel, id, kind, size) in files {
        let (parent, name) = split_parent(&rel);
        children
            .entry(parent.to_string())
            .or_default()
            .push((name.to_string(), kind, size, id));
    }
    for (rel, id, size) in symlinks {
        let (parent, name) = split_parent(&rel);
        children
            .entry(parent.to_string())
            .or_default()
            .push((name.to_string(), FileKind::Symlink, size, id));
    }

    // Reverse path order: deepest first, so every child directory is built
    // before its parent needs its id.
    all_dirs.sort_by_key(|dir| std::cmp::Reverse(dir.matches('/').count() + !dir.is_empty() as usize));
    let mut built: HashMap<String, (DataId, u64)> = HashMap::new();
    for dir in all_dirs {
        let mut entries = children.remove(&dir).unwrap_or_default();
        // Attach already-built subdirectories of this directory.
        let built_here: Vec<String> = built
            .keys()
            .filter(|candidate| split_parent(candidate).0 == dir)
            .cloned()
            .collect();
        for child in built_here {
            let (id, size) = built.remove(&child).expect("key just listed");
            let (_, name) = split_parent(&child);
            entries.push((name.to_string(), FileKind::Directory, size, id));
        }
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        let size = entries
            .iter()
            .fold(0u64, |total, (_, _, size, _)| total.saturating_add(*size));
        let listing = entries
            .into_iter()
            .map(|(name, kind, size, id)| (DirectoryEntry { name, kind, size }, id))
            .collect();
        let _network = limits.acquire_network().await;
        let id = write_directory(store, listing).await?;
        if dir.is_empty() {
            return Ok(id);
        }
        built.insert(dir, (id, size));
    }
    unreachable!("the root directory is always built last");
}

fn split_parent(rel: &str) -> (&str, &str) {
    rel.rsplit_once('/').unwrap_or(("", rel))
}
