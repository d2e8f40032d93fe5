//! Wire codec for file-tree objects.
//!
//! A tree object's `data` is a [`FileInfo`] record in a field-numbered
//! binary encoding (varints, tagged fields) so that equal records always
//! produce identical bytes. Directory children and file chunks ride in the
//! object's `refs`.

use strum::Display;
use tracing::{instrument, trace};

use crate::{
    cas::{ContentStore, Object, must_get},
    error::TreeError,
    id::DataId,
    varint::{read_uvarint, write_uvarint},
};

/// Default chunk threshold for imported files: 8 MiB.
pub const DEFAULT_CHUNK_SIZE: u64 = 8 * 1024 * 1024;

/// Files at or below this size are never compressed.
const COMPRESSION_FLOOR: u64 = 1024;

/// Extensions whose content is already compressed; chunk compression is
/// skipped for these regardless of the wire format option.
const KNOWN_COMPRESSED: &[&str] = &[
    "mp3", "mp4", "m4a", "jpg", "jpeg", "png", "gif", "webp", "webm", "mkv", "avi", "mov", "ogg",
    "flac", "aac", "zip", "gz", "tgz", "bz2", "xz", "zst", "7z", "rar", "jar", "apk", "docx",
    "xlsx", "pptx",
];

/// The type of a file-tree node.
#[derive(
    Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Display, serde::Serialize,
    serde::Deserialize,
)]
#[serde(rename_all = "camelCase")]
#[strum(serialize_all = "camelCase")]
pub enum FileKind {
    PlainFile,
    Executable,
    Symlink,
    Directory,
}

impl FileKind {
    fn to_wire(self) -> u64 {
        match self {
            Self::PlainFile => 1,
            Self::Executable => 2,
            Self::Symlink => 3,
            Self::Directory => 4,
        }
    }

    fn from_wire(value: u64) -> Option<Self> {
        match value {
            1 => Some(Self::PlainFile),
            2 => Some(Self::Executable),
            3 => Some(Self::Symlink),
            4 => Some(Self::Directory),
            _ => None,
        }
    }

    /// Whether this kind carries file bytes.
    pub fn is_file(self) -> bool {
        matches!(self, Self::PlainFile | Self::Executable)
    }
}

/// Chunk compression applied to stored file bytes.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Default, Display)]
#[strum(serialize_all = "lowercase")]
pub enum Compression {
    #[default]
    None,
    Zstd,
}

impl Compression {
    fn to_wire(self) -> u64 {
        match self {
            Self::None => 0,
            Self::Zstd => 1,
        }
    }

    fn from_wire(value: u64) -> Option<Self> {
        match value {
            0 => Some(Self::None),
            1 => Some(Self::Zstd),
            _ => None,
        }
    }
}

/// Payload discriminant of a [`FileInfo`].
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum Payload {
    /// Chunked file: the object refs are chunk ids, each chunk at most this
    /// many uncompressed bytes.
    FixedChunkSize(u64),
    /// Directory: one entry per child, refs aligned index-for-index.
    InlineChildren(Vec<DirectoryEntry>),
}

/// One child of a directory object.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct DirectoryEntry {
    pub name: String,
    pub kind: FileKind,
    pub size: u64,
}

/// The structured record stored in a tree object's `data`.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct FileInfo {
    pub kind: FileKind,
    /// Uncompressed aggregate size in bytes.
    pub size: u64,
    pub compression: Compression,
    pub payload: Payload,
}

// Field numbers for FileInfo: 1 kind, 2 size, 3 compression,
// 4 fixedChunkSize, 5 inlineChildren (repeated message).
// DirectoryEntry: 1 name, 2 kind, 3 size.
const WIRE_VARINT: u64 = 0;
const WIRE_BYTES: u64 = 2;

fn write_tag(out: &mut Vec<u8>, field: u64, wire: u64) {
    write_uvarint(out, field << 3 | wire);
}

fn write_bytes_field(out: &mut Vec<u8>, field: u64, bytes: &[u8]) {
    write_tag(out, field, WIRE_BYTES);
    write_uvarint(out, bytes.len() as u64);
    out.extend_from_slice(bytes);
}

impl DirectoryEntry {
    fn encode_into(&self, out: &mut Vec<u8>) {
        write_bytes_field(out, 1, self.name.as_bytes());
        write_tag(out, 2, WIRE_VARINT);
        write_uvarint(out, self.kind.to_wire());
        write_tag(out, 3, WIRE_VARINT);
        write_uvarint(out, self.size);
    }

    fn decode(mut input: &[u8]) -> Result<Self, String> {
        let mut name = None;
        let mut kind = None;
        let mut size = 0;
        while !input.is_empty() {
            let tag = read_uvarint(&mut input).ok_or("truncated entry tag")?;
            match (tag >> 3, tag & 0x7) {
                (1, WIRE_BYTES) => {
                    let len = read_uvarint(&mut input).ok_or("truncated name length")? as usize;
                    if input.len() < len {
                        return Err(String::from("truncated name"));
                    }
                    let (bytes, rest) = input.split_at(len);
                    name = Some(
                        String::from_utf8(bytes.to_vec()).map_err(|_| "name is not utf8")?,
                    );
                    input = rest;
                }
                (2, WIRE_VARINT) => {
                    let raw = read_uvarint(&mut input).ok_or("truncated kind")?;
                    kind = Some(FileKind::from_wire(raw).ok_or("unknown file kind")?);
                }
                (3, WIRE_VARINT) => {
                    size = read_uvarint(&mut input).ok_or("truncated size")?;
                }
                (_, wire) => skip_field(&mut input, wire)?,
            }
        }
        Ok(Self {
            name: name.ok_or("entry missing name")?,
            kind: kind.ok_or("entry missing kind")?,
            size,
        })
    }
}

fn skip_field(input: &mut &[u8], wire: u64) -> Result<(), String> {
    match wire {
        WIRE_VARINT => {
            read_uvarint(input).ok_or("truncated unknown varint")?;
        }
        WIRE_BYTES => {
            let len = read_uvarint(input).ok_or("truncated unknown length")? as usize;
            if input.len() < len {
                return Err(String::from("truncated unknown field"));
            }
            *input = &input[len..];
        }
        _ => return Err(format!("unsupported wire type {wire}")),
    }
    Ok(())
}

impl FileInfo {
    /// Encode to deterministic bytes: fields in ascending field order,
    /// defaults omitted.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(64);
        write_tag(&mut out, 1, WIRE_VARINT);
        write_uvarint(&mut out, self.kind.to_wire());
        write_tag(&mut out, 2, WIRE_VARINT);
        write_uvarint(&mut out, self.size);
        if self.compression != Compression::None {
            write_tag(&mut out, 3, WIRE_VARINT);
            write_uvarint(&mut out, self.compression.to_wire());
        }
        match &self.payload {
            Payload::FixedChunkSize(chunk_size) => {
                write_tag(&mut out, 4, WIRE_VARINT);
                write_uvarint(&mut out, *chunk_size);
            }
            Payload::InlineChildren(entries) => {
                let mut scratch = Vec::with_capacity(64);
                for entry in entries {
                    scratch.clear();
                    entry.encode_into(&mut scratch);
                    write_bytes_field(&mut out, 5, &scratch);
                }
                // An empty directory still needs a payload discriminant:
                // a zero-length field 5 marks "inline children, none".
                if entries.is_empty() {
                    write_bytes_field(&mut out, 5, &[]);
                }
            }
        }
        out
    }

    /// Decode from bytes, tolerating unknown fields.
    pub fn decode(mut input: &[u8]) -> Result<Self, String> {
        let mut kind = None;
        let mut size = 0;
        let mut compression = Compression::None;
        let mut chunk_size = None;
        let mut children: Option<Vec<DirectoryEntry>> = None;
        while !input.is_empty() {
            let tag = read_uvarint(&mut input).ok_or("truncated tag")?;
            match (tag >> 3, tag & 0x7) {
                (1, WIRE_VARINT) => {
                    let raw = read_uvarint(&mut input).ok_or("truncated kind")?;
                    kind = Some(FileKind::from_wire(raw).ok_or("unknown file kind")?);
                }
                (2, WIRE_VARINT) => {
                    size = read_uvarint(&mut input).ok_or("truncated size")?;
                }
                (3, WIRE_VARINT) => {
                    let raw = read_uvarint(&mut input).ok_or("truncated compression")?;
                    compression =
                        Compression::from_wire(raw).ok_or("unknown compression")?;
                }
                (4, WIRE_VARINT) => {
                    chunk_size = Some(read_uvarint(&mut input).ok_or("truncated chunk size")?);
                }
                (5, WIRE_BYTES) => {
                    let len = read_uvarint(&mut input).ok_or("truncated children length")?
                        as usize;
                    if input.len() < len {
                        return Err(String::from("truncated children"));
                    }
                    let (bytes, rest) = input.split_at(len);
                    let list = children.get_or_insert_with(Vec::new);
                    if !bytes.is_empty() {
                        list.push(DirectoryEntry::decode(bytes)?);
                    }
                    input = rest;
                }
                (_, wire) => skip_field(&mut input, wire)?,
            }
        }
        let payload = match (chunk_size, children) {
            (Some(chunk_size), None) => Payload::FixedChunkSize(chunk_size),
            (None, Some(children)) => Payload::InlineChildren(children),
            (None, None) => return Err(String::from("missing payload discriminant")),
            (Some(_), Some(_)) => return Err(String::from("conflicting payload fields")),
        };
        Ok(Self {
            kind: kind.ok_or("missing kind")?,
            size,
            compression,
            payload,
        })
    }
}

/// Locate an entry by name with binary search over the sorted entry list.
///
/// Returns the index of the entry, or `None`. `O(log n)`, no allocation.
pub fn find_entry(entries: &[DirectoryEntry], name: &str) -> Option<usize> {
    entries
        .binary_search_by(|entry| entry.name.as_str().cmp(name))
        .ok()
}

/// Decision procedure for chunk compression on import.
///
/// A chunk is compressed only when the file is larger than the floor, the
/// extension is not a known-compressed format, and the caller asked for the
/// compressed wire format. Whether the compressor actually wins is checked
/// at compression time.
pub fn should_compress(name: &str, file_size: u64, compressed_wire_format: bool) -> bool {
    if !compressed_wire_format || file_size <= COMPRESSION_FLOOR {
        return false;
    }
    let extension = name.rsplit_once('.').map(|(_, ext)| ext.to_ascii_lowercase());
    match extension {
        Some(ext) => !KNOWN_COMPRESSED.contains(&ext.as_str()),
        None => true,
    }
}

/// A parsed tree object, ready for traversal or materialization.
#[derive(Clone, Debug)]
pub enum Parsed {
    /// A directory: entries paired with their child ids, in entry order.
    Directory(Vec<(DirectoryEntry, DataId)>),
    /// A file; bytes are reachable through the contained [`Blob`].
    File(Blob),
    /// A symlink; the buffer is the link target.
    Symlink(Vec<u8>),
}

/// Handle to file content, either inline or spread across chunk objects.
#[derive(Clone, Debug)]
pub struct Blob {
    pub executable: bool,
    pub size: u64,
    chunk_size: u64,
    chunks: Chunks,
}

#[derive(Clone, Debug)]
enum Chunks {
    Inline(Vec<u8>),
    Refs(Vec<DataId>),
}

impl Blob {
    /// The chunk ids backing this blob, if it is chunked.
    pub fn chunk_refs(&self) -> Option<&[DataId]> {
        match &self.chunks {
            Chunks::Inline(_) => None,
            Chunks::Refs(refs) => Some(refs),
        }
    }

    /// Read `len` bytes starting at `start`.
    ///
    /// Reads outside `[0, size)` fail with `BadRange`.
    #[instrument(name = "Blob::read", skip(self, store))]
    pub async fn read(
        &self,
        store: &dyn ContentStore,
        start: u64,
        len: u64,
    ) -> Result<Vec<u8>, TreeError> {
        let end = start.saturating_add(len);
        if start > self.size || end > self.size {
            return Err(TreeError::BadRange {
                start,
                end,
                size: self.size,
            });
        }
        if len == 0 {
            return Ok(Vec::new());
        }
        match &self.chunks {
            Chunks::Inline(data) => Ok(data[start as usize..end as usize].to_vec()),
            Chunks::Refs(refs) => {
                let chunk_size = self.chunk_size.max(1);
                let first = (start / chunk_size) as usize;
                let last = (end.div_ceil(chunk_size)) as usize;
                let mut out = Vec::with_capacity(len as usize);
                for (index, id) in refs.iter().enumerate().take(last).skip(first) {
                    let chunk = read_chunk(store, id).await?;
                    let chunk_start = index as u64 * chunk_size;
                    let lo = start.saturating_sub(chunk_start).min(chunk.len() as u64);
                    let hi = (end - chunk_start).min(chunk.len() as u64);
                    out.extend_from_slice(&chunk[lo as usize..hi as usize]);
                }
                trace!(bytes = out.len(), "spliced chunked read");
                Ok(out)
            }
        }
    }

    /// Read the whole blob.
    pub async fn read_all(&self, store: &dyn ContentStore) -> Result<Vec<u8>, TreeError> {
        self.read(store, 0, self.size).await
    }
}

/// Fetch one chunk's uncompressed bytes.
///
/// A chunk object is either a raw blob, or a `FileInfo` with zstd
/// compression wrapping a single ref to the compressed bytes.
pub async fn read_chunk(store: &dyn ContentStore, id: &DataId) -> Result<Vec<u8>, TreeError> {
    let object = must_get(store, id).await?;
    if object.refs.is_empty() {
        return Ok(object.data);
    }
    let info = FileInfo::decode(&object.data).map_err(|reason| TreeError::Format {
        id: id.clone(),
        reason,
    })?;
    if info.compression != Compression::Zstd || object.refs.len() != 1 {
        return Err(TreeError::Format {
            id: id.clone(),
            reason: String::from("chunk wrapper is not a single compressed ref"),
        });
    }
    let compressed = must_get(store, &object.refs[0]).await?;
    // Decompress streaming into a buffer sized by the advertised
    // (overestimated) uncompressed size.
    let mut out = Vec::with_capacity(info.size as usize);
    let mut decoder = zstd::stream::Decoder::new(compressed.data.as_slice())
        .map_err(|err| TreeError::io("open zstd decoder", err))?;
    std::io::copy(&mut decoder, &mut out).map_err(|err| TreeError::io("decompress chunk", err))?;
    Ok(out)
}

/// Parse `(id, object, advertised kind)` into a filesystem object.
pub fn parse(id: &DataId, object: &Object, advertised: FileKind) -> Result<Parsed, TreeError> {
    let format_error = |reason: &str| TreeError::Format {
        id: id.clone(),
        reason: reason.to_string(),
    };

    // A refs-free non-directory object is a flat blob of the advertised
    // kind; directories always carry a FileInfo record.
    if object.refs.is_empty() && advertised != FileKind::Directory {
        return Ok(match advertised {
            FileKind::Symlink => Parsed::Symlink(object.data.clone()),
            kind => Parsed::File(Blob {
                executable: kind == FileKind::Executable,
                size: object.data.len() as u64,
                chunk_size: object.data.len() as u64,
                chunks: Chunks::Inline(object.data.clone()),
            }),
        });
    }

    let info = FileInfo::decode(&object.data).map_err(|reason| TreeError::Format {
        id: id.clone(),
        reason,
    })?;
    match info.kind {
        FileKind::Directory => {
            let Payload::InlineChildren(entries) = info.payload else {
                return Err(format_error("directory without inline children"));
            };
            if entries.len() != object.refs.len() {
                return Err(format_error("directory entry and ref counts differ"));
            }
            // Entries are stored pre-sorted; verify strict ordering so a
            // corrupt object cannot defeat binary search downstream.
            for pair in entries.windows(2) {
                if pair[0].name >= pair[1].name {
                    return Err(format_error("directory entries not strictly sorted"));
                }
            }
            Ok(Parsed::Directory(
                entries.into_iter().zip(object.refs.iter().cloned()).collect(),
            ))
        }
        kind @ (FileKind::PlainFile | FileKind::Executable) => {
            let Payload::FixedChunkSize(chunk_size) = info.payload else {
                return Err(format_error("file without chunk size"));
            };
            if chunk_size == info.size && object.refs.len() == 1 {
                // Single-chunk outer form: bytes live behind the one ref.
                return Ok(Parsed::File(Blob {
                    executable: kind == FileKind::Executable,
                    size: info.size,
                    chunk_size,
                    chunks: Chunks::Refs(object.refs.clone()),
                }));
            }
            if chunk_size < info.size {
                return Ok(Parsed::File(Blob {
                    executable: kind == FileKind::Executable,
                    size: info.size,
                    chunk_size,
                    chunks: Chunks::Refs(object.refs.clone()),
                }));
            }
            Err(format_error("inconsistent chunk layout"))
        }
        FileKind::Symlink => Err(format_error("symlink with references")),
    }
}
