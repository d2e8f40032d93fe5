//! CAS file trees: the codec for directory and chunked-file objects, and the
//! operations that import, export, merge, and edit trees.
//!
//! Trees are the substrate for every value that flows between actions: an
//! action's inputs are a pinned tree, and its outputs are re-imported as one.

mod codec;
mod export;
mod import;
mod ops;

pub use codec::{
    Blob, Compression, DEFAULT_CHUNK_SIZE, DirectoryEntry, FileInfo, FileKind, Parsed, Payload,
    find_entry, parse, read_chunk, should_compress,
};
pub use export::{ExportOptions, export, export_node};
pub use import::{ImportOptions, ImportPhase, ImportProgress, WireFormat, import};
pub use ops::{describe_size, empty_directory, insert, lookup, merge, remove, write_directory};
