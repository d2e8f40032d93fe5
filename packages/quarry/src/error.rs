//! Error taxonomy for the engine and its collaborators.

use std::path::PathBuf;
use std::sync::Arc;

use crate::id::DataId;

/// Errors constructing or parsing a [`DataId`](crate::id::DataId).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IdError {
    #[error("id is empty")]
    Empty,

    #[error("id is {0} bytes, larger than the maximum")]
    TooLong(usize),

    #[error("unknown id mode tag: {0:#x}")]
    UnknownTag(u8),

    #[error("id is not valid hex")]
    InvalidHex,
}

/// Errors from a content store backend.
///
/// `Transient` means the operation may succeed if retried (transport
/// hiccups, contended resources); everything else is `Permanent`.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CasError {
    #[error("transient store failure: {0}")]
    Transient(String),

    #[error("permanent store failure: {0}")]
    Permanent(String),
}

impl CasError {
    /// Classify an I/O error from a local disk backend.
    ///
    /// Interrupted syscalls are worth retrying; everything else from a
    /// local filesystem is treated as permanent.
    pub fn from_io(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::Interrupted | std::io::ErrorKind::WouldBlock => {
                Self::Transient(err.to_string())
            }
            _ => Self::Permanent(err.to_string()),
        }
    }

    /// Whether a retry may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// Errors from the file-tree codec and tree operations.
#[derive(Debug, thiserror::Error)]
pub enum TreeError {
    #[error("object {id} is not a valid tree object: {reason}")]
    Format { id: DataId, reason: String },

    #[error("read of [{start}, {end}) is outside blob of size {size}")]
    BadRange { start: u64, end: u64, size: u64 },

    #[error("object not found in store: {0}")]
    MissingObject(DataId),

    #[error("source file changed during import: {path}: {reason}")]
    ModifiedFile { path: PathBuf, reason: String },

    #[error("cannot read source entry: {path}")]
    Unreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("path escapes the tree root: {0}")]
    InvalidPath(String),

    #[error(transparent)]
    Cas(#[from] CasError),

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

impl TreeError {
    /// Wrap an I/O error with a short operation description.
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }
}

/// Errors from the action executor.
#[derive(Debug, thiserror::Error)]
pub enum ActionError {
    #[error("could not launch action: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("could not write to child standard input: {0}")]
    StandardInputWrite(#[source] std::io::Error),

    #[error("could not stage action inputs: {0}")]
    Staging(#[source] Box<TreeError>),

    #[error("could not collect action outputs: {0}")]
    Outputs(#[source] Box<TreeError>),

    #[error("action executor misconfigured: {0}")]
    Configuration(String),

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

impl ActionError {
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }
}

/// Errors encoding or decoding values and key fields.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("could not encode value: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("could not decode value: {0}")]
    Decode(#[source] serde_json::Error),

    #[error("flag token is malformed: {0:?}")]
    MalformedToken(String),

    #[error(transparent)]
    Id(#[from] IdError),
}

/// The engine-level error taxonomy.
///
/// Every failure of a root request surfaces as exactly one of these.
/// `ValueComputation` wraps whatever a user `compute` raised and records the
/// requesting chain for diagnostics.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("dependency cycle detected: {}", format_cycle(path))]
    CycleDetected { path: Vec<DataId> },

    #[error("no function registered for key type {0:?}")]
    UnknownKeyIdentifier(String),

    #[error("expected value of type {expected:?}, found {actual:?}")]
    UnexpectedValueType { expected: String, actual: String },

    #[error(transparent)]
    Cas(#[from] CasError),

    #[error("object parsing failed: {0}")]
    Format(String),

    #[error(transparent)]
    Tree(#[from] TreeError),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error("could not schedule action: {0}")]
    ActionScheduling(#[source] ActionError),

    #[error("action exited unsuccessfully ({exit})")]
    ActionExecution {
        exit: crate::action::ExitReason,
        /// Combined captured stdout/stderr, if any was collected.
        stdout: Option<DataId>,
        /// Partial output tree imported after the failure.
        outputs: Option<DataId>,
        /// Outputs imported whether or not the action succeeded.
        unconditional_outputs: Vec<DataId>,
    },

    #[error("computing value for {key}: {source}")]
    ValueComputation {
        /// Short description of the failing key.
        key: String,
        #[source]
        source: Box<EngineError>,
        /// The requesting chain from the root to this key.
        path: Vec<String>,
    },

    #[error("resource {0:?} is not registered")]
    UnknownResource(String),

    #[error("evaluation cancelled")]
    Cancelled,

    /// An error delivered to a concurrent waiter of the same fingerprint.
    #[error("{0}")]
    Shared(Arc<EngineError>),

    #[error("{0}")]
    User(String),
}

impl EngineError {
    /// Wrap an arbitrary user-compute failure.
    pub fn user(message: impl Into<String>) -> Self {
        Self::User(message.into())
    }

    /// The cycle path, if a cycle refusal is anywhere in this error's
    /// chain.
    pub fn cycle_path(&self) -> Option<&[DataId]> {
        match self {
            Self::CycleDetected { path } => Some(path),
            Self::Shared(inner) => inner.cycle_path(),
            Self::ValueComputation { source, .. } => source.cycle_path(),
            _ => None,
        }
    }

    /// The action failure, if one is anywhere in this error's chain.
    pub fn action_failure(&self) -> Option<&EngineError> {
        match self {
            err @ Self::ActionExecution { .. } => Some(err),
            Self::Shared(inner) => inner.action_failure(),
            Self::ValueComputation { source, .. } => source.action_failure(),
            _ => None,
        }
    }

    /// Whether cancellation is anywhere in this error's chain.
    pub fn is_cancelled(&self) -> bool {
        match self {
            Self::Cancelled => true,
            Self::Shared(inner) => inner.is_cancelled(),
            Self::ValueComputation { source, .. } => source.is_cancelled(),
            _ => false,
        }
    }
}

/// Shared form of an engine error, as delivered to concurrent waiters of the
/// same fingerprint.
pub type SharedEngineError = Arc<EngineError>;

fn format_cycle(path: &[DataId]) -> String {
    path.iter()
        .map(|id| {
            let hex = id.to_hex();
            hex[..hex.len().min(12)].to_string()
        })
        .collect::<Vec<_>>()
        .join(" -> ")
}
