//! Actions: externally executed units of work whose inputs and outputs are
//! CAS file trees.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use bon::Builder;
use derive_more::Display;
use serde::{Deserialize, Serialize};

use crate::{
    cas::ContentStore,
    engine::TaskContext,
    error::{ActionError, CodecError},
    flags,
    id::DataId,
    tree::FileKind,
    value::CodableValue,
};

mod local;

pub use local::{DiagnosticsGatherer, LocalExecutor, LogChannel, LogLine, StdinPolicy};

/// One preparatory command run before the main action.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize, Builder)]
pub struct PreAction {
    #[builder(into)]
    pub arguments: Vec<String>,

    /// Background pre-actions run concurrently with the main action and
    /// are reaped when it exits.
    #[builder(default)]
    #[serde(default)]
    pub background: bool,
}

/// The declarative shape of an action: what to run and in what
/// environment.
#[derive(Clone, PartialEq, Eq, Debug, Default, Serialize, Deserialize, Builder)]
pub struct ActionSpec {
    #[builder(into)]
    pub arguments: Vec<String>,

    /// Environment for the child; keys fingerprint in sorted order.
    #[builder(default)]
    #[serde(default)]
    pub environment: BTreeMap<String, String>,

    /// Working directory relative to the staged input tree.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_directory: Option<String>,

    /// Pre-actions fingerprint in declared order.
    #[builder(default)]
    #[serde(default)]
    pub pre_actions: Vec<PreAction>,
}

impl ActionSpec {
    /// Deterministic identifier of the spec: the fingerprint of all fields.
    pub fn identifier(&self) -> Result<DataId, CodecError> {
        let tokens = flags::encode(self)?;
        let mut hasher = blake3::Hasher::new();
        for token in &tokens {
            hasher.update(token.as_bytes());
            hasher.update(&[0]);
        }
        Ok(DataId::from_blake3(hasher.finalize()))
    }
}

/// A file or tree staged into the action's working directory.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize, Builder)]
pub struct ActionInput {
    #[builder(into)]
    pub path: String,
    pub id: DataId,
    pub kind: FileKind,
}

/// A path collected from the working directory after the action exits.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize, Builder)]
pub struct ActionOutput {
    #[builder(into)]
    pub path: String,
    pub kind: FileKind,
}

/// A full execution request: spec plus pinned inputs and declared outputs.
///
/// Uses the union of all historical fields; absent fields decode as
/// defaults.
#[derive(Clone, PartialEq, Eq, Debug, Default, Serialize, Deserialize, Builder)]
pub struct ActionExecutionRequest {
    #[builder(default)]
    pub spec: ActionSpec,

    #[builder(default)]
    #[serde(default)]
    pub inputs: Vec<ActionInput>,

    /// Outputs imported only on a zero exit.
    #[builder(default)]
    #[serde(default)]
    pub outputs: Vec<ActionOutput>,

    /// Outputs imported whether or not the exit code is zero.
    #[builder(default)]
    #[serde(default)]
    pub unconditional_outputs: Vec<ActionOutput>,

    /// Opaque ids carried through to the executor.
    #[builder(default)]
    #[serde(default)]
    pub additional_data: Vec<DataId>,

    /// Previous log blob to chain the new logs onto.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_logs: Option<DataId>,

    /// Store a non-zero exit as a success-shaped cached value so the
    /// failure reproduces without re-spawning.
    #[builder(default)]
    #[serde(default)]
    pub cacheable_failure: bool,

    /// Path (inside the staged tree) to feed the child's stdin from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stdin_source: Option<String>,

    /// In-memory chunks pumped into the child's stdin.
    #[builder(default)]
    #[serde(default)]
    pub stdin_chunks: Vec<Vec<u8>>,

    /// Paths (inside the working directory) receiving the child's stdout
    /// and stderr; the two may name the same file.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stdout_destination: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stderr_destination: Option<String>,
}

/// Why the child stopped.
#[derive(Copy, Clone, PartialEq, Eq, Debug, Display, Serialize, Deserialize)]
pub enum ExitReason {
    #[display("exit({_0})")]
    Exited(i32),
    #[display("signal({_0})")]
    Signaled(i32),
}

impl ExitReason {
    /// Shell convention: `exit(n)` is `n`, `signal(s)` is `128 + s`.
    pub fn shell_exit_code(self) -> i32 {
        match self {
            Self::Exited(code) => code,
            Self::Signaled(signal) => 128 + signal,
        }
    }

    /// Only `exit(0)` is success.
    pub fn success(self) -> bool {
        self == Self::Exited(0)
    }
}

/// One step of the teardown sequence applied to a cancelled child.
///
/// The executor delivers `signal`, waits up to `grace` for exit, then
/// proceeds to the next step; an implicit final SIGKILL always follows.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct TeardownStep {
    pub signal: i32,
    pub grace: Duration,
}

impl TeardownStep {
    pub fn new(signal: i32, grace: Duration) -> Self {
        Self { signal, grace }
    }
}

/// The default teardown: a polite SIGTERM, then SIGKILL.
pub fn default_teardown() -> Vec<TeardownStep> {
    vec![TeardownStep::new(libc::SIGTERM, Duration::from_secs(2))]
}

/// What an execution produced.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct ProcessResult {
    pub exit: ExitReason,
    /// Tree of collected outputs; present even for failed actions when
    /// unconditional outputs were importable.
    pub output_tree: Option<DataId>,
    /// Ids of the unconditional outputs, in declared order.
    pub unconditional_outputs: Vec<DataId>,
    /// Combined captured stdout/stderr, chained onto `base_logs`.
    pub stdout: Option<DataId>,
    pub standard_input_write_error: Option<String>,
    /// Gathered when the child was killed by cancellation or deadline.
    pub diagnostics: Option<String>,
}

/// The memoized, success-shaped record of an execution.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct ActionResult {
    pub exit_code: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_tree: Option<DataId>,
    #[serde(default)]
    pub unconditional_outputs: Vec<DataId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stdout: Option<DataId>,
    /// Set when a non-zero exit was stored deliberately so the failure
    /// survives caches.
    #[serde(default)]
    pub cached_failure: bool,
}

impl CodableValue for ActionResult {
    const VALUE_TYPE: &'static str = "quarry.action.result";

    fn refs(&self) -> Vec<DataId> {
        self.output_tree
            .iter()
            .chain(self.stdout.iter())
            .chain(self.unconditional_outputs.iter())
            .cloned()
            .collect()
    }
}

/// Runs execution requests; the engine memoizes around this.
#[async_trait]
pub trait ActionExecutor: Send + Sync {
    async fn execute(
        &self,
        store: &dyn ContentStore,
        request: &ActionExecutionRequest,
        ctx: &TaskContext,
    ) -> Result<ProcessResult, ActionError>;
}

/// Which of an action's output lists an artifact came from.
#[derive(Copy, Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum OwnerOutputIndex {
    Output(u32),
    UnconditionalOutput(u32),
}

/// Provenance of an artifact.
#[derive(Clone, PartialEq, Eq, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ArtifactOrigin {
    /// Not yet linked to a producer; must be resolved before the owning
    /// action list serializes.
    #[default]
    Unset,
    /// A source file pinned by content.
    Source(DataId),
    /// Produced by an action, linked by owner id and indices rather than a
    /// pointer cycle.
    Derived {
        actions_owner: DataId,
        action_index: u32,
        output: OwnerOutputIndex,
    },
    /// Pre-computed derived content.
    DerivedStatic(DataId),
}

/// A logical handle to a file within the build, carrying provenance.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize, Builder)]
pub struct Artifact {
    #[builder(into)]
    pub short_path: String,

    #[builder(default)]
    #[serde(default)]
    pub roots: Vec<String>,

    pub kind: FileKind,

    #[builder(default)]
    #[serde(default)]
    pub origin: ArtifactOrigin,
}

impl Artifact {
    /// A source artifact pinned to stored content.
    pub fn source(short_path: impl Into<String>, kind: FileKind, id: DataId) -> Self {
        Self {
            short_path: short_path.into(),
            roots: Vec::new(),
            kind,
            origin: ArtifactOrigin::Source(id),
        }
    }

    /// Link a derived artifact to the action that produces it.
    ///
    /// Fails if the origin was already set; an artifact has exactly one
    /// producer.
    pub fn set_derived_origin(
        &mut self,
        actions_owner: DataId,
        action_index: u32,
        output: OwnerOutputIndex,
    ) -> Result<(), CodecError> {
        if self.origin != ArtifactOrigin::Unset {
            return Err(CodecError::MalformedToken(format!(
                "artifact {:?} already has an origin",
                self.short_path
            )));
        }
        self.origin = ArtifactOrigin::Derived {
            actions_owner,
            action_index,
            output,
        };
        Ok(())
    }

    /// Whether the artifact can serialize as part of an action record.
    pub fn origin_is_set(&self) -> bool {
        self.origin != ArtifactOrigin::Unset
    }
}
