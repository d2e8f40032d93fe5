//! Local subprocess executor.
//!
//! Stages the input tree into a temporary directory, runs the child with
//! configured stdio and deadlines, then re-imports declared outputs as a
//! single tree. Cancellation drives the teardown sequence.

use std::{path::Path, process::Stdio, sync::Arc};

use async_trait::async_trait;
use bon::Builder;
use strum::Display;
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    process::{Child, Command},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, trace, warn};

use crate::{
    action::{
        ActionExecutionRequest, ActionExecutor, ActionOutput, ExitReason, ProcessResult,
        TeardownStep, default_teardown,
    },
    cas::ContentStore,
    engine::TaskContext,
    error::{ActionError, TreeError},
    id::DataId,
    limits::ConcurrencyLimits,
    tree::{self, ExportOptions, FileKind, ImportOptions, ImportProgress},
};

/// Which stream a log line came from.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Display)]
#[strum(serialize_all = "lowercase")]
pub enum LogChannel {
    Stdout,
    Stderr,
}

/// One line streamed from the child while it runs.
#[derive(Clone, Debug)]
pub struct LogLine {
    pub channel: LogChannel,
    pub line: String,
}

/// How stdin write failures interact with the child's lifetime.
#[derive(Copy, Clone, Debug)]
pub struct StdinPolicy {
    /// Cancel the whole action when a stdin write fails.
    pub cancel_process_on_write_failure: bool,
    /// Stop pumping stdin once the child exits.
    pub cancel_writes_on_exit: bool,
}

impl Default for StdinPolicy {
    fn default() -> Self {
        Self {
            cancel_process_on_write_failure: true,
            cancel_writes_on_exit: true,
        }
    }
}

/// Collects host-side evidence about a child killed by cancellation.
pub trait DiagnosticsGatherer: Send + Sync {
    fn gather(&self, pid: u32) -> String;
}

/// Executes actions as local subprocesses.
///
/// Staging directories are created under the standard temporary location
/// (honoring `TMPDIR`). Non-standard descriptors are close-on-exec in the
/// child because every descriptor this process opens is `O_CLOEXEC`.
#[derive(Builder)]
pub struct LocalExecutor {
    #[builder(default)]
    limits: ConcurrencyLimits,

    /// Signal/grace steps applied on cancellation before the implicit
    /// final SIGKILL.
    #[builder(default = default_teardown())]
    teardown: Vec<TeardownStep>,

    #[builder(default)]
    stdin_policy: StdinPolicy,

    /// Start the child in a new session.
    #[builder(default)]
    start_new_session: bool,

    /// Sink for streamed stdout/stderr lines.
    log_sink: Option<flume::Sender<LogLine>>,

    diagnostics: Option<Arc<dyn DiagnosticsGatherer>>,
}

impl Default for LocalExecutor {
    fn default() -> Self {
        Self::builder().build()
    }
}

#[async_trait]
impl ActionExecutor for LocalExecutor {
    async fn execute(
        &self,
        store: &dyn ContentStore,
        request: &ActionExecutionRequest,
        ctx: &TaskContext,
    ) -> Result<ProcessResult, ActionError> {
        if request.spec.arguments.is_empty() {
            return Err(ActionError::Configuration(String::from(
                "action has no arguments",
            )));
        }

        let staging = tempfile::Builder::new()
            .prefix("quarry-action.")
            .tempdir()
            .map_err(|err| ActionError::io("create staging directory", err))?;
        let root = staging.path();

        // Stage inputs.
        let export_options = ExportOptions::builder().limits(self.limits.clone()).build();
        for input in &request.inputs {
            let dest = join_inside(root, &input.path)?;
            tree::export_node(store, &input.id, input.kind, &dest, &export_options)
                .await
                .map_err(|err| ActionError::Staging(Box::new(err)))?;
        }

        let cwd = match &request.spec.working_directory {
            Some(dir) => join_inside(root, dir)?,
            None => root.to_path_buf(),
        };
        tokio::fs::create_dir_all(&cwd)
            .await
            .map_err(|err| ActionError::io("create working directory", err))?;

        // Pre-actions: sequential ones run to completion before the main
        // action, background ones run alongside it and are reaped after.
        let mut background = Vec::new();
        for pre in &request.spec.pre_actions {
            let Some((argv0, rest)) = pre.arguments.split_first() else {
                return Err(ActionError::Configuration(String::from(
                    "pre-action has no arguments",
                )));
            };
            let mut command = Command::new(argv0);
            command
                .args(rest)
                .envs(&request.spec.environment)
                .current_dir(&cwd)
                .kill_on_drop(true);
            if pre.background {
                background.push(command.spawn().map_err(ActionError::Spawn)?);
            } else {
                let status = command
                    .status()
                    .await
                    .map_err(ActionError::Spawn)?;
                if !status.success() {
                    return Err(ActionError::Configuration(format!(
                        "pre-action {argv0:?} exited with {status}"
                    )));
                }
            }
        }

        let (mut child, pid) = self.spawn_main(request, &cwd)?;
        debug!(?pid, "spawned action");

        // Stdin pumping from in-memory chunks.
        let stdin_failed = CancellationToken::new();
        let stdin_pump: Option<JoinHandle<Option<String>>> = match child.stdin.take() {
            Some(mut stdin) if !request.stdin_chunks.is_empty() => {
                let chunks = request.stdin_chunks.clone();
                let failed = stdin_failed.clone();
                Some(tokio::spawn(async move {
                    for chunk in chunks {
                        if let Err(err) = stdin.write_all(&chunk).await {
                            failed.cancel();
                            return Some(err.to_string());
                        }
                    }
                    if let Err(err) = stdin.shutdown().await {
                        failed.cancel();
                        return Some(err.to_string());
                    }
                    None
                }))
            }
            _ => None,
        };

        // Line-oriented capture of piped stdout/stderr.
        let stdout_capture = child
            .stdout
            .take()
            .map(|pipe| self.capture(pipe, LogChannel::Stdout));
        let stderr_capture = child
            .stderr
            .take()
            .map(|pipe| self.capture(pipe, LogChannel::Stderr));

        // Wait for exit, cancellation, deadline, or a fatal stdin failure.
        let cancel_on_stdin = self.stdin_policy.cancel_process_on_write_failure;
        enum Outcome {
            Exited(std::process::ExitStatus),
            Teardown,
        }
        let outcome = Outcome::Exited(child.wait().await.map_err(|err| ActionError::io("await child", err))?);
        let (status, killed) = match outcome {
            Outcome::Exited(status) => (status, false),
            Outcome::Teardown => (self.run_teardown(&mut child, pid).await?, true),
        };
        let exit = exit_reason(status);
        debug!(%exit, killed, "action finished");

        // Resolve the stdin pump per policy.
        let standard_input_write_error = match stdin_pump {
            None => None,
            Some(handle) => {
                if self.stdin_policy.cancel_writes_on_exit && !handle.is_finished() {
                    handle.abort();
                    None
                } else {
                    handle.await.ok().flatten()
                }
            }
        };

        // Reap background pre-actions.
        for mut pre in background {
            let _ = pre.start_kill();
            let _ = pre.wait().await;
        }

        // Collect captured logs (pipes are closed once the child is gone).
        let mut logs = Vec::new();
        if let Some(capture) = stdout_capture {
            logs.extend(capture.await.unwrap_or_default());
        }
        if let Some(capture) = stderr_capture {
            logs.extend(capture.await.unwrap_or_default());
        }
        let stdout = self
            .store_logs(store, request.base_logs.as_ref(), logs)
            .await?;

        let diagnostics = match (&self.diagnostics, killed, pid) {
            (Some(gatherer), true, Some(pid)) => Some(gatherer.gather(pid)),
            _ => None,
        };

        // Re-import outputs: declared ones only on success, unconditional
        // ones regardless.
        let mut collected: Vec<(String, DataId, FileKind)> = Vec::new();
        if exit.success() {
            for output in &request.outputs {
                let Some(found) = self.import_output(store, root, output).await? else {
                    return Err(ActionError::Outputs(Box::new(TreeError::io(
                        format!("declared output missing: {}", output.path),
                        std::io::Error::from(std::io::ErrorKind::NotFound),
                    ))));
                };
                collected.push(found);
            }
        }
        let mut unconditional_outputs = Vec::new();
        for output in &request.unconditional_outputs {
            if let Some((path, id, kind)) = self.import_output(store, root, output).await? {
                unconditional_outputs.push(id.clone());
                collected.push((path, id, kind));
            }
        }

        let output_tree = if collected.is_empty() {
            None
        } else {
            let mut tree = tree::empty_directory(store)
                .await
                .map_err(|err| ActionError::Outputs(Box::new(err)))?;
            for (path, id, kind) in collected {
                tree = tree::insert(store, &tree, &path, &id, kind)
                    .await
                    .map_err(|err| ActionError::Outputs(Box::new(err)))?;
            }
            Some(tree)
        };

        Ok(ProcessResult {
            exit,
            output_tree,
            unconditional_outputs,
            stdout,
            standard_input_write_error,
            diagnostics,
        })
    }
}

impl LocalExecutor {
    fn spawn_main(
        &self,
        request: &ActionExecutionRequest,
        cwd: &Path,
    ) -> Result<(Child, Option<u32>), ActionError> {
        let (argv0, rest) = request
            .spec
            .arguments
            .split_first()
            .expect("argument presence checked by caller");
        let mut command = Command::new(argv0);
        command
            .args(rest)
            .envs(&request.spec.environment)
            .current_dir(cwd)
            .kill_on_drop(true);

        // Stdin: a staged file, a pipe for in-memory chunks, or nothing.
        match (&request.stdin_source, request.stdin_chunks.is_empty()) {
            (Some(source), _) => {
                let file = std::fs::File::open(cwd.join(source))
                    .map_err(|err| ActionError::io(format!("open stdin source {source}"), err))?;
                command.stdin(Stdio::from(file));
            }
            (None, false) => {
                command.stdin(Stdio::piped());
            }
            (None, true) => {
                command.stdin(Stdio::null());
            }
        }

        // Stdout/stderr: named destination files (which may be shared), or
        // pipes for capture.
        match &request.stdout_destination {
            Some(dest) => {
                let file = create_destination(cwd, dest)?;
                // Shared destination: both descriptors point at one file.
                if request.stderr_destination.as_deref() == Some(dest.as_str()) {
                    let clone = file
                        .try_clone()
                        .map_err(|err| ActionError::io("share stdio destination", err))?;
                    command.stderr(Stdio::from(clone));
                }
                command.stdout(Stdio::from(file));
            }
            None => {
                command.stdout(Stdio::piped());
            }
        }
        if request.stderr_destination.is_some()
            && request.stderr_destination != request.stdout_destination
        {
            let dest = request.stderr_destination.as_deref().expect("checked some");
            let file = create_destination(cwd, dest)?;
            command.stderr(Stdio::from(file));
        } else if request.stderr_destination.is_none() {
            command.stderr(Stdio::piped());
        }

        if self.start_new_session {
            // Safety: setsid is async-signal-safe.
            unsafe {
                command.pre_exec(|| {
                    libc::setsid();
                    Ok(())
                });
            }
        }

        let child = command.spawn().map_err(ActionError::Spawn)?;
        let pid = child.id();
        Ok((child, pid))
    }

    fn capture(
        &self,
        pipe: impl tokio::io::AsyncRead + Unpin + Send + 'static,
        channel: LogChannel,
    ) -> JoinHandle<Vec<u8>> {
        let sink = self.log_sink.clone();
        tokio::spawn(async move {
            let mut collected = Vec::new();
            let mut lines = BufReader::new(pipe).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if let Some(sink) = &sink {
                    let _ = sink.send_async(LogLine {
                        channel,
                        line: line.clone(),
                    })
                    .await;
                }
                collected.extend_from_slice(line.as_bytes());
                collected.push(b'\n');
            }
            collected
        })
    }

    async fn run_teardown(
        &self,
        child: &mut Child,
        pid: Option<u32>,
    ) -> Result<std::process::ExitStatus, ActionError> {
        for step in &self.teardown {
            deliver_signal(pid, step.signal);
            match tokio::time::timeout(step.grace, child.wait()).await {
                Ok(status) => {
                    return status.map_err(|err| ActionError::io("await child", err));
                }
                Err(_) => {
                    trace!(signal = step.signal, "grace expired; escalating");
                }
            }
        }
        deliver_signal(pid, libc::SIGKILL);
        child
            .wait()
            .await
            .map_err(|err| ActionError::io("await killed child", err))
    }

    /// Persist collected logs, chained onto any base log blob.
    async fn store_logs(
        &self,
        store: &dyn ContentStore,
        base: Option<&DataId>,
        logs: Vec<u8>,
    ) -> Result<Option<DataId>, ActionError> {
        if logs.is_empty() && base.is_none() {
            return Ok(None);
        }
        let mut combined = Vec::new();
        if let Some(base) = base {
            match store.get(base).await {
                Ok(Some(object)) => combined.extend_from_slice(&object.data),
                Ok(None) => warn!(%base, "base logs object missing; starting fresh"),
                Err(err) => warn!(%err, "could not fetch base logs; starting fresh"),
            }
        }
        combined.extend_from_slice(&logs);
        let id = store
            .put(Vec::new(), combined)
            .await
            .map_err(|err| ActionError::Outputs(Box::new(TreeError::Cas(err))))?;
        Ok(Some(id))
    }

    /// Import one output path from the staging directory, if present.
    async fn import_output(
        &self,
        store: &dyn ContentStore,
        root: &Path,
        output: &ActionOutput,
    ) -> Result<Option<(String, DataId, FileKind)>, ActionError> {
        let path = join_inside(root, &output.path)?;
        let metadata = match tokio::fs::symlink_metadata(&path).await {
            Ok(metadata) => metadata,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(ActionError::io(format!("stat output {}", output.path), err));
            }
        };
        let wrap = |err| ActionError::Outputs(Box::new(err));
        if metadata.is_dir() {
            let options = ImportOptions::builder().limits(self.limits.clone()).build();
            let id = tree::import(store, &path, &options, ImportProgress::new())
                .await
                .map_err(wrap)?;
            return Ok(Some((output.path.clone(), id, FileKind::Directory)));
        }
        if metadata.file_type().is_symlink() {
            let target = tokio::fs::read_link(&path)
                .await
                .map_err(|err| ActionError::io(format!("read link {}", output.path), err))?;
            let bytes = target.to_string_lossy().into_owned().into_bytes();
            let id = store
                .put(Vec::new(), bytes)
                .await
                .map_err(|err| wrap(TreeError::Cas(err)))?;
            return Ok(Some((output.path.clone(), id, FileKind::Symlink)));
        }
        let bytes = tokio::fs::read(&path)
            .await
            .map_err(|err| ActionError::io(format!("read output {}", output.path), err))?;
        let id = store
            .put(Vec::new(), bytes)
            .await
            .map_err(|err| wrap(TreeError::Cas(err)))?;
        let kind = if is_executable(&metadata) {
            FileKind::Executable
        } else {
            FileKind::PlainFile
        };
        Ok(Some((output.path.clone(), id, kind)))
    }
}

fn is_executable(metadata: &std::fs::Metadata) -> bool {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & 0o111 != 0
}

fn create_destination(cwd: &Path, dest: &str) -> Result<std::fs::File, ActionError> {
    let path = cwd.join(dest);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|err| ActionError::io(format!("create dirs for {dest}"), err))?;
    }
    std::fs::File::create(&path)
        .map_err(|err| ActionError::io(format!("create stdio destination {dest}"), err))
}

/// Join a request-relative path under `root`, refusing traversal outside.
fn join_inside(root: &Path, rel: &str) -> Result<std::path::PathBuf, ActionError> {
    let mut path = root.to_path_buf();
    for component in rel.split('/') {
        match component {
            "" | "." => {}
            ".." => {
                return Err(ActionError::Configuration(format!(
                    "path escapes the working directory: {rel:?}"
                )));
            }
            normal => path.push(normal),
        }
    }
    Ok(path)
}

fn exit_reason(status: std::process::ExitStatus) -> ExitReason {
    use std::os::unix::process::ExitStatusExt;
    match status.code() {
        Some(code) => ExitReason::Exited(code),
        None => ExitReason::Signaled(status.signal().unwrap_or(libc::SIGKILL)),
    }
}

fn deliver_signal(pid: Option<u32>, signal: i32) {
    let Some(pid) = pid else { return };
    trace!(pid, signal, "delivering signal");
    // Safety: plain kill(2) on a pid we spawned.
    unsafe {
        libc::kill(pid as libc::pid_t, signal);
    }
}

async fn deadline_reached(deadline: Option<tokio::time::Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
