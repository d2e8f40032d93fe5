//! Local executor behavior: stdio, deadlines, teardown, memoized failures.

use std::sync::{
    Arc,
    atomic::{AtomicU32, Ordering},
};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use pretty_assertions::assert_eq;
use quarry::{
    EngineConfig, EngineError, FunctionInterface,
    action::{
        ActionExecutionRequest, ActionExecutor, ActionOutput, ActionSpec, ExitReason,
        LocalExecutor, ProcessResult, TeardownStep,
    },
    cas::ContentStore,
    engine::TaskContext,
    error::{ActionError, CodecError},
    key::{BuildKey, KeyInfo, KeyRegistry},
    tree::FileKind,
    value::{SharedValue, ValueRegistry},
};
use serde::Serialize;

use crate::memory_store;

fn shell(script: &str) -> ActionSpec {
    ActionSpec::builder()
        .arguments(vec![
            String::from("/bin/sh"),
            String::from("-c"),
            script.to_string(),
        ])
        .build()
}

fn engine_for_actions(executor: Arc<dyn ActionExecutor>) -> quarry::Engine {
    let mut keys = KeyRegistry::new();
    keys.register("test.runner", KeyInfo::versioned(1));
    let mut values = ValueRegistry::new();
    values.register::<Ran>();
    EngineConfig::builder()
        .store(memory_store())
        .executor(executor)
        .keys(keys)
        .values(values)
        .build()
        .start()
}

#[derive(Clone, Serialize, serde::Deserialize, PartialEq, Debug)]
pub struct Ran {
    pub exit_code: i32,
}

impl quarry::value::CodableValue for Ran {
    const VALUE_TYPE: &'static str = "test.ran";
}

/// Runs one fixed request through the engine so executions are memoized.
#[derive(Clone, Serialize)]
struct Runner {
    script: String,
    cacheable_failure: bool,
}

#[async_trait]
impl BuildKey for Runner {
    fn key_type(&self) -> &'static str {
        "test.runner"
    }

    fn fields(&self) -> Result<serde_json::Value, CodecError> {
        serde_json::to_value(self).map_err(CodecError::Encode)
    }

    fn volatile(&self) -> bool {
        true
    }

    async fn compute(&self, fi: &FunctionInterface) -> Result<SharedValue, EngineError> {
        let request = ActionExecutionRequest::builder()
            .spec(shell(&self.script))
            .cacheable_failure(self.cacheable_failure)
            .build();
        let result = fi.spawn(request).await?;
        Ok(Arc::new(Ran {
            exit_code: result.exit_code,
        }))
    }
}

/// Counts executor invocations to observe memoization.
struct CountingExecutor {
    inner: LocalExecutor,
    executions: AtomicU32,
}

impl CountingExecutor {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: LocalExecutor::default(),
            executions: AtomicU32::new(0),
        })
    }
}

#[async_trait]
impl ActionExecutor for CountingExecutor {
    async fn execute(
        &self,
        store: &dyn ContentStore,
        request: &ActionExecutionRequest,
        ctx: &TaskContext,
    ) -> Result<ProcessResult, ActionError> {
        self.executions.fetch_add(1, Ordering::SeqCst);
        self.inner.execute(store, request, ctx).await
    }
}

fn context() -> TaskContext {
    EngineConfig::builder()
        .store(memory_store())
        .build()
        .start()
        .context()
}

#[test_log::test(tokio::test)]
async fn captures_stdout_and_collects_outputs() {
    let store = memory_store();
    let executor = LocalExecutor::default();
    let request = ActionExecutionRequest::builder()
        .spec(shell("echo hello from quarry; echo result > out.txt"))
        .outputs(vec![
            ActionOutput::builder()
                .path("out.txt")
                .kind(FileKind::PlainFile)
                .build(),
        ])
        .build();

    let result = executor
        .execute(store.as_ref(), &request, &context())
        .await
        .expect("action runs");

    assert_eq!(result.exit, ExitReason::Exited(0));
    let logs_id = result.stdout.expect("captured logs");
    let logs = store.get(&logs_id).await.unwrap().unwrap().data;
    assert!(String::from_utf8_lossy(&logs).contains("hello from quarry"));

    let tree_id = result.output_tree.expect("output tree present");
    let (_, file_id) = quarry::tree::lookup(store.as_ref(), &tree_id, "out.txt")
        .await
        .unwrap()
        .expect("out.txt imported");
    let content = store.get(&file_id).await.unwrap().unwrap().data;
    assert_eq!(content, b"result\n");
}

#[test_log::test(tokio::test)]
async fn stdin_chunks_reach_the_child() {
    let store = memory_store();
    let executor = LocalExecutor::default();
    let request = ActionExecutionRequest::builder()
        .spec(shell("wc -c"))
        .stdin_chunks(vec![b"12345".to_vec(), b"6789".to_vec()])
        .build();

    let result = executor
        .execute(store.as_ref(), &request, &context())
        .await
        .unwrap();
    assert_eq!(result.exit, ExitReason::Exited(0));
    assert_eq!(result.standard_input_write_error, None);

    let logs = store
        .get(&result.stdout.expect("captured logs"))
        .await
        .unwrap()
        .unwrap()
        .data;
    assert_eq!(String::from_utf8_lossy(&logs).trim(), "9");
}

#[test_log::test(tokio::test)]
async fn deadline_tears_down_the_child() {
    let store = memory_store();
    let executor = LocalExecutor::builder()
        .teardown(vec![TeardownStep::new(libc::SIGTERM, Duration::from_millis(500))])
        .build();
    let request = ActionExecutionRequest::builder()
        .spec(shell("sleep 3600"))
        .build();

    let ctx = context().with_timeout(Duration::from_millis(100));
    let start = Instant::now();
    let result = executor
        .execute(store.as_ref(), &request, &ctx)
        .await
        .expect("teardown still yields a result");
    let elapsed = start.elapsed();

    assert_eq!(result.exit, ExitReason::Signaled(libc::SIGTERM));
    assert!(!result.exit.success());
    assert!(
        elapsed < Duration::from_secs(2),
        "child reaped promptly, took {elapsed:?}"
    );
}

#[test_log::test(tokio::test)]
async fn teardown_escalates_to_sigkill() {
    let store = memory_store();
    let executor = LocalExecutor::builder()
        .teardown(vec![TeardownStep::new(libc::SIGTERM, Duration::from_millis(200))])
        .build();
    // The child ignores SIGTERM, so only the implicit SIGKILL ends it.
    let request = ActionExecutionRequest::builder()
        .spec(shell("trap '' TERM; sleep 60"))
        .build();

    let ctx = context().with_timeout(Duration::from_millis(100));
    let result = executor
        .execute(store.as_ref(), &request, &ctx)
        .await
        .unwrap();
    assert_eq!(result.exit, ExitReason::Signaled(libc::SIGKILL));
}

#[test_log::test(tokio::test)]
async fn unconditional_outputs_survive_failure() {
    let store = memory_store();
    let executor = LocalExecutor::default();
    let request = ActionExecutionRequest::builder()
        .spec(shell("echo partial > partial.txt; exit 7"))
        .outputs(vec![
            ActionOutput::builder()
                .path("never-made.txt")
                .kind(FileKind::PlainFile)
                .build(),
        ])
        .unconditional_outputs(vec![
            ActionOutput::builder()
                .path("partial.txt")
                .kind(FileKind::PlainFile)
                .build(),
        ])
        .build();

    let result = executor
        .execute(store.as_ref(), &request, &context())
        .await
        .unwrap();
    assert_eq!(result.exit, ExitReason::Exited(7));
    assert_eq!(result.unconditional_outputs.len(), 1);

    // Declared outputs were skipped (the exit was non-zero), but the
    // unconditional one landed in the tree.
    let tree_id = result.output_tree.expect("partial tree");
    assert!(
        quarry::tree::lookup(store.as_ref(), &tree_id, "partial.txt")
            .await
            .unwrap()
            .is_some()
    );
    assert!(
        quarry::tree::lookup(store.as_ref(), &tree_id, "never-made.txt")
            .await
            .unwrap()
            .is_none()
    );
}

#[test_log::test(tokio::test)]
async fn engine_lifts_failures_and_caches_cacheable_ones() {
    let executor = CountingExecutor::new();
    let engine = engine_for_actions(executor.clone());

    let key = Runner {
        script: String::from("exit 3"),
        cacheable_failure: true,
    };
    let err = engine.build(key.clone()).await.expect_err("action fails");
    let failure = err.action_failure().expect("action failure in chain");
    let EngineError::ActionExecution { exit, .. } = failure else {
        panic!("expected action execution error");
    };
    assert_eq!(exit.shell_exit_code(), 3);
    assert_eq!(executor.executions.load(Ordering::SeqCst), 1);

    // The failure was stored; a second request reproduces it without
    // re-spawning the subprocess.
    let err = engine.build(key).await.expect_err("still fails");
    assert!(err.action_failure().is_some());
    assert_eq!(executor.executions.load(Ordering::SeqCst), 1, "no re-execution");
}

#[test_log::test(tokio::test)]
async fn non_cacheable_failures_re_execute() {
    let executor = CountingExecutor::new();
    let engine = engine_for_actions(executor.clone());

    let key = Runner {
        script: String::from("exit 5"),
        cacheable_failure: false,
    };
    engine.build(key.clone()).await.expect_err("fails");
    engine.build(key).await.expect_err("fails again");
    assert_eq!(executor.executions.load(Ordering::SeqCst), 2);
}

#[test_log::test(tokio::test)]
async fn deadline_through_engine_surfaces_action_error() {
    let engine = engine_for_actions(Arc::new(
        LocalExecutor::builder()
            .teardown(vec![TeardownStep::new(libc::SIGTERM, Duration::from_millis(200))])
            .build(),
    ));

    let ctx = engine.context().with_timeout(Duration::from_millis(100));
    let start = Instant::now();
    let err = engine
        .build_with_context(
            Runner {
                script: String::from("sleep 3600"),
                cacheable_failure: false,
            },
            ctx,
        )
        .await
        .expect_err("deadline kills the action");
    assert!(
        err.action_failure().is_some(),
        "expected an action failure, got {err:?}"
    );
    assert!(start.elapsed() < Duration::from_secs(2));
}

#[test_log::test(tokio::test)]
async fn working_directory_and_environment_apply() {
    let store = memory_store();
    let executor = LocalExecutor::default();
    let request = ActionExecutionRequest::builder()
        .spec(
            ActionSpec::builder()
                .arguments(vec![
                    String::from("/bin/sh"),
                    String::from("-c"),
                    String::from("echo $GREETING > $(basename $PWD).txt"),
                ])
                .environment(std::collections::BTreeMap::from([(
                    String::from("GREETING"),
                    String::from("hi"),
                )]))
                .working_directory(String::from("sub"))
                .build(),
        )
        .unconditional_outputs(vec![
            ActionOutput::builder()
                .path("sub/sub.txt")
                .kind(FileKind::PlainFile)
                .build(),
        ])
        .build();

    let result = executor
        .execute(store.as_ref(), &request, &context())
        .await
        .unwrap();
    assert_eq!(result.exit, ExitReason::Exited(0));
    let tree_id = result.output_tree.expect("output tree");
    let (_, file_id) = quarry::tree::lookup(store.as_ref(), &tree_id, "sub/sub.txt")
        .await
        .unwrap()
        .expect("file written in working directory");
    let content = store.get(&file_id).await.unwrap().unwrap().data;
    assert_eq!(content, b"hi\n");
}
