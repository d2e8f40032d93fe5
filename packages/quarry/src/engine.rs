//! The evaluation engine: key-to-value computation with in-flight
//! deduplication, memoization, cycle detection, and resource entitlement
//! enforcement.
//!
//! The engine's shared state (in-flight table, dependency graph) is guarded
//! by a mutex held only for O(1) updates; user computes, store I/O, and
//! action execution all run without the lock.

use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex},
    time::Duration,
};

use bon::Builder;
use futures::{
    FutureExt,
    future::{BoxFuture, Shared},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, trace};
use uuid::Uuid;

use crate::{
    action::{ActionExecutionRequest, ActionExecutor, ActionResult, ExitReason, LocalExecutor},
    cas::{ContentStore, must_get},
    error::EngineError,
    flags,
    fncache::{FunctionCache, MemoryFunctionCache},
    id::DataId,
    key::{self, BuildKey, KeyRegistry},
    limits::CancellationRegistry,
    resource::{ResourceRegistry, ResourceValue},
    value::{self, CodableValue, SharedValue, ValueRegistry},
};

/// Fingerprint domain tag for action execution requests.
const ACTION_FINGERPRINT_TAG: &str = "quarry.action";

/// Visit bound for the cycle-detection walk; graphs deeper than this give
/// up on detection rather than stalling the engine.
const CYCLE_WALK_BOUND: usize = 100_000;

/// Context threaded through one request tree: deadline, cancellation, and
/// the requesting chain for diagnostics.
#[derive(Clone, Debug)]
pub struct TaskContext {
    build_id: Uuid,
    deadline: Option<tokio::time::Instant>,
    token: CancellationToken,
    path: Vec<String>,
}

impl TaskContext {
    fn new(build_id: Uuid, token: CancellationToken) -> Self {
        Self {
            build_id,
            deadline: None,
            token,
            path: Vec::new(),
        }
    }

    /// The engine run this context belongs to.
    pub fn build_id(&self) -> &Uuid {
        &self.build_id
    }

    /// Set an absolute deadline for everything under this context.
    pub fn with_deadline(mut self, deadline: tokio::time::Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Set a deadline relative to now.
    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(tokio::time::Instant::now() + timeout)
    }

    pub fn deadline(&self) -> Option<tokio::time::Instant> {
        self.deadline
    }

    /// The requesting chain from the root to the current key.
    pub fn path(&self) -> &[String] {
        &self.path
    }

    /// Resolves when the context is cancelled (not when the deadline
    /// passes; deadline holders observe that themselves).
    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Cooperative cancellation point: fails once cancelled or past the
    /// deadline.
    pub fn check(&self) -> Result<(), EngineError> {
        if self.token.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        if let Some(deadline) = self.deadline {
            if tokio::time::Instant::now() >= deadline {
                return Err(EngineError::Cancelled);
            }
        }
        Ok(())
    }

    fn child(&self, description: String) -> Self {
        let mut child = self.clone();
        child.path.push(description);
        child
    }
}

type SharedResult = Shared<BoxFuture<'static, Result<DataId, Arc<EngineError>>>>;

#[derive(Default)]
struct EngineState {
    /// One entry per fingerprint currently computing; all requesters of
    /// that fingerprint share the entry's future.
    in_flight: HashMap<DataId, SharedResult>,
    /// Currently-active dependency edges.
    edges: HashMap<DataId, HashSet<DataId>>,
}

/// Construction-time configuration of an engine.
#[derive(Builder)]
pub struct EngineConfig {
    pub store: Arc<dyn ContentStore>,

    #[builder(default = Arc::new(MemoryFunctionCache::new()))]
    pub cache: Arc<dyn FunctionCache>,

    #[builder(default = Arc::new(LocalExecutor::default()))]
    pub executor: Arc<dyn ActionExecutor>,

    #[builder(default)]
    pub keys: KeyRegistry,

    #[builder(default)]
    pub values: ValueRegistry,

    #[builder(default)]
    pub resources: ResourceRegistry,
}

impl EngineConfig {
    /// Start an engine from this configuration.
    pub fn start(self) -> Engine {
        Engine {
            inner: Arc::new(EngineInner {
                store: self.store,
                cache: self.cache,
                executor: self.executor,
                keys: self.keys,
                values: self.values,
                resources: self.resources,
                build_id: Uuid::new_v4(),
                state: Mutex::new(EngineState::default()),
                cancellations: CancellationRegistry::new(),
            }),
        }
    }
}

/// A running engine instance. Cheap to clone.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

struct EngineInner {
    store: Arc<dyn ContentStore>,
    cache: Arc<dyn FunctionCache>,
    executor: Arc<dyn ActionExecutor>,
    keys: KeyRegistry,
    values: ValueRegistry,
    resources: ResourceRegistry,
    build_id: Uuid,
    state: Mutex<EngineState>,
    cancellations: CancellationRegistry,
}

impl Engine {
    /// The per-run build id included in request-scoped resource
    /// fingerprints.
    pub fn build_id(&self) -> &Uuid {
        &self.inner.build_id
    }

    pub fn store(&self) -> &dyn ContentStore {
        self.inner.store.as_ref()
    }

    /// A fresh root context for this engine.
    pub fn context(&self) -> TaskContext {
        let label = format!("request-{}", Uuid::new_v4().simple());
        let token = self.inner.cancellations.register(label);
        TaskContext::new(self.inner.build_id, token)
    }

    /// Cancel every in-flight task of this engine.
    pub fn cancel_all(&self) {
        self.inner.cancellations.cancel_all();
    }

    /// Evaluate a root key with a fresh context.
    pub async fn build(&self, key: impl BuildKey) -> Result<SharedValue, EngineError> {
        let ctx = self.context();
        self.build_with_context(key, ctx).await
    }

    /// Evaluate a root key under an explicit context (deadline, token).
    pub async fn build_with_context(
        &self,
        key: impl BuildKey,
        ctx: TaskContext,
    ) -> Result<SharedValue, EngineError> {
        self.inner.evaluate(None, Arc::new(key), ctx).await
    }

    /// Evaluate a root key, downcasting the result.
    pub async fn build_as<T: CodableValue + Clone>(
        &self,
        key: impl BuildKey,
    ) -> Result<Arc<T>, EngineError> {
        let value = self.build(key).await?;
        Ok(Arc::new(value::downcast::<T>(&value)?.clone()))
    }
}

impl EngineInner {
    /// Evaluate one request: fingerprint, edge bookkeeping, then the
    /// cached/deduplicated computation.
    #[instrument(name = "Engine::evaluate", skip_all, fields(key = key.key_type()))]
    async fn evaluate(
        self: &Arc<Self>,
        parent: Option<DataId>,
        key: Arc<dyn BuildKey>,
        ctx: TaskContext,
    ) -> Result<SharedValue, EngineError> {
        let fingerprint = key::fingerprint(
            key.as_ref(),
            &self.keys,
            &self.resources,
            &self.build_id,
        )?;

        if let Some(parent) = &parent {
            self.add_edge(parent, &fingerprint)?;
        }
        let result = self
            .evaluate_fingerprint(fingerprint.clone(), key, ctx)
            .await;
        if let Some(parent) = &parent {
            self.remove_edge(parent, &fingerprint);
        }

        let id = result?;
        let object = must_get(self.store.as_ref(), &id).await?;
        self.values.decode(&object)
    }

    /// The dedup/memoization core; returns the id of the computed value.
    async fn evaluate_fingerprint(
        self: &Arc<Self>,
        fingerprint: DataId,
        key: Arc<dyn BuildKey>,
        ctx: TaskContext,
    ) -> Result<DataId, EngineError> {
        ctx.check()?;
        let volatile = key.volatile();

        // Consult the cache first; only the validate/repair hooks can
        // reject a hit.
        if !volatile {
            if let Some(cached) = self.cache.get(&fingerprint).await {
                if let Some(id) = self
                    .validate_cached(&fingerprint, &key, cached, &ctx)
                    .await?
                {
                    trace!(%fingerprint, "cache hit");
                    return Ok(id);
                }
                trace!(%fingerprint, "cache hit rejected; recomputing");
            }
        }

        // Atomically join or create the in-flight entry. Exactly one
        // compute runs per fingerprint between entry creation and removal.
        let (future, owner) = {
            let mut state = self.state.lock().expect("engine state lock poisoned");
            match state.in_flight.get(&fingerprint) {
                Some(existing) => (existing.clone(), false),
                None => {
                    let future = self.spawn_compute(fingerprint.clone(), Arc::clone(&key), &ctx);
                    state.in_flight.insert(fingerprint.clone(), future.clone());
                    (future, true)
                }
            }
        };
        if owner {
            trace!(%fingerprint, "started compute");
        } else {
            trace!(%fingerprint, "joined in-flight compute");
        }
        future.await.map_err(EngineError::Shared)
    }

    /// Spawn the owning compute task for a fingerprint.
    fn spawn_compute(
        self: &Arc<Self>,
        fingerprint: DataId,
        key: Arc<dyn BuildKey>,
        ctx: &TaskContext,
    ) -> SharedResult {
        let engine = Arc::clone(self);
        let ctx = ctx.child(key.describe());
        let handle = tokio::spawn(async move {
            let description = key.describe();
            let path = ctx.path().to_vec();
            let volatile = key.volatile();
            let result: Result<DataId, EngineError> = async {
                ctx.check()?;
                let fi = FunctionInterface {
                    engine: Arc::clone(&engine),
                    fingerprint: fingerprint.clone(),
                    entitlements: key.entitlements(),
                    ctx: ctx.clone(),
                };
                let computed = key.compute(&fi).await?;
                let id = value::store(engine.store.as_ref(), computed.as_ref()).await?;
                if !volatile {
                    engine.cache.update(&fingerprint, id.clone()).await;
                }
                Ok(id)
            }
            .await;

            // The entry is removed when the future resolves, success or
            // not, so a later retry can start a fresh compute.
            {
                let mut state = engine.state.lock().expect("engine state lock poisoned");
                state.in_flight.remove(&fingerprint);
            }

            result.map_err(|source| {
                Arc::new(EngineError::ValueComputation {
                    key: description,
                    source: Box::new(source),
                    path,
                })
            })
        });
        async move {
            handle
                .await
                .map_err(|err| Arc::new(EngineError::user(format!("compute task failed: {err}"))))?
        }
        .boxed()
        .shared()
    }

    /// Run the validate/repair hooks against a cache hit.
    ///
    /// Returns the id to serve, or `None` to treat the hit as a miss.
    async fn validate_cached(
        self: &Arc<Self>,
        fingerprint: &DataId,
        key: &Arc<dyn BuildKey>,
        cached: DataId,
        ctx: &TaskContext,
    ) -> Result<Option<DataId>, EngineError> {
        let Some(object) = self.store.get(&cached).await? else {
            // The cache referenced an object the store no longer has;
            // recompute.
            return Ok(None);
        };
        let value = self.values.decode(&object)?;
        if key.validate_cached(&value) {
            return Ok(Some(cached));
        }

        debug!(%fingerprint, "cached value rejected by validation");
        let fi = FunctionInterface {
            engine: Arc::clone(self),
            fingerprint: fingerprint.clone(),
            entitlements: key.entitlements(),
            ctx: ctx.clone(),
        };
        match key.fix_cached(value, &fi).await? {
            Some(fixed) => {
                let id = value::store(self.store.as_ref(), fixed.as_ref()).await?;
                self.cache.update(fingerprint, id.clone()).await;
                debug!(%fingerprint, "cached value repaired");
                Ok(Some(id))
            }
            None => Ok(None),
        }
    }

    /// Execute (or recall) an action request, memoized like a key.
    async fn spawn_action(
        self: &Arc<Self>,
        request: ActionExecutionRequest,
        ctx: TaskContext,
    ) -> Result<Arc<ActionResult>, EngineError> {
        let fingerprint = action_fingerprint(&request)?;
        ctx.check()?;

        if let Some(cached) = self.cache.get(&fingerprint).await {
            if let Some(object) = self.store.get(&cached).await? {
                let result = self.values.decode_as::<ActionResult>(&object)?;
                trace!(%fingerprint, "action cache hit");
                return lift_action_result(result);
            }
        }

        let (future, _owner) = {
            let mut state = self.state.lock().expect("engine state lock poisoned");
            match state.in_flight.get(&fingerprint) {
                Some(existing) => (existing.clone(), false),
                None => {
                    let future = self.spawn_action_task(fingerprint.clone(), request, &ctx);
                    state.in_flight.insert(fingerprint.clone(), future.clone());
                    (future, true)
                }
            }
        };
        let id = future.await.map_err(EngineError::Shared)?;
        let object = must_get(self.store.as_ref(), &id).await?;
        let result = self.values.decode_as::<ActionResult>(&object)?;
        lift_action_result(result)
    }

    fn spawn_action_task(
        self: &Arc<Self>,
        fingerprint: DataId,
        request: ActionExecutionRequest,
        ctx: &TaskContext,
    ) -> SharedResult {
        let engine = Arc::clone(self);
        let ctx = ctx.clone();
        let handle = tokio::spawn(async move {
            let result: Result<DataId, EngineError> = async {
                let process = engine
                    .executor
                    .execute(engine.store.as_ref(), &request, &ctx)
                    .await
                    .map_err(EngineError::ActionScheduling)?;

                let record = ActionResult {
                    exit_code: process.exit.shell_exit_code(),
                    output_tree: process.output_tree.clone(),
                    unconditional_outputs: process.unconditional_outputs.clone(),
                    stdout: process.stdout.clone(),
                    cached_failure: !process.exit.success() && request.cacheable_failure,
                };
                if process.exit.success() || request.cacheable_failure {
                    let id = value::store(engine.store.as_ref(), &record).await?;
                    engine.cache.update(&fingerprint, id.clone()).await;
                    Ok(id)
                } else {
                    // Failed computes never populate the cache; the error
                    // carries the partial outputs for inspection.
                    Err(EngineError::ActionExecution {
                        exit: process.exit,
                        stdout: process.stdout,
                        outputs: process.output_tree,
                        unconditional_outputs: process.unconditional_outputs,
                    })
                }
            }
            .await;

            {
                let mut state = engine.state.lock().expect("engine state lock poisoned");
                state.in_flight.remove(&fingerprint);
            }
            result.map_err(Arc::new)
        });
        async move {
            handle
                .await
                .map_err(|err| Arc::new(EngineError::user(format!("action task failed: {err}"))))?
        }
        .boxed()
        .shared()
    }

    /// Add a dependency edge, refusing edges that would close a cycle.
    fn add_edge(&self, parent: &DataId, child: &DataId) -> Result<(), EngineError> {
        let mut state = self.state.lock().expect("engine state lock poisoned");
        if parent == child {
            return Err(EngineError::CycleDetected {
                path: vec![parent.clone(), child.clone()],
            });
        }
        if let Some(mut path) = find_path(&state.edges, child, parent) {
            let mut cycle = Vec::with_capacity(path.len() + 1);
            cycle.push(parent.clone());
            cycle.append(&mut path);
            return Err(EngineError::CycleDetected { path: cycle });
        }
        state
            .edges
            .entry(parent.clone())
            .or_default()
            .insert(child.clone());
        Ok(())
    }

    fn remove_edge(&self, parent: &DataId, child: &DataId) {
        let mut state = self.state.lock().expect("engine state lock poisoned");
        if let Some(children) = state.edges.get_mut(parent) {
            children.remove(child);
            if children.is_empty() {
                state.edges.remove(parent);
            }
        }
    }
}

/// Bounded depth-first search for a path `from -> ... -> to`.
fn find_path(
    edges: &HashMap<DataId, HashSet<DataId>>,
    from: &DataId,
    to: &DataId,
) -> Option<Vec<DataId>> {
    let mut visited = HashSet::new();
    let mut path = Vec::new();
    let mut budget = CYCLE_WALK_BOUND;
    walk(edges, from, to, &mut visited, &mut path, &mut budget).then(|| {
        path.insert(0, from.clone());
        path
    })
}

fn walk(
    edges: &HashMap<DataId, HashSet<DataId>>,
    current: &DataId,
    target: &DataId,
    visited: &mut HashSet<DataId>,
    path: &mut Vec<DataId>,
    budget: &mut usize,
) -> bool {
    if *budget == 0 || !visited.insert(current.clone()) {
        return false;
    }
    *budget -= 1;
    let Some(children) = edges.get(current) else {
        return false;
    };
    for child in children {
        path.push(child.clone());
        if child == target || walk(edges, child, target, visited, path, budget) {
            return true;
        }
        path.pop();
    }
    false
}

/// Fingerprint an action request for memoization and dedup.
fn action_fingerprint(request: &ActionExecutionRequest) -> Result<DataId, EngineError> {
    let tokens = flags::encode(request)?;
    let mut hasher = blake3::Hasher::new();
    hasher.update(ACTION_FINGERPRINT_TAG.as_bytes());
    hasher.update(&[0]);
    for token in &tokens {
        hasher.update(token.as_bytes());
        hasher.update(&[0]);
    }
    Ok(DataId::from_blake3(hasher.finalize()))
}

/// Turn a recalled result into the caller-visible outcome: stored
/// failures reproduce as errors without re-spawning.
fn lift_action_result(result: Arc<ActionResult>) -> Result<Arc<ActionResult>, EngineError> {
    if result.exit_code == 0 {
        Ok(result)
    } else {
        Err(EngineError::ActionExecution {
            exit: ExitReason::Exited(result.exit_code),
            stdout: result.stdout.clone(),
            outputs: result.output_tree.clone(),
            unconditional_outputs: result.unconditional_outputs.clone(),
        })
    }
}

/// The interface a key's `compute` uses to reach the engine: child
/// requests, action spawning, resource access, and the store.
pub struct FunctionInterface {
    engine: Arc<EngineInner>,
    fingerprint: DataId,
    entitlements: Vec<String>,
    ctx: TaskContext,
}

impl FunctionInterface {
    pub fn store(&self) -> &dyn ContentStore {
        self.engine.store.as_ref()
    }

    pub fn ctx(&self) -> &TaskContext {
        &self.ctx
    }

    /// Request another key's value; recursion through the engine.
    pub async fn request(&self, key: impl BuildKey) -> Result<SharedValue, EngineError> {
        self.engine
            .evaluate(
                Some(self.fingerprint.clone()),
                Arc::new(key),
                self.ctx.clone(),
            )
            .await
    }

    /// Request another key's value and downcast it.
    pub async fn request_as<T: CodableValue + Clone>(
        &self,
        key: impl BuildKey,
    ) -> Result<T, EngineError> {
        let value = self.request(key).await?;
        Ok(value::downcast::<T>(&value)?.clone())
    }

    /// Schedule an action; execution is memoized by the engine.
    pub async fn spawn(
        &self,
        request: ActionExecutionRequest,
    ) -> Result<Arc<ActionResult>, EngineError> {
        self.engine.spawn_action(request, self.ctx.clone()).await
    }

    /// Access a named resource, gated on this key's entitlements.
    ///
    /// Returns `None` both for unknown resources and for resources the key
    /// is not entitled to.
    pub fn resource(&self, name: &str) -> Option<ResourceValue> {
        if !self.entitlements.iter().any(|entitled| entitled == name) {
            return None;
        }
        self.engine.resources.get(name)
    }

    /// Access a named resource and downcast it.
    pub fn resource_as<T: Send + Sync + 'static>(&self, name: &str) -> Option<Arc<T>> {
        self.resource(name)
            .and_then(|resource| resource.downcast::<T>().ok())
    }
}
