//! End-to-end engine behavior: caching, dedup, cycles, repair.

use std::sync::{
    Arc,
    atomic::{AtomicU32, Ordering},
};

use async_trait::async_trait;
use pretty_assertions::assert_eq;
use quarry::{
    DataId, EngineConfig, EngineError, FunctionInterface,
    action::{ActionExecutionRequest, ActionOutput, ActionSpec},
    cas::ContentStore,
    error::CodecError,
    flags,
    fncache::{FunctionCache, MemoryFunctionCache},
    key::{self, BuildKey, KeyInfo, KeyRegistry},
    resource::{ResourceLifetime, ResourceRegistry},
    tree::{self, FileKind, Parsed},
    value::{self, CodableValue, SharedValue, ValueRegistry},
};
use serde::{Deserialize, Serialize};

use crate::memory_store;

#[derive(Clone, Serialize, Deserialize, PartialEq, Debug)]
struct Total {
    total: i64,
}

impl CodableValue for Total {
    const VALUE_TYPE: &'static str = "test.total";
}

fn registry_with_totals() -> (KeyRegistry, ValueRegistry) {
    let mut keys = KeyRegistry::new();
    keys.register("test.sum", KeyInfo::versioned(1));
    keys.register("test.absolute-sum", KeyInfo::versioned(1));
    keys.register("test.cyclic", KeyInfo::versioned(1));
    keys.register("test.chain", KeyInfo::versioned(1));
    keys.register("test.counted", KeyInfo::versioned(1));
    keys.register("test.volatile-counted", KeyInfo::versioned(1));
    let mut values = ValueRegistry::new();
    values.register::<Total>();
    (keys, values)
}

/// Sums its values by spawning a shell action and reading the output tree.
#[derive(Clone, Serialize)]
struct Sum {
    values: Vec<i64>,
}

#[async_trait]
impl BuildKey for Sum {
    fn key_type(&self) -> &'static str {
        "test.sum"
    }

    fn fields(&self) -> Result<serde_json::Value, CodecError> {
        serde_json::to_value(self).map_err(CodecError::Encode)
    }

    async fn compute(&self, fi: &FunctionInterface) -> Result<SharedValue, EngineError> {
        let expression = self
            .values
            .iter()
            .map(|value| value.to_string())
            .collect::<Vec<_>>()
            .join(" + ");
        let request = ActionExecutionRequest::builder()
            .spec(
                ActionSpec::builder()
                    .arguments(vec![
                        String::from("/bin/sh"),
                        String::from("-c"),
                        format!("echo $(({expression})) > total"),
                    ])
                    .build(),
            )
            .outputs(vec![
                ActionOutput::builder()
                    .path("total")
                    .kind(FileKind::PlainFile)
                    .build(),
            ])
            .build();
        let result = fi.spawn(request).await?;
        let tree_id = result
            .output_tree
            .clone()
            .ok_or_else(|| EngineError::user("sum action produced no outputs"))?;

        let (entry, file_id) = tree::lookup(fi.store(), &tree_id, "total")
            .await?
            .ok_or_else(|| EngineError::user("total file missing from output tree"))?;
        let object = quarry::cas::must_get(fi.store(), &file_id).await?;
        let Parsed::File(blob) = tree::parse(&file_id, &object, entry.kind)? else {
            return Err(EngineError::user("total is not a file"));
        };
        let bytes = blob.read_all(fi.store()).await?;
        let total = String::from_utf8_lossy(&bytes)
            .trim()
            .parse::<i64>()
            .map_err(|err| EngineError::user(format!("parse total: {err}")))?;
        Ok(Arc::new(Total { total }))
    }
}

#[test_log::test(tokio::test)]
async fn sum_action_computes_total() {
    let store = memory_store();
    let (keys, values) = registry_with_totals();
    let engine = EngineConfig::builder()
        .store(store)
        .keys(keys)
        .values(values)
        .build()
        .start();

    let total = engine
        .build_as::<Total>(Sum {
            values: vec![2, 3, 4],
        })
        .await
        .expect("sum builds");
    assert_eq!(total.total, 9);
}

/// Sums absolute values; repairs cached totals that went negative.
#[derive(Clone, Serialize)]
struct AbsoluteSum {
    values: Vec<i64>,
}

#[async_trait]
impl BuildKey for AbsoluteSum {
    fn key_type(&self) -> &'static str {
        "test.absolute-sum"
    }

    fn fields(&self) -> Result<serde_json::Value, CodecError> {
        serde_json::to_value(self).map_err(CodecError::Encode)
    }

    async fn compute(&self, _fi: &FunctionInterface) -> Result<SharedValue, EngineError> {
        let total = self.values.iter().map(|value| value.abs()).sum();
        Ok(Arc::new(Total { total }))
    }

    fn validate_cached(&self, value: &SharedValue) -> bool {
        value::downcast::<Total>(value)
            .map(|total| total.total >= 0)
            .unwrap_or(false)
    }

    async fn fix_cached(
        &self,
        value: SharedValue,
        _fi: &FunctionInterface,
    ) -> Result<Option<SharedValue>, EngineError> {
        let total = value::downcast::<Total>(&value)?;
        Ok(Some(Arc::new(Total {
            total: total.total.abs(),
        })))
    }
}

#[test_log::test(tokio::test)]
async fn weird_cached_value_is_repaired() {
    let store = memory_store();
    let (keys, values) = registry_with_totals();
    let cache = Arc::new(MemoryFunctionCache::new());

    // Prime the cache with a wrong (negative) total under the key's real
    // fingerprint.
    let key = AbsoluteSum {
        values: vec![-2, -3, -4],
    };
    let engine = EngineConfig::builder()
        .store(Arc::clone(&store) as Arc<dyn ContentStore>)
        .cache(Arc::clone(&cache) as Arc<dyn FunctionCache>)
        .keys(keys)
        .values(values)
        .build()
        .start();
    let (primed_keys, _) = registry_with_totals();
    let fingerprint = key::fingerprint(
        &key,
        &primed_keys,
        &ResourceRegistry::new(),
        engine.build_id(),
    )
    .unwrap();
    let wrong = value::store(store.as_ref(), &Total { total: -9 }).await.unwrap();
    cache.update(&fingerprint, wrong).await;

    // The engine observes the cached value, rejects it, and serves the
    // repaired one.
    let total = engine.build_as::<Total>(key).await.unwrap();
    assert_eq!(total.total, 9);

    // The repaired value replaced the cached entry.
    let repaired = cache.get(&fingerprint).await.expect("entry still cached");
    let object = store.get(&repaired).await.unwrap().unwrap();
    let decoded: Total = serde_json::from_value(
        serde_json::from_slice::<serde_json::Value>(&object.data).unwrap()["value"].clone(),
    )
    .unwrap();
    assert_eq!(decoded.total, 9);
}

/// Requests its own negation, forever.
#[derive(Clone, Serialize)]
struct Cyclic {
    value: i64,
}

#[async_trait]
impl BuildKey for Cyclic {
    fn key_type(&self) -> &'static str {
        "test.cyclic"
    }

    fn fields(&self) -> Result<serde_json::Value, CodecError> {
        serde_json::to_value(self).map_err(CodecError::Encode)
    }

    async fn compute(&self, fi: &FunctionInterface) -> Result<SharedValue, EngineError> {
        fi.request(Cyclic { value: -self.value }).await
    }
}

#[test_log::test(tokio::test)]
async fn two_node_cycle_is_refused() {
    let store = memory_store();
    let (keys, values) = registry_with_totals();
    let engine = EngineConfig::builder()
        .store(store)
        .keys(keys)
        .values(values)
        .build()
        .start();

    let err = engine.build(Cyclic { value: 4 }).await.expect_err("cycle");
    let path = err.cycle_path().expect("cycle path present");
    assert_eq!(path.len(), 3);
    assert_eq!(path.first(), path.last());
}

/// Chain 1 -> 2 -> 3 -> 4 -> 1.
#[derive(Clone, Serialize)]
struct Chain {
    node: u32,
}

#[async_trait]
impl BuildKey for Chain {
    fn key_type(&self) -> &'static str {
        "test.chain"
    }

    fn fields(&self) -> Result<serde_json::Value, CodecError> {
        serde_json::to_value(self).map_err(CodecError::Encode)
    }

    async fn compute(&self, fi: &FunctionInterface) -> Result<SharedValue, EngineError> {
        let next = if self.node == 4 { 1 } else { self.node + 1 };
        fi.request(Chain { node: next }).await
    }
}

#[test_log::test(tokio::test)]
async fn four_node_cycle_reports_length_five_path() {
    let store = memory_store();
    let (keys, values) = registry_with_totals();
    let engine = EngineConfig::builder()
        .store(store)
        .keys(keys)
        .values(values)
        .build()
        .start();

    let err = engine.build(Chain { node: 1 }).await.expect_err("cycle");
    let path = err.cycle_path().expect("cycle path present");
    assert_eq!(path.len(), 5, "cycle of length 5 expected, got {path:?}");
    assert_eq!(path.first(), path.last());
}

/// Counts how many times compute actually runs.
#[derive(Clone, Serialize)]
struct Counted {
    #[serde(skip)]
    executions: Arc<AtomicU32>,
    #[serde(skip)]
    volatile: bool,
    tag: u32,
}

#[async_trait]
impl BuildKey for Counted {
    fn key_type(&self) -> &'static str {
        if self.volatile {
            "test.volatile-counted"
        } else {
            "test.counted"
        }
    }

    fn fields(&self) -> Result<serde_json::Value, CodecError> {
        serde_json::to_value(self).map_err(CodecError::Encode)
    }

    fn volatile(&self) -> bool {
        self.volatile
    }

    async fn compute(&self, _fi: &FunctionInterface) -> Result<SharedValue, EngineError> {
        let count = self.executions.fetch_add(1, Ordering::SeqCst) + 1;
        // Linger so concurrent requests overlap the in-flight window.
        tokio::time::sleep(std::time::Duration::from_millis(25)).await;
        Ok(Arc::new(Total {
            total: i64::from(count),
        }))
    }
}

#[test_log::test(tokio::test)]
async fn concurrent_requests_deduplicate_to_one_compute() {
    let store = memory_store();
    let (keys, values) = registry_with_totals();
    let engine = EngineConfig::builder()
        .store(store)
        .keys(keys)
        .values(values)
        .build()
        .start();

    let executions = Arc::new(AtomicU32::new(0));
    let requests = (0..16).map(|_| {
        let engine = engine.clone();
        let executions = Arc::clone(&executions);
        tokio::spawn(async move {
            engine
                .build_as::<Total>(Counted {
                    executions,
                    volatile: false,
                    tag: 1,
                })
                .await
        })
    });
    let results = futures::future::join_all(requests).await;

    assert_eq!(executions.load(Ordering::SeqCst), 1, "exactly one compute");
    for result in results {
        assert_eq!(result.unwrap().unwrap().total, 1);
    }
}

#[test_log::test(tokio::test)]
async fn cached_value_is_returned_without_recompute() {
    let store = memory_store();
    let (keys, values) = registry_with_totals();
    let engine = EngineConfig::builder()
        .store(store)
        .keys(keys)
        .values(values)
        .build()
        .start();

    let executions = Arc::new(AtomicU32::new(0));
    let key = || Counted {
        executions: Arc::clone(&executions),
        volatile: false,
        tag: 2,
    };
    let first = engine.build_as::<Total>(key()).await.unwrap();
    let second = engine.build_as::<Total>(key()).await.unwrap();
    assert_eq!(first, second);
    assert_eq!(executions.load(Ordering::SeqCst), 1);
}

#[test_log::test(tokio::test)]
async fn volatile_keys_bypass_the_cache() {
    let store = memory_store();
    let (keys, values) = registry_with_totals();
    let engine = EngineConfig::builder()
        .store(store)
        .keys(keys)
        .values(values)
        .build()
        .start();

    let executions = Arc::new(AtomicU32::new(0));
    let key = || Counted {
        executions: Arc::clone(&executions),
        volatile: true,
        tag: 3,
    };
    engine.build_as::<Total>(key()).await.unwrap();
    engine.build_as::<Total>(key()).await.unwrap();
    assert_eq!(executions.load(Ordering::SeqCst), 2, "no caching for volatile keys");
}

#[derive(Clone, Serialize)]
struct Unregistered;

#[async_trait]
impl BuildKey for Unregistered {
    fn key_type(&self) -> &'static str {
        "test.unregistered"
    }

    fn fields(&self) -> Result<serde_json::Value, CodecError> {
        Ok(serde_json::json!({}))
    }

    async fn compute(&self, _fi: &FunctionInterface) -> Result<SharedValue, EngineError> {
        unreachable!("never registered, never computed")
    }
}

#[test_log::test(tokio::test)]
async fn unknown_key_identifier_is_an_error() {
    let store = memory_store();
    let (keys, values) = registry_with_totals();
    let engine = EngineConfig::builder()
        .store(store)
        .keys(keys)
        .values(values)
        .build()
        .start();

    assert!(matches!(
        engine.build(Unregistered).await,
        Err(EngineError::UnknownKeyIdentifier(_))
    ));
}

/// Reads a counter resource if entitled.
#[derive(Clone, Serialize)]
struct ResourceReader {
    entitled: bool,
}

#[async_trait]
impl BuildKey for ResourceReader {
    fn key_type(&self) -> &'static str {
        "test.counted"
    }

    fn fields(&self) -> Result<serde_json::Value, CodecError> {
        serde_json::to_value(self).map_err(CodecError::Encode)
    }

    fn volatile(&self) -> bool {
        true
    }

    fn entitlements(&self) -> Vec<String> {
        if self.entitled {
            vec![String::from("counter")]
        } else {
            Vec::new()
        }
    }

    async fn compute(&self, fi: &FunctionInterface) -> Result<SharedValue, EngineError> {
        let total = match fi.resource_as::<AtomicU32>("counter") {
            Some(counter) => i64::from(counter.load(Ordering::SeqCst)),
            None => -1,
        };
        Ok(Arc::new(Total { total }))
    }
}

#[test_log::test(tokio::test)]
async fn resource_access_is_gated_on_entitlements() {
    let store = memory_store();
    let (keys, values) = registry_with_totals();
    let mut resources = ResourceRegistry::new();
    resources.register(
        "counter",
        ResourceLifetime::Idempotent,
        Arc::new(AtomicU32::new(41)),
    );
    let engine = EngineConfig::builder()
        .store(store)
        .keys(keys)
        .values(values)
        .resources(resources)
        .build()
        .start();

    let entitled = engine
        .build_as::<Total>(ResourceReader { entitled: true })
        .await
        .unwrap();
    assert_eq!(entitled.total, 41);

    let unentitled = engine
        .build_as::<Total>(ResourceReader { entitled: false })
        .await
        .unwrap();
    assert_eq!(unentitled.total, -1, "unentitled access returns None");
}

#[test_log::test(tokio::test)]
async fn past_deadline_fails_before_compute() {
    let store = memory_store();
    let (keys, values) = registry_with_totals();
    let engine = EngineConfig::builder()
        .store(store)
        .keys(keys)
        .values(values)
        .build()
        .start();

    let executions = Arc::new(AtomicU32::new(0));
    let ctx = engine
        .context()
        .with_timeout(std::time::Duration::from_millis(0));
    let err = engine
        .build_with_context(
            Counted {
                executions: Arc::clone(&executions),
                volatile: false,
                tag: 9,
            },
            ctx,
        )
        .await
        .expect_err("expired context");
    assert!(err.is_cancelled(), "expected cancellation, got {err:?}");
    assert_eq!(executions.load(Ordering::SeqCst), 0, "compute never started");
}

/// Spins until its context is cancelled.
#[derive(Clone, Serialize)]
struct Spinner;

#[async_trait]
impl BuildKey for Spinner {
    fn key_type(&self) -> &'static str {
        "test.counted"
    }

    fn fields(&self) -> Result<serde_json::Value, CodecError> {
        Ok(serde_json::json!({ "spinner": true }))
    }

    fn volatile(&self) -> bool {
        true
    }

    async fn compute(&self, fi: &FunctionInterface) -> Result<SharedValue, EngineError> {
        loop {
            fi.ctx().check()?;
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
    }
}

#[test_log::test(tokio::test)]
async fn cancel_all_stops_in_flight_computes() {
    let store = memory_store();
    let (keys, values) = registry_with_totals();
    let engine = EngineConfig::builder()
        .store(store)
        .keys(keys)
        .values(values)
        .build()
        .start();

    let request = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.build(Spinner).await })
    };
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    engine.cancel_all();

    let err = tokio::time::timeout(std::time::Duration::from_secs(2), request)
        .await
        .expect("cancellation propagates promptly")
        .expect("task joins")
        .expect_err("cancelled build fails");
    assert!(err.is_cancelled(), "expected cancellation, got {err:?}");
}

/// A value wrapper carrying a [`DataId`] plus metadata: the fingerprint
/// must cover the full encoding, not just the id.
#[test]
fn wrapper_fields_fingerprint_by_full_encoding() {
    #[derive(Serialize)]
    struct Wrapper {
        id: DataId,
        generation: u32,
    }

    #[derive(Serialize)]
    struct KeyFields {
        input: Wrapper,
    }

    let id = DataId::from_buffer(b"shared");
    let one = flags::encode(&KeyFields {
        input: Wrapper {
            id: id.clone(),
            generation: 1,
        },
    })
    .unwrap();
    let two = flags::encode(&KeyFields {
        input: Wrapper {
            id,
            generation: 2,
        },
    })
    .unwrap();
    assert_ne!(one, two, "metadata must change the encoded identity");
}
