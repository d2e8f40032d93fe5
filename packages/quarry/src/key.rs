//! The key contract and fingerprinting rules.
//!
//! A key is the unit of computation: a typed record with a declared
//! version, dependency versions that aggregate into an effective version,
//! and a `compute` function the engine invokes on cache misses. Equal keys
//! must fingerprint to equal bytes across runs.

use std::{
    collections::{HashMap, HashSet},
    sync::RwLock,
};

use async_trait::async_trait;
use tracing::instrument;
use uuid::Uuid;

use crate::{
    engine::FunctionInterface,
    error::{CodecError, EngineError},
    flags,
    id::DataId,
    resource::ResourceRegistry,
    value::SharedValue,
};

/// A user-declared key.
///
/// Keys are request-scoped: the engine never retains them past the
/// resolution of their fingerprint.
#[async_trait]
pub trait BuildKey: Send + Sync + 'static {
    /// Globally unique type identifier; must be registered with the
    /// engine's [`KeyRegistry`].
    fn key_type(&self) -> &'static str;

    /// The key's fields, reflected for flag encoding.
    ///
    /// Fields that wrap a [`DataId`] with extra metadata contribute their
    /// full encoding, preserving semantic identity.
    fn fields(&self) -> Result<serde_json::Value, CodecError>;

    /// Volatile keys bypass the function cache entirely, but are still
    /// deduplicated in flight.
    fn volatile(&self) -> bool {
        false
    }

    /// Names of host resources this key may access.
    fn entitlements(&self) -> Vec<String> {
        Vec::new()
    }

    /// Short human-readable form, used in error paths.
    fn describe(&self) -> String {
        self.key_type().to_string()
    }

    /// Produce the key's value, requesting other keys and spawning actions
    /// through `fi`.
    async fn compute(&self, fi: &FunctionInterface) -> Result<SharedValue, EngineError>;

    /// Reject a cached value even when its fingerprint matches.
    fn validate_cached(&self, _value: &SharedValue) -> bool {
        true
    }

    /// Offer a replacement for a rejected cached value; `None` forces
    /// recomputation.
    async fn fix_cached(
        &self,
        _value: SharedValue,
        _fi: &FunctionInterface,
    ) -> Result<Option<SharedValue>, EngineError> {
        Ok(None)
    }
}

/// Static description of a key type, registered at engine construction.
#[derive(Clone, Debug, Default)]
pub struct KeyInfo {
    /// Declared version of the key type's semantics.
    pub version: i64,
    /// Key types whose effective versions fold into this one.
    pub version_dependencies: Vec<&'static str>,
    /// Action types included in the aggregate version.
    pub action_dependencies: Vec<&'static str>,
}

impl KeyInfo {
    pub fn versioned(version: i64) -> Self {
        Self {
            version,
            ..Self::default()
        }
    }
}

/// Registry of key types and their memoized effective versions.
#[derive(Default)]
pub struct KeyRegistry {
    infos: HashMap<&'static str, KeyInfo>,
    effective: RwLock<HashMap<&'static str, i64>>,
}

impl KeyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, key_type: &'static str, info: KeyInfo) {
        self.infos.insert(key_type, info);
    }

    pub fn contains(&self, key_type: &str) -> bool {
        self.infos.contains_key(key_type)
    }

    /// The declared version plus all transitive dependency versions.
    ///
    /// Computed once per key type. Changing any declared dependency's
    /// version changes every dependent fingerprint.
    pub fn effective_version(&self, key_type: &str) -> Result<i64, EngineError> {
        if let Some(&version) = self.effective.read().expect("lock poisoned").get(key_type) {
            return Ok(version);
        }
        let mut visiting = HashSet::new();
        let version = self.effective_version_inner(key_type, &mut visiting)?;
        if let Some(key) = self.infos.get_key_value(key_type).map(|(key, _)| *key) {
            self.effective
                .write()
                .expect("lock poisoned")
                .insert(key, version);
        }
        Ok(version)
    }

    fn effective_version_inner(
        &self,
        key_type: &str,
        visiting: &mut HashSet<String>,
    ) -> Result<i64, EngineError> {
        let info = self
            .infos
            .get(key_type)
            .ok_or_else(|| EngineError::UnknownKeyIdentifier(key_type.to_string()))?;
        if !visiting.insert(key_type.to_string()) {
            // A version-dependency cycle contributes each type once.
            return Ok(0);
        }
        let mut version = info.version;
        for dependency in info
            .version_dependencies
            .iter()
            .chain(info.action_dependencies.iter())
        {
            version = version.wrapping_add(self.effective_version_inner(dependency, visiting)?);
        }
        visiting.remove(key_type);
        Ok(version)
    }
}

/// Compute a key's fingerprint.
///
/// The fingerprint is blake3 over the type identifier, the sorted flag
/// tokens of the fields, the effective version, and the contributions of
/// entitled resources. It is both the cache key and the in-flight
/// deduplication key.
#[instrument(skip_all, fields(key = key.key_type()))]
pub fn fingerprint(
    key: &dyn BuildKey,
    keys: &KeyRegistry,
    resources: &ResourceRegistry,
    build_id: &Uuid,
) -> Result<DataId, EngineError> {
    if !keys.contains(key.key_type()) {
        return Err(EngineError::UnknownKeyIdentifier(key.key_type().to_string()));
    }
    let tokens = flags::encode_value(&key.fields()?)?;
    let effective = keys.effective_version(key.key_type())?;

    let mut hasher = blake3::Hasher::new();
    hasher.update(key.key_type().as_bytes());
    hasher.update(&[0]);
    for token in &tokens {
        hasher.update(token.as_bytes());
        hasher.update(&[0]);
    }
    hasher.update(&effective.to_le_bytes());

    let mut entitlements = key.entitlements();
    entitlements.sort();
    entitlements.dedup();
    for name in entitlements {
        if let Some(token) = resources.fingerprint_token(&name, build_id) {
            hasher.update(token.as_bytes());
            hasher.update(&[0]);
        }
    }
    Ok(DataId::from_blake3(hasher.finalize()))
}
