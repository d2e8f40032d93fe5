//! Host-side resources: named singletons with a fingerprint lifetime.
//!
//! A resource's contents never serialize; only its lifetime decides what
//! (if anything) it contributes to dependent fingerprints.

use std::{any::Any, collections::HashMap, sync::Arc};

use uuid::Uuid;

/// How long one logical resource value lasts, and what it contributes to
/// fingerprints of entitled keys.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum ResourceLifetime {
    /// One logical value for all builds; fingerprinting ignores it.
    Idempotent,
    /// Bumping the version invalidates dependent cache entries.
    Versioned(u32),
    /// Scoped to one engine run; fingerprints include the build id so
    /// values never cross engine lifetimes.
    RequestOnly,
}

/// Shared handle to an untyped resource value.
pub type ResourceValue = Arc<dyn Any + Send + Sync>;

struct ResourceEntry {
    lifetime: ResourceLifetime,
    value: ResourceValue,
}

/// The set of resources available to one engine instance.
#[derive(Default)]
pub struct ResourceRegistry {
    entries: HashMap<String, ResourceEntry>,
}

impl ResourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a resource. Re-registering a name replaces the value.
    pub fn register(
        &mut self,
        name: impl Into<String>,
        lifetime: ResourceLifetime,
        value: ResourceValue,
    ) {
        self.entries
            .insert(name.into(), ResourceEntry { lifetime, value });
    }

    /// Fetch a resource's value by name.
    pub fn get(&self, name: &str) -> Option<ResourceValue> {
        self.entries.get(name).map(|entry| Arc::clone(&entry.value))
    }

    /// Fetch and downcast a resource's value.
    pub fn get_as<T: Send + Sync + 'static>(&self, name: &str) -> Option<Arc<T>> {
        self.get(name).and_then(|value| value.downcast::<T>().ok())
    }

    pub fn lifetime(&self, name: &str) -> Option<ResourceLifetime> {
        self.entries.get(name).map(|entry| entry.lifetime)
    }

    /// The fingerprint contribution of a resource, if it has one.
    pub fn fingerprint_token(&self, name: &str, build_id: &Uuid) -> Option<String> {
        match self.entries.get(name)?.lifetime {
            ResourceLifetime::Idempotent => None,
            ResourceLifetime::Versioned(version) => {
                Some(format!("resource.{name}.version={version}"))
            }
            ResourceLifetime::RequestOnly => Some(format!("resource.{name}.build={build_id}")),
        }
    }
}
