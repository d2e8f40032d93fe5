//! The value contract: how computed values become CAS objects and back.
//!
//! A value splits into `refs` (ids reachable from the value, kept in the
//! object's refs for GC reachability) and a serde-codable remainder. The
//! stored `data` is a `{type, value}` envelope; decoding goes through the
//! type registry so unknown or mismatched types fail loudly.

use std::{any::Any, collections::HashMap, sync::Arc};

use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::{
    cas::{ContentStore, Object},
    error::{CodecError, EngineError},
    id::DataId,
};

/// A value produced by a key computation.
///
/// Implement via [`CodableValue`] unless the value needs custom reflection.
pub trait BuildValue: Send + Sync + 'static {
    /// Globally unique type identifier.
    fn value_type(&self) -> &'static str;

    /// Ids reachable from this value.
    fn refs(&self) -> Vec<DataId>;

    /// The codable remainder of the value.
    fn to_json(&self) -> Result<serde_json::Value, CodecError>;

    fn as_any(&self) -> &dyn Any;
}

/// Shared handle to a type-erased value.
pub type SharedValue = Arc<dyn BuildValue>;

/// Serde-backed values with a static type id.
///
/// The default `refs` is empty; values carrying [`DataId`]s should return
/// them so stored objects stay reachable.
pub trait CodableValue: Serialize + DeserializeOwned + Send + Sync + 'static {
    const VALUE_TYPE: &'static str;

    fn refs(&self) -> Vec<DataId> {
        Vec::new()
    }
}

impl<T: CodableValue> BuildValue for T {
    fn value_type(&self) -> &'static str {
        T::VALUE_TYPE
    }

    fn refs(&self) -> Vec<DataId> {
        CodableValue::refs(self)
    }

    fn to_json(&self) -> Result<serde_json::Value, CodecError> {
        serde_json::to_value(self).map_err(CodecError::Encode)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[derive(Serialize, Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    value_type: String,
    value: serde_json::Value,
}

/// Encode a value into `(refs, data)` form.
pub fn encode(value: &dyn BuildValue) -> Result<(Vec<DataId>, Vec<u8>), CodecError> {
    let envelope = Envelope {
        value_type: value.value_type().to_string(),
        value: value.to_json()?,
    };
    let data = serde_json::to_vec(&envelope).map_err(CodecError::Encode)?;
    Ok((value.refs(), data))
}

/// Store a value as a CAS object, returning its id.
pub async fn store(
    store: &dyn ContentStore,
    value: &dyn BuildValue,
) -> Result<DataId, EngineError> {
    let (refs, data) = encode(value)?;
    Ok(store.put(refs, data).await?)
}

type Decoder = Arc<dyn Fn(&Object, serde_json::Value) -> Result<SharedValue, EngineError> + Send + Sync>;

/// Registry of decodable value types.
///
/// Every value type a build can produce registers here at engine
/// construction; decoding an unregistered or mismatched type fails with
/// `UnexpectedValueType`.
#[derive(Clone, Default)]
pub struct ValueRegistry {
    decoders: HashMap<&'static str, Decoder>,
}

impl ValueRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a serde-backed value type.
    pub fn register<T: CodableValue>(&mut self) {
        self.decoders.insert(
            T::VALUE_TYPE,
            Arc::new(|_, json| {
                let value: T = serde_json::from_value(json).map_err(CodecError::Decode)?;
                Ok(Arc::new(value) as SharedValue)
            }),
        );
    }

    /// Decode a stored object into a value of any registered type.
    pub fn decode(&self, object: &Object) -> Result<SharedValue, EngineError> {
        let envelope: Envelope =
            serde_json::from_slice(&object.data).map_err(CodecError::Decode)?;
        let decoder = self.decoders.get(envelope.value_type.as_str()).ok_or_else(|| {
            EngineError::UnexpectedValueType {
                expected: String::from("any registered type"),
                actual: envelope.value_type.clone(),
            }
        })?;
        decoder(object, envelope.value)
    }

    /// Decode a stored object, requiring a specific type.
    pub fn decode_as<T: CodableValue>(&self, object: &Object) -> Result<Arc<T>, EngineError> {
        let envelope: Envelope =
            serde_json::from_slice(&object.data).map_err(CodecError::Decode)?;
        if envelope.value_type != T::VALUE_TYPE {
            return Err(EngineError::UnexpectedValueType {
                expected: T::VALUE_TYPE.to_string(),
                actual: envelope.value_type,
            });
        }
        let value: T = serde_json::from_value(envelope.value).map_err(CodecError::Decode)?;
        Ok(Arc::new(value))
    }
}

/// Downcast a shared value to a concrete type.
pub fn downcast<T: BuildValue>(value: &SharedValue) -> Result<&T, EngineError> {
    value
        .as_any()
        .downcast_ref::<T>()
        .ok_or_else(|| EngineError::UnexpectedValueType {
            expected: std::any::type_name::<T>().to_string(),
            actual: value.value_type().to_string(),
        })
}
