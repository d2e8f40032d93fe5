//! Flag-token encoding of structured records.
//!
//! Key fields fingerprint as a sorted, duplicate-free sequence of
//! `--field.path=value` tokens: nested structures flatten by dotted paths,
//! container items by index. The encoding is the stable textual identity of
//! a key, so it must be deterministic for equal values.

use std::collections::BTreeSet;

use serde::{Serialize, de::DeserializeOwned};
use serde_json::{Map, Value};
use tracing::instrument;

use crate::error::CodecError;

/// Encode a record to sorted flag tokens.
pub fn encode<T: Serialize>(value: &T) -> Result<Vec<String>, CodecError> {
    let value = serde_json::to_value(value).map_err(CodecError::Encode)?;
    encode_value(&value)
}

/// Encode an already-reflected record.
pub fn encode_value(value: &Value) -> Result<Vec<String>, CodecError> {
    let mut tokens = BTreeSet::new();
    flatten("", value, &mut tokens);
    Ok(tokens.into_iter().collect())
}

fn flatten(prefix: &str, value: &Value, tokens: &mut BTreeSet<String>) {
    match value {
        // Absent fields contribute nothing.
        Value::Null => {}
        Value::Bool(flag) => {
            tokens.insert(format!("--{prefix}={flag}"));
        }
        Value::Number(number) => {
            tokens.insert(format!("--{prefix}={number}"));
        }
        Value::String(text) => {
            tokens.insert(format!("--{prefix}={text}"));
        }
        Value::Array(items) => {
            for (index, item) in items.iter().enumerate() {
                flatten(&child_path(prefix, &index.to_string()), item, tokens);
            }
        }
        Value::Object(fields) => {
            for (name, field) in fields {
                flatten(&child_path(prefix, name), field, tokens);
            }
        }
    }
}

fn child_path(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{prefix}.{name}")
    }
}

/// Decode flag tokens back into a record.
///
/// The bare flag form `--a` is accepted as `--a=true`. Scalars are tried as
/// bool, integer, float, then string.
#[instrument(skip(tokens))]
pub fn decode<T: DeserializeOwned>(
    tokens: impl IntoIterator<Item = impl AsRef<str>>,
) -> Result<T, CodecError> {
    let value = decode_value(tokens)?;
    serde_json::from_value(value).map_err(CodecError::Decode)
}

/// Decode flag tokens into a reflected record.
pub fn decode_value(
    tokens: impl IntoIterator<Item = impl AsRef<str>>,
) -> Result<Value, CodecError> {
    let mut root = Value::Object(Map::new());
    for token in tokens {
        let token = token.as_ref();
        let stripped = token
            .strip_prefix("--")
            .ok_or_else(|| CodecError::MalformedToken(token.to_string()))?;
        let (path, raw) = match stripped.split_once('=') {
            Some((path, raw)) => (path, Some(raw)),
            None => (stripped, None),
        };
        if path.is_empty() {
            return Err(CodecError::MalformedToken(token.to_string()));
        }
        let scalar = match raw {
            None => Value::Bool(true),
            Some(raw) => parse_scalar(raw),
        };
        insert_at(&mut root, path, scalar)
            .map_err(|()| CodecError::MalformedToken(token.to_string()))?;
    }
    Ok(lift_arrays(root))
}

fn parse_scalar(raw: &str) -> Value {
    if raw == "true" {
        return Value::Bool(true);
    }
    if raw == "false" {
        return Value::Bool(false);
    }
    if let Ok(int) = raw.parse::<i64>() {
        return Value::Number(int.into());
    }
    if let Ok(unsigned) = raw.parse::<u64>() {
        return Value::Number(unsigned.into());
    }
    if let Ok(float) = raw.parse::<f64>() {
        if let Some(number) = serde_json::Number::from_f64(float) {
            return Value::Number(number);
        }
    }
    Value::String(raw.to_string())
}

fn insert_at(root: &mut Value, path: &str, scalar: Value) -> Result<(), ()> {
    let mut current = root;
    let mut segments = path.split('.').peekable();
    while let Some(segment) = segments.next() {
        let Value::Object(map) = current else {
            // A scalar was already planted where a container is needed.
            return Err(());
        };
        if segments.peek().is_none() {
            map.insert(segment.to_string(), scalar);
            return Ok(());
        }
        current = map
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
    }
    Err(())
}

/// Convert maps whose keys are exactly `0..n` back into arrays.
fn lift_arrays(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let lifted: Map<String, Value> = map
                .into_iter()
                .map(|(name, field)| (name, lift_arrays(field)))
                .collect();
            let indices: Option<Vec<usize>> = lifted
                .keys()
                .map(|name| name.parse::<usize>().ok())
                .collect();
            if let Some(mut indices) = indices {
                if !indices.is_empty() {
                    indices.sort_unstable();
                    if indices.iter().copied().eq(0..indices.len()) {
                        let mut items: Vec<(usize, Value)> = lifted
                            .into_iter()
                            .map(|(name, field)| {
                                (name.parse::<usize>().expect("checked numeric"), field)
                            })
                            .collect();
                        items.sort_by_key(|(index, _)| *index);
                        return Value::Array(items.into_iter().map(|(_, item)| item).collect());
                    }
                }
                return Value::Object(lifted);
            }
            Value::Object(lifted)
        }
        other => other,
    }
}
