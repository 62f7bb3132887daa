//! Canonical cache keys for polled queries.
//!
//! A `CacheKey` can only be produced by [`KeyCodec::encode`], so every key in
//! the store is already canonical: parameter order never matters and two keys
//! compare equal exactly when they denote the same logical query.

use crate::error::KeyError;
use serde_json::{Number, Value};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// Canonical identifier for one logical query (entity + parameters).
///
/// Cloning is cheap; the key body is shared.
#[derive(Clone)]
pub struct CacheKey {
    inner: Arc<KeyInner>,
}

/// Private inner struct - keys cannot be built around the codec.
struct KeyInner {
    entity: String,
    params: BTreeMap<String, Value>,
    canonical: String,
}

impl CacheKey {
    /// The entity name this key queries.
    pub fn entity(&self) -> &str {
        &self.inner.entity
    }

    /// Canonicalised parameters, sorted by name.
    pub fn params(&self) -> &BTreeMap<String, Value> {
        &self.inner.params
    }

    /// The canonical encoded form.
    pub fn as_str(&self) -> &str {
        &self.inner.canonical
    }

    /// Parameters as a JSON object, in canonical order.
    pub fn params_json(&self) -> Value {
        Value::Object(
            self.inner
                .params
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        )
    }
}

impl PartialEq for CacheKey {
    fn eq(&self, other: &Self) -> bool {
        self.inner.canonical == other.inner.canonical
    }
}

impl Eq for CacheKey {}

impl Hash for CacheKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.inner.canonical.hash(state);
    }
}

impl PartialOrd for CacheKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for CacheKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.inner.canonical.cmp(&other.inner.canonical)
    }
}

impl fmt::Debug for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("CacheKey").field(&self.inner.canonical).finish()
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.inner.canonical)
    }
}

/// Deterministic serializer from `(entity, params)` to [`CacheKey`].
///
/// Parameter values must be JSON scalars (string, number, bool, null).
/// Arrays and objects are rejected with `InvalidKeyShape` so keys stay cheap
/// to compare and readable in logs.
#[derive(Debug, Clone, Copy, Default)]
pub struct KeyCodec;

impl KeyCodec {
    /// Encode a query into its canonical key.
    ///
    /// `params` must be a JSON object, or `null` for a parameterless query.
    /// The canonical form is the compact JSON array `[entity, {params}]`
    /// with params sorted by name, which is injective.
    pub fn encode(entity: &str, params: &Value) -> Result<CacheKey, KeyError> {
        if entity.trim().is_empty() {
            return Err(KeyError::EmptyEntity);
        }

        let object = match params {
            Value::Null => None,
            Value::Object(map) => Some(map),
            other => {
                return Err(KeyError::InvalidKeyShape {
                    entity: entity.to_string(),
                    reason: format!("params must be an object, got {}", json_kind(other)),
                })
            }
        };

        let mut canonical_params = BTreeMap::new();
        for (name, value) in object.into_iter().flat_map(|map| map.iter()) {
            let value = canonical_scalar(entity, name, value)?;
            canonical_params.insert(name.clone(), value);
        }

        let canonical = serde_json::to_string(&(entity, &canonical_params)).map_err(|e| {
            KeyError::InvalidKeyShape {
                entity: entity.to_string(),
                reason: e.to_string(),
            }
        })?;

        Ok(CacheKey {
            inner: Arc::new(KeyInner {
                entity: entity.to_string(),
                params: canonical_params,
                canonical,
            }),
        })
    }

    /// Encode a parameterless query.
    pub fn encode_entity(entity: &str) -> Result<CacheKey, KeyError> {
        Self::encode(entity, &Value::Null)
    }
}

/// Validate one parameter value and bring numbers into a single form.
///
/// Integral floats collapse to integers (`1.0` and `1` denote the same
/// query), and negative zero becomes zero.
fn canonical_scalar(entity: &str, name: &str, value: &Value) -> Result<Value, KeyError> {
    match value {
        Value::Null | Value::Bool(_) | Value::String(_) => Ok(value.clone()),
        Value::Number(n) => Ok(Value::Number(canonical_number(n))),
        Value::Array(_) | Value::Object(_) => Err(KeyError::InvalidKeyShape {
            entity: entity.to_string(),
            reason: format!("param '{}' is {}, only scalars are allowed", name, json_kind(value)),
        }),
    }
}

fn canonical_number(n: &Number) -> Number {
    if n.is_i64() || n.is_u64() {
        return n.clone();
    }
    match n.as_f64() {
        Some(f) if f.fract() == 0.0 && (I64_MIN..I64_END).contains(&f) => Number::from(f as i64),
        Some(f) if f.fract() == 0.0 && (I64_END..U64_END).contains(&f) => Number::from(f as u64),
        _ => n.clone(),
    }
}

// `i64::MAX as f64` rounds up to 2^63, so the bounds are spelled out exclusive.
const I64_MIN: f64 = -9_223_372_036_854_775_808.0;
const I64_END: f64 = 9_223_372_036_854_775_808.0;
const U64_END: f64 = 18_446_744_073_709_551_616.0;

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a bool",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
