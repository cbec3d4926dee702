//! Tagged feature values and the name -> value map they live in.
//!
//! Mirrors the JSON wire form described for request and pool features:
//! `{ "name": { "type": 1|2, "value": <num|string|array> } }`. Type 1 is a
//! numeric scalar or array; type 2 is a string, hashed to an int64 key on
//! intake so the rest of the pipeline only ever deals with numbers.

use std::collections::HashMap;

use serde::Deserialize;
use tracing::warn;

/// A single feature value. Immutable once constructed.
#[derive(Debug, Clone, PartialEq)]
pub enum FeatureValue {
    Int(i64),
    Float(f32),
    IntArray(Vec<i64>),
    FloatArray(Vec<f32>),
}

impl FeatureValue {
    /// The type-zero value for this variant's shape, used when an input is
    /// missing during expression evaluation or placement.
    pub fn zero_like(&self) -> FeatureValue {
        match self {
            FeatureValue::Int(_) => FeatureValue::Int(0),
            FeatureValue::Float(_) => FeatureValue::Float(0.0),
            FeatureValue::IntArray(_) => FeatureValue::IntArray(Vec::new()),
            FeatureValue::FloatArray(_) => FeatureValue::FloatArray(Vec::new()),
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            FeatureValue::Int(v) => Some(*v),
            FeatureValue::Float(v) => Some(*v as i64),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f32> {
        match self {
            FeatureValue::Int(v) => Some(*v as f32),
            FeatureValue::Float(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_int_array(&self) -> Option<&[i64]> {
        match self {
            FeatureValue::IntArray(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_float_array(&self) -> Option<&[f32]> {
        match self {
            FeatureValue::FloatArray(v) => Some(v),
            _ => None,
        }
    }

    /// Number of scalar elements this value would occupy in a GraphIO row.
    pub fn len(&self) -> usize {
        match self {
            FeatureValue::Int(_) | FeatureValue::Float(_) => 1,
            FeatureValue::IntArray(v) => v.len(),
            FeatureValue::FloatArray(v) => v.len(),
        }
    }
}

/// Name -> value mapping. Key order is irrelevant; keys are unique.
pub type FeatureMap = HashMap<String, FeatureValue>;

/// The reserved identifier under which Pool/Placement expose the raw
/// item/pool key string to item and cross expression programs.
pub const RESERVED_ID_KEY: &str = "id";

#[derive(Debug, Deserialize)]
struct RawFeature {
    #[serde(rename = "type")]
    ty: i32,
    value: serde_json::Value,
}

/// Hashes a string to an int64 key. Used both for type=2 JSON intake and for
/// the synthetic `id` feature Pool injects for item programs. Truncation to
/// the low 8 bytes of the digest is a modulo-2^64 reduction.
pub fn hash_str_to_i64(s: &str) -> i64 {
    let digest = blake3::hash(s.as_bytes());
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&digest.as_bytes()[..8]);
    i64::from_le_bytes(buf)
}

/// Parses a request/pool feature JSON blob into a `FeatureMap`.
///
/// Fail-open: a JSON syntax error yields an empty map (the caller logs the
/// failing line/request). A malformed individual field is skipped with a
/// warning rather than failing the whole map.
pub fn parse_feature_map(json: &str) -> FeatureMap {
    let raw: HashMap<String, RawFeature> = match serde_json::from_str(json) {
        Ok(v) => v,
        Err(e) => {
            warn!(error = %e, "malformed feature JSON, using empty feature map");
            return FeatureMap::new();
        }
    };

    let mut out = FeatureMap::with_capacity(raw.len());
    for (name, field) in raw {
        match decode_field(&field) {
            Some(value) => {
                out.insert(name, value);
            }
            None => {
                warn!(feature = %name, "malformed feature value, skipping field");
            }
        }
    }
    out
}

fn decode_field(field: &RawFeature) -> Option<FeatureValue> {
    match field.ty {
        1 => decode_numeric(&field.value),
        2 => decode_string(&field.value),
        _ => None,
    }
}

fn decode_numeric(value: &serde_json::Value) -> Option<FeatureValue> {
    match value {
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Some(FeatureValue::Int(i))
            } else {
                n.as_f64().map(|f| FeatureValue::Float(f as f32))
            }
        }
        serde_json::Value::Array(arr) => {
            if arr.is_empty() {
                return Some(FeatureValue::FloatArray(Vec::new()));
            }
            let all_int = arr.iter().all(|v| v.as_i64().is_some());
            if all_int {
                let ints: Option<Vec<i64>> = arr.iter().map(|v| v.as_i64()).collect();
                ints.map(FeatureValue::IntArray)
            } else {
                let floats: Option<Vec<f32>> =
                    arr.iter().map(|v| v.as_f64().map(|f| f as f32)).collect();
                floats.map(FeatureValue::FloatArray)
            }
        }
        _ => None,
    }
}

fn decode_string(value: &serde_json::Value) -> Option<FeatureValue> {
    match value {
        serde_json::Value::String(s) => Some(FeatureValue::Int(hash_str_to_i64(s))),
        serde_json::Value::Array(arr) => {
            let hashes: Option<Vec<i64>> = arr
                .iter()
                .map(|v| v.as_str().map(hash_str_to_i64))
                .collect();
            hashes.map(FeatureValue::IntArray)
        }
        _ => None,
    }
}
