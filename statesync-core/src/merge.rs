//! Recursive merge of two JSON values.
//!
//! Rules, by the shape of the pair:
//! - object + object: merge key by key, recursing on shared keys
//! - array + array: local items then remote items, first occurrence kept
//! - anything else: the remote value

use serde_json::{Map, Value};

/// Merge `remote` into `local`, preferring remote on leaf collisions.
pub fn merge_values(local: &Value, remote: &Value) -> Value {
    match (local, remote) {
        (Value::Object(l), Value::Object(r)) => Value::Object(merge_objects(l, r)),
        (Value::Array(l), Value::Array(r)) => Value::Array(concat_unique(l, r)),
        (_, remote) => remote.clone(),
    }
}

fn merge_objects(local: &Map<String, Value>, remote: &Map<String, Value>) -> Map<String, Value> {
    let mut out = local.clone();
    for (key, remote_value) in remote {
        let merged = match local.get(key) {
            Some(local_value) => merge_values(local_value, remote_value),
            None => remote_value.clone(),
        };
        out.insert(key.clone(), merged);
    }
    out
}

// `Value` has no `Hash`, so uniqueness is checked by equality scan.
fn concat_unique(local: &[Value], remote: &[Value]) -> Vec<Value> {
    let mut out: Vec<Value> = Vec::with_capacity(local.len() + remote.len());
    for item in local.iter().chain(remote) {
        if !out.contains(item) {
            out.push(item.clone());
        }
    }
    out
}
