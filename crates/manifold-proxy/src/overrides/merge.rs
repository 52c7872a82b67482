//! Schema merge strategies.
//!
//! Three ways an override rewrites a tool's input schema: wholesale
//! replacement, shallow top-level merge, and recursive deep merge. The deep
//! merge is non-mutating and guards against pathological node graphs with
//! an identity set of visited nodes plus a depth bound; on either trip it
//! keeps the original subtree.

use std::collections::HashSet;

use serde_json::{Map, Value, json};

/// Recursion bound for the deep merge.
const MAX_MERGE_DEPTH: usize = 64;

/// Replace the schema's properties and required list wholesale, keeping the
/// declared type.
#[must_use]
pub fn replace_schema(
    original: &Value,
    properties: Option<&Map<String, Value>>,
    required: Option<&[String]>,
) -> Value {
    let schema_type = original
        .get("type")
        .cloned()
        .unwrap_or_else(|| Value::String("object".to_string()));
    json!({
        "type": schema_type,
        "properties": properties.cloned().unwrap_or_default(),
        "required": required.map(<[String]>::to_vec).unwrap_or_default(),
    })
}

/// Shallow merge: override's property entries win per key at the top
/// level; the original `required` list is preserved unless the override
/// provides one explicitly.
#[must_use]
pub fn shallow_merge_schema(
    original: &Value,
    properties: Option<&Map<String, Value>>,
    required: Option<&[String]>,
) -> Value {
    let mut merged = original.clone();
    let target = merged
        .as_object_mut()
        .map(|obj| obj.entry("properties").or_insert_with(|| json!({})));
    if let (Some(Value::Object(target)), Some(patch)) = (target, properties) {
        for (key, value) in patch {
            target.insert(key.clone(), value.clone());
        }
    }
    if let (Some(obj), Some(required)) = (merged.as_object_mut(), required) {
        obj.insert("required".to_string(), json!(required));
    }
    merged
}

/// Deep merge `patch` into `original`, producing a new value.
///
/// Objects merge key-by-key recursively; primitives and arrays from the
/// patch replace the original. A node revisited along the current path (or
/// nesting past the depth bound) stops recursion and keeps the original
/// subtree.
#[must_use]
pub fn deep_merge(original: &Value, patch: &Value) -> Value {
    let mut visited = HashSet::new();
    deep_merge_inner(original, patch, &mut visited, 0)
}

fn deep_merge_inner(
    original: &Value,
    patch: &Value,
    visited: &mut HashSet<usize>,
    depth: usize,
) -> Value {
    let (Value::Object(original_map), Value::Object(patch_map)) = (original, patch) else {
        return patch.clone();
    };

    if depth >= MAX_MERGE_DEPTH {
        return original.clone();
    }
    // Identity check: a node already on the current path means a cycle in
    // the input graph; keep the original subtree rather than recurse.
    let patch_identity = std::ptr::from_ref(patch) as usize;
    if !visited.insert(patch_identity) {
        return original.clone();
    }

    let mut merged = original_map.clone();
    for (key, patch_value) in patch_map {
        let next = match original_map.get(key) {
            Some(original_value) => {
                deep_merge_inner(original_value, patch_value, visited, depth + 1)
            }
            None => patch_value.clone(),
        };
        merged.insert(key.clone(), next);
    }

    visited.remove(&patch_identity);
    Value::Object(merged)
}
