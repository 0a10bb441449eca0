//! Dotted-path addressing into a JSON tree.
//!
//! `"user.profile.name"` addresses `state["user"]["profile"]["name"]`. A
//! numeric segment also indexes into an existing array.

use crate::{error::Result, Error};
use serde_json::{Map, Value};

/// Split a key into path segments. Empty keys and empty segments
/// (`"a..b"`, `".a"`) are rejected.
pub fn parse(key: &str) -> Result<Vec<&str>> {
    if key.is_empty() {
        return Err(Error::InvalidKey(key.to_string()));
    }
    let segments: Vec<&str> = key.split('.').collect();
    if segments.iter().any(|s| s.is_empty()) {
        return Err(Error::InvalidKey(key.to_string()));
    }
    Ok(segments)
}

fn child<'a>(node: &'a Value, segment: &str) -> Option<&'a Value> {
    match node {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    }
}

fn child_mut<'a>(node: &'a mut Value, segment: &str) -> Option<&'a mut Value> {
    match node {
        Value::Object(map) => map.get_mut(segment),
        Value::Array(items) => segment
            .parse::<usize>()
            .ok()
            .and_then(move |i| items.get_mut(i)),
        _ => None,
    }
}

/// Read the value at `path`, or `None` if any segment is missing.
pub fn get<'a>(root: &'a Value, path: &[&str]) -> Option<&'a Value> {
    path.iter().try_fold(root, |node, segment| child(node, segment))
}

/// Write `value` at `path`, creating intermediate objects as needed.
///
/// A scalar in the way is replaced by an empty object; siblings of every
/// segment are left alone. Inside an array a segment must be an existing
/// index or the array length, which appends. Any other segment is rejected
/// before the tree is touched. Returns the previous value.
pub fn set(root: &mut Value, path: &[&str], value: Value) -> Result<Option<Value>> {
    let Some((last, parents)) = path.split_last() else {
        return Ok(Some(std::mem::replace(root, value)));
    };
    let invalid = |_| Error::InvalidKey(path.join("."));

    // Only existing containers are walked before the first insert, and
    // everything below a fresh object is fresh, so a rejection never
    // leaves a partial write behind.
    let mut node = root;
    for segment in parents {
        if !matches!(child(node, segment), Some(Value::Object(_) | Value::Array(_))) {
            insert(node, segment, Value::Object(Map::new())).map_err(invalid)?;
        }
        node = match array_index(node, segment) {
            Some(index) => &mut node[index],
            None => &mut node[*segment],
        };
    }
    insert(node, last, value).map_err(invalid)
}

/// Delete the value at `path`. Returns it if it existed.
pub fn remove(root: &mut Value, path: &[&str]) -> Option<Value> {
    let (last, parents) = path.split_last()?;
    let mut node = root;
    for segment in parents {
        node = child_mut(node, segment)?;
    }
    match node {
        Value::Object(map) => map.remove(*last),
        Value::Array(items) => {
            let index = last.parse::<usize>().ok().filter(|i| *i < items.len())?;
            Some(items.remove(index))
        }
        _ => None,
    }
}

/// Merge `source` into `target`. Objects merge key by key, recursively;
/// anything else in `source` replaces what is in `target`.
pub fn deep_merge(target: &mut Value, source: &Value) {
    match (target, source) {
        (Value::Object(target), Value::Object(source)) => {
            for (key, value) in source {
                let nested = value.is_object() && target.get(key).is_some_and(Value::is_object);
                match target.get_mut(key) {
                    Some(existing) if nested => deep_merge(existing, value),
                    _ => {
                        target.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (target, source) => *target = source.clone(),
    }
}

fn array_index(node: &Value, segment: &str) -> Option<usize> {
    match node {
        Value::Array(items) => segment.parse::<usize>().ok().filter(|i| *i < items.len()),
        _ => None,
    }
}

/// Array segment that is neither an index nor the append position.
struct OutOfRange;

fn insert(
    node: &mut Value,
    segment: &str,
    value: Value,
) -> std::result::Result<Option<Value>, OutOfRange> {
    match node {
        Value::Array(items) => match segment.parse::<usize>() {
            Ok(i) if i < items.len() => Ok(Some(std::mem::replace(&mut items[i], value))),
            Ok(i) if i == items.len() => {
                items.push(value);
                Ok(None)
            }
            _ => Err(OutOfRange),
        },
        Value::Object(map) => Ok(map.insert(segment.to_string(), value)),
        other => {
            let mut map = Map::new();
            map.insert(segment.to_string(), value);
            *other = Value::Object(map);
            Ok(None)
        }
    }
}
