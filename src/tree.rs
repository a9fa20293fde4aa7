//! Tree primitives over a bare nested JSON mapping.
//!
//! These functions know nothing about metadata, expiry or listeners; the
//! store layers those on top. They are usable on their own for building or
//! inspecting trees.

use crate::path::{self, Selector};
use crate::types::{is_empty, keys_of, size_of, ValueType};
use serde_json::{Map, Value};

/// Structural lookup of `key` (no selector). Objects are walked by key and
/// arrays by numeric index. `null` reads as missing.
pub fn tree_lookup<'a>(root: &'a Map<String, Value>, key: &str) -> Option<&'a Value> {
    let mut segments = path::segments(key).into_iter();
    let first = segments.next()?;
    let mut current = root.get(first)?;
    for segment in segments {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    if current.is_null() {
        None
    } else {
        Some(current)
    }
}

/// Read a path, honoring the `$keys`, `$type` and `$size` selectors.
///
/// The empty path reads the whole root. `$meta` and unknown selectors read
/// as undefined here; metadata lives outside the bare tree.
pub fn tree_get(root: &Map<String, Value>, path: &str) -> Option<Value> {
    let (key, selector) = path::split(path);
    let root_value;
    let node = if key.is_empty() {
        root_value = Value::Object(root.clone());
        Some(&root_value)
    } else {
        tree_lookup(root, key)
    };

    match selector {
        None => node.cloned(),
        Some(raw) => match Selector::parse(raw)? {
            Selector::Keys => Some(Value::from(keys_of(node))),
            Selector::Type => Some(Value::from(ValueType::of(node).as_str())),
            Selector::Size => Some(Value::from(size_of(node))),
            Selector::Meta | Selector::Deep | Selector::Save => None,
        },
    }
}

/// Write `value` at `path`, creating intermediate objects as needed.
///
/// Arrays are containers addressed by index: an index past the end pads
/// the array with nulls. Scalars, and arrays addressed by a non-numeric
/// segment, are replaced by objects. Writing an empty or absent value
/// deletes the path instead. Returns false when the path is not writable.
pub fn tree_set(root: &mut Map<String, Value>, path: &str, value: Value) -> bool {
    if !path::is_writable(path) {
        return false;
    }
    if is_empty(Some(&value)) {
        tree_del(root, path);
        return true;
    }
    if let [first, rest @ ..] = path::segments(path).as_slice() {
        let slot = root.entry((*first).to_string()).or_insert(Value::Null);
        set_in(slot, rest, value);
    }
    true
}

fn set_in(slot: &mut Value, segments: &[&str], value: Value) {
    let [segment, rest @ ..] = segments else {
        *slot = value;
        return;
    };
    let index = segment.parse::<usize>().ok();
    let accepts = match slot {
        Value::Object(_) => true,
        Value::Array(_) => index.is_some(),
        _ => false,
    };
    if !accepts {
        *slot = Value::Object(Map::new());
    }
    let child = match (slot, index) {
        (Value::Object(map), _) => map.entry((*segment).to_string()).or_insert(Value::Null),
        (Value::Array(items), Some(i)) => {
            if items.len() <= i {
                items.resize(i + 1, Value::Null);
            }
            &mut items[i]
        }
        _ => return,
    };
    set_in(child, rest, value);
}

/// Remove `path`, pruning every ancestor container the removal leaves empty.
/// Returns whether anything was removed.
pub fn tree_del(root: &mut Map<String, Value>, path: &str) -> bool {
    if !path::is_writable(path) {
        return false;
    }
    remove_in(root, &path::segments(path))
}

fn remove_in(map: &mut Map<String, Value>, segments: &[&str]) -> bool {
    match segments {
        [] => false,
        [last] => map.remove(*last).is_some(),
        [first, rest @ ..] => match map.get_mut(*first) {
            Some(child) => {
                let removed = remove_from(child, rest);
                if removed && is_empty(Some(&*child)) {
                    map.remove(*first);
                }
                removed
            }
            None => false,
        },
    }
}

/// Remove below a container value. A removed array element leaves a null
/// hole so later indices keep their meaning; trailing holes are trimmed.
fn remove_from(node: &mut Value, segments: &[&str]) -> bool {
    let [segment, rest @ ..] = segments else {
        return false;
    };
    match node {
        Value::Object(map) => remove_in(map, segments),
        Value::Array(items) => {
            let Some(slot) = segment.parse::<usize>().ok().and_then(|i| items.get_mut(i)) else {
                return false;
            };
            let removed = if rest.is_empty() {
                !std::mem::take(slot).is_null()
            } else {
                let removed = remove_from(slot, rest);
                if removed && is_empty(Some(&*slot)) {
                    *slot = Value::Null;
                }
                removed
            };
            if removed {
                while items.last().map_or(false, Value::is_null) {
                    items.pop();
                }
            }
            removed
        }
        _ => false,
    }
}

/// Remove several paths; returns the ones that were actually present.
pub fn tree_del_many<I, S>(root: &mut Map<String, Value>, paths: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    paths
        .into_iter()
        .filter(|p| tree_del(root, p.as_ref()))
        .map(|p| p.as_ref().to_string())
        .collect()
}

/// Every leaf path in the tree. Non-empty objects are descended into;
/// anything else (scalars, arrays, empty objects) is a leaf. An object
/// with a key that cannot be addressed as a path segment is a leaf too.
pub fn leaf_paths(root: &Map<String, Value>) -> Vec<String> {
    let mut out = Vec::new();
    collect_leaves(root, "", &mut out);
    out
}

fn collect_leaves(map: &Map<String, Value>, prefix: &str, out: &mut Vec<String>) {
    for (key, value) in map {
        let full = path::join(prefix, key);
        match value {
            Value::Object(child) if !child.is_empty() && child.keys().all(|k| addressable(k)) => {
                collect_leaves(child, &full, out)
            }
            _ => out.push(full),
        }
    }
}

fn addressable(key: &str) -> bool {
    !key.is_empty() && !key.contains(path::SEPARATOR) && !key.contains(path::SELECTOR_MARK)
}
