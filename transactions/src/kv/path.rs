//! Dotted sub-document paths over JSON objects.
//!
//! Paths are `.`-separated object keys (`attempts.<id>.st`). Array indexing is
//! not needed by the protocol and not supported.

use serde_json::{Map, Value};

pub fn get<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.')
        .try_fold(root, |node, segment| node.as_object()?.get(segment))
}

/// Walk to the parent object of `path`, creating intermediate objects.
///
/// Returns `None` if an intermediate node exists but is not an object.
fn parent_mut<'a>(root: &'a mut Value, path: &str) -> Option<(&'a mut Map<String, Value>, String)> {
    let mut segments: Vec<&str> = path.split('.').collect();
    let last = segments.pop()?.to_string();
    if !root.is_object() {
        *root = Value::Object(Map::new());
    }
    let mut node = root;
    for segment in segments {
        let map = node.as_object_mut()?;
        node = map
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if !node.is_object() {
            return None;
        }
    }
    Some((node.as_object_mut()?, last))
}

/// Set `path`, creating parents. Returns false if a parent is not an object.
pub fn upsert(root: &mut Value, path: &str, value: Value) -> bool {
    match parent_mut(root, path) {
        Some((map, key)) => {
            map.insert(key, value);
            true
        }
        None => false,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    AlreadyExists,
    BadParent,
}

/// Set `path` only if it is absent.
pub fn insert(root: &mut Value, path: &str, value: Value) -> InsertOutcome {
    match parent_mut(root, path) {
        Some((map, key)) => {
            if map.contains_key(&key) {
                InsertOutcome::AlreadyExists
            } else {
                map.insert(key, value);
                InsertOutcome::Inserted
            }
        }
        None => InsertOutcome::BadParent,
    }
}

/// Remove `path`, returning the removed value if it was present.
pub fn remove(root: &mut Value, path: &str) -> Option<Value> {
    let (parent_path, key) = match path.rsplit_once('.') {
        Some((parent, key)) => (Some(parent), key),
        None => (None, path),
    };
    let parent = match parent_path {
        Some(p) => path_mut(root, p)?,
        None => root,
    };
    parent.as_object_mut()?.remove(key)
}

fn path_mut<'a>(root: &'a mut Value, path: &str) -> Option<&'a mut Value> {
    path.split('.')
        .try_fold(root, |node, segment| node.as_object_mut()?.get_mut(segment))
}
