//! Copy-on-write get/set/has/delete/merge
//!
//! Every operation takes its input by reference and returns a new tree.
//! Only the nodes along the addressed path are cloned; siblings off the
//! path are shared with the input.

use crate::path::{PathExpression, Segment};
use crate::value::{DataMap, DataValue};
use std::sync::Arc;

/// Most `Null` slots a single write may add past the end of a list
pub const MAX_PADDING: usize = 1024;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum DataError {
    #[error("index {index} is too far past the end of a list of {len} (at most {MAX_PADDING} slots of padding)")]
    PaddingLimit { index: usize, len: usize },
}

/// Read the value at `path`
///
/// Returns `None` when a `Key` step meets a non-map, an `Index` step meets
/// a non-list, or the key/index is absent.
pub fn get<'a>(root: &'a DataValue, path: &str) -> Option<&'a DataValue> {
    get_at(root, &PathExpression::parse(path))
}

pub fn get_at<'a>(root: &'a DataValue, path: &PathExpression) -> Option<&'a DataValue> {
    let mut current = root;
    for segment in path.segments() {
        current = match (segment, current) {
            (Segment::Key(key), DataValue::Map(map)) => map.get(key)?,
            (Segment::Index(index), DataValue::List(items)) => items.get(*index)?,
            _ => return None,
        };
    }
    Some(current)
}

/// Whether a value exists at `path`. A stored `Null` counts as present.
pub fn has(root: &DataValue, path: &str) -> bool {
    get(root, path).is_some()
}

/// Return a new root with `value` placed at `path`
///
/// Missing or mistyped intermediates are replaced with an empty map or
/// list depending on the next segment. Writing past the end of a list
/// pads it with `Null`. The empty path replaces the root.
///
/// A write that would need more than [`MAX_PADDING`] slots of padding
/// leaves the root unchanged; use [`try_set`] to see the failure.
pub fn set(root: &DataValue, path: &str, value: DataValue) -> DataValue {
    try_set(root, path, value).unwrap_or_else(|_| root.clone())
}

/// [`set`], failing instead of padding a list past [`MAX_PADDING`]
pub fn try_set(root: &DataValue, path: &str, value: DataValue) -> Result<DataValue, DataError> {
    set_at(root, &PathExpression::parse(path), value)
}

pub fn set_at(root: &DataValue, path: &PathExpression, value: DataValue) -> Result<DataValue, DataError> {
    set_in(root, path.segments(), value)
}

fn set_in(node: &DataValue, segments: &[Segment], value: DataValue) -> Result<DataValue, DataError> {
    let Some((first, rest)) = segments.split_first() else {
        return Ok(value);
    };

    match first {
        Segment::Key(key) => {
            let mut map = match node {
                DataValue::Map(map) => (**map).clone(),
                _ => DataMap::new(),
            };
            let child = map.get(key).cloned().unwrap_or_default();
            map.insert(key.clone(), set_in(&child, rest, value)?);
            Ok(DataValue::Map(Arc::new(map)))
        }
        Segment::Index(index) => {
            let index = *index;
            let mut items = match node {
                DataValue::List(items) => (**items).clone(),
                _ => Vec::new(),
            };
            if index - index.min(items.len()) > MAX_PADDING {
                return Err(DataError::PaddingLimit {
                    index,
                    len: items.len(),
                });
            }
            if index >= items.len() {
                items.resize(index + 1, DataValue::Null);
            }
            let child = std::mem::take(&mut items[index]);
            items[index] = set_in(&child, rest, value)?;
            Ok(DataValue::List(Arc::new(items)))
        }
    }
}

/// Return a new root with the value at `path` removed
///
/// Removing a list element shifts the later elements down. A path that
/// does not resolve leaves the root unchanged. The empty path yields `Null`.
pub fn delete(root: &DataValue, path: &str) -> DataValue {
    delete_at(root, &PathExpression::parse(path))
}

pub fn delete_at(root: &DataValue, path: &PathExpression) -> DataValue {
    if path.is_empty() {
        return DataValue::Null;
    }
    delete_in(root, path.segments()).unwrap_or_else(|| root.clone())
}

fn delete_in(node: &DataValue, segments: &[Segment]) -> Option<DataValue> {
    let (first, rest) = segments.split_first()?;

    match (first, node) {
        (Segment::Key(key), DataValue::Map(map)) => {
            let replacement = if rest.is_empty() {
                if !map.contains_key(key) {
                    return None;
                }
                None
            } else {
                Some(delete_in(map.get(key)?, rest)?)
            };

            let mut map = (**map).clone();
            match replacement {
                Some(child) => map.insert(key.clone(), child),
                None => map.remove(key),
            };
            Some(DataValue::Map(Arc::new(map)))
        }
        (Segment::Index(index), DataValue::List(items)) => {
            let child = items.get(*index)?;
            let replacement = if rest.is_empty() {
                None
            } else {
                Some(delete_in(child, rest)?)
            };

            let mut items = (**items).clone();
            match replacement {
                Some(child) => items[*index] = child,
                None => {
                    items.remove(*index);
                }
            }
            Some(DataValue::List(Arc::new(items)))
        }
        _ => None,
    }
}

/// Overlay `updates` onto `base`
///
/// Shallow mode copies the top-level entries of `updates` over a clone of
/// `base`. Deep mode recurses where both sides hold a map under the same
/// key and otherwise takes the update. Lists are always replaced whole,
/// never merged element-wise.
///
/// A non-map `base` is treated as an empty map. A non-map `updates`
/// replaces `base` outright.
pub fn merge(base: &DataValue, updates: &DataValue, deep: bool) -> DataValue {
    let Some(update_map) = updates.as_map() else {
        return updates.clone();
    };

    let mut merged = base.as_map().cloned().unwrap_or_default();
    for (key, update) in update_map {
        let value = match (deep, merged.get(key), update) {
            (true, Some(existing @ DataValue::Map(_)), DataValue::Map(_)) => {
                merge(existing, update, true)
            }
            _ => update.clone(),
        };
        merged.insert(key.clone(), value);
    }

    DataValue::Map(Arc::new(merged))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn data(value: serde_json::Value) -> DataValue {
        DataValue::from(value)
    }

    fn world() -> DataValue {
        data(json!({
            "players": [
                {"name": "alice", "hp": 3},
                {"name": "bob", "hp": 5}
            ],
            "settings": {"pvp": false, "spawn": {"x": 30, "y": 30}},
            "motd": "hello"
        }))
    }

    #[test]
    fn test_get() {
        let root = world();
        assert_eq!(get(&root, "players[1].name"), Some(&DataValue::from("bob")));
        assert_eq!(get(&root, "settings.spawn.x"), Some(&DataValue::Int(30)));
        assert_eq!(get(&root, ""), Some(&root));
    }

    #[test]
    fn test_get_absent_never_fails() {
        let root = world();
        assert!(get(&root, "players[7].name").is_none());
        assert!(get(&root, "motd.length").is_none());
        assert!(get(&root, "settings[0]").is_none());
        assert!(get(&root, "players.name").is_none());
        assert!(get(&DataValue::Null, "a.b").is_none());
    }

    #[test]
    fn test_has_counts_null() {
        let root = data(json!({"a": null}));
        assert!(has(&root, "a"));
        assert!(!has(&root, "b"));
    }

    #[test]
    fn test_set_roundtrip() {
        let root = world();
        for path in ["motd", "settings.spawn.z", "players[0].hp", "players[4].name", "new.deep.key"] {
            let value = data(json!({"marker": path}));
            let updated = set(&root, path, value.clone());
            assert_eq!(get(&updated, path), Some(&value), "path {}", path);
        }
    }

    #[test]
    fn test_set_empty_path_replaces_root() {
        let root = world();
        assert_eq!(set(&root, "", DataValue::Int(1)), DataValue::Int(1));
    }

    #[test]
    fn test_set_creates_containers() {
        let updated = set(&DataValue::Null, "a.list[2].b", DataValue::Bool(true));
        assert_eq!(updated.to_json(), json!({"a": {"list": [null, null, {"b": true}]}}));

        // Mistyped intermediate is replaced
        let updated = set(&data(json!({"a": 5})), "a.b", DataValue::Int(1));
        assert_eq!(updated.to_json(), json!({"a": {"b": 1}}));
    }

    #[test]
    fn test_set_padding_is_bounded() {
        let root = data(json!({"a": [1]}));
        let padded = try_set(&root, &format!("a[{}]", MAX_PADDING + 1), DataValue::Int(2)).unwrap();
        assert_eq!(get(&padded, "a").and_then(DataValue::as_list).map(|items| items.len()), Some(MAX_PADDING + 2));

        for path in ["a[99999999999]", "a[18446744073709551615]", "fresh[5000].x"] {
            let err = try_set(&root, path, DataValue::Int(1)).unwrap_err();
            assert!(matches!(err, DataError::PaddingLimit { .. }), "path {}", path);
            assert_eq!(set(&root, path, DataValue::Int(1)), root, "path {}", path);
        }
    }

    #[test]
    fn test_set_shares_siblings() {
        let root = world();
        let updated = set(&root, "settings.pvp", DataValue::Bool(true));

        let before = get(&root, "players").unwrap();
        let after = get(&updated, "players").unwrap();
        assert!(before.shares_with(after));

        let spawn_before = get(&root, "settings.spawn").unwrap();
        let spawn_after = get(&updated, "settings.spawn").unwrap();
        assert!(spawn_before.shares_with(spawn_after));

        assert!(!get(&root, "settings").unwrap().shares_with(get(&updated, "settings").unwrap()));
    }

    #[test]
    fn test_operations_do_not_mutate_input() {
        let root = world();
        let snapshot = root.to_json();

        let _ = set(&root, "players[0].hp", DataValue::Int(0));
        let _ = delete(&root, "players[0]");
        let _ = delete(&root, "settings.spawn.x");
        let _ = merge(&root, &data(json!({"settings": {"pvp": true}})), true);
        let _ = merge(&root, &data(json!({"motd": "bye"})), false);

        assert_eq!(root.to_json(), snapshot);
    }

    #[test]
    fn test_delete_key() {
        let root = world();
        let updated = delete(&root, "settings.spawn");
        assert_eq!(updated.to_json()["settings"], json!({"pvp": false}));
    }

    #[test]
    fn test_delete_index_shifts() {
        let root = data(json!({"list": [1, 2, 3, 4]}));
        let updated = delete(&root, "list[1]");
        assert_eq!(updated.to_json(), json!({"list": [1, 3, 4]}));
    }

    #[test]
    fn test_delete_missing_is_identity() {
        let root = world();
        let updated = delete(&root, "settings.nothing.here");
        assert!(updated.shares_with(&root));
        let updated = delete(&root, "players[9]");
        assert!(updated.shares_with(&root));
    }

    #[test]
    fn test_delete_after_set_restores_shape() {
        let root = world();
        for path in ["fresh", "settings.fresh", "players[1].fresh"] {
            let added = set(&root, path, DataValue::from("leaf"));
            assert_eq!(delete(&added, path), delete(&root, path), "path {}", path);
        }
    }

    #[test]
    fn test_delete_empty_path() {
        assert_eq!(delete(&world(), ""), DataValue::Null);
    }

    #[test]
    fn test_merge_identity() {
        let root = world();
        let empty = DataValue::empty_map();
        assert_eq!(merge(&root, &empty, false), root);
        assert_eq!(merge(&root, &empty, true), root);
    }

    #[test]
    fn test_shallow_merge() {
        let root = world();
        let updated = merge(&root, &data(json!({"settings": {"pvp": true}, "extra": 1})), false);

        assert_eq!(updated.to_json()["settings"], json!({"pvp": true}));
        assert_eq!(updated.to_json()["extra"], json!(1));
        assert!(get(&updated, "players").unwrap().shares_with(get(&root, "players").unwrap()));
        assert_eq!(get(&updated, "motd"), get(&root, "motd"));
    }

    #[test]
    fn test_deep_merge_preserves_siblings() {
        let base = data(json!({"tag": {"a": 1, "b": {"x": 1}}}));
        let updates = data(json!({"tag": {"b": {"y": 2}}}));
        let merged = merge(&base, &updates, true);
        assert_eq!(merged.to_json(), json!({"tag": {"a": 1, "b": {"x": 1, "y": 2}}}));
    }

    #[test]
    fn test_deep_merge_replaces_lists() {
        let base = data(json!({"items": [1, 2, 3], "nested": {"items": [1]}}));
        let updates = data(json!({"items": [9], "nested": {"items": [7, 8]}}));
        let merged = merge(&base, &updates, true);
        assert_eq!(merged.to_json(), json!({"items": [9], "nested": {"items": [7, 8]}}));
    }

    #[test]
    fn test_merge_non_map_sides() {
        let merged = merge(&DataValue::Int(1), &data(json!({"a": 1})), true);
        assert_eq!(merged.to_json(), json!({"a": 1}));
        let merged = merge(&world(), &DataValue::from("replace"), false);
        assert_eq!(merged, DataValue::from("replace"));
    }
}
