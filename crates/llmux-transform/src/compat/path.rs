use serde_json::{Map, Value};

/// Reads a dotted path; any missing or non-object intermediate yields `None`.
pub fn get_path<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = value;
    for segment in path.split('.') {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}

/// Writes a dotted path, creating intermediate objects as needed.
///
/// An existing non-object intermediate is never replaced; the write is
/// refused instead (returns false).
pub fn set_path(target: &mut Value, path: &str, new_value: Value) -> bool {
    if !target.is_object() {
        return false;
    }
    let segments: Vec<&str> = path.split('.').collect();
    let mut current = target;
    for segment in &segments[..segments.len() - 1] {
        let map = match current.as_object_mut() {
            Some(map) => map,
            None => return false,
        };
        let entry = map
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if !entry.is_object() {
            return false;
        }
        current = entry;
    }
    let Some(last) = segments.last() else {
        return false;
    };
    match current.as_object_mut() {
        Some(map) => {
            map.insert(last.to_string(), new_value);
            true
        }
        None => false,
    }
}

/// Removes a dotted path, returning the removed value if present.
pub fn remove_path(target: &mut Value, path: &str) -> Option<Value> {
    let (parent_path, last) = match path.rsplit_once('.') {
        Some((parent, last)) => (Some(parent), last),
        None => (None, path),
    };
    let parent = match parent_path {
        Some(parent_path) => {
            let mut current = target;
            for segment in parent_path.split('.') {
                current = current.as_object_mut()?.get_mut(segment)?;
            }
            current
        }
        None => target,
    };
    parent.as_object_mut()?.remove(last)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn get_missing_segment_is_none() {
        let value = json!({"a": {"b": 1}});
        assert_eq!(get_path(&value, "a.b"), Some(&json!(1)));
        assert_eq!(get_path(&value, "a.c"), None);
        assert_eq!(get_path(&value, "a.b.c"), None);
    }

    #[test]
    fn set_creates_intermediates() {
        let mut value = json!({});
        assert!(set_path(&mut value, "x.y.z", json!(3)));
        assert_eq!(value, json!({"x": {"y": {"z": 3}}}));
    }

    #[test]
    fn set_never_replaces_scalars_with_objects() {
        let mut value = json!({"x": 1});
        assert!(!set_path(&mut value, "x.y", json!(2)));
        assert_eq!(value, json!({"x": 1}));
    }

    #[test]
    fn remove_returns_the_value() {
        let mut value = json!({"a": {"b": 1}, "c": 2});
        assert_eq!(remove_path(&mut value, "a.b"), Some(json!(1)));
        assert_eq!(remove_path(&mut value, "c"), Some(json!(2)));
        assert_eq!(remove_path(&mut value, "a.b"), None);
    }
}
