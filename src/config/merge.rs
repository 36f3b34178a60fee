//! Deep merge for tiered YAML configuration.
//!
//! Higher tiers override lower tiers key by key. Arrays and scalars are
//! replaced whole.

use serde_json::Value;

/// Deep merge two values, with `overlay` taking precedence over `base`.
///
/// A null in `overlay` means "not specified" and keeps the base value.
///
/// # Example
/// ```
/// use serde_json::json;
/// use project_import::config::deep_merge;
///
/// let base = json!({ "staging": { "prefix": "import_staging_", "orphan_max_age_secs": 3600 } });
/// let overlay = json!({ "staging": { "orphan_max_age_secs": 60 } });
/// let merged = deep_merge(base, overlay);
/// assert_eq!(merged["staging"]["prefix"], "import_staging_");
/// assert_eq!(merged["staging"]["orphan_max_age_secs"], 60);
/// ```
pub fn deep_merge(base: Value, overlay: Value) -> Value {
    match (base, overlay) {
        (Value::Object(mut base_map), Value::Object(overlay_map)) => {
            for (key, overlay_value) in overlay_map {
                let merged_value = match base_map.remove(&key) {
                    Some(base_value) => deep_merge(base_value, overlay_value),
                    None => overlay_value,
                };
                base_map.insert(key, merged_value);
            }
            Value::Object(base_map)
        }
        (base, Value::Null) => base,
        (_, overlay) => overlay,
    }
}

/// Merge values in order, later values taking precedence.
pub fn deep_merge_all(values: impl IntoIterator<Item = Value>) -> Value {
    values.into_iter().fold(Value::Null, deep_merge)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_nested_sections_merge_per_key() {
        let base = json!({
            "database": {"path": "a.db"},
            "staging": {"dir": "stage", "prefix": "p_"}
        });
        let overlay = json!({"staging": {"dir": "/tmp/stage"}});
        assert_eq!(
            deep_merge(base, overlay),
            json!({
                "database": {"path": "a.db"},
                "staging": {"dir": "/tmp/stage", "prefix": "p_"}
            })
        );
    }

    #[test]
    fn test_null_overlay_keeps_base() {
        let base = json!({"load": {"include_global_fields": true}});
        let overlay = json!({"load": {"include_global_fields": null}});
        assert_eq!(
            deep_merge(base, overlay),
            json!({"load": {"include_global_fields": true}})
        );
    }

    #[test]
    fn test_scalar_replaces_object() {
        let base = json!({"staging": {"dir": "x"}});
        let overlay = json!({"staging": "disabled"});
        assert_eq!(deep_merge(base, overlay), json!({"staging": "disabled"}));
    }

    #[test]
    fn test_merge_all_later_wins() {
        let merged = deep_merge_all(vec![
            json!({"a": 1, "b": [1, 2]}),
            json!({"b": [3]}),
            json!({"a": 2}),
        ]);
        assert_eq!(merged, json!({"a": 2, "b": [3]}));
    }
}
