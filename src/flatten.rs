//! Depth-bounded flattening of nested JSON objects.
//!
//! Several HubSpot endpoints (forms, campaigns, contact lists) return nested
//! payloads that need to land in flat tables. The flattener joins nested keys
//! with a separator up to a maximum depth; anything deeper is kept as the raw
//! JSON value so no data is lost:
//!
//! ```text
//! {"address": {"city": "Anytown"}}      → {"address_city": "Anytown"}
//! {"a": {"b": {"c": {"d": 1}}}}  (depth 2) → {"a_b_c": {"d": 1}}
//! ```

use serde_json::{Map, Value};

pub const DEFAULT_MAX_FLATTEN_DEPTH: usize = 2;

/// Flattens nested JSON objects into single-level maps.
#[derive(Debug, Clone)]
pub struct Flattener {
    separator: char,
    max_depth: usize,
}

impl Default for Flattener {
    fn default() -> Self {
        Self {
            separator: '_',
            max_depth: DEFAULT_MAX_FLATTEN_DEPTH,
        }
    }
}

impl Flattener {
    pub fn new(separator: char, max_depth: usize) -> Self {
        Self {
            separator,
            max_depth,
        }
    }

    pub fn with_max_depth(max_depth: usize) -> Self {
        Self {
            max_depth,
            ..Self::default()
        }
    }

    /// Flatten a single record. Non-object input produces an empty map.
    pub fn flatten_record(&self, record: &Value) -> Map<String, Value> {
        let mut flat = Map::new();
        if let Value::Object(map) = record {
            for (key, value) in map {
                self.descend(key.clone(), value, 1, &mut flat);
            }
        }
        flat
    }

    // Depth counts nesting levels below the record itself, so a top-level
    // value sits at depth 1. An object at depth <= max_depth is expanded;
    // deeper objects are stored as raw JSON under the joined key.
    fn descend(&self, key: String, value: &Value, depth: usize, out: &mut Map<String, Value>) {
        match value {
            Value::Object(map) if depth <= self.max_depth => {
                for (child_key, child) in map {
                    let joined = format!("{}{}{}", key, self.separator, child_key);
                    self.descend(joined, child, depth + 1, out);
                }
            }
            other => {
                out.insert(key, other.clone());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn flat_input_passes_through() {
        let flattener = Flattener::default();
        let flat = flattener.flatten_record(&json!({"id": "1", "name": "Acme"}));
        assert_eq!(flat.get("id"), Some(&json!("1")));
        assert_eq!(flat.get("name"), Some(&json!("Acme")));
    }

    #[test]
    fn nests_join_with_separator_up_to_depth() {
        let record = json!({
            "name": "John Doe",
            "nesting_0": "0",
            "nesting_1": {"nesting_1": "1"},
            "nesting_2": {"nesting_2": {"nesting_2": "2"}},
            "nesting_3": {"nesting_3": {"nesting_3": {"nesting_3": "3"}}},
            "nesting_4": {"nesting_4": {"nesting_4": {"nesting_4": {"nesting_4": "4"}}}},
            "address": {
                "street": "123 Main St",
                "city": "Anytown"
            },
            "preferences": {
                "color": "blue",
                "email_preferences": {"notify_on": ["new_message", "newsletter"]}
            }
        });

        let flattener = Flattener::with_max_depth(3);
        let flat = flattener.flatten_record(&record);

        assert_eq!(flat.get("name"), Some(&json!("John Doe")));
        assert_eq!(flat.get("nesting_0"), Some(&json!("0")));
        assert_eq!(flat.get("nesting_1_nesting_1"), Some(&json!("1")));
        assert_eq!(flat.get("nesting_2_nesting_2_nesting_2"), Some(&json!("2")));
        assert_eq!(
            flat.get("nesting_3_nesting_3_nesting_3_nesting_3"),
            Some(&json!("3"))
        );
        // Beyond max depth the remainder is kept as a raw JSON value.
        assert_eq!(
            flat.get("nesting_4_nesting_4_nesting_4_nesting_4"),
            Some(&json!({"nesting_4": "4"}))
        );
        assert_eq!(flat.get("address_street"), Some(&json!("123 Main St")));
        assert_eq!(flat.get("address_city"), Some(&json!("Anytown")));
        assert_eq!(flat.get("preferences_color"), Some(&json!("blue")));
        assert_eq!(
            flat.get("preferences_email_preferences_notify_on"),
            Some(&json!(["new_message", "newsletter"]))
        );
    }

    #[test]
    fn arrays_are_not_expanded() {
        let flattener = Flattener::default();
        let flat = flattener.flatten_record(&json!({"tags": ["a", "b"]}));
        assert_eq!(flat.get("tags"), Some(&json!(["a", "b"])));
    }

    #[test]
    fn non_object_input_yields_empty_map() {
        let flattener = Flattener::default();
        assert!(flattener.flatten_record(&json!("scalar")).is_empty());
        assert!(flattener.flatten_record(&json!(null)).is_empty());
    }

    #[test]
    fn custom_separator() {
        let flattener = Flattener::new('#', 2);
        let flat = flattener.flatten_record(&json!({"address": {"house_number": "1"}}));
        assert_eq!(flat.get("address#house_number"), Some(&json!("1")));
    }
}
