//! Deep merge of ACM interface trees
//!
//! ACM nodes are strings, sequences, or nested mappings. Merging follows
//! structural recursion: differing strings widen to a sequence, sequences
//! concatenate, mappings merge key-wise. Every resulting sequence is
//! deduplicated by serialized value, preserving first occurrence order.

use serde_json::Value;

/// Merge `add` into `source`, returning the combined tree. A non-mapping
/// `source` yields `add`; a non-mapping `add` yields `source`.
pub fn combine(source: &Value, add: &Value) -> Value {
    let Value::Object(source_map) = source else {
        return add.clone();
    };
    let Value::Object(add_map) = add else {
        return source.clone();
    };

    let mut out = source_map.clone();
    for (key, add_value) in add_map {
        if add_value.is_null() {
            continue;
        }
        match out.get(key).cloned() {
            None | Some(Value::Null) => {
                out.insert(key.clone(), add_value.clone());
            }
            Some(existing) => {
                out.insert(key.clone(), combine_values(&existing, add_value));
            }
        }
    }
    Value::Object(out)
}

fn combine_values(existing: &Value, add: &Value) -> Value {
    match (existing, add) {
        (Value::String(s), Value::String(a)) => {
            if s == a {
                existing.clone()
            } else {
                dedupe(vec![existing.clone(), add.clone()])
            }
        }
        (Value::String(_), Value::Array(items)) => {
            let mut merged = vec![existing.clone()];
            merged.extend(items.iter().cloned());
            dedupe(merged)
        }
        (Value::Array(items), Value::String(_)) => {
            let mut merged = items.clone();
            merged.push(add.clone());
            dedupe(merged)
        }
        (Value::Array(existing_items), Value::Array(add_items)) => {
            let mut merged = existing_items.clone();
            merged.extend(add_items.iter().cloned());
            dedupe(merged)
        }
        (Value::Object(_), _) | (_, Value::Object(_)) => combine(existing, add),
        // Scalar conflicts outside the supported node shapes keep the
        // existing value.
        _ => existing.clone(),
    }
}

/// Remove duplicate entries by serialized form, keeping first occurrence
fn dedupe(items: Vec<Value>) -> Value {
    let mut seen: Vec<String> = Vec::new();
    let mut out = Vec::new();
    for item in items {
        let key = serde_json::to_string(&item).unwrap_or_default();
        if !seen.contains(&key) {
            seen.push(key);
            out.push(item);
        }
    }
    Value::Array(out)
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_string_plus_string() {
        let merged = combine(&json!({"k":"a"}), &json!({"k":"b"}));
        assert_eq!(merged, json!({"k":["a","b"]}));
        let same = combine(&json!({"k":"a"}), &json!({"k":"a"}));
        assert_eq!(same, json!({"k":"a"}));
    }

    #[test]
    fn test_string_prepends_to_sequence() {
        let merged = combine(&json!({"k":"a"}), &json!({"k":["b","c"]}));
        assert_eq!(merged, json!({"k":["a","b","c"]}));
        let merged = combine(&json!({"k":["a","b"]}), &json!({"k":"c"}));
        assert_eq!(merged, json!({"k":["a","b","c"]}));
    }

    #[test]
    fn test_sequences_concatenate_and_dedupe() {
        let merged = combine(&json!({"k":["a","b"]}), &json!({"k":["b","c","a"]}));
        assert_eq!(merged, json!({"k":["a","b","c"]}));
    }

    #[test]
    fn test_mappings_merge_recursively() {
        let merged = combine(
            &json!({"projects":{"p1":{"groups":["g1"]}}}),
            &json!({"projects":{"p1":{"groups":["g2"]},"p2":{"groups":["g3"]}}}),
        );
        assert_eq!(
            merged,
            json!({"projects":{
                "p1":{"groups":["g1","g2"]},
                "p2":{"groups":["g3"]},
            }})
        );
    }

    #[test]
    fn test_missing_keys_are_added() {
        let merged = combine(&json!({"a":"1"}), &json!({"b":"2"}));
        assert_eq!(merged, json!({"a":"1","b":"2"}));
    }

    #[test]
    fn test_null_values_are_skipped() {
        let merged = combine(&json!({"a":"1"}), &json!({"a":null,"b":null}));
        assert_eq!(merged, json!({"a":"1"}));
    }

    #[test]
    fn test_non_mapping_inputs() {
        assert_eq!(combine(&json!("x"), &json!({"a":"1"})), json!({"a":"1"}));
        assert_eq!(combine(&json!({"a":"1"}), &json!("x")), json!({"a":"1"}));
    }

    #[test]
    fn test_commutative_membership() {
        let a = json!({"users":["u1","u2"],"projects":{"p":{"groups":["g1"]}}});
        let b = json!({"users":["u3","u1"],"projects":{"p":{"groups":["g2"]}}});
        let ab = combine(&a, &b);
        let ba = combine(&b, &a);
        // Order may differ; membership must not.
        let users = |v: &Value| {
            let mut u: Vec<String> = v["users"]
                .as_array()
                .unwrap()
                .iter()
                .map(|x| x.as_str().unwrap().to_string())
                .collect();
            u.sort();
            u
        };
        assert_eq!(users(&ab), users(&ba));
    }
}
