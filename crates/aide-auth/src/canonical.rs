use serde_json::Value;
use sha2::{Digest, Sha256};

/// Canonical JSON byte form: object keys sorted, no whitespace.
///
/// The config hash is computed over this form on both sides of a push, so
/// field ordering on the wire never matters.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&serde_json::to_string(key).expect("string serializes"));
                out.push(':');
                write_canonical(&map[*key], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        other => {
            out.push_str(&serde_json::to_string(other).expect("scalar serializes"));
        }
    }
}

/// SHA-256 hex of the canonical form.
pub fn config_hash(value: &Value) -> String {
    let canonical = canonical_json(value);
    let digest = Sha256::digest(canonical.as_bytes());
    hex::encode(digest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn keys_are_sorted_recursively() {
        let v = json!({"b": 1, "a": {"z": true, "y": [3, 2]}});
        assert_eq!(canonical_json(&v), r#"{"a":{"y":[3,2],"z":true},"b":1}"#);
    }

    #[test]
    fn hash_ignores_field_order() {
        let a = json!({"mode": "companion", "version": 1});
        let b = json!({"version": 1, "mode": "companion"});
        assert_eq!(config_hash(&a), config_hash(&b));
        assert_eq!(config_hash(&a).len(), 64);
    }

    #[test]
    fn hash_changes_with_content() {
        let a = json!({"mode": "companion"});
        let b = json!({"mode": "business"});
        assert_ne!(config_hash(&a), config_hash(&b));
    }

    #[test]
    fn strings_are_json_escaped() {
        let v = json!({"k": "line\nbreak \"quoted\""});
        let canonical = canonical_json(&v);
        let back: Value = serde_json::from_str(&canonical).unwrap();
        assert_eq!(back["k"], "line\nbreak \"quoted\"");
    }
}
