//! Key-based scrubbing of serialized snapshots.
//!
//! Any JSON object key matching the configured set (case-insensitive) has
//! its value replaced by [`SENTINEL`] before the document is persisted.

use std::collections::HashSet;

use serde_json::Value;

pub const SENTINEL: &str = "[REDACTED]";

/// Scrubs configured keys out of JSON documents.
#[derive(Debug, Clone, Default)]
pub struct Redactor {
    keys: HashSet<String>,
}

impl Redactor {
    pub fn new<I, S>(keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            keys: keys
                .into_iter()
                .map(|k| k.as_ref().to_ascii_lowercase())
                .collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Replace the value of every matching key, recursively.
    pub fn scrub(&self, value: &mut Value) {
        match value {
            Value::Object(map) => {
                for (key, entry) in map.iter_mut() {
                    if self.keys.contains(&key.to_ascii_lowercase()) {
                        *entry = Value::String(SENTINEL.to_string());
                    } else {
                        self.scrub(entry);
                    }
                }
            }
            Value::Array(items) => {
                for item in items.iter_mut() {
                    self.scrub(item);
                }
            }
            _ => {}
        }
    }

    /// Scrub a clone, leaving the original intact.
    pub fn scrubbed(&self, value: &Value) -> Value {
        let mut copy = value.clone();
        self.scrub(&mut copy);
        copy
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn scrubs_nested_keys_case_insensitively() {
        let redactor = Redactor::new(["authorization", "api_key", "password"]);
        let mut doc = json!({
            "Authorization": "Bearer abc123",
            "request": {
                "headers": { "api_key": "sk-zzz" },
                "body": [{ "password": "hunter2", "city": "Paris" }]
            }
        });
        redactor.scrub(&mut doc);

        let text = doc.to_string();
        assert!(!text.contains("abc123"));
        assert!(!text.contains("sk-zzz"));
        assert!(!text.contains("hunter2"));
        assert!(text.contains("Paris"));
        assert_eq!(doc["Authorization"], SENTINEL);
    }

    #[test]
    fn scrubbed_leaves_original_untouched() {
        let redactor = Redactor::new(["token"]);
        let original = json!({ "token": "tok-1" });
        let copy = redactor.scrubbed(&original);
        assert_eq!(original["token"], "tok-1");
        assert_eq!(copy["token"], SENTINEL);
    }

    #[test]
    fn empty_redactor_is_a_no_op() {
        let redactor = Redactor::default();
        let mut doc = json!({ "password": "x" });
        redactor.scrub(&mut doc);
        assert_eq!(doc["password"], "x");
    }
}
