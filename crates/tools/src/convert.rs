//! Schema-driven argument conversion.
//!
//! Models hand back loose JSON maps; tools declare typed shapes. The
//! converter is keyed on the declared input schema: scalar coercions for
//! mistyped leaves, schema defaults for missing properties, and the
//! reserved `Env` map which, when nil or empty, is populated from the
//! process environment so shell-executing tools inherit `PATH`, `HOME`,
//! and friends.

use serde_json::{Map, Value};

/// The reserved environment field name.
pub const ENV_FIELD: &str = "Env";

/// Convert loose arguments into the declared shape.
pub fn convert_args(schema: &Value, args: Value) -> Value {
    let mut map = match args {
        Value::Object(map) => map,
        Value::Null => Map::new(),
        other => return other,
    };

    let properties = schema.get("properties").and_then(Value::as_object);
    if let Some(properties) = properties {
        for (name, prop_schema) in properties {
            match map.get(name) {
                Some(value) => {
                    let coerced = coerce(prop_schema, value.clone());
                    map.insert(name.clone(), coerced);
                }
                None => {
                    if let Some(default) = prop_schema.get("default") {
                        map.insert(name.clone(), default.clone());
                    }
                }
            }
        }

        // Reserved Env field: populate from the process environment when
        // declared but absent or empty.
        if properties.contains_key(ENV_FIELD) {
            let needs_fill = match map.get(ENV_FIELD) {
                None | Some(Value::Null) => true,
                Some(Value::Object(env)) => env.is_empty(),
                Some(_) => false,
            };
            if needs_fill {
                let env: Map<String, Value> = std::env::vars()
                    .map(|(k, v)| (k, Value::String(v)))
                    .collect();
                map.insert(ENV_FIELD.to_string(), Value::Object(env));
            }
        }
    }

    Value::Object(map)
}

/// Coerce a leaf value toward its declared type. Unknown or already
/// correct shapes pass through untouched.
fn coerce(prop_schema: &Value, value: Value) -> Value {
    let declared = prop_schema.get("type").and_then(Value::as_str);
    match (declared, &value) {
        (Some("integer"), Value::String(s)) => s
            .trim()
            .parse::<i64>()
            .map(Value::from)
            .unwrap_or(value),
        (Some("number"), Value::String(s)) => s
            .trim()
            .parse::<f64>()
            .ok()
            .and_then(|n| serde_json::Number::from_f64(n).map(Value::Number))
            .unwrap_or(value),
        (Some("boolean"), Value::String(s)) => match s.trim() {
            "true" => Value::Bool(true),
            "false" => Value::Bool(false),
            _ => value,
        },
        (Some("string"), Value::Number(n)) => Value::String(n.to_string()),
        _ => value,
    }
}

/// On-demand schema enrichment: inject empty defaults for object/array
/// properties that declare none, so UI consumers can render editors
/// without special-casing missing values.
pub fn enrich_schema(schema: &mut Value) {
    let Some(properties) = schema
        .get_mut("properties")
        .and_then(Value::as_object_mut)
    else {
        return;
    };
    for prop_schema in properties.values_mut() {
        let declared = prop_schema.get("type").and_then(Value::as_str);
        let has_default = prop_schema.get("default").is_some();
        if has_default {
            continue;
        }
        match declared {
            Some("object") => {
                if let Some(obj) = prop_schema.as_object_mut() {
                    obj.insert("default".into(), Value::Object(Map::new()));
                }
            }
            Some("array") => {
                if let Some(obj) = prop_schema.as_object_mut() {
                    obj.insert("default".into(), Value::Array(Vec::new()));
                }
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn coerces_string_leaves_toward_declared_types() {
        let schema = json!({
            "type": "object",
            "properties": {
                "a": { "type": "integer" },
                "b": { "type": "number" },
                "flag": { "type": "boolean" },
                "label": { "type": "string" }
            }
        });
        let args = json!({ "a": "2", "b": "3.5", "flag": "true", "label": 7 });
        let converted = convert_args(&schema, args);
        assert_eq!(converted["a"], 2);
        assert_eq!(converted["b"], 3.5);
        assert_eq!(converted["flag"], true);
        assert_eq!(converted["label"], "7");
    }

    #[test]
    fn injects_schema_defaults_for_missing_properties() {
        let schema = json!({
            "type": "object",
            "properties": {
                "limit": { "type": "integer", "default": 10 }
            }
        });
        let converted = convert_args(&schema, json!({}));
        assert_eq!(converted["limit"], 10);
    }

    #[test]
    fn present_values_beat_defaults() {
        let schema = json!({
            "type": "object",
            "properties": {
                "limit": { "type": "integer", "default": 10 }
            }
        });
        let converted = convert_args(&schema, json!({ "limit": 3 }));
        assert_eq!(converted["limit"], 3);
    }

    #[test]
    fn env_field_filled_from_process_env() {
        std::env::set_var("AGENTLY_CONVERT_TEST_VAR", "present");
        let schema = json!({
            "type": "object",
            "properties": {
                "command": { "type": "string" },
                "Env": { "type": "object" }
            }
        });
        let converted = convert_args(&schema, json!({ "command": "ls" }));
        assert_eq!(converted["Env"]["AGENTLY_CONVERT_TEST_VAR"], "present");

        // An explicitly provided non-empty Env is left alone.
        let explicit = convert_args(
            &schema,
            json!({ "command": "ls", "Env": { "ONLY": "this" } }),
        );
        assert_eq!(
            explicit["Env"].as_object().unwrap().len(),
            1,
            "explicit Env must not be merged with the process environment"
        );
    }

    #[test]
    fn enrich_adds_container_defaults() {
        let mut schema = json!({
            "type": "object",
            "properties": {
                "context": { "type": "object" },
                "items": { "type": "array" },
                "name": { "type": "string" },
                "preset": { "type": "object", "default": { "keep": true } }
            }
        });
        enrich_schema(&mut schema);
        assert_eq!(schema["properties"]["context"]["default"], json!({}));
        assert_eq!(schema["properties"]["items"]["default"], json!([]));
        assert!(schema["properties"]["name"].get("default").is_none());
        assert_eq!(schema["properties"]["preset"]["default"]["keep"], true);
    }
}
