//! Step I/O carriers.
//!
//! Free text enters a step in `prompt` and leaves it in `message`. Every
//! other field passes between steps untouched.

use serde_json::{json, Map, Value};

/// Recursively merge `overlay` into `base`. Objects merge key by key; any
/// other overlay value replaces what was there.
pub fn deep_merge(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                match base_map.get_mut(&key) {
                    Some(existing) => deep_merge(existing, value),
                    None => {
                        base_map.insert(key, value);
                    }
                }
            }
        }
        (slot, value) => *slot = value,
    }
}

/// Input for a WASM step: module config, then step config, then the
/// carried input. Later layers win.
pub fn wasm_input(module_config: &Value, step_config: &Value, input: &Value) -> Value {
    let mut merged = Value::Object(Map::new());
    for layer in [module_config, step_config, input] {
        if layer.is_object() {
            deep_merge(&mut merged, layer.clone());
        }
    }
    if !input.is_object() && !input.is_null() {
        // Non-object input can only travel as the prompt.
        deep_merge(&mut merged, json!({ "prompt": input }));
    }
    merged
}

/// Turn a step's output into the next step's input: `message` becomes
/// `prompt`.
pub fn carry_forward(output: Value) -> Value {
    match output {
        Value::Object(mut map) => {
            if let Some(message) = map.remove("message") {
                map.insert("prompt".to_string(), message);
            }
            Value::Object(map)
        }
        Value::Null => Value::Object(Map::new()),
        other => json!({ "prompt": other }),
    }
}

/// Step outputs are objects; anything else is wrapped as `message`.
pub fn as_output(value: Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(map),
        Value::Null => Value::Object(Map::new()),
        other => json!({ "message": other }),
    }
}

/// Interpret a module's stdout. A JSON object is used as-is; any other
/// JSON value, or text that is not JSON, is wrapped as `message`.
pub fn normalize_wasm_output(stdout: &[u8]) -> Value {
    let text = String::from_utf8_lossy(stdout);
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Value::Object(Map::new());
    }
    match serde_json::from_str::<Value>(trimmed) {
        Ok(Value::Object(map)) => Value::Object(map),
        Ok(other) => json!({ "message": other }),
        Err(_) => json!({ "message": trimmed }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deep_merge_call_site_wins() {
        let module = json!({"model": {"name": "small", "temp": 0.1}, "retries": 2});
        let step = json!({"model": {"temp": 0.5}});
        let input = json!({"prompt": "hi", "retries": 5});
        assert_eq!(
            wasm_input(&module, &step, &input),
            json!({"model": {"name": "small", "temp": 0.5}, "retries": 5, "prompt": "hi"})
        );
    }

    #[test]
    fn test_carry_forward_renames_message_only() {
        let out = json!({"message": "HI", "score": 3, "prompt": "old"});
        assert_eq!(carry_forward(out), json!({"prompt": "HI", "score": 3}));
        assert_eq!(carry_forward(json!({"x": 1})), json!({"x": 1}));
    }

    #[test]
    fn test_normalize_wasm_output() {
        assert_eq!(normalize_wasm_output(b"{\"message\":\"HI\"}\n"), json!({"message": "HI"}));
        assert_eq!(normalize_wasm_output(b"[1,2]"), json!({"message": [1, 2]}));
        assert_eq!(normalize_wasm_output(b"\"text\""), json!({"message": "text"}));
        assert_eq!(normalize_wasm_output(b"plain words\n"), json!({"message": "plain words"}));
        assert_eq!(normalize_wasm_output(b"  \n"), json!({}));
    }
}
