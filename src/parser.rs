use crate::rules::LogRule;
use serde_json::Value;
use std::collections::HashMap;

/// Parses one raw line into a loosely typed field map.
///
/// Lines that deserialize to a JSON object contribute their keys directly,
/// with values stringified for the mapping stage. Anything else falls back to
/// `field=token` extraction for the rule's source fields, and a line matching
/// nothing still yields a single `raw_message` field so non-empty input is
/// never silently lost.
///
/// Total over all inputs: empty lines return `None`, malformed input takes
/// the fallback path, and no error escapes this boundary.
pub fn parse_line(line: &str, rule: &LogRule) -> Option<HashMap<String, String>> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return None;
    }

    if let Ok(Value::Object(object)) = serde_json::from_str::<Value>(trimmed) {
        let mut fields = HashMap::with_capacity(object.len());
        for (key, value) in object {
            if let Some(text) = stringify(&value) {
                fields.insert(key, text);
            }
        }
        if fields.is_empty() {
            // A bare `{}` (or all-null object) carries nothing to map.
            return None;
        }
        return Some(fields);
    }

    let mut fields = HashMap::new();
    for mapping in &rule.mappings {
        if let Some(caps) = mapping.extract.captures(trimmed) {
            if let Some(token) = caps.get(1) {
                fields.insert(mapping.source_field.clone(), token.as_str().to_string());
            }
        }
    }

    if fields.is_empty() {
        fields.insert("raw_message".to_string(), trimmed.to_string());
    }
    Some(fields)
}

fn stringify(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(text) => Some(text.clone()),
        Value::Bool(flag) => Some(flag.to_string()),
        Value::Number(number) => Some(number.to_string()),
        // Nested arrays/objects are kept as their JSON text; a string-typed
        // mapping can still land them in the sink for inspection.
        nested => serde_json::to_string(nested).ok(),
    }
}
