/// Execution data context and parameter templates
///
/// The context document every template and condition sees:
///
/// ```json
/// { "trigger": <seed>, "nodes": { "<node id>": <output>, ... }, "error": <last handled error> }
/// ```
///
/// Templates are `{{ path }}` where `path` is a JSONPath into that document
/// (`$.` optional): `{{nodes.fetch.data.items[0].id}}`.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DataContext {
    pub trigger: Value,
    pub nodes: Map<String, Value>,
    pub error: Value,
}

impl DataContext {
    pub fn new(seed: Value) -> Self {
        Self {
            trigger: seed,
            nodes: Map::new(),
            error: Value::Null,
        }
    }

    pub fn set_output(&mut self, node_id: &str, output: Value) {
        self.nodes.insert(node_id.to_string(), output);
    }

    pub fn output(&self, node_id: &str) -> Option<&Value> {
        self.nodes.get(node_id)
    }

    pub fn output_mut(&mut self, node_id: &str) -> Option<&mut Value> {
        self.nodes.get_mut(node_id)
    }

    /// Owned JSON view used for template resolution and handed to handlers
    pub fn document(&self) -> Value {
        serde_json::json!({
            "trigger": self.trigger,
            "nodes": self.nodes,
            "error": self.error,
        })
    }
}

/// Look up one JSONPath in `doc`; first match wins, no match is `None`.
pub fn lookup(doc: &Value, path: &str) -> Option<Value> {
    let path = path.trim();
    if path.is_empty() {
        return None;
    }
    let full = if path.starts_with('$') {
        path.to_string()
    } else {
        format!("$.{path}")
    };
    match jsonpath_lib::select(doc, &full) {
        Ok(found) => found.into_iter().next().cloned(),
        Err(e) => {
            tracing::debug!("🔍 Bad template path '{}': {:?}", path, e);
            None
        }
    }
}

/// If `s` is exactly one template (surrounding whitespace allowed), its inner path
fn sole_template(s: &str) -> Option<&str> {
    let trimmed = s.trim();
    let inner = trimmed.strip_prefix("{{")?.strip_suffix("}}")?;
    if inner.contains("{{") || inner.contains("}}") {
        return None;
    }
    Some(inner)
}

/// Text form of a value when spliced into a string; `null` renders empty
pub fn to_text(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Resolve the templates of a single string
///
/// A sole template yields the referenced value with its JSON type intact
/// (or `null`); anything else is text interpolation.
pub fn resolve_str(s: &str, doc: &Value) -> Value {
    if !s.contains("{{") {
        return Value::String(s.to_string());
    }
    if let Some(path) = sole_template(s) {
        return lookup(doc, path).unwrap_or(Value::Null);
    }

    let mut out = String::with_capacity(s.len());
    let mut rest = s;
    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find("}}") {
            Some(end) => {
                if let Some(value) = lookup(doc, &after[..end]) {
                    out.push_str(&to_text(&value));
                }
                rest = &after[end + 2..];
            }
            None => {
                // unterminated: keep the literal text
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    Value::String(out)
}

/// Resolve every template string nested anywhere inside `value`
pub fn resolve(value: &Value, doc: &Value) -> Value {
    match value {
        Value::String(s) => resolve_str(s, doc),
        Value::Array(items) => Value::Array(items.iter().map(|v| resolve(v, doc)).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), resolve(v, doc)))
                .collect(),
        ),
        other => other.clone(),
    }
}
