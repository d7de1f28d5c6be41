//! Argument remapping against a tool schema.
//!
//! Callers rarely spell arguments the way a server expects. Before a call is
//! forwarded, keys the schema does not know are moved onto expected keys
//! (plural/singular forms, then an alias table) and values are coerced to the
//! declared type. Consumed keys are removed; unrelated extra keys pass
//! through untouched.

use serde_json::{Map, Number, Value};

use super::schema::{ArgType, ToolSchema};

/// `expected key → accepted aliases`, tried in order.
const ARG_ALIASES: &[(&str, &[&str])] = &[
    ("path", &["file_path", "filepath", "file", "filename", "dir", "directory", "folder"]),
    ("command", &["cmd", "shell_command", "script", "cmdline"]),
    ("query", &["q", "search", "term", "search_query", "keywords"]),
    ("url", &["link", "href", "uri", "website", "address"]),
    ("content", &["text", "body", "data", "contents"]),
    ("body", &["content", "message", "text"]),
    ("text", &["content", "message", "value"]),
    ("identifier", &["app", "app_name", "application", "bundle_id", "name"]),
    ("message", &["body", "text", "content"]),
    ("source", &["src", "from", "old_path"]),
    ("destination", &["dest", "to", "target", "new_path"]),
    ("to", &["recipient", "recipients", "email"]),
    ("pattern", &["glob", "query", "search"]),
    ("key_name", &["key", "keys"]),
    ("script", &["code", "js", "javascript"]),
    ("max_length", &["limit", "max_chars"]),
];

/// Result of remapping one call's arguments.
#[derive(Debug, Clone, PartialEq)]
pub struct Remapped {
    pub arguments: Value,
    /// `(from, to)` key moves, in the order applied.
    pub renamed: Vec<(String, String)>,
    /// Keys whose values were converted to the declared type.
    pub coerced: Vec<String>,
    /// Required keys still absent after remapping.
    pub missing: Vec<String>,
}

impl Remapped {
    pub fn is_complete(&self) -> bool {
        self.missing.is_empty()
    }
}

/// Remap `args` onto `schema`.
///
/// `injected` holds arguments derived from the hint; they only fill keys the
/// caller left absent.
pub fn remap_arguments(
    schema: &ToolSchema,
    args: &Value,
    injected: &Map<String, Value>,
) -> Remapped {
    let mut map = match args {
        Value::Object(obj) => obj.clone(),
        Value::Null => Map::new(),
        // a bare value fills the only required argument
        other if schema.required.len() == 1 => {
            let mut map = Map::new();
            map.insert(schema.required[0].clone(), other.clone());
            map
        }
        other => {
            tracing::debug!(tool = %schema.name, value = %other, "non-object arguments dropped");
            Map::new()
        }
    };

    for (key, value) in injected {
        map.entry(key.clone()).or_insert_with(|| value.clone());
    }

    let mut renamed = Vec::new();
    let expected: Vec<&String> = schema.required.iter().chain(schema.optional.iter()).collect();

    for key in &expected {
        if map.contains_key(key.as_str()) {
            continue;
        }
        let Some(source) = alias_candidates(key)
            .into_iter()
            .find(|candidate| map.contains_key(candidate) && !schema.expects(candidate))
        else {
            continue;
        };
        if let Some(value) = map.remove(&source) {
            map.insert((*key).clone(), value);
            renamed.push((source, (*key).clone()));
        }
    }

    let mut coerced = Vec::new();
    for key in &expected {
        let ty = schema.arg_type(key);
        if let Some(value) = map.get_mut(key.as_str()) {
            if let Some(converted) = coerce(value, ty) {
                *value = converted;
                coerced.push((*key).clone());
            }
        }
    }

    let missing = schema
        .required
        .iter()
        .filter(|key| !map.contains_key(key.as_str()))
        .cloned()
        .collect();

    Remapped {
        arguments: Value::Object(map),
        renamed,
        coerced,
        missing,
    }
}

/// Keys that may stand in for `key`: plural, singular, then aliases.
fn alias_candidates(key: &str) -> Vec<String> {
    let mut out = Vec::new();
    if let Some(stem) = key.strip_suffix("ies").filter(|s| !s.is_empty()) {
        out.push(format!("{stem}y"));
    } else if let Some(singular) = key.strip_suffix('s').filter(|s| !s.is_empty()) {
        out.push(singular.to_string());
    } else {
        out.push(format!("{key}s"));
    }
    if let Some((_, aliases)) = ARG_ALIASES.iter().find(|(k, _)| *k == key) {
        out.extend(aliases.iter().map(|a| a.to_string()));
    }
    out
}

/// Convert `value` to `ty`, or `None` when it already fits or cannot convert.
fn coerce(value: &Value, ty: ArgType) -> Option<Value> {
    match (ty, value) {
        (ArgType::String, Value::Array(items)) => match items.first() {
            Some(Value::String(s)) => Some(Value::String(s.clone())),
            Some(Value::Number(n)) => Some(Value::String(n.to_string())),
            _ => None,
        },
        (ArgType::String, Value::Number(n)) => Some(Value::String(n.to_string())),
        (ArgType::String, Value::Bool(b)) => Some(Value::String(b.to_string())),

        (ArgType::Integer, Value::String(s)) => s.trim().parse::<i64>().ok().map(Value::from),
        (ArgType::Integer, Value::Number(n)) if n.as_i64().is_none() => n
            .as_f64()
            .filter(|f| f.fract() == 0.0 && f.abs() < i64::MAX as f64)
            .map(|f| Value::from(f as i64)),

        (ArgType::Number, Value::String(s)) => s
            .trim()
            .parse::<f64>()
            .ok()
            .and_then(Number::from_f64)
            .map(Value::Number),

        (ArgType::Boolean, Value::String(s)) => match s.trim().to_lowercase().as_str() {
            "true" | "yes" | "1" | "on" => Some(Value::Bool(true)),
            "false" | "no" | "0" | "off" => Some(Value::Bool(false)),
            _ => None,
        },
        (ArgType::Boolean, Value::Number(n)) => n.as_i64().map(|i| Value::Bool(i != 0)),

        (ArgType::Array, Value::Array(_) | Value::Null) => None,
        (ArgType::Array, other) => Some(Value::Array(vec![other.clone()])),

        (ArgType::Object, Value::String(s)) if s.trim_start().starts_with('{') => {
            serde_json::from_str::<Value>(s).ok().filter(Value::is_object)
        }

        _ => None,
    }
}
