use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

static MARKER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{\{\s*([^{}]*?)\s*\}\}").expect("marker pattern is valid"));
static BARE_MARKER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\{\{\s*([^{}]*?)\s*\}\}$").expect("bare marker pattern is valid"));

/// Variables shared across the steps of one run.
///
/// Markers look like `{{name}}` or `{{name.field.0}}`. Unknown references stay
/// in the text unchanged.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExecutionContext {
    vars: Map<String, Value>,
}

impl ExecutionContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed from a JSON object; anything else gives an empty context.
    pub fn from_value(value: Value) -> Self {
        match value {
            Value::Object(vars) => Self { vars },
            _ => Self::default(),
        }
    }

    pub fn insert(&mut self, key: &str, value: Value) {
        self.vars.insert(key.to_string(), value);
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.vars.get(key)
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    pub fn to_value(&self) -> Value {
        Value::Object(self.vars.clone())
    }

    /// Walk a dotted path. Numeric segments index into arrays.
    pub fn lookup(&self, path: &str) -> Option<&Value> {
        let mut parts = path.split('.');
        let mut current = self.vars.get(parts.next()?.trim())?;
        for part in parts {
            let part = part.trim();
            current = match current {
                Value::Object(map) => map.get(part)?,
                Value::Array(items) => items.get(part.parse::<usize>().ok()?)?,
                _ => return None,
            };
        }
        Some(current)
    }

    /// Resolve markers in every string of `value`, recursively.
    pub fn resolve(&self, value: &Value) -> Value {
        match value {
            Value::String(s) => self.resolve_str(s),
            Value::Array(items) => Value::Array(items.iter().map(|v| self.resolve(v)).collect()),
            Value::Object(map) => Value::Object(map.iter().map(|(k, v)| (k.clone(), self.resolve(v))).collect()),
            other => other.clone(),
        }
    }

    /// A string that is exactly one marker takes the referenced value's JSON type.
    pub fn resolve_str(&self, text: &str) -> Value {
        if let Some(caps) = BARE_MARKER.captures(text) {
            if let Some(value) = self.lookup(&caps[1]) {
                return value.clone();
            }
        }
        Value::String(self.interpolate(text))
    }

    pub fn interpolate(&self, text: &str) -> String {
        MARKER
            .replace_all(text, |caps: &Captures| match self.lookup(&caps[1]) {
                Some(Value::String(s)) => s.clone(),
                Some(other) => other.to_string(),
                None => caps[0].to_string(),
            })
            .into_owned()
    }
}
