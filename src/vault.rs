use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Known-good facts about the test user.
///
/// Handed to the diagnosis oracle as ground truth and used by the obstacle
/// resolver to answer preference prompts (e.g. a gender selector) directly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserProfile {
    data: BTreeMap<String, Value>,
}

impl Default for UserProfile {
    fn default() -> Self {
        let mut data = BTreeMap::new();
        data.insert("full_name".into(), json!("Test User"));
        data.insert("email".into(), json!("test.user@example.com"));
        data.insert("gender".into(), json!("female"));
        data.insert("phone".into(), json!("+15555550100"));
        data.insert("username".into(), json!("testuser"));
        data.insert("password".into(), json!("Passw0rd!"));
        Self { data }
    }
}

impl UserProfile {
    pub fn empty() -> Self {
        Self { data: BTreeMap::new() }
    }

    pub fn from_value(value: &Value) -> Self {
        let data = value
            .as_object()
            .map(|obj| obj.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default();
        Self { data }
    }

    pub fn insert(&mut self, key: &str, value: Value) {
        self.data.insert(key.to_string(), value);
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.data.get(key)
    }

    /// Scalar facts as text; objects and arrays are not clickable answers.
    pub fn get_text(&self, key: &str) -> Option<String> {
        match self.data.get(key)? {
            Value::String(s) if !s.trim().is_empty() => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            Value::Bool(b) => Some(b.to_string()),
            _ => None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn summarize_for_llm(&self) -> String {
        let mut summary = String::from("Available User Context (The Truth):");
        for (key, value) in &self.data {
            let rendered = match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            summary.push_str(&format!("\n- {}: {}", key, rendered));
        }
        summary
    }
}
