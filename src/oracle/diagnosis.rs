//! Typed diagnosis protocol.
//!
//! The oracle answers in loosely structured JSON, often wrapped in prose or
//! markdown fences. Everything is normalized here into `HealingReport`; a
//! response that carries no recognizable diagnosis is rejected as
//! unparsable rather than half-trusted.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{EngineError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RootCauseCategory {
    SelectorChanged,
    TimingIssue,
    OverlayBlocking,
    BackendError,
    ValidationError,
    ScrollNeeded,
    EncodingIssue,
    NetworkError,
    Other,
}

impl RootCauseCategory {
    /// Oracle labels outside the known set collapse to `Other`.
    pub fn from_label(raw: &str) -> Self {
        Self::parse_known(raw).unwrap_or(Self::Other)
    }

    /// Strict form: `None` unless the label names a category.
    pub fn parse_known(raw: &str) -> Option<Self> {
        let category = match normalize_label(raw).as_str() {
            "selector_changed" => Self::SelectorChanged,
            "timing_issue" => Self::TimingIssue,
            "overlay_blocking" => Self::OverlayBlocking,
            "backend_error" => Self::BackendError,
            "validation_error" => Self::ValidationError,
            "scroll_needed" => Self::ScrollNeeded,
            "encoding_issue" => Self::EncodingIssue,
            "network_error" => Self::NetworkError,
            "other" => Self::Other,
            _ => return None,
        };
        Some(category)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealingAction {
    DismissOverlay,
    WaitLonger,
    ScrollToElement,
    RetryWithNewSelector,
    Retry,
    None,
}

impl HealingAction {
    /// Unknown remedies collapse to `None`: no environment change before the retry.
    pub fn from_label(raw: &str) -> Self {
        match normalize_label(raw).as_str() {
            "dismiss_overlay" => Self::DismissOverlay,
            "wait_longer" => Self::WaitLonger,
            "scroll_to_element" => Self::ScrollToElement,
            "retry_with_new_selector" => Self::RetryWithNewSelector,
            "retry" => Self::Retry,
            _ => Self::None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DismissOverlay => "dismiss_overlay",
            Self::WaitLonger => "wait_longer",
            Self::ScrollToElement => "scroll_to_element",
            Self::RetryWithNewSelector => "retry_with_new_selector",
            Self::Retry => "retry",
            Self::None => "none",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn from_label(raw: &str) -> Self {
        match raw.trim().to_lowercase().as_str() {
            "low" => Self::Low,
            "high" => Self::High,
            "critical" => Self::Critical,
            _ => Self::Medium,
        }
    }
}

fn normalize_label(raw: &str) -> String {
    raw.trim().to_lowercase().replace(['-', ' '], "_")
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealingReport {
    pub root_cause: String,
    pub root_cause_category: RootCauseCategory,
    pub suggestion: String,
    pub self_healing_action: HealingAction,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new_selector: Option<String>,
    pub severity: Severity,
    pub confidence: f32,
    pub human_explanation: String,
}

impl HealingReport {
    /// Fallback used whenever the oracle cannot supply a real diagnosis.
    pub fn unknown(reason: &str) -> Self {
        Self {
            root_cause: "unknown".to_string(),
            root_cause_category: RootCauseCategory::Other,
            suggestion: reason.to_string(),
            self_healing_action: HealingAction::None,
            new_selector: None,
            severity: Severity::Medium,
            confidence: 0.0,
            human_explanation: format!("Root cause: unknown. Fix: none ({}).", reason),
        }
    }

    pub fn is_unknown(&self) -> bool {
        self.root_cause == "unknown" && self.self_healing_action == HealingAction::None
    }

    /// Selector to use for the remedied retry, if the oracle supplied one.
    pub fn replacement_selector(&self) -> Option<&str> {
        match self.self_healing_action {
            HealingAction::RetryWithNewSelector => self.new_selector.as_deref(),
            _ => None,
        }
    }
}

/// What the healing layer tells the oracle about a failed action.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiagnosisRequest {
    pub action: String,
    pub original_target: String,
    pub error_message: String,
    pub screen_description: String,
}

impl DiagnosisRequest {
    pub fn logs(&self) -> String {
        format!(
            "Action: {}\nOriginal Selector: {}\nError: {}",
            self.action, self.original_target, self.error_message
        )
    }
}

/// Find the first well-formed JSON object inside arbitrary text.
pub fn extract_json_object(text: &str) -> Option<Map<String, Value>> {
    for (idx, _) in text.match_indices('{') {
        let mut stream = serde_json::Deserializer::from_str(&text[idx..]).into_iter::<Value>();
        if let Some(Ok(Value::Object(map))) = stream.next() {
            return Some(map);
        }
    }
    None
}

fn field<'a>(obj: &'a Map<String, Value>, keys: &[&str]) -> Option<&'a Value> {
    keys.iter().find_map(|k| obj.get(*k)).filter(|v| !v.is_null())
}

fn field_str(obj: &Map<String, Value>, keys: &[&str]) -> Option<String> {
    field(obj, keys).and_then(|v| match v {
        Value::String(s) => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    })
}

fn field_f32(obj: &Map<String, Value>, keys: &[&str]) -> Option<f32> {
    field(obj, keys).and_then(|v| match v {
        Value::Number(n) => n.as_f64().map(|f| f as f32),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    })
}

pub fn parse_healing_report(text: &str) -> Result<HealingReport> {
    let obj = extract_json_object(text).ok_or_else(|| {
        EngineError::OracleResponseUnparsable(preview(text))
    })?;

    let root_cause = field_str(&obj, &["root_cause", "rootCause"]);
    let action = field_str(&obj, &["self_healing_action", "selfHealingAction"]);
    if root_cause.is_none() && action.is_none() {
        return Err(EngineError::OracleResponseUnparsable(format!(
            "no diagnosis fields in payload: {}",
            preview(text)
        )));
    }

    let root_cause = root_cause.unwrap_or_else(|| "unknown".to_string());
    let suggestion = field_str(&obj, &["suggestion"]).unwrap_or_default();
    let human_explanation = format!("Root cause: {}. Fix: {}.", root_cause, suggestion);

    Ok(HealingReport {
        root_cause_category: field_str(&obj, &["root_cause_category", "rootCauseCategory", "category"])
            .map(|c| RootCauseCategory::from_label(&c))
            .unwrap_or(RootCauseCategory::Other),
        self_healing_action: action
            .map(|a| HealingAction::from_label(&a))
            .unwrap_or(HealingAction::None),
        new_selector: field_str(&obj, &["new_selector", "newSelector"]).filter(|s| !s.is_empty()),
        severity: field_str(&obj, &["severity"])
            .map(|s| Severity::from_label(&s))
            .unwrap_or(Severity::Medium),
        confidence: field_f32(&obj, &["confidence"]).unwrap_or(0.0).clamp(0.0, 1.0),
        root_cause,
        suggestion,
        human_explanation,
    })
}

fn preview(text: &str) -> String {
    text.chars().take(200).collect()
}
