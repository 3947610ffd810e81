use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::EngineError;
use crate::oracle::HealingReport;

/// Closed set of automation surfaces. Anything else is rejected while parsing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", try_from = "String")]
pub enum Platform {
    Web,
    MobileAndroid,
    MobileIos,
    DesktopWindows,
    Api,
    Database,
}

impl Platform {
    pub const ALL: [Platform; 6] = [
        Platform::Web,
        Platform::MobileAndroid,
        Platform::MobileIos,
        Platform::DesktopWindows,
        Platform::Api,
        Platform::Database,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Web => "web",
            Platform::MobileAndroid => "mobile_android",
            Platform::MobileIos => "mobile_ios",
            Platform::DesktopWindows => "desktop_windows",
            Platform::Api => "api",
            Platform::Database => "database",
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Platform {
    type Err = EngineError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_lowercase().as_str() {
            "web" => Ok(Platform::Web),
            "mobile_android" | "android" => Ok(Platform::MobileAndroid),
            "mobile_ios" | "ios" => Ok(Platform::MobileIos),
            "desktop_windows" | "desktop" => Ok(Platform::DesktopWindows),
            "api" => Ok(Platform::Api),
            "database" | "db" => Ok(Platform::Database),
            _ => Err(EngineError::UnsupportedPlatform(raw.to_string())),
        }
    }
}

impl TryFrom<String> for Platform {
    type Error = EngineError;

    fn try_from(raw: String) -> Result<Self, Self::Error> {
        raw.parse()
    }
}

/// One entry of a scenario run request, before variable resolution.
///
/// Top-level `target`, `value` and `expectedOutcome` are accepted as
/// shorthand and folded into `params` unless `params` already sets them.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(from = "RawScenarioStep")]
pub struct ScenarioStep {
    pub platform: Platform,
    pub action: String,
    pub params: Value,
    #[serde(rename = "variableOutput", skip_serializing_if = "Option::is_none")]
    pub variable_output: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawScenarioStep {
    platform: Platform,
    action: String,
    #[serde(default)]
    params: Value,
    #[serde(default, alias = "variable_output")]
    variable_output: Option<String>,
    #[serde(default)]
    target: Option<Value>,
    #[serde(default)]
    value: Option<Value>,
    #[serde(default, alias = "expected_outcome")]
    expected_outcome: Option<Value>,
}

impl From<RawScenarioStep> for ScenarioStep {
    fn from(raw: RawScenarioStep) -> Self {
        let mut params = match raw.params {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        let shorthand = [
            ("target", raw.target),
            ("value", raw.value),
            ("expectedOutcome", raw.expected_outcome),
        ];
        for (key, value) in shorthand {
            if let Some(value) = value {
                params.entry(key).or_insert(value);
            }
        }
        Self {
            platform: raw.platform,
            action: raw.action,
            params: Value::Object(params),
            variable_output: raw.variable_output,
        }
    }
}

impl ScenarioStep {
    pub fn new(platform: Platform, action: &str, params: Value) -> Self {
        Self {
            platform,
            action: action.to_string(),
            params,
            variable_output: None,
        }
    }

    pub fn with_output(mut self, key: &str) -> Self {
        self.variable_output = Some(key.to_string());
        self
    }
}

/// A step as dispatched: variables resolved, numbered, never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Step {
    pub sequence: usize,
    pub platform: Platform,
    pub action: String,
    pub target: Option<String>,
    pub value: Option<String>,
    pub expected_outcome: Option<String>,
    pub params: Value,
}

impl Step {
    pub fn from_resolved(sequence: usize, platform: Platform, action: &str, params: Value) -> Self {
        let target = first_str(&params, &["selector", "target", "url", "path", "query", "table"]);
        let value = first_str(&params, &["text", "value"]);
        let expected_outcome = first_str(&params, &["expected", "expectedOutcome", "expected_outcome"]);
        Self {
            sequence,
            platform,
            action: action.to_string(),
            target,
            value,
            expected_outcome,
            params,
        }
    }

    pub fn param_str(&self, key: &str) -> Option<&str> {
        self.params.get(key).and_then(Value::as_str)
    }

    pub fn label(&self) -> String {
        match &self.target {
            Some(target) => format!("#{} {} -> {} {}", self.sequence, self.platform, self.action, target),
            None => format!("#{} {} -> {}", self.sequence, self.platform, self.action),
        }
    }
}

fn first_str(params: &Value, keys: &[&str]) -> Option<String> {
    keys.iter()
        .find_map(|key| params.get(*key))
        .and_then(|v| match v {
            Value::String(s) => Some(s.clone()),
            Value::Null => None,
            other => Some(other.to_string()),
        })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Passed,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepResult {
    pub step: Step,
    pub status: StepStatus,
    pub reason: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub healing_report: Option<HealingReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    pub duration_ms: u64,
    pub started_at: DateTime<Utc>,
}

/// How a dispatched step ended, before it is frozen into a `StepResult`.
#[derive(Debug)]
pub enum StepOutcome {
    Passed { reason: String, output: Option<Value> },
    Failed { reason: String, error: String },
}

impl StepResult {
    pub fn pending(step: Step) -> Self {
        Self {
            step,
            status: StepStatus::Pending,
            reason: "dispatched".to_string(),
            error: None,
            healing_report: None,
            output: None,
            duration_ms: 0,
            started_at: Utc::now(),
        }
    }

    pub fn skipped(step: Step, reason: &str) -> Self {
        Self {
            status: StepStatus::Skipped,
            reason: reason.to_string(),
            ..Self::pending(step)
        }
    }

    /// Consumes the pending record; the returned value is final.
    pub fn finalize(
        self,
        outcome: StepOutcome,
        healing_report: Option<HealingReport>,
        duration_ms: u64,
    ) -> Self {
        let (status, reason, error, output) = match outcome {
            StepOutcome::Passed { reason, output } => (StepStatus::Passed, reason, None, output),
            StepOutcome::Failed { reason, error } => (StepStatus::Failed, reason, Some(error), None),
        };
        Self {
            status,
            reason,
            error,
            healing_report,
            output,
            duration_ms,
            ..self
        }
    }

    pub fn passed(&self) -> bool {
        self.status == StepStatus::Passed
    }

    pub fn executed(&self) -> bool {
        matches!(self.status, StepStatus::Passed | StepStatus::Failed)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunReport {
    pub run_id: Uuid,
    pub success: bool,
    pub total_steps: usize,
    pub executed_steps: usize,
    pub cancelled: bool,
    pub results: Vec<StepResult>,
    pub final_context: Value,
}

impl RunReport {
    pub fn failed_step(&self) -> Option<&StepResult> {
        self.results.iter().find(|r| r.status == StepStatus::Failed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn platform_aliases_and_rejection() {
        assert_eq!("db".parse::<Platform>().unwrap(), Platform::Database);
        assert_eq!("Web".parse::<Platform>().unwrap(), Platform::Web);
        let err = "unknown_platform".parse::<Platform>().unwrap_err();
        assert!(matches!(err, EngineError::UnsupportedPlatform(ref p) if p == "unknown_platform"));
    }

    #[test]
    fn scenario_step_rejects_unknown_platform() {
        let raw = json!({ "platform": "smart_fridge", "action": "click" });
        let parsed: Result<ScenarioStep, _> = serde_json::from_value(raw);
        assert!(parsed.is_err());
    }

    #[test]
    fn scenario_step_accepts_camel_case_output() {
        let raw = json!({
            "platform": "api",
            "action": "request",
            "params": { "url": "/users/1" },
            "variableOutput": "user"
        });
        let step: ScenarioStep = serde_json::from_value(raw).unwrap();
        assert_eq!(step.variable_output.as_deref(), Some("user"));
        assert_eq!(step.platform, Platform::Api);
    }

    #[test]
    fn top_level_shorthand_lands_in_params() {
        let raw = json!({
            "platform": "web",
            "action": "type",
            "target": "#email",
            "value": "a@b.c",
            "expectedOutcome": "field filled",
            "params": { "target": "#explicit" }
        });
        let step: ScenarioStep = serde_json::from_value(raw).unwrap();
        assert_eq!(step.params["target"], "#explicit");
        assert_eq!(step.params["value"], "a@b.c");
        assert_eq!(step.params["expectedOutcome"], "field filled");

        let bare: ScenarioStep =
            serde_json::from_value(json!({ "platform": "web", "action": "navigate", "target": "https://x" })).unwrap();
        assert_eq!(bare.params, json!({ "target": "https://x" }));
        assert_eq!(bare.variable_output, None);
    }

    #[test]
    fn step_derives_target_and_value() {
        let step = Step::from_resolved(
            1,
            Platform::Web,
            "type",
            json!({ "selector": "#email", "text": "a@b.c" }),
        );
        assert_eq!(step.target.as_deref(), Some("#email"));
        assert_eq!(step.value.as_deref(), Some("a@b.c"));
        assert_eq!(step.expected_outcome, None);
    }

    #[test]
    fn finalize_freezes_outcome() {
        let step = Step::from_resolved(0, Platform::Web, "click", json!({ "selector": "#go" }));
        let pending = StepResult::pending(step);
        assert_eq!(pending.status, StepStatus::Pending);
        let done = pending.finalize(
            StepOutcome::Failed { reason: "click failed".into(), error: "boom".into() },
            None,
            12,
        );
        assert_eq!(done.status, StepStatus::Failed);
        assert_eq!(done.error.as_deref(), Some("boom"));
        assert!(done.executed());
        assert!(!done.passed());
    }
}
