use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::OracleConfig;
use crate::error::{EngineError, Result};
use crate::oracle::diagnosis::{parse_healing_report, DiagnosisRequest, HealingReport};
use crate::oracle::DiagnosisOracle;

const DIAGNOSIS_SYSTEM_PROMPT: &str = r#"
You are a QA test-automation failure analyst.
A UI action failed during an automated test. You get the action log and a list of
UI elements currently detected on screen (label, bounding box, confidence).
Find the root cause and pick ONE self-healing action.

Output ONLY valid JSON:
{
  "root_cause": "short description",
  "root_cause_category": "selector_changed | timing_issue | overlay_blocking | backend_error | validation_error | scroll_needed | encoding_issue | network_error | other",
  "confidence": 0.0-1.0,
  "suggestion": "what should be done",
  "self_healing_action": "dismiss_overlay | wait_longer | scroll_to_element | retry_with_new_selector | retry | none",
  "new_selector": "CSS/XPath selector, only with retry_with_new_selector",
  "severity": "Low | Medium | High | Critical"
}
"#;

/// Diagnosis oracle backed by an OpenAI-compatible chat completion endpoint.
///
/// One POST per diagnosis: retrying a failed diagnosis is the healing
/// layer's decision, and it never does.
#[derive(Clone)]
pub struct LlmOracle {
    client: Client,
    config: OracleConfig,
    profile_context: Option<String>,
}

impl LlmOracle {
    pub fn new(config: OracleConfig) -> Result<Self> {
        let client = Client::builder()
            .no_proxy()
            .timeout(config.request_timeout)
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| EngineError::Config(format!("oracle http client: {}", e)))?;
        Ok(Self {
            client,
            config,
            profile_context: None,
        })
    }

    /// Attach the test user's known-good data so validation failures can be judged.
    pub fn with_profile_context(mut self, summary: String) -> Self {
        self.profile_context = Some(summary);
        self
    }

    fn build_messages(&self, request: &DiagnosisRequest) -> Vec<Value> {
        let mut system = DIAGNOSIS_SYSTEM_PROMPT.trim().to_string();
        if let Some(profile) = &self.profile_context {
            system.push_str("\n\n");
            system.push_str(profile);
        }
        let user_msg = format!(
            "LOGS:\n{}\n\nSCREEN ELEMENTS:\n{}",
            request.logs(),
            request.screen_description
        );
        vec![
            json!({ "role": "system", "content": system }),
            json!({ "role": "user", "content": user_msg }),
        ]
    }

    async fn chat_completion(&self, messages: Vec<Value>) -> Result<String> {
        let api_key = self
            .config
            .api_key
            .as_deref()
            .ok_or_else(|| EngineError::OracleUnreachable("no oracle API key configured".to_string()))?;

        let body = json!({
            "model": self.config.model,
            "messages": messages,
            "temperature": 0.0
        });

        let res = self
            .client
            .post(&self.config.endpoint)
            .header("Authorization", format!("Bearer {}", api_key))
            .json(&body)
            .send()
            .await
            .map_err(|e| EngineError::OracleUnreachable(e.to_string()))?;

        if !res.status().is_success() {
            let status = res.status();
            let error_text = res.text().await.unwrap_or_default();
            warn!("[Oracle] API error ({}): {}", status, error_text);
            return Err(EngineError::OracleUnreachable(format!("HTTP {}: {}", status, error_text)));
        }

        let res_json: Value = res
            .json()
            .await
            .map_err(|e| EngineError::OracleResponseUnparsable(e.to_string()))?;
        match res_json["choices"][0]["message"]["content"].as_str() {
            Some(content) => Ok(content.to_string()),
            None => {
                let body_str = serde_json::to_string(&res_json).unwrap_or_default();
                Err(EngineError::OracleResponseUnparsable(format!(
                    "no content in completion: {}",
                    body_str
                )))
            }
        }
    }
}

#[async_trait]
impl DiagnosisOracle for LlmOracle {
    async fn diagnose(&self, request: &DiagnosisRequest) -> Result<HealingReport> {
        debug!("[Oracle] Diagnosing {} -> {}", request.action, request.original_target);
        let content = self.chat_completion(self.build_messages(request)).await?;
        parse_healing_report(&content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oracle::HealingAction;
    use axum::{routing::post, Json, Router};

    async fn serve(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}/v1/chat/completions", addr)
    }

    fn config(endpoint: String, api_key: Option<&str>) -> OracleConfig {
        OracleConfig {
            api_key: api_key.map(str::to_string),
            endpoint,
            model: "test-model".into(),
            request_timeout: Duration::from_secs(5),
        }
    }

    fn request() -> DiagnosisRequest {
        DiagnosisRequest {
            action: "click".into(),
            original_target: "#buy".into(),
            error_message: "Element not found".into(),
            screen_description: "- cookie banner [0,0,100,40] (0.90)".into(),
        }
    }

    #[tokio::test]
    async fn diagnoses_from_prose_wrapped_completion() {
        let app = Router::new().route(
            "/v1/chat/completions",
            post(|Json(body): Json<Value>| async move {
                let user = body["messages"][1]["content"].as_str().unwrap_or_default().to_string();
                assert!(user.contains("Original Selector: #buy"));
                Json(json!({
                    "choices": [{ "message": { "content":
                        "Analysis follows. {\"root_cause\": \"banner\", \"self_healing_action\": \"dismiss_overlay\", \"severity\": \"Low\"}"
                    } }]
                }))
            }),
        );
        let oracle = LlmOracle::new(config(serve(app).await, Some("k"))).unwrap();
        let report = oracle.diagnose(&request()).await.unwrap();
        assert_eq!(report.self_healing_action, HealingAction::DismissOverlay);
        assert_eq!(report.root_cause, "banner");
    }

    #[tokio::test]
    async fn server_error_is_unreachable() {
        let app = Router::new().route(
            "/v1/chat/completions",
            post(|| async { (axum::http::StatusCode::BAD_GATEWAY, "upstream down") }),
        );
        let oracle = LlmOracle::new(config(serve(app).await, Some("k"))).unwrap();
        let err = oracle.diagnose(&request()).await.unwrap_err();
        assert!(matches!(err, EngineError::OracleUnreachable(_)));
    }

    #[tokio::test]
    async fn missing_key_is_unreachable() {
        let oracle = LlmOracle::new(config("http://127.0.0.1:9/none".into(), None)).unwrap();
        let err = oracle.diagnose(&request()).await.unwrap_err();
        assert!(matches!(err, EngineError::OracleUnreachable(_)));
    }

    #[test]
    fn profile_context_lands_in_system_prompt() {
        let oracle = LlmOracle::new(config("http://localhost/x".into(), Some("k")))
            .unwrap()
            .with_profile_context("Available User Context:\n- email: a@b.c".into());
        let messages = oracle.build_messages(&request());
        assert!(messages[0]["content"].as_str().unwrap().contains("a@b.c"));
    }
}
