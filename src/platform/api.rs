use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, Method};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::error::{EngineError, Result};
use crate::platform::{PlatformExecutor, RequestExecutor, HISTORY_LIMIT};
use crate::retry::{with_retry_when, RetryConfig};
use crate::schema::Platform;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ApiConfig {
    pub base_url: Option<String>,
    pub headers: BTreeMap<String, String>,
    pub timeout_ms: u64,
    pub max_retries: u32,
    pub retry_delay_ms: u64,
}

impl Default for ApiConfig {
    fn default() -> Self {
        let mut headers = BTreeMap::new();
        headers.insert("Content-Type".to_string(), "application/json".to_string());
        headers.insert("Accept".to_string(), "application/json".to_string());
        headers.insert("User-Agent".to_string(), "visionqa-api/0.1".to_string());
        Self {
            base_url: None,
            headers,
            timeout_ms: 30_000,
            max_retries: 1,
            retry_delay_ms: 400,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ApiRequest {
    pub method: String,
    pub path: String,
    pub body: Option<Value>,
    pub headers: BTreeMap<String, String>,
    pub query: BTreeMap<String, String>,
}

impl Default for ApiRequest {
    fn default() -> Self {
        Self {
            method: "GET".to_string(),
            path: String::new(),
            body: None,
            headers: BTreeMap::new(),
            query: BTreeMap::new(),
        }
    }
}

impl ApiRequest {
    /// Build from resolved step params: `url`/`path`, `method`, `body`/`json`, `headers`, `query`.
    pub fn from_params(params: &Value, default_method: &str) -> Result<Self> {
        let path = params
            .get("url")
            .or_else(|| params.get("path"))
            .and_then(Value::as_str)
            .ok_or_else(|| EngineError::InvalidParams("API step needs a 'url' or 'path'".to_string()))?;
        let method = params
            .get("method")
            .and_then(Value::as_str)
            .unwrap_or(default_method)
            .to_uppercase();
        let body = params
            .get("body")
            .or_else(|| params.get("json"))
            .filter(|v| !v.is_null())
            .cloned();
        Ok(Self {
            method,
            path: path.to_string(),
            body,
            headers: string_map(params.get("headers")),
            query: string_map(params.get("query").or_else(|| params.get("params"))),
        })
    }
}

fn string_map(value: Option<&Value>) -> BTreeMap<String, String> {
    value
        .and_then(Value::as_object)
        .map(|obj| {
            obj.iter()
                .map(|(k, v)| {
                    let v = match v {
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    };
                    (k.clone(), v)
                })
                .collect()
        })
        .unwrap_or_default()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiResponse {
    pub status_code: Option<u16>,
    pub success: bool,
    pub duration_ms: f64,
    pub body: Value,
    pub headers: BTreeMap<String, String>,
    pub attempts: u32,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ApiResponse {
    pub fn failed(error: impl Into<String>, duration_ms: f64, attempts: u32) -> Self {
        Self {
            status_code: None,
            success: false,
            duration_ms,
            body: Value::Null,
            headers: BTreeMap::new(),
            attempts,
            timestamp: Utc::now(),
            error: Some(error.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadTestReport {
    pub total_requests: usize,
    pub success_count: usize,
    pub avg_duration_ms: f64,
    pub p95_duration_ms: f64,
    pub total_time_ms: f64,
}

impl LoadTestReport {
    /// p95 is the sorted sample at index `floor(n * 0.95)`, clamped to the last element.
    pub fn from_durations(durations: &[f64], success_count: usize, total_time_ms: f64) -> Self {
        let mut sorted = durations.to_vec();
        sorted.sort_by(|a, b| a.total_cmp(b));
        let n = sorted.len();
        let (avg, p95) = if n == 0 {
            (0.0, 0.0)
        } else {
            let idx = ((n as f64 * 0.95) as usize).min(n - 1);
            (sorted.iter().sum::<f64>() / n as f64, sorted[idx])
        };
        Self {
            total_requests: n,
            success_count,
            avg_duration_ms: avg,
            p95_duration_ms: p95,
            total_time_ms,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ApiExchange {
    pub request: ApiRequest,
    pub response: ApiResponse,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ApiSummary {
    pub total_steps: usize,
    pub successful_steps: usize,
    pub total_duration_ms: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EndpointInfo {
    pub method: String,
    pub path: String,
    pub summary: String,
    pub tags: Vec<String>,
}

/// HTTP adapter. Stateless per call apart from a bounded exchange history.
pub struct ApiExecutor {
    config: ApiConfig,
    client: Option<Client>,
    history: Mutex<Vec<ApiExchange>>,
}

impl ApiExecutor {
    pub fn new(config: ApiConfig) -> Self {
        Self {
            config,
            client: None,
            history: Mutex::new(Vec::new()),
        }
    }

    fn build_client(&self) -> Result<Client> {
        Client::builder()
            .timeout(Duration::from_millis(self.config.timeout_ms))
            .build()
            .map_err(|e| EngineError::Config(format!("api http client: {}", e)))
    }

    pub fn resolve_url(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            return path.to_string();
        }
        match &self.config.base_url {
            Some(base) => format!("{}/{}", base.trim_end_matches('/'), path.trim_start_matches('/')),
            None => path.to_string(),
        }
    }

    pub fn history(&self) -> Vec<ApiExchange> {
        self.history.lock().map(|h| h.clone()).unwrap_or_default()
    }

    pub fn summary(&self) -> ApiSummary {
        let history = self.history();
        ApiSummary {
            total_steps: history.len(),
            successful_steps: history.iter().filter(|x| x.response.success).count(),
            total_duration_ms: history.iter().map(|x| x.response.duration_ms).sum(),
        }
    }

    fn record(&self, request: &ApiRequest, response: &ApiResponse) {
        if let Ok(mut history) = self.history.lock() {
            if history.len() >= HISTORY_LIMIT {
                let excess = history.len() + 1 - HISTORY_LIMIT;
                history.drain(..excess);
            }
            history.push(ApiExchange {
                request: request.clone(),
                response: response.clone(),
            });
        }
    }

    async fn send_once(&self, client: &Client, request: &ApiRequest) -> Result<reqwest::Response> {
        let method = Method::from_bytes(request.method.as_bytes())
            .map_err(|_| EngineError::InvalidParams(format!("bad HTTP method '{}'", request.method)))?;
        let mut builder = client.request(method, self.resolve_url(&request.path));
        for (k, v) in self.config.headers.iter().chain(request.headers.iter()) {
            builder = builder.header(k.as_str(), v.as_str());
        }
        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }
        Ok(builder.send().await?)
    }
}

pub fn endpoints_from_openapi(doc: &Value) -> Vec<EndpointInfo> {
    let mut endpoints = Vec::new();
    let Some(paths) = doc.get("paths").and_then(Value::as_object) else {
        return endpoints;
    };
    for (path, methods) in paths {
        let Some(methods) = methods.as_object() else { continue };
        for (method, details) in methods {
            if !matches!(
                method.as_str(),
                "get" | "post" | "put" | "patch" | "delete" | "head" | "options"
            ) {
                continue;
            }
            endpoints.push(EndpointInfo {
                method: method.to_uppercase(),
                path: path.clone(),
                summary: details.get("summary").and_then(Value::as_str).unwrap_or_default().to_string(),
                tags: details
                    .get("tags")
                    .and_then(Value::as_array)
                    .map(|t| t.iter().filter_map(Value::as_str).map(str::to_string).collect())
                    .unwrap_or_default(),
            });
        }
    }
    endpoints
}

async fn read_body(res: reqwest::Response) -> (u16, BTreeMap<String, String>, Value) {
    let status = res.status().as_u16();
    let headers: BTreeMap<String, String> = res
        .headers()
        .iter()
        .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.as_str().to_string(), v.to_string())))
        .collect();
    let is_json = headers
        .get("content-type")
        .map(|ct| ct.contains("application/json"))
        .unwrap_or(false);
    let text = res.text().await.unwrap_or_default();
    let body = if is_json {
        serde_json::from_str(&text).unwrap_or(Value::String(text))
    } else {
        Value::String(text)
    };
    (status, headers, body)
}

#[async_trait]
impl PlatformExecutor for ApiExecutor {
    fn platform(&self) -> Platform {
        Platform::Api
    }

    async fn start(&mut self) -> Result<()> {
        if self.client.is_none() {
            self.client = Some(self.build_client()?);
        }
        Ok(())
    }

    async fn stop(&mut self) -> Result<()> {
        self.client = None;
        Ok(())
    }

    fn requests(&mut self) -> Option<&mut dyn RequestExecutor> {
        Some(self)
    }
}

#[async_trait]
impl RequestExecutor for ApiExecutor {
    /// Never errors: transport failures come back as `success = false` with `error` set.
    async fn execute_step(&self, request: &ApiRequest) -> ApiResponse {
        let started = Instant::now();
        let Some(client) = self.client.as_ref() else {
            return ApiResponse::failed(EngineError::NotStarted(Platform::Api).to_string(), 0.0, 0);
        };

        info!("[API] {} {}", request.method, self.resolve_url(&request.path));
        let retry = RetryConfig::fixed(self.config.max_retries, self.config.retry_delay_ms);
        let (result, attempts) = with_retry_when(
            &retry,
            "api request",
            || self.send_once(client, request),
            |r| match r {
                Ok(res) => res.status().is_server_error(),
                Err(e) => e.is_transient(),
            },
        )
        .await;

        let response = match result {
            Ok(res) => {
                let (status, headers, body) = read_body(res).await;
                let success = (200..300).contains(&status);
                ApiResponse {
                    status_code: Some(status),
                    success,
                    duration_ms: started.elapsed().as_secs_f64() * 1000.0,
                    body,
                    headers,
                    attempts,
                    timestamp: Utc::now(),
                    error: (!success).then(|| format!("unexpected status {}", status)),
                }
            }
            Err(e) => {
                warn!("[API] {} {} failed: {}", request.method, request.path, e);
                ApiResponse::failed(e.to_string(), started.elapsed().as_secs_f64() * 1000.0, attempts)
            }
        };
        self.record(request, &response);
        response
    }
}

/// JSON body helper used by the GraphQL action.
pub fn graphql_body(query: &str, variables: Option<Value>) -> Value {
    json!({ "query": query, "variables": variables.unwrap_or_else(|| json!({})) })
}
