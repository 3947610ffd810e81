//! Per-platform executor capabilities.
//!
//! Every executor implements `PlatformExecutor` (lifecycle) and exposes the
//! capability families it supports: screen-driven UI primitives, touch
//! gestures, HTTP requests, or SQL queries.

pub mod api;
pub mod database;
pub mod desktop;
pub mod mobile;
pub mod web;
pub mod webdriver;

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{json, Value};

use crate::error::{EngineError, Result};
use crate::schema::Platform;

pub use api::{ApiConfig, ApiExecutor, ApiRequest, ApiResponse, EndpointInfo, LoadTestReport};
pub use database::{DatabaseConfig, DatabaseExecutor, QueryOutcome};
pub use desktop::{DesktopConfig, DesktopExecutor};
pub use mobile::{MobileConfig, MobileExecutor, MobileOs};
pub use web::{WebConfig, WebExecutor};

/// Most recent requests or queries an executor keeps in its history.
pub const HISTORY_LIMIT: usize = 200;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Ready {
    pub platform: Platform,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Released {
    pub platform: Platform,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthStatus {
    pub platform: Platform,
    pub ready: bool,
    pub detail: String,
}

impl HealthStatus {
    pub fn ready(platform: Platform) -> Self {
        Self {
            platform,
            ready: true,
            detail: "ready".to_string(),
        }
    }

    pub fn unavailable(platform: Platform, detail: impl Into<String>) -> Self {
        Self {
            platform,
            ready: false,
            detail: detail.into(),
        }
    }
}

#[async_trait]
pub trait PlatformExecutor: Send {
    fn platform(&self) -> Platform;

    /// Acquire the executor's I/O resource (session, connection, client).
    async fn start(&mut self) -> Result<()>;

    /// Release everything `start` acquired. Must tolerate a failed or missing `start`.
    async fn stop(&mut self) -> Result<()>;

    async fn health_check(&mut self) -> HealthStatus {
        HealthStatus::ready(self.platform())
    }

    fn ui(&mut self) -> Option<&mut dyn UiDriver> {
        None
    }

    fn touch(&mut self) -> Option<&mut dyn TouchDriver> {
        None
    }

    fn requests(&mut self) -> Option<&mut dyn RequestExecutor> {
        None
    }

    fn queries(&mut self) -> Option<&mut dyn QueryExecutor> {
        None
    }
}

/// Screen-level primitives. `verify` is the only call whose negative answer
/// is a value rather than an error.
#[async_trait]
pub trait UiDriver: Send {
    async fn navigate(&mut self, url: &str) -> Result<()>;
    async fn click(&mut self, target: &str, wait: Duration) -> Result<()>;
    async fn type_text(&mut self, target: &str, text: &str, wait: Duration) -> Result<()>;
    async fn verify(&mut self, target: &str, wait: Duration) -> Result<bool>;
    async fn screenshot(&mut self) -> Result<Vec<u8>>;
    async fn scroll_into_view(&mut self, target: &str) -> Result<()>;
    /// Click absolute screen coordinates.
    async fn click_at(&mut self, x: f64, y: f64) -> Result<()>;
    /// Click the first visible control whose text contains `text`, ignoring case.
    /// Returns false when no such control is on screen.
    async fn click_text(&mut self, text: &str) -> Result<bool>;
}

#[async_trait]
pub trait TouchDriver: Send {
    async fn tap(&mut self, x: i64, y: i64) -> Result<()>;
    async fn swipe(&mut self, start: (i64, i64), end: (i64, i64), duration_ms: u64) -> Result<()>;
}

#[async_trait]
pub trait RequestExecutor: Send + Sync {
    async fn execute_step(&self, request: &ApiRequest) -> ApiResponse;

    /// Fire `count` identical requests concurrently and aggregate latencies.
    async fn load_test(&self, request: &ApiRequest, count: usize) -> LoadTestReport {
        let started = std::time::Instant::now();
        let calls = (0..count).map(|_| self.execute_step(request));
        let responses = futures::future::join_all(calls).await;
        let durations: Vec<f64> = responses.iter().map(|r| r.duration_ms).collect();
        let successes = responses.iter().filter(|r| r.success).count();
        LoadTestReport::from_durations(
            &durations,
            successes,
            started.elapsed().as_secs_f64() * 1000.0,
        )
    }

    async fn graphql_query(&self, path: &str, query: &str, variables: Option<Value>) -> ApiResponse {
        let request = ApiRequest {
            method: "POST".to_string(),
            path: path.to_string(),
            body: Some(api::graphql_body(query, variables)),
            ..ApiRequest::default()
        };
        self.execute_step(&request).await
    }

    /// Fetch an OpenAPI/Swagger document and list its operations.
    async fn parse_swagger(&self, path: &str) -> Result<Vec<EndpointInfo>> {
        let request = ApiRequest {
            method: "GET".to_string(),
            path: path.to_string(),
            ..ApiRequest::default()
        };
        let response = self.execute_step(&request).await;
        if !response.success {
            let message = response.error.unwrap_or_else(|| "swagger document unavailable".to_string());
            return Err(match response.status_code {
                Some(status) => EngineError::PermanentRequest { status, message },
                None => EngineError::TransientTransport(message),
            });
        }
        Ok(api::endpoints_from_openapi(&response.body))
    }
}

#[async_trait]
pub trait QueryExecutor: Send {
    async fn execute_query(&mut self, sql: &str, params: &Value) -> QueryOutcome;

    /// Compare a table's columns against `expected`.
    async fn validate_schema(&mut self, table: &str, expected: &[String]) -> Value {
        let table = match database::checked_identifier(table) {
            Ok(t) => t,
            Err(e) => return json!({ "success": false, "table": table, "error": e.to_string() }),
        };
        let outcome = self
            .execute_query(&format!("PRAGMA table_info(\"{}\")", table), &Value::Null)
            .await;
        if !outcome.success {
            return json!({ "success": false, "table": table, "error": outcome.error });
        }
        let actual: Vec<String> = outcome
            .rows
            .iter()
            .filter_map(|row| row.get("name").and_then(Value::as_str).map(str::to_string))
            .collect();
        let missing: Vec<&String> = expected.iter().filter(|c| !actual.contains(c)).collect();
        json!({
            "success": !actual.is_empty() && missing.is_empty(),
            "table": table,
            "actual_columns": actual,
            "missing_columns": missing,
            "duration_ms": outcome.duration_ms,
        })
    }

    async fn check_table_count(&mut self, table: &str, min_expected: i64) -> Value {
        let table = match database::checked_identifier(table) {
            Ok(t) => t,
            Err(e) => return json!({ "success": false, "table": table, "error": e.to_string() }),
        };
        let outcome = self
            .execute_query(&format!("SELECT COUNT(*) AS count FROM \"{}\"", table), &Value::Null)
            .await;
        if !outcome.success {
            return json!({ "success": false, "table": table, "error": outcome.error });
        }
        let count = outcome
            .rows
            .first()
            .and_then(|row| row.get("count"))
            .and_then(Value::as_i64)
            .unwrap_or(0);
        json!({
            "success": true,
            "table": table,
            "count": count,
            "validation_passed": count >= min_expected,
        })
    }
}
