//! In-crate fakes for the oracle, detector, drivers and executors.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Bytes;
use axum::http::{Method, StatusCode, Uri};
use axum::response::IntoResponse;
use axum::{Json, Router};
use base64::{engine::general_purpose, Engine as _};
use chrono::Utc;
use serde_json::{json, Value};

use crate::error::{EngineError, Result};
use crate::oracle::{
    BoundingBox, DetectedElement, DiagnosisOracle, DiagnosisRequest, ElementDetector, HealingAction,
    HealingReport, RootCauseCategory, Severity,
};
use crate::platform::webdriver::ELEMENT_KEY;
use crate::platform::{ApiRequest, ApiResponse, PlatformExecutor, RequestExecutor, UiDriver};
use crate::schema::Platform;
use crate::screen::{png_fixture, VisionImage};

pub fn report(action: HealingAction) -> HealingReport {
    HealingReport {
        root_cause: "scripted".to_string(),
        root_cause_category: RootCauseCategory::Other,
        suggestion: "scripted suggestion".to_string(),
        self_healing_action: action,
        new_selector: None,
        severity: Severity::Low,
        confidence: 0.8,
        human_explanation: "Root cause: scripted. Fix: scripted suggestion.".to_string(),
    }
}

pub fn element(label: &str, confidence: f32, b: [f64; 4]) -> DetectedElement {
    DetectedElement {
        label: label.to_string(),
        bounding_box: BoundingBox {
            xmin: b[0],
            ymin: b[1],
            xmax: b[2],
            ymax: b[3],
        },
        confidence,
    }
}

// =====================================================
// ORACLE / DETECTOR
// =====================================================

enum OracleMode {
    Replying(HealingReport),
    Failing(Mutex<Option<EngineError>>),
    Hanging,
}

pub struct ScriptedOracle {
    mode: OracleMode,
    calls: AtomicUsize,
    last_request: Mutex<Option<DiagnosisRequest>>,
}

impl ScriptedOracle {
    fn with_mode(mode: OracleMode) -> Self {
        Self {
            mode,
            calls: AtomicUsize::new(0),
            last_request: Mutex::new(None),
        }
    }

    pub fn replying(report: HealingReport) -> Self {
        Self::with_mode(OracleMode::Replying(report))
    }

    pub fn failing(err: EngineError) -> Self {
        Self::with_mode(OracleMode::Failing(Mutex::new(Some(err))))
    }

    pub fn hanging() -> Self {
        Self::with_mode(OracleMode::Hanging)
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn last_request(&self) -> Option<DiagnosisRequest> {
        self.last_request.lock().unwrap().clone()
    }
}

#[async_trait]
impl DiagnosisOracle for ScriptedOracle {
    async fn diagnose(&self, request: &DiagnosisRequest) -> Result<HealingReport> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.last_request.lock().unwrap() = Some(request.clone());
        match &self.mode {
            OracleMode::Replying(report) => Ok(report.clone()),
            OracleMode::Failing(err) => {
                let scripted = err.lock().unwrap().take();
                Err(scripted.unwrap_or_else(|| EngineError::OracleUnreachable("scripted failure".into())))
            }
            OracleMode::Hanging => std::future::pending().await,
        }
    }
}

pub struct StaticDetector {
    elements: Option<Vec<DetectedElement>>,
}

impl StaticDetector {
    pub fn returning(elements: Vec<DetectedElement>) -> Self {
        Self { elements: Some(elements) }
    }

    pub fn failing() -> Self {
        Self { elements: None }
    }
}

#[async_trait]
impl ElementDetector for StaticDetector {
    async fn detect_elements(&self, _image: &VisionImage, _prompt: &str) -> Result<Vec<DetectedElement>> {
        self.elements
            .clone()
            .ok_or_else(|| EngineError::OracleUnreachable("detector offline".into()))
    }
}

// =====================================================
// UI DRIVER
// =====================================================

/// Everything a `FakeDriver` was asked to do. Shared so tests can inspect it
/// after the driver has been moved into an orchestrator.
#[derive(Default)]
pub struct DriverLog {
    clicks: Mutex<Vec<String>>,
    typed: Mutex<Vec<(String, String)>>,
    navigations: Mutex<Vec<String>>,
    scrolls: Mutex<Vec<String>>,
    points: Mutex<Vec<(f64, f64)>>,
    text_clicks: Mutex<Vec<String>>,
    starts: AtomicUsize,
    stops: AtomicUsize,
}

impl DriverLog {
    pub fn clicks(&self) -> Vec<String> {
        self.clicks.lock().unwrap().clone()
    }

    pub fn typed(&self) -> Vec<(String, String)> {
        self.typed.lock().unwrap().clone()
    }

    pub fn navigations(&self) -> Vec<String> {
        self.navigations.lock().unwrap().clone()
    }

    pub fn scrolls(&self) -> Vec<String> {
        self.scrolls.lock().unwrap().clone()
    }

    pub fn points(&self) -> Vec<(f64, f64)> {
        self.points.lock().unwrap().clone()
    }

    pub fn text_clicks(&self) -> Vec<String> {
        self.text_clicks.lock().unwrap().clone()
    }

    pub fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    pub fn stops(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }
}

pub struct FakeDriver {
    platform: Platform,
    missing: HashSet<String>,
    hidden: HashSet<String>,
    failing_clicks: usize,
    visible_texts: Vec<String>,
    broken_screenshots: bool,
    panic_on: Option<String>,
    log: Arc<DriverLog>,
}

impl FakeDriver {
    pub fn new() -> Self {
        Self {
            platform: Platform::Web,
            missing: HashSet::new(),
            hidden: HashSet::new(),
            failing_clicks: 0,
            visible_texts: Vec::new(),
            broken_screenshots: false,
            panic_on: None,
            log: Arc::new(DriverLog::default()),
        }
    }

    pub fn on(mut self, platform: Platform) -> Self {
        self.platform = platform;
        self
    }

    /// Clicks and types on `target` always fail with `ActionNotFound`.
    pub fn missing(mut self, target: &str) -> Self {
        self.missing.insert(target.to_string());
        self
    }

    /// `verify(target)` answers false.
    pub fn hidden(mut self, target: &str) -> Self {
        self.hidden.insert(target.to_string());
        self
    }

    /// The next `n` clicks fail regardless of target.
    pub fn failing_clicks(mut self, n: usize) -> Self {
        self.failing_clicks = n;
        self
    }

    pub fn with_visible_text(mut self, text: &str) -> Self {
        self.visible_texts.push(text.to_lowercase());
        self
    }

    pub fn broken_screenshots(mut self) -> Self {
        self.broken_screenshots = true;
        self
    }

    pub fn panicking_on(mut self, target: &str) -> Self {
        self.panic_on = Some(target.to_string());
        self
    }

    pub fn log(&self) -> Arc<DriverLog> {
        self.log.clone()
    }
}

#[async_trait]
impl UiDriver for FakeDriver {
    async fn navigate(&mut self, url: &str) -> Result<()> {
        self.log.navigations.lock().unwrap().push(url.to_string());
        Ok(())
    }

    async fn click(&mut self, target: &str, _wait: Duration) -> Result<()> {
        self.log.clicks.lock().unwrap().push(target.to_string());
        if self.panic_on.as_deref() == Some(target) {
            panic!("driver crashed on {}", target);
        }
        if self.failing_clicks > 0 {
            self.failing_clicks -= 1;
            return Err(EngineError::not_found(target, "scripted failure"));
        }
        if self.missing.contains(target) {
            return Err(EngineError::not_found(target, "not in fake DOM"));
        }
        Ok(())
    }

    async fn type_text(&mut self, target: &str, text: &str, _wait: Duration) -> Result<()> {
        if self.missing.contains(target) {
            return Err(EngineError::not_found(target, "not in fake DOM"));
        }
        self.log.typed.lock().unwrap().push((target.to_string(), text.to_string()));
        Ok(())
    }

    async fn verify(&mut self, target: &str, _wait: Duration) -> Result<bool> {
        Ok(!self.hidden.contains(target) && !self.missing.contains(target))
    }

    async fn screenshot(&mut self) -> Result<Vec<u8>> {
        if self.broken_screenshots {
            return Err(EngineError::Driver("screen capture unavailable".into()));
        }
        Ok(png_fixture(200, 100))
    }

    async fn scroll_into_view(&mut self, target: &str) -> Result<()> {
        self.log.scrolls.lock().unwrap().push(target.to_string());
        Ok(())
    }

    async fn click_at(&mut self, x: f64, y: f64) -> Result<()> {
        self.log.points.lock().unwrap().push((x, y));
        Ok(())
    }

    async fn click_text(&mut self, text: &str) -> Result<bool> {
        let needle = text.to_lowercase();
        if self.visible_texts.iter().any(|t| t.contains(&needle)) {
            self.log.text_clicks.lock().unwrap().push(text.to_string());
            return Ok(true);
        }
        Ok(false)
    }
}

#[async_trait]
impl PlatformExecutor for FakeDriver {
    fn platform(&self) -> Platform {
        self.platform
    }

    async fn start(&mut self) -> Result<()> {
        self.log.starts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn stop(&mut self) -> Result<()> {
        self.log.stops.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn ui(&mut self) -> Option<&mut dyn UiDriver> {
        Some(self)
    }
}

// =====================================================
// NON-UI EXECUTOR
// =====================================================

#[derive(Default)]
pub struct ExecutorRecorder {
    starts: AtomicUsize,
    stops: AtomicUsize,
    requests: Mutex<Vec<ApiRequest>>,
}

impl ExecutorRecorder {
    pub fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    pub fn stops(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<ApiRequest> {
        self.requests.lock().unwrap().clone()
    }
}

/// Lifecycle-only executor; with `responding` it also answers HTTP requests.
pub struct FakeExecutor {
    platform: Platform,
    fail_start: bool,
    responses: Option<BTreeMap<String, (u16, Value)>>,
    recorder: Arc<ExecutorRecorder>,
}

impl FakeExecutor {
    pub fn new(platform: Platform) -> Self {
        Self {
            platform,
            fail_start: false,
            responses: None,
            recorder: Arc::new(ExecutorRecorder::default()),
        }
    }

    pub fn failing_start(mut self) -> Self {
        self.fail_start = true;
        self
    }

    /// Answer `path` with `status` and `body`; unknown paths get 404.
    pub fn responding(mut self, path: &str, status: u16, body: Value) -> Self {
        self.responses
            .get_or_insert_with(BTreeMap::new)
            .insert(path.to_string(), (status, body));
        self
    }

    pub fn recorder(&self) -> Arc<ExecutorRecorder> {
        self.recorder.clone()
    }
}

#[async_trait]
impl PlatformExecutor for FakeExecutor {
    fn platform(&self) -> Platform {
        self.platform
    }

    async fn start(&mut self) -> Result<()> {
        self.recorder.starts.fetch_add(1, Ordering::SeqCst);
        if self.fail_start {
            return Err(EngineError::Driver("scripted start failure".into()));
        }
        Ok(())
    }

    async fn stop(&mut self) -> Result<()> {
        self.recorder.stops.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn requests(&mut self) -> Option<&mut dyn RequestExecutor> {
        if self.responses.is_some() {
            Some(self)
        } else {
            None
        }
    }
}

#[async_trait]
impl RequestExecutor for FakeExecutor {
    async fn execute_step(&self, request: &ApiRequest) -> ApiResponse {
        self.recorder.requests.lock().unwrap().push(request.clone());
        let (status, body) = self
            .responses
            .as_ref()
            .and_then(|r| r.get(&request.path).cloned())
            .unwrap_or((404, Value::Null));
        let success = (200..300).contains(&status);
        ApiResponse {
            status_code: Some(status),
            success,
            duration_ms: 1.0,
            body,
            headers: BTreeMap::new(),
            attempts: 1,
            timestamp: Utc::now(),
            error: (!success).then(|| format!("unexpected status {}", status)),
        }
    }
}

// =====================================================
// WEBDRIVER STUB SERVER
// =====================================================

/// Tiny W3C WebDriver endpoint. Elements in `known` exist and are displayed;
/// everything else is "no such element". Known selectors containing `stale`
/// go stale as soon as they are clicked.
pub struct WireStub {
    pub url: String,
    calls: Arc<Mutex<Vec<String>>>,
}

impl WireStub {
    pub async fn spawn(known: &[&str]) -> Self {
        let known: Arc<HashSet<String>> = Arc::new(known.iter().map(|s| s.to_string()).collect());
        let calls = Arc::new(Mutex::new(Vec::new()));
        let log = calls.clone();
        let app = Router::new().fallback(move |method: Method, uri: Uri, body: Bytes| {
            let known = known.clone();
            let log = log.clone();
            async move { wire_route(&known, &log, method, uri.path(), &body) }
        });
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        Self {
            url: format!("http://{}", addr),
            calls,
        }
    }

    /// Calls matching a label such as `"POST /session"` or `"POST /click"`.
    pub fn count(&self, label: &str) -> usize {
        self.calls.lock().unwrap().iter().filter(|c| *c == label).count()
    }
}

fn wire_route(
    known: &HashSet<String>,
    log: &Mutex<Vec<String>>,
    method: Method,
    path: &str,
    body: &[u8],
) -> axum::response::Response {
    let segments: Vec<&str> = path.trim_matches('/').split('/').collect();
    let label = match segments.as_slice() {
        ["status"] => "/status".to_string(),
        ["session"] => "/session".to_string(),
        ["session", _] => "/session".to_string(),
        [.., last] => format!("/{}", last),
        [] => "/".to_string(),
    };
    log.lock().unwrap().push(format!("{} {}", method, label));

    let request: Value = serde_json::from_slice(body).unwrap_or(Value::Null);
    let ok = |value: Value| Json(json!({ "value": value })).into_response();

    match (method.as_str(), segments.as_slice()) {
        ("GET", ["status"]) => ok(json!({ "ready": true, "message": "stub" })),
        ("POST", ["session"]) => ok(json!({ "sessionId": "stub-session", "capabilities": {} })),
        ("POST", ["session", _, "element"]) => {
            let wanted = request["value"].as_str().unwrap_or_default().to_string();
            if known.contains(&wanted) {
                ok(json!({ ELEMENT_KEY: stub_element_id(&wanted) }))
            } else {
                (
                    StatusCode::NOT_FOUND,
                    Json(json!({ "value": { "error": "no such element", "message": wanted } })),
                )
                    .into_response()
            }
        }
        ("POST", ["session", _, "elements"]) => {
            let wanted = request["value"].as_str().unwrap_or_default().to_string();
            let found: Vec<Value> = if known.contains(&wanted) {
                vec![json!({ ELEMENT_KEY: stub_element_id(&wanted) })]
            } else {
                Vec::new()
            };
            ok(Value::Array(found))
        }
        ("GET", ["session", _, "element", _, "displayed"]) => ok(json!(true)),
        ("POST", ["session", _, "element", id, "click"]) if id.contains("stale") => (
            StatusCode::NOT_FOUND,
            Json(json!({ "value": { "error": "stale element reference", "message": "element is detached" } })),
        )
            .into_response(),
        ("GET", ["session", _, "screenshot"]) => {
            ok(json!(general_purpose::STANDARD.encode(png_fixture(20, 10))))
        }
        _ => ok(Value::Null),
    }
}

fn stub_element_id(selector: &str) -> String {
    let safe: String = selector
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    format!("el-{}", safe)
}
