//! Minimal W3C WebDriver client shared by the browser, Appium and WinAppDriver executors.

use std::time::{Duration, Instant};

use base64::{engine::general_purpose, Engine as _};
use reqwest::{Client, Method};
use serde_json::{json, Value};
use tracing::debug;

use crate::error::{EngineError, Result};
use crate::schema::Platform;

/// W3C element reference key.
pub const ELEMENT_KEY: &str = "element-6066-11e4-a52e-4f735466cecf";

const POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Which locator conventions apply to bare selectors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    Browser,
    Appium,
    WinAppDriver,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Locator {
    pub using: &'static str,
    pub value: String,
}

impl Locator {
    pub fn new(using: &'static str, value: impl Into<String>) -> Self {
        Self {
            using,
            value: value.into(),
        }
    }

    pub fn parse(target: &str, dialect: Dialect) -> Self {
        let target = target.trim();
        if let Some(rest) = target.strip_prefix("xpath=") {
            return Self::new("xpath", rest);
        }
        if target.starts_with("//") || target.starts_with("(//") {
            return Self::new("xpath", target);
        }
        if let Some(rest) = target.strip_prefix("text=") {
            return Self::text_match(rest, dialect);
        }

        match dialect {
            Dialect::Browser => {
                if let Some(rest) = target.strip_prefix("link=") {
                    Self::new("link text", rest)
                } else if let Some(rest) = target.strip_prefix("css=") {
                    Self::new("css selector", rest)
                } else {
                    Self::new("css selector", target)
                }
            }
            Dialect::Appium => {
                if let Some(rest) = target.strip_prefix("accessibility_id=") {
                    Self::new("accessibility id", rest)
                } else if let Some(rest) = target.strip_prefix('~') {
                    Self::new("accessibility id", rest)
                } else if let Some(rest) = target.strip_prefix("class=") {
                    Self::new("class name", rest)
                } else if let Some(rest) = target.strip_prefix("id=") {
                    Self::new("id", rest)
                } else {
                    Self::new("id", target)
                }
            }
            Dialect::WinAppDriver => {
                if let Some(rest) = target.strip_prefix("id=") {
                    Self::new("accessibility id", rest)
                } else if let Some(rest) = target.strip_prefix("class=") {
                    Self::new("class name", rest)
                } else if let Some(rest) = target.strip_prefix("name=") {
                    Self::new("name", rest)
                } else {
                    Self::new("name", target)
                }
            }
        }
    }

    /// Case-insensitive "contains text" match as an XPath expression.
    pub fn text_match(text: &str, dialect: Dialect) -> Self {
        let needle = xpath_literal(&text.to_lowercase());
        let fold = |expr: &str| {
            format!(
                "contains(translate({}, 'ABCDEFGHIJKLMNOPQRSTUVWXYZ', 'abcdefghijklmnopqrstuvwxyz'), {})",
                expr, needle
            )
        };
        let xpath = match dialect {
            Dialect::Browser => format!("//*[{}]", fold("normalize-space(.)")),
            Dialect::Appium => format!("//*[{} or {} or {}]", fold("@text"), fold("@label"), fold("@name")),
            Dialect::WinAppDriver => format!("//*[{}]", fold("@Name")),
        };
        Self::new("xpath", xpath)
    }
}

fn xpath_literal(text: &str) -> String {
    if !text.contains('\'') {
        return format!("'{}'", text);
    }
    if !text.contains('"') {
        return format!("\"{}\"", text);
    }
    let parts: Vec<String> = text.split('\'').map(|p| format!("'{}'", p)).collect();
    format!("concat({})", parts.join(", \"'\", "))
}

/// `"x,y"` targets address screen coordinates directly.
pub fn parse_point(target: &str) -> Option<(f64, f64)> {
    let (x, y) = target.split_once(',')?;
    Some((x.trim().parse().ok()?, y.trim().parse().ok()?))
}

pub struct WireClient {
    platform: Platform,
    http: Client,
    base_url: String,
    session_id: Option<String>,
}

impl WireClient {
    pub fn new(platform: Platform, base_url: &str, request_timeout: Duration) -> Result<Self> {
        let http = Client::builder()
            .no_proxy()
            .timeout(request_timeout)
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| EngineError::Config(format!("driver http client: {}", e)))?;
        Ok(Self {
            platform,
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            session_id: None,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    fn session(&self) -> Result<&str> {
        self.session_id
            .as_deref()
            .ok_or(EngineError::NotStarted(self.platform))
    }

    async fn command(&self, method: Method, path: &str, body: Option<Value>) -> Result<Value> {
        self.command_for(method, path, body, path).await
    }

    /// Like `command`, but a missing-element error names `subject`.
    async fn command_for(&self, method: Method, path: &str, body: Option<Value>, subject: &str) -> Result<Value> {
        let url = format!("{}{}", self.base_url, path);
        debug!("[WebDriver] {} {}", method, url);
        let mut req = self.http.request(method, &url);
        if let Some(body) = body {
            req = req.json(&body);
        }
        let res = req.send().await?;
        let status = res.status();
        let text = res.text().await?;
        let payload: Value = serde_json::from_str(&text).unwrap_or(Value::Null);

        if status.is_success() {
            return Ok(payload.get("value").cloned().unwrap_or(Value::Null));
        }
        Err(wire_error(status.as_u16(), &payload, &text, subject))
    }

    pub async fn status(&self) -> Result<Value> {
        self.command(Method::GET, "/status", None).await
    }

    pub async fn new_session(&mut self, capabilities: Value) -> Result<String> {
        let body = json!({ "capabilities": { "alwaysMatch": capabilities } });
        let value = self.command(Method::POST, "/session", Some(body)).await?;
        let session_id = value
            .get("sessionId")
            .and_then(Value::as_str)
            .ok_or_else(|| EngineError::Driver(format!("session response without sessionId: {}", value)))?
            .to_string();
        self.session_id = Some(session_id.clone());
        Ok(session_id)
    }

    /// Ends the session if one is open. The id is forgotten even when the driver errors.
    pub async fn delete_session(&mut self) -> Result<()> {
        let Some(session_id) = self.session_id.take() else {
            return Ok(());
        };
        self.command(Method::DELETE, &format!("/session/{}", session_id), None)
            .await
            .map(|_| ())
    }

    pub async fn navigate(&self, url: &str) -> Result<()> {
        let path = format!("/session/{}/url", self.session()?);
        self.command(Method::POST, &path, Some(json!({ "url": url }))).await?;
        Ok(())
    }

    /// `None` when nothing matches right now.
    pub async fn find_element(&self, locator: &Locator) -> Result<Option<String>> {
        let path = format!("/session/{}/element", self.session()?);
        let body = json!({ "using": locator.using, "value": locator.value });
        match self.command_for(Method::POST, &path, Some(body), &locator.value).await {
            Ok(value) => Ok(element_id(&value)),
            Err(EngineError::ActionNotFound { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub async fn find_elements(&self, locator: &Locator) -> Result<Vec<String>> {
        let path = format!("/session/{}/elements", self.session()?);
        let body = json!({ "using": locator.using, "value": locator.value });
        let value = match self.command_for(Method::POST, &path, Some(body), &locator.value).await {
            Ok(value) => value,
            Err(EngineError::ActionNotFound { .. }) => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        Ok(value
            .as_array()
            .map(|items| items.iter().filter_map(element_id).collect())
            .unwrap_or_default())
    }

    /// Poll until a displayed element matches or `wait` runs out.
    pub async fn wait_for_visible(&self, locator: &Locator, wait: Duration) -> Result<Option<String>> {
        let deadline = Instant::now() + wait;
        loop {
            if let Some(id) = self.find_element(locator).await? {
                if self.is_displayed(&id).await.unwrap_or(false) {
                    return Ok(Some(id));
                }
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(POLL_INTERVAL.min(deadline - now)).await;
        }
    }

    pub async fn click_element(&self, element_id: &str) -> Result<()> {
        let path = format!("/session/{}/element/{}/click", self.session()?, element_id);
        self.command(Method::POST, &path, Some(json!({}))).await?;
        Ok(())
    }

    pub async fn clear_element(&self, element_id: &str) -> Result<()> {
        let path = format!("/session/{}/element/{}/clear", self.session()?, element_id);
        self.command(Method::POST, &path, Some(json!({}))).await?;
        Ok(())
    }

    pub async fn send_keys(&self, element_id: &str, text: &str) -> Result<()> {
        let path = format!("/session/{}/element/{}/value", self.session()?, element_id);
        let chars: Vec<String> = text.chars().map(String::from).collect();
        self.command(Method::POST, &path, Some(json!({ "text": text, "value": chars })))
            .await?;
        Ok(())
    }

    pub async fn is_displayed(&self, element_id: &str) -> Result<bool> {
        let path = format!("/session/{}/element/{}/displayed", self.session()?, element_id);
        let value = self.command(Method::GET, &path, None).await?;
        Ok(value.as_bool().unwrap_or(false))
    }

    pub async fn active_element(&self) -> Result<String> {
        let path = format!("/session/{}/element/active", self.session()?);
        let value = self.command(Method::GET, &path, None).await?;
        element_id(&value).ok_or_else(|| EngineError::not_found("<focused element>", "no active element"))
    }

    /// PNG bytes of the current screen.
    pub async fn screenshot(&self) -> Result<Vec<u8>> {
        let path = format!("/session/{}/screenshot", self.session()?);
        let value = self.command(Method::GET, &path, None).await?;
        let encoded = value
            .as_str()
            .ok_or_else(|| EngineError::Driver("screenshot response was not a string".to_string()))?;
        general_purpose::STANDARD
            .decode(encoded)
            .map_err(|e| EngineError::Driver(format!("screenshot base64: {}", e)))
    }

    pub async fn execute_script(&self, script: &str, args: Vec<Value>) -> Result<Value> {
        let path = format!("/session/{}/execute/sync", self.session()?);
        self.command(Method::POST, &path, Some(json!({ "script": script, "args": args })))
            .await
    }

    pub async fn perform_actions(&self, actions: Value) -> Result<()> {
        let path = format!("/session/{}/actions", self.session()?);
        self.command(Method::POST, &path, Some(json!({ "actions": actions })))
            .await?;
        Ok(())
    }

    pub async fn pointer_click(&self, x: f64, y: f64, pointer_type: &str) -> Result<()> {
        self.perform_actions(pointer_sequence(
            pointer_type,
            (x.round() as i64, y.round() as i64),
            None,
        ))
        .await
    }

    pub async fn pointer_drag(
        &self,
        start: (i64, i64),
        end: (i64, i64),
        duration_ms: u64,
        pointer_type: &str,
    ) -> Result<()> {
        self.perform_actions(pointer_sequence(pointer_type, start, Some((end, duration_ms))))
            .await
    }
}

/// One pointer source: move, press, optional drag, release.
pub fn pointer_sequence(pointer_type: &str, start: (i64, i64), drag: Option<((i64, i64), u64)>) -> Value {
    let mut steps = vec![
        json!({ "type": "pointerMove", "duration": 0, "origin": "viewport", "x": start.0, "y": start.1 }),
        json!({ "type": "pointerDown", "button": 0 }),
    ];
    match drag {
        Some((end, duration_ms)) => steps.push(json!({
            "type": "pointerMove", "duration": duration_ms, "origin": "viewport", "x": end.0, "y": end.1
        })),
        None => steps.push(json!({ "type": "pause", "duration": 50 })),
    }
    steps.push(json!({ "type": "pointerUp", "button": 0 }));
    json!([{
        "type": "pointer",
        "id": "finger1",
        "parameters": { "pointerType": pointer_type },
        "actions": steps
    }])
}

pub fn element_ref(element_id: &str) -> Value {
    json!({ ELEMENT_KEY: element_id })
}

fn element_id(value: &Value) -> Option<String> {
    value
        .get(ELEMENT_KEY)
        .or_else(|| value.get("ELEMENT"))
        .and_then(Value::as_str)
        .map(str::to_string)
}

/// Map a W3C error payload onto the engine's error kinds.
fn wire_error(status: u16, payload: &Value, raw: &str, subject: &str) -> EngineError {
    let value = payload.get("value").unwrap_or(&Value::Null);
    let code = value.get("error").and_then(Value::as_str).unwrap_or_default();
    let message = value
        .get("message")
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| raw.chars().take(300).collect());

    match code {
        "no such element" | "stale element reference" => EngineError::not_found(subject, message),
        "timeout" | "script timeout" => EngineError::ActionTimedOut {
            action: "driver command".to_string(),
            target: subject.to_string(),
            waited_ms: 0,
        },
        "" if status >= 500 => EngineError::TransientTransport(format!("HTTP {}: {}", status, message)),
        "" => EngineError::PermanentRequest { status, message },
        other => EngineError::Driver(format!("{}: {}", other, message)),
    }
}
