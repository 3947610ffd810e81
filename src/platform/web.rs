use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::error::{EngineError, Result};
use crate::platform::webdriver::{element_ref, Dialect, Locator, WireClient};
use crate::platform::{HealthStatus, PlatformExecutor, UiDriver};
use crate::retry::{with_retry, RetryConfig};
use crate::schema::Platform;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WebConfig {
    pub driver_url: String,
    pub browser: String,
    pub headless: bool,
    pub window_size: String,
    pub nav_retries: u32,
    pub nav_retry_delay_ms: u64,
    pub request_timeout_ms: u64,
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            driver_url: "http://localhost:9515".to_string(),
            browser: "chrome".to_string(),
            headless: true,
            window_size: "1920,1080".to_string(),
            nav_retries: 1,
            nav_retry_delay_ms: 400,
            request_timeout_ms: 60_000,
        }
    }
}

impl WebConfig {
    pub fn capabilities(&self) -> Value {
        match self.browser.to_lowercase().as_str() {
            "chrome" | "chromium" => {
                let mut args = vec![format!("--window-size={}", self.window_size)];
                if self.headless {
                    args.push("--headless=new".to_string());
                }
                json!({ "browserName": "chrome", "goog:chromeOptions": { "args": args } })
            }
            "firefox" => {
                let args: Vec<&str> = if self.headless { vec!["-headless"] } else { vec![] };
                json!({ "browserName": "firefox", "moz:firefoxOptions": { "args": args } })
            }
            other => json!({ "browserName": other }),
        }
    }
}

/// Browser sessions over a WebDriver endpoint (chromedriver, geckodriver, grid).
pub struct WebExecutor {
    config: WebConfig,
    wire: WireClient,
}

impl WebExecutor {
    pub fn new(config: WebConfig) -> Result<Self> {
        let wire = WireClient::new(
            Platform::Web,
            &config.driver_url,
            Duration::from_millis(config.request_timeout_ms),
        )?;
        Ok(Self { config, wire })
    }

    async fn visible(&self, target: &str, wait: Duration) -> Result<String> {
        let locator = Locator::parse(target, Dialect::Browser);
        self.wire
            .wait_for_visible(&locator, wait)
            .await?
            .ok_or_else(|| EngineError::not_found(target, format!("not visible within {}ms", wait.as_millis())))
    }

    async fn scroll_element(&self, element_id: &str) -> Result<()> {
        self.wire
            .execute_script(
                "arguments[0].scrollIntoView({block: 'center', inline: 'center'});",
                vec![element_ref(element_id)],
            )
            .await
            .map(|_| ())
    }
}

#[async_trait]
impl PlatformExecutor for WebExecutor {
    fn platform(&self) -> Platform {
        Platform::Web
    }

    async fn start(&mut self) -> Result<()> {
        if self.wire.session_id().is_some() {
            return Ok(());
        }
        info!(
            "[WebExecutor] Starting {} session via {}",
            self.config.browser, self.config.driver_url
        );
        let session_id = self.wire.new_session(self.config.capabilities()).await?;
        debug!("[WebExecutor] Session {}", session_id);
        Ok(())
    }

    async fn stop(&mut self) -> Result<()> {
        if self.wire.session_id().is_some() {
            info!("[WebExecutor] Closing browser session");
        }
        self.wire.delete_session().await
    }

    async fn health_check(&mut self) -> HealthStatus {
        match self.wire.status().await {
            Ok(status) if status.get("ready").and_then(Value::as_bool).unwrap_or(true) => {
                HealthStatus::ready(Platform::Web)
            }
            Ok(status) => HealthStatus::unavailable(Platform::Web, status.to_string()),
            Err(e) => HealthStatus::unavailable(
                Platform::Web,
                format!("WebDriver not reachable at {}: {}", self.wire.base_url(), e),
            ),
        }
    }

    fn ui(&mut self) -> Option<&mut dyn UiDriver> {
        Some(self)
    }
}

#[async_trait]
impl UiDriver for WebExecutor {
    async fn navigate(&mut self, url: &str) -> Result<()> {
        info!("[WebExecutor] Navigating to {}", url);
        let retry = RetryConfig::fixed(self.config.nav_retries, self.config.nav_retry_delay_ms);
        let wire = &self.wire;
        let (result, attempts) = with_retry(&retry, "navigate", || wire.navigate(url)).await;
        if result.is_err() {
            warn!("[WebExecutor] Navigation to {} failed after {} attempt(s)", url, attempts);
        }
        result
    }

    async fn click(&mut self, target: &str, wait: Duration) -> Result<()> {
        let id = self.visible(target, wait).await?;
        if let Err(e) = self.scroll_element(&id).await {
            debug!("[WebExecutor] scrollIntoView before click failed: {}", e);
        }
        self.wire.click_element(&id).await.map_err(|e| e.retarget(target))
    }

    async fn type_text(&mut self, target: &str, text: &str, wait: Duration) -> Result<()> {
        let id = self.visible(target, wait).await?;
        let typed = async {
            self.wire.click_element(&id).await?;
            self.wire.clear_element(&id).await?;
            self.wire.send_keys(&id, text).await
        };
        typed.await.map_err(|e| e.retarget(target))
    }

    async fn verify(&mut self, target: &str, wait: Duration) -> Result<bool> {
        let locator = Locator::parse(target, Dialect::Browser);
        Ok(self.wire.wait_for_visible(&locator, wait).await?.is_some())
    }

    async fn screenshot(&mut self) -> Result<Vec<u8>> {
        self.wire.screenshot().await
    }

    async fn scroll_into_view(&mut self, target: &str) -> Result<()> {
        let locator = Locator::parse(target, Dialect::Browser);
        match self.wire.find_element(&locator).await? {
            Some(id) => self.scroll_element(&id).await,
            None => Err(EngineError::not_found(target, "nothing to scroll to")),
        }
    }

    async fn click_at(&mut self, x: f64, y: f64) -> Result<()> {
        self.wire.pointer_click(x, y, "mouse").await
    }

    async fn click_text(&mut self, text: &str) -> Result<bool> {
        let locator = Locator::text_match(text, Dialect::Browser);
        // Innermost match last in document order; try deepest first.
        for id in self.wire.find_elements(&locator).await?.iter().rev() {
            if self.wire.is_displayed(id).await.unwrap_or(false) && self.wire.click_element(id).await.is_ok() {
                return Ok(true);
            }
        }
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::WireStub;

    #[test]
    fn chrome_capabilities_follow_headless_flag() {
        let caps = WebConfig::default().capabilities();
        let args = caps["goog:chromeOptions"]["args"].as_array().unwrap();
        assert!(args.iter().any(|a| a == "--headless=new"));

        let headed = WebConfig {
            headless: false,
            ..WebConfig::default()
        };
        let args = headed.capabilities()["goog:chromeOptions"]["args"].clone();
        assert!(!args.as_array().unwrap().iter().any(|a| a == "--headless=new"));
    }

    #[test]
    fn config_reads_camel_case_with_defaults() {
        let config: WebConfig = serde_json::from_value(json!({ "driverUrl": "http://grid:4444", "navRetries": 3 })).unwrap();
        assert_eq!(config.driver_url, "http://grid:4444");
        assert_eq!(config.nav_retries, 3);
        assert_eq!(config.browser, "chrome");
    }

    #[tokio::test]
    async fn actions_before_start_are_rejected() {
        let mut web = WebExecutor::new(WebConfig::default()).unwrap();
        let err = web.navigate("https://example.com").await.unwrap_err();
        assert!(matches!(err, EngineError::NotStarted(Platform::Web)));
    }

    #[tokio::test]
    async fn session_lifecycle_against_stub_driver() {
        let stub = WireStub::spawn(&["#buy"]).await;
        let mut web = WebExecutor::new(WebConfig {
            driver_url: stub.url.clone(),
            ..WebConfig::default()
        })
        .unwrap();

        web.start().await.unwrap();
        web.start().await.unwrap();
        assert_eq!(stub.count("POST /session"), 1);

        web.navigate("https://shop.example").await.unwrap();
        web.click("#buy", Duration::from_millis(100)).await.unwrap();
        let err = web.click("#gone", Duration::from_millis(100)).await.unwrap_err();
        assert!(matches!(err, EngineError::ActionNotFound { ref target, .. } if target == "#gone"));
        assert!(!web.verify("#gone", Duration::from_millis(50)).await.unwrap());

        web.stop().await.unwrap();
        web.stop().await.unwrap();
        assert_eq!(stub.count("DELETE /session"), 1);
    }

    #[tokio::test]
    async fn stale_click_names_the_selector() {
        let stub = WireStub::spawn(&[".stale-row"]).await;
        let mut web = WebExecutor::new(WebConfig {
            driver_url: stub.url.clone(),
            ..WebConfig::default()
        })
        .unwrap();
        web.start().await.unwrap();

        let err = web.click(".stale-row", Duration::from_millis(100)).await.unwrap_err();
        assert_eq!(err.to_string(), "Element not found: .stale-row (element is detached)");
        web.stop().await.unwrap();
    }
}
