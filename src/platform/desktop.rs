use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::info;

use crate::error::{EngineError, Result};
use crate::platform::webdriver::{parse_point, Dialect, Locator, WireClient};
use crate::platform::{HealthStatus, PlatformExecutor, UiDriver};
use crate::schema::Platform;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DesktopConfig {
    pub driver_url: String,
    /// Executable to launch; the whole desktop ("Root") when absent.
    pub app_path: Option<String>,
    pub request_timeout_ms: u64,
}

impl Default for DesktopConfig {
    fn default() -> Self {
        Self {
            driver_url: "http://127.0.0.1:4723".to_string(),
            app_path: None,
            request_timeout_ms: 60_000,
        }
    }
}

impl DesktopConfig {
    pub fn capabilities(&self) -> Value {
        json!({
            "platformName": "Windows",
            "appium:automationName": "Windows",
            "appium:deviceName": "WindowsPC",
            "appium:app": self.app_path.as_deref().unwrap_or("Root"),
        })
    }
}

/// Windows desktop automation through WinAppDriver.
///
/// Targets are accessibility names by default; `"x,y"` clicks raw coordinates.
pub struct DesktopExecutor {
    config: DesktopConfig,
    wire: WireClient,
}

impl DesktopExecutor {
    pub fn new(config: DesktopConfig) -> Result<Self> {
        let wire = WireClient::new(
            Platform::DesktopWindows,
            &config.driver_url,
            Duration::from_millis(config.request_timeout_ms),
        )?;
        Ok(Self { config, wire })
    }

    async fn visible(&self, target: &str, wait: Duration) -> Result<String> {
        let locator = Locator::parse(target, Dialect::WinAppDriver);
        self.wire
            .wait_for_visible(&locator, wait)
            .await?
            .ok_or_else(|| EngineError::not_found(target, format!("not visible within {}ms", wait.as_millis())))
    }
}

#[async_trait]
impl PlatformExecutor for DesktopExecutor {
    fn platform(&self) -> Platform {
        Platform::DesktopWindows
    }

    async fn start(&mut self) -> Result<()> {
        if self.wire.session_id().is_some() {
            return Ok(());
        }
        if let Err(e) = self.wire.status().await {
            return Err(EngineError::Driver(format!(
                "WinAppDriver is not reachable at {} (is WinAppDriver.exe running?): {}",
                self.config.driver_url, e
            )));
        }
        info!(
            "[DesktopExecutor] Starting session for {}",
            self.config.app_path.as_deref().unwrap_or("desktop root")
        );
        self.wire.new_session(self.config.capabilities()).await?;
        Ok(())
    }

    async fn stop(&mut self) -> Result<()> {
        self.wire.delete_session().await
    }

    async fn health_check(&mut self) -> HealthStatus {
        match self.wire.status().await {
            Ok(_) => HealthStatus::ready(Platform::DesktopWindows),
            Err(e) => HealthStatus::unavailable(Platform::DesktopWindows, e.to_string()),
        }
    }

    fn ui(&mut self) -> Option<&mut dyn UiDriver> {
        Some(self)
    }
}

#[async_trait]
impl UiDriver for DesktopExecutor {
    async fn navigate(&mut self, _url: &str) -> Result<()> {
        Err(EngineError::UnsupportedAction {
            platform: Platform::DesktopWindows,
            action: "navigate".to_string(),
        })
    }

    async fn click(&mut self, target: &str, wait: Duration) -> Result<()> {
        if let Some((x, y)) = parse_point(target) {
            return self.click_at(x, y).await;
        }
        let id = self.visible(target, wait).await?;
        self.wire.click_element(&id).await.map_err(|e| e.retarget(target))
    }

    /// An empty target types into whatever has focus.
    async fn type_text(&mut self, target: &str, text: &str, wait: Duration) -> Result<()> {
        let id = if target.trim().is_empty() {
            self.wire.active_element().await?
        } else {
            self.visible(target, wait).await?
        };
        self.wire
            .send_keys(&id, text)
            .await
            .map_err(|e| if target.trim().is_empty() { e } else { e.retarget(target) })
    }

    async fn verify(&mut self, target: &str, wait: Duration) -> Result<bool> {
        let locator = Locator::parse(target, Dialect::WinAppDriver);
        Ok(self.wire.wait_for_visible(&locator, wait).await?.is_some())
    }

    async fn screenshot(&mut self) -> Result<Vec<u8>> {
        self.wire.screenshot().await
    }

    async fn scroll_into_view(&mut self, target: &str) -> Result<()> {
        // WinAppDriver has no scroll command; only presence can be checked.
        let locator = Locator::parse(target, Dialect::WinAppDriver);
        match self.wire.find_element(&locator).await? {
            Some(_) => Ok(()),
            None => Err(EngineError::not_found(target, "nothing to scroll to")),
        }
    }

    async fn click_at(&mut self, x: f64, y: f64) -> Result<()> {
        self.wire.pointer_click(x, y, "mouse").await
    }

    async fn click_text(&mut self, text: &str) -> Result<bool> {
        let locator = Locator::text_match(text, Dialect::WinAppDriver);
        match self.wire.find_element(&locator).await? {
            Some(id) => Ok(self.wire.click_element(&id).await.is_ok()),
            None => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::WireStub;

    #[test]
    fn root_session_without_app_path() {
        let caps = DesktopConfig::default().capabilities();
        assert_eq!(caps["appium:app"], "Root");
        let caps = DesktopConfig {
            app_path: Some("C:\\Windows\\notepad.exe".into()),
            ..DesktopConfig::default()
        }
        .capabilities();
        assert_eq!(caps["appium:app"], "C:\\Windows\\notepad.exe");
    }

    #[tokio::test]
    async fn coordinate_targets_click_points() {
        let stub = WireStub::spawn(&["Save"]).await;
        let mut desktop = DesktopExecutor::new(DesktopConfig {
            driver_url: stub.url.clone(),
            ..DesktopConfig::default()
        })
        .unwrap();
        desktop.start().await.unwrap();
        desktop.click("300,200", Duration::from_millis(50)).await.unwrap();
        assert_eq!(stub.count("POST /actions"), 1);
        desktop.click("Save", Duration::from_millis(50)).await.unwrap();
        assert_eq!(stub.count("POST /click"), 1);
        assert!(matches!(
            desktop.navigate("https://x").await,
            Err(EngineError::UnsupportedAction { .. })
        ));
        desktop.stop().await.unwrap();
    }
}
