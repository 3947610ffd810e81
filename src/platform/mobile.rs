use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::{debug, info};

use crate::error::{EngineError, Result};
use crate::platform::webdriver::{Dialect, Locator, WireClient};
use crate::platform::{HealthStatus, PlatformExecutor, TouchDriver, UiDriver};
use crate::schema::Platform;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MobileOs {
    Android,
    Ios,
}

impl MobileOs {
    pub fn platform(&self) -> Platform {
        match self {
            MobileOs::Android => Platform::MobileAndroid,
            MobileOs::Ios => Platform::MobileIos,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MobileConfig {
    pub device_id: String,
    pub server_url: String,
    /// Appium automation name; UiAutomator2 / XCUITest when absent.
    pub automation_profile: Option<String>,
    /// Android package or iOS bundle id.
    pub app_identifier: Option<String>,
    pub app_activity: Option<String>,
    pub no_reset: bool,
    pub request_timeout_ms: u64,
}

impl Default for MobileConfig {
    fn default() -> Self {
        Self {
            device_id: "emulator-5554".to_string(),
            server_url: "http://localhost:4723".to_string(),
            automation_profile: None,
            app_identifier: None,
            app_activity: None,
            no_reset: true,
            request_timeout_ms: 60_000,
        }
    }
}

impl MobileConfig {
    pub fn capabilities(&self, os: MobileOs) -> Value {
        let mut caps = Map::new();
        let (platform_name, automation) = match os {
            MobileOs::Android => ("Android", "UiAutomator2"),
            MobileOs::Ios => ("iOS", "XCUITest"),
        };
        caps.insert("platformName".into(), json!(platform_name));
        caps.insert(
            "appium:automationName".into(),
            json!(self.automation_profile.as_deref().unwrap_or(automation)),
        );
        caps.insert("appium:deviceName".into(), json!(self.device_id));
        caps.insert("appium:udid".into(), json!(self.device_id));
        caps.insert("appium:noReset".into(), json!(self.no_reset));

        match (os, &self.app_identifier) {
            (MobileOs::Android, Some(package)) => {
                caps.insert("appium:appPackage".into(), json!(package));
                if let Some(activity) = &self.app_activity {
                    caps.insert("appium:appActivity".into(), json!(activity));
                }
            }
            (MobileOs::Ios, Some(bundle)) => {
                caps.insert("appium:bundleId".into(), json!(bundle));
            }
            _ => {}
        }
        Value::Object(caps)
    }
}

/// Android / iOS devices through an Appium server.
pub struct MobileExecutor {
    os: MobileOs,
    config: MobileConfig,
    wire: WireClient,
}

impl MobileExecutor {
    pub fn new(os: MobileOs, config: MobileConfig) -> Result<Self> {
        let wire = WireClient::new(
            os.platform(),
            &config.server_url,
            Duration::from_millis(config.request_timeout_ms),
        )?;
        Ok(Self { os, config, wire })
    }

    async fn visible(&self, target: &str, wait: Duration) -> Result<String> {
        let locator = Locator::parse(target, Dialect::Appium);
        self.wire
            .wait_for_visible(&locator, wait)
            .await?
            .ok_or_else(|| EngineError::not_found(target, format!("not visible within {}ms", wait.as_millis())))
    }
}

#[async_trait]
impl PlatformExecutor for MobileExecutor {
    fn platform(&self) -> Platform {
        self.os.platform()
    }

    async fn start(&mut self) -> Result<()> {
        if self.wire.session_id().is_some() {
            return Ok(());
        }
        // Fail fast with a readable message when no server is listening.
        if let Err(e) = self.wire.status().await {
            return Err(EngineError::Driver(format!(
                "Appium server is not reachable at {}: {}",
                self.config.server_url, e
            )));
        }
        info!(
            "[MobileExecutor] Starting {:?} session on {}",
            self.os, self.config.device_id
        );
        let session_id = self.wire.new_session(self.config.capabilities(self.os)).await?;
        debug!("[MobileExecutor] Session {}", session_id);
        Ok(())
    }

    async fn stop(&mut self) -> Result<()> {
        self.wire.delete_session().await
    }

    async fn health_check(&mut self) -> HealthStatus {
        match self.wire.status().await {
            Ok(_) => HealthStatus::ready(self.os.platform()),
            Err(e) => HealthStatus::unavailable(
                self.os.platform(),
                format!("Appium not reachable at {}: {}", self.config.server_url, e),
            ),
        }
    }

    fn ui(&mut self) -> Option<&mut dyn UiDriver> {
        Some(self)
    }

    fn touch(&mut self) -> Option<&mut dyn TouchDriver> {
        Some(self)
    }
}

#[async_trait]
impl UiDriver for MobileExecutor {
    /// Deep links and URLs both go through the session's URL endpoint.
    async fn navigate(&mut self, url: &str) -> Result<()> {
        info!("[MobileExecutor] Opening {}", url);
        self.wire.navigate(url).await
    }

    async fn click(&mut self, target: &str, wait: Duration) -> Result<()> {
        let id = self.visible(target, wait).await?;
        self.wire.click_element(&id).await.map_err(|e| e.retarget(target))
    }

    async fn type_text(&mut self, target: &str, text: &str, wait: Duration) -> Result<()> {
        let id = self.visible(target, wait).await?;
        let typed = async {
            self.wire.clear_element(&id).await?;
            self.wire.send_keys(&id, text).await
        };
        typed.await.map_err(|e| e.retarget(target))
    }

    async fn verify(&mut self, target: &str, wait: Duration) -> Result<bool> {
        let locator = Locator::parse(target, Dialect::Appium);
        Ok(self.wire.wait_for_visible(&locator, wait).await?.is_some())
    }

    async fn screenshot(&mut self) -> Result<Vec<u8>> {
        self.wire.screenshot().await
    }

    async fn scroll_into_view(&mut self, target: &str) -> Result<()> {
        let locator = Locator::parse(target, Dialect::Appium);
        let args = match self.os {
            MobileOs::Android => json!({ "strategy": locator.using, "selector": locator.value }),
            MobileOs::Ios => {
                let id = self
                    .wire
                    .find_element(&locator)
                    .await?
                    .ok_or_else(|| EngineError::not_found(target, "nothing to scroll to"))?;
                json!({ "elementId": id, "toVisible": true })
            }
        };
        self.wire.execute_script("mobile: scroll", vec![args]).await.map(|_| ())
    }

    async fn click_at(&mut self, x: f64, y: f64) -> Result<()> {
        self.wire.pointer_click(x, y, "touch").await
    }

    async fn click_text(&mut self, text: &str) -> Result<bool> {
        let locator = Locator::text_match(text, Dialect::Appium);
        match self.wire.find_element(&locator).await? {
            Some(id) => Ok(self.wire.click_element(&id).await.is_ok()),
            None => Ok(false),
        }
    }
}

#[async_trait]
impl TouchDriver for MobileExecutor {
    async fn tap(&mut self, x: i64, y: i64) -> Result<()> {
        self.wire.pointer_click(x as f64, y as f64, "touch").await
    }

    async fn swipe(&mut self, start: (i64, i64), end: (i64, i64), duration_ms: u64) -> Result<()> {
        self.wire.pointer_drag(start, end, duration_ms, "touch").await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::WireStub;

    #[test]
    fn android_capabilities_carry_package_and_activity() {
        let config = MobileConfig {
            app_identifier: Some("com.shop".into()),
            app_activity: Some(".MainActivity".into()),
            ..MobileConfig::default()
        };
        let caps = config.capabilities(MobileOs::Android);
        assert_eq!(caps["platformName"], "Android");
        assert_eq!(caps["appium:automationName"], "UiAutomator2");
        assert_eq!(caps["appium:appPackage"], "com.shop");
        assert_eq!(caps["appium:appActivity"], ".MainActivity");
    }

    #[test]
    fn ios_capabilities_use_bundle_id() {
        let config = MobileConfig {
            app_identifier: Some("com.shop.ios".into()),
            automation_profile: Some("Espresso".into()),
            ..MobileConfig::default()
        };
        let caps = config.capabilities(MobileOs::Ios);
        assert_eq!(caps["platformName"], "iOS");
        assert_eq!(caps["appium:bundleId"], "com.shop.ios");
        assert_eq!(caps["appium:automationName"], "Espresso");
        assert!(caps.get("appium:appPackage").is_none());
    }

    #[tokio::test]
    async fn start_fails_fast_without_server() {
        let mut mobile = MobileExecutor::new(
            MobileOs::Android,
            MobileConfig {
                server_url: "http://127.0.0.1:9".into(),
                request_timeout_ms: 2_000,
                ..MobileConfig::default()
            },
        )
        .unwrap();
        let err = mobile.start().await.unwrap_err();
        assert!(err.to_string().contains("Appium server is not reachable"));
        mobile.stop().await.unwrap();
    }

    #[tokio::test]
    async fn tap_and_swipe_post_pointer_actions() {
        let stub = WireStub::spawn(&[]).await;
        let mut mobile = MobileExecutor::new(
            MobileOs::Ios,
            MobileConfig {
                server_url: stub.url.clone(),
                ..MobileConfig::default()
            },
        )
        .unwrap();
        mobile.start().await.unwrap();
        mobile.tap(10, 20).await.unwrap();
        mobile.swipe((100, 800), (100, 200), 400).await.unwrap();
        assert_eq!(stub.count("POST /actions"), 2);
        mobile.stop().await.unwrap();
    }
}
