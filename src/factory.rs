//! Platform executor construction and lifecycle tracking.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::error::{EngineError, Result};
use crate::platform::{
    ApiConfig, ApiExecutor, DatabaseConfig, DatabaseExecutor, DesktopConfig, DesktopExecutor,
    HealthStatus, MobileConfig, MobileExecutor, MobileOs, PlatformExecutor, Ready, Released, WebConfig,
    WebExecutor,
};
use crate::schema::Platform;

/// Per-platform configuration. Each variant only fits its own platform(s).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PlatformConfig {
    Web(WebConfig),
    Mobile(MobileConfig),
    Desktop(DesktopConfig),
    Api(ApiConfig),
    Database(DatabaseConfig),
}

impl PlatformConfig {
    /// Read the config block for `platform`; `null` means defaults.
    pub fn from_json(platform: Platform, raw: Value) -> Result<Self> {
        let raw = if raw.is_null() {
            Value::Object(Default::default())
        } else {
            raw
        };
        let parsed = match platform {
            Platform::Web => PlatformConfig::Web(serde_json::from_value(raw)?),
            Platform::MobileAndroid | Platform::MobileIos => PlatformConfig::Mobile(serde_json::from_value(raw)?),
            Platform::DesktopWindows => PlatformConfig::Desktop(serde_json::from_value(raw)?),
            Platform::Api => PlatformConfig::Api(serde_json::from_value(raw)?),
            Platform::Database => PlatformConfig::Database(serde_json::from_value(raw).map_err(|e| {
                EngineError::Config(format!("database config needs a connectionString: {}", e))
            })?),
        };
        Ok(parsed)
    }

    fn kind(&self) -> &'static str {
        match self {
            PlatformConfig::Web(_) => "web",
            PlatformConfig::Mobile(_) => "mobile",
            PlatformConfig::Desktop(_) => "desktop",
            PlatformConfig::Api(_) => "api",
            PlatformConfig::Database(_) => "database",
        }
    }
}

pub struct ExecutorFactory;

impl ExecutorFactory {
    /// Build an unstarted executor for `platform`.
    pub fn create_executor(platform: Platform, config: PlatformConfig) -> Result<ExecutorHandle> {
        let executor: Box<dyn PlatformExecutor> = match (platform, config) {
            (Platform::Web, PlatformConfig::Web(c)) => Box::new(WebExecutor::new(c)?),
            (Platform::MobileAndroid, PlatformConfig::Mobile(c)) => {
                Box::new(MobileExecutor::new(MobileOs::Android, c)?)
            }
            (Platform::MobileIos, PlatformConfig::Mobile(c)) => Box::new(MobileExecutor::new(MobileOs::Ios, c)?),
            (Platform::DesktopWindows, PlatformConfig::Desktop(c)) => Box::new(DesktopExecutor::new(c)?),
            (Platform::Api, PlatformConfig::Api(c)) => Box::new(ApiExecutor::new(c)),
            (Platform::Database, PlatformConfig::Database(c)) => Box::new(DatabaseExecutor::new(c)?),
            (platform, other) => {
                return Err(EngineError::Config(format!(
                    "{} config cannot build a {} executor",
                    other.kind(),
                    platform
                )))
            }
        };
        debug!("[Factory] Created {} executor", platform);
        Ok(ExecutorHandle::new(executor))
    }

    /// Same as `create_executor`, from a platform name and a raw JSON config block.
    pub fn create_by_name(name: &str, config: Value) -> Result<ExecutorHandle> {
        let platform: Platform = name.parse()?;
        Self::create_executor(platform, PlatformConfig::from_json(platform, config)?)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Created,
    Ready,
    Failed,
    Released,
}

/// Owns one executor and enforces its lifecycle: `start` is idempotent once
/// ready, `stop` reaches the executor at most once.
pub struct ExecutorHandle {
    inner: Box<dyn PlatformExecutor>,
    state: Lifecycle,
}

impl ExecutorHandle {
    pub fn new(inner: Box<dyn PlatformExecutor>) -> Self {
        Self {
            inner,
            state: Lifecycle::Created,
        }
    }

    pub fn platform(&self) -> Platform {
        self.inner.platform()
    }

    pub fn state(&self) -> Lifecycle {
        self.state
    }

    pub async fn start(&mut self) -> Result<Ready> {
        let platform = self.platform();
        match self.state {
            Lifecycle::Ready => return Ok(Ready { platform }),
            Lifecycle::Released => return Err(EngineError::NotStarted(platform)),
            Lifecycle::Created | Lifecycle::Failed => {}
        }
        match self.inner.start().await {
            Ok(()) => {
                info!("[Factory] {} executor ready", platform);
                self.state = Lifecycle::Ready;
                Ok(Ready { platform })
            }
            Err(e) => {
                warn!("[Factory] {} executor failed to start: {}", platform, e);
                self.state = Lifecycle::Failed;
                Err(e)
            }
        }
    }

    pub async fn stop(&mut self) -> Result<Released> {
        let platform = self.platform();
        if self.state == Lifecycle::Released {
            return Ok(Released { platform });
        }
        self.state = Lifecycle::Released;
        self.inner.stop().await?;
        info!("[Factory] {} executor released", platform);
        Ok(Released { platform })
    }

    pub async fn health_check(&mut self) -> HealthStatus {
        self.inner.health_check().await
    }

    /// Capability access; the executor may still be unstarted.
    pub fn executor_mut(&mut self) -> &mut dyn PlatformExecutor {
        self.inner.as_mut()
    }
}
