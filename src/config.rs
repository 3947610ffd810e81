//! Environment-driven engine settings.
//!
//! Values come from the process environment, optionally seeded from a `.env`
//! file in the working directory. Per-platform executor options live next to
//! their executors (`platform::*Config`) and arrive through scenario files.

use std::env;
use std::time::Duration;

use tracing::warn;

use crate::oracle::RootCauseCategory;

pub fn load_dotenv() {
    dotenv::dotenv().ok();
}

pub fn env_u64(key: &str, default_val: u64) -> u64 {
    env::var(key).ok().and_then(|v| v.trim().parse().ok()).unwrap_or(default_val)
}

pub fn env_bool(key: &str, default_val: bool) -> bool {
    match env::var(key) {
        Ok(v) => {
            let v = v.trim().to_lowercase();
            matches!(v.as_str(), "1" | "true" | "yes" | "on")
        }
        Err(_) => default_val,
    }
}

pub fn env_opt(key: &str) -> Option<String> {
    env::var(key).ok().map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

pub fn env_list(key: &str) -> Vec<String> {
    parse_list(&env::var(key).unwrap_or_default())
}

fn parse_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_lowercase())
        .filter(|s| !s.is_empty())
        .collect()
}

#[derive(Debug, Clone)]
pub struct OracleConfig {
    pub api_key: Option<String>,
    pub endpoint: String,
    pub model: String,
    pub request_timeout: Duration,
}

impl OracleConfig {
    pub fn from_env() -> Self {
        Self {
            api_key: env_opt("ORACLE_API_KEY").or_else(|| env_opt("OPENAI_API_KEY")),
            endpoint: env_opt("ORACLE_ENDPOINT")
                .unwrap_or_else(|| "https://api.openai.com/v1/chat/completions".to_string()),
            model: env_opt("ORACLE_MODEL").unwrap_or_else(|| "gpt-4o".to_string()),
            request_timeout: Duration::from_secs(env_u64("ORACLE_TIMEOUT_SECS", 30)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DetectorConfig {
    pub api_token: Option<String>,
    pub endpoint: String,
    pub request_timeout: Duration,
}

impl DetectorConfig {
    pub fn from_env() -> Self {
        let model_id =
            env_opt("DETECTOR_MODEL_ID").unwrap_or_else(|| "google/owlvit-base-patch32".to_string());
        Self {
            api_token: env_opt("HF_API_TOKEN"),
            endpoint: env_opt("DETECTOR_ENDPOINT").unwrap_or_else(|| {
                format!("https://api-inference.huggingface.co/models/{}", model_id)
            }),
            request_timeout: Duration::from_secs(env_u64("DETECTOR_TIMEOUT_SECS", 30)),
        }
    }
}

/// Budgets and policy for the diagnose/remedy/retry cycle.
#[derive(Debug, Clone)]
pub struct HealingSettings {
    pub click_wait: Duration,
    pub type_wait: Duration,
    pub verify_wait: Duration,
    pub wait_longer: Duration,
    pub diagnosis_timeout: Duration,
    /// Diagnosed categories for which the remedied retry is not attempted.
    pub skip_retry_categories: Vec<RootCauseCategory>,
}

impl Default for HealingSettings {
    fn default() -> Self {
        Self {
            click_wait: Duration::from_millis(5000),
            type_wait: Duration::from_millis(3000),
            verify_wait: Duration::from_millis(3000),
            wait_longer: Duration::from_secs(3),
            diagnosis_timeout: Duration::from_secs(45),
            skip_retry_categories: Vec::new(),
        }
    }
}

impl HealingSettings {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            click_wait: Duration::from_millis(env_u64("ACTION_CLICK_WAIT_MS", 5000)),
            type_wait: Duration::from_millis(env_u64("ACTION_TYPE_WAIT_MS", 3000)),
            verify_wait: Duration::from_millis(env_u64("ACTION_VERIFY_WAIT_MS", 3000)),
            wait_longer: Duration::from_millis(env_u64("HEALING_WAIT_LONGER_MS", 3000)),
            diagnosis_timeout: Duration::from_millis(env_u64(
                "HEALING_DIAGNOSIS_TIMEOUT_MS",
                defaults.diagnosis_timeout.as_millis() as u64,
            )),
            skip_retry_categories: skip_categories(&env_list("HEALING_SKIP_RETRY_CATEGORIES")),
        }
    }
}

/// Unrecognized labels are dropped with a warning rather than read as `other`.
fn skip_categories(labels: &[String]) -> Vec<RootCauseCategory> {
    labels
        .iter()
        .filter_map(|label| {
            let parsed = RootCauseCategory::parse_known(label);
            if parsed.is_none() {
                warn!("[Config] Ignoring unknown root cause category '{}' in HEALING_SKIP_RETRY_CATEGORIES", label);
            }
            parsed
        })
        .collect()
}

#[derive(Debug, Clone)]
pub struct ObstacleSettings {
    /// Pause after each dismissal so the page can re-render.
    pub settle: Duration,
    /// Profile keys whose values are matched against visible controls.
    pub preference_keys: Vec<String>,
}

impl Default for ObstacleSettings {
    fn default() -> Self {
        Self {
            settle: Duration::from_secs(1),
            preference_keys: vec!["gender".to_string()],
        }
    }
}

impl ObstacleSettings {
    pub fn from_env() -> Self {
        let keys = env_list("OBSTACLE_PREFERENCE_KEYS");
        Self {
            settle: Duration::from_millis(env_u64("OBSTACLE_SETTLE_MS", 1000)),
            preference_keys: if keys.is_empty() { vec!["gender".to_string()] } else { keys },
        }
    }
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub oracle: OracleConfig,
    pub detector: DetectorConfig,
    pub healing: HealingSettings,
    pub obstacles: ObstacleSettings,
    pub stop_on_failure: bool,
}

impl EngineConfig {
    pub fn from_env() -> Self {
        load_dotenv();
        Self {
            oracle: OracleConfig::from_env(),
            detector: DetectorConfig::from_env(),
            healing: HealingSettings::from_env(),
            obstacles: ObstacleSettings::from_env(),
            stop_on_failure: env_bool("SCENARIO_STOP_ON_FAILURE", true),
        }
    }
}
