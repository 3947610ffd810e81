//! Self-healing action layer.
//!
//! Every click/type/verify runs through a small state machine:
//!
//! ```text
//! Attempt -> Success
//!         -> Diagnose -> Fail                (oracle degraded or retry skipped)
//!                     -> Remedy -> Retry -> Success
//!                                        -> Fail (original error)
//! ```
//!
//! There is no edge back from `Retry` to `Diagnose`, so one action costs at
//! most two attempts and one oracle call.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{sleep, timeout};
use tracing::{info, warn};

use crate::config::HealingSettings;
use crate::error::{EngineError, Result};
use crate::obstacle::ObstacleResolver;
use crate::oracle::detection::{describe_elements, WORLD_VIEW_PROMPT};
use crate::oracle::{diagnose_once, DiagnosisOutcome, DiagnosisOracle, DiagnosisRequest, ElementDetector, HealingAction, HealingReport};
use crate::platform::UiDriver;
use crate::screen::prepare_for_vision;

/// Slack on top of an action's wait budget before the call is abandoned.
const ACTION_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq)]
pub enum UiAction {
    Click,
    Type(String),
    Verify,
}

impl UiAction {
    pub fn name(&self) -> &'static str {
        match self {
            UiAction::Click => "click",
            UiAction::Type(_) => "type",
            UiAction::Verify => "verify",
        }
    }
}

#[derive(Debug)]
enum HealingState {
    Attempt,
    Diagnose { error: EngineError },
    Remedy { error: EngineError, report: HealingReport },
    Retry { error: EngineError, target: String },
    Success { healed: bool },
    Fail(EngineError),
}

pub struct SelfHealingLayer {
    oracle: Arc<dyn DiagnosisOracle>,
    detector: Arc<dyn ElementDetector>,
    obstacles: ObstacleResolver,
    settings: HealingSettings,
    last_report: Option<HealingReport>,
}

impl SelfHealingLayer {
    pub fn new(
        oracle: Arc<dyn DiagnosisOracle>,
        detector: Arc<dyn ElementDetector>,
        obstacles: ObstacleResolver,
        settings: HealingSettings,
    ) -> Self {
        Self {
            oracle,
            detector,
            obstacles,
            settings,
            last_report: None,
        }
    }

    /// The report produced by the most recent action, if it needed a diagnosis.
    pub fn take_report(&mut self) -> Option<HealingReport> {
        self.last_report.take()
    }

    /// Navigation is not healed; obstacles are cleared afterwards.
    pub async fn navigate(&mut self, driver: &mut dyn UiDriver, url: &str) -> Result<()> {
        self.last_report = None;
        driver.navigate(url).await?;
        self.obstacles.clear(driver).await;
        Ok(())
    }

    pub async fn click(&mut self, driver: &mut dyn UiDriver, target: &str) -> Result<()> {
        self.run(driver, UiAction::Click, target).await
    }

    pub async fn type_text(&mut self, driver: &mut dyn UiDriver, target: &str, text: &str) -> Result<()> {
        self.run(driver, UiAction::Type(text.to_string()), target).await
    }

    /// `Ok(false)` when the element stays invisible after healing.
    pub async fn verify(&mut self, driver: &mut dyn UiDriver, target: &str) -> Result<bool> {
        match self.run(driver, UiAction::Verify, target).await {
            Ok(()) => Ok(true),
            Err(EngineError::VerificationFailed(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn run(&mut self, driver: &mut dyn UiDriver, action: UiAction, target: &str) -> Result<()> {
        self.last_report = None;
        let mut state = HealingState::Attempt;
        loop {
            state = match state {
                HealingState::Attempt => match self.attempt(driver, &action, target).await {
                    Ok(()) => HealingState::Success { healed: false },
                    Err(error) => {
                        warn!("[Self-Healing] {} on '{}' failed: {}", action.name(), target, error);
                        HealingState::Diagnose { error }
                    }
                },
                HealingState::Diagnose { error } => {
                    let request = self.compose_request(driver, &action, target, &error).await;
                    match diagnose_once(self.oracle.as_ref(), &request, self.settings.diagnosis_timeout).await {
                        DiagnosisOutcome::Diagnosed(report) => {
                            if self.settings.skip_retry_categories.contains(&report.root_cause_category) {
                                info!(
                                    "[Self-Healing] Root cause {:?} is not retried",
                                    report.root_cause_category
                                );
                                self.last_report = Some(report);
                                HealingState::Fail(error)
                            } else {
                                HealingState::Remedy { error, report }
                            }
                        }
                        DiagnosisOutcome::Degraded { report, .. } => {
                            self.last_report = Some(report);
                            HealingState::Fail(error)
                        }
                    }
                }
                HealingState::Remedy { error, report } => {
                    info!(
                        "[Self-Healing] Diagnosis: {} -> {}",
                        report.root_cause,
                        report.self_healing_action.as_str()
                    );
                    let retry_target = self.apply_remedy(driver, &report, target).await;
                    self.last_report = Some(report);
                    HealingState::Retry { error, target: retry_target }
                }
                HealingState::Retry { error, target: retry_target } => {
                    match self.attempt(driver, &action, &retry_target).await {
                        Ok(()) => HealingState::Success { healed: true },
                        Err(retry_error) => {
                            warn!("[Self-Healing] Retry on '{}' failed: {}", retry_target, retry_error);
                            HealingState::Fail(error)
                        }
                    }
                }
                HealingState::Success { healed } => {
                    if healed {
                        info!("[Self-Healing] {} on '{}' recovered", action.name(), target);
                    }
                    return Ok(());
                }
                HealingState::Fail(error) => return Err(error),
            };
        }
    }

    /// One primitive call bounded by its wait budget plus grace.
    async fn attempt(&self, driver: &mut dyn UiDriver, action: &UiAction, target: &str) -> Result<()> {
        let timed_out = |wait: Duration| EngineError::ActionTimedOut {
            action: action.name().to_string(),
            target: target.to_string(),
            waited_ms: (wait + ACTION_GRACE).as_millis() as u64,
        };
        match action {
            UiAction::Click => {
                let wait = self.settings.click_wait;
                timeout(wait + ACTION_GRACE, driver.click(target, wait))
                    .await
                    .map_err(|_| timed_out(wait))?
            }
            UiAction::Type(text) => {
                let wait = self.settings.type_wait;
                timeout(wait + ACTION_GRACE, driver.type_text(target, text, wait))
                    .await
                    .map_err(|_| timed_out(wait))?
            }
            UiAction::Verify => {
                let wait = self.settings.verify_wait;
                let visible = timeout(wait + ACTION_GRACE, driver.verify(target, wait))
                    .await
                    .map_err(|_| timed_out(wait))??;
                if visible {
                    Ok(())
                } else {
                    Err(EngineError::VerificationFailed(target.to_string()))
                }
            }
        }
    }

    async fn compose_request(
        &self,
        driver: &mut dyn UiDriver,
        action: &UiAction,
        target: &str,
        error: &EngineError,
    ) -> DiagnosisRequest {
        let screen_description = match self.describe_screen(driver).await {
            Ok(description) => description,
            Err(e) => {
                warn!("[Self-Healing] Screen capture for diagnosis failed: {}", e);
                format!("Screen description unavailable: {}", e)
            }
        };
        DiagnosisRequest {
            action: action.name().to_string(),
            original_target: target.to_string(),
            error_message: error.to_string(),
            screen_description,
        }
    }

    async fn describe_screen(&self, driver: &mut dyn UiDriver) -> Result<String> {
        let raw = driver.screenshot().await?;
        let image = prepare_for_vision(&raw)?;
        let elements = self.detector.detect_elements(&image, WORLD_VIEW_PROMPT).await?;
        let on_screen: Vec<_> = elements
            .into_iter()
            .map(|mut e| {
                e.bounding_box = e.bounding_box.scaled(image.scale);
                e
            })
            .collect();
        Ok(describe_elements(&on_screen))
    }

    /// Apply the remedy; returns the target for the retry.
    async fn apply_remedy(&self, driver: &mut dyn UiDriver, report: &HealingReport, target: &str) -> String {
        match report.self_healing_action {
            HealingAction::DismissOverlay => {
                self.obstacles.clear(driver).await;
            }
            HealingAction::WaitLonger => sleep(self.settings.wait_longer).await,
            HealingAction::ScrollToElement => {
                if let Err(e) = driver.scroll_into_view(target).await {
                    warn!("[Self-Healing] Scroll to '{}' failed: {}", target, e);
                }
            }
            HealingAction::RetryWithNewSelector => {
                if let Some(selector) = report.replacement_selector() {
                    info!("[Self-Healing] Retrying with selector '{}'", selector);
                    return selector.to_string();
                }
            }
            HealingAction::Retry | HealingAction::None => {}
        }
        target.to_string()
    }
}
