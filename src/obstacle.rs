//! Clears banners, consent dialogs and preference prompts after navigation.

use std::sync::Arc;

use serde::Serialize;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::config::ObstacleSettings;
use crate::error::Result;
use crate::oracle::{DetectedElement, ElementDetector};
use crate::platform::UiDriver;
use crate::screen::prepare_for_vision;
use crate::vault::UserProfile;

/// An interactive element judged to block the intended flow.
pub type Obstacle = DetectedElement;

/// Detections at or below this confidence are never clicked.
pub const MIN_CONFIDENCE: f32 = 0.40;

/// Labels that mark a control as a way out of an overlay.
const DISMISS_VOCABULARY: &[&str] = &[
    "accept", "agree", "allow", "close", "dismiss", "ok", "okay", "got it", "reject", "decline", "continue",
    "no thanks",
];

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClearanceReport {
    /// Profile fact answered directly, if any.
    pub preference_clicked: Option<String>,
    /// Obstacles clicked away, in screen coordinates.
    pub dismissed: Vec<Obstacle>,
}

impl ClearanceReport {
    pub fn cleared_anything(&self) -> bool {
        self.preference_clicked.is_some() || !self.dismissed.is_empty()
    }
}

pub struct ObstacleResolver {
    detector: Arc<dyn ElementDetector>,
    profile: Option<UserProfile>,
    settings: ObstacleSettings,
}

impl ObstacleResolver {
    pub fn new(detector: Arc<dyn ElementDetector>, settings: ObstacleSettings) -> Self {
        Self {
            detector,
            profile: None,
            settings,
        }
    }

    pub fn with_profile(mut self, profile: UserProfile) -> Self {
        self.profile = Some(profile);
        self
    }

    /// Profile values for the configured preference keys, in key order.
    fn preference_facts(&self) -> Vec<String> {
        let Some(profile) = &self.profile else {
            return Vec::new();
        };
        self.settings
            .preference_keys
            .iter()
            .filter_map(|key| profile.get_text(key))
            .collect()
    }

    fn vocabulary(&self) -> Vec<String> {
        let mut words: Vec<String> = DISMISS_VOCABULARY.iter().map(|w| w.to_string()).collect();
        words.extend(self.preference_facts().into_iter().map(|f| f.to_lowercase()));
        words
    }

    /// Best effort: every failure is logged and swallowed.
    pub async fn clear(&self, driver: &mut dyn UiDriver) -> ClearanceReport {
        info!("[Obstacles] Scanning for blocking elements");
        let mut report = ClearanceReport::default();

        for fact in self.preference_facts() {
            match driver.click_text(&fact).await {
                Ok(true) => {
                    info!("[Obstacles] Answered preference prompt with '{}'", fact);
                    report.preference_clicked = Some(fact);
                    sleep(self.settings.settle).await;
                    break;
                }
                Ok(false) => debug!("[Obstacles] No visible control for '{}'", fact),
                Err(e) => warn!("[Obstacles] Preference click for '{}' failed: {}", fact, e),
            }
        }

        match self.vision_pass(driver).await {
            Ok(dismissed) => report.dismissed = dismissed,
            Err(e) => warn!("[Obstacles] Vision pass skipped: {}", e),
        }

        if !report.cleared_anything() {
            debug!("[Obstacles] Nothing to clear");
        }
        report
    }

    async fn vision_pass(&self, driver: &mut dyn UiDriver) -> Result<Vec<Obstacle>> {
        let raw = driver.screenshot().await?;
        let image = prepare_for_vision(&raw)?;
        let vocabulary = self.vocabulary();
        let prompt = obstacle_prompt(&vocabulary);
        let elements = self.detector.detect_elements(&image, &prompt).await?;

        let mut dismissed = Vec::new();
        for element in select_obstacles(&elements, &vocabulary) {
            let on_screen = Obstacle {
                bounding_box: element.bounding_box.scaled(image.scale),
                ..element.clone()
            };
            let (x, y) = on_screen.bounding_box.center();
            info!(
                "[Obstacles] Clicking '{}' ({:.2}) at ({:.0}, {:.0})",
                element.label, element.confidence, x, y
            );
            if let Err(e) = driver.click_at(x, y).await {
                warn!("[Obstacles] Click on '{}' failed: {}", element.label, e);
                continue;
            }
            sleep(self.settings.settle).await;
            dismissed.push(on_screen);
        }
        Ok(dismissed)
    }
}

/// One "<entry> button" candidate per vocabulary entry, so every label the
/// detector can return is matchable.
pub fn obstacle_prompt(vocabulary: &[String]) -> String {
    vocabulary
        .iter()
        .map(|entry| format!("{} button", entry))
        .collect::<Vec<_>>()
        .join(" . ")
}

/// Whole-word match; multi-word entries match as phrases.
pub fn matches_vocabulary(label: &str, vocabulary: &[String]) -> bool {
    let label = label.to_lowercase();
    let tokens: Vec<&str> = label.split(|c: char| !c.is_alphanumeric()).filter(|t| !t.is_empty()).collect();
    vocabulary.iter().any(|entry| {
        if entry.contains(' ') {
            label.contains(entry.as_str())
        } else {
            tokens.iter().any(|t| t == entry)
        }
    })
}

/// Confidence strictly above `MIN_CONFIDENCE` and a vocabulary hit.
pub fn select_obstacles<'a>(elements: &'a [DetectedElement], vocabulary: &[String]) -> Vec<&'a DetectedElement> {
    elements
        .iter()
        .filter(|e| e.confidence > MIN_CONFIDENCE && matches_vocabulary(&e.label, vocabulary))
        .collect()
}
