use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::config::DetectorConfig;
use crate::error::{EngineError, Result};
use crate::oracle::ElementDetector;
use crate::screen::VisionImage;

/// General layout vocabulary used to describe the screen for a diagnosis.
pub const WORLD_VIEW_PROMPT: &str = "button . input field . link . text . dialog . image . menu";

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct BoundingBox {
    pub xmin: f64,
    pub ymin: f64,
    pub xmax: f64,
    pub ymax: f64,
}

impl BoundingBox {
    pub fn center(&self) -> (f64, f64) {
        ((self.xmin + self.xmax) / 2.0, (self.ymin + self.ymax) / 2.0)
    }

    pub fn scaled(&self, factor: f64) -> Self {
        Self {
            xmin: self.xmin * factor,
            ymin: self.ymin * factor,
            xmax: self.xmax * factor,
            ymax: self.ymax * factor,
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawBox {
    Tuple(Vec<f64>),
    Object { xmin: f64, ymin: f64, xmax: f64, ymax: f64 },
}

impl<'de> Deserialize<'de> for BoundingBox {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        match RawBox::deserialize(deserializer)? {
            RawBox::Object { xmin, ymin, xmax, ymax } => Ok(BoundingBox { xmin, ymin, xmax, ymax }),
            RawBox::Tuple(v) if v.len() == 4 => Ok(BoundingBox {
                xmin: v[0],
                ymin: v[1],
                xmax: v[2],
                ymax: v[3],
            }),
            RawBox::Tuple(v) => Err(serde::de::Error::invalid_length(v.len(), &"4 coordinates")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DetectedElement {
    pub label: String,
    #[serde(alias = "box", alias = "bbox", alias = "bounding_box")]
    pub bounding_box: BoundingBox,
    #[serde(alias = "score")]
    pub confidence: f32,
}

/// Candidate labels are the " . "-separated phrases of a prompt.
pub fn candidate_labels(prompt: &str) -> Vec<String> {
    prompt
        .split(" . ")
        .map(|s| s.trim().trim_end_matches('.').trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

/// Parse a detector payload, dropping entries that are not elements.
pub fn parse_detections(payload: &Value) -> Vec<DetectedElement> {
    let items = match payload {
        Value::Array(items) => items.as_slice(),
        _ => return Vec::new(),
    };
    items
        .iter()
        .filter_map(|item| serde_json::from_value::<DetectedElement>(item.clone()).ok())
        .collect()
}

pub fn describe_elements(elements: &[DetectedElement]) -> String {
    if elements.is_empty() {
        return "No UI elements detected.".to_string();
    }
    elements
        .iter()
        .map(|e| {
            let b = &e.bounding_box;
            format!(
                "- {} [{:.0},{:.0},{:.0},{:.0}] ({:.2})",
                e.label, b.xmin, b.ymin, b.xmax, b.ymax, e.confidence
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Zero-shot object detection over the Hugging Face inference API.
pub struct HuggingFaceDetector {
    client: Client,
    config: DetectorConfig,
}

impl HuggingFaceDetector {
    pub fn new(config: DetectorConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.request_timeout)
            .connect_timeout(std::time::Duration::from_secs(10))
            .build()
            .map_err(|e| EngineError::Config(format!("detector http client: {}", e)))?;
        Ok(Self { client, config })
    }
}

#[async_trait]
impl ElementDetector for HuggingFaceDetector {
    async fn detect_elements(&self, image: &VisionImage, prompt: &str) -> Result<Vec<DetectedElement>> {
        let token = match &self.config.api_token {
            Some(token) => token,
            None => {
                debug!("[Detector] HF_API_TOKEN not set; element detection disabled");
                return Ok(Vec::new());
            }
        };

        let body = json!({
            "inputs": image.base64,
            "parameters": { "candidate_labels": candidate_labels(prompt) }
        });

        let res = self
            .client
            .post(&self.config.endpoint)
            .bearer_auth(token)
            .json(&body)
            .send()
            .await
            .map_err(|e| EngineError::OracleUnreachable(format!("detector: {}", e)))?;

        if !res.status().is_success() {
            let status = res.status();
            let text = res.text().await.unwrap_or_default();
            warn!("[Detector] API error ({}): {}", status, text);
            return Err(EngineError::OracleUnreachable(format!("detector HTTP {}: {}", status, text)));
        }

        let payload: Value = res
            .json()
            .await
            .map_err(|e| EngineError::OracleResponseUnparsable(format!("detector: {}", e)))?;
        let elements = parse_detections(&payload);
        debug!("[Detector] {} elements detected", elements.len());
        Ok(elements)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_both_box_shapes() {
        let payload = json!([
            { "label": "accept button", "score": 0.91, "box": { "xmin": 10, "ymin": 20, "xmax": 30, "ymax": 40 } },
            { "label": "close", "confidence": 0.5, "boundingBox": [100, 100, 200, 140] },
            { "label": "broken", "score": 0.9, "box": [1, 2, 3] },
            "garbage"
        ]);
        let elements = parse_detections(&payload);
        assert_eq!(elements.len(), 2);
        assert_eq!(elements[0].bounding_box.center(), (20.0, 30.0));
        assert_eq!(elements[1].bounding_box.center(), (150.0, 120.0));
        assert!((elements[0].confidence - 0.91).abs() < 1e-6);
    }

    #[test]
    fn candidate_labels_split_prompt() {
        assert_eq!(
            candidate_labels("cookie banner . close button . popup"),
            vec!["cookie banner", "close button", "popup"]
        );
    }

    #[test]
    fn describe_lists_elements() {
        let elements = vec![DetectedElement {
            label: "button".into(),
            bounding_box: BoundingBox { xmin: 1.0, ymin: 2.0, xmax: 3.0, ymax: 4.0 },
            confidence: 0.5,
        }];
        assert_eq!(describe_elements(&elements), "- button [1,2,3,4] (0.50)");
        assert_eq!(describe_elements(&[]), "No UI elements detected.");
    }

    #[test]
    fn scaling_moves_centroid() {
        let b = BoundingBox { xmin: 10.0, ymin: 10.0, xmax: 20.0, ymax: 30.0 };
        assert_eq!(b.scaled(2.0).center(), (30.0, 40.0));
    }

    #[tokio::test]
    async fn detector_without_token_returns_nothing() {
        let detector = HuggingFaceDetector::new(DetectorConfig {
            api_token: None,
            endpoint: "http://127.0.0.1:9/unused".into(),
            request_timeout: std::time::Duration::from_secs(1),
        })
        .unwrap();
        let image = VisionImage { base64: String::new(), scale: 1.0, width: 1, height: 1 };
        let found = detector.detect_elements(&image, "close button . accept button").await.unwrap();
        assert!(found.is_empty());
    }
}
