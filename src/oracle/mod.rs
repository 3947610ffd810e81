//! Vision/reasoning oracle: failure diagnosis and screen element detection.

pub mod detection;
pub mod diagnosis;
pub mod llm_gateway;

use std::time::Duration;

use async_trait::async_trait;
use tracing::warn;

use crate::error::{EngineError, Result};
use crate::screen::VisionImage;

pub use detection::{BoundingBox, DetectedElement, HuggingFaceDetector};
pub use diagnosis::{DiagnosisRequest, HealingAction, HealingReport, RootCauseCategory, Severity};
pub use llm_gateway::LlmOracle;

#[async_trait]
pub trait DiagnosisOracle: Send + Sync {
    async fn diagnose(&self, request: &DiagnosisRequest) -> Result<HealingReport>;
}

#[async_trait]
pub trait ElementDetector: Send + Sync {
    async fn detect_elements(&self, image: &VisionImage, prompt: &str) -> Result<Vec<DetectedElement>>;
}

/// Result of asking the oracle once.
#[derive(Debug)]
pub enum DiagnosisOutcome {
    Diagnosed(HealingReport),
    /// No usable diagnosis; `report` is the `unknown` fallback.
    Degraded { cause: EngineError, report: HealingReport },
}

/// Single oracle call bounded by `timeout`; a timeout counts as unreachable.
pub async fn diagnose_once(
    oracle: &dyn DiagnosisOracle,
    request: &DiagnosisRequest,
    timeout: Duration,
) -> DiagnosisOutcome {
    let cause = match tokio::time::timeout(timeout, oracle.diagnose(request)).await {
        Ok(Ok(report)) => return DiagnosisOutcome::Diagnosed(report),
        Ok(Err(err)) => err,
        Err(_) => EngineError::OracleUnreachable(format!(
            "diagnosis timed out after {}ms",
            timeout.as_millis()
        )),
    };
    warn!("[Oracle] Diagnosis unavailable: {}", cause);
    let report = HealingReport::unknown(&cause.to_string());
    DiagnosisOutcome::Degraded { cause, report }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedOracle;

    fn request() -> DiagnosisRequest {
        DiagnosisRequest {
            action: "click".into(),
            original_target: "#x".into(),
            error_message: "boom".into(),
            screen_description: String::new(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_degrades_to_unknown() {
        let oracle = ScriptedOracle::hanging();
        let outcome = diagnose_once(&oracle, &request(), Duration::from_millis(50)).await;
        match outcome {
            DiagnosisOutcome::Degraded { cause, report } => {
                assert!(matches!(cause, EngineError::OracleUnreachable(_)));
                assert!(report.is_unknown());
            }
            other => panic!("expected degraded outcome, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn unparsable_degrades_to_unknown() {
        let oracle = ScriptedOracle::failing(EngineError::OracleResponseUnparsable("prose".into()));
        let outcome = diagnose_once(&oracle, &request(), Duration::from_secs(1)).await;
        match outcome {
            DiagnosisOutcome::Degraded { report, .. } => assert!(report.is_unknown()),
            other => panic!("expected degraded outcome, got {:?}", other),
        }
        assert_eq!(oracle.calls(), 1);
    }
}
