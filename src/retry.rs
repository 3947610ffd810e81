//! Bounded retries for transport-level operations.
//!
//! Used by the API and database executors. UI actions never go through here:
//! their single retry belongs to the self-healing layer.

use std::future::Future;
use std::time::Duration;

use tokio::time::sleep;
use tracing::{info, warn};

use crate::error::EngineError;

// =====================================================
// RETRY CONFIGURATION
// =====================================================

#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 2,
            base_delay_ms: 400,
            max_delay_ms: 10_000,
            backoff_multiplier: 1.0,
        }
    }
}

impl RetryConfig {
    /// `retries` extra attempts with a fixed delay between them.
    pub fn fixed(retries: u32, delay_ms: u64) -> Self {
        Self {
            max_attempts: retries + 1,
            base_delay_ms: delay_ms,
            max_delay_ms: delay_ms,
            backoff_multiplier: 1.0,
        }
    }
}

// =====================================================
// ERROR CLASSIFICATION
// =====================================================

#[derive(Debug, Clone, PartialEq)]
pub enum FailureClass {
    Timeout,
    NetworkError,
    Busy,
    ServerError,
    Permanent,
}

/// Classify an error message to decide whether another attempt can help.
pub fn classify_error(message: &str) -> FailureClass {
    let msg_lower = message.to_lowercase();

    if msg_lower.contains("timeout") || msg_lower.contains("timed out") {
        return FailureClass::Timeout;
    }

    if msg_lower.contains("database is locked")
        || msg_lower.contains("database table is locked")
        || msg_lower.contains("busy")
    {
        return FailureClass::Busy;
    }

    if msg_lower.contains("connection")
        || msg_lower.contains("network")
        || msg_lower.contains("dns")
        || msg_lower.contains("transport")
    {
        return FailureClass::NetworkError;
    }

    if msg_lower.contains("502") || msg_lower.contains("503") || msg_lower.contains("504") {
        return FailureClass::ServerError;
    }

    FailureClass::Permanent
}

pub fn is_retryable(class: &FailureClass) -> bool {
    !matches!(class, FailureClass::Permanent)
}

pub fn calculate_delay(config: &RetryConfig, attempt: u32) -> Duration {
    let delay = config.base_delay_ms as f64 * config.backoff_multiplier.powi(attempt as i32);
    Duration::from_millis(delay.min(config.max_delay_ms as f64) as u64)
}

// =====================================================
// RETRY EXECUTOR
// =====================================================

/// Run `operation` until `should_retry` says stop or attempts run out.
///
/// Returns the last result together with the number of attempts made.
pub async fn with_retry_when<F, Fut, T, E, P>(
    config: &RetryConfig,
    operation_name: &str,
    mut operation: F,
    should_retry: P,
) -> (Result<T, E>, u32)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: Fn(&Result<T, E>) -> bool,
    E: std::fmt::Display,
{
    let max_attempts = config.max_attempts.max(1);
    let mut attempt = 0;
    loop {
        let result = operation().await;
        attempt += 1;

        if attempt >= max_attempts || !should_retry(&result) {
            if attempt > 1 && result.is_ok() {
                info!("[Retry] {} finished on attempt {}", operation_name, attempt);
            }
            return (result, attempt);
        }

        let delay = calculate_delay(config, attempt - 1);
        match &result {
            Err(e) => warn!(
                "[Retry] {} failed (attempt {}/{}): {} - waiting {}ms",
                operation_name,
                attempt,
                max_attempts,
                e,
                delay.as_millis()
            ),
            Ok(_) => warn!(
                "[Retry] {} returned a retryable result (attempt {}/{}) - waiting {}ms",
                operation_name,
                attempt,
                max_attempts,
                delay.as_millis()
            ),
        }
        sleep(delay).await;
    }
}

/// Retry while the error is transient.
pub async fn with_retry<F, Fut, T>(
    config: &RetryConfig,
    operation_name: &str,
    operation: F,
) -> (Result<T, EngineError>, u32)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, EngineError>>,
{
    with_retry_when(config, operation_name, operation, |result| match result {
        Err(e) => e.is_transient() || is_retryable(&classify_error(&e.to_string())),
        Ok(_) => false,
    })
    .await
}
