//! Runs an ordered scenario across platforms with a shared variable context.

use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::time::Instant;

use futures::FutureExt;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::context::ExecutionContext;
use crate::error::{EngineError, Result};
use crate::factory::ExecutorHandle;
use crate::healing::SelfHealingLayer;
use crate::platform::{ApiRequest, PlatformExecutor};
use crate::schema::{Platform, RunReport, ScenarioStep, Step, StepOutcome, StepResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunPolicy {
    pub stop_on_failure: bool,
}

impl Default for RunPolicy {
    fn default() -> Self {
        Self { stop_on_failure: true }
    }
}

/// Owns the executors, the healing layer and the context for exactly one run.
pub struct ScenarioOrchestrator {
    executors: BTreeMap<Platform, ExecutorHandle>,
    healing: SelfHealingLayer,
    context: ExecutionContext,
    policy: RunPolicy,
    cancel: CancellationToken,
}

impl ScenarioOrchestrator {
    pub fn new(healing: SelfHealingLayer) -> Self {
        Self {
            executors: BTreeMap::new(),
            healing,
            context: ExecutionContext::new(),
            policy: RunPolicy::default(),
            cancel: CancellationToken::new(),
        }
    }

    /// Register the executor for its platform, replacing any earlier one.
    pub fn with_executor(mut self, handle: ExecutorHandle) -> Self {
        self.executors.insert(handle.platform(), handle);
        self
    }

    pub fn with_context(mut self, context: ExecutionContext) -> Self {
        self.context = context;
        self
    }

    pub fn with_policy(mut self, policy: RunPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Cancelling the token stops the run before the next step starts.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Execute `steps` in order. Never fails: every outcome, including a
    /// panic inside an executor, ends up in the report. Every registered
    /// executor is stopped exactly once before this returns.
    pub async fn run(mut self, steps: Vec<ScenarioStep>) -> RunReport {
        let run_id = Uuid::new_v4();
        info!("[Scenario] Run {} started with {} step(s)", run_id, steps.len());

        let mut results = Vec::with_capacity(steps.len());
        let mut in_flight: Option<Step> = None;
        let mut cancelled = false;

        let outcome = AssertUnwindSafe(self.run_steps(&steps, &mut results, &mut in_flight, &mut cancelled))
            .catch_unwind()
            .await;
        if let Err(panic) = outcome {
            let message = panic_message(&*panic);
            error!("[Scenario] Step panicked: {}", message);
            if let Some(step) = in_flight.take() {
                let failed = StepResult::pending(step).finalize(
                    StepOutcome::Failed {
                        reason: "executor panicked".to_string(),
                        error: message,
                    },
                    None,
                    0,
                );
                results.push(failed);
            }
        }

        self.release_all().await;

        let executed_steps = results.iter().filter(|r| r.executed()).count();
        let success = !cancelled && results.iter().all(StepResult::passed);
        info!(
            "[Scenario] Run {} finished: success={} executed={}/{}",
            run_id,
            success,
            executed_steps,
            steps.len()
        );
        RunReport {
            run_id,
            success,
            total_steps: steps.len(),
            executed_steps,
            cancelled,
            results,
            final_context: self.context.to_value(),
        }
    }

    async fn run_steps(
        &mut self,
        steps: &[ScenarioStep],
        results: &mut Vec<StepResult>,
        in_flight: &mut Option<Step>,
        cancelled: &mut bool,
    ) {
        for (idx, raw) in steps.iter().enumerate() {
            if self.cancel.is_cancelled() {
                info!("[Scenario] Cancelled before step {}", idx + 1);
                *cancelled = true;
                for (offset, rest) in steps[idx..].iter().enumerate() {
                    let step = Step::from_resolved(idx + offset + 1, rest.platform, &rest.action, rest.params.clone());
                    results.push(StepResult::skipped(step, "run cancelled"));
                }
                return;
            }

            let params = self.context.resolve(&raw.params);
            let step = Step::from_resolved(idx + 1, raw.platform, &raw.action, params);
            info!("[Scenario] {}", step.label());
            *in_flight = Some(step.clone());
            let result = self.execute_step(step, raw.variable_output.as_deref()).await;
            *in_flight = None;

            let failed = !result.passed();
            results.push(result);
            if failed && self.policy.stop_on_failure {
                warn!("[Scenario] Step {} failed; halting run", idx + 1);
                return;
            }
        }
    }

    async fn execute_step(&mut self, step: Step, variable_output: Option<&str>) -> StepResult {
        let pending = StepResult::pending(step.clone());
        let started = Instant::now();
        let outcome = match self.dispatch(&step).await {
            Ok(outcome) => outcome,
            Err(e) => StepOutcome::Failed {
                reason: format!("{} failed", step.action),
                error: e.to_string(),
            },
        };
        let duration_ms = started.elapsed().as_millis() as u64;
        let healing_report = self.healing.take_report();

        if let (StepOutcome::Passed { output: Some(value), .. }, Some(key)) = (&outcome, variable_output) {
            debug!("[Scenario] Storing output of step {} as '{}'", step.sequence, key);
            self.context.insert(key, value.clone());
        }
        pending.finalize(outcome, healing_report, duration_ms)
    }

    async fn dispatch(&mut self, step: &Step) -> Result<StepOutcome> {
        let Self { executors, healing, .. } = self;
        let handle = executors
            .get_mut(&step.platform)
            .ok_or(EngineError::ExecutorUnavailable(step.platform))?;
        handle.start().await?;
        let executor = handle.executor_mut();

        match step.platform {
            Platform::Api => dispatch_api(executor, step).await,
            Platform::Database => dispatch_db(executor, step).await,
            _ => dispatch_ui(healing, executor, step).await,
        }
    }

    async fn release_all(&mut self) {
        for (platform, handle) in self.executors.iter_mut() {
            match handle.stop().await {
                Ok(_) => debug!("[Scenario] {} released", platform),
                Err(e) => warn!("[Scenario] Releasing {} failed: {}", platform, e),
            }
        }
    }
}

fn required<'a>(step: &'a Step, keys: &[&str]) -> Result<&'a str> {
    keys.iter()
        .find_map(|k| step.param_str(k))
        .ok_or_else(|| EngineError::InvalidParams(format!("'{}' needs one of {:?}", step.action, keys)))
}

fn required_i64(step: &Step, key: &str) -> Result<i64> {
    step.params
        .get(key)
        .and_then(Value::as_i64)
        .ok_or_else(|| EngineError::InvalidParams(format!("'{}' needs integer '{}'", step.action, key)))
}

fn unsupported(step: &Step) -> EngineError {
    EngineError::UnsupportedAction {
        platform: step.platform,
        action: step.action.clone(),
    }
}

fn passed(reason: String) -> StepOutcome {
    StepOutcome::Passed { reason, output: None }
}

async fn dispatch_ui(
    healing: &mut SelfHealingLayer,
    executor: &mut dyn PlatformExecutor,
    step: &Step,
) -> Result<StepOutcome> {
    match step.action.as_str() {
        "tap" => {
            let touch = executor.touch().ok_or_else(|| unsupported(step))?;
            let (x, y) = (required_i64(step, "x")?, required_i64(step, "y")?);
            touch.tap(x, y).await?;
            return Ok(passed(format!("tapped ({}, {})", x, y)));
        }
        "swipe" => {
            let touch = executor.touch().ok_or_else(|| unsupported(step))?;
            let start = (required_i64(step, "start_x")?, required_i64(step, "start_y")?);
            let end = (required_i64(step, "end_x")?, required_i64(step, "end_y")?);
            let duration = step.params.get("duration_ms").and_then(Value::as_u64).unwrap_or(500);
            touch.swipe(start, end, duration).await?;
            return Ok(passed("swiped".to_string()));
        }
        _ => {}
    }

    let driver = executor.ui().ok_or_else(|| unsupported(step))?;
    match step.action.as_str() {
        "navigate" | "open_url" => {
            let url = required(step, &["url", "target"])?;
            healing.navigate(driver, url).await?;
            Ok(passed(format!("navigated to {}", url)))
        }
        "click" => {
            let target = required(step, &["selector", "target"])?;
            healing.click(driver, target).await?;
            Ok(passed(format!("clicked {}", target)))
        }
        "type" | "fill" => {
            let target = required(step, &["selector", "target"])?;
            let text = step.value.as_deref().ok_or_else(|| {
                EngineError::InvalidParams(format!("'{}' needs one of [\"text\", \"value\"]", step.action))
            })?;
            healing.type_text(driver, target, text).await?;
            Ok(passed(format!("typed into {}", target)))
        }
        "verify" | "assert_visible" => {
            let target = required(step, &["selector", "target"])?;
            if healing.verify(driver, target).await? {
                Ok(passed(format!("{} is visible", target)))
            } else {
                Ok(StepOutcome::Failed {
                    reason: "verification failed".to_string(),
                    error: EngineError::VerificationFailed(target.to_string()).to_string(),
                })
            }
        }
        "screenshot" => {
            let bytes = driver.screenshot().await?;
            Ok(passed(format!("captured {} bytes", bytes.len())))
        }
        _ => Err(unsupported(step)),
    }
}

async fn dispatch_api(executor: &mut dyn PlatformExecutor, step: &Step) -> Result<StepOutcome> {
    let api = executor.requests().ok_or_else(|| unsupported(step))?;
    let action = step.action.to_lowercase();

    let response = match action.as_str() {
        "load_test" => {
            let request = ApiRequest::from_params(&step.params, "GET")?;
            let count = step.params.get("count").and_then(Value::as_u64).unwrap_or(10) as usize;
            let report = api.load_test(&request, count).await;
            let output = serde_json::to_value(&report)?;
            return Ok(if report.success_count == report.total_requests {
                StepOutcome::Passed {
                    reason: format!("{} requests, p95 {:.1}ms", report.total_requests, report.p95_duration_ms),
                    output: Some(output),
                }
            } else {
                StepOutcome::Failed {
                    reason: "load test had failures".to_string(),
                    error: format!("{}/{} requests succeeded", report.success_count, report.total_requests),
                }
            });
        }
        "swagger" | "list_endpoints" => {
            let path = required(step, &["url", "path"])?;
            let endpoints = api.parse_swagger(path).await?;
            return Ok(StepOutcome::Passed {
                reason: format!("{} endpoint(s)", endpoints.len()),
                output: Some(serde_json::to_value(&endpoints)?),
            });
        }
        "graphql" => {
            let path = required(step, &["url", "path"])?;
            let query = required(step, &["query"])?;
            api.graphql_query(path, query, step.params.get("variables").cloned()).await
        }
        "request" | "call" => api.execute_step(&ApiRequest::from_params(&step.params, "GET")?).await,
        "get" | "post" | "put" | "patch" | "delete" => {
            let mut request = ApiRequest::from_params(&step.params, &action)?;
            request.method = action.to_uppercase();
            api.execute_step(&request).await
        }
        _ => return Err(unsupported(step)),
    };

    let status = response
        .status_code
        .map(|s| format!("HTTP {}", s))
        .unwrap_or_else(|| "no response".to_string());
    Ok(if response.success {
        StepOutcome::Passed {
            reason: status,
            output: Some(response.body),
        }
    } else {
        StepOutcome::Failed {
            reason: status,
            error: response.error.unwrap_or_else(|| "request failed".to_string()),
        }
    })
}

async fn dispatch_db(executor: &mut dyn PlatformExecutor, step: &Step) -> Result<StepOutcome> {
    let db = executor.queries().ok_or_else(|| unsupported(step))?;
    match step.action.as_str() {
        "query" | "execute" => {
            let sql = required(step, &["query", "sql"])?;
            let params = step.params.get("params").cloned().unwrap_or(Value::Null);
            let outcome = db.execute_query(sql, &params).await;
            Ok(if outcome.success {
                StepOutcome::Passed {
                    reason: format!("{} row(s)", outcome.row_count),
                    output: outcome.rows.into_iter().next().map(Value::Object),
                }
            } else {
                StepOutcome::Failed {
                    reason: "query failed".to_string(),
                    error: outcome.error.unwrap_or_default(),
                }
            })
        }
        "validate_schema" => {
            let table = required(step, &["table"])?;
            let expected: Vec<String> = step
                .params
                .get("expected_columns")
                .or_else(|| step.params.get("expectedColumns"))
                .and_then(Value::as_array)
                .map(|cols| cols.iter().filter_map(Value::as_str).map(str::to_string).collect())
                .unwrap_or_default();
            let report = db.validate_schema(table, &expected).await;
            Ok(checked(report, "schema mismatch"))
        }
        "check_table_count" => {
            let table = required(step, &["table"])?;
            let min = step
                .params
                .get("min_expected")
                .or_else(|| step.params.get("minExpected"))
                .and_then(Value::as_i64)
                .unwrap_or(1);
            let report = db.check_table_count(table, min).await;
            let ok = report["validation_passed"].as_bool().unwrap_or(false);
            Ok(if ok {
                StepOutcome::Passed {
                    reason: format!("{} has {} row(s)", table, report["count"]),
                    output: Some(report),
                }
            } else {
                StepOutcome::Failed {
                    reason: "row count below minimum".to_string(),
                    error: report.to_string(),
                }
            })
        }
        _ => Err(unsupported(step)),
    }
}

fn checked(report: Value, failure: &str) -> StepOutcome {
    if report["success"].as_bool().unwrap_or(false) {
        StepOutcome::Passed {
            reason: "ok".to_string(),
            output: Some(report),
        }
    } else {
        StepOutcome::Failed {
            reason: failure.to_string(),
            error: report.to_string(),
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
