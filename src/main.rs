//! visionqa CLI - runs scenario files against configured platforms.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use serde::Deserialize;
use serde_json::Value;
use tracing::{info, warn};

use visionqa_core::config::EngineConfig;
use visionqa_core::context::ExecutionContext;
use visionqa_core::healing::SelfHealingLayer;
use visionqa_core::obstacle::ObstacleResolver;
use visionqa_core::oracle::{HuggingFaceDetector, LlmOracle};
use visionqa_core::platform::{ApiConfig, ApiRequest, HealthStatus};
use visionqa_core::vault::UserProfile;
use visionqa_core::{ExecutorFactory, ExecutorHandle, Platform, PlatformConfig, RunPolicy, ScenarioOrchestrator, ScenarioStep};

#[derive(Parser)]
#[command(name = "visionqa")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a scenario file and print the run report as JSON
    Run {
        scenario: PathBuf,

        /// Keep going after a failed step
        #[arg(long)]
        continue_on_failure: bool,

        #[arg(long)]
        pretty: bool,
    },

    /// Start each configured platform and report whether it is ready
    Health { scenario: PathBuf },

    /// Fire concurrent requests at one URL and print latency stats
    LoadTest {
        url: String,

        #[arg(long, default_value_t = 10)]
        count: usize,

        #[arg(long, default_value = "GET")]
        method: String,
    },
}

/// On-disk scenario: executor configs per platform, optional user profile,
/// seed variables and the ordered steps.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ScenarioFile {
    #[serde(default)]
    platforms: BTreeMap<String, Value>,
    #[serde(default)]
    profile: Option<Value>,
    #[serde(default)]
    context: Value,
    #[serde(default)]
    stop_on_failure: Option<bool>,
    steps: Vec<ScenarioStep>,
}

impl ScenarioFile {
    fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        serde_json::from_str(&raw).with_context(|| format!("parsing {}", path.display()))
    }

    fn executors(&self) -> anyhow::Result<Vec<ExecutorHandle>> {
        let mut handles = Vec::new();
        for (name, raw) in &self.platforms {
            let platform: Platform = name.parse()?;
            let config = PlatformConfig::from_json(platform, raw.clone())?;
            handles.push(ExecutorFactory::create_executor(platform, config)?);
        }
        Ok(handles)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();

    let log_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Run {
            scenario,
            continue_on_failure,
            pretty,
        } => run(&scenario, continue_on_failure, pretty).await,
        Commands::Health { scenario } => health(&scenario).await,
        Commands::LoadTest { url, count, method } => load_test(url, count, method).await,
    }
}

async fn run(path: &Path, continue_on_failure: bool, pretty: bool) -> anyhow::Result<ExitCode> {
    let config = EngineConfig::from_env();
    let scenario = ScenarioFile::load(path)?;
    let profile = scenario.profile.as_ref().map(UserProfile::from_value);

    let mut oracle = LlmOracle::new(config.oracle.clone())?;
    if let Some(profile) = &profile {
        oracle = oracle.with_profile_context(profile.summarize_for_llm());
    }
    let detector = Arc::new(HuggingFaceDetector::new(config.detector.clone())?);
    let mut obstacles = ObstacleResolver::new(detector.clone(), config.obstacles.clone());
    if let Some(profile) = profile {
        obstacles = obstacles.with_profile(profile);
    }
    let healing = SelfHealingLayer::new(Arc::new(oracle), detector, obstacles, config.healing.clone());

    let stop_on_failure = !continue_on_failure && scenario.stop_on_failure.unwrap_or(config.stop_on_failure);
    let mut orchestrator = ScenarioOrchestrator::new(healing)
        .with_context(ExecutionContext::from_value(scenario.context.clone()))
        .with_policy(RunPolicy { stop_on_failure });
    for handle in scenario.executors()? {
        orchestrator = orchestrator.with_executor(handle);
    }

    let cancel = orchestrator.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("[CLI] Interrupt received; finishing the current step");
            cancel.cancel();
        }
    });

    let report = orchestrator.run(scenario.steps).await;
    let out = if pretty {
        serde_json::to_string_pretty(&report)?
    } else {
        serde_json::to_string(&report)?
    };
    println!("{}", out);
    Ok(if report.success { ExitCode::SUCCESS } else { ExitCode::FAILURE })
}

async fn health(path: &Path) -> anyhow::Result<ExitCode> {
    let scenario = ScenarioFile::load(path)?;
    let mut all_ready = true;
    for mut handle in scenario.executors()? {
        let status = match handle.start().await {
            Ok(_) => handle.health_check().await,
            Err(e) => HealthStatus::unavailable(handle.platform(), e.to_string()),
        };
        all_ready &= status.ready;
        println!("{}", serde_json::to_string(&status)?);
        if let Err(e) = handle.stop().await {
            warn!("[CLI] Stopping {} failed: {}", handle.platform(), e);
        }
    }
    Ok(if all_ready { ExitCode::SUCCESS } else { ExitCode::FAILURE })
}

async fn load_test(url: String, count: usize, method: String) -> anyhow::Result<ExitCode> {
    if count == 0 {
        bail!("--count must be at least 1");
    }
    let mut handle = ExecutorFactory::create_executor(Platform::Api, PlatformConfig::Api(ApiConfig::default()))?;
    handle.start().await?;
    let request = ApiRequest {
        method: method.to_uppercase(),
        path: url,
        ..ApiRequest::default()
    };
    let report = match handle.executor_mut().requests() {
        Some(api) => api.load_test(&request, count).await,
        None => bail!("api executor has no request capability"),
    };
    handle.stop().await?;

    info!(
        "[CLI] {}/{} succeeded, avg {:.1}ms, p95 {:.1}ms",
        report.success_count, report.total_requests, report.avg_duration_ms, report.p95_duration_ms
    );
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(if report.success_count == report.total_requests {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}
