//! Resilient UI action execution across web, mobile, desktop, API and database
//! targets, with oracle-guided self-healing for screen-driven steps.

pub mod config;
pub mod context;
pub mod error;
pub mod factory;
pub mod healing;
pub mod obstacle;
pub mod oracle;
pub mod orchestrator;
pub mod platform;
pub mod retry;
pub mod schema;
pub mod screen;
pub mod vault;

#[cfg(test)]
mod testing;

pub use error::{EngineError, Result};
pub use factory::{ExecutorFactory, ExecutorHandle, PlatformConfig};
pub use orchestrator::{RunPolicy, ScenarioOrchestrator};
pub use schema::{Platform, RunReport, ScenarioStep};
