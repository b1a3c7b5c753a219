//! Engine façade.
//!
//! Owns the plugin registry and the run registry, and exposes the operations
//! the RPC surface and the CLI build on: create a run from raw YAML, read a
//! run snapshot, list runs, subscribe to a run's log stream, cancel a run.
//! Runs execute on spawned tasks; different runs share nothing but the
//! registry and the process environment.

pub mod runs;
pub mod workflow;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tracing::info;
use uuid::Uuid;

use crate::dsl::{self, CompileOptions};
use crate::errors::EngineError;
use crate::plugins::{default_registry, PluginRegistry};
use runs::{LogSubscription, RunHandle, RunRecord, RunStatus};

/// Engine guardrails, overridable from the environment.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Deadline applied to runs whose suite sets no `timeout`
    /// (`ROCKETSHIP_DEFAULT_TIMEOUT_SECS`).
    pub default_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_secs(600),
        }
    }
}

impl EngineConfig {
    /// Reads overrides from the process environment.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(value) = std::env::var("ROCKETSHIP_DEFAULT_TIMEOUT_SECS") {
            if let Ok(secs) = value.parse::<u64>() {
                config.default_timeout = Duration::from_secs(secs);
            }
        }
        config
    }
}

/// The engine: plugin registry plus run registry.
pub struct Engine {
    registry: Arc<PluginRegistry>,
    config: EngineConfig,
    /// `.env.*` resolution environment, captured once at construction so
    /// runs are deterministic and tests can inject their own.
    env: Arc<HashMap<String, String>>,
    handles: RwLock<Vec<Arc<RunHandle>>>,
}

impl Engine {
    /// Engine with the reference plugins and the real process environment.
    pub fn new(config: EngineConfig) -> Self {
        Self::with_registry(config, default_registry(), std::env::vars().collect())
    }

    /// Engine with a caller-assembled registry and environment. Tests use
    /// this to register stub plugins and control `.env.*` resolution.
    pub fn with_registry(
        config: EngineConfig,
        registry: PluginRegistry,
        env: HashMap<String, String>,
    ) -> Self {
        Self {
            registry: Arc::new(registry),
            config,
            env: Arc::new(env),
            handles: RwLock::new(Vec::new()),
        }
    }

    /// The registry, for capabilities discovery.
    pub fn registry(&self) -> &PluginRegistry {
        &self.registry
    }

    /// Compiles `yaml` and starts a suite workflow for it.
    ///
    /// Validation failures are returned synchronously and create no run.
    /// The effective deadline is, in order of precedence: the explicit
    /// `timeout` argument, the suite's `timeout`, the engine default.
    pub async fn create_run(
        &self,
        yaml: &str,
        overrides: Vec<(String, String)>,
        timeout: Option<Duration>,
    ) -> Result<String, EngineError> {
        let options = CompileOptions {
            overrides,
            env: (*self.env).clone(),
        };
        let suite = dsl::compile(yaml, &options, &self.registry)?;

        let run_id = Uuid::new_v4().to_string();
        let deadline = timeout
            .or(suite.timeout)
            .unwrap_or(self.config.default_timeout);

        let handle = RunHandle::new(run_id.clone(), suite.name.clone());
        self.handles.write().await.push(handle.clone());

        info!(run_id = %run_id, suite = %suite.name, "run created");
        tokio::spawn(workflow::run_suite(workflow::SuiteRun {
            suite,
            handle,
            registry: self.registry.clone(),
            env: self.env.clone(),
            deadline,
        }));

        Ok(run_id)
    }

    /// Snapshot of one run.
    pub async fn get_run(&self, run_id: &str) -> Option<RunRecord> {
        self.handle(run_id).await.map(|handle| handle.snapshot())
    }

    /// Snapshots of all runs, newest first.
    pub async fn list_runs(&self) -> Vec<RunRecord> {
        let handles = self.handles.read().await;
        handles.iter().rev().map(|handle| handle.snapshot()).collect()
    }

    /// Opens a log subscription for a run.
    pub async fn subscribe_logs(&self, run_id: &str) -> Option<LogSubscription> {
        self.handle(run_id).await.map(|handle| handle.log.subscribe())
    }

    /// Requests cooperative cancellation. Returns `None` for unknown runs,
    /// `Some(false)` when the run was already terminal.
    pub async fn cancel_run(&self, run_id: &str) -> Option<bool> {
        let handle = self.handle(run_id).await?;
        if handle.status().is_terminal() {
            return Some(false);
        }
        info!(run_id = %run_id, "cancellation requested");
        handle.cancel.cancel();
        Some(true)
    }

    /// Blocks until the run reaches a terminal status and returns it.
    pub async fn wait_for_run(&self, run_id: &str) -> Option<RunStatus> {
        let handle = self.handle(run_id).await?;
        Some(handle.wait().await)
    }

    async fn handle(&self, run_id: &str) -> Option<Arc<RunHandle>> {
        let handles = self.handles.read().await;
        handles.iter().find(|h| h.run_id == run_id).cloned()
    }
}
