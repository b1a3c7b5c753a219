//! Plugin contract and registry.
//!
//! A plugin is a named handler for a protocol. It registers a kind string, a
//! JSON config schema, a Parse operation (pure, static validation run once
//! per step at compile time) and an Execute operation (the activity body).
//!
//! Execute receives a frozen state snapshot and a config whose string leaves
//! have already been passed through the central template engine's runtime
//! phase; plugins never interpolate strings themselves. Errors returned from
//! Execute are classified retryable or not via [`EngineError`], which the
//! step's retry policy consumes.

pub mod delay;
pub mod http;
pub mod log;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use indexmap::IndexMap;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::errors::EngineError;
use crate::state::StateSnapshot;
use crate::template::MissingPolicy;

/// Sink for structured log entries emitted from inside an activity.
///
/// Implemented by the run log; activities hold it behind an `Arc` and never
/// see the underlying stream.
pub trait ActivityLog: Send + Sync {
    /// Appends one entry to the owning run's log stream.
    fn emit(&self, level: &str, payload: Value);
}

/// Everything an activity invocation may observe.
pub struct ActivityContext {
    /// Identifier of the enclosing run.
    pub run_id: String,
    /// Enclosing test name; `None` for suite-level hooks.
    pub test_name: Option<String>,
    /// Name of the step being executed.
    pub step_name: String,
    /// State map frozen at invocation.
    pub state: StateSnapshot,
    /// Injected environment for `.env.*` resolution.
    pub env: HashMap<String, String>,
    /// Cooperative cancellation signal; long-running work should select on
    /// it and abandon promptly when fired.
    pub cancel: CancellationToken,
    /// Log sink scoped to this run/test/step.
    pub log: Arc<dyn ActivityLog>,
    /// Attempt number, starting at 1.
    pub attempt: u32,
}

/// Structured result of a plugin Execute call: the substrate assertions and
/// save rules evaluate against.
#[derive(Debug, Clone)]
pub struct StepResponse {
    /// Kind of the plugin that produced this response.
    pub plugin: String,
    /// Protocol status code, when the protocol has one (HTTP).
    pub status: Option<u16>,
    /// Response headers, when the protocol has them. Names are lowercased.
    pub headers: IndexMap<String, String>,
    /// Structured body. `Value::Null` when the protocol returns none or the
    /// payload was not parseable as JSON.
    pub body: Value,
    /// Raw textual body when it was not valid JSON (kept for diagnostics).
    pub raw_body: Option<String>,
    /// Wall-clock duration of the protocol action in milliseconds.
    pub duration_ms: u64,
}

impl StepResponse {
    /// Creates an empty response for the given plugin kind.
    pub fn new(plugin: impl Into<String>) -> Self {
        Self {
            plugin: plugin.into(),
            status: None,
            headers: IndexMap::new(),
            body: Value::Null,
            raw_body: None,
            duration_ms: 0,
        }
    }

    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(String::as_str)
    }
}

/// The uniform per-protocol handler interface.
#[async_trait]
pub trait Plugin: Send + Sync {
    /// Unique kind string steps reference in their `plugin` field.
    fn kind(&self) -> &'static str;

    /// JSON Schema describing this plugin's step config; advertised through
    /// capabilities discovery and enforced at Parse time.
    fn config_schema(&self) -> Value;

    /// Static validation of a raw step config. Pure; runs once per step when
    /// a suite is compiled and must not depend on runtime state.
    fn parse(&self, config: &Value) -> Result<(), EngineError>;

    /// Executes the protocol action. `config` has already been through the
    /// template engine's runtime phase against `ctx.state`.
    async fn execute(
        &self,
        ctx: &ActivityContext,
        config: &Value,
    ) -> Result<StepResponse, EngineError>;

    /// How the runtime phase treats unresolved references in this plugin's
    /// config. Hard failure unless a plugin opts into leniency.
    fn missing_policy(&self) -> MissingPolicy {
        MissingPolicy::Fail
    }
}

/// Validates `config` against `schema`, returning each violation with its
/// instance path. Shared by the reference plugins' Parse implementations.
pub fn check_schema(schema: &Value, config: &Value) -> Result<(), EngineError> {
    let compiled = jsonschema::JSONSchema::compile(schema).map_err(|err| {
        EngineError::internal(format!("plugin config schema does not compile: {err}"))
    })?;
    let result = compiled.validate(config);
    if let Err(violations) = result {
        let details: Vec<String> = violations
            .map(|v| format!("{} at {}", v, v.instance_path))
            .collect();
        return Err(EngineError::Validation { violations: details });
    }
    Ok(())
}

// ============================================================================
// Registry
// ============================================================================

/// Registry of plugins keyed by kind. Populated at process startup; a suite
/// referencing an unregistered kind fails validation.
#[derive(Default)]
pub struct PluginRegistry {
    plugins: HashMap<&'static str, Arc<dyn Plugin>>,
}

impl PluginRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a plugin. Rejects duplicate kinds.
    pub fn register(&mut self, plugin: Arc<dyn Plugin>) -> Result<(), EngineError> {
        let kind = plugin.kind();
        if self.plugins.contains_key(kind) {
            return Err(EngineError::internal(format!(
                "plugin kind '{kind}' registered twice"
            )));
        }
        self.plugins.insert(kind, plugin);
        Ok(())
    }

    /// True when a plugin with this kind is registered.
    pub fn contains(&self, kind: &str) -> bool {
        self.plugins.contains_key(kind)
    }

    /// Looks up a plugin by kind.
    pub fn get(&self, kind: &str) -> Option<Arc<dyn Plugin>> {
        self.plugins.get(kind).cloned()
    }

    /// Registered kinds, sorted for stable messages.
    pub fn kinds(&self) -> Vec<&'static str> {
        let mut kinds: Vec<&'static str> = self.plugins.keys().copied().collect();
        kinds.sort_unstable();
        kinds
    }

    /// Runs a step config through the owning plugin's Parse operation.
    /// Returns a human-readable detail string on failure.
    pub fn validate_config(&self, kind: &str, config: &Value) -> Result<(), String> {
        let Some(plugin) = self.plugins.get(kind) else {
            return Err(format!("unknown plugin '{kind}'"));
        };
        plugin.parse(config).map_err(|err| err.to_string())
    }

    /// Kind + config schema for every registered plugin, sorted by kind.
    pub fn capabilities(&self) -> Vec<(&'static str, Value)> {
        let mut caps: Vec<(&'static str, Value)> = self
            .plugins
            .values()
            .map(|p| (p.kind(), p.config_schema()))
            .collect();
        caps.sort_unstable_by_key(|(kind, _)| *kind);
        caps
    }
}

/// Registry preloaded with the reference plugins (http, delay, log).
pub fn default_registry() -> PluginRegistry {
    let mut registry = PluginRegistry::new();
    for plugin in [
        Arc::new(http::HttpPlugin::new()) as Arc<dyn Plugin>,
        Arc::new(delay::DelayPlugin) as Arc<dyn Plugin>,
        Arc::new(log::LogPlugin) as Arc<dyn Plugin>,
    ] {
        // Built-in kinds are distinct by construction.
        let _ = registry.register(plugin);
    }
    registry
}

/// No-op log sink for contexts that have no run attached (unit tests,
/// one-shot validation paths).
pub struct NullLog;

impl ActivityLog for NullLog {
    fn emit(&self, _level: &str, _payload: Value) {}
}

impl ActivityContext {
    /// Minimal context for exercising a plugin outside the workflow runtime.
    pub fn for_testing(state: StateSnapshot) -> Self {
        Self {
            run_id: "test-run".to_string(),
            test_name: None,
            step_name: "step".to_string(),
            state,
            env: HashMap::new(),
            cancel: CancellationToken::new(),
            log: Arc::new(NullLog),
            attempt: 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_default_registry_has_reference_plugins() {
        let registry = default_registry();
        assert_eq!(registry.kinds(), vec!["delay", "http", "log"]);
        assert!(registry.contains("http"));
        assert!(!registry.contains("sql"));
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let mut registry = default_registry();
        let err = registry
            .register(Arc::new(delay::DelayPlugin))
            .unwrap_err();
        assert!(err.to_string().contains("registered twice"));
    }

    #[test]
    fn test_validate_config_reports_unknown_kind() {
        let registry = default_registry();
        let err = registry.validate_config("sql", &json!({})).unwrap_err();
        assert!(err.contains("unknown plugin"));
    }

    #[test]
    fn test_capabilities_lists_schemas() {
        let registry = default_registry();
        let caps = registry.capabilities();
        assert_eq!(caps.len(), 3);
        for (_, schema) in caps {
            assert!(schema.is_object(), "every plugin publishes a schema");
        }
    }

    #[test]
    fn test_header_lookup_is_case_insensitive() {
        let mut response = StepResponse::new("http");
        response
            .headers
            .insert("content-type".to_string(), "application/json".to_string());
        assert_eq!(response.header("Content-Type"), Some("application/json"));
    }
}
