//! DSL compiler.
//!
//! Parses suite YAML into a normalized [`Suite`], validates it (collecting
//! every violation rather than stopping at the first), applies the template
//! engine's config phase to every string leaf, and dispatches per-plugin
//! config validation. All failures here are fatal before a run is created.

use std::collections::HashMap;
use std::collections::HashSet;
use std::time::Duration;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::EngineError;
use crate::plugins::PluginRegistry;
use crate::template::ConfigResolver;

/// Environment prefix for config-variable overrides
/// (`ROCKETSHIP_VAR_base_url=http://b` overrides `vars.base_url`).
pub const ENV_VAR_PREFIX: &str = "ROCKETSHIP_VAR_";

// ============================================================================
// Suite model
// ============================================================================

/// A parsed test suite. Immutable once compiled; owned by the suite workflow
/// for the lifetime of a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Suite {
    /// Suite name, used in run summaries and log correlation.
    #[serde(default)]
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Config variables referenced as `{{ .vars.<path> }}`.
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub vars: IndexMap<String, Value>,

    /// Overall run deadline; the engine default applies when absent.
    #[serde(
        default,
        with = "humantime_serde::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub timeout: Option<Duration>,

    /// Steps run exactly once before any test. Saves made here seed every
    /// test's state map.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub init: Vec<Step>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cleanup: Option<CleanupHooks>,

    /// Ordered tests; executed sequentially.
    #[serde(default)]
    pub tests: Vec<TestCase>,
}

/// Cleanup hook groups shared by suites and tests.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CleanupHooks {
    /// Runs once after the enclosing scope terminates, regardless of outcome
    /// (including cancellation and timeout).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub always: Vec<Step>,

    /// Runs once iff the enclosing scope failed, before `always`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub on_failure: Vec<Step>,
}

/// One test: hooks plus a strictly sequential step list sharing a state map.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestCase {
    #[serde(default)]
    pub name: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub init: Vec<Step>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cleanup: Option<CleanupHooks>,

    #[serde(default)]
    pub steps: Vec<Step>,
}

/// The unit of plugin invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    /// Step name; required, used for log correlation.
    #[serde(default)]
    pub name: String,

    /// Registered plugin kind executing this step.
    #[serde(default)]
    pub plugin: String,

    /// Plugin-specific config; opaque to the runtime except for template
    /// resolution.
    #[serde(default)]
    pub config: Value,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub assertions: Vec<Assertion>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub save: Vec<SaveRule>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryPolicy>,
}

/// A single assertion against the step's structured response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Assertion {
    /// Assertion kind: `status_code`, `json_path`, `header`, `json_schema`.
    #[serde(rename = "type", default)]
    pub kind: String,

    /// Path into the response body (`json_path`, optional for `json_schema`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,

    /// Header name (`header` assertions).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Comparison operator; `eq` when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operator: Option<String>,

    /// Expected value (or the schema itself for `json_schema`).
    #[serde(default)]
    pub expected: Value,
}

/// Extracts a value from the step response into the state map.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SaveRule {
    /// Path into the response body, e.g. `.id` or `.user.email`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub json_path: Option<String>,

    /// Response header name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub header: Option<String>,

    /// Target variable name in the state map.
    #[serde(rename = "as", default)]
    pub target: String,

    /// When true, a missing value fails the step.
    #[serde(default)]
    pub required: bool,
}

/// Per-step retry policy mapped onto the activity backoff loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Delay before the second attempt.
    #[serde(default = "default_initial_interval", with = "humantime_serde")]
    pub initial_interval: Duration,

    /// Upper bound on any single backoff interval; uncapped when absent.
    #[serde(
        default,
        with = "humantime_serde::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub maximum_interval: Option<Duration>,

    /// Total attempts including the first. Must be >= 1.
    #[serde(default = "default_maximum_attempts")]
    pub maximum_attempts: u32,

    /// Multiplier applied to the interval after each attempt. Must be >= 1.0.
    #[serde(default = "default_backoff_coefficient")]
    pub backoff_coefficient: f64,

    /// Error kinds (see `EngineError::kind`) that must never be retried even
    /// though their class is retryable.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub non_retryable_errors: Vec<String>,
}

fn default_initial_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_maximum_attempts() -> u32 {
    1
}

fn default_backoff_coefficient() -> f64 {
    2.0
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_interval: default_initial_interval(),
            maximum_interval: None,
            maximum_attempts: default_maximum_attempts(),
            backoff_coefficient: default_backoff_coefficient(),
            non_retryable_errors: Vec::new(),
        }
    }
}

/// Core assertion kinds evaluated by the runtime.
pub const CORE_ASSERTION_KINDS: &[&str] = &["status_code", "json_path", "header", "json_schema"];

// ============================================================================
// Compilation
// ============================================================================

/// Inputs to [`compile`] beyond the YAML itself.
#[derive(Debug, Clone, Default)]
pub struct CompileOptions {
    /// Operator-supplied overrides, dotted path to value. Highest precedence.
    pub overrides: Vec<(String, String)>,

    /// Process environment, scanned for `ROCKETSHIP_VAR_*` entries. Injected
    /// rather than read directly so compilation stays deterministic in tests.
    pub env: HashMap<String, String>,
}

impl CompileOptions {
    /// Captures the real process environment.
    pub fn from_process_env(overrides: Vec<(String, String)>) -> Self {
        Self {
            overrides,
            env: std::env::vars().collect(),
        }
    }
}

/// Parses, validates and normalizes a suite.
///
/// Processing order: YAML parse, structural validation (all violations
/// collected), config-variable substitution, then per-plugin config
/// validation. Any failure aborts before a run is created.
pub fn compile(
    yaml: &str,
    options: &CompileOptions,
    registry: &PluginRegistry,
) -> Result<Suite, EngineError> {
    let mut suite: Suite = serde_yaml::from_str(yaml).map_err(|err| {
        let location = err
            .location()
            .map(|loc| format!(" at line {}, column {}", loc.line(), loc.column()))
            .unwrap_or_default();
        EngineError::Validation {
            violations: vec![format!("yaml parse error{location}: {err}")],
        }
    })?;

    let violations = validate(&suite, registry);
    if !violations.is_empty() {
        return Err(EngineError::Validation { violations });
    }

    merge_variable_sources(&mut suite.vars, options);
    resolve_config_phase(&mut suite)?;

    let plugin_violations = validate_plugin_configs(&suite, registry);
    if !plugin_violations.is_empty() {
        return Err(EngineError::Validation {
            violations: plugin_violations,
        });
    }

    Ok(suite)
}

/// Applies override sources onto inline `vars`. Later sources win: inline,
/// then `ROCKETSHIP_VAR_*` environment entries, then operator overrides.
fn merge_variable_sources(vars: &mut IndexMap<String, Value>, options: &CompileOptions) {
    for (key, value) in &options.env {
        if let Some(name) = key.strip_prefix(ENV_VAR_PREFIX) {
            if !name.is_empty() {
                apply_override(vars, name, value);
            }
        }
    }
    for (path, value) in &options.overrides {
        apply_override(vars, path, value);
    }
}

/// Writes a dotted-path override into the nested `vars` structure, creating
/// intermediate objects as needed.
fn apply_override(vars: &mut IndexMap<String, Value>, path: &str, value: &str) {
    let mut segments = path.split('.');
    let Some(first) = segments.next() else {
        return;
    };
    let rest: Vec<&str> = segments.collect();
    if rest.is_empty() {
        vars.insert(first.to_string(), Value::String(value.to_string()));
        return;
    }
    let mut current = vars
        .entry(first.to_string())
        .or_insert_with(|| Value::Object(serde_json::Map::new()));
    for (i, segment) in rest.iter().enumerate() {
        if !current.is_object() {
            *current = Value::Object(serde_json::Map::new());
        }
        let Some(map) = current.as_object_mut() else {
            return;
        };
        if i == rest.len() - 1 {
            map.insert(segment.to_string(), Value::String(value.to_string()));
            return;
        }
        current = map
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(serde_json::Map::new()));
    }
}

// ============================================================================
// Structural validation
// ============================================================================

/// Validates the suite shape, collecting every violation. Messages are
/// prefixed with a structural path such as `tests[0].steps[2].retry`.
pub fn validate(suite: &Suite, registry: &PluginRegistry) -> Vec<String> {
    let mut violations = Vec::new();

    if suite.name.trim().is_empty() {
        violations.push("name: suite name must be non-empty".to_string());
    }
    if suite.tests.is_empty() {
        violations.push("tests: at least one test is required".to_string());
    }

    validate_steps(&suite.init, "init", registry, &mut violations);
    if let Some(cleanup) = &suite.cleanup {
        validate_cleanup(cleanup, "cleanup", registry, &mut violations);
    }

    let mut seen = HashSet::new();
    for (i, test) in suite.tests.iter().enumerate() {
        let path = format!("tests[{i}]");
        if test.name.trim().is_empty() {
            violations.push(format!("{path}.name: test name must be non-empty"));
        } else if !seen.insert(test.name.as_str()) {
            violations.push(format!(
                "{path}.name: duplicate test name '{}'",
                test.name
            ));
        }
        if test.steps.is_empty() {
            violations.push(format!("{path}.steps: at least one step is required"));
        }
        validate_steps(&test.init, &format!("{path}.init"), registry, &mut violations);
        validate_steps(
            &test.steps,
            &format!("{path}.steps"),
            registry,
            &mut violations,
        );
        if let Some(cleanup) = &test.cleanup {
            validate_cleanup(cleanup, &format!("{path}.cleanup"), registry, &mut violations);
        }
    }

    violations
}

fn validate_cleanup(
    cleanup: &CleanupHooks,
    path: &str,
    registry: &PluginRegistry,
    violations: &mut Vec<String>,
) {
    validate_steps(
        &cleanup.always,
        &format!("{path}.always"),
        registry,
        violations,
    );
    validate_steps(
        &cleanup.on_failure,
        &format!("{path}.on_failure"),
        registry,
        violations,
    );
}

fn validate_steps(
    steps: &[Step],
    path: &str,
    registry: &PluginRegistry,
    violations: &mut Vec<String>,
) {
    for (i, step) in steps.iter().enumerate() {
        validate_step(step, &format!("{path}[{i}]"), registry, violations);
    }
}

fn validate_step(
    step: &Step,
    path: &str,
    registry: &PluginRegistry,
    violations: &mut Vec<String>,
) {
    if step.name.trim().is_empty() {
        violations.push(format!("{path}.name: step name must be non-empty"));
    }
    if step.plugin.trim().is_empty() {
        violations.push(format!("{path}.plugin: plugin kind must be non-empty"));
    } else if !registry.contains(&step.plugin) {
        violations.push(format!(
            "{path}.plugin: unknown plugin '{}' (registered: {})",
            step.plugin,
            registry.kinds().join(", ")
        ));
    }

    for (i, assertion) in step.assertions.iter().enumerate() {
        validate_assertion(assertion, &format!("{path}.assertions[{i}]"), violations);
    }
    for (i, save) in step.save.iter().enumerate() {
        validate_save(save, &format!("{path}.save[{i}]"), violations);
    }
    if let Some(retry) = &step.retry {
        validate_retry(retry, &format!("{path}.retry"), violations);
    }
}

fn validate_assertion(assertion: &Assertion, path: &str, violations: &mut Vec<String>) {
    if assertion.kind.trim().is_empty() {
        violations.push(format!("{path}: assertion 'type' is required"));
        return;
    }
    match assertion.kind.as_str() {
        "status_code" => {
            if !assertion.expected.is_number() {
                violations.push(format!("{path}: status_code expects a numeric 'expected'"));
            }
        }
        "json_path" => {
            if assertion.path.as_deref().unwrap_or("").trim().is_empty() {
                violations.push(format!("{path}: json_path requires a 'path'"));
            }
        }
        "header" => {
            if assertion.name.as_deref().unwrap_or("").trim().is_empty() {
                violations.push(format!("{path}: header requires a 'name'"));
            }
        }
        "json_schema" => {
            if !assertion.expected.is_object() {
                violations.push(format!(
                    "{path}: json_schema expects a schema object in 'expected'"
                ));
            }
        }
        other => violations.push(format!(
            "{path}: unknown assertion type '{other}' (supported: {})",
            CORE_ASSERTION_KINDS.join(", ")
        )),
    }
}

fn validate_save(save: &SaveRule, path: &str, violations: &mut Vec<String>) {
    let sources = usize::from(save.json_path.is_some()) + usize::from(save.header.is_some());
    if sources != 1 {
        violations.push(format!(
            "{path}: exactly one of 'json_path' or 'header' is required"
        ));
    }
    if save.target.trim().is_empty() {
        violations.push(format!("{path}: 'as' target name must be non-empty"));
    }
}

fn validate_retry(retry: &RetryPolicy, path: &str, violations: &mut Vec<String>) {
    if retry.maximum_attempts < 1 {
        violations.push(format!("{path}.maximum_attempts: must be >= 1"));
    }
    if retry.backoff_coefficient < 1.0 {
        violations.push(format!("{path}.backoff_coefficient: must be >= 1.0"));
    }
    if let Some(max) = retry.maximum_interval {
        if retry.initial_interval > max {
            violations.push(format!(
                "{path}: initial_interval must not exceed maximum_interval"
            ));
        }
    }
}

// ============================================================================
// Config-phase substitution
// ============================================================================

/// Substitutes `.vars.*` references in every string leaf of the suite,
/// using the already-merged variable set. Runtime and env expressions (and
/// `\{{` escapes) pass through untouched.
fn resolve_config_phase(suite: &mut Suite) -> Result<(), EngineError> {
    let vars = suite.vars.clone();
    let resolver = ConfigResolver::new(&vars);

    suite.name = resolver.render_str(&suite.name)?;
    if let Some(description) = &suite.description {
        suite.description = Some(resolver.render_str(description)?);
    }

    for step in &mut suite.init {
        resolve_step(step, &resolver)?;
    }
    if let Some(cleanup) = &mut suite.cleanup {
        resolve_cleanup(cleanup, &resolver)?;
    }
    for test in &mut suite.tests {
        test.name = resolver.render_str(&test.name)?;
        for step in &mut test.init {
            resolve_step(step, &resolver)?;
        }
        for step in &mut test.steps {
            resolve_step(step, &resolver)?;
        }
        if let Some(cleanup) = &mut test.cleanup {
            resolve_cleanup(cleanup, &resolver)?;
        }
    }
    Ok(())
}

fn resolve_cleanup(cleanup: &mut CleanupHooks, resolver: &ConfigResolver) -> Result<(), EngineError> {
    for step in &mut cleanup.always {
        resolve_step(step, resolver)?;
    }
    for step in &mut cleanup.on_failure {
        resolve_step(step, resolver)?;
    }
    Ok(())
}

fn resolve_step(step: &mut Step, resolver: &ConfigResolver) -> Result<(), EngineError> {
    step.name = resolver.render_str(&step.name)?;
    step.config = resolver.render_value(&step.config)?;
    for assertion in &mut step.assertions {
        if let Some(path) = &assertion.path {
            assertion.path = Some(resolver.render_str(path)?);
        }
        if let Some(name) = &assertion.name {
            assertion.name = Some(resolver.render_str(name)?);
        }
        assertion.expected = resolver.render_value(&assertion.expected)?;
    }
    for save in &mut step.save {
        if let Some(json_path) = &save.json_path {
            save.json_path = Some(resolver.render_str(json_path)?);
        }
        if let Some(header) = &save.header {
            save.header = Some(resolver.render_str(header)?);
        }
    }
    Ok(())
}

// ============================================================================
// Plugin config validation
// ============================================================================

/// Runs each step's raw config through its plugin's Parse operation,
/// collecting violations with structural paths.
fn validate_plugin_configs(suite: &Suite, registry: &PluginRegistry) -> Vec<String> {
    let mut violations = Vec::new();
    for (path, step) in collect_steps(suite) {
        if let Err(detail) = registry.validate_config(&step.plugin, &step.config) {
            violations.push(format!("{path}.config: {detail}"));
        }
    }
    violations
}

/// Flattens every step in the suite (hooks included) with its structural
/// path, in execution order.
pub fn collect_steps(suite: &Suite) -> Vec<(String, &Step)> {
    let mut out = Vec::new();
    for (i, step) in suite.init.iter().enumerate() {
        out.push((format!("init[{i}]"), step));
    }
    for (t, test) in suite.tests.iter().enumerate() {
        for (i, step) in test.init.iter().enumerate() {
            out.push((format!("tests[{t}].init[{i}]"), step));
        }
        for (i, step) in test.steps.iter().enumerate() {
            out.push((format!("tests[{t}].steps[{i}]"), step));
        }
        if let Some(cleanup) = &test.cleanup {
            for (i, step) in cleanup.on_failure.iter().enumerate() {
                out.push((format!("tests[{t}].cleanup.on_failure[{i}]"), step));
            }
            for (i, step) in cleanup.always.iter().enumerate() {
                out.push((format!("tests[{t}].cleanup.always[{i}]"), step));
            }
        }
    }
    if let Some(cleanup) = &suite.cleanup {
        for (i, step) in cleanup.on_failure.iter().enumerate() {
            out.push((format!("cleanup.on_failure[{i}]"), step));
        }
        for (i, step) in cleanup.always.iter().enumerate() {
            out.push((format!("cleanup.always[{i}]"), step));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugins::default_registry;
    use serde_json::json;

    fn options() -> CompileOptions {
        CompileOptions::default()
    }

    const MINIMAL: &str = r#"
name: smoke
tests:
  - name: ping
    steps:
      - name: wait a beat
        plugin: delay
        config:
          duration: 10ms
"#;

    #[test]
    fn test_compile_minimal_suite() {
        let registry = default_registry();
        let suite = compile(MINIMAL, &options(), &registry).expect("suite should compile");
        assert_eq!(suite.name, "smoke");
        assert_eq!(suite.tests.len(), 1);
        assert_eq!(suite.tests[0].steps[0].plugin, "delay");
    }

    #[test]
    fn test_empty_tests_fails_validation() {
        let registry = default_registry();
        let err = compile("name: empty\ntests: []\n", &options(), &registry).unwrap_err();
        match err {
            EngineError::Validation { violations } => {
                assert!(
                    violations.iter().any(|v| v.contains("at least one test")),
                    "violations: {violations:?}"
                );
            }
            other => panic!("expected validation error, got {other:?}"),
        }
    }

    #[test]
    fn test_violations_are_collected_not_short_circuited() {
        let registry = default_registry();
        let yaml = r#"
name: ""
tests:
  - name: t
    steps:
      - name: ""
        plugin: nope
      - name: bad retry
        plugin: delay
        config: {duration: 1ms}
        retry:
          maximum_attempts: 0
          backoff_coefficient: 0.5
"#;
        let err = compile(yaml, &options(), &registry).unwrap_err();
        let EngineError::Validation { violations } = err else {
            panic!("expected validation error");
        };
        assert!(violations.iter().any(|v| v.contains("suite name")));
        assert!(violations.iter().any(|v| v.contains("step name")));
        assert!(violations.iter().any(|v| v.contains("unknown plugin 'nope'")));
        assert!(violations.iter().any(|v| v.contains("maximum_attempts")));
        assert!(violations
            .iter()
            .any(|v| v.contains("backoff_coefficient")));
    }

    #[test]
    fn test_config_substitution_reaches_nested_config() {
        let registry = default_registry();
        let yaml = r#"
name: vars
vars:
  base_url: http://a
tests:
  - name: t
    steps:
      - name: log it
        plugin: log
        config:
          message: "calling {{ .vars.base_url }}/x"
"#;
        let suite = compile(yaml, &options(), &registry).unwrap();
        assert_eq!(
            suite.tests[0].steps[0].config,
            json!({"message": "calling http://a/x"})
        );
    }

    #[test]
    fn test_operator_override_beats_inline_vars() {
        let registry = default_registry();
        let yaml = r#"
name: vars
vars:
  base_url: http://a
tests:
  - name: t
    steps:
      - name: log it
        plugin: log
        config:
          message: "{{ .vars.base_url }}/x"
"#;
        let mut opts = options();
        opts.overrides = vec![("base_url".to_string(), "http://b".to_string())];
        let suite = compile(yaml, &opts, &registry).unwrap();
        assert_eq!(
            suite.tests[0].steps[0].config,
            json!({"message": "http://b/x"})
        );
    }

    #[test]
    fn test_env_prefixed_override_sits_between_inline_and_operator() {
        let registry = default_registry();
        let yaml = r#"
name: vars
vars:
  who: inline
tests:
  - name: t
    steps:
      - name: log it
        plugin: log
        config: {message: "{{ .vars.who }}"}
"#;
        let mut opts = options();
        opts.env.insert(
            format!("{ENV_VAR_PREFIX}who"),
            "from-env".to_string(),
        );
        let suite = compile(yaml, &opts, &registry).unwrap();
        assert_eq!(
            suite.tests[0].steps[0].config,
            json!({"message": "from-env"})
        );

        opts.overrides = vec![("who".to_string(), "operator".to_string())];
        let suite = compile(yaml, &opts, &registry).unwrap();
        assert_eq!(
            suite.tests[0].steps[0].config,
            json!({"message": "operator"})
        );
    }

    #[test]
    fn test_unresolved_config_variable_blocks_compilation() {
        let registry = default_registry();
        let yaml = r#"
name: vars
tests:
  - name: t
    steps:
      - name: log it
        plugin: log
        config: {message: "{{ .vars.ghost }}"}
"#;
        let err = compile(yaml, &options(), &registry).unwrap_err();
        assert!(matches!(err, EngineError::UnresolvedVariable { .. }));
    }

    #[test]
    fn test_runtime_expressions_survive_compilation() {
        let registry = default_registry();
        let yaml = r#"
name: vars
tests:
  - name: t
    steps:
      - name: log it
        plugin: log
        config: {message: "{{ user_id }} via {{ .env.HOME }}"}
"#;
        let suite = compile(yaml, &options(), &registry).unwrap();
        assert_eq!(
            suite.tests[0].steps[0].config,
            json!({"message": "{{ user_id }} via {{ .env.HOME }}"})
        );
    }

    #[test]
    fn test_retry_durations_parse_from_humantime_strings() {
        let registry = default_registry();
        let yaml = r#"
name: retry
tests:
  - name: t
    steps:
      - name: flaky
        plugin: delay
        config: {duration: 1ms}
        retry:
          initial_interval: 10ms
          maximum_interval: 2s
          maximum_attempts: 3
          backoff_coefficient: 2.0
          non_retryable_errors: [assertion_failed]
"#;
        let suite = compile(yaml, &options(), &registry).unwrap();
        let retry = suite.tests[0].steps[0].retry.as_ref().unwrap();
        assert_eq!(retry.initial_interval, Duration::from_millis(10));
        assert_eq!(retry.maximum_interval, Some(Duration::from_secs(2)));
        assert_eq!(retry.maximum_attempts, 3);
        assert_eq!(retry.non_retryable_errors, vec!["assertion_failed"]);
    }

    #[test]
    fn test_duplicate_test_names_rejected() {
        let registry = default_registry();
        let yaml = r#"
name: dupes
tests:
  - name: same
    steps: [{name: a, plugin: log, config: {message: hi}}]
  - name: same
    steps: [{name: b, plugin: log, config: {message: hi}}]
"#;
        let err = compile(yaml, &options(), &registry).unwrap_err();
        let EngineError::Validation { violations } = err else {
            panic!("expected validation error");
        };
        assert!(violations.iter().any(|v| v.contains("duplicate test name")));
    }

    #[test]
    fn test_yaml_syntax_error_carries_location() {
        let registry = default_registry();
        let err = compile("name: [unclosed", &options(), &registry).unwrap_err();
        let EngineError::Validation { violations } = err else {
            panic!("expected validation error");
        };
        assert!(violations[0].contains("yaml parse error"));
    }

    #[test]
    fn test_round_trip_preserves_semantics() {
        let registry = default_registry();
        let suite = compile(MINIMAL, &options(), &registry).unwrap();
        let reserialized = serde_yaml::to_string(&suite).unwrap();
        let again = compile(&reserialized, &options(), &registry).unwrap();
        assert_eq!(suite.name, again.name);
        assert_eq!(suite.tests.len(), again.tests.len());
        assert_eq!(
            suite.tests[0].steps[0].config,
            again.tests[0].steps[0].config
        );
    }
}
