//! Engine error taxonomy.
//!
//! Every failure that can surface from compiling or executing a suite is a
//! variant here. Each variant carries a stable kind string (`kind()`) that
//! step retry policies match against in `non_retryable_errors`, and a default
//! retryable classification (`retryable()`) that drives the backoff loop.

use thiserror::Error;

/// Failures raised by the engine, the template layer, or plugin activities.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Malformed YAML, schema violation, unknown plugin, or an invalid retry
    /// policy. Surfaced at run-creation time; no run is started.
    #[error("suite validation failed:\n{}", .violations.join("\n"))]
    Validation {
        /// One message per violation, each prefixed with its structural path.
        violations: Vec<String>,
    },

    /// A template expression referenced a variable that could not be
    /// resolved. Config-phase occurrences block run creation; runtime-phase
    /// occurrences fail the step.
    #[error("unresolved variable '{name}' ({detail})")]
    UnresolvedVariable {
        /// The expression text as written, e.g. `.vars.base_url` or `user_id`.
        name: String,
        /// What was searched and not found.
        detail: String,
    },

    /// A template string could not be parsed at all.
    #[error("template parse error at byte {offset}: {detail}")]
    TemplateParse {
        /// Byte offset of the offending delimiter in the input string.
        offset: usize,
        detail: String,
    },

    /// One or more assertions did not match the step response.
    #[error("{} assertion(s) failed: {}", .failures.len(), .failures.join("; "))]
    AssertionFailed { failures: Vec<String> },

    /// I/O or protocol-level failure inside a plugin Execute body.
    #[error("plugin transport error: {detail}")]
    PluginTransport { detail: String },

    /// The plugin judged the result invalid (e.g. empty response where one
    /// was required). The plugin decides whether another attempt can help.
    #[error("plugin error: {detail}")]
    PluginLogic { detail: String, retryable: bool },

    /// A save rule marked `required` yielded no value.
    #[error("required save '{name}' produced no value: {detail}")]
    SaveFailed { name: String, detail: String },

    /// The run was cancelled while this work was in flight.
    #[error("run cancelled")]
    Cancelled,

    /// The run exceeded its overall deadline.
    #[error("run deadline exceeded")]
    TimedOut,

    /// Runtime bug or substrate failure. Never retried.
    #[error("internal error: {detail}")]
    Internal { detail: String },
}

impl EngineError {
    /// Stable kind string, matched against a retry policy's
    /// `non_retryable_errors` entries.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation { .. } => "validation",
            Self::UnresolvedVariable { .. } => "unresolved_variable",
            Self::TemplateParse { .. } => "template_parse",
            Self::AssertionFailed { .. } => "assertion_failed",
            Self::PluginTransport { .. } => "plugin_transport",
            Self::PluginLogic { .. } => "plugin_logic",
            Self::SaveFailed { .. } => "save_failed",
            Self::Cancelled => "cancelled",
            Self::TimedOut => "timed_out",
            Self::Internal { .. } => "internal",
        }
    }

    /// Whether another attempt can plausibly succeed.
    ///
    /// Transport failures are retryable; everything deterministic
    /// (validation, template resolution against a frozen snapshot, failed
    /// assertions) is not. Plugin logic errors carry their own verdict.
    pub fn retryable(&self) -> bool {
        match self {
            Self::PluginTransport { .. } => true,
            Self::PluginLogic { retryable, .. } => *retryable,
            _ => false,
        }
    }

    /// Shorthand for a transport-class error from any displayable cause.
    pub fn transport(detail: impl std::fmt::Display) -> Self {
        Self::PluginTransport {
            detail: detail.to_string(),
        }
    }

    /// Shorthand for an internal error from any displayable cause.
    pub fn internal(detail: impl std::fmt::Display) -> Self {
        Self::Internal {
            detail: detail.to_string(),
        }
    }
}

impl From<reqwest::Error> for EngineError {
    fn from(err: reqwest::Error) -> Self {
        Self::PluginTransport {
            detail: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_strings_are_stable() {
        assert_eq!(EngineError::Cancelled.kind(), "cancelled");
        assert_eq!(EngineError::TimedOut.kind(), "timed_out");
        assert_eq!(
            EngineError::PluginTransport {
                detail: "connection refused".into()
            }
            .kind(),
            "plugin_transport"
        );
    }

    #[test]
    fn test_transport_is_retryable() {
        let err = EngineError::transport("connection reset by peer");
        assert!(err.retryable());
    }

    #[test]
    fn test_assertion_failure_is_not_retryable() {
        let err = EngineError::AssertionFailed {
            failures: vec!["status_code expected 200 got 404".into()],
        };
        assert!(!err.retryable());
        assert_eq!(err.kind(), "assertion_failed");
    }

    #[test]
    fn test_plugin_logic_carries_its_own_verdict() {
        let yes = EngineError::PluginLogic {
            detail: "empty body".into(),
            retryable: true,
        };
        let no = EngineError::PluginLogic {
            detail: "schema mismatch".into(),
            retryable: false,
        };
        assert!(yes.retryable());
        assert!(!no.retryable());
    }
}
