//! Template engine.
//!
//! Resolves `{{ ... }}` expressions in two phases. The config phase runs in
//! the DSL compiler and substitutes only `.vars.*` references; everything
//! else (including escapes) passes through untouched. The runtime phase runs
//! at each activity boundary and substitutes `.env.*` references, the
//! built-in `run.id`, and bare runtime identifiers resolved against the
//! frozen state snapshot.
//!
//! `\{{` is the literal escape: it emits `{{`, and the text through the
//! matching `}}` is copied verbatim with no substitution. The escape is
//! consumed by the runtime phase (the last phase a string passes through) so
//! that the delivered text contains the unescaped literal.
//!
//! This module is the single interpolation authority: plugins receive
//! already-substituted configs and must not re-implement any of this.

use std::collections::HashMap;

use indexmap::IndexMap;
use serde_json::{Map, Value};

use crate::errors::EngineError;
use crate::state::StateSnapshot;

/// What the runtime phase does with a reference it cannot resolve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MissingPolicy {
    /// Fail the render (and therefore the step). The default.
    #[default]
    Fail,
    /// Leave the expression text in place, unsubstituted.
    Leave,
}

// ============================================================================
// Config phase
// ============================================================================

/// Resolver for the config phase: substitutes `.vars.*` only.
pub struct ConfigResolver<'a> {
    vars: &'a IndexMap<String, Value>,
}

impl<'a> ConfigResolver<'a> {
    /// Builds a resolver over the suite's merged config variables
    /// (inline `vars` with overrides already applied).
    pub fn new(vars: &'a IndexMap<String, Value>) -> Self {
        Self { vars }
    }

    /// Substitutes `.vars.*` references in a single string. Escapes and
    /// non-config expressions are preserved verbatim for the runtime phase.
    pub fn render_str(&self, input: &str) -> Result<String, EngineError> {
        render(input, false, |expr| {
            let Some(path) = expr.strip_prefix(".vars.") else {
                // Env and runtime references survive to the runtime phase.
                return Ok(Resolution::Preserve);
            };
            let segments: Vec<&str> = path.split('.').collect();
            match lookup_vars(self.vars, &segments) {
                Some(value) => Ok(Resolution::Value(stringify(value))),
                None => Err(EngineError::UnresolvedVariable {
                    name: expr.to_string(),
                    detail: format!("no config variable at path '{path}'"),
                }),
            }
        })
    }

    /// Walks a JSON tree and substitutes every string leaf, preserving the
    /// tree's shape.
    pub fn render_value(&self, value: &Value) -> Result<Value, EngineError> {
        render_tree(value, &|s| self.render_str(s))
    }
}

/// Navigates the `vars` mapping by dotted path.
fn lookup_vars<'v>(vars: &'v IndexMap<String, Value>, segments: &[&str]) -> Option<&'v Value> {
    let (first, rest) = segments.split_first()?;
    let mut current = vars.get(*first)?;
    for segment in rest {
        current = match current {
            Value::Object(map) => map.get(*segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

// ============================================================================
// Runtime phase
// ============================================================================

/// Resolver for the runtime phase: substitutes `.env.*`, `run.id`, and state
/// map references, and consumes the `\{{` escape.
pub struct RuntimeResolver<'a> {
    state: &'a StateSnapshot,
    env: &'a HashMap<String, String>,
    run_id: &'a str,
    missing: MissingPolicy,
}

impl<'a> RuntimeResolver<'a> {
    /// Builds a resolver over a frozen state snapshot and an injected
    /// environment.
    pub fn new(state: &'a StateSnapshot, env: &'a HashMap<String, String>, run_id: &'a str) -> Self {
        Self {
            state,
            env,
            run_id,
            missing: MissingPolicy::Fail,
        }
    }

    /// Overrides the unresolved-reference behavior (plugins may opt into
    /// leniency; the default is hard failure).
    pub fn with_missing_policy(mut self, missing: MissingPolicy) -> Self {
        self.missing = missing;
        self
    }

    /// Substitutes runtime references in a single string and unescapes
    /// `\{{ ... }}` occurrences.
    pub fn render_str(&self, input: &str) -> Result<String, EngineError> {
        render(input, true, |expr| {
            if let Some(name) = expr.strip_prefix(".env.") {
                return match self.env.get(name) {
                    Some(value) => Ok(Resolution::Value(value.clone())),
                    None => self.unresolved(expr, format!("environment variable '{name}' not set")),
                };
            }
            if expr.starts_with(".vars.") {
                // Config references must have been resolved (or rejected)
                // before the suite reached the runtime.
                return self.unresolved(expr, "config variable unresolved at runtime".to_string());
            }
            if expr == "run.id" {
                return Ok(Resolution::Value(self.run_id.to_string()));
            }
            let segments: Vec<&str> = expr.split('.').collect();
            match self.state.lookup_path(&segments) {
                Some(value) => Ok(Resolution::Value(stringify(value))),
                None => self.unresolved(
                    expr,
                    format!("no runtime variable at path '{expr}' in the state map"),
                ),
            }
        })
    }

    /// Walks a JSON tree and substitutes every string leaf, preserving the
    /// tree's shape.
    pub fn render_value(&self, value: &Value) -> Result<Value, EngineError> {
        render_tree(value, &|s| self.render_str(s))
    }

    fn unresolved(&self, expr: &str, detail: String) -> Result<Resolution, EngineError> {
        match self.missing {
            MissingPolicy::Fail => Err(EngineError::UnresolvedVariable {
                name: expr.to_string(),
                detail,
            }),
            MissingPolicy::Leave => Ok(Resolution::Preserve),
        }
    }
}

// ============================================================================
// Shared scanner
// ============================================================================

/// Outcome of resolving one expression.
enum Resolution {
    /// Replace the `{{ ... }}` span with this text.
    Value(String),
    /// Copy the original `{{ ... }}` span through unchanged.
    Preserve,
}

/// Renders a JSON-compatible value into its interpolated string form.
///
/// Strings interpolate as-is; everything else uses its compact JSON encoding.
/// No JSON escaping is applied to the result.
fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Scans `input` for `{{ ... }}` spans and `\{{` escapes.
///
/// `unescape` selects escape handling: the runtime phase (true) emits the
/// escaped span without the backslash; the config phase (false) copies it
/// verbatim, backslash included, so the escape survives to the runtime
/// phase. Unclosed delimiters are parse errors carrying the byte offset of
/// the opening `{{`.
fn render<F>(input: &str, unescape: bool, mut resolve: F) -> Result<String, EngineError>
where
    F: FnMut(&str) -> Result<Resolution, EngineError>,
{
    let bytes = input.as_bytes();
    let mut out = String::with_capacity(input.len());
    let mut i = 0;

    while i < bytes.len() {
        if bytes[i..].starts_with(b"\\{{") {
            let open = i;
            let close = find_close(bytes, open + 3).ok_or_else(|| EngineError::TemplateParse {
                offset: open + 1,
                detail: "escaped '{{' has no matching '}}'".to_string(),
            })?;
            if !unescape {
                out.push('\\');
            }
            // Emit the delimiters and inner text untouched.
            out.push_str(&input[open + 1..close + 2]);
            i = close + 2;
            continue;
        }
        if bytes[i..].starts_with(b"{{") {
            let open = i;
            let close = find_close(bytes, open + 2).ok_or_else(|| EngineError::TemplateParse {
                offset: open,
                detail: "'{{' has no matching '}}'".to_string(),
            })?;
            let expr = input[open + 2..close].trim();
            if expr.is_empty() {
                return Err(EngineError::TemplateParse {
                    offset: open,
                    detail: "empty template expression".to_string(),
                });
            }
            match resolve(expr)? {
                Resolution::Value(text) => out.push_str(&text),
                Resolution::Preserve => out.push_str(&input[open..close + 2]),
            }
            i = close + 2;
            continue;
        }
        // Plain text: advance one UTF-8 character.
        let ch_len = utf8_len(bytes[i]);
        out.push_str(&input[i..i + ch_len]);
        i += ch_len;
    }

    Ok(out)
}

/// Finds the byte index of the next `}}` at or after `from`.
fn find_close(bytes: &[u8], from: usize) -> Option<usize> {
    let mut i = from;
    while i + 1 < bytes.len() {
        if bytes[i] == b'}' && bytes[i + 1] == b'}' {
            return Some(i);
        }
        i += 1;
    }
    None
}

/// Length in bytes of the UTF-8 character starting with `first`.
fn utf8_len(first: u8) -> usize {
    match first {
        b if b < 0x80 => 1,
        b if b >= 0xF0 => 4,
        b if b >= 0xE0 => 3,
        _ => 2,
    }
}

/// Structure-preserving walk substituting every string leaf.
fn render_tree<F>(value: &Value, render_str: &F) -> Result<Value, EngineError>
where
    F: Fn(&str) -> Result<String, EngineError>,
{
    match value {
        Value::String(s) => Ok(Value::String(render_str(s)?)),
        Value::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(render_tree(item, render_str)?);
            }
            Ok(Value::Array(out))
        }
        Value::Object(map) => {
            let mut out = Map::with_capacity(map.len());
            for (k, v) in map {
                out.insert(k.clone(), render_tree(v, render_str)?);
            }
            Ok(Value::Object(out))
        }
        other => Ok(other.clone()),
    }
}
