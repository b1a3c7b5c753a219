//! Save-rule extraction.
//!
//! After a step's assertions pass, its save rules pull values out of the
//! structured response. The extracted pairs are handed back to the test
//! workflow, which writes them into the state map before the next step
//! starts. A rule marked `required` that yields nothing fails the step.

use serde_json::Value;

use crate::assertions::normalize_pointer;
use crate::dsl::SaveRule;
use crate::errors::EngineError;
use crate::plugins::StepResponse;

/// Record of one applied save rule, carried in step records for diagnostics.
#[derive(Debug, Clone, serde::Serialize)]
pub struct SaveOutcome {
    /// Target variable name (`as`).
    pub target: String,
    /// Source description, e.g. `json_path .id` or `header x-request-id`.
    pub source: String,
    /// Extracted value; `None` when the source was absent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    /// Why extraction yielded nothing, when it did.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Applies every save rule against the response, in order.
///
/// Returns the outcome records and the `(name, value)` pairs to write into
/// the state map. The first `required` rule that yields nothing aborts with
/// [`EngineError::SaveFailed`]; optional misses are recorded and skipped.
pub fn extract(
    rules: &[SaveRule],
    response: &StepResponse,
) -> Result<(Vec<SaveOutcome>, Vec<(String, Value)>), EngineError> {
    let mut outcomes = Vec::with_capacity(rules.len());
    let mut writes = Vec::new();

    for rule in rules {
        let (source, found) = resolve_source(rule, response);
        match found {
            Some(value) => {
                writes.push((rule.target.clone(), value.clone()));
                outcomes.push(SaveOutcome {
                    target: rule.target.clone(),
                    source,
                    value: Some(value),
                    error: None,
                });
            }
            None => {
                let detail = format!("{source} not present in response");
                if rule.required {
                    return Err(EngineError::SaveFailed {
                        name: rule.target.clone(),
                        detail,
                    });
                }
                outcomes.push(SaveOutcome {
                    target: rule.target.clone(),
                    source,
                    value: None,
                    error: Some(detail),
                });
            }
        }
    }

    Ok((outcomes, writes))
}

/// Resolves one rule's source against the response. `null` found at a
/// json_path counts as present (the path exists, its value is null).
fn resolve_source(rule: &SaveRule, response: &StepResponse) -> (String, Option<Value>) {
    if let Some(path) = &rule.json_path {
        let found = response.body.pointer(&normalize_pointer(path)).cloned();
        return (format!("json_path {path}"), found);
    }
    if let Some(name) = &rule.header {
        let found = response.header(name).map(|v| Value::String(v.to_string()));
        return (format!("header {name}"), found);
    }
    // Validation enforces exactly one source; this arm is unreachable for
    // compiled suites.
    ("<no source>".to_string(), None)
}
