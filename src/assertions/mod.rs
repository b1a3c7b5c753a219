//! Assertion evaluation.
//!
//! Runs after a plugin Execute returns, against the structured response.
//! Every assertion is evaluated in source order with no short-circuit, so a
//! failing step reports all of its mismatches at once. A `json_path` that
//! does not exist in the body yields `actual: null` and a failed record
//! rather than a distinct error.

use regex::Regex;
use serde_json::{json, Value};

use crate::dsl::Assertion;
use crate::plugins::StepResponse;

/// Record of one evaluated assertion.
#[derive(Debug, Clone, serde::Serialize)]
pub struct AssertionOutcome {
    /// Assertion kind as written in the suite.
    pub kind: String,
    /// Expected value (the schema itself for `json_schema`).
    pub expected: Value,
    /// Observed value; `null` when the source was absent.
    pub actual: Value,
    pub passed: bool,
    /// Human-readable explanation, filled for failures.
    pub message: String,
}

impl AssertionOutcome {
    fn pass(kind: &str, expected: Value, actual: Value) -> Self {
        Self {
            kind: kind.to_string(),
            expected,
            actual,
            passed: true,
            message: String::new(),
        }
    }

    fn fail(kind: &str, expected: Value, actual: Value, message: String) -> Self {
        Self {
            kind: kind.to_string(),
            expected,
            actual,
            passed: false,
            message,
        }
    }
}

/// Evaluates every assertion against the response, in order.
pub fn evaluate(assertions: &[Assertion], response: &StepResponse) -> Vec<AssertionOutcome> {
    assertions
        .iter()
        .map(|assertion| evaluate_one(assertion, response))
        .collect()
}

/// Messages of the failed outcomes, for error construction.
pub fn failures(outcomes: &[AssertionOutcome]) -> Vec<String> {
    outcomes
        .iter()
        .filter(|o| !o.passed)
        .map(|o| o.message.clone())
        .collect()
}

fn evaluate_one(assertion: &Assertion, response: &StepResponse) -> AssertionOutcome {
    match assertion.kind.as_str() {
        "status_code" => status_code(assertion, response),
        "json_path" => json_path(assertion, response),
        "header" => header(assertion, response),
        "json_schema" => json_schema(assertion, response),
        other => AssertionOutcome::fail(
            other,
            assertion.expected.clone(),
            Value::Null,
            format!("unsupported assertion type '{other}'"),
        ),
    }
}

// ============================================================================
// Kinds
// ============================================================================

fn status_code(assertion: &Assertion, response: &StepResponse) -> AssertionOutcome {
    let expected = assertion.expected.clone();
    let actual = match response.status {
        Some(code) => json!(code),
        None => Value::Null,
    };
    let operator = assertion.operator.as_deref().unwrap_or("eq");
    let passed = match (actual.as_u64(), expected.as_u64()) {
        (Some(a), Some(e)) => compare_ordered(operator, a as f64, e as f64, &actual, &expected),
        _ => false,
    };
    if passed {
        AssertionOutcome::pass("status_code", expected, actual)
    } else {
        let message = format!(
            "status_code: expected {operator} {expected}, got {actual}"
        );
        AssertionOutcome::fail("status_code", expected, actual, message)
    }
}

fn json_path(assertion: &Assertion, response: &StepResponse) -> AssertionOutcome {
    let path = assertion.path.as_deref().unwrap_or("");
    let operator = assertion.operator.as_deref().unwrap_or("eq");
    let expected = assertion.expected.clone();
    let found = response.body.pointer(&normalize_pointer(path));

    let actual = found.cloned().unwrap_or(Value::Null);
    let passed = match operator {
        "exists" => found.is_some(),
        "not_exists" => found.is_none(),
        _ => match found {
            None => false,
            Some(actual) => compare_values(operator, actual, &expected),
        },
    };

    if passed {
        AssertionOutcome::pass("json_path", expected, actual)
    } else {
        let message = format!(
            "json_path '{path}': expected {operator} {expected}, got {actual}"
        );
        AssertionOutcome::fail("json_path", expected, actual, message)
    }
}

fn header(assertion: &Assertion, response: &StepResponse) -> AssertionOutcome {
    let name = assertion.name.as_deref().unwrap_or("");
    let operator = assertion.operator.as_deref().unwrap_or("eq");
    let expected = assertion.expected.clone();
    let found = response.header(name);
    let actual = found.map(|v| json!(v)).unwrap_or(Value::Null);

    let passed = match operator {
        "exists" => found.is_some(),
        "not_exists" => found.is_none(),
        "eq" => found.is_some() && actual == expected,
        "neq" => found.is_some() && actual != expected,
        "contains" => match (found, expected.as_str()) {
            (Some(value), Some(needle)) => value.contains(needle),
            _ => false,
        },
        _ => false,
    };

    if passed {
        AssertionOutcome::pass("header", expected, actual)
    } else {
        let message = format!(
            "header '{name}': expected {operator} {expected}, got {actual}"
        );
        AssertionOutcome::fail("header", expected, actual, message)
    }
}

fn json_schema(assertion: &Assertion, response: &StepResponse) -> AssertionOutcome {
    let operator = assertion.operator.as_deref().unwrap_or("conforms");
    let expected = assertion.expected.clone();

    let target = match &assertion.path {
        Some(path) => match response.body.pointer(&normalize_pointer(path)) {
            Some(value) => value.clone(),
            None => {
                return AssertionOutcome::fail(
                    "json_schema",
                    expected,
                    Value::Null,
                    format!("json_schema: path '{path}' not found in response body"),
                );
            }
        },
        None => response.body.clone(),
    };

    let compiled = match jsonschema::JSONSchema::compile(&expected) {
        Ok(schema) => schema,
        Err(err) => {
            let message = format!("json_schema: schema does not compile: {err}");
            return AssertionOutcome::fail("json_schema", expected, target, message);
        }
    };

    let valid = compiled.is_valid(&target);
    let want_valid = matches!(operator, "conforms" | "valid" | "eq");
    if valid == want_valid {
        return AssertionOutcome::pass("json_schema", expected, target);
    }

    let message = if want_valid {
        let details: Vec<String> = compiled
            .validate(&target)
            .err()
            .map(|errors| {
                errors
                    .map(|e| format!("{e} at {}", e.instance_path))
                    .take(3)
                    .collect()
            })
            .unwrap_or_default();
        format!("json_schema: body does not conform: [{}]", details.join("; "))
    } else {
        "json_schema: body conforms but non-conformance was expected".to_string()
    };
    AssertionOutcome::fail("json_schema", expected, target, message)
}

// ============================================================================
// Helpers
// ============================================================================

/// Converts the accepted path spellings (`.a.b`, `a.b`, `$.a.b`, `/a/b`)
/// into a JSON pointer.
pub(crate) fn normalize_pointer(path: &str) -> String {
    let stripped = path.strip_prefix('$').unwrap_or(path);
    let stripped = stripped.trim_start_matches('.');
    if stripped.starts_with('/') {
        return stripped.to_string();
    }
    if stripped.is_empty() {
        return String::new();
    }
    format!("/{}", stripped.replace('.', "/"))
}

fn compare_values(operator: &str, actual: &Value, expected: &Value) -> bool {
    match operator {
        "eq" => actual == expected,
        "neq" => actual != expected,
        "contains" => match (actual.as_str(), expected.as_str()) {
            (Some(haystack), Some(needle)) => haystack.contains(needle),
            _ => false,
        },
        "matches" => match (actual.as_str(), expected.as_str()) {
            (Some(text), Some(pattern)) => Regex::new(pattern)
                .map(|re| re.is_match(text))
                .unwrap_or(false),
            _ => false,
        },
        "gt" | "lt" | "gte" | "lte" => match (actual.as_f64(), expected.as_f64()) {
            (Some(a), Some(e)) => compare_ordered(operator, a, e, actual, expected),
            _ => false,
        },
        _ => false,
    }
}

fn compare_ordered(operator: &str, a: f64, e: f64, actual: &Value, expected: &Value) -> bool {
    match operator {
        "eq" => actual == expected || a == e,
        "neq" => a != e,
        "gt" => a > e,
        "lt" => a < e,
        "gte" => a >= e,
        "lte" => a <= e,
        _ => false,
    }
}
