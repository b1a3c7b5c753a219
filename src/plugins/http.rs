//! HTTP reference plugin.
//!
//! Executes one HTTP request per step. The response is returned structured
//! (`{status, headers, body}`) for the runtime to assert against and save
//! from; the plugin itself never evaluates assertions.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use indexmap::IndexMap;
use reqwest::{Client, Method};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use super::{check_schema, ActivityContext, Plugin, StepResponse};
use crate::errors::EngineError;

/// Default request timeout when neither the step nor the suite sets one.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Typed step config for the `http` plugin.
#[derive(Debug, Deserialize)]
struct HttpConfig {
    /// HTTP method, e.g. `GET`, `POST`.
    method: String,

    /// Absolute request URL.
    url: String,

    #[serde(default)]
    headers: IndexMap<String, String>,

    /// Query parameters appended to the URL, percent-encoded.
    #[serde(default)]
    query: IndexMap<String, String>,

    /// Request body. A string is sent verbatim (callers assemble JSON
    /// themselves, typically via templates); a structured value is
    /// serialized as JSON.
    #[serde(default)]
    body: Option<Value>,

    #[serde(default, with = "humantime_serde::option")]
    timeout: Option<Duration>,
}

/// The `http` plugin. Holds one reqwest client so the connection pool is
/// shared across steps and runs.
pub struct HttpPlugin {
    client: Client,
}

impl HttpPlugin {
    /// Creates the plugin with a fresh client.
    pub fn new() -> Self {
        Self {
            client: Client::new(),
        }
    }
}

impl Default for HttpPlugin {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Plugin for HttpPlugin {
    fn kind(&self) -> &'static str {
        "http"
    }

    fn config_schema(&self) -> Value {
        json!({
            "type": "object",
            "required": ["method", "url"],
            "properties": {
                "method": {
                    "type": "string",
                    "enum": ["GET", "POST", "PUT", "DELETE", "PATCH", "HEAD", "OPTIONS"]
                },
                "url": {"type": "string", "minLength": 1},
                "headers": {
                    "type": "object",
                    "additionalProperties": {"type": "string"}
                },
                "query": {
                    "type": "object",
                    "additionalProperties": {"type": "string"}
                },
                "body": {},
                "timeout": {"type": "string"}
            },
            "additionalProperties": false
        })
    }

    fn parse(&self, config: &Value) -> Result<(), EngineError> {
        check_schema(&self.config_schema(), config)?;
        // Template expressions make most fields unparseable statically; the
        // method is literal in practice, so catch typos early.
        if let Some(method) = config.get("method").and_then(Value::as_str) {
            if !method.contains("{{") && Method::from_bytes(method.as_bytes()).is_err() {
                return Err(EngineError::Validation {
                    violations: vec![format!("invalid HTTP method '{method}'")],
                });
            }
        }
        Ok(())
    }

    async fn execute(
        &self,
        ctx: &ActivityContext,
        config: &Value,
    ) -> Result<StepResponse, EngineError> {
        let config: HttpConfig = serde_json::from_value(config.clone())
            .map_err(|err| EngineError::internal(format!("http config did not parse: {err}")))?;

        let method = Method::from_bytes(config.method.as_bytes()).map_err(|_| {
            EngineError::PluginLogic {
                detail: format!("invalid HTTP method '{}'", config.method),
                retryable: false,
            }
        })?;

        let mut url = config.url.clone();
        if !config.query.is_empty() {
            let encoded: Vec<String> = config
                .query
                .iter()
                .map(|(k, v)| format!("{}={}", urlencoding::encode(k), urlencoding::encode(v)))
                .collect();
            let separator = if url.contains('?') { '&' } else { '?' };
            url.push(separator);
            url.push_str(&encoded.join("&"));
        }

        let mut request = self
            .client
            .request(method.clone(), &url)
            .timeout(config.timeout.unwrap_or(DEFAULT_TIMEOUT));

        for (name, value) in &config.headers {
            request = request.header(name, value);
        }

        if let Some(body) = &config.body {
            request = match body {
                Value::String(raw) => {
                    // Pre-assembled payloads default to JSON unless the step
                    // set its own content type.
                    let has_content_type = config
                        .headers
                        .keys()
                        .any(|k| k.eq_ignore_ascii_case("content-type"));
                    let request = request.body(raw.clone());
                    if has_content_type {
                        request
                    } else {
                        request.header("content-type", "application/json")
                    }
                }
                structured => request.json(structured),
            };
        }

        debug!(
            run_id = %ctx.run_id,
            step = %ctx.step_name,
            method = %method,
            url = %url,
            attempt = ctx.attempt,
            "sending http request"
        );

        let started = Instant::now();
        let result = tokio::select! {
            _ = ctx.cancel.cancelled() => return Err(EngineError::Cancelled),
            result = request.send() => result,
        };
        let duration_ms = started.elapsed().as_millis() as u64;

        let response = result.map_err(EngineError::from)?;
        let status = response.status().as_u16();
        let mut headers = IndexMap::new();
        for (name, value) in response.headers() {
            if let Ok(text) = value.to_str() {
                headers.insert(name.as_str().to_ascii_lowercase(), text.to_string());
            }
        }

        let raw = tokio::select! {
            _ = ctx.cancel.cancelled() => return Err(EngineError::Cancelled),
            raw = response.text() => raw.map_err(EngineError::from)?,
        };
        let (body, raw_body) = match serde_json::from_str::<Value>(&raw) {
            Ok(parsed) => (parsed, None),
            Err(_) if raw.is_empty() => (Value::Null, None),
            Err(_) => (Value::Null, Some(raw)),
        };

        ctx.log.emit(
            "info",
            json!({
                "message": "http request finished",
                "method": method.as_str(),
                "url": url,
                "status": status,
                "duration_ms": duration_ms,
            }),
        );

        Ok(StepResponse {
            plugin: "http".to_string(),
            status: Some(status),
            headers,
            body,
            raw_body,
            duration_ms,
        })
    }
}
