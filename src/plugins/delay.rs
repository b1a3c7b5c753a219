//! Delay reference plugin.
//!
//! Pauses a test for a configured duration. Useful for waiting out
//! asynchronous processing between steps and as the minimal exercise of the
//! activity contract (it observes cancellation like any long-running
//! protocol action would).

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

use super::{check_schema, ActivityContext, Plugin, StepResponse};
use crate::errors::EngineError;

/// Typed step config for the `delay` plugin.
#[derive(Debug, Deserialize)]
struct DelayConfig {
    /// How long to pause, as a humantime string (`"250ms"`, `"2s"`).
    #[serde(with = "humantime_serde")]
    duration: Duration,
}

/// The `delay` plugin.
pub struct DelayPlugin;

#[async_trait]
impl Plugin for DelayPlugin {
    fn kind(&self) -> &'static str {
        "delay"
    }

    fn config_schema(&self) -> Value {
        json!({
            "type": "object",
            "required": ["duration"],
            "properties": {
                "duration": {"type": "string", "minLength": 1}
            },
            "additionalProperties": false
        })
    }

    fn parse(&self, config: &Value) -> Result<(), EngineError> {
        check_schema(&self.config_schema(), config)?;
        if let Some(text) = config.get("duration").and_then(Value::as_str) {
            if !text.contains("{{") && humantime::parse_duration(text).is_err() {
                return Err(EngineError::Validation {
                    violations: vec![format!("unparseable duration '{text}'")],
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
        let config: DelayConfig = serde_json::from_value(config.clone())
            .map_err(|err| EngineError::internal(format!("delay config did not parse: {err}")))?;

        tokio::select! {
            _ = ctx.cancel.cancelled() => return Err(EngineError::Cancelled),
            _ = tokio::time::sleep(config.duration) => {}
        }

        let mut response = StepResponse::new("delay");
        response.duration_ms = config.duration.as_millis() as u64;
        response.body = json!({"waited_ms": response.duration_ms});
        Ok(response)
    }
}
