//! Log plugin.
//!
//! Emits a templated message into the run's log stream. The message has
//! already been through the runtime template phase when Execute runs, so a
//! step like `message: "created user {{ user_id }}"` logs the resolved text.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

use super::{check_schema, ActivityContext, Plugin, StepResponse};
use crate::errors::EngineError;

/// Typed step config for the `log` plugin.
#[derive(Debug, Deserialize)]
struct LogConfig {
    message: String,

    /// Log level for the emitted entry; `info` when absent.
    #[serde(default)]
    level: Option<String>,
}

/// The `log` plugin.
pub struct LogPlugin;

#[async_trait]
impl Plugin for LogPlugin {
    fn kind(&self) -> &'static str {
        "log"
    }

    fn config_schema(&self) -> Value {
        json!({
            "type": "object",
            "required": ["message"],
            "properties": {
                "message": {"type": "string"},
                "level": {
                    "type": "string",
                    "enum": ["debug", "info", "warn", "error"]
                }
            },
            "additionalProperties": false
        })
    }

    fn parse(&self, config: &Value) -> Result<(), EngineError> {
        check_schema(&self.config_schema(), config)
    }

    async fn execute(
        &self,
        ctx: &ActivityContext,
        config: &Value,
    ) -> Result<StepResponse, EngineError> {
        let config: LogConfig = serde_json::from_value(config.clone())
            .map_err(|err| EngineError::internal(format!("log config did not parse: {err}")))?;

        let level = config.level.as_deref().unwrap_or("info");
        ctx.log.emit(level, json!({"message": config.message}));

        let mut response = StepResponse::new("log");
        response.body = json!({"message": config.message, "level": level});
        Ok(response)
    }
}
