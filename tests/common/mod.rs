//! Shared fixtures for the end-to-end tests: a scriptable stub plugin that
//! can fail a configured number of attempts, record every delivered config,
//! and echo its config back as the response body.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::{json, Value};

use rocketship::errors::EngineError;
use rocketship::plugins::{ActivityContext, Plugin, PluginRegistry, StepResponse};

/// Observable side effects of a [`StubPlugin`] across a run.
#[derive(Default)]
pub struct StubObserver {
    pub calls: AtomicU32,
    pub call_times: Mutex<Vec<Instant>>,
    /// Every config delivered to Execute, in order.
    pub configs: Mutex<Vec<Value>>,
}

impl StubObserver {
    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn configs(&self) -> Vec<Value> {
        self.configs.lock().expect("configs lock").clone()
    }

    pub fn call_times(&self) -> Vec<Instant> {
        self.call_times.lock().expect("call_times lock").clone()
    }
}

/// Test plugin. Fails its first `fail_attempts` Execute calls with a
/// retryable transport error, then succeeds, echoing the delivered config
/// as the response body.
pub struct StubPlugin {
    pub fail_attempts: u32,
    pub sleep: Option<Duration>,
    pub observer: Arc<StubObserver>,
}

impl StubPlugin {
    pub fn passing(observer: Arc<StubObserver>) -> Self {
        Self {
            fail_attempts: 0,
            sleep: None,
            observer,
        }
    }

    pub fn failing_first(fail_attempts: u32, observer: Arc<StubObserver>) -> Self {
        Self {
            fail_attempts,
            sleep: None,
            observer,
        }
    }
}

#[async_trait]
impl Plugin for StubPlugin {
    fn kind(&self) -> &'static str {
        "stub"
    }

    fn config_schema(&self) -> Value {
        json!({"type": "object"})
    }

    fn parse(&self, _config: &Value) -> Result<(), EngineError> {
        Ok(())
    }

    async fn execute(
        &self,
        ctx: &ActivityContext,
        config: &Value,
    ) -> Result<StepResponse, EngineError> {
        let call = self.observer.calls.fetch_add(1, Ordering::SeqCst) + 1;
        self.observer
            .call_times
            .lock()
            .expect("call_times lock")
            .push(Instant::now());
        self.observer
            .configs
            .lock()
            .expect("configs lock")
            .push(config.clone());

        if let Some(duration) = self.sleep {
            tokio::select! {
                _ = ctx.cancel.cancelled() => return Err(EngineError::Cancelled),
                _ = tokio::time::sleep(duration) => {}
            }
        }

        if call <= self.fail_attempts {
            return Err(EngineError::transport(format!(
                "injected failure on call {call}"
            )));
        }

        let mut response = StepResponse::new("stub");
        response.status = Some(200);
        response.body = config.clone();
        Ok(response)
    }
}

/// Registry with the reference plugins plus the given stub.
pub fn registry_with_stub(stub: StubPlugin) -> PluginRegistry {
    let mut registry = rocketship::plugins::default_registry();
    registry
        .register(Arc::new(stub))
        .expect("stub kind is unique");
    registry
}
