//! Workflow runtime.
//!
//! One suite run is a tree of three levels: the suite workflow runs
//! suite-level hooks and sequences tests; each test workflow owns a state
//! map and sequences its hooks and steps; each step is a single activity
//! (plugin Execute plus assertions and saves) driven through the step's
//! retry policy.
//!
//! Ordering rules: steps within a test are strictly sequential and a step's
//! saves are written to the state map before the next step starts; tests run
//! sequentially and never share state (each starts from a clone of the
//! suite-init state). Cleanup `always` hooks run on every exit path,
//! including cancellation and deadline expiry, under a detached cancellation
//! token so they cannot be skipped by the very signal that triggered them.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::assertions;
use crate::dsl::{Step, Suite, TestCase};
use crate::engine::runs::{RunHandle, RunStatus, ScopedLog, StepRecord, TestRecord};
use crate::errors::EngineError;
use crate::plugins::{ActivityContext, PluginRegistry};
use crate::retry::RetryDriver;
use crate::saves::{self, SaveOutcome};
use crate::state::StateMap;
use crate::template::RuntimeResolver;

/// Everything a spawned suite workflow needs.
pub struct SuiteRun {
    pub suite: Suite,
    pub handle: Arc<RunHandle>,
    pub registry: Arc<PluginRegistry>,
    /// Environment for `.env.*` resolution, captured at engine construction.
    pub env: Arc<HashMap<String, String>>,
    /// Overall run deadline.
    pub deadline: Duration,
}

/// Entry point of the suite workflow. Always drives the run to a terminal
/// status and closes the log stream.
pub async fn run_suite(params: SuiteRun) {
    let SuiteRun {
        suite,
        handle,
        registry,
        env,
        deadline,
    } = params;

    handle.mark_started();
    handle.log.append(
        None,
        None,
        "info",
        json!({"message": "run started", "suite": suite.name}),
    );
    info!(run_id = %handle.run_id, suite = %suite.name, "run started");

    // Deadline watcher: fires the run's cancellation token with the timeout
    // cause. Aborted once the body finishes.
    let watcher = {
        let handle = handle.clone();
        tokio::spawn(async move {
            tokio::time::sleep(deadline).await;
            warn!(run_id = %handle.run_id, "run deadline exceeded");
            handle.log.append(
                None,
                None,
                "warn",
                json!({"message": "run deadline exceeded"}),
            );
            handle.trigger_timeout();
        })
    };

    let mut suite_state = StateMap::new();
    let mut suite_failed = false;

    // Suite-level init runs exactly once before any test; its saves seed
    // every test's state map.
    for step in &suite.init {
        if handle.cancel.is_cancelled() {
            break;
        }
        let record = run_step(
            step,
            None,
            &mut suite_state,
            &handle,
            &registry,
            &env,
            handle.cancel.clone(),
        )
        .await;
        if record.status != RunStatus::Passed {
            suite_failed = true;
            break;
        }
    }

    let mut any_test_failed = false;
    if !suite_failed {
        for test in &suite.tests {
            if handle.cancel.is_cancelled() {
                break;
            }
            let status = run_test(test, &suite_state, &handle, &registry, &env).await;
            if status == RunStatus::Failed {
                any_test_failed = true;
            }
        }
    }

    // Suite-level cleanup. `on_failure` runs iff something failed;
    // `always` runs unconditionally. Both use a detached token so they
    // execute even after cancellation or timeout; their failures count
    // toward the suite status.
    let mut cleanup_failed = false;
    if let Some(cleanup) = &suite.cleanup {
        let detached = CancellationToken::new();
        if suite_failed || any_test_failed {
            for step in &cleanup.on_failure {
                let record = run_step(
                    step,
                    None,
                    &mut suite_state,
                    &handle,
                    &registry,
                    &env,
                    detached.clone(),
                )
                .await;
                if record.status != RunStatus::Passed {
                    cleanup_failed = true;
                }
            }
        }
        for step in &cleanup.always {
            let record = run_step(
                step,
                None,
                &mut suite_state,
                &handle,
                &registry,
                &env,
                detached.clone(),
            )
            .await;
            if record.status != RunStatus::Passed {
                cleanup_failed = true;
            }
        }
    }

    watcher.abort();

    let status = if handle.is_timed_out() {
        RunStatus::Timeout
    } else if handle.cancel.is_cancelled() {
        RunStatus::Cancelled
    } else if suite_failed || any_test_failed || cleanup_failed {
        RunStatus::Failed
    } else {
        RunStatus::Passed
    };

    info!(run_id = %handle.run_id, status = status.as_str(), "run finished");
    handle.finish(status);
}

// ============================================================================
// Test workflow
// ============================================================================

/// Runs one test: init hooks, steps, then cleanup hooks. Returns the test's
/// terminal status; the record is pushed into the run handle incrementally.
async fn run_test(
    test: &TestCase,
    base_state: &StateMap,
    handle: &Arc<RunHandle>,
    registry: &Arc<PluginRegistry>,
    env: &Arc<HashMap<String, String>>,
) -> RunStatus {
    let started = Instant::now();
    let test_index = {
        let mut index = 0;
        handle.update(|record| {
            index = record.tests.len();
            record.tests.push(TestRecord {
                name: test.name.clone(),
                status: RunStatus::Running,
                duration_ms: 0,
                steps: Vec::new(),
            });
        });
        index
    };

    handle.log.append(
        Some(test.name.clone()),
        None,
        "info",
        json!({"message": "test started"}),
    );

    // Tests never share state; each starts from the suite-init snapshot.
    let mut state = base_state.clone();
    let mut status = RunStatus::Passed;

    // Init hooks and steps share the state map and the same failure rules:
    // first non-passing step stops the test.
    let groups: [&[Step]; 2] = [&test.init, &test.steps];
    'groups: for steps in groups {
        for step in steps {
            if handle.cancel.is_cancelled() {
                status = RunStatus::Cancelled;
                break 'groups;
            }
            let record = run_step(
                step,
                Some(&test.name),
                &mut state,
                handle,
                registry,
                env,
                handle.cancel.clone(),
            )
            .await;
            let step_status = record.status;
            push_step_record(handle, test_index, record);
            match step_status {
                RunStatus::Passed => {}
                RunStatus::Cancelled => {
                    status = RunStatus::Cancelled;
                    break 'groups;
                }
                _ => {
                    status = RunStatus::Failed;
                    break 'groups;
                }
            }
        }
    }

    // Cleanup hooks run on every exit path. Their failures are logged but do
    // not change the already-determined test status.
    if let Some(cleanup) = &test.cleanup {
        let detached = CancellationToken::new();
        if status == RunStatus::Failed {
            for step in &cleanup.on_failure {
                let record = run_step(
                    step,
                    Some(&test.name),
                    &mut state,
                    handle,
                    registry,
                    env,
                    detached.clone(),
                )
                .await;
                if record.status != RunStatus::Passed {
                    warn!(test = %test.name, step = %record.name, "cleanup hook failed");
                }
                push_step_record(handle, test_index, record);
            }
        }
        for step in &cleanup.always {
            let record = run_step(
                step,
                Some(&test.name),
                &mut state,
                handle,
                registry,
                env,
                detached.clone(),
            )
            .await;
            if record.status != RunStatus::Passed {
                warn!(test = %test.name, step = %record.name, "cleanup hook failed");
            }
            push_step_record(handle, test_index, record);
        }
    }

    let duration_ms = started.elapsed().as_millis() as u64;
    handle.update(|record| {
        if let Some(test_record) = record.tests.get_mut(test_index) {
            test_record.status = status;
            test_record.duration_ms = duration_ms;
        }
    });
    handle.log.append(
        Some(test.name.clone()),
        None,
        "info",
        json!({"message": "test finished", "status": status.as_str(), "duration_ms": duration_ms}),
    );

    status
}

fn push_step_record(handle: &Arc<RunHandle>, test_index: usize, record: StepRecord) {
    handle.update(|run_record| {
        if let Some(test_record) = run_record.tests.get_mut(test_index) {
            test_record.steps.push(record);
        }
    });
}

// ============================================================================
// Step activity
// ============================================================================

/// Results captured inside the attempt closure so the step record can carry
/// assertion and save details even when the attempt failed.
#[derive(Default)]
struct CapturedStep {
    assertions: Vec<assertions::AssertionOutcome>,
    saves: Vec<SaveOutcome>,
    writes: Vec<(String, serde_json::Value)>,
}

/// One step activity: runtime template phase, plugin Execute, assertions,
/// saves, all inside the retry loop. Saves are written to the state map
/// (linearized, after the loop) before this function returns, so the next
/// step observes them.
async fn run_step(
    step: &Step,
    test_name: Option<&str>,
    state: &mut StateMap,
    handle: &Arc<RunHandle>,
    registry: &Arc<PluginRegistry>,
    env: &Arc<HashMap<String, String>>,
    cancel: CancellationToken,
) -> StepRecord {
    let test_owned = test_name.map(str::to_string);
    handle.log.append(
        test_owned.clone(),
        Some(step.name.clone()),
        "info",
        json!({"message": "step started", "plugin": step.plugin}),
    );

    let Some(plugin) = registry.get(&step.plugin) else {
        // Compilation guarantees registration; reaching this is a bug.
        error!(step = %step.name, plugin = %step.plugin, "plugin vanished from registry");
        return StepRecord {
            name: step.name.clone(),
            plugin: step.plugin.clone(),
            status: RunStatus::Failed,
            attempts: 0,
            duration_ms: 0,
            error: Some(format!("plugin '{}' is not registered", step.plugin)),
            assertions: Vec::new(),
            saves: Vec::new(),
        };
    };

    let driver = RetryDriver::new(step.retry.as_ref());
    let captured = Arc::new(Mutex::new(CapturedStep::default()));
    let snapshot = state.snapshot();
    let step_shared = Arc::new(step.clone());
    let started = Instant::now();

    let (result, attempts) = driver
        .run(&step.name, &cancel, |attempt| {
            let plugin = plugin.clone();
            let step = step_shared.clone();
            let snapshot = snapshot.clone();
            let env = env.clone();
            let cancel = cancel.clone();
            let captured = captured.clone();
            let run_id = handle.run_id.clone();
            let test_owned = test_owned.clone();
            let log = Arc::new(ScopedLog::new(
                handle.log.clone(),
                test_owned.clone(),
                Some(step.name.clone()),
            ));
            async move {
                let resolver = RuntimeResolver::new(&snapshot, &env, &run_id)
                    .with_missing_policy(plugin.missing_policy());
                let config = resolver.render_value(&step.config)?;

                let ctx = ActivityContext {
                    run_id,
                    test_name: test_owned,
                    step_name: step.name.clone(),
                    state: snapshot.clone(),
                    env: (*env).clone(),
                    cancel,
                    log,
                    attempt,
                };

                let response = plugin.execute(&ctx, &config).await?;

                let outcomes = assertions::evaluate(&step.assertions, &response);
                let failed = assertions::failures(&outcomes);
                if !failed.is_empty() {
                    lock_captured(&captured).assertions = outcomes;
                    return Err(EngineError::AssertionFailed { failures: failed });
                }

                let (save_outcomes, writes) = saves::extract(&step.save, &response)?;
                let mut slot = lock_captured(&captured);
                slot.assertions = outcomes;
                slot.saves = save_outcomes;
                slot.writes = writes;
                Ok(response)
            }
        })
        .await;

    let duration_ms = started.elapsed().as_millis() as u64;
    let captured = Arc::try_unwrap(captured)
        .map(|mutex| match mutex.into_inner() {
            Ok(inner) => inner,
            Err(poisoned) => poisoned.into_inner(),
        })
        .unwrap_or_default();

    match result {
        Ok(_) => {
            for (name, value) in &captured.writes {
                state.set(name.clone(), value.clone());
            }
            handle.log.append(
                test_owned.clone(),
                Some(step.name.clone()),
                "info",
                json!({"message": "step passed", "attempts": attempts, "duration_ms": duration_ms}),
            );
            StepRecord {
                name: step.name.clone(),
                plugin: step.plugin.clone(),
                status: RunStatus::Passed,
                attempts,
                duration_ms,
                error: None,
                assertions: captured.assertions,
                saves: captured.saves,
            }
        }
        Err(err) => {
            let status = if matches!(err, EngineError::Cancelled) {
                RunStatus::Cancelled
            } else {
                RunStatus::Failed
            };
            handle.log.append(
                test_owned.clone(),
                Some(step.name.clone()),
                "error",
                json!({
                    "message": "step failed",
                    "error": err.to_string(),
                    "error_kind": err.kind(),
                    "attempts": attempts,
                    "duration_ms": duration_ms,
                }),
            );
            StepRecord {
                name: step.name.clone(),
                plugin: step.plugin.clone(),
                status,
                attempts,
                duration_ms,
                error: Some(err.to_string()),
                assertions: captured.assertions,
                saves: captured.saves,
            }
        }
    }
}

fn lock_captured(captured: &Arc<Mutex<CapturedStep>>) -> std::sync::MutexGuard<'_, CapturedStep> {
    match captured.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
