//! End-to-end scenarios exercising the whole stack: DSL compilation, the
//! workflow runtime, template resolution, retries, hooks, cancellation, and
//! log streaming.

mod common;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::json;

use common::{registry_with_stub, StubObserver, StubPlugin};
use rocketship::plugins::default_registry;
use rocketship::{Engine, EngineConfig, RunStatus};

fn engine_with_stub(stub: StubPlugin) -> Engine {
    Engine::with_registry(
        EngineConfig::default(),
        registry_with_stub(stub),
        HashMap::new(),
    )
}

// ============================================================================
// HTTP chain against a local fixture server
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn http_chain_saves_id_and_follows_up() {
    let server = tiny_http::Server::http("127.0.0.1:0").expect("bind fixture server");
    let port = server
        .server_addr()
        .to_ip()
        .expect("ip listener")
        .port();
    let seen = Arc::new(Mutex::new(Vec::<String>::new()));

    let server_seen = seen.clone();
    let server_thread = std::thread::spawn(move || {
        for _ in 0..2 {
            let request = server.recv().expect("fixture request");
            server_seen
                .lock()
                .expect("seen lock")
                .push(format!("{} {}", request.method(), request.url()));
            let body = if request.url() == "/users" {
                r#"{"id": "u-123", "email": "a@b.c"}"#
            } else {
                r#"{"email": "a@b.c"}"#
            };
            let header = tiny_http::Header::from_bytes(
                &b"Content-Type"[..],
                &b"application/json"[..],
            )
            .expect("header");
            let response = tiny_http::Response::from_string(body).with_header(header);
            request.respond(response).expect("fixture respond");
        }
    });

    let yaml = format!(
        r#"
name: http chain
vars:
  base_url: http://127.0.0.1:{port}
tests:
  - name: create then fetch
    steps:
      - name: create user
        plugin: http
        config:
          method: POST
          url: "{{{{ .vars.base_url }}}}/users"
          body: '{{"email": "a@b.c"}}'
        assertions:
          - type: status_code
            expected: 200
        save:
          - json_path: .id
            as: user_id
            required: true
      - name: fetch user
        plugin: http
        config:
          method: GET
          url: "{{{{ .vars.base_url }}}}/users/{{{{ user_id }}}}"
        assertions:
          - type: status_code
            expected: 200
          - type: json_path
            path: .email
            expected: a@b.c
"#
    );

    let engine = Engine::with_registry(
        EngineConfig::default(),
        default_registry(),
        HashMap::new(),
    );
    let run_id = engine.create_run(&yaml, Vec::new(), None).await.unwrap();
    let status = engine.wait_for_run(&run_id).await.unwrap();
    server_thread.join().expect("fixture server thread");

    assert_eq!(status, RunStatus::Passed);

    let record = engine.get_run(&run_id).await.unwrap();
    let steps = &record.tests[0].steps;
    assert_eq!(steps.len(), 2);
    assert_eq!(steps[0].attempts, 1);
    assert_eq!(steps[1].attempts, 1);
    assert_eq!(
        steps[0].saves[0].value,
        Some(json!("u-123")),
        "save wrote the created id"
    );

    let requests = seen.lock().expect("seen lock").clone();
    assert_eq!(requests, vec!["POST /users", "GET /users/u-123"]);
}

// ============================================================================
// Retry convergence and attempt accounting
// ============================================================================

#[tokio::test]
async fn retry_converges_with_backoff() {
    let observer = Arc::new(StubObserver::default());
    let engine = engine_with_stub(StubPlugin::failing_first(2, observer.clone()));

    let yaml = r#"
name: retry
tests:
  - name: flaky backend
    steps:
      - name: poke
        plugin: stub
        config: {}
        retry:
          maximum_attempts: 3
          initial_interval: 10ms
          backoff_coefficient: 2.0
"#;
    let run_id = engine.create_run(yaml, Vec::new(), None).await.unwrap();
    let status = engine.wait_for_run(&run_id).await.unwrap();

    assert_eq!(status, RunStatus::Passed);
    assert_eq!(observer.calls(), 3, "exactly three Execute invocations");

    let record = engine.get_run(&run_id).await.unwrap();
    assert_eq!(record.tests[0].steps[0].attempts, 3);

    let times = observer.call_times();
    let gap1 = times[1] - times[0];
    let gap2 = times[2] - times[1];
    assert!(gap1 >= Duration::from_millis(10), "first backoff >= 10ms");
    assert!(gap2 >= Duration::from_millis(20), "second backoff >= 20ms");
}

#[tokio::test]
async fn single_attempt_policy_never_retries() {
    let observer = Arc::new(StubObserver::default());
    let engine = engine_with_stub(StubPlugin::failing_first(u32::MAX, observer.clone()));

    let yaml = r#"
name: no retry
tests:
  - name: fails once
    steps:
      - name: poke
        plugin: stub
        config: {}
        retry:
          maximum_attempts: 1
          initial_interval: 10ms
"#;
    let run_id = engine.create_run(yaml, Vec::new(), None).await.unwrap();
    let status = engine.wait_for_run(&run_id).await.unwrap();

    assert_eq!(status, RunStatus::Failed);
    assert_eq!(observer.calls(), 1);
}

// ============================================================================
// Cleanup hooks on failure
// ============================================================================

#[tokio::test]
async fn cleanup_hooks_run_after_failed_step() {
    let observer = Arc::new(StubObserver::default());
    let engine = engine_with_stub(StubPlugin::failing_first(u32::MAX, observer.clone()));

    let yaml = r#"
name: cleanup
tests:
  - name: broken
    init:
      - name: provision
        plugin: log
        config: {message: resource created}
    cleanup:
      on_failure:
        - name: report
          plugin: log
          config: {message: test failed}
      always:
        - name: teardown
          plugin: log
          config: {message: resource deleted}
    steps:
      - name: doomed
        plugin: stub
        config: {}
"#;
    let run_id = engine.create_run(yaml, Vec::new(), None).await.unwrap();
    let status = engine.wait_for_run(&run_id).await.unwrap();
    assert_eq!(status, RunStatus::Failed);
    assert_eq!(observer.calls(), 1, "step activity executed exactly once");

    let record = engine.get_run(&run_id).await.unwrap();
    let steps = &record.tests[0].steps;
    let names: Vec<&str> = steps.iter().map(|s| s.name.as_str()).collect();
    assert_eq!(names, vec!["provision", "doomed", "report", "teardown"]);
    assert_eq!(steps[0].status, RunStatus::Passed, "init ran");
    assert_eq!(steps[1].status, RunStatus::Failed);
    assert_eq!(steps[2].status, RunStatus::Passed, "on_failure ran");
    assert_eq!(steps[3].status, RunStatus::Passed, "always ran");
    assert_eq!(record.tests[0].status, RunStatus::Failed);
}

#[tokio::test]
async fn on_failure_hooks_skipped_when_test_passes() {
    let observer = Arc::new(StubObserver::default());
    let engine = engine_with_stub(StubPlugin::passing(observer));

    let yaml = r#"
name: cleanup
tests:
  - name: healthy
    cleanup:
      on_failure:
        - name: report
          plugin: log
          config: {message: should not run}
      always:
        - name: teardown
          plugin: log
          config: {message: resource deleted}
    steps:
      - name: fine
        plugin: stub
        config: {}
"#;
    let run_id = engine.create_run(yaml, Vec::new(), None).await.unwrap();
    assert_eq!(
        engine.wait_for_run(&run_id).await.unwrap(),
        RunStatus::Passed
    );

    let record = engine.get_run(&run_id).await.unwrap();
    let names: Vec<&str> = record.tests[0]
        .steps
        .iter()
        .map(|s| s.name.as_str())
        .collect();
    assert_eq!(names, vec!["fine", "teardown"]);
}

// ============================================================================
// Cancellation
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cancellation_skips_remaining_tests_but_runs_cleanup() {
    let observer = Arc::new(StubObserver::default());
    let mut stub = StubPlugin::passing(observer.clone());
    stub.sleep = Some(Duration::from_millis(150));
    let engine = engine_with_stub(stub);

    let mut tests = String::new();
    for i in 0..10 {
        tests.push_str(&format!(
            "  - name: test {i}\n    steps:\n      - name: slow step\n        plugin: stub\n        config: {{}}\n"
        ));
    }
    let yaml = format!(
        "name: long haul\ncleanup:\n  always:\n    - name: suite teardown\n      plugin: log\n      config: {{message: suite cleaned}}\ntests:\n{tests}"
    );

    let run_id = engine.create_run(&yaml, Vec::new(), None).await.unwrap();
    tokio::time::sleep(Duration::from_millis(380)).await; // inside test 3
    assert_eq!(engine.cancel_run(&run_id).await, Some(true));

    let status = engine.wait_for_run(&run_id).await.unwrap();
    assert_eq!(status, RunStatus::Cancelled);

    let record = engine.get_run(&run_id).await.unwrap();
    assert!(
        record.tests.len() < 10,
        "later tests never started (saw {})",
        record.tests.len()
    );
    let last = record.tests.last().unwrap();
    assert_eq!(last.status, RunStatus::Cancelled);

    // The suite-level cleanup hook still ran, and the stream closed with a
    // CANCELLED terminal marker after it.
    let mut subscription = engine.subscribe_logs(&run_id).await.unwrap();
    let mut entries = Vec::new();
    while let Some(entry) = subscription.next().await {
        entries.push(entry);
    }
    assert!(entries
        .iter()
        .any(|e| e.step_name.as_deref() == Some("suite teardown")));
    let terminal = entries.last().unwrap();
    assert_eq!(terminal.terminal, Some(RunStatus::Cancelled));
}

// ============================================================================
// Deadline expiry
// ============================================================================

#[tokio::test]
async fn deadline_expiry_times_out_and_still_cleans_up() {
    let observer = Arc::new(StubObserver::default());
    let mut stub = StubPlugin::passing(observer);
    stub.sleep = Some(Duration::from_secs(30));
    let engine = engine_with_stub(stub);

    let yaml = r#"
name: too slow
timeout: 100ms
tests:
  - name: stuck
    cleanup:
      always:
        - name: teardown
          plugin: log
          config: {message: cleaned anyway}
    steps:
      - name: hang
        plugin: stub
        config: {}
"#;
    let run_id = engine.create_run(yaml, Vec::new(), None).await.unwrap();
    let status = engine.wait_for_run(&run_id).await.unwrap();
    assert_eq!(status, RunStatus::Timeout);

    let record = engine.get_run(&run_id).await.unwrap();
    let names: Vec<&str> = record.tests[0]
        .steps
        .iter()
        .map(|s| s.name.as_str())
        .collect();
    assert!(names.contains(&"teardown"), "cleanup ran after timeout");
}

// ============================================================================
// Escapes and runtime variables
// ============================================================================

#[tokio::test]
async fn escaped_template_is_delivered_literally() {
    let observer = Arc::new(StubObserver::default());
    let engine = engine_with_stub(StubPlugin::passing(observer.clone()));

    let yaml = r#"
name: escapes
tests:
  - name: literal braces
    steps:
      - name: seed
        plugin: stub
        config: {value: X}
        save:
          - json_path: .value
            as: prior
      - name: deliver
        plugin: stub
        config:
          body: '{"template": "\{{ literal }}", "value": "{{ prior }}"}'
"#;
    let run_id = engine.create_run(yaml, Vec::new(), None).await.unwrap();
    assert_eq!(
        engine.wait_for_run(&run_id).await.unwrap(),
        RunStatus::Passed
    );

    let configs = observer.configs();
    assert_eq!(
        configs[1]["body"],
        json!(r#"{"template": "{{ literal }}", "value": "X"}"#)
    );
}

// ============================================================================
// Override precedence
// ============================================================================

#[tokio::test]
async fn operator_override_wins_over_inline_vars() {
    let observer = Arc::new(StubObserver::default());
    let engine = engine_with_stub(StubPlugin::passing(observer.clone()));

    let yaml = r#"
name: overrides
vars:
  base_url: http://a
tests:
  - name: t
    steps:
      - name: call
        plugin: stub
        config:
          url: "{{ .vars.base_url }}/x"
"#;
    let overrides = vec![("base_url".to_string(), "http://b".to_string())];
    let run_id = engine.create_run(yaml, overrides, None).await.unwrap();
    assert_eq!(
        engine.wait_for_run(&run_id).await.unwrap(),
        RunStatus::Passed
    );

    assert_eq!(observer.configs()[0]["url"], json!("http://b/x"));
}

// ============================================================================
// State isolation and suite-init seeding
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_runs_do_not_share_state() {
    let observer = Arc::new(StubObserver::default());
    let engine = Arc::new(engine_with_stub(StubPlugin::passing(observer.clone())));

    let yaml = r#"
name: isolation
tests:
  - name: echo my run
    steps:
      - name: seed
        plugin: stub
        config: {value: "{{ run.id }}"}
        save:
          - json_path: .value
            as: mine
      - name: echo
        plugin: stub
        config: {echo: "{{ mine }}", rid: "{{ run.id }}"}
"#;

    let a = engine.create_run(yaml, Vec::new(), None).await.unwrap();
    let b = engine.create_run(yaml, Vec::new(), None).await.unwrap();
    assert_ne!(a, b);
    assert_eq!(engine.wait_for_run(&a).await.unwrap(), RunStatus::Passed);
    assert_eq!(engine.wait_for_run(&b).await.unwrap(), RunStatus::Passed);

    // Every echo step saw the value saved by its own run, never the other's.
    let echo_configs: Vec<_> = observer
        .configs()
        .into_iter()
        .filter(|c| c.get("echo").is_some())
        .collect();
    assert_eq!(echo_configs.len(), 2);
    for config in echo_configs {
        assert_eq!(config["echo"], config["rid"]);
    }
}

#[tokio::test]
async fn suite_init_saves_seed_every_test() {
    let observer = Arc::new(StubObserver::default());
    let engine = engine_with_stub(StubPlugin::passing(observer.clone()));

    let yaml = r#"
name: seeding
init:
  - name: provision token
    plugin: stub
    config: {value: tok-1}
    save:
      - json_path: .value
        as: token
tests:
  - name: first
    steps:
      - name: use token
        plugin: stub
        config: {auth: "{{ token }}"}
  - name: second
    steps:
      - name: use token again
        plugin: stub
        config: {auth: "{{ token }}"}
      - name: write local
        plugin: stub
        config: {value: local-only}
        save:
          - json_path: .value
            as: scratch
  - name: third
    steps:
      - name: scratch is gone
        plugin: stub
        config: {probe: "{{ scratch }}"}
"#;
    let run_id = engine.create_run(yaml, Vec::new(), None).await.unwrap();
    let status = engine.wait_for_run(&run_id).await.unwrap();

    // Tests one and two see the suite-init token; test three fails because
    // another test's save never leaks into its state map.
    assert_eq!(status, RunStatus::Failed);
    let record = engine.get_run(&run_id).await.unwrap();
    assert_eq!(record.tests[0].status, RunStatus::Passed);
    assert_eq!(record.tests[1].status, RunStatus::Passed);
    assert_eq!(record.tests[2].status, RunStatus::Failed);

    let auth_configs: Vec<_> = observer
        .configs()
        .into_iter()
        .filter(|c| c.get("auth").is_some())
        .collect();
    assert_eq!(auth_configs.len(), 2);
    for config in auth_configs {
        assert_eq!(config["auth"], json!("tok-1"));
    }
}

// ============================================================================
// Environment variables
// ============================================================================

#[tokio::test]
async fn env_namespace_resolves_from_injected_environment() {
    let observer = Arc::new(StubObserver::default());
    let mut env = HashMap::new();
    env.insert("API_KEY".to_string(), "sekrit".to_string());
    let engine = Engine::with_registry(
        EngineConfig::default(),
        registry_with_stub(StubPlugin::passing(observer.clone())),
        env,
    );

    let yaml = r#"
name: env
tests:
  - name: t
    steps:
      - name: call
        plugin: stub
        config: {key: "{{ .env.API_KEY }}"}
"#;
    let run_id = engine.create_run(yaml, Vec::new(), None).await.unwrap();
    assert_eq!(
        engine.wait_for_run(&run_id).await.unwrap(),
        RunStatus::Passed
    );
    assert_eq!(observer.configs()[0]["key"], json!("sekrit"));
}

#[tokio::test]
async fn unresolved_runtime_variable_fails_the_step() {
    let observer = Arc::new(StubObserver::default());
    let engine = engine_with_stub(StubPlugin::passing(observer.clone()));

    let yaml = r#"
name: unresolved
tests:
  - name: t
    steps:
      - name: call
        plugin: stub
        config: {who: "{{ nobody }}"}
"#;
    let run_id = engine.create_run(yaml, Vec::new(), None).await.unwrap();
    assert_eq!(
        engine.wait_for_run(&run_id).await.unwrap(),
        RunStatus::Failed
    );
    assert_eq!(observer.calls(), 0, "Execute never ran");

    let record = engine.get_run(&run_id).await.unwrap();
    let error = record.tests[0].steps[0].error.as_deref().unwrap();
    assert!(error.contains("nobody"), "error names the variable: {error}");
}
