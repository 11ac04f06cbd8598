//! Test: The overall pipeline timeout interrupts the stage in flight

use crate::helpers::*;
use release_pipeline::core::{ErrorKind, RunStatus, StageOutcome};
use std::time::{Duration, Instant};

const SLOW_TEST_PIPELINE: &str = r#"
name: "shop"
timeout_secs: 1
builder:
  command: "docker build -t registry/shop:{{ version }} ."
runtime:
  start: "docker run -d -p {{ port }}:8000 {{ artifact }}"
  stop: "docker rm -f {{ instance }}"
slots:
  test:
    health_url: "http://test:{port}/health"
    port: 9000
  production:
    health_url: "http://prod:{port}/health"
    port: 8080
stages:
  - name: Build
    kind: build
    steps:
      - type: build
  - name: Test
    kind: test
    steps:
      - name: "soak"
        type: command
        run: "sleep 30"
  - name: Release
    kind: release
    steps:
      - type: release
  - name: Monitoring
    kind: monitoring
    steps:
      - type: health_check
        slot: production
"#;

#[tokio::test]
async fn test_run_timeout_fails_in_flight_stage_and_skips_the_rest() {
    let probe = FakeProbe::default()
        .script(TEST_URL, &[true])
        .script(BLUE_URL, &[true]);
    let harness = Harness::from_yaml(SLOW_TEST_PIPELINE, probe).await;

    let started = Instant::now();
    let run = harness.run("1.0.0").await;

    // The soak command is killed, not waited for
    assert!(started.elapsed() < Duration::from_secs(10));
    assert_eq!(run.status(), RunStatus::Failure);

    assert_eq!(run.stage("Build").unwrap().outcome, StageOutcome::Success);
    let test = run.stage("Test").unwrap();
    assert_eq!(test.outcome, StageOutcome::Failure);
    assert_eq!(test.error.as_ref().unwrap().kind, ErrorKind::Timeout);
    assert!(test.warnings.iter().any(|w| w.contains("pipeline timed out")));

    assert_eq!(run.stage("Release").unwrap().outcome, StageOutcome::Skipped);
    assert_eq!(run.stage("Monitoring").unwrap().outcome, StageOutcome::Skipped);
    assert!(harness.runtime.started().is_empty());
    assert!(run.releases().is_empty());
    assert!(run.finished_at().is_some());

    assert_eq!(
        harness.event_labels(),
        vec![
            "run-started",
            "started:Build",
            "finished:Build",
            "started:Test",
            "finished:Test",
            "skipped:Release",
            "skipped:Monitoring",
            "run-finished:Failure",
        ]
    );
}
