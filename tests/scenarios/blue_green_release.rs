//! Test: Blue-green releases through the whole pipeline

use crate::helpers::*;
use release_pipeline::core::slot::{ReleaseResult, ReleaseStrategy};
use release_pipeline::core::{ErrorKind, ReleasePhase, RunStatus, StageOutcome};

const RELEASE_PIPELINE: &str = r#"
name: "shop"
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
    standby_port: 8081
stages:
  - name: Build
    kind: build
    steps:
      - type: build
  - name: Deploy
    kind: deploy
    steps:
      - type: deploy
  - name: Release
    kind: release
    steps:
      - type: release
    post:
      failure:
        - type: notify
          subject: "Release {{ version }} rolled back"
          body: "production still serves the previous version"
          recipient: "ops@example.com"
  - name: Monitoring
    kind: monitoring
    steps:
      - type: health_check
        slot: production
"#;

fn phases(transitions: &[release_pipeline::core::slot::Transition]) -> Vec<String> {
    transitions.iter().map(|t| t.to.to_string()).collect()
}

/// First deployment goes live once production answers on the second attempt
#[tokio::test]
async fn test_first_deployment_goes_live() {
    let probe = FakeProbe::default()
        .script(TEST_URL, &[true])
        .script(BLUE_URL, &[false, true]);
    let harness = Harness::from_yaml(RELEASE_PIPELINE, probe).await;
    assert_eq!(harness.release_manager().phase().await, ReleasePhase::NoProduction);

    let run = harness.run("1.0.0").await;

    assert_eq!(run.status(), RunStatus::Success);
    assert_eq!(run.status().exit_code(), 0);
    assert_eq!(harness.builder.builds(), vec!["1.0.0"]);
    assert_eq!(
        harness.release_manager().phase().await,
        ReleasePhase::Live {
            version: "1.0.0".to_string()
        }
    );

    assert_eq!(run.releases().len(), 1);
    let record = &run.releases()[0];
    assert_eq!(record.strategy, ReleaseStrategy::FirstDeployment);
    assert_eq!(record.strategy.to_string(), "first-deployment");
    assert_eq!(record.result, ReleaseResult::Live);
    assert!(record.previous_version.is_none());
    assert_eq!(
        phases(&record.transitions),
        vec!["Staging(1.0.0)", "HealthChecking(1.0.0)", "Live(1.0.0)"]
    );
    assert_eq!(
        record.transitions.last().unwrap().note.as_deref(),
        Some("healthy after 2 attempt(s)")
    );

    // The test instance is released by run cleanup, production keeps running
    assert_eq!(harness.runtime.stopped(), vec!["test-1.0.0-0"]);
    assert_eq!(harness.runtime.started_in("production").len(), 1);
}

/// A healthy second version replaces the first and the old instance is stopped
#[tokio::test]
async fn test_blue_green_swap() {
    let probe = FakeProbe::default()
        .script(TEST_URL, &[true])
        .script(BLUE_URL, &[true])
        .script(GREEN_URL, &[true]);
    let harness = Harness::from_yaml(RELEASE_PIPELINE, probe).await;

    assert_eq!(harness.run("1.0.0").await.status(), RunStatus::Success);
    let run = harness.run("1.1.0").await;

    assert_eq!(run.status(), RunStatus::Success);
    let record = &run.releases()[0];
    assert_eq!(record.strategy, ReleaseStrategy::BlueGreen);
    assert_eq!(record.previous_version.as_deref(), Some("1.0.0"));
    assert_eq!(harness.release_manager().current_version().await.as_deref(), Some("1.1.0"));

    let production = harness.runtime.started_in("production");
    assert_eq!(production.len(), 2);
    assert_eq!(production[0].port, 8080);
    assert_eq!(production[1].port, 8081);
    assert!(harness.runtime.stopped().contains(&production[0].id));
    assert!(!harness.runtime.stopped().contains(&production[1].id));
    assert_eq!(harness.release_manager().history().await.len(), 2);
}

/// An unhealthy new version is rolled back and the old one stays live
#[tokio::test]
async fn test_unhealthy_release_rolls_back_to_previous_version() {
    let probe = FakeProbe::default()
        .script(TEST_URL, &[true])
        .script(BLUE_URL, &[true])
        .script(GREEN_URL, &[false]);
    let harness = Harness::from_yaml(RELEASE_PIPELINE, probe).await;

    assert_eq!(harness.run("1.0.0").await.status(), RunStatus::Success);
    let run = harness.run("2.0.0").await;

    assert_eq!(run.status(), RunStatus::Failure);
    assert_eq!(harness.probe.calls(GREEN_URL), 3);
    assert_eq!(
        harness.release_manager().phase().await,
        ReleasePhase::Live {
            version: "1.0.0".to_string()
        }
    );

    let release = run.stage("Release").unwrap();
    assert_eq!(release.outcome, StageOutcome::Failure);
    assert_eq!(release.error.as_ref().unwrap().kind, ErrorKind::HealthCheckTimeout);
    assert_eq!(run.stage("Monitoring").unwrap().outcome, StageOutcome::Skipped);

    // The failed attempt is still part of the run's release history
    assert_eq!(run.releases().len(), 1);
    let record = &run.releases()[0];
    assert_eq!(record.result, ReleaseResult::RolledBack);
    assert_eq!(record.previous_version.as_deref(), Some("1.0.0"));
    assert_eq!(
        phases(&record.transitions),
        vec![
            "Staging(2.0.0)",
            "HealthChecking(2.0.0)",
            "RollingBack(2.0.0)",
            "Live(1.0.0)"
        ]
    );

    // Only the incoming instance was stopped in production
    let production = harness.runtime.started_in("production");
    assert!(!harness.runtime.stopped().contains(&production[0].id));
    assert!(harness.runtime.stopped().contains(&production[1].id));

    let sent = harness.notifier.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].subject, "Release 2.0.0 rolled back");
    assert_eq!(sent[0].recipient.as_deref(), Some("ops@example.com"));
}

/// A test deployment that never becomes healthy stops the run before release
#[tokio::test]
async fn test_unhealthy_test_deployment_blocks_release() {
    let probe = FakeProbe::default().script(TEST_URL, &[false]);
    let harness = Harness::from_yaml(RELEASE_PIPELINE, probe).await;

    let run = harness.run("1.0.0").await;

    assert_eq!(run.status(), RunStatus::Failure);
    assert_eq!(run.stage("Deploy").unwrap().outcome, StageOutcome::Failure);
    assert_eq!(run.stage("Release").unwrap().outcome, StageOutcome::Skipped);
    assert!(run.releases().is_empty());
    assert!(harness.runtime.started_in("production").is_empty());
    assert_eq!(harness.release_manager().phase().await, ReleasePhase::NoProduction);
    // The failed test instance is still cleaned up
    assert_eq!(harness.runtime.stopped(), vec!["test-1.0.0-0"]);
}
