//! Test: Quality and security gates decide whether a run may release

use crate::helpers::*;
use release_pipeline::core::{
    Category, ErrorKind, GateDecision, RunSettings, RunStatus, SecurityLevel, Severity, StageOutcome,
};
use std::path::Path;

const GATED_PIPELINE: &str = r#"
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
gates:
  security:
    thresholds:
      code_security_issue:
        high: 0
        medium: { max: 5, enforcement: soft }
stages:
  - name: Build
    kind: build
    steps:
      - type: build
  - name: Security
    kind: security
    steps:
      - name: "bandit"
        type: command
        run: "true"
    reports:
      - category: code_security_issue
        format: bandit
        path: "{report}"
    gate: security
  - name: Deploy
    kind: deploy
    steps:
      - type: deploy
  - name: Release
    kind: release
    steps:
      - type: release
"#;

fn healthy_probe() -> FakeProbe {
    FakeProbe::default()
        .script(TEST_URL, &[true])
        .script(BLUE_URL, &[true])
}

async fn gated_harness(dir: &Path, high: usize, medium: usize) -> Harness {
    let report = dir.join("bandit.json");
    std::fs::write(&report, bandit_report(high, medium)).unwrap();
    let yaml = GATED_PIPELINE.replace("{report}", &report.display().to_string());
    Harness::from_yaml(&yaml, healthy_probe()).await
}

/// Medium findings under the limit and no High findings pass the gate
#[tokio::test]
async fn test_gate_passes_under_thresholds() {
    let dir = tempfile::tempdir().unwrap();
    let harness = gated_harness(dir.path(), 0, 3).await;

    let run = harness.run("1.0.0").await;

    assert_eq!(run.status(), RunStatus::Success);
    let security = run.stage("Security").unwrap();
    assert_eq!(security.outcome, StageOutcome::Success);
    let gate = security.gate.as_ref().unwrap();
    assert_eq!(gate.decision, GateDecision::Pass);
    assert!(gate.breaches.is_empty());
    assert_eq!(security.findings.len(), 3);

    let counts = security.counts.as_ref().unwrap();
    let security_counts = counts.for_category(Category::CodeSecurityIssue);
    assert_eq!(security_counts.get(Severity::High), 0);
    assert_eq!(security_counts.get(Severity::Medium), 3);

    assert_eq!(run.releases().len(), 1);
}

/// Any High finding breaches a zero limit, fails the run and nothing is released
#[tokio::test]
async fn test_gate_fails_on_high_findings() {
    let dir = tempfile::tempdir().unwrap();
    let harness = gated_harness(dir.path(), 2, 0).await;

    let run = harness.run("1.0.0").await;

    assert_eq!(run.status(), RunStatus::Failure);
    assert_eq!(run.status().exit_code(), 1);
    let security = run.stage("Security").unwrap();
    assert_eq!(security.outcome, StageOutcome::Failure);
    assert_eq!(security.error.as_ref().unwrap().kind, ErrorKind::GateFailure);
    assert_eq!(security.gate.as_ref().unwrap().decision, GateDecision::Fail);

    assert_eq!(
        outcomes(&run),
        vec![
            ("Build".to_string(), "Success".to_string()),
            ("Security".to_string(), "Failure".to_string()),
            ("Deploy".to_string(), "Skipped".to_string()),
            ("Release".to_string(), "Skipped".to_string()),
        ]
    );
    assert!(harness.runtime.started().is_empty());
    assert!(run.releases().is_empty());
}

/// A soft breach only marks the run unstable; the release still happens
#[tokio::test]
async fn test_soft_breach_makes_run_unstable() {
    let dir = tempfile::tempdir().unwrap();
    let harness = gated_harness(dir.path(), 0, 6).await;

    let run = harness.run("1.0.0").await;

    assert_eq!(run.status(), RunStatus::Unstable);
    assert_eq!(run.status().exit_code(), 2);
    assert_eq!(run.stage("Security").unwrap().outcome, StageOutcome::Unstable);
    assert_eq!(run.stage("Release").unwrap().outcome, StageOutcome::Success);
    assert_eq!(run.releases().len(), 1);
}

/// The strict security level turns the same soft breach into a failure
#[tokio::test]
async fn test_strict_level_fails_soft_breach() {
    let dir = tempfile::tempdir().unwrap();
    let harness = gated_harness(dir.path(), 0, 6).await;

    let run = harness
        .run_with(RunSettings {
            security_level: SecurityLevel::Strict,
            ..settings("1.0.0")
        })
        .await;

    assert_eq!(run.status(), RunStatus::Failure);
    let security = run.stage("Security").unwrap();
    assert_eq!(security.error.as_ref().unwrap().kind, ErrorKind::GateFailure);
    assert!(harness.runtime.started().is_empty());
}

/// A missing report counts as zero findings and leaves a warning on the stage
#[tokio::test]
async fn test_missing_report_is_a_warning() {
    let dir = tempfile::tempdir().unwrap();
    let missing = dir.path().join("never-written.json");
    let yaml = GATED_PIPELINE.replace("{report}", &missing.display().to_string());
    let harness = Harness::from_yaml(&yaml, healthy_probe()).await;

    let run = harness.run("1.0.0").await;

    assert_eq!(run.status(), RunStatus::Success);
    let security = run.stage("Security").unwrap();
    assert_eq!(security.outcome, StageOutcome::Success);
    assert!(security.findings.is_empty());
    assert!(security.warnings.iter().any(|w| w.contains("report not found")));
}
