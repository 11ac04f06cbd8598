//! Test: Stage order, activation conditions and best-effort stages

use crate::helpers::*;
use release_pipeline::core::{RunSettings, RunStatus, StageOutcome};

const BRANCHED_PIPELINE: &str = r#"
name: "shop"
variables:
  region: "eu-west-1"
stages:
  - name: Build
    kind: build
    steps:
      - name: "stamp"
        type: command
        run: "echo {{ version }}-{{ region }} > {out}/version.txt"
  - name: Quality
    kind: quality
    best_effort: true
    steps:
      - name: "lint"
        type: command
        run: "exit 3"
  - name: Deploy
    kind: deploy
    when:
      branch_matches: "^(main|release/.*)$"
    steps:
      - type: command
        run: "touch {out}/deployed"
  - name: Release
    kind: release
    when:
      all_of:
        - branch: main
        - flag: force_release
    steps:
      - type: command
        run: "touch {out}/released"
"#;

async fn branched_harness(dir: &std::path::Path) -> Harness {
    let yaml = BRANCHED_PIPELINE.replace("{out}", &dir.display().to_string());
    Harness::from_yaml(&yaml, FakeProbe::default()).await
}

/// Stages run in order; a failed best-effort stage only makes the run unstable
#[tokio::test]
async fn test_best_effort_failure_and_inactive_stage() {
    let dir = tempfile::tempdir().unwrap();
    let harness = branched_harness(dir.path()).await;

    let run = harness.run("1.4.0").await;

    assert_eq!(run.status(), RunStatus::Unstable);
    assert_eq!(run.status().exit_code(), 2);
    assert_eq!(
        outcomes(&run),
        vec![
            ("Build".to_string(), "Success".to_string()),
            ("Quality".to_string(), "Failure".to_string()),
            ("Deploy".to_string(), "Success".to_string()),
            ("Release".to_string(), "Skipped".to_string()),
        ]
    );
    assert!(run.warnings().iter().any(|w| w.contains("best-effort stage 'Quality' failed")));
    assert_eq!(
        run.stage("Release").unwrap().skip_reason.as_deref(),
        Some("activation condition not met")
    );

    let stamped = std::fs::read_to_string(dir.path().join("version.txt")).unwrap();
    assert_eq!(stamped.trim(), "1.4.0-eu-west-1");
    assert!(dir.path().join("deployed").exists());
    assert!(!dir.path().join("released").exists());

    // Inactive stages are reported as skipped without ever starting
    assert_eq!(
        harness.event_labels(),
        vec![
            "run-started",
            "started:Build",
            "finished:Build",
            "started:Quality",
            "finished:Quality",
            "started:Deploy",
            "finished:Deploy",
            "skipped:Release",
            "run-finished:Unstable",
        ]
    );
}

/// Activation predicates see the branch and run flags
#[tokio::test]
async fn test_conditions_follow_branch_and_flags() {
    let dir = tempfile::tempdir().unwrap();
    let harness = branched_harness(dir.path()).await;

    let run = harness
        .run_with(RunSettings {
            branch: Some("feature/login".to_string()),
            force_release: true,
            ..settings("1.4.1")
        })
        .await;
    assert_eq!(run.stage("Deploy").unwrap().outcome, StageOutcome::Skipped);
    assert_eq!(run.stage("Release").unwrap().outcome, StageOutcome::Skipped);
    assert!(!dir.path().join("deployed").exists());

    let run = harness
        .run_with(RunSettings {
            force_release: true,
            ..settings("1.4.2")
        })
        .await;
    assert_eq!(run.status(), RunStatus::Unstable);
    assert_eq!(run.stage("Deploy").unwrap().outcome, StageOutcome::Success);
    assert_eq!(run.stage("Release").unwrap().outcome, StageOutcome::Success);
    assert!(dir.path().join("released").exists());
}

/// A failing stage halts the run and every later stage is skipped
#[tokio::test]
async fn test_failure_halts_remaining_stages() {
    let dir = tempfile::tempdir().unwrap();
    let yaml = r#"
name: "shop"
stages:
  - name: Build
    kind: build
    steps:
      - type: command
        run: "echo compiling && exit 2"
  - name: Test
    kind: test
    steps:
      - type: command
        run: "touch {out}/tested"
  - name: Deploy
    kind: deploy
    steps:
      - type: command
        run: "touch {out}/deployed"
"#
    .replace("{out}", &dir.path().display().to_string());
    let harness = Harness::from_yaml(&yaml, FakeProbe::default()).await;

    let run = harness.run("1.0.0").await;

    assert_eq!(run.status(), RunStatus::Failure);
    assert_eq!(run.outcome_count(StageOutcome::Skipped), 2);
    assert_eq!(
        run.stage("Test").unwrap().skip_reason.as_deref(),
        Some("stage 'Build' failed")
    );
    assert!(!dir.path().join("tested").exists());
    assert!(!dir.path().join("deployed").exists());
}
