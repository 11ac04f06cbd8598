//! Stage executor - runs one stage: steps, branches, reports, gate, hooks

use crate::core::{
    context::{abort_pair, AbortSignal, RunContext, SecurityLevel},
    error::{PipelineError, StageError},
    policy::{GateDecision, GatePolicy},
    stage::{StageDefinition, StageKind, StepDefinition},
    state::{BranchResult, StageOutcome, StageResult},
};
use crate::execution::actions::{SequenceOutcome, StepRunner};
use crate::findings::{self, evaluate_gate, ParserRegistry};
use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio::time::{timeout, Duration};
use tracing::{debug, error, info, warn};

/// Runs stages against a shared step runner
pub struct StageExecutor {
    runner: Arc<StepRunner>,
    parsers: ParserRegistry,
    gates: BTreeMap<String, GatePolicy>,
    hook_timeout: Duration,
}

/// Steps and branches of a stage, before reports and hooks
struct StageBody {
    sequence: SequenceOutcome,
    branches: Vec<BranchResult>,
}

impl StageExecutor {
    pub fn new(runner: Arc<StepRunner>) -> Self {
        Self {
            runner,
            parsers: ParserRegistry::default(),
            gates: BTreeMap::new(),
            hook_timeout: Duration::from_secs(300),
        }
    }

    pub fn with_parsers(mut self, parsers: ParserRegistry) -> Self {
        self.parsers = parsers;
        self
    }

    pub fn with_gates(mut self, gates: BTreeMap<String, GatePolicy>) -> Self {
        self.gates = gates;
        self
    }

    pub fn with_hook_timeout(mut self, hook_timeout: Duration) -> Self {
        self.hook_timeout = hook_timeout;
        self
    }

    /// Execute a stage and return its result
    pub async fn run(&self, stage: &StageDefinition, ctx: &Arc<RunContext>) -> StageResult {
        if !stage.when.evaluate(ctx) {
            info!(stage = %stage.name, "activation condition not met, skipping");
            return StageResult::skipped(&stage.name, stage.kind, "activation condition not met");
        }

        info!(stage = %stage.name, kind = %stage.kind, "executing stage");
        let started_at = Utc::now();

        // Stage-level abort, raised on stage timeout or run abort
        let (stage_abort, stage_signal) = abort_pair();
        let run_signal = ctx.abort_signal();

        let body = self.run_body(stage, ctx, &stage_signal);
        tokio::pin!(body);

        let interrupted = tokio::select! {
            biased;
            done = &mut body => Ok(done),
            _ = run_signal.cancelled() => Err(PipelineError::Aborted(format!("stage '{}' aborted", stage.name))),
            _ = tokio::time::sleep(stage.timeout) => Err(PipelineError::Timeout(stage.timeout.as_secs())),
        };

        let (body, interruption) = match interrupted {
            Ok(done) => (done, None),
            Err(e) => {
                warn!(stage = %stage.name, error = %e, "interrupting stage");
                stage_abort.abort();
                (body.await, Some(e))
            }
        };

        let StageBody { sequence, branches } = body;
        let mut outcome = sequence.outcome;
        let mut error = sequence.error;
        let mut artifacts = sequence.artifacts;
        let mut warnings = sequence.warnings;

        if let Some(e) = interruption {
            outcome = StageOutcome::Failure;
            error = Some(e);
        }

        // Reports are read even after a failure
        let aggregation = findings::aggregate(&stage.reports, &self.parsers);
        warnings.extend(aggregation.warnings.iter().cloned());

        let gate = match &stage.gate {
            Some(name) => match self.gates.get(name) {
                Some(policy) => {
                    let policy = if stage.kind == StageKind::Security
                        && ctx.security_level == SecurityLevel::Strict
                    {
                        policy.escalated()
                    } else {
                        policy.clone()
                    };
                    let evaluation = evaluate_gate(name, &aggregation.counts, &policy);
                    info!(stage = %stage.name, "{}", evaluation.summary());

                    match evaluation.decision {
                        GateDecision::Pass => {}
                        GateDecision::Unstable => {
                            outcome = outcome.worst(StageOutcome::Unstable);
                            warnings.push(evaluation.summary());
                        }
                        GateDecision::Fail => {
                            outcome = StageOutcome::Failure;
                            if error.is_none() {
                                error = Some(PipelineError::GateFailure {
                                    gate: name.clone(),
                                    message: evaluation
                                        .breaches
                                        .iter()
                                        .map(|b| b.to_string())
                                        .collect::<Vec<_>>()
                                        .join("; "),
                                });
                            }
                        }
                    }
                    Some(evaluation)
                }
                None => {
                    outcome = StageOutcome::Failure;
                    if error.is_none() {
                        error = Some(PipelineError::Configuration(format!("unknown gate '{}'", name)));
                    }
                    None
                }
            },
            None => None,
        };

        let (hook_artifacts, hook_warnings) = self.run_hooks(stage, outcome, ctx).await;
        artifacts.extend(hook_artifacts);
        warnings.extend(hook_warnings);

        match (&outcome, &error) {
            (StageOutcome::Failure, Some(e)) => error!(stage = %stage.name, error = %e, "stage failed"),
            _ => info!(stage = %stage.name, ?outcome, "stage finished"),
        }

        let counts = if stage.reports.is_empty() {
            None
        } else {
            Some(aggregation.counts)
        };

        StageResult {
            name: stage.name.clone(),
            kind: stage.kind,
            outcome,
            started_at,
            finished_at: Utc::now(),
            artifacts,
            error: error.as_ref().map(StageError::from),
            warnings,
            branches,
            findings: aggregation.findings,
            counts,
            gate,
            skip_reason: None,
        }
    }

    async fn run_body(&self, stage: &StageDefinition, ctx: &Arc<RunContext>, abort: &AbortSignal) -> StageBody {
        let mut sequence = self.runner.run_sequence(&stage.steps, ctx, abort).await;
        if sequence.failed() || stage.branches.is_empty() {
            return StageBody {
                sequence,
                branches: Vec::new(),
            };
        }

        let mut tasks = JoinSet::new();
        for (index, branch) in stage.branches.iter().enumerate() {
            let runner = self.runner.clone();
            let steps = branch.steps.clone();
            let ctx = ctx.clone();
            let abort = abort.clone();
            debug!(stage = %stage.name, branch = %branch.name, "starting branch");
            tasks.spawn(async move { (index, runner.run_sequence(&steps, &ctx, &abort).await) });
        }

        let mut finished: Vec<Option<SequenceOutcome>> = vec![None; stage.branches.len()];
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, result)) => finished[index] = Some(result),
                Err(e) => error!(stage = %stage.name, error = %e, "branch task panicked"),
            }
        }

        let mut branches = Vec::with_capacity(stage.branches.len());
        for (definition, result) in stage.branches.iter().zip(finished) {
            let result = result.unwrap_or_else(|| SequenceOutcome {
                outcome: StageOutcome::Failure,
                error: Some(PipelineError::step(&definition.name, "branch task panicked")),
                ..SequenceOutcome::default()
            });

            sequence.outcome = sequence.outcome.worst(result.outcome);
            if result.failed() && sequence.error.is_none() {
                sequence.error = result.error.clone();
            }
            sequence.artifacts.extend(result.artifacts);
            sequence.warnings.extend(
                result
                    .warnings
                    .into_iter()
                    .map(|w| format!("[{}] {}", definition.name, w)),
            );

            branches.push(BranchResult {
                name: definition.name.clone(),
                outcome: result.outcome,
                error: result.error.as_ref().map(StageError::from),
            });
        }

        StageBody { sequence, branches }
    }

    /// Hooks never change the outcome; failures come back as warnings
    async fn run_hooks(
        &self,
        stage: &StageDefinition,
        outcome: StageOutcome,
        ctx: &RunContext,
    ) -> (Vec<String>, Vec<String>) {
        let mut artifacts = Vec::new();
        let mut warnings = Vec::new();
        let hooks: Vec<&StepDefinition> = stage.hooks.for_outcome(outcome);

        // Hooks outlive a stage interruption but not the run deadline
        let run_signal = ctx.abort_signal();

        for hook in hooks {
            debug!(stage = %stage.name, hook = %hook.name, "running post hook");
            match timeout(self.hook_timeout, self.runner.run_step(hook, ctx, &run_signal)).await {
                Ok(Ok(output)) => {
                    artifacts.extend(output.artifacts);
                    warnings.extend(output.warnings);
                }
                Ok(Err(e)) => {
                    warn!(stage = %stage.name, hook = %hook.name, error = %e, "post hook failed");
                    warnings.push(format!("post hook '{}' failed: {}", hook.name, e));
                }
                Err(_) => {
                    warn!(stage = %stage.name, hook = %hook.name, "post hook timed out");
                    warnings.push(format!(
                        "post hook '{}' timed out after {}s",
                        hook.name,
                        self.hook_timeout.as_secs()
                    ));
                }
            }
        }

        (artifacts, warnings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{
        condition::ActivationPredicate,
        context::RunSettings,
        error::ErrorKind,
        finding::{Category, Severity},
        policy::Threshold,
        stage::{FailurePolicy, PostHooks, ScannerOutput, StepAction},
    };
    use std::collections::BTreeMap as Map;

    fn ctx(level: SecurityLevel) -> Arc<RunContext> {
        Arc::new(RunContext::new(RunSettings {
            pipeline: "shop".to_string(),
            version: "1.0.0".to_string(),
            security_level: level,
            ..RunSettings::default()
        }))
    }

    fn sh(name: &str, run: &str) -> StepDefinition {
        StepDefinition::new(
            name,
            StepAction::Command {
                run: run.to_string(),
                env: Map::new(),
                workdir: None,
            },
        )
    }

    fn executor() -> StageExecutor {
        StageExecutor::new(Arc::new(StepRunner::new()))
    }

    fn bandit_report(high: usize, medium: usize) -> ScannerOutput {
        let mut results = Vec::new();
        for i in 0..high {
            results.push(format!(
                r#"{{"filename": "app.py", "line_number": {}, "issue_severity": "HIGH", "issue_text": "high {}", "test_id": "B602"}}"#,
                i + 1,
                i
            ));
        }
        for i in 0..medium {
            results.push(format!(
                r#"{{"filename": "app.py", "line_number": {}, "issue_severity": "MEDIUM", "issue_text": "medium {}", "test_id": "B105"}}"#,
                100 + i,
                i
            ));
        }
        ScannerOutput::inline(
            Category::CodeSecurityIssue,
            "bandit",
            format!(r#"{{"results": [{}]}}"#, results.join(",")),
        )
    }

    fn security_gate() -> BTreeMap<String, GatePolicy> {
        BTreeMap::from([(
            "security".to_string(),
            GatePolicy::default()
                .with_threshold(Category::CodeSecurityIssue, Severity::High, Threshold::hard(0))
                .with_threshold(Category::CodeSecurityIssue, Severity::Medium, Threshold::soft(5))
                .with_threshold(Category::CodeSecurityIssue, Severity::Low, Threshold::soft(2)),
        )])
    }

    #[tokio::test]
    async fn test_inactive_stage_is_skipped_without_hooks() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("hook");
        let mut stage = StageDefinition::new("docs", StageKind::Test)
            .with_step(sh("build docs", "true"))
            .when(ActivationPredicate::Flag("deploy_docs".to_string()));
        stage.hooks = PostHooks {
            always: vec![sh("mark", &format!("touch {}", marker.display()))],
            ..PostHooks::default()
        };

        let result = executor().run(&stage, &ctx(SecurityLevel::Standard)).await;
        assert_eq!(result.outcome, StageOutcome::Skipped);
        assert!(result.skip_reason.is_some());
        assert!(!marker.exists());
    }

    #[tokio::test]
    async fn test_branches_take_worst_outcome() {
        let stage = StageDefinition::new("tests", StageKind::Test)
            .with_branch("unit", vec![sh("unit", "true")])
            .with_branch("lint", vec![sh("lint", "exit 1").on_failure(FailurePolicy::Unstable)])
            .with_branch("integration", vec![sh("integration", "true")]);

        let result = executor().run(&stage, &ctx(SecurityLevel::Standard)).await;
        assert_eq!(result.outcome, StageOutcome::Unstable);
        assert_eq!(result.branches.len(), 3);
        assert_eq!(result.branches[1].name, "lint");
        assert_eq!(result.branches[1].outcome, StageOutcome::Unstable);
        assert!(result.warnings.iter().any(|w| w.starts_with("[lint]")));
    }

    #[tokio::test]
    async fn test_failed_branch_fails_stage_after_all_branches_finish() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("slow-done");
        let stage = StageDefinition::new("tests", StageKind::Test)
            .with_branch("broken", vec![sh("broken", "exit 3")])
            .with_branch(
                "slow",
                vec![sh("slow", &format!("sleep 0.3 && touch {}", marker.display()))],
            );

        let result = executor().run(&stage, &ctx(SecurityLevel::Standard)).await;
        assert_eq!(result.outcome, StageOutcome::Failure);
        assert_eq!(result.error.as_ref().unwrap().kind, ErrorKind::StepFailure);
        assert!(marker.exists());
    }

    #[tokio::test]
    async fn test_branches_do_not_start_after_failed_steps() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("branch");
        let stage = StageDefinition::new("tests", StageKind::Test)
            .with_step(sh("setup", "exit 1"))
            .with_branch("unit", vec![sh("unit", &format!("touch {}", marker.display()))]);

        let result = executor().run(&stage, &ctx(SecurityLevel::Standard)).await;
        assert_eq!(result.outcome, StageOutcome::Failure);
        assert!(result.branches.is_empty());
        assert!(!marker.exists());
    }

    #[tokio::test]
    async fn test_gate_pass_with_medium_findings_under_limit() {
        let stage = StageDefinition::new("security", StageKind::Security)
            .with_step(sh("scan", "true"))
            .with_report(bandit_report(0, 3))
            .with_gate("security");

        let result = executor()
            .with_gates(security_gate())
            .run(&stage, &ctx(SecurityLevel::Standard))
            .await;
        assert_eq!(result.outcome, StageOutcome::Success);
        assert_eq!(result.gate.as_ref().unwrap().decision, GateDecision::Pass);
        assert_eq!(result.findings.len(), 3);
    }

    #[tokio::test]
    async fn test_gate_fail_on_high_findings() {
        let stage = StageDefinition::new("security", StageKind::Security)
            .with_step(sh("scan", "true"))
            .with_report(bandit_report(2, 0))
            .with_gate("security");

        let result = executor()
            .with_gates(security_gate())
            .run(&stage, &ctx(SecurityLevel::Standard))
            .await;
        assert_eq!(result.outcome, StageOutcome::Failure);
        assert_eq!(result.error.as_ref().unwrap().kind, ErrorKind::GateFailure);
        assert_eq!(result.findings.len(), 2);
    }

    #[tokio::test]
    async fn test_strict_level_escalates_soft_breach() {
        let stage = StageDefinition::new("security", StageKind::Security)
            .with_step(sh("scan", "true"))
            .with_report(bandit_report(0, 6))
            .with_gate("security");

        let standard = executor()
            .with_gates(security_gate())
            .run(&stage, &ctx(SecurityLevel::Standard))
            .await;
        assert_eq!(standard.outcome, StageOutcome::Unstable);

        let strict = executor()
            .with_gates(security_gate())
            .run(&stage, &ctx(SecurityLevel::Strict))
            .await;
        assert_eq!(strict.outcome, StageOutcome::Failure);
    }

    #[tokio::test]
    async fn test_reports_read_after_step_failure() {
        let stage = StageDefinition::new("security", StageKind::Security)
            .with_step(sh("scan", "exit 1"))
            .with_report(bandit_report(1, 0))
            .with_gate("security");

        let result = executor()
            .with_gates(security_gate())
            .run(&stage, &ctx(SecurityLevel::Standard))
            .await;
        assert_eq!(result.outcome, StageOutcome::Failure);
        assert_eq!(result.error.as_ref().unwrap().kind, ErrorKind::StepFailure);
        assert_eq!(result.findings.len(), 1);
    }

    #[tokio::test]
    async fn test_hook_failure_does_not_change_outcome() {
        let mut stage = StageDefinition::new("build", StageKind::Build).with_step(sh("compile", "true"));
        stage.hooks = PostHooks {
            success: vec![sh("announce", "exit 9")],
            always: vec![sh("cleanup", "true")],
            ..PostHooks::default()
        };

        let result = executor().run(&stage, &ctx(SecurityLevel::Standard)).await;
        assert_eq!(result.outcome, StageOutcome::Success);
        assert_eq!(result.warnings.len(), 1);
        assert!(result.warnings[0].contains("announce"));
    }

    #[tokio::test]
    async fn test_failure_hooks_run_on_failure() {
        let dir = tempfile::tempdir().unwrap();
        let failure_marker = dir.path().join("failure");
        let success_marker = dir.path().join("success");
        let mut stage = StageDefinition::new("build", StageKind::Build).with_step(sh("compile", "exit 1"));
        stage.hooks = PostHooks {
            success: vec![sh("ok", &format!("touch {}", success_marker.display()))],
            failure: vec![sh("page", &format!("touch {}", failure_marker.display()))],
            ..PostHooks::default()
        };

        let result = executor().run(&stage, &ctx(SecurityLevel::Standard)).await;
        assert_eq!(result.outcome, StageOutcome::Failure);
        assert!(failure_marker.exists());
        assert!(!success_marker.exists());
    }

    #[tokio::test]
    async fn test_stage_timeout_still_runs_failure_hooks() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("paged");
        let mut stage = StageDefinition::new("test", StageKind::Test)
            .with_step(sh("hang", "sleep 30"))
            .with_timeout(Duration::from_millis(200));
        stage.hooks = PostHooks {
            failure: vec![sh("page", &format!("sleep 0.2 && touch {}", marker.display()))],
            ..PostHooks::default()
        };

        let result = executor().run(&stage, &ctx(SecurityLevel::Standard)).await;
        assert_eq!(result.error.as_ref().unwrap().kind, ErrorKind::Timeout);
        assert!(marker.exists());
        assert!(!result.warnings.iter().any(|w| w.contains("post hook")));
    }

    #[tokio::test]
    async fn test_stage_timeout_interrupts_steps() {
        let stage = StageDefinition::new("test", StageKind::Test)
            .with_step(sh("hang", "sleep 30"))
            .with_timeout(Duration::from_millis(200));

        let started = std::time::Instant::now();
        let result = executor().run(&stage, &ctx(SecurityLevel::Standard)).await;
        assert_eq!(result.outcome, StageOutcome::Failure);
        assert_eq!(result.error.as_ref().unwrap().kind, ErrorKind::Timeout);
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_run_abort_interrupts_stage() {
        let context = ctx(SecurityLevel::Standard);
        let stage = StageDefinition::new("test", StageKind::Test)
            .with_branch("a", vec![sh("a", "sleep 30")])
            .with_branch("b", vec![sh("b", "sleep 30")]);

        let handle = context.abort_handle();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            handle.abort();
        });

        let result = executor().run(&stage, &context).await;
        assert_eq!(result.outcome, StageOutcome::Failure);
        assert_eq!(result.error.as_ref().unwrap().kind, ErrorKind::Aborted);
        assert!(result.branches.iter().all(|b| b.outcome == StageOutcome::Failure));
    }
}
