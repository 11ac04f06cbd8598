//! Execution state models

use crate::core::{
    error::StageError,
    finding::{CategoryCounts, Finding},
    policy::GateEvaluation,
    slot::ReleaseRecord,
    stage::StageKind,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

/// Overall pipeline run status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunStatus {
    /// Run has not started
    Pending,
    /// Run is in progress
    Running,
    Success,
    Failure,
    /// Run finished but something degraded it
    Unstable,
}

impl RunStatus {
    /// Process exit code for this status
    pub fn exit_code(&self) -> i32 {
        match self {
            RunStatus::Success => 0,
            RunStatus::Unstable => 2,
            _ => 1,
        }
    }
}

/// Terminal outcome of a stage or branch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StageOutcome {
    Success,
    Unstable,
    Failure,
    Skipped,
}

impl StageOutcome {
    fn rank(&self) -> u8 {
        match self {
            StageOutcome::Skipped => 0,
            StageOutcome::Success => 1,
            StageOutcome::Unstable => 2,
            StageOutcome::Failure => 3,
        }
    }

    /// Worst of two outcomes (Failure > Unstable > Success)
    pub fn worst(self, other: StageOutcome) -> StageOutcome {
        if other.rank() > self.rank() {
            other
        } else {
            self
        }
    }
}

/// Result of one parallel branch inside a stage
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BranchResult {
    pub name: String,
    pub outcome: StageOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<StageError>,
}

/// Result of a single stage. Appended once to the run, never mutated after.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageResult {
    pub name: String,
    pub kind: StageKind,
    pub outcome: StageOutcome,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// Paths or identifiers captured by the stage
    #[serde(default)]
    pub artifacts: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<StageError>,
    #[serde(default)]
    pub warnings: Vec<String>,
    #[serde(default)]
    pub branches: Vec<BranchResult>,
    #[serde(default)]
    pub findings: Vec<Finding>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub counts: Option<CategoryCounts>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gate: Option<GateEvaluation>,
    /// Why the stage was skipped
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_reason: Option<String>,
}

impl StageResult {
    pub fn skipped(name: impl Into<String>, kind: StageKind, reason: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            name: name.into(),
            kind,
            outcome: StageOutcome::Skipped,
            started_at: now,
            finished_at: now,
            artifacts: Vec::new(),
            error: None,
            warnings: Vec::new(),
            branches: Vec::new(),
            findings: Vec::new(),
            counts: None,
            gate: None,
            skip_reason: Some(reason.into()),
        }
    }
}

/// One execution of the pipeline
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineRun {
    run_id: Uuid,
    pipeline: String,
    version: String,
    status: RunStatus,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
    stages: Vec<StageResult>,
    releases: Vec<ReleaseRecord>,
    warnings: Vec<String>,
}

impl PipelineRun {
    pub fn new(run_id: Uuid, pipeline: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            run_id,
            pipeline: pipeline.into(),
            version: version.into(),
            status: RunStatus::Pending,
            started_at: None,
            finished_at: None,
            stages: Vec::new(),
            releases: Vec::new(),
            warnings: Vec::new(),
        }
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn pipeline(&self) -> &str {
        &self.pipeline
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn status(&self) -> RunStatus {
        self.status
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at
    }

    pub fn finished_at(&self) -> Option<DateTime<Utc>> {
        self.finished_at
    }

    pub fn stages(&self) -> &[StageResult] {
        &self.stages
    }

    pub fn stage(&self, name: &str) -> Option<&StageResult> {
        self.stages.iter().find(|s| s.name == name)
    }

    pub fn releases(&self) -> &[ReleaseRecord] {
        &self.releases
    }

    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    /// Mark run as started
    pub fn start(&mut self) {
        if self.refuse_if_terminal("start") {
            return;
        }
        self.status = RunStatus::Running;
        self.started_at = Some(Utc::now());
    }

    pub fn record_stage(&mut self, result: StageResult) {
        if self.refuse_if_terminal("record a stage on") {
            return;
        }
        self.stages.push(result);
    }

    pub fn record_release(&mut self, record: ReleaseRecord) {
        if self.refuse_if_terminal("record a release on") {
            return;
        }
        self.releases.push(record);
    }

    pub fn add_warning(&mut self, warning: impl Into<String>) {
        if self.refuse_if_terminal("add a warning to") {
            return;
        }
        self.warnings.push(warning.into());
    }

    /// Degrade a running run to unstable (never upgrades a failure)
    pub fn mark_unstable(&mut self) {
        if self.status == RunStatus::Running {
            self.status = RunStatus::Unstable;
        }
    }

    /// Whether the outcome so far is degraded
    pub fn is_unstable(&self) -> bool {
        self.status == RunStatus::Unstable
    }

    /// Finish the run with the given status. Terminal afterwards.
    pub fn finish(&mut self, status: RunStatus) {
        if self.refuse_if_terminal("finish") {
            return;
        }
        self.status = status;
        self.finished_at = Some(Utc::now());
    }

    /// Number of stages that reached each terminal outcome
    pub fn outcome_count(&self, outcome: StageOutcome) -> usize {
        self.stages.iter().filter(|s| s.outcome == outcome).count()
    }

    fn refuse_if_terminal(&self, action: &str) -> bool {
        // Unstable is tracked while running; only a finished run is frozen
        if self.finished_at.is_some() {
            warn!(run_id = %self.run_id, "refusing to {} a finished run", action);
            return true;
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worst_outcome() {
        use StageOutcome::*;
        assert_eq!(Success.worst(Unstable), Unstable);
        assert_eq!(Unstable.worst(Failure), Failure);
        assert_eq!(Failure.worst(Success), Failure);
        assert_eq!(Skipped.worst(Success), Success);
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(RunStatus::Success.exit_code(), 0);
        assert_eq!(RunStatus::Failure.exit_code(), 1);
        assert_eq!(RunStatus::Unstable.exit_code(), 2);
    }

    #[test]
    fn test_run_is_frozen_once_finished() {
        let mut run = PipelineRun::new(Uuid::new_v4(), "shop", "1.0.0");
        run.start();
        run.record_stage(StageResult::skipped("Build", StageKind::Build, "not needed"));
        run.finish(RunStatus::Success);

        run.record_stage(StageResult::skipped("Test", StageKind::Test, "late"));
        run.finish(RunStatus::Failure);

        assert_eq!(run.stages().len(), 1);
        assert_eq!(run.status(), RunStatus::Success);
        assert!(run.finished_at().is_some());
    }

    #[test]
    fn test_mark_unstable_does_not_hide_failure() {
        let mut run = PipelineRun::new(Uuid::new_v4(), "shop", "1.0.0");
        run.start();
        run.mark_unstable();
        assert!(run.is_unstable());
        run.finish(RunStatus::Failure);
        run.mark_unstable();
        assert_eq!(run.status(), RunStatus::Failure);
    }
}
