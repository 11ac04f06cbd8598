//! Persistence layer for run records, run history and slot state

pub mod slot_state;
#[cfg(feature = "sqlite")]
pub mod store;

pub use slot_state::SlotStateStore;
#[cfg(feature = "sqlite")]
pub use store::SqliteRunStore;

use crate::core::{
    finding::Finding,
    slot::{ReleaseRecord, ReleaseResult},
    state::{PipelineRun, RunStatus, StageOutcome, StageResult},
};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Complete record of a finished run, written as `<run_id>.json`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: Uuid,
    pub pipeline: String,
    pub version: String,
    pub status: RunStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub stages: Vec<StageResult>,
    pub releases: Vec<ReleaseRecord>,
    /// Findings of every stage, in stage order
    pub findings: Vec<Finding>,
    #[serde(default)]
    pub warnings: Vec<String>,
}

impl RunRecord {
    pub fn from_run(run: &PipelineRun) -> Self {
        Self {
            run_id: run.run_id(),
            pipeline: run.pipeline().to_string(),
            version: run.version().to_string(),
            status: run.status(),
            started_at: run.started_at(),
            finished_at: run.finished_at(),
            stages: run.stages().to_vec(),
            releases: run.releases().to_vec(),
            findings: run
                .stages()
                .iter()
                .flat_map(|stage| stage.findings.iter().cloned())
                .collect(),
            warnings: run.warnings().to_vec(),
        }
    }

    /// Write the record into `dir`, returning the file path
    pub fn write_to(&self, dir: impl AsRef<Path>) -> Result<PathBuf> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir).with_context(|| format!("Failed to create {}", dir.display()))?;

        let path = dir.join(format!("{}.json", self.run_id));
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(&path, json).with_context(|| format!("Failed to write {}", path.display()))?;
        Ok(path)
    }

    pub fn read_from(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content =
            std::fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))?;
        serde_json::from_str(&content).with_context(|| format!("Failed to parse {}", path.display()))
    }
}

/// Summary of a pipeline run kept in the run history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub pipeline: String,
    pub version: String,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Stages that ran (not skipped)
    pub stages_run: usize,
    pub stages_failed: usize,
    /// Version that went live during the run
    pub released: Option<String>,
}

/// Trait for persistence backends
#[async_trait::async_trait]
pub trait PersistenceBackend: Send + Sync {
    /// Save a run summary
    async fn save_run(&self, summary: &RunSummary) -> Result<()>;

    /// Load a run by ID
    async fn load_run(&self, run_id: Uuid) -> Result<Option<RunSummary>>;

    /// List runs of a pipeline, newest first
    async fn list_runs(&self, pipeline: &str) -> Result<Vec<RunSummary>>;

    /// List all pipeline names
    async fn list_pipelines(&self) -> Result<Vec<String>>;
}

/// In-memory persistence (for testing or ephemeral use)
pub struct InMemoryPersistence {
    runs: tokio::sync::RwLock<std::collections::HashMap<Uuid, RunSummary>>,
    by_pipeline: tokio::sync::RwLock<std::collections::HashMap<String, Vec<Uuid>>>,
}

impl InMemoryPersistence {
    pub fn new() -> Self {
        Self {
            runs: tokio::sync::RwLock::new(std::collections::HashMap::new()),
            by_pipeline: tokio::sync::RwLock::new(std::collections::HashMap::new()),
        }
    }
}

impl Default for InMemoryPersistence {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl PersistenceBackend for InMemoryPersistence {
    async fn save_run(&self, summary: &RunSummary) -> Result<()> {
        let mut runs = self.runs.write().await;
        let is_new = runs.insert(summary.run_id, summary.clone()).is_none();

        if is_new {
            let mut by_pipeline = self.by_pipeline.write().await;
            by_pipeline
                .entry(summary.pipeline.clone())
                .or_default()
                .push(summary.run_id);
        }

        Ok(())
    }

    async fn load_run(&self, run_id: Uuid) -> Result<Option<RunSummary>> {
        let runs = self.runs.read().await;
        Ok(runs.get(&run_id).cloned())
    }

    async fn list_runs(&self, pipeline: &str) -> Result<Vec<RunSummary>> {
        let runs = self.runs.read().await;
        let by_pipeline = self.by_pipeline.read().await;

        let mut result: Vec<RunSummary> = by_pipeline
            .get(pipeline)
            .map(|ids| ids.iter().filter_map(|id| runs.get(id).cloned()).collect())
            .unwrap_or_default();
        result.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        Ok(result)
    }

    async fn list_pipelines(&self) -> Result<Vec<String>> {
        let by_pipeline = self.by_pipeline.read().await;
        let mut names: Vec<String> = by_pipeline.keys().cloned().collect();
        names.sort();
        Ok(names)
    }
}

/// Create a summary from a run
pub fn create_summary(run: &PipelineRun) -> RunSummary {
    let released = run
        .releases()
        .iter()
        .rev()
        .find(|record| record.result == ReleaseResult::Live)
        .map(|record| record.version.clone());

    RunSummary {
        run_id: run.run_id(),
        pipeline: run.pipeline().to_string(),
        version: run.version().to_string(),
        status: run.status(),
        started_at: run.started_at().unwrap_or_else(Utc::now),
        finished_at: run.finished_at(),
        stages_run: run.stages().len() - run.outcome_count(StageOutcome::Skipped),
        stages_failed: run.outcome_count(StageOutcome::Failure),
        released,
    }
}

/// Parse the stored form of a run status
pub(crate) fn parse_status(value: &str) -> RunStatus {
    match value {
        "Pending" => RunStatus::Pending,
        "Running" => RunStatus::Running,
        "Success" => RunStatus::Success,
        "Unstable" => RunStatus::Unstable,
        _ => RunStatus::Failure,
    }
}
