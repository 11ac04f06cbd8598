//! release-pipeline - a deployment pipeline orchestrator with quality gates
//! and blue-green releases

pub mod cli;
pub mod core;
pub mod execution;
pub mod external;
pub mod findings;
pub mod health;
pub mod persistence;
pub mod release;

// Re-export commonly used types
pub use core::{
    PipelineDefinition, PipelineError, PipelineRun, RunContext, RunSettings, RunStatus, StageOutcome,
    StageResult,
};
pub use execution::{ExecutionEvent, PipelineController, StageExecutor, StepRunner};
pub use release::{ReleaseError, ReleaseManager};
