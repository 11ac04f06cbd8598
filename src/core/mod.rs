//! Core domain models

pub mod condition;
pub mod config;
pub mod context;
pub mod error;
pub mod finding;
pub mod pipeline;
pub mod policy;
pub mod slot;
pub mod stage;
pub mod state;

pub use context::{AbortHandle, AbortSignal, RunContext, RunSettings, SecurityLevel};
pub use error::{ErrorKind, PipelineError, StageError};
pub use finding::{Category, CategoryCounts, Finding, Severity, SeverityCounts};
pub use pipeline::PipelineDefinition;
pub use policy::{Enforcement, GateDecision, GateEvaluation, GatePolicy, Threshold};
pub use slot::{DeploymentSlot, ReleasePhase, ReleaseRecord, ReleaseStrategy, SlotKind};
pub use stage::{StageDefinition, StageKind, StepAction, StepDefinition};
pub use state::{PipelineRun, RunStatus, StageOutcome, StageResult};
