//! Pipeline execution engine

pub mod actions;
pub mod engine;
pub mod executor;

pub use actions::{SequenceOutcome, StepOutput, StepRunner};
pub use engine::{EventHandler, ExecutionEvent, PipelineController};
pub use executor::StageExecutor;
