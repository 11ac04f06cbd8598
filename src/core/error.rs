//! Error taxonomy for pipeline execution

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Errors raised while running a pipeline
#[derive(Debug, Clone, Error)]
pub enum PipelineError {
    /// A stage step itself failed
    #[error("step '{step}' failed: {message}")]
    StepFailure { step: String, message: String },

    /// A gate policy was breached
    #[error("gate '{gate}' breached: {message}")]
    GateFailure { gate: String, message: String },

    /// A service did not become ready in time
    #[error("health check against {url} failed after {attempts} attempt(s): {last_error}")]
    HealthCheckTimeout {
        url: String,
        attempts: u32,
        last_error: String,
    },

    /// A scanner, builder or runtime call failed
    #[error("{tool} error: {message}")]
    ExternalTool { tool: String, message: String },

    /// Invalid stage definition or policy
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A stage exceeded its own timeout
    #[error("timed out after {0} seconds")]
    Timeout(u64),

    /// Work was interrupted by an external abort
    #[error("aborted: {0}")]
    Aborted(String),
}

impl PipelineError {
    pub fn step(step: impl Into<String>, message: impl Into<String>) -> Self {
        PipelineError::StepFailure {
            step: step.into(),
            message: message.into(),
        }
    }

    pub fn external(tool: impl Into<String>, message: impl Into<String>) -> Self {
        PipelineError::ExternalTool {
            tool: tool.into(),
            message: message.into(),
        }
    }

    /// Classify the error
    pub fn kind(&self) -> ErrorKind {
        match self {
            PipelineError::StepFailure { .. } => ErrorKind::StepFailure,
            PipelineError::GateFailure { .. } => ErrorKind::GateFailure,
            PipelineError::HealthCheckTimeout { .. } => ErrorKind::HealthCheckTimeout,
            PipelineError::ExternalTool { .. } => ErrorKind::ExternalToolError,
            PipelineError::Configuration(_) => ErrorKind::ConfigurationError,
            PipelineError::Timeout(_) => ErrorKind::Timeout,
            PipelineError::Aborted(_) => ErrorKind::Aborted,
        }
    }
}

/// Error class recorded in stage results
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    StepFailure,
    GateFailure,
    HealthCheckTimeout,
    ExternalToolError,
    ConfigurationError,
    Timeout,
    Aborted,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ErrorKind::StepFailure => "step failure",
            ErrorKind::GateFailure => "gate failure",
            ErrorKind::HealthCheckTimeout => "health check timeout",
            ErrorKind::ExternalToolError => "external tool error",
            ErrorKind::ConfigurationError => "configuration error",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Aborted => "aborted",
        };
        f.write_str(label)
    }
}

/// Serializable error detail kept on a stage result
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageError {
    pub kind: ErrorKind,
    pub message: String,
}

impl From<&PipelineError> for StageError {
    fn from(error: &PipelineError) -> Self {
        Self {
            kind: error.kind(),
            message: error.to_string(),
        }
    }
}

impl From<PipelineError> for StageError {
    fn from(error: PipelineError) -> Self {
        Self::from(&error)
    }
}
