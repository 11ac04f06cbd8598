//! External collaborators: artifact builder, container runtime, notification
//! transport
//!
//! The pipeline only talks to these through the traits below. The adapters in
//! this module shell out or POST JSON; tests substitute in-memory fakes.

pub mod command;
pub mod notify;
pub mod shell;

pub use command::{CommandBuilder, CommandRuntime};
pub use notify::{LogNotifier, WebhookNotifier};
pub use shell::{CommandOutput, ShellCommand};

use crate::core::error::PipelineError;
use crate::core::slot::{ArtifactHandle, InstanceHandle, SlotBinding};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failure of an external tool call
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExternalError {
    #[error("failed to spawn `{command}`: {message}")]
    Spawn { command: String, message: String },

    #[error("`{command}` exited with code {code}: {stderr}")]
    Exit {
        command: String,
        code: i32,
        stderr: String,
    },

    #[error("`{command}` timed out after {secs}s")]
    Timeout { command: String, secs: u64 },

    #[error("unusable output: {0}")]
    Output(String),

    #[error("transport error: {0}")]
    Transport(String),
}

impl ExternalError {
    /// Attribute the failure to a tool in the pipeline error taxonomy
    pub fn for_tool(self, tool: &str) -> PipelineError {
        PipelineError::external(tool, self.to_string())
    }
}

/// Builds a deployable artifact from a source reference
#[async_trait]
pub trait ArtifactBuilder: Send + Sync {
    /// The returned handle is tagged with `version`
    async fn build(&self, source_ref: &str, version: &str) -> Result<ArtifactHandle, ExternalError>;
}

/// Starts and stops application instances
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    async fn start(
        &self,
        artifact: &ArtifactHandle,
        binding: &SlotBinding,
        env: &[(String, String)],
    ) -> Result<InstanceHandle, ExternalError>;

    async fn stop(&self, instance: &InstanceHandle) -> Result<(), ExternalError>;
}

/// A message for the notification transport
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub subject: String,
    pub body: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipient: Option<String>,
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, notification: &Notification) -> Result<(), ExternalError>;
}
