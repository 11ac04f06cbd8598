//! Shell-command adapters for the builder and runtime boundaries

use crate::core::context::render_template;
use crate::core::slot::{ArtifactHandle, InstanceHandle, SlotBinding};
use crate::external::{ArtifactBuilder, ContainerRuntime, ExternalError, ShellCommand};
use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;
use tracing::info;

/// Runs a build command; the artifact id is the rendered `artifact` template
/// or, without one, the command's last output line.
///
/// Template variables: `source`, `version`.
#[derive(Debug, Clone)]
pub struct CommandBuilder {
    command: String,
    artifact: Option<String>,
    timeout: Duration,
}

impl CommandBuilder {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            artifact: None,
            timeout: Duration::from_secs(1800),
        }
    }

    pub fn with_artifact_template(mut self, template: impl Into<String>) -> Self {
        self.artifact = Some(template.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl ArtifactBuilder for CommandBuilder {
    async fn build(&self, source_ref: &str, version: &str) -> Result<ArtifactHandle, ExternalError> {
        let vars = HashMap::from([
            ("source".to_string(), source_ref.to_string()),
            ("version".to_string(), version.to_string()),
        ]);

        let output = ShellCommand::new(render_template(&self.command, &vars))
            .env("BUILD_VERSION", version)
            .timeout(self.timeout)
            .output()
            .await?;

        let id = match &self.artifact {
            Some(template) => render_template(template, &vars),
            None => output
                .last_line()
                .map(str::to_string)
                .ok_or_else(|| ExternalError::Output("builder printed no artifact id".to_string()))?,
        };

        info!(artifact = %id, %version, "artifact built");
        Ok(ArtifactHandle {
            id,
            version: version.to_string(),
        })
    }
}

/// Starts and stops instances with shell command templates.
///
/// `start` variables: `artifact`, `version`, `slot`, `port`; its last output
/// line is the instance id. `stop` variables: `instance`, `slot`, `port`.
#[derive(Debug, Clone)]
pub struct CommandRuntime {
    start: String,
    stop: String,
    timeout: Duration,
}

impl CommandRuntime {
    pub fn new(start: impl Into<String>, stop: impl Into<String>) -> Self {
        Self {
            start: start.into(),
            stop: stop.into(),
            timeout: Duration::from_secs(300),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl ContainerRuntime for CommandRuntime {
    async fn start(
        &self,
        artifact: &ArtifactHandle,
        binding: &SlotBinding,
        env: &[(String, String)],
    ) -> Result<InstanceHandle, ExternalError> {
        let vars = HashMap::from([
            ("artifact".to_string(), artifact.id.clone()),
            ("version".to_string(), artifact.version.clone()),
            ("slot".to_string(), binding.slot.clone()),
            ("port".to_string(), binding.port.to_string()),
        ]);

        let output = ShellCommand::new(render_template(&self.start, &vars))
            .envs(env.iter().cloned())
            .timeout(self.timeout)
            .output()
            .await?;

        let id = output
            .last_line()
            .ok_or_else(|| ExternalError::Output("runtime printed no instance id".to_string()))?
            .to_string();

        info!(instance = %id, slot = %binding.slot, port = binding.port, "instance started");
        Ok(InstanceHandle {
            id,
            slot: binding.slot.clone(),
            port: binding.port,
        })
    }

    async fn stop(&self, instance: &InstanceHandle) -> Result<(), ExternalError> {
        let vars = HashMap::from([
            ("instance".to_string(), instance.id.clone()),
            ("slot".to_string(), instance.slot.clone()),
            ("port".to_string(), instance.port.to_string()),
        ]);

        ShellCommand::new(render_template(&self.stop, &vars))
            .timeout(self.timeout)
            .output()
            .await?;

        info!(instance = %instance.id, slot = %instance.slot, "instance stopped");
        Ok(())
    }
}
