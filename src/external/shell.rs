//! Shell subprocess runner shared by the command adapters and `command` steps

use crate::external::ExternalError;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, warn};

/// Captured output of a finished command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    /// Last non-empty stdout line, trimmed
    pub fn last_line(&self) -> Option<&str> {
        self.stdout
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .last()
    }
}

/// A `sh -c` invocation
#[derive(Debug, Clone)]
pub struct ShellCommand {
    command: String,
    env: Vec<(String, String)>,
    workdir: Option<PathBuf>,
    timeout: Duration,
}

impl ShellCommand {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            env: Vec::new(),
            workdir: None,
            timeout: Duration::from_secs(600),
        }
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn envs<I, K, V>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.env
            .extend(vars.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    pub fn workdir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.workdir = Some(dir.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    /// Run to completion and capture output.
    ///
    /// The child is killed if this future is dropped, so callers can cancel
    /// by racing it against an abort signal.
    ///
    /// # Errors
    /// - the shell cannot be spawned
    /// - the command exits non-zero
    /// - the command runs past its timeout
    pub async fn output(&self) -> Result<CommandOutput, ExternalError> {
        debug!(command = %self.command, "spawning shell command");

        let mut command = Command::new("sh");
        command
            .arg("-c")
            .arg(&self.command)
            .envs(self.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .kill_on_drop(true);
        if let Some(dir) = &self.workdir {
            command.current_dir(dir);
        }

        let result = timeout(self.timeout, command.output())
            .await
            .map_err(|_| ExternalError::Timeout {
                command: self.command.clone(),
                secs: self.timeout.as_secs(),
            })?;

        let output = result.map_err(|e| ExternalError::Spawn {
            command: self.command.clone(),
            message: e.to_string(),
        })?;

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();

        if !output.status.success() {
            let code = output.status.code().unwrap_or(-1);
            warn!(command = %self.command, code, stderr = %stderr.trim(), "command failed");
            return Err(ExternalError::Exit {
                command: self.command.clone(),
                code,
                stderr: stderr.trim().to_string(),
            });
        }

        debug!(command = %self.command, bytes = stdout.len(), "command finished");
        Ok(CommandOutput { stdout, stderr })
    }
}
