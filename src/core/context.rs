//! Run context - run-scoped configuration and shared resources

use crate::core::slot::{ArtifactHandle, DeploymentSlot, ReleaseRecord};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use uuid::Uuid;

/// How strictly the security gate is enforced
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SecurityLevel {
    #[default]
    Standard,
    /// Soft security thresholds are enforced as hard ones
    Strict,
}

impl SecurityLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            SecurityLevel::Standard => "standard",
            SecurityLevel::Strict => "strict",
        }
    }
}

/// Per-run settings resolved from configuration and CLI flags
#[derive(Debug, Clone, Default)]
pub struct RunSettings {
    pub pipeline: String,
    pub version: String,
    pub branch: Option<String>,
    pub source_ref: String,
    pub force_release: bool,
    pub security_level: SecurityLevel,
    pub notify: Option<String>,
    pub variables: HashMap<String, String>,
}

/// Resources acquired during the run that global cleanup must release
#[derive(Debug, Default)]
pub struct RunResources {
    /// Artifact produced by the build stage
    pub artifact: Option<ArtifactHandle>,
    /// Test slot deployment owned by this run
    pub test_slot: Option<DeploymentSlot>,
    /// Paths captured by archive steps across the run
    pub archived: Vec<String>,
    /// Release attempts not yet recorded on the run
    pub releases: Vec<ReleaseRecord>,
}

/// Sending half of an abort signal
#[derive(Debug, Clone)]
pub struct AbortHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl AbortHandle {
    pub fn abort(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_aborted(&self) -> bool {
        *self.tx.borrow()
    }
}

/// Receiving half of an abort signal
#[derive(Debug, Clone)]
pub struct AbortSignal {
    rx: watch::Receiver<bool>,
}

impl AbortSignal {
    /// A signal that never fires
    pub fn never() -> Self {
        abort_pair().1
    }

    pub fn is_aborted(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once the signal fires. Never resolves if the handle is dropped
    /// without aborting.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        if rx.wait_for(|aborted| *aborted).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Create a connected abort handle and signal
pub fn abort_pair() -> (AbortHandle, AbortSignal) {
    let (tx, rx) = watch::channel(false);
    (AbortHandle { tx: Arc::new(tx) }, AbortSignal { rx })
}

/// Execution context for a pipeline run
///
/// Passed by reference into every component; there is no process-wide state.
#[derive(Debug)]
pub struct RunContext {
    pub run_id: Uuid,
    pub pipeline: String,
    pub version: String,
    pub branch: Option<String>,
    pub source_ref: String,
    pub force_release: bool,
    pub security_level: SecurityLevel,
    pub notify: Option<String>,

    /// Global and user-defined variables
    variables: HashMap<String, String>,

    abort: AbortHandle,
    signal: AbortSignal,

    /// Mutable run-scoped resources
    pub resources: Mutex<RunResources>,
}

impl RunContext {
    pub fn new(settings: RunSettings) -> Self {
        let (abort, signal) = abort_pair();
        Self {
            run_id: Uuid::new_v4(),
            pipeline: settings.pipeline,
            version: settings.version,
            branch: settings.branch,
            source_ref: settings.source_ref,
            force_release: settings.force_release,
            security_level: settings.security_level,
            notify: settings.notify,
            variables: settings.variables,
            abort,
            signal,
            resources: Mutex::new(RunResources::default()),
        }
    }

    /// Set a variable
    pub fn set_variable(&mut self, key: String, value: String) {
        self.variables.insert(key, value);
    }

    /// Get a variable
    pub fn get_variable(&self, key: &str) -> Option<&String> {
        self.variables.get(key)
    }

    /// Whether a named run flag is set
    pub fn flag(&self, name: &str) -> bool {
        match name {
            "force_release" => self.force_release,
            "strict_security" => self.security_level == SecurityLevel::Strict,
            other => self
                .variables
                .get(other)
                .is_some_and(|v| matches!(v.to_ascii_lowercase().as_str(), "true" | "1" | "yes")),
        }
    }

    /// Abort everything in flight for this run
    pub fn abort(&self) {
        self.abort.abort();
    }

    pub fn abort_handle(&self) -> AbortHandle {
        self.abort.clone()
    }

    pub fn abort_signal(&self) -> AbortSignal {
        self.signal.clone()
    }

    /// Get all variables available for template rendering
    pub fn get_rendering_variables(&self) -> HashMap<String, String> {
        let mut vars = self.variables.clone();
        vars.insert("version".to_string(), self.version.clone());
        vars.insert("run_id".to_string(), self.run_id.to_string());
        vars.insert("pipeline".to_string(), self.pipeline.clone());
        vars.insert("security_level".to_string(), self.security_level.as_str().to_string());
        if let Some(branch) = &self.branch {
            vars.insert("branch".to_string(), branch.clone());
        }
        vars
    }

    /// Environment passed to shell steps and adapters
    pub fn command_env(&self) -> Vec<(String, String)> {
        let mut env: Vec<(String, String)> = self
            .variables
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        env.push(("PIPELINE_NAME".to_string(), self.pipeline.clone()));
        env.push(("BUILD_VERSION".to_string(), self.version.clone()));
        env.push(("RUN_ID".to_string(), self.run_id.to_string()));
        env.push(("SECURITY_LEVEL".to_string(), self.security_level.as_str().to_string()));
        if let Some(branch) = &self.branch {
            env.push(("BRANCH_NAME".to_string(), branch.clone()));
        }
        env.sort();
        env
    }
}

/// Replace `{{ name }}` placeholders with variable values
pub fn render_template(template: &str, variables: &HashMap<String, String>) -> String {
    let mut rendered = template.to_string();
    for (key, value) in variables {
        let placeholder = format!("{{{{ {} }}}}", key);
        rendered = rendered.replace(&placeholder, value);
    }
    rendered
}
