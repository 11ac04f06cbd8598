//! Stage domain model

use crate::core::{
    condition::ActivationPredicate,
    config::{BranchConfig, ReportConfig, StageConfig, StepConfig},
    error::PipelineError,
    finding::Category,
    slot::SlotKind,
    state::StageOutcome,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// The fixed pipeline phases, in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageKind {
    Build,
    Test,
    Quality,
    Security,
    Deploy,
    Release,
    Monitoring,
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            StageKind::Build => "build",
            StageKind::Test => "test",
            StageKind::Quality => "quality",
            StageKind::Security => "security",
            StageKind::Deploy => "deploy",
            StageKind::Release => "release",
            StageKind::Monitoring => "monitoring",
        };
        f.write_str(label)
    }
}

/// What to do when a step fails
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailurePolicy {
    /// Stop the stage with Failure
    #[default]
    Fail,
    /// Record a warning and keep going
    Ignore,
    /// Mark the stage unstable and keep going
    Unstable,
}

/// Action performed by a step
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepAction {
    /// Run a shell command
    Command {
        run: String,
        #[serde(default)]
        env: BTreeMap<String, String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        workdir: Option<String>,
    },
    /// Build the artifact through the artifact builder
    Build,
    /// Start the artifact in the test slot and wait for readiness
    Deploy,
    /// Promote the artifact to production (blue-green)
    Release,
    /// Poll a slot's current deployment for readiness
    HealthCheck {
        #[serde(default = "default_check_slot")]
        slot: SlotKind,
    },
    /// Send a notification
    Notify {
        subject: String,
        body: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        recipient: Option<String>,
    },
    /// Capture files matching glob patterns as stage artifacts
    Archive { paths: Vec<String> },
}

fn default_check_slot() -> SlotKind {
    SlotKind::Production
}

impl StepAction {
    /// Short label used when a step has no name
    pub fn label(&self) -> &'static str {
        match self {
            StepAction::Command { .. } => "command",
            StepAction::Build => "build",
            StepAction::Deploy => "deploy",
            StepAction::Release => "release",
            StepAction::HealthCheck { .. } => "health_check",
            StepAction::Notify { .. } => "notify",
            StepAction::Archive { .. } => "archive",
        }
    }
}

/// A single step in a stage
#[derive(Debug, Clone)]
pub struct StepDefinition {
    pub name: String,
    pub action: StepAction,
    pub on_failure: FailurePolicy,
}

impl StepDefinition {
    pub fn new(name: impl Into<String>, action: StepAction) -> Self {
        Self {
            name: name.into(),
            action,
            on_failure: FailurePolicy::Fail,
        }
    }

    pub fn on_failure(mut self, policy: FailurePolicy) -> Self {
        self.on_failure = policy;
        self
    }

    fn from_config(config: &StepConfig, index: usize) -> Self {
        let name = config
            .name
            .clone()
            .unwrap_or_else(|| format!("{}-{}", config.action.label(), index + 1));
        Self {
            name,
            action: config.action.clone(),
            on_failure: config.on_failure,
        }
    }
}

/// A parallel branch inside a stage
#[derive(Debug, Clone)]
pub struct BranchDefinition {
    pub name: String,
    pub steps: Vec<StepDefinition>,
}

impl BranchDefinition {
    fn from_config(config: &BranchConfig) -> Self {
        Self {
            name: config.name.clone(),
            steps: steps_from_config(&config.steps),
        }
    }
}

/// Where a scanner report comes from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReportSource {
    File(PathBuf),
    Inline(String),
}

/// Raw scanner output consumed by the finding aggregator
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScannerOutput {
    pub category: Category,
    /// Parser name in the registry
    pub format: String,
    pub source: ReportSource,
    pub scanner: Option<String>,
}

impl ScannerOutput {
    pub fn file(category: Category, format: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            category,
            format: format.into(),
            source: ReportSource::File(path.into()),
            scanner: None,
        }
    }

    pub fn inline(category: Category, format: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            category,
            format: format.into(),
            source: ReportSource::Inline(content.into()),
            scanner: None,
        }
    }

    /// Human label for warnings
    pub fn describe(&self) -> String {
        let source = match &self.source {
            ReportSource::File(path) => path.display().to_string(),
            ReportSource::Inline(_) => "inline report".to_string(),
        };
        format!("{} ({} {})", source, self.category, self.format)
    }

    fn from_config(config: &ReportConfig) -> Result<Self, PipelineError> {
        let source = match (&config.path, &config.content) {
            (Some(path), None) => ReportSource::File(PathBuf::from(path)),
            (None, Some(content)) => ReportSource::Inline(content.clone()),
            _ => {
                return Err(PipelineError::Configuration(format!(
                    "report '{}' needs exactly one of 'path' or 'content'",
                    config.format
                )))
            }
        };
        Ok(Self {
            category: config.category,
            format: config.format.clone(),
            source,
            scanner: config.scanner.clone(),
        })
    }
}

/// Post-outcome hooks
#[derive(Debug, Clone, Default)]
pub struct PostHooks {
    pub always: Vec<StepDefinition>,
    pub success: Vec<StepDefinition>,
    pub failure: Vec<StepDefinition>,
    pub unstable: Vec<StepDefinition>,
}

impl PostHooks {
    /// Hooks for the outcome class, in run order: outcome hook then always
    pub fn for_outcome(&self, outcome: StageOutcome) -> Vec<&StepDefinition> {
        let specific: &[StepDefinition] = match outcome {
            StageOutcome::Success => &self.success,
            StageOutcome::Failure => &self.failure,
            StageOutcome::Unstable => &self.unstable,
            StageOutcome::Skipped => &[],
        };
        specific.iter().chain(self.always.iter()).collect()
    }
}

/// Static definition of one stage
#[derive(Debug, Clone)]
pub struct StageDefinition {
    pub name: String,
    pub kind: StageKind,
    pub steps: Vec<StepDefinition>,
    pub branches: Vec<BranchDefinition>,
    pub timeout: Duration,
    pub when: ActivationPredicate,
    pub hooks: PostHooks,
    /// Failure degrades the run to Unstable instead of stopping it
    pub best_effort: bool,
    pub reports: Vec<ScannerOutput>,
    /// Name of the gate policy applied to this stage's findings
    pub gate: Option<String>,
}

impl StageDefinition {
    pub fn new(name: impl Into<String>, kind: StageKind) -> Self {
        Self {
            name: name.into(),
            kind,
            steps: Vec::new(),
            branches: Vec::new(),
            timeout: Duration::from_secs(1800),
            when: ActivationPredicate::Always,
            hooks: PostHooks::default(),
            best_effort: false,
            reports: Vec::new(),
            gate: None,
        }
    }

    pub fn with_step(mut self, step: StepDefinition) -> Self {
        self.steps.push(step);
        self
    }

    pub fn with_branch(mut self, name: impl Into<String>, steps: Vec<StepDefinition>) -> Self {
        self.branches.push(BranchDefinition {
            name: name.into(),
            steps,
        });
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_report(mut self, report: ScannerOutput) -> Self {
        self.reports.push(report);
        self
    }

    pub fn with_gate(mut self, gate: impl Into<String>) -> Self {
        self.gate = Some(gate.into());
        self
    }

    pub fn when(mut self, predicate: ActivationPredicate) -> Self {
        self.when = predicate;
        self
    }

    pub fn best_effort(mut self) -> Self {
        self.best_effort = true;
        self
    }

    /// Create a stage from its configuration
    pub fn from_config(config: &StageConfig, default_timeout_secs: u64) -> Result<Self, PipelineError> {
        let when = match &config.when {
            Some(condition) => ActivationPredicate::from_config(condition)?,
            None => ActivationPredicate::Always,
        };

        let reports = config
            .reports
            .iter()
            .map(ScannerOutput::from_config)
            .collect::<Result<Vec<_>, _>>()?;

        let mut branch_names = HashSet::new();
        for branch in &config.parallel {
            if !branch_names.insert(branch.name.as_str()) {
                return Err(PipelineError::Configuration(format!(
                    "stage '{}' has duplicate branch '{}'",
                    config.name, branch.name
                )));
            }
            if branch.steps.is_empty() {
                return Err(PipelineError::Configuration(format!(
                    "branch '{}' of stage '{}' has no steps",
                    branch.name, config.name
                )));
            }
        }

        Ok(StageDefinition {
            name: config.name.clone(),
            kind: config.kind,
            steps: steps_from_config(&config.steps),
            branches: config.parallel.iter().map(BranchDefinition::from_config).collect(),
            timeout: Duration::from_secs(config.timeout_secs.unwrap_or(default_timeout_secs)),
            when,
            hooks: PostHooks {
                always: steps_from_config(&config.post.always),
                success: steps_from_config(&config.post.success),
                failure: steps_from_config(&config.post.failure),
                unstable: steps_from_config(&config.post.unstable),
            },
            best_effort: config.best_effort,
            reports,
            gate: config.gate.clone(),
        })
    }
}

fn steps_from_config(configs: &[StepConfig]) -> Vec<StepDefinition> {
    configs
        .iter()
        .enumerate()
        .map(|(i, c)| StepDefinition::from_config(c, i))
        .collect()
}
