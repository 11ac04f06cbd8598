//! Pipeline configuration from YAML

use crate::core::{
    condition::ActivationPredicate,
    error::PipelineError,
    finding::Category,
    pipeline::PipelineDefinition,
    policy::GatePolicy,
    stage::{FailurePolicy, StageKind, StepAction},
    slot::SlotKind,
};
use serde::{Deserialize, Serialize};
use serde_yaml::Value;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;

/// Top-level pipeline configuration loaded from YAML
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Pipeline name
    pub name: String,

    /// Artifact version (overridable from the command line)
    #[serde(default)]
    pub version: Option<String>,

    /// Source branch, used by activation predicates
    #[serde(default)]
    pub branch: Option<String>,

    /// Source reference handed to the artifact builder
    #[serde(default = "default_source")]
    pub source: String,

    /// Global variables available to all steps
    #[serde(default)]
    variables: HashMap<String, Value>,

    /// Overall wall-clock timeout for the run (in seconds)
    #[serde(default)]
    pub timeout_secs: Option<u64>,

    /// Default timeout for stages (in seconds)
    #[serde(default)]
    pub default_stage_timeout_secs: Option<u64>,

    /// Timeout for each post hook (in seconds)
    #[serde(default)]
    pub hook_timeout_secs: Option<u64>,

    #[serde(default)]
    pub health: HealthConfig,

    #[serde(default)]
    pub builder: Option<BuilderConfig>,

    #[serde(default)]
    pub runtime: Option<RuntimeConfig>,

    #[serde(default)]
    pub slots: SlotsConfig,

    /// Named gate policies referenced by stages
    #[serde(default)]
    pub gates: BTreeMap<String, GatePolicy>,

    #[serde(default)]
    pub notifications: NotificationConfig,

    /// Directory for per-run JSON records
    #[serde(default)]
    pub archive_dir: Option<String>,

    /// Directory for persisted slot state
    #[serde(default)]
    pub state_dir: Option<String>,

    /// Pipeline stages, in execution order
    pub stages: Vec<StageConfig>,
}

fn default_source() -> String {
    ".".to_string()
}

/// Readiness polling settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    #[serde(default = "default_interval")]
    pub interval_secs: u64,
    #[serde(default = "default_health_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_secs: u64,
}

fn default_interval() -> u64 {
    5
}

fn default_health_timeout() -> u64 {
    120
}

fn default_max_attempts() -> u32 {
    24
}

fn default_probe_timeout() -> u64 {
    5
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_interval(),
            timeout_secs: default_health_timeout(),
            max_attempts: default_max_attempts(),
            probe_timeout_secs: default_probe_timeout(),
        }
    }
}

/// Artifact builder command
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuilderConfig {
    /// Shell command template
    pub command: String,
    /// Artifact identifier template; defaults to the command's last output line
    #[serde(default)]
    pub artifact: Option<String>,
}

/// Container runtime commands
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Start command template; its last output line is the instance id
    pub start: String,
    /// Stop command template
    pub stop: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SlotsConfig {
    #[serde(default)]
    pub test: Option<SlotConfig>,
    #[serde(default)]
    pub production: Option<SlotConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlotConfig {
    /// Readiness URL template; `{port}` is substituted
    pub health_url: String,
    pub port: u16,
    #[serde(default)]
    pub standby_port: Option<u16>,
}

impl SlotConfig {
    /// Port the incoming version uses while `port` is live
    pub fn standby(&self) -> u16 {
        self.standby_port.unwrap_or_else(|| self.port.wrapping_add(1))
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NotificationConfig {
    #[serde(default)]
    pub recipient: Option<String>,
    /// Webhook URL; notifications are only logged when absent
    #[serde(default)]
    pub webhook: Option<String>,
}

/// Stage configuration as defined in YAML
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageConfig {
    pub name: String,
    pub kind: StageKind,
    #[serde(default)]
    pub steps: Vec<StepConfig>,
    /// Branches run concurrently after `steps`
    #[serde(default)]
    pub parallel: Vec<BranchConfig>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub when: Option<ConditionConfig>,
    #[serde(default)]
    pub post: PostConfig,
    #[serde(default)]
    pub best_effort: bool,
    #[serde(default)]
    pub reports: Vec<ReportConfig>,
    #[serde(default)]
    pub gate: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BranchConfig {
    pub name: String,
    pub steps: Vec<StepConfig>,
}

/// Step configuration: common fields plus the `type`-tagged action
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepConfig {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub on_failure: FailurePolicy,
    #[serde(flatten)]
    pub action: StepAction,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PostConfig {
    #[serde(default)]
    pub always: Vec<StepConfig>,
    #[serde(default)]
    pub success: Vec<StepConfig>,
    #[serde(default)]
    pub failure: Vec<StepConfig>,
    #[serde(default)]
    pub unstable: Vec<StepConfig>,
}

/// Scanner report consumed after the stage's steps
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportConfig {
    pub category: Category,
    pub format: String,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub scanner: Option<String>,
}

/// Activation condition. Every field present must hold.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConditionConfig {
    #[serde(default)]
    pub branch: Option<String>,
    #[serde(default)]
    pub branch_matches: Option<String>,
    #[serde(default)]
    pub flag: Option<String>,
    #[serde(default)]
    pub variable: Option<VariableCondition>,
    #[serde(default)]
    pub any_of: Vec<ConditionConfig>,
    #[serde(default)]
    pub all_of: Vec<ConditionConfig>,
    #[serde(default)]
    pub not: Option<Box<ConditionConfig>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VariableCondition {
    pub name: String,
    #[serde(default)]
    pub equals: Option<String>,
    #[serde(default)]
    pub matches: Option<String>,
}

impl PipelineConfig {
    /// Load pipeline configuration from a YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, PipelineError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            PipelineError::Configuration(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_yaml(&content)
    }

    /// Parse pipeline configuration from YAML string
    pub fn from_yaml(yaml: &str) -> Result<Self, PipelineError> {
        let config: PipelineConfig = serde_yaml::from_str(yaml)
            .map_err(|e| PipelineError::Configuration(format!("invalid pipeline YAML: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the pipeline configuration
    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.stages.is_empty() {
            return Err(config_error(format!("pipeline '{}' has no stages", self.name)));
        }

        // Stage names are unique and kinds follow the fixed order
        let mut seen_names = HashSet::new();
        let mut previous_kind: Option<StageKind> = None;
        for stage in &self.stages {
            if !seen_names.insert(&stage.name) {
                return Err(config_error(format!("Duplicate stage name: {}", stage.name)));
            }
            if let Some(previous) = previous_kind {
                if stage.kind < previous {
                    return Err(config_error(format!(
                        "Stage '{}' ({}) is out of order: it must not follow a {} stage",
                        stage.name, stage.kind, previous
                    )));
                }
            }
            previous_kind = Some(stage.kind);

            if stage.steps.is_empty() && stage.parallel.is_empty() {
                return Err(config_error(format!("Stage '{}' has no steps", stage.name)));
            }

            if let Some(gate) = &stage.gate {
                if !self.gates.contains_key(gate) {
                    return Err(config_error(format!(
                        "Stage '{}' references non-existent gate '{}'",
                        stage.name, gate
                    )));
                }
            }

            if stage.timeout_secs == Some(0) {
                return Err(config_error(format!("Stage '{}' has a zero timeout", stage.name)));
            }

            if let Some(when) = &stage.when {
                ActivationPredicate::from_config(when)?;
            }

            self.validate_steps(stage)?;
        }

        if self.timeout_secs == Some(0) {
            return Err(config_error("Pipeline timeout must be positive".to_string()));
        }

        if self.health.interval_secs == 0
            || self.health.timeout_secs == 0
            || self.health.probe_timeout_secs == 0
        {
            return Err(config_error(
                "Health interval, timeout and probe timeout must be positive".to_string(),
            ));
        }
        if self.health.max_attempts == 0 {
            return Err(config_error("Health max_attempts must be at least 1".to_string()));
        }

        if let Some(production) = &self.slots.production {
            if production.standby() == production.port {
                return Err(config_error(format!(
                    "Production standby port must differ from port {}",
                    production.port
                )));
            }
        }

        if let (Some(test), Some(production)) = (&self.slots.test, &self.slots.production) {
            if [production.port, production.standby()].contains(&test.port) {
                return Err(config_error(format!(
                    "Test slot port {} collides with a production port",
                    test.port
                )));
            }
        }

        // Building definitions catches report and branch mistakes
        PipelineDefinition::from_config(self)?;

        Ok(())
    }

    fn validate_steps(&self, stage: &StageConfig) -> Result<(), PipelineError> {
        let steps = stage
            .steps
            .iter()
            .chain(stage.parallel.iter().flat_map(|b| b.steps.iter()))
            .chain(stage.post.always.iter())
            .chain(stage.post.success.iter())
            .chain(stage.post.failure.iter())
            .chain(stage.post.unstable.iter());

        for step in steps {
            let missing = match &step.action {
                StepAction::Build if self.builder.is_none() => Some("a 'builder' section"),
                StepAction::Deploy if self.runtime.is_none() || self.slots.test.is_none() => {
                    Some("a 'runtime' section and a test slot")
                }
                StepAction::Release
                    if self.runtime.is_none()
                        || self.slots.test.is_none()
                        || self.slots.production.is_none() =>
                {
                    Some("a 'runtime' section, a test slot and a production slot")
                }
                StepAction::HealthCheck { slot: SlotKind::Test } if self.slots.test.is_none() => {
                    Some("a test slot")
                }
                StepAction::HealthCheck { slot: SlotKind::Production }
                    if self.slots.production.is_none() =>
                {
                    Some("a production slot")
                }
                StepAction::Command { run, .. } if run.trim().is_empty() => {
                    return Err(config_error(format!(
                        "Stage '{}' has a command step with an empty command",
                        stage.name
                    )))
                }
                _ => None,
            };

            if let Some(missing) = missing {
                return Err(config_error(format!(
                    "Stage '{}' has a '{}' step, which requires {}",
                    stage.name,
                    step.action.label(),
                    missing
                )));
            }
        }

        Ok(())
    }

    /// Get variables as string map
    pub fn variables_as_string_map(&self) -> HashMap<String, String> {
        self.variables
            .iter()
            .map(|(key, value)| {
                let rendered = match value {
                    Value::String(s) => s.clone(),
                    Value::Bool(b) => b.to_string(),
                    Value::Number(n) => n.to_string(),
                    Value::Null => String::new(),
                    // Fallback: YAML text of the value
                    other => serde_yaml::to_string(other)
                        .unwrap_or_default()
                        .trim_end()
                        .to_string(),
                };
                (key.clone(), rendered)
            })
            .collect()
    }

    /// Convert config to a pipeline definition
    pub fn to_definition(&self) -> Result<PipelineDefinition, PipelineError> {
        PipelineDefinition::from_config(self)
    }
}

fn config_error(message: String) -> PipelineError {
    PipelineError::Configuration(message)
}
