//! Pipeline definition - the static, validated shape of a pipeline

use crate::core::{
    config::{PipelineConfig, SlotConfig},
    error::PipelineError,
    policy::GatePolicy,
    slot::{DeploymentSlot, SlotKind},
    stage::StageDefinition,
};
use crate::health::PollSettings;
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

/// A pipeline definition
#[derive(Debug, Clone)]
pub struct PipelineDefinition {
    /// Pipeline name
    pub name: String,

    /// Global variables available to all steps
    pub variables: HashMap<String, String>,

    /// Stages in execution order
    pub stages: Vec<StageDefinition>,

    /// Named gate policies
    pub gates: BTreeMap<String, GatePolicy>,

    /// Overall wall-clock limit for a run
    pub run_timeout: Duration,

    /// Limit for each post hook
    pub hook_timeout: Duration,

    /// Readiness polling used by deploy, release and monitoring steps
    pub health: PollSettings,

    /// Empty test slot template
    pub test_slot: Option<DeploymentSlot>,

    /// Empty production slot template
    pub production_slot: Option<DeploymentSlot>,
}

impl PipelineDefinition {
    /// Create a definition from configuration
    pub fn from_config(config: &PipelineConfig) -> Result<Self, PipelineError> {
        let default_stage_timeout = config.default_stage_timeout_secs.unwrap_or(1800);

        let stages = config
            .stages
            .iter()
            .map(|stage| StageDefinition::from_config(stage, default_stage_timeout))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(PipelineDefinition {
            name: config.name.clone(),
            variables: config.variables_as_string_map(),
            stages,
            gates: config.gates.clone(),
            run_timeout: Duration::from_secs(config.timeout_secs.unwrap_or(3600)),
            hook_timeout: Duration::from_secs(config.hook_timeout_secs.unwrap_or(60)),
            health: PollSettings::from(&config.health),
            test_slot: config
                .slots
                .test
                .as_ref()
                .map(|slot| slot_from_config("test", SlotKind::Test, slot)),
            production_slot: config
                .slots
                .production
                .as_ref()
                .map(|slot| slot_from_config("production", SlotKind::Production, slot)),
        })
    }

    /// Create an empty definition, mostly useful for tests
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            variables: HashMap::new(),
            stages: Vec::new(),
            gates: BTreeMap::new(),
            run_timeout: Duration::from_secs(3600),
            hook_timeout: Duration::from_secs(60),
            health: PollSettings::default(),
            test_slot: None,
            production_slot: None,
        }
    }

    pub fn with_stage(mut self, stage: StageDefinition) -> Self {
        self.stages.push(stage);
        self
    }

    pub fn with_run_timeout(mut self, timeout: Duration) -> Self {
        self.run_timeout = timeout;
        self
    }
}

fn slot_from_config(name: &str, kind: SlotKind, config: &SlotConfig) -> DeploymentSlot {
    let slot = DeploymentSlot::new(name, kind, config.health_url.clone(), config.port);
    match config.standby_port {
        Some(port) => slot.with_standby_port(port),
        None => slot,
    }
}
