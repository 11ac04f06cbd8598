//! Test utility functions for release-pipeline
#![allow(dead_code)]

use release_pipeline::core::config::PipelineConfig;
use release_pipeline::core::slot::{ArtifactHandle, InstanceHandle, SlotBinding};
use release_pipeline::core::{PipelineDefinition, PipelineRun, RunContext, RunSettings};
use release_pipeline::execution::{ExecutionEvent, PipelineController, StepRunner};
use release_pipeline::external::{
    ArtifactBuilder, ContainerRuntime, ExternalError, Notification, Notifier,
};
use release_pipeline::health::{PollSettings, ProbeError, ReadinessProbe};
use release_pipeline::release::ReleaseManager;

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const TEST_URL: &str = "http://test:9000/health";
pub const BLUE_URL: &str = "http://prod:8080/health";
pub const GREEN_URL: &str = "http://prod:8081/health";

/// Builder that tags a fake image with the requested version
#[derive(Default)]
pub struct FakeBuilder {
    builds: Mutex<Vec<String>>,
}

impl FakeBuilder {
    pub fn builds(&self) -> Vec<String> {
        self.builds.lock().unwrap().clone()
    }
}

#[async_trait]
impl ArtifactBuilder for FakeBuilder {
    async fn build(&self, _source_ref: &str, version: &str) -> Result<ArtifactHandle, ExternalError> {
        self.builds.lock().unwrap().push(version.to_string());
        Ok(ArtifactHandle {
            id: format!("registry/shop:{}", version),
            version: version.to_string(),
        })
    }
}

/// Runtime that records what it started and stopped
#[derive(Default)]
pub struct FakeRuntime {
    started: Mutex<Vec<InstanceHandle>>,
    stopped: Mutex<Vec<String>>,
}

impl FakeRuntime {
    pub fn started(&self) -> Vec<InstanceHandle> {
        self.started.lock().unwrap().clone()
    }

    pub fn stopped(&self) -> Vec<String> {
        self.stopped.lock().unwrap().clone()
    }

    pub fn started_in(&self, slot: &str) -> Vec<InstanceHandle> {
        self.started().into_iter().filter(|i| i.slot == slot).collect()
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn start(
        &self,
        artifact: &ArtifactHandle,
        binding: &SlotBinding,
        _env: &[(String, String)],
    ) -> Result<InstanceHandle, ExternalError> {
        let mut started = self.started.lock().unwrap();
        let instance = InstanceHandle {
            id: format!("{}-{}-{}", binding.slot, artifact.version, started.len()),
            slot: binding.slot.clone(),
            port: binding.port,
        };
        started.push(instance.clone());
        Ok(instance)
    }

    async fn stop(&self, instance: &InstanceHandle) -> Result<(), ExternalError> {
        self.stopped.lock().unwrap().push(instance.id.clone());
        Ok(())
    }
}

/// Per-URL scripted answers; the last answer repeats. Unknown URLs are down.
#[derive(Default)]
pub struct FakeProbe {
    scripts: Mutex<HashMap<String, VecDeque<bool>>>,
    calls: Mutex<HashMap<String, u32>>,
}

impl FakeProbe {
    pub fn script(self, url: &str, answers: &[bool]) -> Self {
        self.set_script(url, answers);
        self
    }

    /// Replace the answers for `url` between runs
    pub fn set_script(&self, url: &str, answers: &[bool]) {
        self.scripts
            .lock()
            .unwrap()
            .insert(url.to_string(), answers.iter().copied().collect());
    }

    pub fn calls(&self, url: &str) -> u32 {
        self.calls.lock().unwrap().get(url).copied().unwrap_or(0)
    }
}

#[async_trait]
impl ReadinessProbe for FakeProbe {
    async fn probe(&self, url: &str) -> Result<(), ProbeError> {
        *self.calls.lock().unwrap().entry(url.to_string()).or_default() += 1;
        let mut scripts = self.scripts.lock().unwrap();
        let healthy = match scripts.get_mut(url) {
            Some(script) if script.len() > 1 => script.pop_front().unwrap_or(false),
            Some(script) => script.front().copied().unwrap_or(false),
            None => false,
        };
        if healthy {
            Ok(())
        } else {
            Err(ProbeError::Status(503))
        }
    }
}

/// Notifier that keeps every message
#[derive(Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<Notification>>,
}

impl RecordingNotifier {
    pub fn sent(&self) -> Vec<Notification> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, notification: &Notification) -> Result<(), ExternalError> {
        self.sent.lock().unwrap().push(notification.clone());
        Ok(())
    }
}

/// Fast polling so scenarios finish in milliseconds: 3 attempts, 10ms apart
pub fn fast_health() -> PollSettings {
    PollSettings::new(Duration::from_millis(10), Duration::from_secs(5), 3)
        .with_probe_timeout(Duration::from_millis(200))
}

/// A pipeline definition wired to in-memory collaborators. The release
/// manager outlives individual runs, like production does.
pub struct Harness {
    pub definition: PipelineDefinition,
    pub builder: Arc<FakeBuilder>,
    pub runtime: Arc<FakeRuntime>,
    pub probe: Arc<FakeProbe>,
    pub notifier: Arc<RecordingNotifier>,
    pub release: Option<Arc<ReleaseManager>>,
    controller: PipelineController,
    events: Arc<Mutex<Vec<ExecutionEvent>>>,
}

impl Harness {
    pub async fn from_yaml(yaml: &str, probe: FakeProbe) -> Self {
        let config = PipelineConfig::from_yaml(yaml).expect("valid pipeline YAML");
        let mut definition = config.to_definition().expect("valid pipeline definition");
        definition.health = fast_health();

        let builder = Arc::new(FakeBuilder::default());
        let runtime = Arc::new(FakeRuntime::default());
        let probe = Arc::new(probe);
        let notifier = Arc::new(RecordingNotifier::default());

        let mut runner = StepRunner::new()
            .with_builder(builder.clone())
            .with_runtime(runtime.clone())
            .with_probe(probe.clone())
            .with_notifier(notifier.clone())
            .with_health(definition.health);
        if let Some(slot) = &definition.test_slot {
            runner = runner.with_test_slot(slot.clone());
        }

        let release = definition.production_slot.clone().map(|slot| {
            Arc::new(ReleaseManager::new(
                slot,
                runtime.clone(),
                probe.clone(),
                definition.health,
            ))
        });
        if let Some(manager) = &release {
            runner = runner.with_release_manager(manager.clone());
        }

        let controller = PipelineController::new(Arc::new(runner));
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        controller
            .add_event_handler(move |event| sink.lock().unwrap().push(event))
            .await;

        Self {
            definition,
            builder,
            runtime,
            probe,
            notifier,
            release,
            controller,
            events,
        }
    }

    pub async fn run(&self, version: &str) -> PipelineRun {
        self.run_with(settings(version)).await
    }

    pub async fn run_with(&self, settings: RunSettings) -> PipelineRun {
        self.events.lock().unwrap().clear();
        let ctx = Arc::new(RunContext::new(RunSettings {
            pipeline: self.definition.name.clone(),
            variables: self.definition.variables.clone(),
            ..settings
        }));
        self.controller.run(&self.definition, ctx).await
    }

    /// Events of the last run, as short labels
    pub fn event_labels(&self) -> Vec<String> {
        self.events.lock().unwrap().iter().map(event_label).collect()
    }

    pub fn release_manager(&self) -> &ReleaseManager {
        self.release.as_deref().expect("pipeline has a production slot")
    }
}

pub fn settings(version: &str) -> RunSettings {
    RunSettings {
        version: version.to_string(),
        branch: Some("main".to_string()),
        ..RunSettings::default()
    }
}

pub fn event_label(event: &ExecutionEvent) -> String {
    match event {
        ExecutionEvent::RunStarted { .. } => "run-started".to_string(),
        ExecutionEvent::StageStarted { stage, .. } => format!("started:{}", stage),
        ExecutionEvent::StageFinished { stage, .. } => format!("finished:{}", stage),
        ExecutionEvent::StageSkipped { stage, .. } => format!("skipped:{}", stage),
        ExecutionEvent::RunFinished { status, .. } => format!("run-finished:{:?}", status),
    }
}

/// Stage names paired with their outcomes, in run order
pub fn outcomes(run: &PipelineRun) -> Vec<(String, String)> {
    run.stages()
        .iter()
        .map(|s| (s.name.clone(), format!("{:?}", s.outcome)))
        .collect()
}

/// A bandit JSON report with `high` High and `medium` Medium issues
pub fn bandit_report(high: usize, medium: usize) -> String {
    let high = (0..high).map(|i| {
        format!(
            r#"{{"filename": "app/views.py", "line_number": {}, "issue_severity": "HIGH", "issue_text": "subprocess call with shell=True", "test_id": "B602"}}"#,
            i + 1
        )
    });
    let medium = (0..medium).map(|i| {
        format!(
            r#"{{"filename": "app/settings.py", "line_number": {}, "issue_severity": "MEDIUM", "issue_text": "possible hardcoded password", "test_id": "B105"}}"#,
            100 + i
        )
    });
    let results: Vec<String> = high.chain(medium).collect();
    format!(r#"{{"results": [{}]}}"#, results.join(", "))
}
