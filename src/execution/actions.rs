//! Step actions - dispatches each `StepAction` to its collaborator

use crate::core::{
    context::{render_template, AbortSignal, RunContext},
    error::PipelineError,
    slot::{Deployment, DeploymentSlot, SlotKind},
    stage::{FailurePolicy, StepAction, StepDefinition},
    state::StageOutcome,
};
use crate::external::{
    ArtifactBuilder, ContainerRuntime, ExternalError, LogNotifier, Notification, Notifier, ShellCommand,
};
use crate::health::{self, HttpProbe, PollSettings, ReadinessProbe};
use crate::release::ReleaseManager;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// What a successful step leaves behind
#[derive(Debug, Clone, Default)]
pub struct StepOutput {
    pub artifacts: Vec<String>,
    pub warnings: Vec<String>,
}

/// Combined result of running a list of steps
#[derive(Debug, Clone)]
pub struct SequenceOutcome {
    pub outcome: StageOutcome,
    pub error: Option<PipelineError>,
    pub artifacts: Vec<String>,
    pub warnings: Vec<String>,
}

impl Default for SequenceOutcome {
    fn default() -> Self {
        Self {
            outcome: StageOutcome::Success,
            error: None,
            artifacts: Vec::new(),
            warnings: Vec::new(),
        }
    }
}

impl SequenceOutcome {
    pub fn failed(&self) -> bool {
        self.outcome == StageOutcome::Failure
    }
}

/// Runs steps against the run's collaborators
pub struct StepRunner {
    builder: Option<Arc<dyn ArtifactBuilder>>,
    runtime: Option<Arc<dyn ContainerRuntime>>,
    probe: Arc<dyn ReadinessProbe>,
    notifier: Arc<dyn Notifier>,
    release: Option<Arc<ReleaseManager>>,
    test_slot: Option<DeploymentSlot>,
    health: PollSettings,
    command_timeout: Duration,
}

impl Default for StepRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl StepRunner {
    /// Runner with an HTTP probe, a log notifier and no builder or runtime
    pub fn new() -> Self {
        Self {
            builder: None,
            runtime: None,
            probe: Arc::new(HttpProbe::new()),
            notifier: Arc::new(LogNotifier),
            release: None,
            test_slot: None,
            health: PollSettings::default(),
            command_timeout: Duration::from_secs(3600),
        }
    }

    pub fn with_builder(mut self, builder: Arc<dyn ArtifactBuilder>) -> Self {
        self.builder = Some(builder);
        self
    }

    pub fn with_runtime(mut self, runtime: Arc<dyn ContainerRuntime>) -> Self {
        self.runtime = Some(runtime);
        self
    }

    pub fn with_probe(mut self, probe: Arc<dyn ReadinessProbe>) -> Self {
        self.probe = probe;
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn with_release_manager(mut self, manager: Arc<ReleaseManager>) -> Self {
        self.release = Some(manager);
        self
    }

    /// Empty test slot the `deploy` action starts instances in
    pub fn with_test_slot(mut self, slot: DeploymentSlot) -> Self {
        self.test_slot = Some(slot);
        self
    }

    pub fn with_health(mut self, health: PollSettings) -> Self {
        self.health = health;
        self
    }

    /// Run steps in order, stopping at the first failure that is not tolerated
    pub async fn run_sequence(
        &self,
        steps: &[StepDefinition],
        ctx: &RunContext,
        abort: &AbortSignal,
    ) -> SequenceOutcome {
        let mut sequence = SequenceOutcome::default();

        for step in steps {
            if abort.is_aborted() {
                sequence.outcome = StageOutcome::Failure;
                sequence.error = Some(PipelineError::Aborted(format!(
                    "step '{}' not started",
                    step.name
                )));
                break;
            }

            match self.run_step(step, ctx, abort).await {
                Ok(output) => {
                    sequence.artifacts.extend(output.artifacts);
                    sequence.warnings.extend(output.warnings);
                }
                Err(e) if matches!(e, PipelineError::Aborted(_)) => {
                    sequence.outcome = StageOutcome::Failure;
                    sequence.error = Some(e);
                    break;
                }
                Err(e) => match step.on_failure {
                    FailurePolicy::Fail => {
                        warn!(step = %step.name, error = %e, "step failed");
                        sequence.outcome = StageOutcome::Failure;
                        sequence.error = Some(e);
                        break;
                    }
                    FailurePolicy::Ignore => {
                        info!(step = %step.name, error = %e, "step failure ignored");
                        sequence
                            .warnings
                            .push(format!("step '{}' failed (ignored): {}", step.name, e));
                    }
                    FailurePolicy::Unstable => {
                        warn!(step = %step.name, error = %e, "step failure marks stage unstable");
                        sequence.outcome = sequence.outcome.worst(StageOutcome::Unstable);
                        sequence
                            .warnings
                            .push(format!("step '{}' failed (unstable): {}", step.name, e));
                    }
                },
            }
        }

        sequence
    }

    /// Run a single step. Every wait inside selects on `abort`.
    pub async fn run_step(
        &self,
        step: &StepDefinition,
        ctx: &RunContext,
        abort: &AbortSignal,
    ) -> Result<StepOutput, PipelineError> {
        debug!(step = %step.name, action = step.action.label(), "running step");

        match &step.action {
            StepAction::Command { run, env, workdir } => {
                self.command(step, ctx, run, env, workdir.as_deref(), abort).await
            }
            StepAction::Build => self.build(ctx, abort).await,
            StepAction::Deploy => self.deploy(ctx, abort).await,
            StepAction::Release => self.release(ctx, abort).await,
            StepAction::HealthCheck { slot } => self.health_check(ctx, *slot, abort).await,
            StepAction::Notify {
                subject,
                body,
                recipient,
            } => Ok(self.notify(ctx, subject, body, recipient.as_deref(), abort).await),
            StepAction::Archive { paths } => self.archive(ctx, paths).await,
        }
    }

    async fn command(
        &self,
        step: &StepDefinition,
        ctx: &RunContext,
        run: &str,
        env: &BTreeMap<String, String>,
        workdir: Option<&str>,
        abort: &AbortSignal,
    ) -> Result<StepOutput, PipelineError> {
        let vars = ctx.get_rendering_variables();
        let mut command = ShellCommand::new(render_template(run, &vars))
            .envs(ctx.command_env())
            .envs(env.iter().map(|(k, v)| (k.clone(), render_template(v, &vars))))
            .timeout(self.command_timeout);
        if let Some(dir) = workdir {
            command = command.workdir(render_template(dir, &vars));
        }

        let output = abortable(abort, &step.name, command.output())
            .await?
            .map_err(|e| match e {
                ExternalError::Exit { code, stderr, .. } => PipelineError::step(
                    step.name.clone(),
                    format!("exit code {}: {}", code, last_lines(&stderr, 5)),
                ),
                ExternalError::Timeout { secs, .. } => PipelineError::Timeout(secs),
                other => other.for_tool("shell"),
            })?;

        debug!(step = %step.name, stdout = %last_lines(&output.stdout, 3), "command succeeded");
        Ok(StepOutput::default())
    }

    async fn build(&self, ctx: &RunContext, abort: &AbortSignal) -> Result<StepOutput, PipelineError> {
        let builder = self
            .builder
            .as_ref()
            .ok_or_else(|| PipelineError::Configuration("no artifact builder configured".to_string()))?;

        let artifact = abortable(abort, "build", builder.build(&ctx.source_ref, &ctx.version))
            .await?
            .map_err(|e| e.for_tool("artifact builder"))?;

        info!(artifact = %artifact.id, version = %artifact.version, "artifact ready");
        let id = artifact.id.clone();
        ctx.resources.lock().await.artifact = Some(artifact);

        Ok(StepOutput {
            artifacts: vec![id],
            warnings: Vec::new(),
        })
    }

    /// Start the run's artifact in the test slot and wait for it
    async fn deploy(&self, ctx: &RunContext, abort: &AbortSignal) -> Result<StepOutput, PipelineError> {
        let runtime = self
            .runtime
            .as_ref()
            .ok_or_else(|| PipelineError::Configuration("no container runtime configured".to_string()))?;
        let template = self
            .test_slot
            .as_ref()
            .ok_or_else(|| PipelineError::Configuration("no test slot configured".to_string()))?;

        let (artifact, previous) = {
            let resources = ctx.resources.lock().await;
            let artifact = resources
                .artifact
                .clone()
                .ok_or_else(|| PipelineError::step("deploy", "no artifact was built in this run"))?;
            let previous = resources
                .test_slot
                .as_ref()
                .and_then(|slot| slot.current().cloned());
            (artifact, previous)
        };

        // A redeploy within the same run replaces the earlier test instance
        if let Some(previous) = previous {
            if let Err(e) = runtime.stop(&previous.instance).await {
                warn!(instance = %previous.instance.id, error = %e, "failed to stop earlier test instance");
            }
        }

        let binding = template.binding(template.port);
        let env = ctx.command_env();
        let instance = abortable(abort, "deploy", runtime.start(&artifact, &binding, &env))
            .await?
            .map_err(|e| e.for_tool("container runtime"))?;

        let instance_id = instance.id.clone();
        let mut slot = template.clone();
        slot.replace_current(Deployment::new(artifact, instance));
        let url = slot.health_url_for(slot.port);
        ctx.resources.lock().await.test_slot = Some(slot);

        let attempts = health::poll(self.probe.as_ref(), &url, &self.health, abort)
            .await
            .into_result(&url)?;
        info!(instance = %instance_id, %url, attempts, "test deployment healthy");

        Ok(StepOutput {
            artifacts: vec![instance_id],
            warnings: Vec::new(),
        })
    }

    async fn release(&self, ctx: &RunContext, abort: &AbortSignal) -> Result<StepOutput, PipelineError> {
        let manager = self
            .release
            .as_ref()
            .ok_or_else(|| PipelineError::Configuration("no production slot configured".to_string()))?;

        let (artifact, test_slot) = {
            let resources = ctx.resources.lock().await;
            let artifact = resources
                .artifact
                .clone()
                .ok_or_else(|| PipelineError::step("release", "no artifact was built in this run"))?;
            (artifact, resources.test_slot.clone())
        };

        let result = manager
            .release(&artifact, test_slot.as_ref(), &ctx.command_env(), abort)
            .await;

        match result {
            Ok(record) => {
                let marker = format!("release:{}", record.version);
                ctx.resources.lock().await.releases.push(record);
                Ok(StepOutput {
                    artifacts: vec![marker],
                    warnings: Vec::new(),
                })
            }
            Err(e) => {
                if let Some(record) = e.record() {
                    ctx.resources.lock().await.releases.push(record.clone());
                }
                Err(e.into_pipeline_error())
            }
        }
    }

    async fn health_check(
        &self,
        ctx: &RunContext,
        slot: SlotKind,
        abort: &AbortSignal,
    ) -> Result<StepOutput, PipelineError> {
        let url = match slot {
            SlotKind::Test => ctx
                .resources
                .lock()
                .await
                .test_slot
                .as_ref()
                .and_then(DeploymentSlot::current_health_url),
            SlotKind::Production => match &self.release {
                Some(manager) => manager.current_health_url().await,
                None => None,
            },
        }
        .ok_or_else(|| PipelineError::step("health_check", format!("nothing is deployed in the {} slot", slot)))?;

        let attempts = health::poll(self.probe.as_ref(), &url, &self.health, abort)
            .await
            .into_result(&url)?;
        info!(%slot, %url, attempts, "slot healthy");
        Ok(StepOutput::default())
    }

    /// Notification failures only ever become warnings
    async fn notify(
        &self,
        ctx: &RunContext,
        subject: &str,
        body: &str,
        recipient: Option<&str>,
        abort: &AbortSignal,
    ) -> StepOutput {
        let vars = ctx.get_rendering_variables();
        let notification = Notification {
            subject: render_template(subject, &vars),
            body: render_template(body, &vars),
            recipient: recipient
                .map(|r| render_template(r, &vars))
                .or_else(|| ctx.notify.clone()),
        };

        let warning = match abortable(abort, "notify", self.notifier.notify(&notification)).await {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(format!("notification '{}' not sent: {}", notification.subject, e)),
            Err(e) => Some(format!("notification '{}' not sent: {}", notification.subject, e)),
        };

        if let Some(warning) = &warning {
            warn!("{}", warning);
        }
        StepOutput {
            artifacts: Vec::new(),
            warnings: warning.into_iter().collect(),
        }
    }

    async fn archive(&self, ctx: &RunContext, patterns: &[String]) -> Result<StepOutput, PipelineError> {
        let vars = ctx.get_rendering_variables();
        let mut output = StepOutput::default();

        for pattern in patterns {
            let pattern = render_template(pattern, &vars);
            let paths = glob::glob(&pattern).map_err(|e| {
                PipelineError::step("archive", format!("invalid pattern '{}': {}", pattern, e))
            })?;

            let before = output.artifacts.len();
            for entry in paths {
                match entry {
                    Ok(path) => output.artifacts.push(path.display().to_string()),
                    Err(e) => output.warnings.push(format!("cannot read {}: {}", pattern, e)),
                }
            }
            if output.artifacts.len() == before {
                output.warnings.push(format!("archive pattern '{}' matched nothing", pattern));
            }
        }

        debug!(count = output.artifacts.len(), "archived paths");
        ctx.resources
            .lock()
            .await
            .archived
            .extend(output.artifacts.iter().cloned());
        Ok(output)
    }

    /// Release what the run acquired. Returns problems as warnings.
    pub async fn cleanup(&self, ctx: &RunContext) -> Vec<String> {
        let mut warnings = Vec::new();
        let test_slot = ctx.resources.lock().await.test_slot.take();

        let Some(mut slot) = test_slot else {
            return warnings;
        };
        let Some(deployment) = slot.take_current() else {
            return warnings;
        };

        match &self.runtime {
            Some(runtime) => match runtime.stop(&deployment.instance).await {
                Ok(()) => info!(instance = %deployment.instance.id, "test deployment removed"),
                Err(e) => warnings.push(format!(
                    "test instance {} not stopped: {}",
                    deployment.instance.id, e
                )),
            },
            None => warnings.push(format!(
                "test instance {} left running: no runtime",
                deployment.instance.id
            )),
        }
        warnings
    }
}

/// Race `work` against the abort signal
async fn abortable<F, T>(abort: &AbortSignal, what: &str, work: F) -> Result<T, PipelineError>
where
    F: Future<Output = T>,
{
    tokio::select! {
        biased;
        _ = abort.cancelled() => Err(PipelineError::Aborted(format!("{} interrupted", what))),
        value = work => Ok(value),
    }
}

fn last_lines(text: &str, count: usize) -> String {
    let lines: Vec<&str> = text.trim_end().lines().collect();
    let start = lines.len().saturating_sub(count);
    lines[start..].join("\n")
}
