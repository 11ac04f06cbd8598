//! Pipeline controller - runs the stages of a pipeline in order

use crate::core::{
    context::RunContext,
    error::{PipelineError, StageError},
    pipeline::PipelineDefinition,
    stage::StageKind,
    state::{PipelineRun, RunStatus, StageOutcome, StageResult},
};
use crate::execution::{actions::StepRunner, executor::StageExecutor};
use crate::findings::ParserRegistry;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::time::{sleep_until, Instant};
use tracing::{error, info, warn};
use uuid::Uuid;

/// Events that can occur during a pipeline run
#[derive(Debug, Clone)]
pub enum ExecutionEvent {
    RunStarted {
        run_id: Uuid,
        pipeline: String,
        stages: usize,
    },
    StageStarted {
        stage: String,
        kind: StageKind,
    },
    StageFinished {
        stage: String,
        outcome: StageOutcome,
        error: Option<String>,
    },
    StageSkipped {
        stage: String,
        reason: String,
    },
    RunFinished {
        run_id: Uuid,
        status: RunStatus,
    },
}

/// Type for event handlers
pub type EventHandler = Arc<dyn Fn(ExecutionEvent) + Send + Sync>;

/// Drives a run: stage ordering, the run deadline, cleanup and events
pub struct PipelineController {
    runner: Arc<StepRunner>,
    parsers: ParserRegistry,
    event_handlers: Arc<Mutex<Vec<EventHandler>>>,
}

impl PipelineController {
    pub fn new(runner: Arc<StepRunner>) -> Self {
        Self {
            runner,
            parsers: ParserRegistry::default(),
            event_handlers: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn with_parsers(mut self, parsers: ParserRegistry) -> Self {
        self.parsers = parsers;
        self
    }

    /// Add an event handler
    pub async fn add_event_handler<F>(&self, handler: F)
    where
        F: Fn(ExecutionEvent) + Send + Sync + 'static,
    {
        self.event_handlers.lock().await.push(Arc::new(handler));
    }

    /// Emit an event to all handlers
    async fn emit_event(&self, event: ExecutionEvent) {
        let handlers = self.event_handlers.lock().await;
        for handler in handlers.iter() {
            handler(event.clone());
        }
    }

    /// Execute every stage of `definition` and return the finished run
    pub async fn run(&self, definition: &PipelineDefinition, ctx: Arc<RunContext>) -> PipelineRun {
        let mut run = PipelineRun::new(ctx.run_id, &definition.name, &ctx.version);
        let executor = StageExecutor::new(self.runner.clone())
            .with_parsers(self.parsers.clone())
            .with_gates(definition.gates.clone())
            .with_hook_timeout(definition.hook_timeout);

        info!(run_id = %ctx.run_id, pipeline = %definition.name, version = %ctx.version, "starting pipeline run");
        self.emit_event(ExecutionEvent::RunStarted {
            run_id: ctx.run_id,
            pipeline: definition.name.clone(),
            stages: definition.stages.len(),
        })
        .await;

        run.start();
        let deadline = Instant::now() + definition.run_timeout;
        let mut halted: Option<String> = None;

        for stage in &definition.stages {
            if let Some(reason) = &halted {
                self.record_skip(&mut run, StageResult::skipped(&stage.name, stage.kind, reason.clone()))
                    .await;
                continue;
            }

            if !stage.when.evaluate(&ctx) {
                info!(stage = %stage.name, "activation condition not met, skipping");
                self.record_skip(
                    &mut run,
                    StageResult::skipped(&stage.name, stage.kind, "activation condition not met"),
                )
                .await;
                continue;
            }

            self.emit_event(ExecutionEvent::StageStarted {
                stage: stage.name.clone(),
                kind: stage.kind,
            })
            .await;

            let stage_run = executor.run(stage, &ctx);
            tokio::pin!(stage_run);

            let finished = tokio::select! {
                biased;
                result = &mut stage_run => Some(result),
                _ = sleep_until(deadline) => None,
            };

            let mut result = match finished {
                Some(result) => result,
                None => {
                    warn!(stage = %stage.name, "run deadline reached, aborting");
                    ctx.abort();
                    let mut result = stage_run.await;
                    result.outcome = StageOutcome::Failure;
                    result.error = Some(StageError::from(PipelineError::Timeout(
                        definition.run_timeout.as_secs(),
                    )));
                    result.warnings.push(format!(
                        "pipeline timed out after {}s",
                        definition.run_timeout.as_secs()
                    ));
                    result
                }
            };

            let releases = std::mem::take(&mut ctx.resources.lock().await.releases);
            for record in releases {
                run.record_release(record);
            }

            self.emit_event(ExecutionEvent::StageFinished {
                stage: result.name.clone(),
                outcome: result.outcome,
                error: result.error.as_ref().map(|e| e.message.clone()),
            })
            .await;

            match result.outcome {
                StageOutcome::Failure if stage.best_effort && !ctx.abort_signal().is_aborted() => {
                    warn!(stage = %stage.name, "best-effort stage failed, run continues as unstable");
                    run.add_warning(format!("best-effort stage '{}' failed", stage.name));
                    run.mark_unstable();
                }
                StageOutcome::Failure => {
                    error!(stage = %stage.name, "stage failed, halting pipeline");
                    halted = Some(format!("stage '{}' failed", stage.name));
                }
                StageOutcome::Unstable => run.mark_unstable(),
                _ => {}
            }

            // A failing stage's result still carries its error
            if result.outcome == StageOutcome::Failure && result.error.is_none() {
                result.error = Some(StageError::from(PipelineError::step(&stage.name, "stage failed")));
            }
            run.record_stage(result);
        }

        for warning in self.runner.cleanup(&ctx).await {
            warn!("{}", warning);
            run.add_warning(warning);
        }

        let status = if halted.is_some() {
            RunStatus::Failure
        } else if run.is_unstable() {
            RunStatus::Unstable
        } else {
            RunStatus::Success
        };
        run.finish(status);

        info!(run_id = %ctx.run_id, ?status, "pipeline run finished");
        self.emit_event(ExecutionEvent::RunFinished {
            run_id: ctx.run_id,
            status,
        })
        .await;

        run
    }

    async fn record_skip(&self, run: &mut PipelineRun, result: StageResult) {
        self.emit_event(ExecutionEvent::StageSkipped {
            stage: result.name.clone(),
            reason: result.skip_reason.clone().unwrap_or_default(),
        })
        .await;
        run.record_stage(result);
    }
}
