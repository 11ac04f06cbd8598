use anyhow::{bail, Context, Result};
use release_pipeline::cli::commands::{HistoryCommand, RunCommand, ValidateCommand};
use release_pipeline::cli::output::*;
use release_pipeline::cli::{Cli, Command};
use release_pipeline::core::config::PipelineConfig;
use release_pipeline::core::{RunContext, RunSettings};
use release_pipeline::execution::{ExecutionEvent, PipelineController, StepRunner};
use release_pipeline::external::{
    CommandBuilder, CommandRuntime, ContainerRuntime, LogNotifier, Notifier, WebhookNotifier,
};
use release_pipeline::health::{HttpProbe, ReadinessProbe};
use release_pipeline::persistence::{
    create_summary, PersistenceBackend, RunRecord, RunSummary, SlotStateStore,
};
use release_pipeline::release::ReleaseManager;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::from_args();

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to set logging subscriber: {}", e))?;

    // Execute command
    match &cli.command {
        Command::RunPipeline(cmd) => {
            let code = run_pipeline(cmd).await?;
            std::process::exit(code);
        }
        Command::Validate(cmd) => validate_pipeline(cmd)?,
        Command::History(cmd) => show_history(cmd).await?,
    }

    Ok(())
}

async fn run_pipeline(cmd: &RunCommand) -> Result<i32> {
    // Load pipeline config; configuration errors stop before any stage runs
    let config = PipelineConfig::from_file(&cmd.config).context("Failed to load pipeline config")?;
    let definition = config.to_definition().context("Invalid pipeline definition")?;

    println!("{} Loaded pipeline: {}", INFO, style(&config.name).bold());

    let version = cmd
        .version
        .clone()
        .or_else(|| config.version.clone())
        .or_else(|| std::env::var("BUILD_VERSION").ok())
        .filter(|v| !v.is_empty());
    let Some(version) = version else {
        bail!("No version: pass --version, set it in the config or export BUILD_VERSION");
    };
    let branch = cmd
        .branch
        .clone()
        .or_else(|| config.branch.clone())
        .or_else(|| std::env::var("BRANCH_NAME").ok());

    // Apply variable overrides
    let mut variables = definition.variables.clone();
    for (key, value) in &cmd.variable {
        variables.insert(key.clone(), value.clone());
        println!("{} Variable override: {} = {}", INFO, style(key).cyan(), style(value).dim());
    }

    let ctx = Arc::new(RunContext::new(RunSettings {
        pipeline: config.name.clone(),
        version,
        branch,
        source_ref: config.source.clone(),
        force_release: cmd.force_release,
        security_level: cmd.security_level.into(),
        notify: cmd.notify.clone().or_else(|| config.notifications.recipient.clone()),
        variables,
    }));

    let runner = build_runner(&config, &definition)?;
    let controller = PipelineController::new(Arc::new(runner));

    // Console output and progress over the stages
    let progress = create_progress_bar(definition.stages.len());
    let bar = progress.clone();
    controller
        .add_event_handler(move |event| {
            bar.println(format_execution_event(&event));
            if matches!(
                event,
                ExecutionEvent::StageFinished { .. } | ExecutionEvent::StageSkipped { .. }
            ) {
                bar.inc(1);
            }
        })
        .await;

    // Ctrl-C aborts the run cooperatively
    let abort = ctx.abort_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, aborting run");
            abort.abort();
        }
    });

    println!();
    let run = controller.run(&definition, ctx.clone()).await;
    progress.finish_and_clear();

    println!("\n{}", format_run_report(&run));

    if let Some(dir) = &config.archive_dir {
        match RunRecord::from_run(&run).write_to(dir) {
            Ok(path) => println!("{} Run record written to {}", INFO, style(path.display()).dim()),
            Err(e) => warn!("failed to write run record: {:#}", e),
        }
    }

    if !cmd.no_history {
        let summary = create_summary(&run);
        match history_store().await {
            Ok(store) => {
                if record_history(store.as_ref(), &summary).await {
                    println!(
                        "{} Run saved to history (ID: {})",
                        INFO,
                        style(&summary.run_id.to_string()[..8]).dim()
                    );
                }
            }
            Err(e) => warn!("run history unavailable: {:#}", e),
        }
    }

    info!(status = ?run.status(), "done");
    Ok(run.status().exit_code())
}

/// Save the run summary. The run is already decided, so a failed write is
/// only logged.
async fn record_history(store: &dyn PersistenceBackend, summary: &RunSummary) -> bool {
    match store.save_run(summary).await {
        Ok(()) => true,
        Err(e) => {
            warn!(run_id = %summary.run_id, "failed to save run history: {:#}", e);
            false
        }
    }
}

/// Wire the configured collaborators into a step runner
fn build_runner(
    config: &PipelineConfig,
    definition: &release_pipeline::core::PipelineDefinition,
) -> Result<StepRunner> {
    let probe: Arc<dyn ReadinessProbe> = Arc::new(HttpProbe::new());
    let notifier: Arc<dyn Notifier> = match &config.notifications.webhook {
        Some(url) => Arc::new(WebhookNotifier::new(url)),
        None => Arc::new(LogNotifier),
    };

    let mut runner = StepRunner::new()
        .with_probe(probe.clone())
        .with_notifier(notifier)
        .with_health(definition.health);

    if let Some(builder) = &config.builder {
        let mut command = CommandBuilder::new(&builder.command);
        if let Some(artifact) = &builder.artifact {
            command = command.with_artifact_template(artifact);
        }
        runner = runner.with_builder(Arc::new(command));
    }

    let runtime: Option<Arc<dyn ContainerRuntime>> = config
        .runtime
        .as_ref()
        .map(|r| Arc::new(CommandRuntime::new(&r.start, &r.stop)) as Arc<dyn ContainerRuntime>);

    if let Some(runtime) = &runtime {
        runner = runner.with_runtime(runtime.clone());
    }

    if let Some(slot) = &definition.test_slot {
        runner = runner.with_test_slot(slot.clone());
    }

    if let (Some(template), Some(runtime)) = (&definition.production_slot, &runtime) {
        let store = SlotStateStore::in_dir(state_dir(config), &format!("{}-{}", config.name, template.name));
        let slot = store
            .restore(template.clone())
            .with_context(|| format!("Failed to restore slot state from {}", store.path().display()))?;
        if let Some(version) = slot.current_version() {
            println!("{} Production is running {}", INFO, style(version).cyan());
        }
        let manager = ReleaseManager::new(slot, runtime.clone(), probe, definition.health)
            .with_state_store(store);
        runner = runner.with_release_manager(Arc::new(manager));
    }

    Ok(runner)
}

fn state_dir(config: &PipelineConfig) -> PathBuf {
    match &config.state_dir {
        Some(dir) => PathBuf::from(dir),
        None => dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("release-pipeline")
            .join("state"),
    }
}

#[cfg(feature = "sqlite")]
async fn history_store() -> Result<Arc<dyn PersistenceBackend>> {
    Ok(Arc::new(
        release_pipeline::persistence::SqliteRunStore::with_default_path().await?,
    ))
}

#[cfg(not(feature = "sqlite"))]
async fn history_store() -> Result<Arc<dyn PersistenceBackend>> {
    Ok(Arc::new(release_pipeline::persistence::InMemoryPersistence::new()))
}

fn validate_pipeline(cmd: &ValidateCommand) -> Result<()> {
    println!("{} Validating pipeline...", INFO);

    let result = PipelineConfig::from_file(&cmd.config).and_then(|config| {
        let definition = config.to_definition()?;
        Ok((config, definition))
    });

    match result {
        Ok((config, definition)) => {
            println!("{} Pipeline configuration is valid!", CHECK);
            println!("  Name: {}", style(&config.name).bold());
            println!("  Stages: {}", style(definition.stages.len()).cyan());
            for stage in &definition.stages {
                println!(
                    "    {} {} ({} steps, {} branches)",
                    style(&stage.name).bold(),
                    style(format!("[{}]", stage.kind)).dim(),
                    stage.steps.len(),
                    stage.branches.len()
                );
            }
            println!("  Gates: {}", style(definition.gates.len()).cyan());

            if cmd.json {
                let json = serde_json::to_string_pretty(&config)?;
                println!("\n{}", json);
            }
            Ok(())
        }
        Err(e) => {
            println!("{} Validation failed:", CROSS);
            println!("  {}", style(e).red());
            std::process::exit(1);
        }
    }
}

async fn show_history(cmd: &HistoryCommand) -> Result<()> {
    let store = history_store().await?;

    // If a specific run ID is requested
    if let Some(run_id) = &cmd.run_id {
        let run_id = uuid::Uuid::parse_str(run_id).context("Invalid run ID format")?;
        match store.load_run(run_id).await? {
            Some(summary) => print_run_details(&summary),
            None => println!("{} Run not found", WARN),
        }
        return Ok(());
    }

    let mut runs: Vec<RunSummary> = if let Some(pipeline) = &cmd.pipeline {
        store.list_runs(pipeline).await?
    } else {
        let mut all_runs = Vec::new();
        for pipeline in &store.list_pipelines().await? {
            all_runs.extend(store.list_runs(pipeline).await?);
        }
        all_runs.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        all_runs
    };
    runs.truncate(cmd.limit);

    if runs.is_empty() {
        println!("{} No runs found", INFO);
        return Ok(());
    }

    if cmd.json {
        let data = serde_json::json!({ "runs": runs });
        println!("{}", serde_json::to_string_pretty(&data)?);
    } else {
        println!("{} Run history (showing latest {}):", INFO, cmd.limit);
        for summary in &runs {
            println!("  {}", format_run_summary(summary));
        }
    }

    Ok(())
}

fn print_run_details(summary: &RunSummary) {
    println!("{} Run Details", INFO);
    println!("  ID: {}", style(summary.run_id).cyan());
    println!("  Pipeline: {}", style(&summary.pipeline).bold());
    println!("  Version: {}", style(&summary.version).cyan());
    println!("  Status: {}", format_status(summary.status));
    println!("  Started: {}", style(summary.started_at.to_rfc3339()).dim());
    if let Some(finished) = summary.finished_at {
        println!("  Finished: {}", style(finished.to_rfc3339()).dim());
        if let Ok(duration) = finished.signed_duration_since(summary.started_at).to_std() {
            println!("  Duration: {}", style(format_duration(duration)).dim());
        }
    }
    println!("  Stages: {} run, {} failed", summary.stages_run, summary.stages_failed);
    if let Some(released) = &summary.released {
        println!("  Released: {}", style(released).green());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use release_pipeline::core::RunStatus;
    use release_pipeline::persistence::InMemoryPersistence;
    use uuid::Uuid;

    struct ReadOnlyHistory;

    #[async_trait::async_trait]
    impl PersistenceBackend for ReadOnlyHistory {
        async fn save_run(&self, _summary: &RunSummary) -> Result<()> {
            bail!("attempt to write a readonly database")
        }

        async fn load_run(&self, _run_id: Uuid) -> Result<Option<RunSummary>> {
            Ok(None)
        }

        async fn list_runs(&self, _pipeline: &str) -> Result<Vec<RunSummary>> {
            Ok(Vec::new())
        }

        async fn list_pipelines(&self) -> Result<Vec<String>> {
            Ok(Vec::new())
        }
    }

    fn summary() -> RunSummary {
        RunSummary {
            run_id: Uuid::new_v4(),
            pipeline: "shop".to_string(),
            version: "1.0.0".to_string(),
            status: RunStatus::Unstable,
            started_at: chrono::Utc::now(),
            finished_at: None,
            stages_run: 3,
            stages_failed: 0,
            released: Some("1.0.0".to_string()),
        }
    }

    #[tokio::test]
    async fn test_history_write_failure_is_not_an_error() {
        assert!(!record_history(&ReadOnlyHistory, &summary()).await);
    }

    #[tokio::test]
    async fn test_history_write_is_saved() {
        let store = InMemoryPersistence::new();
        let summary = summary();

        assert!(record_history(&store, &summary).await);
        assert_eq!(store.load_run(summary.run_id).await.unwrap(), Some(summary));
    }
}
