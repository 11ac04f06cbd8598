//! CLI output formatting

use crate::{
    core::{
        slot::{ReleaseRecord, ReleaseResult},
        state::{PipelineRun, RunStatus, StageOutcome, StageResult},
    },
    execution::ExecutionEvent,
    persistence::RunSummary,
};
use console::Emoji;
use indicatif::{ProgressBar, ProgressStyle};
use std::time::Duration;

// Re-export style
pub use console::style;

// Emojis for output
pub static CHECK: Emoji<'_, '_> = Emoji("✅ ", "✓ ");
pub static CROSS: Emoji<'_, '_> = Emoji("❌ ", "✗ ");
pub static SPINNER: Emoji<'_, '_> = Emoji("⏳ ", "~ ");
pub static INFO: Emoji<'_, '_> = Emoji("ℹ️  ", "i ");
pub static WARN: Emoji<'_, '_> = Emoji("⚠️  ", "! ");
pub static ROCKET: Emoji<'_, '_> = Emoji("🚀 ", "> ");
pub static SKIP: Emoji<'_, '_> = Emoji("⏭️  ", "- ");

/// Create a progress bar over the stages of a run
pub fn create_progress_bar(total: usize) -> ProgressBar {
    let progress = ProgressBar::new(total as u64);
    if let Ok(bar_style) = ProgressStyle::default_bar()
        .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")
    {
        progress.set_style(bar_style.progress_chars("#>-"));
    }
    progress.enable_steady_tick(Duration::from_millis(100));
    progress
}

/// Format a stage outcome for display
pub fn format_outcome(outcome: StageOutcome) -> String {
    match outcome {
        StageOutcome::Success => style("SUCCESS").green().to_string(),
        StageOutcome::Unstable => style("UNSTABLE").yellow().to_string(),
        StageOutcome::Failure => style("FAILURE").red().to_string(),
        StageOutcome::Skipped => style("SKIPPED").dim().to_string(),
    }
}

/// Format a run status for display
pub fn format_status(status: RunStatus) -> String {
    match status {
        RunStatus::Pending => style("PENDING").dim().to_string(),
        RunStatus::Running => style("RUNNING").yellow().to_string(),
        RunStatus::Success => style("SUCCESS").green().to_string(),
        RunStatus::Unstable => style("UNSTABLE").yellow().to_string(),
        RunStatus::Failure => style("FAILURE").red().to_string(),
    }
}

fn status_icon(status: RunStatus) -> Emoji<'static, 'static> {
    match status {
        RunStatus::Success => CHECK,
        RunStatus::Failure => CROSS,
        RunStatus::Unstable => WARN,
        RunStatus::Running => SPINNER,
        RunStatus::Pending => INFO,
    }
}

/// Format a run summary for display
pub fn format_run_summary(summary: &RunSummary) -> String {
    let released = summary
        .released
        .as_ref()
        .map(|v| format!(" - released {}", style(v).cyan()))
        .unwrap_or_default();

    format!(
        "{} {} - {} {} - {} ({} stages, {} failed){}",
        status_icon(summary.status),
        style(&summary.run_id.to_string()[..8]).dim(),
        style(&summary.pipeline).bold(),
        style(&summary.version).dim(),
        format_status(summary.status),
        summary.stages_run,
        summary.stages_failed,
        released
    )
}

/// Format an execution event for display
pub fn format_execution_event(event: &ExecutionEvent) -> String {
    match event {
        ExecutionEvent::RunStarted {
            run_id,
            pipeline,
            stages,
        } => format!(
            "{} Starting pipeline {} ({}, {} stages)",
            ROCKET,
            style(pipeline).bold(),
            style(&run_id.to_string()[..8]).dim(),
            stages
        ),
        ExecutionEvent::StageStarted { stage, kind } => {
            format!("{} {} {}", SPINNER, style(stage).cyan(), style(format!("[{}]", kind)).dim())
        }
        ExecutionEvent::StageFinished { stage, outcome, error } => {
            let icon = match outcome {
                StageOutcome::Success => CHECK,
                StageOutcome::Unstable => WARN,
                StageOutcome::Failure => CROSS,
                StageOutcome::Skipped => SKIP,
            };
            match error {
                Some(error) => format!("{} {}: {}", icon, style(stage).red(), style(error).dim()),
                None => format!("{} {} {}", icon, style(stage).green(), format_outcome(*outcome)),
            }
        }
        ExecutionEvent::StageSkipped { stage, reason } => {
            format!("{} {} ({})", SKIP, style(stage).dim(), style(reason).dim())
        }
        ExecutionEvent::RunFinished { run_id, status } => format!(
            "{} Pipeline ({}) finished: {}",
            status_icon(*status),
            style(&run_id.to_string()[..8]).dim(),
            format_status(*status)
        ),
    }
}

fn format_stage_line(stage: &StageResult) -> String {
    let duration = (stage.finished_at - stage.started_at)
        .to_std()
        .map(format_duration)
        .unwrap_or_default();
    let mut line = format!(
        "  {:<20} {:<10} {}",
        stage.name,
        format_outcome(stage.outcome),
        style(duration).dim()
    );
    if let Some(gate) = &stage.gate {
        line.push_str(&format!("  {}", style(gate.summary()).dim()));
    }
    if let Some(error) = &stage.error {
        line.push_str(&format!("\n      {} {}", style(error.kind).red(), error.message));
    }
    line
}

fn format_release(record: &ReleaseRecord) -> String {
    let result = match record.result {
        ReleaseResult::Live => style("live").green().to_string(),
        ReleaseResult::RolledBack => style("rolled back").red().to_string(),
    };
    let previous = record
        .previous_version
        .as_ref()
        .map(|v| format!(" (previous {})", v))
        .unwrap_or_default();
    format!("  {} {} {}{}", style(&record.version).bold(), record.strategy, result, previous)
}

/// Final summary of a finished run
pub fn format_run_report(run: &PipelineRun) -> String {
    let mut lines = vec![format!(
        "{} {} {}: {}",
        status_icon(run.status()),
        style(run.pipeline()).bold(),
        style(run.version()).dim(),
        format_status(run.status())
    )];

    lines.extend(run.stages().iter().map(format_stage_line));

    if !run.releases().is_empty() {
        lines.push(style("Releases:").bold().to_string());
        lines.extend(run.releases().iter().map(format_release));
    }

    let warnings: Vec<&String> = run
        .warnings()
        .iter()
        .chain(run.stages().iter().flat_map(|s| s.warnings.iter()))
        .collect();
    if !warnings.is_empty() {
        lines.push(format!("{}{} warning(s):", WARN, warnings.len()));
        lines.extend(warnings.iter().map(|w| format!("  {}", style(w).yellow())));
    }

    lines.join("\n")
}

pub fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    if secs < 60 {
        format!("{}s", secs)
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{}h {}m {}s", secs / 3600, (secs % 3600) / 60, secs % 60)
    }
}
