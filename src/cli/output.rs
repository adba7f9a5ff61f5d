//! CLI output formatting

use crate::core::pipeline::PipelineGraph;
use crate::core::state::{JobState, RunStatus};
use crate::ledger::{EventKind, RunEvent, RunSnapshot};
use crate::persistence::RunSummary;
use console::Emoji;
use indicatif::{ProgressBar, ProgressStyle};
use std::time::Duration;

pub use console::style;

pub static CHECK: Emoji<'_, '_> = Emoji("✅ ", "✓ ");
pub static CROSS: Emoji<'_, '_> = Emoji("❌ ", "✗ ");
pub static SPINNER: Emoji<'_, '_> = Emoji("⏳ ", "~ ");
pub static INFO: Emoji<'_, '_> = Emoji("ℹ️  ", "i ");
pub static WARN: Emoji<'_, '_> = Emoji("⚠️  ", "! ");
pub static ROCKET: Emoji<'_, '_> = Emoji("🚀 ", "> ");
pub static SKIP: Emoji<'_, '_> = Emoji("⏭️  ", "- ");
pub static PACKAGE: Emoji<'_, '_> = Emoji("📦 ", "* ");

/// Create a progress bar over the jobs of a run
pub fn create_progress_bar(total: usize) -> ProgressBar {
    let progress = ProgressBar::new(total as u64);
    let style = ProgressStyle::default_bar()
        .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("#>-");
    progress.set_style(style);
    progress.enable_steady_tick(Duration::from_millis(100));
    progress
}

/// Format a job state for display
pub fn format_job_state(state: JobState) -> String {
    let label = state.to_string().to_uppercase();
    match state {
        JobState::Pending | JobState::Blocked | JobState::Skipped => style(label).dim().to_string(),
        JobState::Runnable | JobState::Running => style(label).yellow().to_string(),
        JobState::Succeeded => style(label).green().to_string(),
        JobState::Failed => style(label).red().to_string(),
        JobState::Cancelled => style(label).magenta().to_string(),
    }
}

/// Format a run status for display
pub fn format_status(status: RunStatus) -> String {
    let label = status.to_string().to_uppercase();
    match status {
        RunStatus::Pending => style(label).dim().to_string(),
        RunStatus::Running => style(label).yellow().to_string(),
        RunStatus::Succeeded => style(label).green().to_string(),
        RunStatus::Failed => style(label).red().to_string(),
        RunStatus::Cancelled => style(label).magenta().to_string(),
    }
}

fn short_id(id: &uuid::Uuid) -> String {
    id.to_string().chars().take(8).collect()
}

/// One-line summary of a recorded run
pub fn format_run_summary(summary: &RunSummary) -> String {
    let icon = match summary.status {
        RunStatus::Succeeded => CHECK,
        RunStatus::Failed => CROSS,
        RunStatus::Running => SPINNER,
        _ => INFO,
    };

    format!(
        "{} {} - {} - {} ({} ok, {} failed, {} skipped, {} cancelled of {}) - {}",
        icon,
        style(short_id(&summary.run_id)).dim(),
        style(&summary.pipeline_name).bold(),
        format_status(summary.status),
        summary.succeeded_jobs,
        summary.failed_jobs,
        summary.skipped_jobs,
        summary.cancelled_jobs,
        summary.total_jobs,
        style(summary.started_at.format("%Y-%m-%d %H:%M:%S").to_string()).dim()
    )
}

/// Format a ledger event for the live run view; `None` for events not shown
pub fn format_event(event: &RunEvent) -> Option<String> {
    let line = match &event.kind {
        EventKind::RunStarted { pipeline, event: trigger, jobs } => format!(
            "{} Starting {} ({}) on {} {} with {} jobs",
            ROCKET,
            style(pipeline).bold(),
            style(short_id(&event.run_id)).dim(),
            trigger.event_type,
            style(&trigger.branch).cyan(),
            jobs.len()
        ),
        EventKind::JobStateChanged { job, to, reason, .. } => {
            let reason = reason
                .as_ref()
                .map(|r| format!(" ({})", style(r).dim()))
                .unwrap_or_default();
            match to {
                JobState::Running => format!("{} {}", SPINNER, style(job).cyan()),
                JobState::Succeeded => format!("{} {}", CHECK, style(job).green()),
                JobState::Failed => format!("{} {}{}", CROSS, style(job).red(), reason),
                JobState::Skipped => format!("{} {}{}", SKIP, style(job).dim(), reason),
                JobState::Cancelled => format!("{} {} cancelled{}", WARN, style(job).magenta(), reason),
                _ => return None,
            }
        }
        EventKind::JobRetrying {
            job,
            attempt,
            delay_ms,
            reason,
        } => format!(
            "{} {} retrying (attempt {}, in {}ms): {}",
            WARN,
            style(job).yellow(),
            attempt,
            delay_ms,
            style(reason).dim()
        ),
        EventKind::StepFinished { job, step, exit_code } if *exit_code != 0 => format!(
            "  {} {} / {} exited with {}",
            CROSS,
            style(job).dim(),
            step,
            style(exit_code).red()
        ),
        EventKind::GateEvaluated { job, gate, result } => {
            format!("{} gate {} of {}: {}", INFO, style(gate).bold(), job, result)
        }
        EventKind::ArtifactStored { job, artifact } => format!(
            "{} {} stored {} ({} bytes)",
            PACKAGE,
            style(job).dim(),
            style(&artifact.name).cyan(),
            artifact.size
        ),
        _ => return None,
    };
    Some(line)
}

/// Horizontal rule across the terminal
pub fn rule() -> String {
    let width = term_size::dimensions_stdout().map(|(w, _)| w).unwrap_or(80);
    "─".repeat(width)
}

/// Per-job table of a finished run
pub fn format_snapshot(snapshot: &RunSnapshot) -> String {
    let width = snapshot.jobs.iter().map(|j| j.name.len()).max().unwrap_or(0);
    let mut lines = Vec::with_capacity(snapshot.jobs.len());
    for job in &snapshot.jobs {
        let mut line = format!("  {:width$}  {}", job.name, format_job_state(job.state), width = width);
        if job.attempts > 1 {
            line.push_str(&format!(" {}", style(format!("after {} attempts", job.attempts)).dim()));
        }
        if let Some(reason) = &job.reason {
            line.push_str(&format!(" {}", style(reason).dim()));
        }
        lines.push(line);
    }
    lines.join("\n")
}

/// Machine-readable description of a validated pipeline, jobs in topological order
pub fn pipeline_json(graph: &PipelineGraph) -> serde_json::Value {
    let jobs: Vec<_> = graph
        .topological_order()
        .iter()
        .map(|id| {
            let job = graph.job(*id);
            serde_json::json!({
                "name": job.name,
                "dependsOn": job
                    .dependencies
                    .iter()
                    .map(|d| graph.job(*d).name.clone())
                    .collect::<Vec<_>>(),
                "concurrencyGroup": job.concurrency_group,
                "branches": job.trigger.branch_patterns(),
                "produces": job.produced_artifacts().collect::<Vec<_>>(),
                "consumes": job.consumed_artifacts().collect::<Vec<_>>(),
                "steps": job.steps.len(),
            })
        })
        .collect();

    serde_json::json!({
        "valid": true,
        "name": graph.name(),
        "jobs": jobs,
    })
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
