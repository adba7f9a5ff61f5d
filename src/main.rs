use anyhow::{Context, Result};
use runway::artifact::{ArtifactStore, FsArtifactStore, RetentionCollector};
use runway::cli::commands::{HistoryCommand, ListCommand, RunCommand, StatusCommand, ValidateCommand};
use runway::cli::output::*;
use runway::cli::{Cli, Command};
use runway::core::{JobState, PipelineConfig, PipelineGraph, RunStatus};
use runway::execution::{EngineConfig, ExecutionEngine};
use runway::executor::ShellExecutor;
use runway::ledger::EventKind;
use runway::logging::init_logging;
use runway::persistence::{PersistenceBackend, RunSummary};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, warn};
use uuid::Uuid;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::from_args();
    init_logging(cli.verbose)?;

    match &cli.command {
        Command::Run(cmd) => run_pipeline(cmd).await?,
        Command::Validate(cmd) => validate_pipeline(cmd)?,
        Command::List(cmd) => list_pipelines(cmd).await?,
        Command::History(cmd) => show_history(cmd).await?,
        Command::Status(cmd) => show_status(cmd).await?,
    }

    Ok(())
}

#[cfg(feature = "sqlite")]
async fn open_history() -> Result<Arc<dyn PersistenceBackend>> {
    let store = runway::persistence::SqliteRunStore::with_default_path()
        .await
        .context("Failed to open run history")?;
    Ok(Arc::new(store))
}

#[cfg(not(feature = "sqlite"))]
async fn open_history() -> Result<Arc<dyn PersistenceBackend>> {
    warn!("built without the sqlite feature; run history is not kept");
    Ok(Arc::new(runway::persistence::InMemoryPersistence::new()))
}

fn load_graph(path: &std::path::Path) -> Result<PipelineGraph> {
    let config = PipelineConfig::from_file(path)
        .with_context(|| format!("Failed to load pipeline config {}", path.display()))?;
    Ok(config.to_graph()?)
}

async fn run_pipeline(cmd: &RunCommand) -> Result<()> {
    let graph = Arc::new(load_graph(&cmd.file)?);
    println!("{} Loaded pipeline: {}", INFO, style(graph.name()).bold());

    let mut variables = HashMap::new();
    for (key, value) in &cmd.variable {
        variables.insert(key.clone(), value.clone());
        println!(
            "{} Variable override: {} = {}",
            INFO,
            style(key).cyan(),
            style(value).dim()
        );
    }

    let artifacts: Arc<dyn ArtifactStore> = match &cmd.artifact_dir {
        Some(dir) => Arc::new(FsArtifactStore::new(dir.clone())),
        None => Arc::new(FsArtifactStore::with_default_path()),
    };
    let collector = RetentionCollector::spawn(artifacts.clone(), Duration::from_secs(60));

    let config = EngineConfig::new()
        .with_strategy(cmd.scheduling_strategy())
        .with_workspace(cmd.workspace.clone())
        .with_cancel_grace(Duration::from_secs(cmd.cancel_grace_secs));
    let engine = ExecutionEngine::new(Arc::new(ShellExecutor::new()), artifacts).with_config(config);

    // Gate results known up front are fed before any job can reach its gate
    let run_id = Uuid::new_v4();
    for (job, check) in &cmd.gate {
        if graph.job_by_name(job).is_none() {
            warn!(job = %job, "gate result given for unknown job");
            continue;
        }
        engine.evaluate_gate(run_id, job, *check);
    }

    let handle = engine.start_run(run_id, graph.clone(), cmd.trigger_event(), variables);

    let canceller = handle.canceller();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; cancelling run");
            canceller.cancel();
        }
    });

    println!();
    let progress = create_progress_bar(graph.len());
    let mut events = handle.stream();
    while let Some(event) = events.next().await {
        if let Some(line) = format_event(&event) {
            progress.println(line);
        }
        if let EventKind::JobStateChanged { job, to, .. } = &event.kind {
            if to.is_terminal() {
                progress.inc(1);
            }
            if *to == JobState::Running {
                progress.set_message(job.clone());
            }
        }
    }
    progress.finish_and_clear();

    let status = handle.wait().await?;
    collector.shutdown().await;

    let snapshot = engine.status(run_id)?;
    println!("{}", style(rule()).dim());
    println!("{}", format_snapshot(&snapshot));
    if let (Some(start), Some(end)) = (snapshot.started_at, snapshot.finished_at) {
        if let Ok(elapsed) = end.signed_duration_since(start).to_std() {
            println!("  {}", style(format!("took {}", format_duration(elapsed))).dim());
        }
    }

    if !cmd.no_history {
        let saved = async {
            let store = open_history().await?;
            store.save_run(&RunSummary::from_snapshot(&snapshot)).await
        };
        match saved.await {
            Ok(()) => println!(
                "\n{} Run saved to history (ID: {})",
                INFO,
                style(run_id.to_string()).dim()
            ),
            Err(e) => warn!(error = %e, "failed to save run to history"),
        }
    }
    engine.forget_run(run_id);

    match status {
        RunStatus::Succeeded => println!(
            "\n{} {} completed {}",
            CHECK,
            style(graph.name()).bold(),
            style("successfully").green()
        ),
        other => {
            println!("\n{} {} {}", CROSS, style(graph.name()).bold(), format_status(other));
            error!(run_id = %run_id, status = %other, "run did not succeed");
            std::process::exit(other.exit_code());
        }
    }

    Ok(())
}

fn validate_pipeline(cmd: &ValidateCommand) -> Result<()> {
    match load_graph(&cmd.file) {
        Ok(graph) => {
            if cmd.json {
                let data = pipeline_json(&graph);
                println!("{}", serde_json::to_string_pretty(&data)?);
                return Ok(());
            }

            println!("{} Pipeline configuration is valid!", CHECK);
            println!("  Name: {}", style(graph.name()).bold());
            println!("  Jobs: {}", style(graph.len()).cyan());
            println!("  Variables: {}", style(graph.variables().len()).cyan());
            let order: Vec<&str> = graph
                .topological_order()
                .iter()
                .map(|id| graph.job(*id).name.as_str())
                .collect();
            println!("  Order: {}", style(order.join(" → ")).dim());
            Ok(())
        }
        Err(e) => {
            if cmd.json {
                let data = serde_json::json!({ "valid": false, "error": format!("{:#}", e) });
                println!("{}", serde_json::to_string_pretty(&data)?);
            } else {
                println!("{} Validation failed:", CROSS);
                println!("  {}", style(format!("{:#}", e)).red());
            }
            std::process::exit(1);
        }
    }
}

async fn list_pipelines(cmd: &ListCommand) -> Result<()> {
    let store = open_history().await?;
    let pipelines = store.list_pipelines().await?;

    if cmd.json {
        let mut data = Vec::new();
        for pipeline in &pipelines {
            let runs = store.list_runs(pipeline).await?;
            data.push(serde_json::json!({ "name": pipeline, "runs": runs.len() }));
        }
        println!("{}", serde_json::to_string_pretty(&serde_json::json!({ "pipelines": data }))?);
        return Ok(());
    }

    if pipelines.is_empty() {
        println!("{} No pipelines found in history", INFO);
        return Ok(());
    }

    println!("{} Pipelines in history:", INFO);
    for pipeline in &pipelines {
        if cmd.with_counts {
            let runs = store.list_runs(pipeline).await?;
            let count = |status: RunStatus| runs.iter().filter(|r| r.status == status).count();
            println!(
                "  {} ({} runs: {} succeeded, {} failed, {} cancelled)",
                style(pipeline).bold(),
                style(runs.len()).cyan(),
                style(count(RunStatus::Succeeded)).green(),
                style(count(RunStatus::Failed)).red(),
                style(count(RunStatus::Cancelled)).magenta()
            );
        } else {
            println!("  {}", style(pipeline).bold());
        }
    }

    Ok(())
}

async fn show_history(cmd: &HistoryCommand) -> Result<()> {
    let store = open_history().await?;

    let mut runs = match &cmd.pipeline {
        Some(pipeline) => store.list_runs(pipeline).await?,
        None => {
            let mut all = Vec::new();
            for pipeline in store.list_pipelines().await? {
                all.extend(store.list_runs(&pipeline).await?);
            }
            all.sort_by(|a, b| b.started_at.cmp(&a.started_at));
            all
        }
    };
    runs.truncate(cmd.limit);

    if cmd.json {
        println!("{}", serde_json::to_string_pretty(&serde_json::json!({ "runs": runs }))?);
        return Ok(());
    }

    if runs.is_empty() {
        println!("{} No runs found", INFO);
        return Ok(());
    }

    println!("{} Run history (showing latest {}):", INFO, cmd.limit);
    for summary in &runs {
        println!("  {}", format_run_summary(summary));
    }

    Ok(())
}

async fn show_status(cmd: &StatusCommand) -> Result<()> {
    let run_id = Uuid::parse_str(&cmd.run_id).context("Invalid run ID format")?;
    let store = open_history().await?;

    let Some(summary) = store.load_run(run_id).await? else {
        println!("{} Run not found", WARN);
        std::process::exit(1);
    };

    if cmd.json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
        return Ok(());
    }

    println!("{} Run Details", INFO);
    println!("  ID: {}", style(summary.run_id).cyan());
    println!("  Pipeline: {}", style(&summary.pipeline_name).bold());
    println!("  Status: {}", format_status(summary.status));
    println!("  Started: {}", style(summary.started_at.to_rfc3339()).dim());
    if let Some(finished) = summary.finished_at {
        println!("  Finished: {}", style(finished.to_rfc3339()).dim());
        if let Ok(duration) = finished.signed_duration_since(summary.started_at).to_std() {
            println!("  Duration: {}", style(format_duration(duration)).dim());
        }
    }
    println!(
        "  Jobs: {} total, {} succeeded, {} failed, {} skipped, {} cancelled ({:.0}% done)",
        summary.total_jobs,
        summary.succeeded_jobs,
        summary.failed_jobs,
        summary.skipped_jobs,
        summary.cancelled_jobs,
        summary.progress() * 100.0
    );

    Ok(())
}
