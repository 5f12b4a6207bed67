//! Workflow subcommands: validate, plan, run, list and schema.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;

use panefleet_core::workflow::dag::DependencyGraph;
use panefleet_core::workflow::definition::{
    load_and_validate, missing_required_vars, resolve_run_vars, validate_workflow,
};
use panefleet_core::workflow::driver::BoxWorkerDriver;
use panefleet_core::workflow::executor::{Executor, ExecutorConfig};
use panefleet_core::workflow::registry::PipelineRegistry;
use panefleet_infra::config::workflows_dir;
use panefleet_infra::process::ProcessWorkerDriver;
use panefleet_infra::workflow::{discover_workflows, find_workflow};
use panefleet_types::config::EngineConfig;
use panefleet_types::duration::format_duration;
use panefleet_types::error::ValidationReport;
use panefleet_types::execution::{
    ExecutionState, ExecutionStatus, ProgressEvent, ProgressEventKind, StepResult,
};
use panefleet_types::workflow::Workflow;

/// Arguments of `pfleet run`.
pub struct RunArgs {
    pub workflow: String,
    pub vars: Vec<String>,
    pub vars_json: Option<String>,
    pub session: Option<String>,
    pub dry_run: bool,
    pub run_id: Option<String>,
}

// ---------------------------------------------------------------------------
// Validate
// ---------------------------------------------------------------------------

pub fn handle_validate(file: &Path, json: bool) -> Result<()> {
    let (workflow, report) = load_and_validate(file)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&workflow.name, &report);
    }

    if !report.valid {
        bail!("workflow '{}' is invalid", file.display());
    }
    Ok(())
}

fn print_report(name: &str, report: &ValidationReport) {
    println!();
    if report.valid {
        println!("  {} Workflow '{}' is valid", style("*").green().bold(), style(name).cyan());
    } else {
        println!(
            "  {} Workflow '{}' has {} error(s)",
            style("x").red().bold(),
            style(name).cyan(),
            report.errors.len()
        );
    }

    if report.errors.is_empty() && report.warnings.is_empty() {
        println!();
        return;
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Level").fg(Color::Cyan),
            Cell::new("Location"),
            Cell::new("Message"),
            Cell::new("Hint"),
        ]);

    let issues = report
        .errors
        .iter()
        .map(|e| (Cell::new("error").fg(Color::Red), e))
        .chain(report.warnings.iter().map(|w| (Cell::new("warning").fg(Color::Yellow), w)));
    for (level, issue) in issues {
        let mut location = Vec::new();
        if let Some(line) = issue.line {
            location.push(format!("line {line}"));
        }
        if let Some(field) = &issue.field {
            location.push(field.clone());
        }
        table.add_row(vec![
            level,
            Cell::new(location.join(":")),
            Cell::new(&issue.message),
            Cell::new(issue.hint.as_deref().unwrap_or("")),
        ]);
    }

    println!();
    println!("{table}");
    println!();
}

// ---------------------------------------------------------------------------
// Plan
// ---------------------------------------------------------------------------

pub fn handle_plan(file: &Path, json: bool) -> Result<()> {
    let (workflow, _) = load_and_validate(file)?;
    let plan = DependencyGraph::build(&workflow).resolve();

    if json {
        println!("{}", serde_json::to_string_pretty(&plan)?);
    } else if plan.valid {
        println!();
        println!(
            "  Plan for '{}' ({} steps, {} levels)",
            style(&workflow.name).cyan(),
            plan.order.len(),
            plan.levels.len()
        );
        println!();
        for (i, level) in plan.levels.iter().enumerate() {
            println!("  {} {}", style(format!("level {i}:")).bold(), level.join(", "));
        }
        println!();
    } else {
        println!();
        for err in &plan.errors {
            println!("  {} {err}", style("x").red().bold());
        }
        println!();
    }

    if !plan.valid {
        bail!("workflow '{}' has dependency errors", workflow.name);
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Run
// ---------------------------------------------------------------------------

/// Resolve `target` as a file path, else as a workflow name in the
/// workflows directory. Returns the workflow and its base directory.
async fn resolve_target(
    target: &str,
    config: &EngineConfig,
    data_dir: &Path,
) -> Result<(Workflow, PathBuf)> {
    let path = PathBuf::from(target);
    if tokio::fs::try_exists(&path).await.unwrap_or(false) {
        let (workflow, report) = load_and_validate(&path)?;
        ensure_valid(&workflow, &report)?;
        let base = path.parent().map(Path::to_path_buf).unwrap_or_default();
        return Ok((workflow, base));
    }

    let dir = workflows_dir(config, data_dir);
    let found = find_workflow(&dir, target)
        .await?
        .with_context(|| {
            format!("no workflow file or named workflow '{target}' in {}", dir.display())
        })?;
    let mut report = validate_workflow(&found.workflow);
    let file = found.path.display().to_string();
    for issue in report.errors.iter_mut().chain(report.warnings.iter_mut()) {
        issue.file = Some(file.clone());
    }
    ensure_valid(&found.workflow, &report)?;
    let base = found.path.parent().map(Path::to_path_buf).unwrap_or_default();
    Ok((found.workflow, base))
}

fn ensure_valid(workflow: &Workflow, report: &ValidationReport) -> Result<()> {
    for warning in &report.warnings {
        tracing::warn!("{warning}");
    }
    if !report.valid {
        print_report(&workflow.name, report);
        bail!("workflow '{}' failed validation", workflow.name);
    }
    Ok(())
}

pub async fn handle_run(
    args: RunArgs,
    config: &EngineConfig,
    data_dir: &Path,
    json: bool,
    quiet: bool,
) -> Result<()> {
    let (workflow, base_dir) = resolve_target(&args.workflow, config, data_dir).await?;

    let vars = resolve_run_vars(&workflow, &args.vars, args.vars_json.as_deref())?;
    let missing = missing_required_vars(&workflow, &vars);
    if !missing.is_empty() {
        bail!("missing required variable(s): {}", missing.join(", "));
    }

    let mut exec_config = ExecutorConfig::from(config);
    if let Some(session) = args.session {
        exec_config.session = session;
    }
    exec_config.dry_run |= args.dry_run;
    exec_config.run_id = args.run_id;
    exec_config.base_dir = Some(base_dir);

    if config.workers.is_empty() && !exec_config.dry_run {
        bail!(
            "no workers configured; add [[workers]] entries to {}",
            data_dir.join("config.toml").display()
        );
    }

    let driver = BoxWorkerDriver::new(ProcessWorkerDriver::new(config.workers.clone()));
    let registry = Arc::new(PipelineRegistry::new());
    let executor = Executor::new(exec_config, driver).with_registry(Arc::clone(&registry));

    let events = executor.subscribe();
    let printer = tokio::spawn(print_events(events, json, quiet));

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received, cancelling run");
            on_interrupt.cancel();
        }
    });

    let result = executor.run_with_cancel(&workflow, vars, cancel).await;
    interrupt.abort();
    drop(executor);
    let _ = printer.await;

    if json {
        println!("{}", serde_json::to_string_pretty(&result.state)?);
    } else if !quiet {
        print_summary(&result.state);
    }

    match result.error {
        Some(err) => Err(err.into()),
        None if result.state.status != ExecutionStatus::Completed => {
            bail!("workflow finished with status {}", result.state.status)
        }
        None => Ok(()),
    }
}

async fn print_events(
    mut events: tokio::sync::broadcast::Receiver<ProgressEvent>,
    json: bool,
    quiet: bool,
) {
    let bar = if json || quiet {
        None
    } else {
        let bar = ProgressBar::new(100);
        let template = "{spinner:.cyan} [{bar:30.cyan/blue}] {pos:>3}% {msg}";
        if let Ok(style) = ProgressStyle::default_bar().template(template) {
            bar.set_style(style.progress_chars("=> "));
        }
        bar.enable_steady_tick(Duration::from_millis(80));
        Some(bar)
    };

    loop {
        match events.recv().await {
            Ok(event) => {
                if json {
                    if let Ok(line) = serde_json::to_string(&event) {
                        println!("{line}");
                    }
                    continue;
                }
                if let Some(bar) = &bar {
                    bar.set_position((event.progress.clamp(0.0, 1.0) * 100.0).round() as u64);
                    bar.set_message(event.message.clone());
                    if let Some(line) = event_line(&event) {
                        bar.println(line);
                    }
                }
            }
            Err(RecvError::Lagged(skipped)) => {
                tracing::debug!(skipped, "progress printer lagged");
            }
            Err(RecvError::Closed) => break,
        }
    }

    if let Some(bar) = bar {
        bar.finish_and_clear();
    }
}

/// A persistent line for events worth keeping above the progress bar.
fn event_line(event: &ProgressEvent) -> Option<String> {
    let step = event.step_id.as_deref().unwrap_or("");
    let line = match event.kind {
        ProgressEventKind::StepComplete => format!("  {} {step}", style("*").green()),
        ProgressEventKind::StepError => format!("  {} {step}: {}", style("x").red(), event.message),
        ProgressEventKind::StepRetry => format!("  {} {}", style("~").yellow(), event.message),
        ProgressEventKind::StepSkip => format!("  {} {}", style("-").dim(), event.message),
        ProgressEventKind::StepWarning => format!("  {} {}", style("!").yellow(), event.message),
        ProgressEventKind::WorkflowError => {
            format!("  {} {}", style("x").red().bold(), event.message)
        }
        _ => return None,
    };
    Some(line)
}

fn print_summary(state: &ExecutionState) {
    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Step").fg(Color::Cyan),
            Cell::new("Status"),
            Cell::new("Attempts"),
            Cell::new("Duration"),
            Cell::new("Worker"),
            Cell::new("Detail"),
        ]);

    let mut rows: Vec<&StepResult> = state.steps.values().chain(state.groups.values()).collect();
    rows.sort_by_key(|r| (r.started_at, r.step_id.clone()));
    for result in rows {
        let detail = match (&result.error, &result.skip_reason) {
            (Some(err), _) => err.message.clone(),
            (None, Some(reason)) => reason.clone(),
            (None, None) => String::new(),
        };
        table.add_row(vec![
            Cell::new(&result.step_id),
            format_status(result.status),
            Cell::new(result.attempts),
            Cell::new(result.duration().map(format_duration).unwrap_or_default()),
            Cell::new(result.pane_used.as_deref().unwrap_or("")),
            Cell::new(detail),
        ]);
    }

    println!();
    println!(
        "  Run {} of '{}': {}",
        style(&state.run_id).cyan(),
        style(&state.workflow_id).cyan(),
        state.status
    );
    println!();
    println!("{table}");
    for err in state.errors.iter().filter(|e| e.fatal) {
        println!("  {} {}", style("x").red().bold(), err.message);
    }
    println!();
}

fn format_status(status: ExecutionStatus) -> Cell {
    match status {
        ExecutionStatus::Pending => Cell::new("pending").fg(Color::Yellow),
        ExecutionStatus::Running => Cell::new("running").fg(Color::Blue),
        ExecutionStatus::Paused => Cell::new("paused").fg(Color::Magenta),
        ExecutionStatus::Completed => Cell::new("completed").fg(Color::Green),
        ExecutionStatus::Failed => Cell::new("failed").fg(Color::Red),
        ExecutionStatus::Cancelled => Cell::new("cancelled").fg(Color::DarkYellow),
        ExecutionStatus::Skipped => Cell::new("skipped").fg(Color::DarkGrey),
    }
}

// ---------------------------------------------------------------------------
// List / Schema
// ---------------------------------------------------------------------------

pub async fn handle_list(config: &EngineConfig, data_dir: &Path, json: bool) -> Result<()> {
    let dir = workflows_dir(config, data_dir);
    let found = discover_workflows(&dir).await?;

    if json {
        let out: Vec<_> = found
            .iter()
            .map(|d| {
                serde_json::json!({
                    "name": d.workflow.name,
                    "version": d.workflow.version,
                    "description": d.workflow.description,
                    "steps": d.workflow.steps.len(),
                    "path": d.path.display().to_string(),
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    if found.is_empty() {
        println!();
        println!("  No workflows found in {}.", dir.display());
        println!();
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Name").fg(Color::Cyan),
            Cell::new("Version"),
            Cell::new("Steps"),
            Cell::new("Description"),
            Cell::new("File"),
        ]);
    for d in &found {
        let file = d.path.strip_prefix(&dir).unwrap_or(&d.path);
        table.add_row(vec![
            Cell::new(&d.workflow.name),
            Cell::new(d.workflow.version.as_deref().unwrap_or("")),
            Cell::new(d.workflow.steps.len()),
            Cell::new(d.workflow.description.as_deref().unwrap_or("")),
            Cell::new(file.display()),
        ]);
    }

    println!();
    println!("{table}");
    println!();
    Ok(())
}

pub fn handle_schema() -> Result<()> {
    let schema = schemars::schema_for!(Workflow);
    println!("{}", serde_json::to_string_pretty(&schema)?);
    Ok(())
}
