//! Read-only commands: status, runs, events and artifact.

use anyhow::{Context, Result};
use conductor::state::RunSnapshot;
use conductor_common::{ArtifactId, PhaseStatus, RunStatus, Subject, TaskStatus};
use console::{StyledObject, style};
use std::path::Path;

use super::super::Cli;
use super::{open_controller, parse_run_id};

pub fn cmd_status(cli: &Cli, project_dir: &Path, run_id: &str, json: bool) -> Result<()> {
    let controller = open_controller(cli, project_dir)?;
    let snapshot = controller.status(parse_run_id(run_id)?)?;

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&snapshot).context("Failed to serialize snapshot")?
        );
    } else {
        print_snapshot(&snapshot);
    }
    Ok(())
}

pub fn cmd_runs(cli: &Cli, project_dir: &Path) -> Result<()> {
    let controller = open_controller(cli, project_dir)?;
    let runs = controller.list_runs()?;

    if runs.is_empty() {
        println!("No runs yet. Start one with `conductor start \"<request>\"`.");
        return Ok(());
    }

    println!();
    println!(
        "{:<38} {:<32} {:<13} Created",
        "Run", "Status", "Pattern"
    );
    println!(
        "{:<38} {:<32} {:<13} -------",
        "-".repeat(36),
        "-".repeat(30),
        "-".repeat(11)
    );
    for run in &runs {
        let pattern = run
            .pattern
            .map(|p| p.to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<38} {:<32} {:<13} {}",
            run.run_id,
            run_status_style(run.status),
            pattern,
            run.created_at.format("%Y-%m-%d %H:%M:%S")
        );
    }
    println!();
    Ok(())
}

pub fn cmd_events(cli: &Cli, project_dir: &Path, run_id: &str, json: bool) -> Result<()> {
    let controller = open_controller(cli, project_dir)?;
    let events = controller.events(parse_run_id(run_id)?)?;

    for event in &events {
        if json {
            println!(
                "{}",
                serde_json::to_string(event).context("Failed to serialize event")?
            );
            continue;
        }
        let subject = match &event.subject {
            Subject::Run(id) => format!("run {}", id.short()),
            Subject::Phase(id) => format!("phase {}", id),
            Subject::Task(id) => format!("task {}", id),
            Subject::Checkpoint(id) => format!("checkpoint {}", id),
        };
        println!(
            "{:>5}  {}  {:<26} {}",
            event.seq,
            style(event.timestamp.format("%H:%M:%S%.3f")).dim(),
            event.kind(),
            subject
        );
    }
    Ok(())
}

pub fn cmd_artifact(
    cli: &Cli,
    project_dir: &Path,
    run_id: &str,
    artifact_id: &str,
    summary_only: bool,
) -> Result<()> {
    let controller = open_controller(cli, project_dir)?;
    let run_id = parse_run_id(run_id)?;
    let id = ArtifactId::new(artifact_id);

    let summary = controller.artifact_summary(run_id, &id)?;
    println!("{}", style(summary.one_line()).bold());
    println!("  id:      {}", summary.id);
    println!("  phase:   {}", summary.phase);
    println!("  created: {}", summary.created_at.to_rfc3339());
    if summary_only {
        return Ok(());
    }

    let artifact = controller.artifact(run_id, &id)?;
    println!();
    println!(
        "{}",
        serde_json::to_string_pretty(&artifact.payload).context("Failed to render payload")?
    );
    Ok(())
}

/// Human-readable run snapshot, shared with the run commands.
pub fn print_snapshot(snapshot: &RunSnapshot) {
    println!();
    println!("{} {}", style("Run").bold().cyan(), snapshot.run_id);
    println!("  Status:  {}", run_status_style(snapshot.status));
    if let Some(pattern) = snapshot.pattern {
        println!(
            "  Plan:    {} v{}",
            pattern,
            snapshot.plan_version.unwrap_or(1)
        );
    }
    if let Some(phase) = &snapshot.current_phase {
        println!("  Phase:   {}", phase);
    }
    if snapshot.cancel_requested && !snapshot.status.is_terminal() {
        println!("  {}", style("Cancellation requested").yellow());
    }

    if !snapshot.phases.is_empty() {
        println!();
    }
    for phase in &snapshot.phases {
        println!("  {} {}", phase_status_style(phase.status), style(&phase.id).bold());
        for task in &phase.tasks {
            let mut line = format!("      {:<40} {}", task.id.to_string(), task_status_style(task.status));
            if task.attempts > 1 {
                line.push_str(&format!(" ({} attempts)", task.attempts));
            }
            if let Some(message) = &task.last_message
                && task.status != TaskStatus::Succeeded
            {
                line.push_str(&format!(" {}", style(message).dim()));
            }
            println!("{}", line);
        }
    }

    if let Some(checkpoint) = &snapshot.pending_checkpoint {
        println!();
        println!(
            "  {} {} ({})",
            style("Checkpoint").yellow().bold(),
            checkpoint.id,
            checkpoint.kind
        );
        println!("  {}", checkpoint.prompt);
        if let Some(summary) = &checkpoint.summary {
            for line in summary.lines() {
                println!("    {}", line);
            }
        }
    }

    if let Some(failure) = &snapshot.failure {
        println!();
        println!("  {} {}", style("Error:").red().bold(), failure);
        if let Some(phase) = &failure.phase {
            println!("    phase: {}", phase);
        }
        if failure.attempts > 0 {
            println!(
                "    attempts: {} (remaining retries: {})",
                failure.attempts, failure.remaining_retries
            );
        }
    }
    println!();
}

fn run_status_style(status: RunStatus) -> StyledObject<String> {
    let text = status.to_string();
    match status {
        RunStatus::Completed => style(text).green(),
        RunStatus::Failed => style(text).red(),
        RunStatus::Paused(_) | RunStatus::Cancelled => style(text).yellow(),
        _ => style(text).cyan(),
    }
}

fn phase_status_style(status: PhaseStatus) -> StyledObject<&'static str> {
    match status {
        PhaseStatus::Completed => style("✓").green(),
        PhaseStatus::Active => style("▶").cyan(),
        PhaseStatus::Blocked => style("⏸").yellow(),
        PhaseStatus::Failed => style("✗").red(),
        PhaseStatus::Pending => style("·").dim(),
    }
}

fn task_status_style(status: TaskStatus) -> StyledObject<String> {
    let text = status.to_string();
    match status {
        TaskStatus::Succeeded => style(text).green(),
        TaskStatus::FailedTerminal => style(text).red(),
        TaskStatus::Failed | TaskStatus::Skipped => style(text).yellow(),
        _ => style(text).dim(),
    }
}
