//! Commands that drive runs: start, resume, cancel and rerun.

use anyhow::{Context, Result, bail};
use conductor::state::{self, RunSnapshot};
use conductor::RunController;
use conductor_common::{PauseReason, PhaseId, Resolution, RunId, RunStatus};
use dialoguer::{Input, Select};
use std::path::Path;

use super::super::{Cli, RequestArgs, ResolutionArgs};
use super::inspect::print_snapshot;
use super::{open_controller, parse_run_id};

pub async fn cmd_start(
    cli: &Cli,
    project_dir: &Path,
    request: &RequestArgs,
    detach: bool,
    interactive: bool,
) -> Result<()> {
    let controller = open_controller(cli, project_dir)?;
    let request = request.to_request();

    if detach {
        let run_id = controller.submit(request)?;
        println!("Submitted run {}", console::style(run_id).bold());
        println!("Run `conductor resume {}` to drive it.", run_id);
        return Ok(());
    }

    let run_id = controller.start(request).await?;
    let snapshot = controller.status(run_id)?;
    finish(&controller, snapshot, interactive).await
}

pub async fn cmd_resume(
    cli: &Cli,
    project_dir: &Path,
    run_id: &str,
    resolution: &ResolutionArgs,
    interactive: bool,
) -> Result<()> {
    let controller = open_controller(cli, project_dir)?;
    let run_id = parse_run_id(run_id)?;
    let resolution = to_resolution(&controller, run_id, resolution)?;

    let snapshot = controller.resume(run_id, resolution).await?;
    finish(&controller, snapshot, interactive).await
}

pub async fn cmd_cancel(cli: &Cli, project_dir: &Path, run_id: &str) -> Result<()> {
    let controller = open_controller(cli, project_dir)?;
    let run_id = parse_run_id(run_id)?;
    let snapshot = controller.cancel(run_id).await?;

    if snapshot.status == RunStatus::Cancelled {
        println!("{}", console::style("Run cancelled.").yellow());
    } else {
        println!(
            "{} The run stops at the next phase boundary.",
            console::style("Cancellation requested.").yellow()
        );
    }
    Ok(())
}

pub async fn cmd_rerun(
    cli: &Cli,
    project_dir: &Path,
    run_id: &str,
    from: &str,
    interactive: bool,
) -> Result<()> {
    let controller = open_controller(cli, project_dir)?;
    let run_id = parse_run_id(run_id)?;
    let snapshot = controller.rerun_from(run_id, &PhaseId::new(from)).await?;
    finish(&controller, snapshot, interactive).await
}

/// Translate resume flags into a resolution. `--reclassify` keeps the
/// original request text and tags and replaces only the tier.
fn to_resolution(
    controller: &RunController,
    run_id: RunId,
    args: &ResolutionArgs,
) -> Result<Option<Resolution>> {
    if args.is_empty() {
        return Ok(None);
    }
    let resolution = if args.approve {
        Resolution::approve()
    } else if args.cancel {
        Resolution::Cancel
    } else if let Some(reason) = &args.reject {
        Resolution::Reject {
            reason: reason.clone(),
        }
    } else if let Some(instructions) = &args.modify {
        Resolution::Modify {
            task: None,
            instructions: instructions.clone(),
        }
    } else if let Some(text) = &args.clarify {
        Resolution::Clarify { text: text.clone() }
    } else if let Some(tier) = args.reclassify {
        let record = state::peek_record(&controller.config().runs_dir(), run_id)?;
        let mut request = record.request;
        request.complexity = tier;
        request.confidence = 1.0;
        Resolution::Reclassify { request }
    } else {
        return Ok(None);
    };
    Ok(Some(resolution))
}

/// Report where the run stopped, prompting for decisions while it pauses
/// when `interactive` is set.
async fn finish(controller: &RunController, mut snapshot: RunSnapshot, interactive: bool) -> Result<()> {
    loop {
        print_snapshot(&snapshot);
        if !interactive || !snapshot.status.is_paused() {
            break;
        }
        let Some(resolution) = prompt_resolution(&snapshot)? else {
            println!("Run left paused. Resume later with `conductor resume {}`.", snapshot.run_id);
            break;
        };
        snapshot = controller.resume(snapshot.run_id, Some(resolution)).await?;
    }

    if snapshot.status == RunStatus::Failed {
        bail!("Run {} failed", snapshot.run_id);
    }
    Ok(())
}

/// Ask for a decision on a paused run. `None` leaves it paused.
fn prompt_resolution(snapshot: &RunSnapshot) -> Result<Option<Resolution>> {
    let RunStatus::Paused(reason) = snapshot.status else {
        return Ok(None);
    };

    let choices: &[&str] = match reason {
        PauseReason::AwaitingCheckpoint => &["Approve", "Reject", "Modify", "Cancel run", "Leave paused"],
        // Ambiguous classification: the checkpoint is still pending
        PauseReason::AwaitingClarification if snapshot.pending_checkpoint.is_some() => {
            &["Approve", "Cancel run", "Leave paused"]
        }
        PauseReason::AwaitingClarification => &["Clarify", "Cancel run", "Leave paused"],
        PauseReason::NeedsRescope => {
            println!(
                "Reclassify with `conductor resume {} --reclassify <complexity>`.",
                snapshot.run_id
            );
            &["Cancel run", "Leave paused"]
        }
    };

    let selection = Select::new()
        .with_prompt("How do you want to proceed?")
        .items(choices)
        .default(0)
        .interact()
        .context("Failed to read selection")?;

    let resolution = match choices[selection] {
        "Approve" => Resolution::approve(),
        "Reject" => Resolution::Reject {
            reason: ask("Reason for rejecting")?,
        },
        "Modify" => Resolution::Modify {
            task: None,
            instructions: ask("What should change")?,
        },
        "Clarify" => Resolution::Clarify {
            text: ask("Clarification")?,
        },
        "Cancel run" => Resolution::Cancel,
        _ => return Ok(None),
    };
    Ok(Some(resolution))
}

fn ask(prompt: &str) -> Result<String> {
    Input::<String>::new()
        .with_prompt(prompt)
        .interact_text()
        .context("Failed to read input")
}
