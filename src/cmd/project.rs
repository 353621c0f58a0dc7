//! Project initialization and plan preview commands.

use anyhow::{Context, Result};
use conductor::config::{CONDUCTOR_DIR, CONFIG_FILE};
use conductor::planner::Planner;
use conductor_common::CheckpointRequirement;
use std::path::Path;

use super::super::{Cli, RequestArgs};
use super::load_config;

const DEFAULT_CONFIG: &str = r#"# Conductor configuration

[engine]
max_retries = 3
max_parallel = 4
task_timeout_secs = 600
fail_fast = true

[retry]
base_delay_ms = 500
max_delay_ms = 30000
multiplier = 2.0

[planner]
confidence_threshold = 0.7

[limits]
max_input_bytes = 4194304

# Each producer maps to a command. The task and its input artifacts arrive
# as JSON on stdin; the output payload is read from stdout. Exit code 75
# marks a transient failure.
#
# [workers.architect]
# command = ["./workers/architect.sh"]
# timeout_secs = 900
#
# [workers.default]
# command = ["./workers/generic.sh"]
"#;

pub fn cmd_init(project_dir: &Path, force: bool) -> Result<()> {
    let conductor_dir = project_dir.join(CONDUCTOR_DIR);
    let was_initialized = conductor_dir.exists();

    for dir in [conductor_dir.join("runs"), conductor_dir.join("logs")] {
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create {}", dir.display()))?;
    }

    let config_path = conductor_dir.join(CONFIG_FILE);
    let wrote_config = force || !config_path.exists();
    if wrote_config {
        std::fs::write(&config_path, DEFAULT_CONFIG)
            .with_context(|| format!("Failed to write {}", config_path.display()))?;
    }

    if was_initialized && !wrote_config {
        println!(
            "Conductor project already initialized at {}",
            conductor_dir.display()
        );
        println!("Directory structure verified.");
        return Ok(());
    }

    println!("Initialized conductor project at {}", conductor_dir.display());
    println!();
    println!("Created directory structure:");
    println!("  .conductor/");
    println!("  ├── conductor.toml  # Engine settings and worker commands");
    println!("  ├── runs/           # One directory per run: events, snapshot, artifacts");
    println!("  └── logs/           # Daily-rolling engine log");
    println!();
    println!("Next steps:");
    println!("  1. Configure workers under [workers.<producer>] in conductor.toml");
    println!("  2. Run `conductor plan \"<request>\"` to preview a plan");
    println!("  3. Run `conductor start \"<request>\"` to start a run");
    Ok(())
}

pub fn cmd_plan(cli: &Cli, project_dir: &Path, request: &RequestArgs) -> Result<()> {
    let config = load_config(cli, project_dir)?;
    let planner = Planner::from_config(&config.engine());
    let plan = planner.plan(&request.to_request())?;

    println!();
    println!(
        "{} {} (plan v{})",
        console::style("Pattern:").bold(),
        plan.pattern,
        plan.version
    );
    println!();
    for phase in &plan.phases {
        let mode = if phase.concurrent { "concurrent" } else { "sequential" };
        let checkpoint = match phase.checkpoint {
            CheckpointRequirement::None => String::new(),
            other => format!(
                ", checkpoint: {}",
                format!("{:?}", other).to_lowercase()
            ),
        };
        println!(
            "{:<3} {} ({}{})",
            phase.ordinal,
            console::style(&phase.id).cyan().bold(),
            mode,
            checkpoint
        );
        for task in &phase.tasks {
            let tolerant = if task.skip_tolerant { " [skip-tolerant]" } else { "" };
            println!("      {} -> {}{}", task.id, task.output, tolerant);
            for input in &task.inputs {
                let optional = if input.optional { " (optional)" } else { "" };
                println!(
                    "        {} {} {}{}",
                    console::style("<-").dim(),
                    input.task,
                    input.schema,
                    optional
                );
            }
        }
    }
    println!();
    Ok(())
}
