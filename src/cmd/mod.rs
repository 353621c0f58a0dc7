//! CLI command implementations.
//!
//! Each submodule owns one or more related `Commands` variants:
//!
//! | Module     | Commands handled                          |
//! |------------|-------------------------------------------|
//! | `project`  | `Init`, `Plan`                            |
//! | `run`      | `Start`, `Resume`, `Cancel`, `Rerun`      |
//! | `inspect`  | `Status`, `Runs`, `Events`, `Artifact`    |

pub mod inspect;
pub mod project;
pub mod run;

pub use inspect::{cmd_artifact, cmd_events, cmd_runs, cmd_status};
pub use project::{cmd_init, cmd_plan};
pub use run::{cmd_cancel, cmd_rerun, cmd_resume, cmd_start};

use anyhow::{Context, Result, bail};
use conductor::{ConductorConfig, RunController, WorkerRegistry};
use conductor_common::RunId;
use std::path::Path;

use super::Cli;

/// Layered configuration for the project: file, environment, then flags.
pub(crate) fn load_config(cli: &Cli, project_dir: &Path) -> Result<ConductorConfig> {
    let config = ConductorConfig::new(project_dir.to_path_buf())?
        .with_cli_args(cli.max_parallel, cli.max_retries);
    for warning in config.validate() {
        tracing::warn!("{}", warning);
    }
    Ok(config)
}

/// A controller over the project's runs, with workers from `conductor.toml`.
pub(crate) fn open_controller(cli: &Cli, project_dir: &Path) -> Result<RunController> {
    let config = load_config(cli, project_dir)?;
    if !config.is_initialized() {
        bail!(
            "No conductor project at {}. Run 'conductor init' first.",
            config.project_dir.display()
        );
    }
    config.ensure_directories()?;

    let registry = WorkerRegistry::from_config(&config.toml, &config.project_dir);
    if !registry.has_fallback() && registry.producers().is_empty() {
        tracing::warn!("No workers configured; every task will fail as worker_missing");
    }
    Ok(RunController::new(config.engine(), registry))
}

pub(crate) fn parse_run_id(value: &str) -> Result<RunId> {
    value
        .trim()
        .parse()
        .with_context(|| format!("Invalid run id '{}'", value))
}
