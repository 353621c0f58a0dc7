use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use conductor::config::CONDUCTOR_DIR;
use conductor_common::{ClassifiedRequest, ComplexityTier, RequestType};
use std::path::PathBuf;

mod cmd;

#[derive(Parser)]
#[command(name = "conductor")]
#[command(version, about = "Durable workflow orchestrator for planned, checkpointed worker tasks")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[arg(long, global = true)]
    pub project_dir: Option<PathBuf>,

    /// Emit logs as JSON lines on stderr
    #[arg(long, global = true)]
    pub json_log: bool,

    /// Maximum concurrent tasks per phase. Overrides conductor.toml and CONDUCTOR_MAX_PARALLEL.
    #[arg(long, global = true)]
    pub max_parallel: Option<usize>,

    /// Retries after the first attempt for transient failures. Overrides conductor.toml and CONDUCTOR_MAX_RETRIES.
    #[arg(long, global = true)]
    pub max_retries: Option<u32>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Initialize a new conductor project
    Init {
        /// Overwrite an existing conductor.toml with defaults
        #[arg(long)]
        force: bool,
    },
    /// Show the plan a request would get, without starting a run
    Plan {
        #[command(flatten)]
        request: RequestArgs,
    },
    /// Start a run for a classified request
    Start {
        #[command(flatten)]
        request: RequestArgs,
        /// Create the run without driving it
        #[arg(long)]
        detach: bool,
        /// Prompt for a decision whenever the run pauses at a checkpoint
        #[arg(short, long)]
        interactive: bool,
    },
    /// Show the status of a run
    Status {
        run_id: String,
        /// Print the snapshot as JSON
        #[arg(long)]
        json: bool,
    },
    /// Continue a paused or interrupted run
    Resume {
        run_id: String,
        #[command(flatten)]
        resolution: ResolutionArgs,
        /// Prompt for a decision whenever the run pauses at a checkpoint
        #[arg(short, long)]
        interactive: bool,
    },
    /// Cancel a run at the next phase boundary
    Cancel { run_id: String },
    /// Re-execute a run's plan from a phase, reusing earlier artifacts
    Rerun {
        run_id: String,
        /// Phase id to rerun from (e.g. "generation")
        #[arg(long)]
        from: String,
        #[arg(short, long)]
        interactive: bool,
    },
    /// List all runs
    Runs,
    /// Show a run's event log
    Events {
        run_id: String,
        /// Print raw JSON lines
        #[arg(long)]
        json: bool,
    },
    /// Show a stored artifact
    Artifact {
        run_id: String,
        artifact_id: String,
        /// Show only the summary, not the payload
        #[arg(long)]
        summary: bool,
    },
}

/// A request as classified outside the engine.
#[derive(Args, Clone)]
pub struct RequestArgs {
    /// Free-form request text
    pub text: String,

    /// Complexity tier: simple, medium, complex
    #[arg(short, long, default_value = "simple")]
    pub complexity: ComplexityTier,

    /// Request type: feature, bugfix, refactor
    #[arg(long = "type", default_value = "feature")]
    pub request_type: RequestType,

    /// Domain tags (comma-separated: backend,frontend,data,cli,infra,security)
    #[arg(short, long, value_delimiter = ',')]
    pub tags: Vec<String>,

    /// Classifier confidence in [0, 1]
    #[arg(long, default_value = "1.0")]
    pub confidence: f64,
}

impl RequestArgs {
    pub fn to_request(&self) -> ClassifiedRequest {
        let tags: Vec<&str> = self.tags.iter().map(String::as_str).collect();
        ClassifiedRequest::new(&self.text, self.complexity, &tags)
            .with_type(self.request_type)
            .with_confidence(self.confidence)
    }
}

/// At most one resolution per `resume`.
#[derive(Args, Clone, Default)]
#[group(multiple = false)]
pub struct ResolutionArgs {
    /// Approve the pending checkpoint
    #[arg(long)]
    pub approve: bool,

    /// Reject the pending checkpoint with a reason
    #[arg(long, value_name = "REASON")]
    pub reject: Option<String>,

    /// Ask for a revision of the checkpointed phase
    #[arg(long, value_name = "INSTRUCTIONS")]
    pub modify: Option<String>,

    /// Answer a rejection with clarifying text
    #[arg(long, value_name = "TEXT")]
    pub clarify: Option<String>,

    /// Re-plan with a new complexity tier (simple, medium, complex)
    #[arg(long, value_name = "COMPLEXITY")]
    pub reclassify: Option<ComplexityTier>,

    /// Cancel the paused run
    #[arg(long)]
    pub cancel: bool,
}

impl ResolutionArgs {
    pub fn is_empty(&self) -> bool {
        !self.approve
            && !self.cancel
            && self.reject.is_none()
            && self.modify.is_none()
            && self.clarify.is_none()
            && self.reclassify.is_none()
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let project_dir = match cli.project_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };

    // File logging only once the project has a state directory
    let conductor_dir = project_dir.join(CONDUCTOR_DIR);
    let log_dir = conductor_dir.exists().then(|| conductor_dir.join("logs"));
    let _guard = conductor::logging::init(cli.verbose, cli.json_log, log_dir.as_deref())?;

    match &cli.command {
        Commands::Init { force } => cmd::cmd_init(&project_dir, *force)?,
        Commands::Plan { request } => cmd::cmd_plan(&cli, &project_dir, request)?,
        Commands::Start {
            request,
            detach,
            interactive,
        } => cmd::cmd_start(&cli, &project_dir, request, *detach, *interactive).await?,
        Commands::Status { run_id, json } => cmd::cmd_status(&cli, &project_dir, run_id, *json)?,
        Commands::Resume {
            run_id,
            resolution,
            interactive,
        } => cmd::cmd_resume(&cli, &project_dir, run_id, resolution, *interactive).await?,
        Commands::Cancel { run_id } => cmd::cmd_cancel(&cli, &project_dir, run_id).await?,
        Commands::Rerun {
            run_id,
            from,
            interactive,
        } => cmd::cmd_rerun(&cli, &project_dir, run_id, from, *interactive).await?,
        Commands::Runs => cmd::cmd_runs(&cli, &project_dir)?,
        Commands::Events { run_id, json } => cmd::cmd_events(&cli, &project_dir, run_id, *json)?,
        Commands::Artifact {
            run_id,
            artifact_id,
            summary,
        } => cmd::cmd_artifact(&cli, &project_dir, run_id, artifact_id, *summary)?,
    }

    Ok(())
}
