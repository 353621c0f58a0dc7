//! Configuration for Conductor.
//!
//! Settings are read from `.conductor/conductor.toml`, then overridden by
//! environment variables, then by CLI flags.
//!
//! # Configuration File Format
//!
//! ```toml
//! [engine]
//! max_retries = 3
//! max_parallel = 4
//! task_timeout_secs = 600
//! fail_fast = true
//!
//! [retry]
//! base_delay_ms = 500
//! max_delay_ms = 30000
//! multiplier = 2.0
//!
//! [planner]
//! confidence_threshold = 0.7
//!
//! [limits]
//! max_input_bytes = 4194304
//!
//! [workers.architect]
//! command = ["./workers/architect.sh"]
//! timeout_secs = 900
//!
//! [workers.default]
//! command = ["./workers/generic.sh"]
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Directory holding all conductor state inside a project.
pub const CONDUCTOR_DIR: &str = ".conductor";
pub const CONFIG_FILE: &str = "conductor.toml";

/// Producer name whose worker entry handles producers without their own.
pub const DEFAULT_WORKER: &str = "default";

/// `[engine]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineSection {
    /// Retries after the first attempt for transient failures
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Upper bound on concurrently running tasks in a phase
    #[serde(default = "default_max_parallel")]
    pub max_parallel: usize,
    /// Per-invocation timeout
    #[serde(default = "default_task_timeout_secs")]
    pub task_timeout_secs: u64,
    /// Stop dispatching new tasks after a non-tolerated terminal failure
    #[serde(default = "default_fail_fast")]
    pub fail_fast: bool,
}

fn default_max_retries() -> u32 {
    3
}

fn default_max_parallel() -> usize {
    4
}

fn default_task_timeout_secs() -> u64 {
    600
}

fn default_fail_fast() -> bool {
    true
}

impl Default for EngineSection {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            max_parallel: default_max_parallel(),
            task_timeout_secs: default_task_timeout_secs(),
            fail_fast: default_fail_fast(),
        }
    }
}

/// `[retry]` section: exponential backoff parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrySection {
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
}

fn default_base_delay_ms() -> u64 {
    500
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_multiplier() -> f64 {
    2.0
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            multiplier: default_multiplier(),
        }
    }
}

/// `[planner]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlannerSection {
    /// Below this classifier confidence the plan starts with a clarification
    #[serde(default = "default_confidence_threshold")]
    pub confidence_threshold: f64,
}

fn default_confidence_threshold() -> f64 {
    0.7
}

impl Default for PlannerSection {
    fn default() -> Self {
        Self {
            confidence_threshold: default_confidence_threshold(),
        }
    }
}

/// `[limits]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsSection {
    /// Summed input payload size a task accepts before overflowing
    #[serde(default = "default_max_input_bytes")]
    pub max_input_bytes: usize,
}

fn default_max_input_bytes() -> usize {
    4 * 1024 * 1024
}

impl Default for LimitsSection {
    fn default() -> Self {
        Self {
            max_input_bytes: default_max_input_bytes(),
        }
    }
}

/// `[workers.<producer>]` entry: an external command implementing a producer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerCommand {
    /// Program followed by its arguments
    pub command: Vec<String>,
    /// Overrides `engine.task_timeout_secs` for this producer
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

/// Parsed `conductor.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConductorToml {
    #[serde(default)]
    pub engine: EngineSection,
    #[serde(default)]
    pub retry: RetrySection,
    #[serde(default)]
    pub planner: PlannerSection,
    #[serde(default)]
    pub limits: LimitsSection,
    #[serde(default)]
    pub workers: BTreeMap<String, WorkerCommand>,
}

impl ConductorToml {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse conductor.toml")
    }

    /// Load `conductor.toml` from the conductor directory, or defaults if absent.
    pub fn load_or_default(conductor_dir: &Path) -> Result<Self> {
        let config_path = conductor_dir.join(CONFIG_FILE);
        if config_path.exists() {
            Self::load(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to a TOML file.
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize conductor.toml")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Apply `CONDUCTOR_*` overrides from the process environment.
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        self.apply_env_overrides_from(std::env::vars())
    }

    /// Apply `CONDUCTOR_*` overrides from the given variables.
    pub fn apply_env_overrides_from<I>(&mut self, vars: I) -> Result<()>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        for (key, value) in vars {
            match key.as_str() {
                "CONDUCTOR_MAX_RETRIES" => {
                    self.engine.max_retries = parse_env(&key, &value)?;
                }
                "CONDUCTOR_MAX_PARALLEL" => {
                    self.engine.max_parallel = parse_env(&key, &value)?;
                }
                "CONDUCTOR_TASK_TIMEOUT_SECS" => {
                    self.engine.task_timeout_secs = parse_env(&key, &value)?;
                }
                "CONDUCTOR_CONFIDENCE_THRESHOLD" => {
                    self.planner.confidence_threshold = parse_env(&key, &value)?;
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Validate the configuration and return any warnings.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if self.engine.max_parallel == 0 {
            warnings.push("engine.max_parallel is 0; tasks will run one at a time".to_string());
        }
        if self.retry.multiplier < 1.0 {
            warnings.push(format!(
                "retry.multiplier {} is below 1.0; backoff will shrink",
                self.retry.multiplier
            ));
        }
        if !(0.0..=1.0).contains(&self.planner.confidence_threshold) {
            warnings.push(format!(
                "planner.confidence_threshold {} is outside [0, 1]",
                self.planner.confidence_threshold
            ));
        }
        for (producer, worker) in &self.workers {
            if worker.command.is_empty() {
                warnings.push(format!("workers.{} has an empty command", producer));
            }
        }

        warnings
    }
}

fn parse_env<T>(key: &str, value: &str) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    value
        .trim()
        .parse()
        .with_context(|| format!("Invalid value '{}' for {}", value, key))
}

/// Resolved runtime settings for the engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// The `.conductor` directory
    pub state_dir: PathBuf,
    pub max_retries: u32,
    pub max_parallel: usize,
    pub task_timeout: Duration,
    pub fail_fast: bool,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    pub confidence_threshold: f64,
    pub max_input_bytes: usize,
}

impl EngineConfig {
    /// Defaults rooted at `state_dir`.
    pub fn new(state_dir: impl Into<PathBuf>) -> Self {
        Self::from_toml(state_dir, &ConductorToml::default())
    }

    pub fn from_toml(state_dir: impl Into<PathBuf>, toml: &ConductorToml) -> Self {
        Self {
            state_dir: state_dir.into(),
            max_retries: toml.engine.max_retries,
            max_parallel: toml.engine.max_parallel.max(1),
            task_timeout: Duration::from_secs(toml.engine.task_timeout_secs),
            fail_fast: toml.engine.fail_fast,
            base_delay: Duration::from_millis(toml.retry.base_delay_ms),
            max_delay: Duration::from_millis(toml.retry.max_delay_ms),
            multiplier: toml.retry.multiplier,
            confidence_threshold: toml.planner.confidence_threshold,
            max_input_bytes: toml.limits.max_input_bytes,
        }
    }

    pub fn runs_dir(&self) -> PathBuf {
        self.state_dir.join("runs")
    }

    pub fn log_dir(&self) -> PathBuf {
        self.state_dir.join("logs")
    }
}

/// Project-level configuration: file, environment and CLI layered together.
#[derive(Debug, Clone)]
pub struct ConductorConfig {
    pub project_dir: PathBuf,
    pub conductor_dir: PathBuf,
    pub toml: ConductorToml,
}

impl ConductorConfig {
    /// Load configuration for a project directory (file, then environment).
    pub fn new(project_dir: PathBuf) -> Result<Self> {
        let project_dir = project_dir
            .canonicalize()
            .context("Failed to resolve project directory")?;
        let conductor_dir = project_dir.join(CONDUCTOR_DIR);
        let mut toml = ConductorToml::load_or_default(&conductor_dir)?;
        toml.apply_env_overrides()?;

        Ok(Self {
            project_dir,
            conductor_dir,
            toml,
        })
    }

    /// Apply CLI overrides on top of file and environment settings.
    pub fn with_cli_args(
        mut self,
        max_parallel: Option<usize>,
        max_retries: Option<u32>,
    ) -> Self {
        if let Some(n) = max_parallel {
            self.toml.engine.max_parallel = n;
        }
        if let Some(n) = max_retries {
            self.toml.engine.max_retries = n;
        }
        self
    }

    pub fn engine(&self) -> EngineConfig {
        EngineConfig::from_toml(&self.conductor_dir, &self.toml)
    }

    pub fn config_file(&self) -> PathBuf {
        self.conductor_dir.join(CONFIG_FILE)
    }

    pub fn runs_dir(&self) -> PathBuf {
        self.conductor_dir.join("runs")
    }

    pub fn log_dir(&self) -> PathBuf {
        self.conductor_dir.join("logs")
    }

    pub fn is_initialized(&self) -> bool {
        self.conductor_dir.exists()
    }

    pub fn ensure_directories(&self) -> Result<()> {
        std::fs::create_dir_all(self.runs_dir()).context("Failed to create runs directory")?;
        std::fs::create_dir_all(self.log_dir()).context("Failed to create log directory")?;
        Ok(())
    }

    pub fn validate(&self) -> Vec<String> {
        self.toml.validate()
    }
}
