//! Plans: ordered phases of task specifications.

use crate::ids::{ArtifactId, PhaseId, SchemaId, TaskId};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Canonical phase skeleton a plan was instantiated from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionPattern {
    /// requirements, architecture, generation, verification
    Standard,
    /// standard plus research and documentation
    Extended,
    /// extended with per-module decomposition
    Hierarchical,
}

impl fmt::Display for ExecutionPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutionPattern::Standard => write!(f, "standard"),
            ExecutionPattern::Extended => write!(f, "extended"),
            ExecutionPattern::Hierarchical => write!(f, "hierarchical"),
        }
    }
}

/// Checkpoint attached to a phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointRequirement {
    #[default]
    None,
    /// Raised and auto-acknowledged; never pauses
    Informational,
    /// Blocking approval with a review summary
    Review,
    /// Blocking approval of the final summary
    TerminalSummary,
    /// Blocking disambiguation before any task runs
    Clarification,
}

impl CheckpointRequirement {
    pub fn is_blocking(&self) -> bool {
        matches!(
            self,
            Self::Review | Self::TerminalSummary | Self::Clarification
        )
    }
}

/// Reference to an artifact produced by another task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputRef {
    pub task: TaskId,
    pub schema: SchemaId,
    /// Does not block when the producer failed or was skipped
    #[serde(default)]
    pub optional: bool,
    /// Address exactly `task`, not its latest revision
    #[serde(default)]
    pub pinned: bool,
}

impl InputRef {
    pub fn required(task: TaskId, schema: SchemaId) -> Self {
        Self {
            task,
            schema,
            optional: false,
            pinned: false,
        }
    }

    pub fn optional(task: TaskId, schema: SchemaId) -> Self {
        Self {
            task,
            schema,
            optional: true,
            pinned: false,
        }
    }
}

/// One unit of work bound to a single worker capability.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskSpec {
    pub id: TaskId,
    pub phase: PhaseId,
    /// Worker capability identity
    pub producer: String,
    #[serde(default)]
    pub inputs: Vec<InputRef>,
    /// Declared output contract
    pub output: SchemaId,
    /// Permanent failure does not fail the phase
    #[serde(default)]
    pub skip_tolerant: bool,
    /// Capacity limit on the summed size of input payloads
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_input_bytes: Option<usize>,
    /// Task whose artifact this one supersedes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision_of: Option<TaskId>,
    /// Artifacts handed in directly (modification requests)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<ArtifactId>,
    /// Domain tags that selected this task
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
}

impl TaskSpec {
    pub fn new(phase: &PhaseId, producer: &str, output: &str) -> Self {
        Self {
            id: TaskId::planned(phase, producer),
            phase: phase.clone(),
            producer: producer.to_string(),
            inputs: Vec::new(),
            output: SchemaId::new(output),
            skip_tolerant: false,
            max_input_bytes: None,
            revision_of: None,
            attachments: Vec::new(),
            tags: Vec::new(),
        }
    }

    pub fn with_input(mut self, input: InputRef) -> Self {
        self.inputs.push(input);
        self
    }

    pub fn skip_tolerant(mut self) -> Self {
        self.skip_tolerant = true;
        self
    }

    pub fn tagged(mut self, tag: &str) -> Self {
        self.tags.push(tag.to_string());
        self
    }
}

/// A named stage of a plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseSpec {
    pub id: PhaseId,
    pub name: String,
    pub ordinal: usize,
    pub tasks: Vec<TaskSpec>,
    /// Tasks may run in parallel
    #[serde(default = "default_concurrent")]
    pub concurrent: bool,
    #[serde(default)]
    pub checkpoint: CheckpointRequirement,
}

fn default_concurrent() -> bool {
    true
}

impl PhaseSpec {
    pub fn new(id: &str, name: &str) -> Self {
        Self {
            id: PhaseId::new(id),
            name: name.to_string(),
            ordinal: 0,
            tasks: Vec::new(),
            concurrent: true,
            checkpoint: CheckpointRequirement::None,
        }
    }

    pub fn with_task(mut self, task: TaskSpec) -> Self {
        self.tasks.push(task);
        self
    }

    pub fn sequential(mut self) -> Self {
        self.concurrent = false;
        self
    }

    pub fn with_checkpoint(mut self, checkpoint: CheckpointRequirement) -> Self {
        self.checkpoint = checkpoint;
        self
    }

    pub fn task(&self, id: &TaskId) -> Option<&TaskSpec> {
        self.tasks.iter().find(|t| &t.id == id)
    }
}

/// Ordered phases selected for a run. A new version replaces the old one
/// wholesale; a plan is never edited in place.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Plan {
    pub version: u32,
    pub pattern: ExecutionPattern,
    pub phases: Vec<PhaseSpec>,
}

impl Plan {
    pub fn phase(&self, id: &PhaseId) -> Option<&PhaseSpec> {
        self.phases.iter().find(|p| &p.id == id)
    }

    pub fn phase_index(&self, id: &PhaseId) -> Option<usize> {
        self.phases.iter().position(|p| &p.id == id)
    }

    pub fn tasks(&self) -> impl Iterator<Item = &TaskSpec> {
        self.phases.iter().flat_map(|p| p.tasks.iter())
    }

    pub fn task(&self, id: &TaskId) -> Option<&TaskSpec> {
        self.tasks().find(|t| &t.id == id)
    }

    pub fn task_count(&self) -> usize {
        self.phases.iter().map(|p| p.tasks.len()).sum()
    }

    /// The newest task in the revision chain rooted at `id`.
    pub fn latest_revision(&self, id: &TaskId) -> TaskId {
        let mut current = id.clone();
        while let Some(next) = self
            .tasks()
            .find(|t| t.revision_of.as_ref() == Some(&current))
        {
            current = next.id.clone();
        }
        current
    }

    /// Number of revisions already made of the chain containing `id`.
    pub fn revision_count(&self, id: &TaskId) -> u32 {
        let mut count = 0;
        let mut current = id.clone();
        while let Some(next) = self
            .tasks()
            .find(|t| t.revision_of.as_ref() == Some(&current))
        {
            count += 1;
            current = next.id.clone();
        }
        count
    }
}
