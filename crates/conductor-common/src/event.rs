//! Event records. The log of these alone reconstructs a run.

use crate::checkpoint::{Checkpoint, Decision};
use crate::failure::{FailureDetail, TaskFailure};
use crate::ids::{ArtifactId, CheckpointId, PhaseId, RunId, TaskId};
use crate::plan::Plan;
use crate::request::ClassifiedRequest;
use crate::status::RunStatus;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// What an event is about.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "id", rename_all = "snake_case")]
pub enum Subject {
    Run(RunId),
    Phase(PhaseId),
    Task(TaskId),
    Checkpoint(CheckpointId),
}

/// A state transition. Applying the sequence of transitions in order to an
/// empty record yields the current run record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload", rename_all = "snake_case")]
pub enum Transition {
    RunCreated {
        run_id: RunId,
        request: ClassifiedRequest,
    },
    /// `failure` names what stopped the run (failed or paused for rescope)
    StatusChanged {
        status: RunStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        failure: Option<FailureDetail>,
    },
    /// A new plan version; tasks in `carry_over` keep their state
    PlanAdopted {
        plan: Plan,
        #[serde(default)]
        carry_over: Vec<TaskId>,
        #[serde(default)]
        cursor: Option<usize>,
    },
    PhaseEntered {
        phase: PhaseId,
        index: usize,
    },
    TaskReady {
        task: TaskId,
    },
    TaskStarted {
        task: TaskId,
        attempt: u32,
    },
    TaskSucceeded {
        task: TaskId,
        artifact: ArtifactId,
    },
    TaskFailed {
        task: TaskId,
        failure: TaskFailure,
    },
    TaskRetryScheduled {
        task: TaskId,
        delay_ms: u64,
    },
    TaskFailedTerminal {
        task: TaskId,
    },
    TaskSkipped {
        task: TaskId,
        reason: String,
    },
    /// Back to ready: interrupted run, discarded result or lost artifact
    TaskRequeued {
        task: TaskId,
        reason: String,
    },
    CheckpointRaised {
        checkpoint: Checkpoint,
    },
    CheckpointResolved {
        checkpoint: CheckpointId,
        decision: Decision,
        #[serde(default)]
        note: Option<String>,
    },
    CheckpointSuperseded {
        checkpoint: CheckpointId,
    },
    CancelRequested,
    /// Cursor moved back for a partial rerun
    Rewound {
        phase: PhaseId,
        index: usize,
    },
}

impl Transition {
    pub fn kind(&self) -> &'static str {
        match self {
            Transition::RunCreated { .. } => "run_created",
            Transition::StatusChanged { .. } => "status_changed",
            Transition::PlanAdopted { .. } => "plan_adopted",
            Transition::PhaseEntered { .. } => "phase_entered",
            Transition::TaskReady { .. } => "task_ready",
            Transition::TaskStarted { .. } => "task_started",
            Transition::TaskSucceeded { .. } => "task_succeeded",
            Transition::TaskFailed { .. } => "task_failed",
            Transition::TaskRetryScheduled { .. } => "task_retry_scheduled",
            Transition::TaskFailedTerminal { .. } => "task_failed_terminal",
            Transition::TaskSkipped { .. } => "task_skipped",
            Transition::TaskRequeued { .. } => "task_requeued",
            Transition::CheckpointRaised { .. } => "checkpoint_raised",
            Transition::CheckpointResolved { .. } => "checkpoint_resolved",
            Transition::CheckpointSuperseded { .. } => "checkpoint_superseded",
            Transition::CancelRequested => "cancel_requested",
            Transition::Rewound { .. } => "rewound",
        }
    }

    /// The entity the transition is about.
    pub fn subject(&self, run_id: RunId) -> Subject {
        match self {
            Transition::PhaseEntered { phase, .. } | Transition::Rewound { phase, .. } => {
                Subject::Phase(phase.clone())
            }
            Transition::TaskReady { task }
            | Transition::TaskStarted { task, .. }
            | Transition::TaskSucceeded { task, .. }
            | Transition::TaskFailed { task, .. }
            | Transition::TaskRetryScheduled { task, .. }
            | Transition::TaskFailedTerminal { task }
            | Transition::TaskSkipped { task, .. }
            | Transition::TaskRequeued { task, .. } => Subject::Task(task.clone()),
            Transition::CheckpointRaised { checkpoint } => {
                Subject::Checkpoint(checkpoint.id.clone())
            }
            Transition::CheckpointResolved { checkpoint, .. }
            | Transition::CheckpointSuperseded { checkpoint } => {
                Subject::Checkpoint(checkpoint.clone())
            }
            _ => Subject::Run(run_id),
        }
    }
}

/// One entry of a run's event log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// 1-based, strictly increasing per run
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    pub subject: Subject,
    pub transition: Transition,
}

impl Event {
    pub fn kind(&self) -> &'static str {
        self.transition.kind()
    }
}
