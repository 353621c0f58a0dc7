//! The run record and the rules for applying events to it.
//!
//! `RunRecord::apply` is the only place run state changes. Replaying the
//! event log through it rebuilds the record exactly.

use crate::errors::{EngineError, EngineResult};
use chrono::{DateTime, Utc};
use conductor_common::{
    ArtifactId, Checkpoint, CheckpointKind, ClassifiedRequest, Decision, Event, FailureDetail,
    InputRef, PhaseId, PhaseSpec, PhaseStatus, Plan, RunId, RunStatus, TaskFailure, TaskId,
    TaskSpec, TaskStatus, Transition,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Mutable per-task state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskState {
    pub status: TaskStatus,
    /// Invocations started so far
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<TaskFailure>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact: Option<ArtifactId>,
}

/// Whether a task's inputs allow it to run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Readiness {
    Ready,
    /// Some producer has not finished yet
    Waiting,
    /// A required producer is terminally lost
    Unsatisfiable(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: RunId,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub request: ClassifiedRequest,
    pub status: RunStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureDetail>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan: Option<Plan>,
    #[serde(default)]
    pub tasks: BTreeMap<TaskId, TaskState>,
    #[serde(default)]
    pub checkpoints: Vec<Checkpoint>,
    /// Index of the phase the run is in; `None` before the first phase
    #[serde(default)]
    pub cursor: Option<usize>,
    #[serde(default)]
    pub cancel_requested: bool,
    /// Seq of the last event applied
    pub event_head: u64,
}

impl RunRecord {
    /// Record as it exists right after its `run_created` event.
    pub fn from_created(event: &Event) -> EngineResult<Self> {
        match &event.transition {
            Transition::RunCreated { run_id, request } if event.seq == 1 => Ok(Self {
                run_id: *run_id,
                created_at: event.timestamp,
                updated_at: event.timestamp,
                request: request.clone(),
                status: RunStatus::Initialized,
                failure: None,
                plan: None,
                tasks: BTreeMap::new(),
                checkpoints: Vec::new(),
                cursor: None,
                cancel_requested: false,
                event_head: event.seq,
            }),
            other => Err(EngineError::InvalidTransition(format!(
                "event log must start with run_created at seq 1, found {} at seq {}",
                other.kind(),
                event.seq
            ))),
        }
    }

    /// Rebuild a record from a complete event log.
    pub fn replay(events: &[Event]) -> EngineResult<Self> {
        let (first, rest) = events
            .split_first()
            .ok_or_else(|| EngineError::InvalidTransition("event log is empty".into()))?;
        let mut record = Self::from_created(first)?;
        for event in rest {
            record.apply(event)?;
        }
        Ok(record)
    }

    /// Apply one event, rejecting it if it is not a legal transition.
    pub fn apply(&mut self, event: &Event) -> EngineResult<()> {
        if event.seq != self.event_head + 1 {
            return Err(EngineError::InvalidTransition(format!(
                "event seq {} does not follow {}",
                event.seq, self.event_head
            )));
        }

        match &event.transition {
            Transition::RunCreated { .. } => {
                return Err(invalid("run already created"));
            }
            Transition::StatusChanged { status, failure } => {
                if !self.status.can_transition_to(status) {
                    return Err(invalid(format!(
                        "run cannot move from {} to {}",
                        self.status, status
                    )));
                }
                self.status = *status;
                self.failure = failure.clone();
            }
            Transition::PlanAdopted {
                plan,
                carry_over,
                cursor,
            } => {
                if let Some(current) = &self.plan
                    && plan.version <= current.version
                {
                    return Err(invalid(format!(
                        "plan version {} does not supersede {}",
                        plan.version, current.version
                    )));
                }
                if let Some(c) = cursor
                    && *c >= plan.phases.len()
                {
                    return Err(invalid(format!("cursor {} outside plan", c)));
                }
                let mut tasks = BTreeMap::new();
                for task in plan.tasks() {
                    let state = if carry_over.contains(&task.id) {
                        self.tasks.get(&task.id).cloned().unwrap_or_default()
                    } else {
                        TaskState::default()
                    };
                    tasks.insert(task.id.clone(), state);
                }
                self.tasks = tasks;
                self.plan = Some(plan.clone());
                self.cursor = *cursor;
            }
            Transition::PhaseEntered { phase, index } => {
                let plan = self.plan.as_ref().ok_or_else(|| invalid("no plan adopted"))?;
                let spec = plan
                    .phases
                    .get(*index)
                    .ok_or_else(|| invalid(format!("phase index {} outside plan", index)))?;
                if &spec.id != phase {
                    return Err(invalid(format!(
                        "phase {} is not at index {}",
                        phase, index
                    )));
                }
                let expected = self.cursor.map_or(0, |c| c + 1);
                if *index != expected {
                    return Err(invalid(format!(
                        "cannot enter phase {} at index {}, expected {}",
                        phase, index, expected
                    )));
                }
                self.cursor = Some(*index);
            }
            Transition::Rewound { phase, index } => {
                let plan = self.plan.as_ref().ok_or_else(|| invalid("no plan adopted"))?;
                if plan.phase_index(phase) != Some(*index) {
                    return Err(invalid(format!("phase {} is not at index {}", phase, index)));
                }
                let rewound: Vec<TaskId> = plan.phases[*index..]
                    .iter()
                    .flat_map(|p| p.tasks.iter().map(|t| t.id.clone()))
                    .collect();
                let phases: Vec<PhaseId> =
                    plan.phases[*index..].iter().map(|p| p.id.clone()).collect();
                for id in rewound {
                    self.tasks.insert(id, TaskState::default());
                }
                for cp in &mut self.checkpoints {
                    if phases.contains(&cp.phase) {
                        cp.superseded = true;
                    }
                }
                self.cursor = index.checked_sub(1);
            }
            Transition::TaskReady { task } => {
                self.move_task(task, TaskStatus::Ready)?;
            }
            Transition::TaskStarted { task, attempt } => {
                let state = self.task_state(task)?;
                if *attempt != state.attempts + 1 {
                    return Err(invalid(format!(
                        "task {} attempt {} does not follow {}",
                        task, attempt, state.attempts
                    )));
                }
                self.move_task(task, TaskStatus::Running)?;
                if let Some(state) = self.tasks.get_mut(task) {
                    state.attempts = *attempt;
                }
            }
            Transition::TaskSucceeded { task, artifact } => {
                self.move_task(task, TaskStatus::Succeeded)?;
                if let Some(state) = self.tasks.get_mut(task) {
                    state.artifact = Some(artifact.clone());
                    state.last_error = None;
                }
            }
            Transition::TaskFailed { task, failure } => {
                self.move_task(task, TaskStatus::Failed)?;
                if let Some(state) = self.tasks.get_mut(task) {
                    state.last_error = Some(failure.clone());
                }
            }
            Transition::TaskRetryScheduled { task, .. } => {
                if self.task_state(task)?.status != TaskStatus::Failed {
                    return Err(invalid(format!("task {} is not failed", task)));
                }
            }
            Transition::TaskFailedTerminal { task } => {
                self.move_task(task, TaskStatus::FailedTerminal)?;
            }
            Transition::TaskSkipped { task, .. } => {
                self.move_task(task, TaskStatus::Skipped)?;
            }
            Transition::TaskRequeued { task, .. } => {
                self.move_task(task, TaskStatus::Ready)?;
                if let Some(state) = self.tasks.get_mut(task) {
                    state.artifact = None;
                }
            }
            Transition::CheckpointRaised { checkpoint } => {
                if self.checkpoints.iter().any(|c| c.id == checkpoint.id) {
                    return Err(invalid(format!("checkpoint {} already raised", checkpoint.id)));
                }
                self.checkpoints.push(checkpoint.clone());
            }
            Transition::CheckpointResolved {
                checkpoint,
                decision,
                note,
            } => {
                let cp = self
                    .checkpoints
                    .iter_mut()
                    .find(|c| &c.id == checkpoint)
                    .ok_or_else(|| EngineError::CheckpointNotFound(checkpoint.clone()))?;
                if !cp.is_pending() || *decision == Decision::Pending {
                    return Err(invalid(format!(
                        "checkpoint {} cannot move from {} to {}",
                        cp.id, cp.decision, decision
                    )));
                }
                cp.decision = *decision;
                cp.note = note.clone();
                cp.resolved_at = Some(event.timestamp);
            }
            Transition::CheckpointSuperseded { checkpoint } => {
                let cp = self
                    .checkpoints
                    .iter_mut()
                    .find(|c| &c.id == checkpoint)
                    .ok_or_else(|| EngineError::CheckpointNotFound(checkpoint.clone()))?;
                cp.superseded = true;
            }
            Transition::CancelRequested => {
                if self.status.is_terminal() {
                    return Err(invalid(format!("run is already {}", self.status)));
                }
                self.cancel_requested = true;
            }
        }

        self.updated_at = event.timestamp;
        self.event_head = event.seq;
        Ok(())
    }

    fn task_state(&self, id: &TaskId) -> EngineResult<&TaskState> {
        self.tasks
            .get(id)
            .ok_or_else(|| invalid(format!("unknown task {}", id)))
    }

    fn move_task(&mut self, id: &TaskId, next: TaskStatus) -> EngineResult<()> {
        let state = self
            .tasks
            .get_mut(id)
            .ok_or_else(|| invalid(format!("unknown task {}", id)))?;
        if !state.status.can_transition_to(&next) {
            return Err(invalid(format!(
                "task {} cannot move from {} to {}",
                id, state.status, next
            )));
        }
        state.status = next;
        Ok(())
    }

    pub fn task(&self, id: &TaskId) -> Option<&TaskState> {
        self.tasks.get(id)
    }

    pub fn task_status(&self, id: &TaskId) -> TaskStatus {
        self.tasks.get(id).map(|s| s.status).unwrap_or_default()
    }

    pub fn current_phase(&self) -> Option<&PhaseSpec> {
        let plan = self.plan.as_ref()?;
        plan.phases.get(self.cursor?)
    }

    /// Latest checkpoint for `phase` that has not been superseded.
    pub fn active_checkpoint(&self, phase: &PhaseId) -> Option<&Checkpoint> {
        self.checkpoints
            .iter()
            .rev()
            .find(|c| &c.phase == phase && !c.superseded)
    }

    /// The checkpoint a paused run is waiting on, if any.
    pub fn pending_checkpoint(&self) -> Option<&Checkpoint> {
        self.checkpoints
            .iter()
            .rev()
            .find(|c| !c.superseded && c.is_pending())
    }

    /// Number of checkpoints ever raised for `phase`.
    pub fn checkpoint_count(&self, phase: &PhaseId) -> usize {
        self.checkpoints.iter().filter(|c| &c.phase == phase).count()
    }

    /// Derived status of the phase at `index`.
    pub fn phase_status(&self, index: usize) -> PhaseStatus {
        let Some(plan) = &self.plan else {
            return PhaseStatus::Pending;
        };
        let Some(phase) = plan.phases.get(index) else {
            return PhaseStatus::Pending;
        };
        match self.cursor {
            Some(c) if c >= index => {}
            _ => return PhaseStatus::Pending,
        }

        let lost_required = phase
            .tasks
            .iter()
            .any(|t| !t.skip_tolerant && self.task_status(&t.id).is_lost());
        if lost_required {
            return PhaseStatus::Failed;
        }
        let settled = phase
            .tasks
            .iter()
            .all(|t| self.task_status(&t.id).is_terminal());
        if !settled {
            return PhaseStatus::Active;
        }
        if !phase.checkpoint.is_blocking() {
            return PhaseStatus::Completed;
        }
        match self.active_checkpoint(&phase.id).map(|c| c.decision) {
            Some(Decision::Approved) => PhaseStatus::Completed,
            Some(Decision::Pending) | Some(Decision::Rejected) => PhaseStatus::Blocked,
            Some(Decision::ModifyRequested) | None => PhaseStatus::Active,
        }
    }

    /// Producer an input reference resolves to right now.
    pub fn resolve_input(&self, input: &InputRef) -> TaskId {
        match &self.plan {
            Some(plan) if !input.pinned => plan.latest_revision(&input.task),
            _ => input.task.clone(),
        }
    }

    /// Whether `task`'s inputs are all available.
    pub fn readiness(&self, task: &TaskSpec) -> Readiness {
        let mut waiting = false;
        for input in &task.inputs {
            let producer = self.resolve_input(input);
            let Some(state) = self.tasks.get(&producer) else {
                if input.optional {
                    continue;
                }
                return Readiness::Unsatisfiable(format!("input producer {} is not planned", producer));
            };
            match state.status {
                TaskStatus::Succeeded if state.artifact.is_some() => {}
                s if s.is_lost() => {
                    if !input.optional {
                        return Readiness::Unsatisfiable(format!(
                            "required input from {} is {}",
                            producer, s
                        ));
                    }
                }
                _ => waiting = true,
            }
        }
        if waiting {
            Readiness::Waiting
        } else {
            Readiness::Ready
        }
    }

    /// Artifact ids feeding `task`: resolved inputs in declaration order,
    /// then attachments. Optional inputs whose producer is lost are omitted.
    pub fn input_artifacts(&self, task: &TaskSpec) -> Vec<ArtifactId> {
        let mut ids: Vec<ArtifactId> = task
            .inputs
            .iter()
            .filter_map(|input| {
                let producer = self.resolve_input(input);
                self.tasks.get(&producer).and_then(|s| s.artifact.clone())
            })
            .collect();
        ids.extend(task.attachments.iter().cloned());
        ids
    }

    /// Whether the checkpoint a paused run waits on came from planning
    /// ambiguity rather than a rejection.
    pub fn awaiting_ambiguity(&self) -> bool {
        self.current_phase()
            .and_then(|p| self.active_checkpoint(&p.id))
            .is_some_and(|c| c.kind == CheckpointKind::Clarification && c.is_pending())
    }
}

fn invalid(message: impl Into<String>) -> EngineError {
    EngineError::InvalidTransition(message.into())
}
