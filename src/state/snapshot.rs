//! Read-only view of a run returned by `status()`.

use super::record::RunRecord;
use chrono::{DateTime, Utc};
use conductor_common::{
    ArtifactId, Checkpoint, ErrorClass, ExecutionPattern, FailureDetail, PhaseId, PhaseStatus,
    RunId, RunStatus, TaskId, TaskStatus,
};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskView {
    pub id: TaskId,
    pub producer: String,
    pub status: TaskStatus,
    pub attempts: u32,
    pub remaining_retries: u32,
    pub skip_tolerant: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<ErrorClass>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact: Option<ArtifactId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseView {
    pub id: PhaseId,
    pub name: String,
    pub status: PhaseStatus,
    pub tasks: Vec<TaskView>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSnapshot {
    pub run_id: RunId,
    pub status: RunStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<ExecutionPattern>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan_version: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_phase: Option<PhaseId>,
    pub phases: Vec<PhaseView>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_checkpoint: Option<Checkpoint>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureDetail>,
    pub cancel_requested: bool,
    pub event_head: u64,
}

impl RunSnapshot {
    pub fn from_record(record: &RunRecord, max_retries: u32) -> Self {
        let phases = record
            .plan
            .as_ref()
            .map(|plan| {
                plan.phases
                    .iter()
                    .enumerate()
                    .map(|(index, phase)| PhaseView {
                        id: phase.id.clone(),
                        name: phase.name.clone(),
                        status: record.phase_status(index),
                        tasks: phase
                            .tasks
                            .iter()
                            .map(|spec| {
                                let state = record.task(&spec.id).cloned().unwrap_or_default();
                                let remaining_retries = match state.status {
                                    TaskStatus::Succeeded
                                    | TaskStatus::FailedTerminal
                                    | TaskStatus::Skipped => 0,
                                    _ => (max_retries + 1).saturating_sub(state.attempts),
                                };
                                TaskView {
                                    id: spec.id.clone(),
                                    producer: spec.producer.clone(),
                                    status: state.status,
                                    attempts: state.attempts,
                                    remaining_retries,
                                    skip_tolerant: spec.skip_tolerant,
                                    last_error: state.last_error.as_ref().map(|f| f.class()),
                                    last_message: state.last_error.map(|f| f.message),
                                    artifact: state.artifact,
                                }
                            })
                            .collect(),
                    })
                    .collect()
            })
            .unwrap_or_default();

        Self {
            run_id: record.run_id,
            status: record.status,
            created_at: record.created_at,
            updated_at: record.updated_at,
            pattern: record.plan.as_ref().map(|p| p.pattern),
            plan_version: record.plan.as_ref().map(|p| p.version),
            current_phase: record.current_phase().map(|p| p.id.clone()),
            phases,
            pending_checkpoint: record.pending_checkpoint().cloned(),
            failure: record.failure.clone(),
            cancel_requested: record.cancel_requested,
            event_head: record.event_head,
        }
    }

    pub fn phase(&self, id: &str) -> Option<&PhaseView> {
        self.phases.iter().find(|p| p.id.as_str() == id)
    }

    pub fn task(&self, id: &str) -> Option<&TaskView> {
        self.phases
            .iter()
            .flat_map(|p| p.tasks.iter())
            .find(|t| t.id.as_str() == id)
    }

    pub fn tasks(&self) -> impl Iterator<Item = &TaskView> {
        self.phases.iter().flat_map(|p| p.tasks.iter())
    }
}
