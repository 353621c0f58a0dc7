//! `resume`: continuing a run, with or without a human resolution.

use super::{RunController, RunHandle, set_status};
use crate::artifact::ArtifactStore;
use crate::checkpoint::CheckpointGate;
use crate::errors::{EngineError, EngineResult};
use crate::planner::{clarification_schema, last_task, modification_schema};
use crate::state::{RunRecord, RunSnapshot};
use conductor_common::{
    Checkpoint, ClassifiedRequest, Decision, PauseReason, Resolution, RunId, RunStatus, SchemaId,
    TaskId, Transition, ValidationStatus,
};
use serde_json::json;

impl RunController {
    /// Continue a run.
    ///
    /// Without a resolution, a paused or finished run is left as it is and
    /// an interrupted one is recovered and driven on. With one, the
    /// resolution must fit the reason the run is paused.
    pub async fn resume(&self, run_id: RunId, resolution: Option<Resolution>) -> EngineResult<RunSnapshot> {
        let handle = self.handle(run_id)?;
        {
            let _guard = handle.drive.lock().await;
            let record = handle.state.record()?;
            let status = record.status;

            match (status, resolution) {
                (_, None) if status.is_terminal() || status.is_paused() => {
                    return handle.state.snapshot(self.config.max_retries);
                }
                (RunStatus::Paused(_), Some(Resolution::Cancel)) => {
                    set_status(&handle.state, RunStatus::Cancelled, None)?;
                    tracing::info!(run_id = %run_id, "Run cancelled at checkpoint");
                    return handle.state.snapshot(self.config.max_retries);
                }
                (RunStatus::Paused(PauseReason::AwaitingCheckpoint), Some(resolution)) => {
                    self.resolve_checkpoint(&handle, &record, resolution)?;
                }
                (RunStatus::Paused(PauseReason::AwaitingClarification), Some(resolution)) => {
                    if record.awaiting_ambiguity() {
                        self.resolve_ambiguity(&handle, &record, resolution)?;
                    } else {
                        self.resolve_rejection(&handle, &record, resolution)?;
                    }
                }
                (RunStatus::Paused(PauseReason::NeedsRescope), Some(Resolution::Reclassify { request })) => {
                    self.replan_from_cursor(&handle, &record, &request, None)?;
                }
                (_, Some(resolution)) => return Err(not_accepted(&resolution, status)),
                // Interrupted while planning or executing
                (_, None) => {
                    tracing::info!(run_id = %run_id, status = %status, "Resuming interrupted run");
                }
            }
        }
        self.drive(&handle).await?;
        handle.state.snapshot(self.config.max_retries)
    }

    fn resolve_checkpoint(
        &self,
        handle: &RunHandle,
        record: &RunRecord,
        resolution: Resolution,
    ) -> EngineResult<()> {
        let checkpoint = record
            .pending_checkpoint()
            .cloned()
            .ok_or_else(|| EngineError::InvalidTransition("no pending checkpoint".into()))?;
        let gate = CheckpointGate::new(&handle.state, &handle.artifacts, self.channel.as_ref());

        match resolution {
            Resolution::Approve { note } => {
                gate.resolve(&checkpoint.id, Decision::Approved, note)?;
                set_status(&handle.state, RunStatus::Executing, None)
            }
            Resolution::Reject { reason } => {
                gate.resolve(&checkpoint.id, Decision::Rejected, Some(reason))?;
                set_status(
                    &handle.state,
                    RunStatus::Paused(PauseReason::AwaitingClarification),
                    None,
                )
            }
            Resolution::Modify { task, instructions } => {
                let target = match task {
                    Some(task) => task,
                    None => default_target(record, &checkpoint)?,
                };
                let owning_phase = record
                    .plan
                    .as_ref()
                    .and_then(|p| p.task(&target.root()))
                    .map(|t| t.phase.clone());
                if owning_phase.as_ref() != Some(&checkpoint.phase) {
                    return Err(EngineError::InvalidResolution {
                        resolution: format!("modify {}", target),
                        status: format!("reviewing phase {}", checkpoint.phase),
                    });
                }
                self.add_revision(
                    handle,
                    record,
                    &checkpoint,
                    &target,
                    modification_schema(),
                    &instructions,
                )?;
                gate.resolve(&checkpoint.id, Decision::ModifyRequested, Some(instructions))?;
                gate.supersede(&checkpoint.id)?;
                set_status(&handle.state, RunStatus::Executing, None)
            }
            other => Err(not_accepted(&other, record.status)),
        }
    }

    /// The run paused on a clarification checkpoint because the request
    /// was classified with low confidence.
    fn resolve_ambiguity(
        &self,
        handle: &RunHandle,
        record: &RunRecord,
        resolution: Resolution,
    ) -> EngineResult<()> {
        let checkpoint = record
            .pending_checkpoint()
            .cloned()
            .ok_or_else(|| EngineError::InvalidTransition("no pending checkpoint".into()))?;
        let gate = CheckpointGate::new(&handle.state, &handle.artifacts, self.channel.as_ref());

        match resolution {
            Resolution::Approve { note } => {
                gate.resolve(&checkpoint.id, Decision::Approved, note)?;
                set_status(&handle.state, RunStatus::Executing, None)
            }
            Resolution::Reclassify { request } => {
                let plan = record
                    .plan
                    .as_ref()
                    .ok_or_else(|| EngineError::InvalidTransition("run has no plan".into()))?;
                let replanned = self.planner.replan(plan, 0, &request)?;
                gate.supersede(&checkpoint.id)?;
                handle.state.apply(Transition::PlanAdopted {
                    plan: replanned,
                    carry_over: Vec::new(),
                    cursor: None,
                })?;
                tracing::info!(run_id = %record.run_id, "Request reclassified; plan replaced");
                set_status(&handle.state, RunStatus::Executing, None)
            }
            other => Err(not_accepted(&other, record.status)),
        }
    }

    /// The run paused because a checkpoint was rejected.
    fn resolve_rejection(
        &self,
        handle: &RunHandle,
        record: &RunRecord,
        resolution: Resolution,
    ) -> EngineResult<()> {
        let checkpoint = record
            .current_phase()
            .and_then(|p| record.active_checkpoint(&p.id))
            .filter(|c| c.decision == Decision::Rejected)
            .cloned()
            .ok_or_else(|| EngineError::InvalidTransition("no rejected checkpoint".into()))?;

        match resolution {
            Resolution::Clarify { text } => {
                let target = default_target(record, &checkpoint)?;
                self.add_revision(handle, record, &checkpoint, &target, clarification_schema(), &text)?;
                let gate = CheckpointGate::new(&handle.state, &handle.artifacts, self.channel.as_ref());
                gate.supersede(&checkpoint.id)?;
                set_status(&handle.state, RunStatus::Executing, None)
            }
            Resolution::Reclassify { request } => {
                self.replan_from_cursor(handle, record, &request, Some(&checkpoint))
            }
            other => Err(not_accepted(&other, record.status)),
        }
    }

    /// Keep every phase before the current one and re-derive the rest from
    /// a new classification.
    fn replan_from_cursor(
        &self,
        handle: &RunHandle,
        record: &RunRecord,
        request: &ClassifiedRequest,
        checkpoint: Option<&Checkpoint>,
    ) -> EngineResult<()> {
        let plan = record
            .plan
            .as_ref()
            .ok_or_else(|| EngineError::InvalidTransition("run has no plan".into()))?;
        let keep = record.cursor.unwrap_or(0);
        let replanned = self.planner.replan(plan, keep, request)?;
        let carry_over: Vec<TaskId> = plan.phases[..keep]
            .iter()
            .flat_map(|p| p.tasks.iter().map(|t| t.id.clone()))
            .collect();

        if let Some(checkpoint) = checkpoint {
            CheckpointGate::new(&handle.state, &handle.artifacts, self.channel.as_ref())
                .supersede(&checkpoint.id)?;
        }
        handle.state.apply(Transition::PlanAdopted {
            plan: replanned,
            carry_over,
            cursor: keep.checked_sub(1),
        })?;
        tracing::info!(run_id = %record.run_id, kept_phases = keep, "Re-planned remaining phases");
        set_status(&handle.state, RunStatus::Executing, None)
    }

    /// Store the human's text as an artifact and adopt a plan that revises
    /// `target` with it attached.
    fn add_revision(
        &self,
        handle: &RunHandle,
        record: &RunRecord,
        checkpoint: &Checkpoint,
        target: &TaskId,
        schema: SchemaId,
        text: &str,
    ) -> EngineResult<TaskId> {
        let plan = record
            .plan
            .as_ref()
            .ok_or_else(|| EngineError::InvalidTransition("run has no plan".into()))?;
        let producer = TaskId::new(format!("checkpoint:{}", checkpoint.id));
        let version = handle.artifacts.next_version(&producer, &schema)?;
        let attachment = ArtifactStore::build(
            &producer,
            &checkpoint.phase,
            &schema,
            version,
            json!({
                "checkpoint": checkpoint.id,
                "target": target,
                "text": text,
            }),
            ValidationStatus::Supplied,
        );

        let (revised, revision) = self.planner.revise(plan, target, attachment.id.clone())?;
        handle.artifacts.put(&attachment)?;
        handle.state.apply(Transition::PlanAdopted {
            plan: revised,
            carry_over: record.tasks.keys().cloned().collect(),
            cursor: record.cursor,
        })?;
        tracing::info!(run_id = %record.run_id, target = %target, revision = %revision, "Revision task added");
        Ok(revision)
    }
}

/// Task a modification or clarification without an explicit target goes to.
fn default_target(record: &RunRecord, checkpoint: &Checkpoint) -> EngineResult<TaskId> {
    record
        .plan
        .as_ref()
        .and_then(|p| last_task(p, &checkpoint.phase))
        .map(|t| t.id)
        .ok_or_else(|| EngineError::InvalidResolution {
            resolution: "revision".to_string(),
            status: format!("phase {} has no task to revise", checkpoint.phase),
        })
}

fn not_accepted(resolution: &Resolution, status: RunStatus) -> EngineError {
    EngineError::InvalidResolution {
        resolution: resolution.name().to_string(),
        status: status.to_string(),
    }
}
