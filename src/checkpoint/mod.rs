//! Checkpoint Gate: human approval between phases.
//!
//! After a phase's tasks settle, the gate looks at the phase's checkpoint
//! requirement and the latest live checkpoint for it, and decides whether
//! the run may move on. Notifications go out through an `ApprovalChannel`;
//! decisions come back through `RunController::resume`.

use crate::artifact::ArtifactStore;
use crate::errors::{EngineError, EngineResult};
use crate::state::StateManager;
use chrono::Utc;
use conductor_common::{
    Checkpoint, CheckpointId, CheckpointKind, Decision, PauseReason, PhaseId, PhaseSpec, RunId,
    Transition,
};
use tokio::sync::mpsc;

/// Where raised checkpoints are announced.
pub trait ApprovalChannel: Send + Sync {
    fn notify(&self, run_id: RunId, checkpoint: &Checkpoint);
}

/// Announces checkpoints through tracing.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogChannel;

impl ApprovalChannel for LogChannel {
    fn notify(&self, run_id: RunId, checkpoint: &Checkpoint) {
        if checkpoint.kind.is_blocking() {
            tracing::info!(
                run_id = %run_id,
                checkpoint = %checkpoint.id,
                phase = %checkpoint.phase,
                kind = %checkpoint.kind,
                "Checkpoint awaiting decision: {}",
                checkpoint.prompt
            );
        } else {
            tracing::info!(run_id = %run_id, checkpoint = %checkpoint.id, phase = %checkpoint.phase, "{}", checkpoint.prompt);
        }
    }
}

/// A raised checkpoint, as delivered by `QueueChannel`.
#[derive(Debug, Clone, PartialEq)]
pub struct CheckpointNotice {
    pub run_id: RunId,
    pub checkpoint: Checkpoint,
}

/// Delivers checkpoints to an in-process consumer.
#[derive(Debug, Clone)]
pub struct QueueChannel {
    tx: mpsc::UnboundedSender<CheckpointNotice>,
}

impl QueueChannel {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<CheckpointNotice>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl ApprovalChannel for QueueChannel {
    fn notify(&self, run_id: RunId, checkpoint: &Checkpoint) {
        let notice = CheckpointNotice {
            run_id,
            checkpoint: checkpoint.clone(),
        };
        if self.tx.send(notice).is_err() {
            tracing::debug!(run_id = %run_id, checkpoint = %checkpoint.id, "Checkpoint queue has no receiver");
        }
    }
}

/// What the gate decided for a settled phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateDecision {
    Pass,
    Pause(PauseReason),
}

pub struct CheckpointGate<'a> {
    state: &'a StateManager,
    artifacts: &'a ArtifactStore,
    channel: &'a dyn ApprovalChannel,
}

impl<'a> CheckpointGate<'a> {
    pub fn new(
        state: &'a StateManager,
        artifacts: &'a ArtifactStore,
        channel: &'a dyn ApprovalChannel,
    ) -> Self {
        Self {
            state,
            artifacts,
            channel,
        }
    }

    /// Decide whether the run may leave the phase at `index`, raising a
    /// checkpoint if one is required and none is live.
    pub fn evaluate(&self, index: usize) -> EngineResult<GateDecision> {
        let (phase, active) = self.state.with_record(|r| {
            let phase = r.plan.as_ref().and_then(|p| p.phases.get(index)).cloned();
            let active = phase
                .as_ref()
                .and_then(|p| r.active_checkpoint(&p.id))
                .map(|c| (c.id.clone(), c.decision));
            (phase, active)
        })?;
        let phase = phase
            .ok_or_else(|| EngineError::InvalidTransition(format!("no phase at index {}", index)))?;
        let Some(kind) = CheckpointKind::from_requirement(phase.checkpoint) else {
            return Ok(GateDecision::Pass);
        };

        match active {
            Some((_, Decision::Approved)) => Ok(GateDecision::Pass),
            Some((_, Decision::Pending)) => Ok(GateDecision::Pause(pause_reason(kind))),
            Some((_, Decision::Rejected)) => Ok(GateDecision::Pause(PauseReason::AwaitingClarification)),
            Some((_, Decision::ModifyRequested)) | None => {
                let summary = self.summarize(&phase, kind)?;
                let id = self.raise(&phase.id, kind, prompt(kind, &phase), summary)?;
                if kind.is_blocking() {
                    Ok(GateDecision::Pause(pause_reason(kind)))
                } else {
                    self.resolve(&id, Decision::Approved, Some("auto-approved".to_string()))?;
                    Ok(GateDecision::Pass)
                }
            }
        }
    }

    /// Record a new checkpoint for `phase` and announce it.
    pub fn raise(
        &self,
        phase: &PhaseId,
        kind: CheckpointKind,
        prompt: String,
        summary: Option<String>,
    ) -> EngineResult<CheckpointId> {
        let summary = summary.filter(|s| !s.trim().is_empty());
        if kind == CheckpointKind::Review && summary.is_none() {
            return Err(EngineError::MissingReviewSummary(phase.clone()));
        }

        let n = self.state.with_record(|r| r.checkpoint_count(phase))? + 1;
        let checkpoint = Checkpoint {
            id: CheckpointId::for_phase(phase, n),
            phase: phase.clone(),
            kind,
            prompt,
            summary,
            decision: Decision::Pending,
            note: None,
            raised_at: Utc::now(),
            resolved_at: None,
            superseded: false,
        };
        self.state.apply(Transition::CheckpointRaised {
            checkpoint: checkpoint.clone(),
        })?;
        self.channel.notify(self.state.run_id(), &checkpoint);
        Ok(checkpoint.id)
    }

    pub fn resolve(&self, id: &CheckpointId, decision: Decision, note: Option<String>) -> EngineResult<()> {
        self.state.apply(Transition::CheckpointResolved {
            checkpoint: id.clone(),
            decision,
            note,
        })?;
        tracing::info!(run_id = %self.state.run_id(), checkpoint = %id, decision = %decision, "Checkpoint resolved");
        Ok(())
    }

    /// Retire a checkpoint so the next evaluation raises a fresh one.
    pub fn supersede(&self, id: &CheckpointId) -> EngineResult<()> {
        self.state.apply(Transition::CheckpointSuperseded {
            checkpoint: id.clone(),
        })?;
        Ok(())
    }

    /// Text shown with a checkpoint: the phase's artifacts for a review,
    /// every artifact for a terminal summary, the classification for a
    /// clarification.
    fn summarize(&self, phase: &PhaseSpec, kind: CheckpointKind) -> EngineResult<Option<String>> {
        let lines: Vec<String> = match kind {
            CheckpointKind::Clarification => {
                let request = self.state.with_record(|r| r.request.clone())?;
                let tags: Vec<&str> = request.domain_tags.iter().map(String::as_str).collect();
                vec![format!(
                    "'{}' classified as {} {} [{}] with confidence {:.2}",
                    request.text,
                    request.complexity,
                    request.request_type,
                    tags.join(", "),
                    request.confidence
                )]
            }
            CheckpointKind::TerminalSummary => self
                .artifacts
                .list()?
                .iter()
                .map(|s| s.one_line())
                .collect(),
            CheckpointKind::Review | CheckpointKind::Informational => {
                let ids = self.state.with_record(|r| {
                    phase
                        .tasks
                        .iter()
                        .filter_map(|t| r.task(&t.id).and_then(|s| s.artifact.clone()))
                        .collect::<Vec<_>>()
                })?;
                ids.iter()
                    .map(|id| self.artifacts.get_summary(id).map(|s| s.one_line()))
                    .collect::<EngineResult<_>>()?
            }
        };
        Ok(if lines.is_empty() {
            None
        } else {
            Some(lines.join("\n"))
        })
    }
}

fn pause_reason(kind: CheckpointKind) -> PauseReason {
    match kind {
        CheckpointKind::Clarification => PauseReason::AwaitingClarification,
        _ => PauseReason::AwaitingCheckpoint,
    }
}

fn prompt(kind: CheckpointKind, phase: &PhaseSpec) -> String {
    match kind {
        CheckpointKind::Informational => format!("{} completed", phase.name),
        CheckpointKind::Review => format!("Review the {} output before the run continues", phase.name),
        CheckpointKind::TerminalSummary => "Approve the final results of the run".to_string(),
        CheckpointKind::Clarification => {
            "The request is ambiguous; approve the plan as is or reclassify it".to_string()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conductor_common::{
        CheckpointRequirement, ClassifiedRequest, ComplexityTier, ExecutionPattern, Plan, TaskSpec,
        ValidationStatus,
    };
    use serde_json::json;
    use tempfile::{TempDir, tempdir};

    fn setup(requirement: CheckpointRequirement) -> (TempDir, StateManager, ArtifactStore) {
        let dir = tempdir().unwrap();
        let request = ClassifiedRequest::new("add export", ComplexityTier::Medium, &["backend"]);
        let state = StateManager::create(dir.path(), RunId::new(), request).unwrap();
        let artifacts = ArtifactStore::open(state.run_dir()).unwrap();
        let id = PhaseId::new("architecture");
        let architect = TaskSpec::new(&id, "architect", "architecture.design");
        state
            .apply(Transition::PlanAdopted {
                plan: Plan {
                    version: 1,
                    pattern: ExecutionPattern::Extended,
                    phases: vec![
                        PhaseSpec::new("architecture", "Architecture")
                            .with_task(architect.clone())
                            .with_checkpoint(requirement),
                    ],
                },
                carry_over: vec![],
                cursor: None,
            })
            .unwrap();
        state
            .apply(Transition::PhaseEntered {
                phase: id.clone(),
                index: 0,
            })
            .unwrap();
        state
            .apply(Transition::TaskReady {
                task: architect.id.clone(),
            })
            .unwrap();
        state
            .apply(Transition::TaskStarted {
                task: architect.id.clone(),
                attempt: 1,
            })
            .unwrap();
        let artifact = ArtifactStore::build(
            &architect.id,
            &id,
            &architect.output,
            1,
            json!({"components": ["api", "store"]}),
            ValidationStatus::Validated,
        );
        let artifact_id = artifacts.put(&artifact).unwrap();
        state
            .apply(Transition::TaskSucceeded {
                task: architect.id,
                artifact: artifact_id,
            })
            .unwrap();
        (dir, state, artifacts)
    }

    #[test]
    fn test_review_checkpoint_blocks_until_approved() {
        let (_dir, state, artifacts) = setup(CheckpointRequirement::Review);
        let (channel, mut rx) = QueueChannel::new();
        let gate = CheckpointGate::new(&state, &artifacts, &channel);

        assert_eq!(
            gate.evaluate(0).unwrap(),
            GateDecision::Pause(PauseReason::AwaitingCheckpoint)
        );
        let notice = rx.try_recv().unwrap();
        assert_eq!(notice.checkpoint.kind, CheckpointKind::Review);
        assert!(notice.checkpoint.summary.unwrap().contains("architecture.design v1"));

        // Evaluating again does not raise a second checkpoint
        assert_eq!(
            gate.evaluate(0).unwrap(),
            GateDecision::Pause(PauseReason::AwaitingCheckpoint)
        );
        assert!(rx.try_recv().is_err());

        gate.resolve(&notice.checkpoint.id, Decision::Approved, None).unwrap();
        assert_eq!(gate.evaluate(0).unwrap(), GateDecision::Pass);
    }

    #[test]
    fn test_rejected_checkpoint_needs_clarification() {
        let (_dir, state, artifacts) = setup(CheckpointRequirement::Review);
        let gate = CheckpointGate::new(&state, &artifacts, &LogChannel);
        gate.evaluate(0).unwrap();
        let id = state.with_record(|r| r.pending_checkpoint().unwrap().id.clone()).unwrap();
        gate.resolve(&id, Decision::Rejected, Some("split the store".into())).unwrap();
        assert_eq!(
            gate.evaluate(0).unwrap(),
            GateDecision::Pause(PauseReason::AwaitingClarification)
        );
    }

    #[test]
    fn test_informational_checkpoint_is_auto_approved() {
        let (_dir, state, artifacts) = setup(CheckpointRequirement::Informational);
        let (channel, mut rx) = QueueChannel::new();
        let gate = CheckpointGate::new(&state, &artifacts, &channel);
        assert_eq!(gate.evaluate(0).unwrap(), GateDecision::Pass);
        assert!(rx.try_recv().is_ok());
        let record = state.record().unwrap();
        assert_eq!(record.checkpoints.len(), 1);
        assert_eq!(record.checkpoints[0].decision, Decision::Approved);
        assert!(record.pending_checkpoint().is_none());
    }

    #[test]
    fn test_review_without_summary_is_rejected() {
        let (_dir, state, artifacts) = setup(CheckpointRequirement::Review);
        let gate = CheckpointGate::new(&state, &artifacts, &LogChannel);
        let err = gate
            .raise(&PhaseId::new("architecture"), CheckpointKind::Review, "review".into(), Some("  ".into()))
            .unwrap_err();
        assert!(matches!(err, EngineError::MissingReviewSummary(_)));
    }

    #[test]
    fn test_no_requirement_passes() {
        let (_dir, state, artifacts) = setup(CheckpointRequirement::None);
        let gate = CheckpointGate::new(&state, &artifacts, &LogChannel);
        assert_eq!(gate.evaluate(0).unwrap(), GateDecision::Pass);
        assert!(state.record().unwrap().checkpoints.is_empty());
    }
}
