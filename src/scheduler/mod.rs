//! Phase Scheduler: drives the tasks of one phase until they settle.
//!
//! Each pass promotes pending tasks whose inputs exist, dispatches ready
//! tasks up to the concurrency limit, then waits for one invocation (or
//! retry timer) to finish and records its outcome. No ordering is assumed
//! among independent tasks.

pub mod retry;

pub use retry::RetryPolicy;

use crate::artifact::ArtifactStore;
use crate::config::EngineConfig;
use crate::errors::{EngineError, EngineResult};
use crate::invoker::Invoker;
use crate::state::{Readiness, RunRecord, StateManager};
use conductor_common::{
    Artifact, ErrorClass, FailureDetail, PhaseSpec, TaskFailure, TaskId, TaskSpec, TaskStatus,
    Transition, ValidationStatus, WorkerOutput,
};
use serde_json::Value;
use std::collections::HashSet;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// How a phase's task execution ended.
#[derive(Debug, Clone, PartialEq)]
pub enum PhaseRun {
    /// Every task is terminal and no required task was lost
    Settled,
    /// A required task failed terminally or was skipped
    Failed(FailureDetail),
    /// A task's inputs exceeded its capacity
    Overflow(FailureDetail),
    /// Cancellation was requested; in-flight results were discarded
    Cancelled,
}

enum Completion {
    Finished {
        task: TaskSpec,
        attempt: u32,
        result: Result<WorkerOutput, TaskFailure>,
    },
    RetryDue {
        task: TaskId,
    },
}

pub struct PhaseScheduler<'a> {
    state: &'a StateManager,
    artifacts: &'a ArtifactStore,
    invoker: &'a Invoker,
    cancel: &'a CancellationToken,
    policy: RetryPolicy,
    max_parallel: usize,
    fail_fast: bool,
}

impl<'a> PhaseScheduler<'a> {
    pub fn new(
        state: &'a StateManager,
        artifacts: &'a ArtifactStore,
        invoker: &'a Invoker,
        cancel: &'a CancellationToken,
        config: &EngineConfig,
    ) -> Self {
        Self {
            state,
            artifacts,
            invoker,
            cancel,
            policy: RetryPolicy::from_config(config),
            max_parallel: config.max_parallel.max(1),
            fail_fast: config.fail_fast,
        }
    }

    /// Run the phase at `index` until every task is terminal, a stop
    /// condition is hit, or the run is cancelled.
    pub async fn run(&self, index: usize) -> EngineResult<PhaseRun> {
        let phase = self
            .state
            .with_record(|r| r.plan.as_ref().and_then(|p| p.phases.get(index)).cloned())?
            .ok_or_else(|| EngineError::InvalidTransition(format!("no phase at index {}", index)))?;
        let run_id = self.state.run_id();
        let limit = if phase.concurrent { self.max_parallel } else { 1 };

        // Stops dispatch without discarding results; cancelling the run
        // cancels it too.
        let halt = self.cancel.child_token();
        let mut running: JoinSet<Completion> = JoinSet::new();
        let mut invoking: HashSet<TaskId> = HashSet::new();
        let mut waiting: HashSet<TaskId> = HashSet::new();
        let mut failure: Option<FailureDetail> = None;
        let mut overflow: Option<FailureDetail> = None;

        tracing::info!(run_id = %run_id, phase = %phase.id, tasks = phase.tasks.len(), concurrency = limit, "Phase started");

        // Main execution loop
        loop {
            if !halt.is_cancelled() {
                let busy: HashSet<&TaskId> = invoking.iter().chain(waiting.iter()).collect();
                self.settle(&phase, &busy)?;

                if failure.is_none() {
                    failure = self.state.with_record(|r| lost_required(r, &phase))?;
                    if let Some(detail) = &failure {
                        tracing::error!(run_id = %run_id, phase = %phase.id, failure = %detail, "Required task lost");
                        if self.fail_fast {
                            halt.cancel();
                        }
                    }
                }
            }

            if !halt.is_cancelled() {
                let ready: Vec<TaskSpec> = self.state.with_record(|r| {
                    phase
                        .tasks
                        .iter()
                        .filter(|t| r.task_status(&t.id) == TaskStatus::Ready)
                        .filter(|t| !invoking.contains(&t.id) && !waiting.contains(&t.id))
                        .cloned()
                        .collect()
                })?;
                for task in ready {
                    if invoking.len() >= limit {
                        break;
                    }
                    invoking.insert(task.id.clone());
                    self.dispatch(task, &mut running)?;
                }
            }

            let Some(joined) = running.join_next().await else {
                break;
            };
            let completion = joined
                .map_err(|e| EngineError::Other(anyhow::anyhow!("task invocation aborted: {}", e)))?;

            match completion {
                Completion::Finished {
                    task,
                    attempt,
                    result,
                } => {
                    invoking.remove(&task.id);
                    if self.cancel.is_cancelled() {
                        tracing::info!(run_id = %run_id, task = %task.id, "Discarding result after cancellation");
                        self.state.apply(Transition::TaskRequeued {
                            task: task.id.clone(),
                            reason: "result discarded after cancellation".to_string(),
                        })?;
                        continue;
                    }

                    let result = result.and_then(|output| validate(&task, output));
                    match result {
                        Ok(payload) => self.record_success(&task, attempt, payload)?,
                        Err(task_failure) => {
                            let outcome = self.record_failure(&task, attempt, task_failure)?;
                            match outcome {
                                FailureOutcome::Retry(delay) => {
                                    waiting.insert(task.id.clone());
                                    let halt = halt.clone();
                                    let id = task.id.clone();
                                    running.spawn(async move {
                                        tokio::select! {
                                            _ = tokio::time::sleep(delay) => {}
                                            _ = halt.cancelled() => {}
                                        }
                                        Completion::RetryDue { task: id }
                                    });
                                }
                                FailureOutcome::Overflow(detail) => {
                                    if overflow.is_none() {
                                        overflow = Some(detail);
                                    }
                                    halt.cancel();
                                }
                                FailureOutcome::Terminal => {}
                            }
                        }
                    }
                }
                Completion::RetryDue { task } => {
                    waiting.remove(&task);
                    // Left failed when halted; recovery decides on resume
                    if !halt.is_cancelled() {
                        self.state.apply(Transition::TaskReady { task })?;
                    }
                }
            }
        }

        if self.cancel.is_cancelled() {
            tracing::info!(run_id = %run_id, phase = %phase.id, "Phase interrupted by cancellation");
            return Ok(PhaseRun::Cancelled);
        }
        if let Some(detail) = overflow {
            return Ok(PhaseRun::Overflow(detail));
        }
        if let Some(detail) = failure.or(self.state.with_record(|r| lost_required(r, &phase))?) {
            return Ok(PhaseRun::Failed(detail));
        }

        let unsettled: Vec<String> = self.state.with_record(|r| {
            phase
                .tasks
                .iter()
                .filter(|t| !r.task_status(&t.id).is_terminal())
                .map(|t| format!("{} ({})", t.id, r.task_status(&t.id)))
                .collect()
        })?;
        if !unsettled.is_empty() {
            return Err(EngineError::InvalidTransition(format!(
                "phase {} stalled with unfinished tasks: {}",
                phase.id,
                unsettled.join(", ")
            )));
        }

        tracing::info!(run_id = %run_id, phase = %phase.id, "Phase tasks settled");
        Ok(PhaseRun::Settled)
    }

    /// Promote pending tasks whose inputs are available, skip those whose
    /// inputs never will be, and decide failed tasks left by an
    /// interrupted session. Repeats until nothing changes.
    fn settle(&self, phase: &PhaseSpec, busy: &HashSet<&TaskId>) -> EngineResult<()> {
        loop {
            let actions: Vec<Transition> = self.state.with_record(|record| {
                let mut actions = Vec::new();
                for spec in &phase.tasks {
                    if busy.contains(&spec.id) {
                        continue;
                    }
                    let Some(state) = record.task(&spec.id) else {
                        continue;
                    };
                    match state.status {
                        TaskStatus::Pending => match record.readiness(spec) {
                            Readiness::Ready => actions.push(Transition::TaskReady {
                                task: spec.id.clone(),
                            }),
                            Readiness::Unsatisfiable(reason) => {
                                actions.push(Transition::TaskSkipped {
                                    task: spec.id.clone(),
                                    reason,
                                })
                            }
                            Readiness::Waiting => {}
                        },
                        TaskStatus::Failed => {
                            let retryable = state
                                .last_error
                                .as_ref()
                                .is_some_and(|f| f.recoverable)
                                && self.policy.allows_retry(state.attempts);
                            actions.push(if retryable {
                                Transition::TaskReady {
                                    task: spec.id.clone(),
                                }
                            } else {
                                Transition::TaskFailedTerminal {
                                    task: spec.id.clone(),
                                }
                            });
                        }
                        _ => {}
                    }
                }
                actions
            })?;

            if actions.is_empty() {
                return Ok(());
            }
            for action in actions {
                if let Transition::TaskSkipped { task, reason } = &action {
                    tracing::warn!(run_id = %self.state.run_id(), task = %task, reason = %reason, "Task skipped");
                }
                self.state.apply(action)?;
            }
        }
    }

    /// Load the task's inputs, mark it running and spawn its invocation.
    fn dispatch(&self, task: TaskSpec, running: &mut JoinSet<Completion>) -> EngineResult<()> {
        let (input_ids, attempt) = self.state.with_record(|r| {
            (
                r.input_artifacts(&task),
                r.task(&task.id).map_or(0, |s| s.attempts) + 1,
            )
        })?;
        let inputs: Vec<Artifact> = input_ids
            .iter()
            .map(|id| self.artifacts.get(id))
            .collect::<EngineResult<_>>()?;

        self.state.apply(Transition::TaskStarted {
            task: task.id.clone(),
            attempt,
        })?;
        tracing::info!(
            run_id = %self.state.run_id(),
            phase = %task.phase,
            task = %task.id,
            attempt,
            inputs = inputs.len(),
            "Task dispatched"
        );

        let invoker = self.invoker.clone();
        running.spawn(async move {
            let result = invoker.invoke(&task, &inputs).await;
            Completion::Finished {
                task,
                attempt,
                result,
            }
        });
        Ok(())
    }

    /// Store the artifact, then record the success. The artifact exists
    /// before any consumer can be marked ready.
    fn record_success(&self, task: &TaskSpec, attempt: u32, payload: Value) -> EngineResult<()> {
        let version = self.artifacts.next_version(&task.id, &task.output)?;
        let artifact = ArtifactStore::build(
            &task.id,
            &task.phase,
            &task.output,
            version,
            payload,
            ValidationStatus::Validated,
        );
        let id = self.artifacts.put(&artifact)?;
        self.state.apply(Transition::TaskSucceeded {
            task: task.id.clone(),
            artifact: id.clone(),
        })?;
        tracing::info!(
            run_id = %self.state.run_id(),
            task = %task.id,
            attempt,
            artifact = %id,
            version,
            "Task succeeded"
        );
        Ok(())
    }

    fn record_failure(&self, task: &TaskSpec, attempt: u32, failure: TaskFailure) -> EngineResult<FailureOutcome> {
        let run_id = self.state.run_id();
        let class = failure.class();
        self.state.apply(Transition::TaskFailed {
            task: task.id.clone(),
            failure: failure.clone(),
        })?;
        tracing::warn!(
            run_id = %run_id,
            task = %task.id,
            attempt,
            class = %class,
            error = %failure.message,
            "Task failed"
        );

        if class == ErrorClass::ResourceOverflow {
            let remaining = (self.policy.max_retries + 1).saturating_sub(attempt);
            return Ok(FailureOutcome::Overflow(FailureDetail::for_task(
                &task.phase,
                &task.id,
                &failure,
                attempt,
                remaining,
            )));
        }

        if failure.recoverable && self.policy.allows_retry(attempt) {
            let delay = self.policy.delay_after(attempt);
            self.state.apply(Transition::TaskRetryScheduled {
                task: task.id.clone(),
                delay_ms: delay.as_millis() as u64,
            })?;
            tracing::info!(run_id = %run_id, task = %task.id, attempt, delay_ms = delay.as_millis() as u64, "Retry scheduled");
            return Ok(FailureOutcome::Retry(delay));
        }

        self.state.apply(Transition::TaskFailedTerminal {
            task: task.id.clone(),
        })?;
        if task.skip_tolerant {
            tracing::warn!(run_id = %run_id, task = %task.id, "Skip-tolerant task failed; phase continues");
        }
        Ok(FailureOutcome::Terminal)
    }
}

enum FailureOutcome {
    Retry(std::time::Duration),
    Overflow(FailureDetail),
    Terminal,
}

/// A worker result is accepted only if it declares the task's output schema
/// and carries a payload.
fn validate(task: &TaskSpec, output: WorkerOutput) -> Result<Value, TaskFailure> {
    if output.schema != task.output {
        return Err(TaskFailure::contract_violation(format!(
            "{} returned schema {}, expected {}",
            task.id, output.schema, task.output
        )));
    }
    if output.payload.is_null() {
        return Err(TaskFailure::contract_violation(format!(
            "{} returned an empty payload",
            task.id
        )));
    }
    Ok(output.payload)
}

/// First required task of `phase` that is terminally lost.
fn lost_required(record: &RunRecord, phase: &PhaseSpec) -> Option<FailureDetail> {
    phase.tasks.iter().find_map(|spec| {
        let state = record.task(&spec.id)?;
        if spec.skip_tolerant || !state.status.is_lost() {
            return None;
        }
        let failure = state.last_error.clone().unwrap_or_else(|| {
            TaskFailure::permanent(
                conductor_common::FailureKind::Other,
                "skipped: a required input can no longer be produced",
            )
        });
        Some(FailureDetail::for_task(
            &phase.id,
            &spec.id,
            &failure,
            state.attempts,
            0,
        ))
    })
}
