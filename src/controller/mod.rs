//! Run Controller: the engine's public face.
//!
//! Owns the lifecycle of runs: creates them, plans them, walks them phase
//! by phase through the scheduler and checkpoint gate, and takes them back
//! up after a pause or a crash. All run state goes through each run's
//! `StateManager`; the controller itself only caches open handles.

mod resume;

use crate::artifact::{self, ArtifactStore};
use crate::checkpoint::{ApprovalChannel, CheckpointGate, GateDecision, LogChannel};
use crate::config::EngineConfig;
use crate::errors::{EngineError, EngineResult};
use crate::events::EventLog;
use crate::invoker::{Invoker, WorkerRegistry};
use crate::planner::Planner;
use crate::scheduler::{PhaseRun, PhaseScheduler};
use crate::state::{self, RunSnapshot, StateManager};
use conductor_common::{
    Artifact, ArtifactId, ArtifactSummary, ClassifiedRequest, Event, FailureDetail, PauseReason,
    PhaseId, RunId, RunStatus, TaskId, TaskStatus, Transition,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

/// Everything needed to drive one open run.
struct RunHandle {
    state: StateManager,
    artifacts: ArtifactStore,
    cancel: CancellationToken,
    /// Held while the run is being driven; one driver per run
    drive: tokio::sync::Mutex<()>,
}

pub struct RunController {
    config: EngineConfig,
    planner: Planner,
    invoker: Invoker,
    channel: Arc<dyn ApprovalChannel>,
    runs: Mutex<HashMap<RunId, Arc<RunHandle>>>,
}

impl RunController {
    pub fn new(config: EngineConfig, registry: WorkerRegistry) -> Self {
        let invoker = Invoker::from_config(Arc::new(registry), &config);
        Self {
            planner: Planner::from_config(&config),
            invoker,
            config,
            channel: Arc::new(LogChannel),
            runs: Mutex::new(HashMap::new()),
        }
    }

    /// Announce checkpoints through `channel` instead of the log.
    pub fn with_channel(mut self, channel: Arc<dyn ApprovalChannel>) -> Self {
        self.channel = channel;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Create a run and drive it until it completes, fails or pauses.
    pub async fn start(&self, request: ClassifiedRequest) -> EngineResult<RunId> {
        let run_id = self.submit(request)?;
        let handle = self.handle(run_id)?;
        self.drive(&handle).await?;
        Ok(run_id)
    }

    /// Create a run without driving it. `resume` picks it up.
    pub fn submit(&self, request: ClassifiedRequest) -> EngineResult<RunId> {
        let run_id = RunId::new();
        let state = StateManager::create(&self.config.runs_dir(), run_id, request)?;
        let artifacts = ArtifactStore::open(state.run_dir())?;
        self.runs()?.insert(
            run_id,
            Arc::new(RunHandle {
                state,
                artifacts,
                cancel: CancellationToken::new(),
                drive: tokio::sync::Mutex::new(()),
            }),
        );
        Ok(run_id)
    }

    /// Current snapshot of a run. Does not take the run's lock, so it works
    /// while another process drives the run.
    pub fn status(&self, run_id: RunId) -> EngineResult<RunSnapshot> {
        if let Some(handle) = self.cached(run_id)? {
            return handle.state.snapshot(self.config.max_retries);
        }
        let record = state::peek_record(&self.config.runs_dir(), run_id)?;
        Ok(RunSnapshot::from_record(&record, self.config.max_retries))
    }

    /// Snapshots of every run, oldest first.
    pub fn list_runs(&self) -> EngineResult<Vec<RunSnapshot>> {
        let mut snapshots = Vec::new();
        for run_id in state::list_run_ids(&self.config.runs_dir())? {
            match self.status(run_id) {
                Ok(snapshot) => snapshots.push(snapshot),
                Err(e) => tracing::warn!(run_id = %run_id, error = %e, "Skipping unreadable run"),
            }
        }
        snapshots.sort_by_key(|s| s.created_at);
        Ok(snapshots)
    }

    /// The run's event log.
    pub fn events(&self, run_id: RunId) -> EngineResult<Vec<Event>> {
        let run_dir = self.run_dir(run_id)?;
        EventLog::read_all(&run_dir)
    }

    pub fn artifact(&self, run_id: RunId, id: &ArtifactId) -> EngineResult<Artifact> {
        if let Some(handle) = self.cached(run_id)? {
            return handle.artifacts.get(id);
        }
        artifact::load(&self.run_dir(run_id)?, id)
    }

    pub fn artifact_summary(&self, run_id: RunId, id: &ArtifactId) -> EngineResult<ArtifactSummary> {
        if let Some(handle) = self.cached(run_id)? {
            return handle.artifacts.get_summary(id);
        }
        Ok(self.artifact(run_id, id)?.summary())
    }

    /// Ask a run to stop. In-flight tasks finish but their results are
    /// discarded; the run becomes cancelled at the next phase boundary, or
    /// right away if nothing is driving it.
    pub async fn cancel(&self, run_id: RunId) -> EngineResult<RunSnapshot> {
        let handle = self.handle(run_id)?;
        let record = handle.state.record()?;
        if record.status.is_terminal() {
            return handle.state.snapshot(self.config.max_retries);
        }
        if !record.cancel_requested {
            handle.state.apply(Transition::CancelRequested)?;
        }
        handle.cancel.cancel();
        tracing::info!(run_id = %run_id, "Cancellation requested");

        if let Ok(_guard) = handle.drive.try_lock() {
            self.finish_cancelled(&handle)?;
        }
        handle.state.snapshot(self.config.max_retries)
    }

    /// Re-execute the existing plan from `phase`. Artifacts of earlier
    /// phases are reused; tasks from `phase` on run again and store new
    /// artifact versions.
    pub async fn rerun_from(&self, run_id: RunId, phase: &PhaseId) -> EngineResult<RunSnapshot> {
        let handle = self.handle(run_id)?;
        {
            let _guard = handle.drive.lock().await;
            let record = handle.state.record()?;
            if !matches!(record.status, RunStatus::Completed | RunStatus::Paused(_)) {
                return Err(EngineError::InvalidTransition(format!(
                    "cannot rerun a run that is {}",
                    record.status
                )));
            }
            let plan = record
                .plan
                .as_ref()
                .ok_or_else(|| EngineError::InvalidTransition("run has no plan".into()))?;
            let index = plan
                .phase_index(phase)
                .ok_or_else(|| EngineError::InvalidTransition(format!("unknown phase {}", phase)))?;
            if record.cursor.is_none_or(|c| index > c) {
                return Err(EngineError::InvalidTransition(format!(
                    "phase {} has not been reached yet",
                    phase
                )));
            }

            handle.state.apply(Transition::Rewound {
                phase: phase.clone(),
                index,
            })?;
            set_status(&handle.state, RunStatus::Executing, None)?;
            tracing::info!(run_id = %run_id, phase = %phase, index, "Rerunning from phase");
        }
        self.drive(&handle).await?;
        handle.state.snapshot(self.config.max_retries)
    }

    /// Release a run's lock. The next operation on it reopens it.
    pub fn close(&self, run_id: RunId) -> EngineResult<()> {
        self.runs()?.remove(&run_id);
        Ok(())
    }

    /// Walk the run forward until it stops: paused, completed, failed or
    /// cancelled.
    async fn drive(&self, handle: &RunHandle) -> EngineResult<()> {
        let _guard = handle.drive.lock().await;
        let run_id = handle.state.run_id();
        let mut recovered = false;

        loop {
            let record = handle.state.record()?;
            if record.status.is_terminal() || record.status.is_paused() {
                tracing::info!(run_id = %run_id, status = %record.status, "Run stopped");
                return Ok(());
            }
            if record.cancel_requested || handle.cancel.is_cancelled() {
                return self.finish_cancelled(handle);
            }

            match record.status {
                RunStatus::Initialized => {
                    set_status(&handle.state, RunStatus::Planning, None)?;
                }
                RunStatus::Planning => self.plan_run(handle)?,
                RunStatus::Executing => {
                    if !recovered {
                        self.recover(handle)?;
                        recovered = true;
                    }
                    self.step(handle).await?;
                }
                _ => return Ok(()),
            }
        }
    }

    /// Adopt the first plan, or fail the run if no plan can be made.
    fn plan_run(&self, handle: &RunHandle) -> EngineResult<()> {
        let record = handle.state.record()?;
        if record.plan.is_some() {
            // Adopted before an interruption
            return set_status(&handle.state, RunStatus::Executing, None);
        }
        match self.planner.plan(&record.request) {
            Ok(plan) => {
                handle.state.apply(Transition::PlanAdopted {
                    plan,
                    carry_over: Vec::new(),
                    cursor: None,
                })?;
                set_status(&handle.state, RunStatus::Executing, None)
            }
            Err(e @ (EngineError::NoApplicablePattern { .. } | EngineError::InvalidPlan(_))) => {
                tracing::error!(run_id = %record.run_id, error = %e, "Planning failed");
                set_status(
                    &handle.state,
                    RunStatus::Failed,
                    Some(FailureDetail::planning(e.to_string())),
                )
            }
            Err(e) => Err(e),
        }
    }

    /// Make state left by an interrupted session consistent before
    /// scheduling: running tasks are requeued, and tasks whose artifact has
    /// gone missing run again.
    fn recover(&self, handle: &RunHandle) -> EngineResult<()> {
        let record = handle.state.record()?;
        let Some(plan) = &record.plan else {
            return Ok(());
        };

        let mut interrupted: Vec<TaskId> = Vec::new();
        let mut missing: Vec<(TaskId, usize)> = Vec::new();
        for (index, phase) in plan.phases.iter().enumerate() {
            for task in &phase.tasks {
                let Some(state) = record.task(&task.id) else {
                    continue;
                };
                match state.status {
                    TaskStatus::Running => interrupted.push(task.id.clone()),
                    TaskStatus::Succeeded => {
                        let present = match &state.artifact {
                            Some(id) => handle.artifacts.contains(id)?,
                            None => false,
                        };
                        if !present {
                            missing.push((task.id.clone(), index));
                        }
                    }
                    _ => {}
                }
            }
        }

        for task in interrupted {
            tracing::warn!(run_id = %record.run_id, task = %task, "Requeuing task interrupted mid-run");
            handle.state.apply(Transition::TaskRequeued {
                task,
                reason: "interrupted".to_string(),
            })?;
        }

        // A lost artifact from an earlier phase invalidates everything built on it
        let earliest = missing.iter().map(|(_, index)| *index).min();
        if let (Some(earliest), Some(cursor)) = (earliest, record.cursor)
            && earliest < cursor
        {
            let phase = plan.phases[earliest].id.clone();
            tracing::warn!(run_id = %record.run_id, phase = %phase, "Artifact missing from an earlier phase; rewinding");
            handle.state.apply(Transition::Rewound {
                phase,
                index: earliest,
            })?;
            return Ok(());
        }
        for (task, _) in missing {
            tracing::warn!(run_id = %record.run_id, task = %task, "Artifact missing; requeuing task");
            handle.state.apply(Transition::TaskRequeued {
                task,
                reason: "artifact missing".to_string(),
            })?;
        }
        Ok(())
    }

    /// Run the current phase (entering the first one if needed) and act on
    /// the outcome.
    async fn step(&self, handle: &RunHandle) -> EngineResult<()> {
        let record = handle.state.record()?;
        let plan = record
            .plan
            .as_ref()
            .ok_or_else(|| EngineError::InvalidTransition("executing without a plan".into()))?;
        let index = match record.cursor {
            Some(index) => index,
            None => {
                let first = plan
                    .phases
                    .first()
                    .ok_or_else(|| EngineError::InvalidPlan("plan has no phases".into()))?;
                handle.state.apply(Transition::PhaseEntered {
                    phase: first.id.clone(),
                    index: 0,
                })?;
                0
            }
        };
        let phase_count = plan.phases.len();

        let scheduler = PhaseScheduler::new(
            &handle.state,
            &handle.artifacts,
            &self.invoker,
            &handle.cancel,
            &self.config,
        );
        match scheduler.run(index).await? {
            PhaseRun::Settled => {}
            PhaseRun::Failed(detail) => {
                tracing::error!(run_id = %record.run_id, failure = %detail, "Run failed");
                return set_status(&handle.state, RunStatus::Failed, Some(detail));
            }
            PhaseRun::Overflow(detail) => {
                tracing::warn!(run_id = %record.run_id, failure = %detail, "Run needs rescoping");
                return set_status(
                    &handle.state,
                    RunStatus::Paused(PauseReason::NeedsRescope),
                    Some(detail),
                );
            }
            // The drive loop finishes the cancellation
            PhaseRun::Cancelled => return Ok(()),
        }

        let gate = CheckpointGate::new(&handle.state, &handle.artifacts, self.channel.as_ref());
        match gate.evaluate(index)? {
            GateDecision::Pause(reason) => {
                set_status(&handle.state, RunStatus::Paused(reason), None)
            }
            GateDecision::Pass if index + 1 < phase_count => {
                let next = handle
                    .state
                    .with_record(|r| r.plan.as_ref().map(|p| p.phases[index + 1].id.clone()))?
                    .ok_or_else(|| EngineError::InvalidTransition("plan vanished".into()))?;
                handle.state.apply(Transition::PhaseEntered {
                    phase: next.clone(),
                    index: index + 1,
                })?;
                tracing::info!(run_id = %record.run_id, phase = %next, index = index + 1, "Phase entered");
                Ok(())
            }
            GateDecision::Pass => {
                set_status(&handle.state, RunStatus::Completed, None)?;
                tracing::info!(run_id = %record.run_id, "Run completed");
                Ok(())
            }
        }
    }

    fn finish_cancelled(&self, handle: &RunHandle) -> EngineResult<()> {
        let status = handle.state.with_record(|r| r.status)?;
        if status.is_terminal() {
            return Ok(());
        }
        set_status(&handle.state, RunStatus::Cancelled, None)?;
        tracing::info!(run_id = %handle.state.run_id(), "Run cancelled");
        Ok(())
    }

    /// Open handle for a run, opening (and locking) it on first use.
    fn handle(&self, run_id: RunId) -> EngineResult<Arc<RunHandle>> {
        if let Some(handle) = self.cached(run_id)? {
            return Ok(handle);
        }
        let state = StateManager::open(&self.config.runs_dir(), run_id)?;
        let artifacts = ArtifactStore::open(state.run_dir())?;
        let handle = Arc::new(RunHandle {
            state,
            artifacts,
            cancel: CancellationToken::new(),
            drive: tokio::sync::Mutex::new(()),
        });
        self.runs()?.insert(run_id, handle.clone());
        Ok(handle)
    }

    fn cached(&self, run_id: RunId) -> EngineResult<Option<Arc<RunHandle>>> {
        Ok(self.runs()?.get(&run_id).cloned())
    }

    fn runs(&self) -> EngineResult<std::sync::MutexGuard<'_, HashMap<RunId, Arc<RunHandle>>>> {
        self.runs.lock().map_err(|_| EngineError::LockPoisoned)
    }

    fn run_dir(&self, run_id: RunId) -> EngineResult<std::path::PathBuf> {
        let run_dir = self.config.runs_dir().join(run_id.to_string());
        if !run_dir.join(crate::events::EVENTS_FILE).exists() {
            return Err(EngineError::RunNotFound(run_id));
        }
        Ok(run_dir)
    }
}

fn set_status(state: &StateManager, status: RunStatus, failure: Option<FailureDetail>) -> EngineResult<()> {
    state.apply(Transition::StatusChanged { status, failure })?;
    Ok(())
}
