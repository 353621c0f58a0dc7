//! End-to-end engine scenarios.
//!
//! Every test drives a real `RunController` over a temporary state directory
//! with an in-process stub worker standing in for every producer.

use async_trait::async_trait;
use conductor::checkpoint::QueueChannel;
use conductor::state::RunSnapshot;
use conductor::{EngineConfig, EngineError, RunController, WorkerRegistry};
use conductor_common::{
    Artifact, CheckpointKind, ClassifiedRequest, ComplexityTier, ErrorClass, ExecutionPattern,
    FailureKind, PauseReason, PhaseId, PhaseStatus, Resolution, RunId, RunStatus, TaskFailure,
    TaskSpec, TaskStatus, Worker, WorkerOutput,
};
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::{TempDir, tempdir};
use tokio::sync::Notify;

// =============================================================================
// Stub worker
// =============================================================================

/// One recorded invocation.
#[derive(Debug, Clone)]
struct Call {
    task: String,
    producer: String,
    /// (producer task, schema) of every input artifact
    inputs: Vec<(String, String)>,
}

/// Scripted worker: succeeds by default, with per-producer failures and
/// delays.
#[derive(Default)]
struct StubWorker {
    transient: HashMap<String, u32>,
    permanent: HashSet<String>,
    overflow_once: HashSet<String>,
    delays: HashMap<String, Duration>,
    started: Option<Arc<Notify>>,
    calls: Mutex<Vec<Call>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl StubWorker {
    fn new() -> Self {
        Self::default()
    }

    fn fail_transient(mut self, producer: &str, times: u32) -> Self {
        self.transient.insert(producer.to_string(), times);
        self
    }

    fn fail_permanent(mut self, producer: &str) -> Self {
        self.permanent.insert(producer.to_string());
        self
    }

    fn overflow_once(mut self, producer: &str) -> Self {
        self.overflow_once.insert(producer.to_string());
        self
    }

    fn delay(mut self, producer: &str, millis: u64) -> Self {
        self.delays
            .insert(producer.to_string(), Duration::from_millis(millis));
        self
    }

    fn notify_on_start(mut self, notify: Arc<Notify>) -> Self {
        self.started = Some(notify);
        self
    }

    fn calls(&self, producer: &str) -> Vec<Call> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.producer == producer)
            .cloned()
            .collect()
    }

    fn call_count(&self, producer: &str) -> usize {
        self.calls(producer).len()
    }

    fn total_calls(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait]
impl Worker for StubWorker {
    async fn invoke(&self, task: &TaskSpec, inputs: &[Artifact]) -> Result<WorkerOutput, TaskFailure> {
        let n = {
            let mut calls = self.calls.lock().unwrap();
            calls.push(Call {
                task: task.id.to_string(),
                producer: task.producer.clone(),
                inputs: inputs
                    .iter()
                    .map(|a| (a.producer.to_string(), a.schema.to_string()))
                    .collect(),
            });
            calls.iter().filter(|c| c.producer == task.producer).count() as u32
        };
        if let Some(started) = &self.started {
            started.notify_one();
        }

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        if let Some(delay) = self.delays.get(&task.producer) {
            tokio::time::sleep(*delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if self.permanent.contains(&task.producer) {
            return Err(TaskFailure::permanent(FailureKind::Other, "worker refused"));
        }
        if n <= self.transient.get(&task.producer).copied().unwrap_or(0) {
            return Err(TaskFailure::transient(FailureKind::Unavailable, "upstream busy"));
        }
        if n == 1 && self.overflow_once.contains(&task.producer) {
            return Err(TaskFailure::capacity_exceeded("context window exceeded"));
        }
        Ok(WorkerOutput::new(
            task.output.clone(),
            json!({ "task": task.id, "inputs": inputs.len() }),
        ))
    }
}

// =============================================================================
// Helpers
// =============================================================================

fn engine_config(dir: &Path) -> EngineConfig {
    let mut config = EngineConfig::new(dir.join(".conductor"));
    config.base_delay = Duration::from_millis(1);
    config.max_delay = Duration::from_millis(5);
    config.task_timeout = Duration::from_secs(5);
    config
}

fn controller(config: EngineConfig, worker: &Arc<StubWorker>) -> RunController {
    RunController::new(config, WorkerRegistry::new().with_fallback(worker.clone()))
}

fn setup(worker: StubWorker) -> (TempDir, Arc<StubWorker>, RunController) {
    let dir = tempdir().unwrap();
    let worker = Arc::new(worker);
    let controller = controller(engine_config(dir.path()), &worker);
    (dir, worker, controller)
}

fn simple_backend() -> ClassifiedRequest {
    ClassifiedRequest::new("add a health endpoint", ComplexityTier::Simple, &["backend"])
}

fn medium_backend() -> ClassifiedRequest {
    ClassifiedRequest::new("add rate limiting", ComplexityTier::Medium, &["backend"])
}

fn task_status(snapshot: &RunSnapshot, id: &str) -> TaskStatus {
    snapshot
        .task(id)
        .unwrap_or_else(|| panic!("task {} not in plan", id))
        .status
}

async fn paused_at_review(controller: &RunController) -> RunId {
    let run_id = controller.start(medium_backend()).await.unwrap();
    let snapshot = controller.status(run_id).unwrap();
    assert_eq!(
        snapshot.status,
        RunStatus::Paused(PauseReason::AwaitingCheckpoint)
    );
    run_id
}

// =============================================================================
// Scenarios
// =============================================================================

mod scenarios {
    use super::*;

    #[tokio::test]
    async fn test_simple_backend_request_completes_all_phases() {
        let (_dir, worker, controller) = setup(StubWorker::new());

        let run_id = controller.start(simple_backend()).await.unwrap();
        let snapshot = controller.status(run_id).unwrap();

        assert_eq!(snapshot.status, RunStatus::Completed);
        assert_eq!(snapshot.pattern, Some(ExecutionPattern::Standard));
        let phases: Vec<&str> = snapshot.phases.iter().map(|p| p.id.as_str()).collect();
        assert_eq!(
            phases,
            vec!["requirements", "architecture", "generation", "verification"]
        );
        assert!(snapshot.phases.iter().all(|p| p.status == PhaseStatus::Completed));
        assert!(snapshot.task("generation.frontend-developer").is_none());
        assert!(snapshot.tasks().all(|t| t.status == TaskStatus::Succeeded));
        assert_eq!(worker.call_count("backend-developer"), 1);
        assert!(snapshot.failure.is_none());
    }

    #[tokio::test]
    async fn test_transient_failures_retry_without_pausing() {
        let (_dir, worker, controller) =
            setup(StubWorker::new().fail_transient("backend-developer", 2));

        let run_id = controller.start(simple_backend()).await.unwrap();
        let snapshot = controller.status(run_id).unwrap();

        assert_eq!(snapshot.status, RunStatus::Completed);
        assert_eq!(worker.call_count("backend-developer"), 3);
        let task = snapshot.task("generation.backend-developer").unwrap();
        assert_eq!(task.status, TaskStatus::Succeeded);
        assert_eq!(task.attempts, 3);
    }

    #[tokio::test]
    async fn test_review_rejection_pauses_for_clarification() {
        let dir = tempdir().unwrap();
        let worker = Arc::new(StubWorker::new());
        let (channel, mut notices) = QueueChannel::new();
        let controller =
            controller(engine_config(dir.path()), &worker).with_channel(Arc::new(channel));

        let run_id = paused_at_review(&controller).await;
        let notice = notices.try_recv().unwrap();
        assert_eq!(notice.run_id, run_id);
        assert_eq!(notice.checkpoint.kind, CheckpointKind::Review);
        assert_eq!(notice.checkpoint.phase, PhaseId::new("architecture"));
        assert!(notice.checkpoint.summary.is_some());

        let snapshot = controller
            .resume(
                run_id,
                Some(Resolution::Reject {
                    reason: "the design couples storage and transport".into(),
                }),
            )
            .await
            .unwrap();

        assert_eq!(
            snapshot.status,
            RunStatus::Paused(PauseReason::AwaitingClarification)
        );
        assert!(snapshot.failure.is_none());
        assert_eq!(worker.call_count("backend-developer"), 0);
    }

    #[tokio::test]
    async fn test_parallel_research_outputs_reach_architecture() {
        let (_dir, worker, controller) = setup(
            StubWorker::new()
                .delay("domain-researcher", 150)
                .delay("technology-researcher", 20),
        );

        paused_at_review(&controller).await;

        assert!(worker.max_in_flight.load(Ordering::SeqCst) >= 2);
        let architect = worker.calls("architect");
        assert_eq!(architect.len(), 1);
        let producers: Vec<&str> = architect[0].inputs.iter().map(|(p, _)| p.as_str()).collect();
        assert!(producers.contains(&"research.domain-researcher"));
        assert!(producers.contains(&"research.technology-researcher"));
        assert!(producers.contains(&"requirements.requirements-analyst"));
    }
}

// =============================================================================
// Durability
// =============================================================================

mod durability {
    use super::*;

    #[tokio::test]
    async fn test_status_survives_restart_and_lost_snapshot() {
        let dir = tempdir().unwrap();
        let worker = Arc::new(StubWorker::new());

        let (run_id, before) = {
            let controller = controller(engine_config(dir.path()), &worker);
            let run_id = paused_at_review(&controller).await;
            (run_id, controller.status(run_id).unwrap())
        };

        let restarted = controller(engine_config(dir.path()), &worker);
        assert_eq!(restarted.status(run_id).unwrap(), before);

        let run_dir = engine_config(dir.path()).runs_dir().join(run_id.to_string());
        std::fs::remove_file(run_dir.join("run.json")).unwrap();
        assert_eq!(restarted.status(run_id).unwrap(), before);

        // The rebuilt run keeps going from where it stopped
        let snapshot = restarted
            .resume(run_id, Some(Resolution::approve()))
            .await
            .unwrap();
        assert_eq!(
            snapshot.status,
            RunStatus::Paused(PauseReason::AwaitingCheckpoint)
        );
        assert_eq!(worker.call_count("requirements-analyst"), 1);
        assert_eq!(worker.call_count("backend-developer"), 1);
    }

    #[tokio::test]
    async fn test_resume_of_completed_run_is_noop() {
        let (_dir, worker, controller) = setup(StubWorker::new());
        let run_id = controller.start(simple_backend()).await.unwrap();
        let before = controller.status(run_id).unwrap();
        let calls = worker.total_calls();

        let after = controller.resume(run_id, None).await.unwrap();

        assert_eq!(after, before);
        assert_eq!(worker.total_calls(), calls);
        assert_eq!(controller.events(run_id).unwrap().len() as u64, before.event_head);
    }

    #[tokio::test]
    async fn test_resolution_rejected_for_completed_run() {
        let (_dir, _worker, controller) = setup(StubWorker::new());
        let run_id = controller.start(simple_backend()).await.unwrap();

        let err = controller
            .resume(run_id, Some(Resolution::approve()))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidResolution { .. }));
    }

    #[tokio::test]
    async fn test_events_are_strictly_ordered() {
        let (_dir, _worker, controller) = setup(StubWorker::new());
        let run_id = controller.start(simple_backend()).await.unwrap();

        let events = controller.events(run_id).unwrap();
        assert_eq!(events[0].kind(), "run_created");
        for (i, event) in events.iter().enumerate() {
            assert_eq!(event.seq, i as u64 + 1);
        }
    }

    #[tokio::test]
    async fn test_unknown_run_is_not_found() {
        let (_dir, _worker, controller) = setup(StubWorker::new());
        let err = controller.status(RunId::new()).unwrap_err();
        assert!(matches!(err, EngineError::RunNotFound(_)));
    }
}

// =============================================================================
// Failures
// =============================================================================

mod failures {
    use super::*;

    #[tokio::test]
    async fn test_always_transient_task_exhausts_retries() {
        let (_dir, worker, controller) =
            setup(StubWorker::new().fail_transient("backend-developer", u32::MAX));

        let run_id = controller.start(simple_backend()).await.unwrap();
        let snapshot = controller.status(run_id).unwrap();

        // max_retries defaults to 3
        assert_eq!(worker.call_count("backend-developer"), 4);
        let task = snapshot.task("generation.backend-developer").unwrap();
        assert_eq!(task.status, TaskStatus::FailedTerminal);
        assert_eq!(task.remaining_retries, 0);
        assert_eq!(snapshot.status, RunStatus::Failed);
        assert_eq!(worker.call_count("test-engineer"), 0);
    }

    #[tokio::test]
    async fn test_permanent_failure_names_the_task() {
        let (_dir, worker, controller) =
            setup(StubWorker::new().fail_permanent("backend-developer"));

        let run_id = controller.start(simple_backend()).await.unwrap();
        let snapshot = controller.status(run_id).unwrap();

        assert_eq!(snapshot.status, RunStatus::Failed);
        assert_eq!(worker.call_count("backend-developer"), 1);
        let failure = snapshot.failure.unwrap();
        assert_eq!(failure.class, ErrorClass::PermanentTaskFailure);
        assert_eq!(
            failure.task.as_ref().map(|t| t.as_str()),
            Some("generation.backend-developer")
        );
        assert_eq!(failure.phase, Some(PhaseId::new("generation")));
    }

    #[tokio::test]
    async fn test_skip_tolerant_failure_does_not_fail_phase() {
        let (_dir, _worker, controller) =
            setup(StubWorker::new().fail_permanent("security-reviewer"));
        let request = ClassifiedRequest::new(
            "harden the login flow",
            ComplexityTier::Simple,
            &["backend", "security"],
        );

        let run_id = controller.start(request).await.unwrap();
        let snapshot = controller.status(run_id).unwrap();

        assert_eq!(snapshot.status, RunStatus::Completed);
        assert_eq!(
            task_status(&snapshot, "verification.security-reviewer"),
            TaskStatus::FailedTerminal
        );
        assert_eq!(
            task_status(&snapshot, "verification.test-engineer"),
            TaskStatus::Succeeded
        );
    }

    #[tokio::test]
    async fn test_unsupported_domain_fails_at_planning() {
        let (_dir, worker, controller) = setup(StubWorker::new());
        let request = ClassifiedRequest::new("port to watchOS", ComplexityTier::Simple, &["wearables"]);

        let run_id = controller.start(request).await.unwrap();
        let snapshot = controller.status(run_id).unwrap();

        assert_eq!(snapshot.status, RunStatus::Failed);
        assert_eq!(snapshot.failure.unwrap().class, ErrorClass::PlanningFailure);
        assert!(snapshot.phases.is_empty());
        assert_eq!(worker.total_calls(), 0);
    }

    #[tokio::test]
    async fn test_input_over_limit_pauses_for_rescope() {
        let dir = tempdir().unwrap();
        let worker = Arc::new(StubWorker::new());
        let mut config = engine_config(dir.path());
        config.max_input_bytes = 8;
        let controller = controller(config, &worker);

        let run_id = controller.start(simple_backend()).await.unwrap();
        let snapshot = controller.status(run_id).unwrap();

        assert_eq!(snapshot.status, RunStatus::Paused(PauseReason::NeedsRescope));
        let failure = snapshot.failure.unwrap();
        assert_eq!(failure.class, ErrorClass::ResourceOverflow);
        assert_eq!(failure.phase, Some(PhaseId::new("architecture")));
        // Rejected before the worker was called
        assert_eq!(worker.call_count("architect"), 0);
    }

    #[tokio::test]
    async fn test_reclassify_resumes_rescoped_run() {
        let (_dir, worker, controller) = setup(StubWorker::new().overflow_once("architect"));

        let run_id = controller.start(simple_backend()).await.unwrap();
        assert_eq!(
            controller.status(run_id).unwrap().status,
            RunStatus::Paused(PauseReason::NeedsRescope)
        );

        let snapshot = controller
            .resume(
                run_id,
                Some(Resolution::Reclassify {
                    request: medium_backend(),
                }),
            )
            .await
            .unwrap();

        assert_eq!(snapshot.plan_version, Some(2));
        assert_eq!(snapshot.pattern, Some(ExecutionPattern::Extended));
        assert_eq!(
            snapshot.status,
            RunStatus::Paused(PauseReason::AwaitingCheckpoint)
        );
        assert!(snapshot.failure.is_none());
        // Kept phases are not re-run
        assert_eq!(worker.call_count("requirements-analyst"), 1);
        assert_eq!(worker.call_count("architect"), 2);
        assert_eq!(worker.call_count("domain-researcher"), 1);
    }

    #[tokio::test]
    async fn test_rescope_pause_rejects_approve() {
        let (_dir, _worker, controller) = setup(StubWorker::new().overflow_once("architect"));
        let run_id = controller.start(simple_backend()).await.unwrap();

        let err = controller
            .resume(run_id, Some(Resolution::approve()))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidResolution { .. }));
    }
}

// =============================================================================
// Checkpoints and human resolutions
// =============================================================================

mod checkpoints {
    use super::*;

    #[tokio::test]
    async fn test_pending_checkpoint_blocks_next_phase() {
        let (_dir, worker, controller) = setup(StubWorker::new());
        let run_id = paused_at_review(&controller).await;

        // Resuming without a decision leaves it paused
        let snapshot = controller.resume(run_id, None).await.unwrap();
        assert_eq!(
            snapshot.status,
            RunStatus::Paused(PauseReason::AwaitingCheckpoint)
        );
        assert_eq!(snapshot.phase("architecture").unwrap().status, PhaseStatus::Blocked);
        assert_eq!(snapshot.phase("generation").unwrap().status, PhaseStatus::Pending);
        assert_eq!(worker.call_count("backend-developer"), 0);

        let checkpoint = snapshot.pending_checkpoint.unwrap();
        assert_eq!(checkpoint.kind, CheckpointKind::Review);
        assert_eq!(checkpoint.id.as_str(), "cp-architecture-1");
    }

    #[tokio::test]
    async fn test_approval_continues_to_terminal_summary() {
        let (_dir, worker, controller) = setup(StubWorker::new());
        let run_id = paused_at_review(&controller).await;

        let snapshot = controller
            .resume(run_id, Some(Resolution::approve()))
            .await
            .unwrap();
        assert_eq!(
            snapshot.status,
            RunStatus::Paused(PauseReason::AwaitingCheckpoint)
        );
        let checkpoint = snapshot.pending_checkpoint.unwrap();
        assert_eq!(checkpoint.kind, CheckpointKind::TerminalSummary);
        assert_eq!(worker.call_count("doc-writer"), 1);

        let snapshot = controller
            .resume(run_id, Some(Resolution::approve()))
            .await
            .unwrap();
        assert_eq!(snapshot.status, RunStatus::Completed);
    }

    #[tokio::test]
    async fn test_modify_adds_revision_consumed_downstream() {
        let (_dir, worker, controller) = setup(StubWorker::new());
        let run_id = paused_at_review(&controller).await;

        let snapshot = controller
            .resume(
                run_id,
                Some(Resolution::Modify {
                    task: None,
                    instructions: "split the limiter into its own service".into(),
                }),
            )
            .await
            .unwrap();

        // The revision ran and a fresh review was raised
        assert_eq!(
            snapshot.status,
            RunStatus::Paused(PauseReason::AwaitingCheckpoint)
        );
        assert_eq!(snapshot.plan_version, Some(2));
        assert_eq!(
            task_status(&snapshot, "architecture.architect~r1"),
            TaskStatus::Succeeded
        );
        assert_eq!(
            snapshot.pending_checkpoint.unwrap().id.as_str(),
            "cp-architecture-2"
        );

        let revision = worker.calls("architect").pop().unwrap();
        assert_eq!(revision.task, "architecture.architect~r1");
        assert!(revision
            .inputs
            .iter()
            .any(|(_, schema)| schema == "checkpoint.modification"));
        assert!(revision
            .inputs
            .iter()
            .any(|(producer, _)| producer == "architecture.architect"));

        controller
            .resume(run_id, Some(Resolution::approve()))
            .await
            .unwrap();
        let developer = worker.calls("backend-developer");
        assert_eq!(developer.len(), 1);
        assert!(developer[0]
            .inputs
            .iter()
            .any(|(producer, _)| producer == "architecture.architect~r1"));
    }

    #[tokio::test]
    async fn test_modify_of_task_outside_phase_is_rejected() {
        let (_dir, _worker, controller) = setup(StubWorker::new());
        let run_id = paused_at_review(&controller).await;

        let err = controller
            .resume(
                run_id,
                Some(Resolution::Modify {
                    task: Some(conductor_common::TaskId::new("requirements.requirements-analyst")),
                    instructions: "more detail".into(),
                }),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidResolution { .. }));
        assert_eq!(
            controller.status(run_id).unwrap().status,
            RunStatus::Paused(PauseReason::AwaitingCheckpoint)
        );
    }

    #[tokio::test]
    async fn test_clarify_after_rejection_revises_phase() {
        let (_dir, worker, controller) = setup(StubWorker::new());
        let run_id = paused_at_review(&controller).await;

        controller
            .resume(
                run_id,
                Some(Resolution::Reject {
                    reason: "unclear ownership".into(),
                }),
            )
            .await
            .unwrap();
        let snapshot = controller
            .resume(
                run_id,
                Some(Resolution::Clarify {
                    text: "the gateway team owns the limiter".into(),
                }),
            )
            .await
            .unwrap();

        assert_eq!(
            snapshot.status,
            RunStatus::Paused(PauseReason::AwaitingCheckpoint)
        );
        let calls = worker.calls("architect");
        assert_eq!(calls.len(), 2);
        assert!(calls[1]
            .inputs
            .iter()
            .any(|(_, schema)| schema == "checkpoint.clarification"));
    }

    #[tokio::test]
    async fn test_ambiguous_request_waits_before_any_task() {
        let (_dir, worker, controller) = setup(StubWorker::new());
        let request = simple_backend().with_confidence(0.4);

        let run_id = controller.start(request).await.unwrap();
        let snapshot = controller.status(run_id).unwrap();

        assert_eq!(
            snapshot.status,
            RunStatus::Paused(PauseReason::AwaitingClarification)
        );
        assert_eq!(snapshot.phases[0].id.as_str(), "clarification");
        assert_eq!(
            snapshot.pending_checkpoint.unwrap().kind,
            CheckpointKind::Clarification
        );
        assert_eq!(worker.total_calls(), 0);

        let snapshot = controller
            .resume(run_id, Some(Resolution::approve()))
            .await
            .unwrap();
        assert_eq!(snapshot.status, RunStatus::Completed);
    }

    #[tokio::test]
    async fn test_ambiguous_request_reclassified_gets_new_plan() {
        let (_dir, worker, controller) = setup(StubWorker::new());
        let run_id = controller
            .start(simple_backend().with_confidence(0.4))
            .await
            .unwrap();

        let snapshot = controller
            .resume(
                run_id,
                Some(Resolution::Reclassify {
                    request: medium_backend(),
                }),
            )
            .await
            .unwrap();

        assert_eq!(snapshot.plan_version, Some(2));
        assert_eq!(snapshot.pattern, Some(ExecutionPattern::Extended));
        assert!(snapshot.phase("clarification").is_none());
        assert_eq!(
            snapshot.status,
            RunStatus::Paused(PauseReason::AwaitingCheckpoint)
        );
        assert_eq!(worker.call_count("domain-researcher"), 1);
    }

    #[tokio::test]
    async fn test_cancel_at_checkpoint() {
        let (_dir, worker, controller) = setup(StubWorker::new());
        let run_id = paused_at_review(&controller).await;

        let snapshot = controller
            .resume(run_id, Some(Resolution::Cancel))
            .await
            .unwrap();
        assert_eq!(snapshot.status, RunStatus::Cancelled);
        assert_eq!(worker.call_count("backend-developer"), 0);
    }
}

// =============================================================================
// Cancellation and partial reruns
// =============================================================================

mod control {
    use super::*;

    #[tokio::test]
    async fn test_cancel_idle_run() {
        let (_dir, worker, controller) = setup(StubWorker::new());
        let run_id = controller.submit(simple_backend()).unwrap();

        let snapshot = controller.cancel(run_id).await.unwrap();
        assert_eq!(snapshot.status, RunStatus::Cancelled);
        assert!(snapshot.cancel_requested);

        let snapshot = controller.resume(run_id, None).await.unwrap();
        assert_eq!(snapshot.status, RunStatus::Cancelled);
        assert_eq!(worker.total_calls(), 0);
    }

    #[tokio::test]
    async fn test_cancel_discards_in_flight_result() {
        let started = Arc::new(Notify::new());
        let (_dir, worker, controller) = setup(
            StubWorker::new()
                .delay("requirements-analyst", 200)
                .notify_on_start(started.clone()),
        );
        let run_id = controller.submit(simple_backend()).unwrap();

        let (driven, cancelled) = tokio::join!(controller.resume(run_id, None), async {
            started.notified().await;
            controller.cancel(run_id).await
        });
        driven.unwrap();
        assert!(cancelled.unwrap().cancel_requested);

        let snapshot = controller.status(run_id).unwrap();
        assert_eq!(snapshot.status, RunStatus::Cancelled);
        let task = snapshot.task("requirements.requirements-analyst").unwrap();
        assert_ne!(task.status, TaskStatus::Succeeded);
        assert!(task.artifact.is_none());
        assert_eq!(worker.call_count("architect"), 0);

        let kinds: Vec<&str> = controller
            .events(run_id)
            .unwrap()
            .iter()
            .map(|e| e.kind())
            .collect();
        assert!(kinds.contains(&"cancel_requested"));
        assert!(kinds.contains(&"task_requeued"));
    }

    #[tokio::test]
    async fn test_rerun_from_phase_reuses_earlier_artifacts() {
        let (_dir, worker, controller) = setup(StubWorker::new());
        let run_id = controller.start(simple_backend()).await.unwrap();
        let before = controller.status(run_id).unwrap();

        let after = controller
            .rerun_from(run_id, &PhaseId::new("generation"))
            .await
            .unwrap();

        assert_eq!(after.status, RunStatus::Completed);
        assert_eq!(worker.call_count("requirements-analyst"), 1);
        assert_eq!(worker.call_count("architect"), 1);
        assert_eq!(worker.call_count("backend-developer"), 2);
        assert_eq!(worker.call_count("test-engineer"), 2);

        let id = "generation.backend-developer";
        let old = before.task(id).unwrap().artifact.clone().unwrap();
        let new = after.task(id).unwrap().artifact.clone().unwrap();
        assert_ne!(old, new);
        assert_eq!(controller.artifact(run_id, &new).unwrap().version, 2);
        assert_eq!(
            after.task("requirements.requirements-analyst").unwrap().artifact,
            before.task("requirements.requirements-analyst").unwrap().artifact
        );
    }

    #[tokio::test]
    async fn test_rerun_of_unreached_phase_is_rejected() {
        let (_dir, _worker, controller) = setup(StubWorker::new());
        let run_id = paused_at_review(&controller).await;

        let err = controller
            .rerun_from(run_id, &PhaseId::new("documentation"))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidTransition(_)));
    }

    #[tokio::test]
    async fn test_list_runs_oldest_first() {
        let (_dir, _worker, controller) = setup(StubWorker::new());
        let first = controller.start(simple_backend()).await.unwrap();
        let second = controller.submit(simple_backend()).unwrap();

        let runs = controller.list_runs().unwrap();
        let ids: Vec<RunId> = runs.iter().map(|r| r.run_id).collect();
        assert_eq!(ids, vec![first, second]);
        assert_eq!(runs[1].status, RunStatus::Initialized);
    }
}
