//! Worker Invoker: routes a task to the worker for its producer and turns
//! every way an invocation can go wrong into a `TaskFailure`.

pub mod command;

pub use command::CommandWorker;

use crate::config::{ConductorToml, DEFAULT_WORKER, EngineConfig};
use conductor_common::{Artifact, FailureKind, TaskFailure, TaskSpec, Worker, WorkerOutput};
use futures::FutureExt;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Workers keyed by producer identity.
#[derive(Default, Clone)]
pub struct WorkerRegistry {
    workers: HashMap<String, Arc<dyn Worker>>,
    fallback: Option<Arc<dyn Worker>>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the worker for one producer, replacing any earlier one.
    pub fn register(&mut self, producer: impl Into<String>, worker: Arc<dyn Worker>) -> &mut Self {
        self.workers.insert(producer.into(), worker);
        self
    }

    pub fn with_worker(mut self, producer: impl Into<String>, worker: Arc<dyn Worker>) -> Self {
        self.register(producer, worker);
        self
    }

    /// Worker used for producers with no registration of their own.
    pub fn with_fallback(mut self, worker: Arc<dyn Worker>) -> Self {
        self.fallback = Some(worker);
        self
    }

    pub fn get(&self, producer: &str) -> Option<Arc<dyn Worker>> {
        self.workers
            .get(producer)
            .or(self.fallback.as_ref())
            .cloned()
    }

    pub fn producers(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.workers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn has_fallback(&self) -> bool {
        self.fallback.is_some()
    }

    /// Command workers for every `[workers.<producer>]` entry. The
    /// `default` entry becomes the fallback.
    pub fn from_config(toml: &ConductorToml, working_dir: &Path) -> Self {
        let mut registry = Self::new();
        for (producer, entry) in &toml.workers {
            let Some(worker) = CommandWorker::from_entry(entry, working_dir) else {
                tracing::warn!(producer = %producer, "Worker entry has an empty command; ignoring");
                continue;
            };
            let worker: Arc<dyn Worker> = Arc::new(worker);
            if producer == DEFAULT_WORKER {
                registry.fallback = Some(worker);
            } else {
                registry.register(producer.clone(), worker);
            }
        }
        registry
    }
}

/// Wraps a registry with the engine-wide limits every invocation obeys.
#[derive(Clone)]
pub struct Invoker {
    registry: Arc<WorkerRegistry>,
    timeout: Duration,
}

impl Invoker {
    pub fn new(registry: Arc<WorkerRegistry>, timeout: Duration) -> Self {
        Self { registry, timeout }
    }

    pub fn from_config(registry: Arc<WorkerRegistry>, config: &EngineConfig) -> Self {
        Self::new(registry, config.task_timeout)
    }

    pub fn registry(&self) -> &WorkerRegistry {
        &self.registry
    }

    /// Invoke the worker for `task`.
    ///
    /// Inputs over the task's byte limit fail with `capacity_exceeded`
    /// before the worker is called. The worker's own timeout, if it has
    /// one, replaces the engine-wide one. A worker that runs past it
    /// fails with a recoverable `timeout`; one that panics fails with a
    /// permanent `crashed`.
    pub async fn invoke(&self, task: &TaskSpec, inputs: &[Artifact]) -> Result<WorkerOutput, TaskFailure> {
        if let Some(limit) = task.max_input_bytes {
            let total: usize = inputs.iter().map(Artifact::payload_bytes).sum();
            if total > limit {
                return Err(TaskFailure::capacity_exceeded(format!(
                    "inputs to {} total {} bytes, limit is {}",
                    task.id, total, limit
                )));
            }
        }

        let worker = self.registry.get(&task.producer).ok_or_else(|| {
            TaskFailure::permanent(
                FailureKind::WorkerMissing,
                format!("no worker registered for producer '{}'", task.producer),
            )
        })?;

        let limit = worker.timeout().unwrap_or(self.timeout);
        let call = AssertUnwindSafe(worker.invoke(task, inputs)).catch_unwind();
        match tokio::time::timeout(limit, call).await {
            Ok(Ok(result)) => result,
            Ok(Err(panic)) => Err(TaskFailure::permanent(
                FailureKind::Crashed,
                format!("worker for {} panicked: {}", task.producer, panic_message(panic.as_ref())),
            )),
            Err(_) => Err(TaskFailure::timeout(format!(
                "{} did not finish within {}s",
                task.id,
                limit.as_secs_f64()
            ))),
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
