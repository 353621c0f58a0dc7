//! The worker capability seam.

use crate::artifact::{Artifact, WorkerOutput};
use crate::failure::TaskFailure;
use crate::plan::TaskSpec;
use async_trait::async_trait;
use std::time::Duration;

/// A narrow specialist that turns input artifacts into one output.
///
/// Implementations must not touch run state; the engine records everything
/// about an invocation itself.
#[async_trait]
pub trait Worker: Send + Sync {
    async fn invoke(&self, task: &TaskSpec, inputs: &[Artifact])
    -> Result<WorkerOutput, TaskFailure>;

    /// Invocation time limit for this worker. `None` uses the engine-wide
    /// task timeout.
    fn timeout(&self) -> Option<Duration> {
        None
    }
}
