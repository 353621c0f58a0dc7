//! Domain types shared by the conductor engine and its workers.

pub mod artifact;
pub mod checkpoint;
pub mod event;
pub mod failure;
pub mod ids;
pub mod plan;
pub mod request;
pub mod status;
pub mod worker;

pub use artifact::{Artifact, ArtifactSummary, ValidationStatus, WorkerOutput};
pub use checkpoint::{Checkpoint, CheckpointKind, Decision, Resolution};
pub use event::{Event, Subject, Transition};
pub use failure::{ErrorClass, FailureDetail, FailureKind, TaskFailure};
pub use ids::{ArtifactId, CheckpointId, PhaseId, RunId, SchemaId, TaskId};
pub use plan::{CheckpointRequirement, ExecutionPattern, InputRef, PhaseSpec, Plan, TaskSpec};
pub use request::{ClassifiedRequest, ComplexityTier, RequestType};
pub use status::{PauseReason, PhaseStatus, RunStatus, TaskStatus};
pub use worker::Worker;
