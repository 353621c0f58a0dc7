//! Typed error hierarchy for the Conductor engine.
//!
//! `EngineError` is returned by every library operation. Task-level failures
//! are data (`conductor_common::TaskFailure`), recorded as events, and only
//! surface here when they stop a whole operation.

use conductor_common::{ArtifactId, CheckpointId, PhaseId, RunId, SchemaId, TaskId};
use std::path::PathBuf;
use thiserror::Error;

pub type EngineResult<T> = std::result::Result<T, EngineError>;

/// Errors from engine operations.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("No applicable execution pattern: {reason}")]
    NoApplicablePattern { reason: String },

    #[error("Run {0} not found")]
    RunNotFound(RunId),

    #[error("Artifact {0} not found")]
    ArtifactNotFound(ArtifactId),

    #[error("Artifact for {producer} ({schema}) version {version} already exists")]
    ArtifactExists {
        producer: TaskId,
        schema: SchemaId,
        version: u32,
    },

    #[error("Checkpoint {0} not found")]
    CheckpointNotFound(CheckpointId),

    #[error("Review checkpoint for phase {0} requires a summary")]
    MissingReviewSummary(PhaseId),

    #[error("Invalid transition: {0}")]
    InvalidTransition(String),

    #[error("Resolution '{resolution}' is not accepted while run is {status}")]
    InvalidResolution { resolution: String, status: String },

    #[error("Invalid plan: {0}")]
    InvalidPlan(String),

    #[error("Run {0} is locked by another process")]
    RunLocked(RunId),

    #[error("Run state lock poisoned")]
    LockPoisoned,

    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl EngineError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}
