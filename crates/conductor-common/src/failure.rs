//! Task failures and the error classes exposed by `status()`.

use crate::ids::{PhaseId, TaskId};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Error classes of the engine's failure taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Recoverable; retried with backoff up to the limit
    TransientTaskFailure,
    /// Not retried; fails the phase unless the task is skip-tolerant
    PermanentTaskFailure,
    /// No applicable execution pattern; fails the run
    PlanningFailure,
    /// Output did not match the declared schema; handled as permanent
    ContractViolation,
    /// Input exceeded a declared capacity; pauses the run for rescoping
    ResourceOverflow,
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorClass::TransientTaskFailure => "TransientTaskFailure",
            ErrorClass::PermanentTaskFailure => "PermanentTaskFailure",
            ErrorClass::PlanningFailure => "PlanningFailure",
            ErrorClass::ContractViolation => "ContractViolation",
            ErrorClass::ResourceOverflow => "ResourceOverflow",
        };
        f.write_str(s)
    }
}

/// What went wrong inside a worker invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Timeout,
    Unavailable,
    MalformedInput,
    ContractViolation,
    CapacityExceeded,
    WorkerMissing,
    Crashed,
    Other,
}

/// Failure returned by a worker invocation.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{kind:?}: {message}")]
pub struct TaskFailure {
    pub kind: FailureKind,
    pub recoverable: bool,
    pub message: String,
}

impl TaskFailure {
    /// A failure worth retrying (timeouts, temporarily unavailable resources).
    pub fn transient(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            recoverable: true,
            message: message.into(),
        }
    }

    pub fn permanent(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            recoverable: false,
            message: message.into(),
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::transient(FailureKind::Timeout, message)
    }

    pub fn contract_violation(message: impl Into<String>) -> Self {
        Self::permanent(FailureKind::ContractViolation, message)
    }

    pub fn capacity_exceeded(message: impl Into<String>) -> Self {
        Self::permanent(FailureKind::CapacityExceeded, message)
    }

    pub fn class(&self) -> ErrorClass {
        match self.kind {
            FailureKind::CapacityExceeded => ErrorClass::ResourceOverflow,
            FailureKind::ContractViolation => ErrorClass::ContractViolation,
            _ if self.recoverable => ErrorClass::TransientTaskFailure,
            _ => ErrorClass::PermanentTaskFailure,
        }
    }
}

/// The precise failure a run stopped on, as shown by `status()`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureDetail {
    pub class: ErrorClass,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<PhaseId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task: Option<TaskId>,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default)]
    pub remaining_retries: u32,
}

impl FailureDetail {
    pub fn planning(message: impl Into<String>) -> Self {
        Self {
            class: ErrorClass::PlanningFailure,
            message: message.into(),
            phase: None,
            task: None,
            attempts: 0,
            remaining_retries: 0,
        }
    }

    pub fn for_task(
        phase: &PhaseId,
        task: &TaskId,
        failure: &TaskFailure,
        attempts: u32,
        remaining_retries: u32,
    ) -> Self {
        Self {
            class: failure.class(),
            message: failure.message.clone(),
            phase: Some(phase.clone()),
            task: Some(task.clone()),
            attempts,
            remaining_retries,
        }
    }
}

impl fmt::Display for FailureDetail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.class)?;
        if let Some(task) = &self.task {
            write!(f, " in task {}", task)?;
        }
        write!(f, ": {}", self.message)
    }
}
