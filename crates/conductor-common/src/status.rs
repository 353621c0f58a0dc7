//! Run, phase and task status machines.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Why a run is paused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PauseReason {
    /// A blocking review or summary checkpoint awaits a decision
    AwaitingCheckpoint,
    /// Ambiguous classification or a rejected checkpoint needs human input
    AwaitingClarification,
    /// A task's input exceeded its capacity limit
    NeedsRescope,
}

impl fmt::Display for PauseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PauseReason::AwaitingCheckpoint => write!(f, "awaiting_checkpoint"),
            PauseReason::AwaitingClarification => write!(f, "awaiting_clarification"),
            PauseReason::NeedsRescope => write!(f, "needs_rescope"),
        }
    }
}

/// Top-level run state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "state", content = "reason", rename_all = "snake_case")]
pub enum RunStatus {
    #[default]
    Initialized,
    Planning,
    Executing,
    Paused(PauseReason),
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub fn is_paused(&self) -> bool {
        matches!(self, Self::Paused(_))
    }

    /// Whether the controller may move a run from `self` to `next`.
    pub fn can_transition_to(&self, next: &RunStatus) -> bool {
        use RunStatus::*;
        match (self, next) {
            (Initialized, Planning) => true,
            (Planning, Executing) | (Planning, Paused(_)) => true,
            (Executing, Paused(_)) | (Executing, Completed) => true,
            (Paused(_), Executing) | (Paused(_), Paused(_)) => true,
            // Rerun of a finished plan
            (Completed, Executing) => true,
            (s, Failed) | (s, Cancelled) => !s.is_terminal(),
            _ => false,
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunStatus::Initialized => write!(f, "initialized"),
            RunStatus::Planning => write!(f, "planning"),
            RunStatus::Executing => write!(f, "executing"),
            RunStatus::Paused(reason) => write!(f, "paused({})", reason),
            RunStatus::Completed => write!(f, "completed"),
            RunStatus::Failed => write!(f, "failed"),
            RunStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Derived phase state. Never stored, always computed from task states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    Pending,
    Active,
    Completed,
    Blocked,
    Failed,
}

impl fmt::Display for PhaseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PhaseStatus::Pending => write!(f, "pending"),
            PhaseStatus::Active => write!(f, "active"),
            PhaseStatus::Completed => write!(f, "completed"),
            PhaseStatus::Blocked => write!(f, "blocked"),
            PhaseStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Per-task state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Pending,
    Ready,
    Running,
    Succeeded,
    /// Failed, may still be retried
    Failed,
    FailedTerminal,
    /// Never ran because a required input can no longer be produced
    Skipped,
}

impl TaskStatus {
    /// No further attempts will be made.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::FailedTerminal | Self::Skipped)
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded)
    }

    /// Terminal without an artifact.
    pub fn is_lost(&self) -> bool {
        matches!(self, Self::FailedTerminal | Self::Skipped)
    }

    pub fn can_transition_to(&self, next: &TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, next),
            (Pending, Ready)
                | (Pending, Skipped)
                | (Ready, Running)
                | (Running, Succeeded)
                | (Running, Failed)
                | (Failed, Ready)
                | (Failed, FailedTerminal)
                // requeue: interrupted, discarded or lost artifact
                | (Running, Ready)
                | (Succeeded, Ready)
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Ready => "ready",
            TaskStatus::Running => "running",
            TaskStatus::Succeeded => "succeeded",
            TaskStatus::Failed => "failed",
            TaskStatus::FailedTerminal => "failed-terminal",
            TaskStatus::Skipped => "skipped",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_lifecycle_transitions() {
        assert!(TaskStatus::Pending.can_transition_to(&TaskStatus::Ready));
        assert!(TaskStatus::Ready.can_transition_to(&TaskStatus::Running));
        assert!(TaskStatus::Failed.can_transition_to(&TaskStatus::Ready));
        assert!(TaskStatus::Failed.can_transition_to(&TaskStatus::FailedTerminal));
        assert!(!TaskStatus::Pending.can_transition_to(&TaskStatus::Running));
        assert!(!TaskStatus::FailedTerminal.can_transition_to(&TaskStatus::Ready));
        assert!(!TaskStatus::Skipped.can_transition_to(&TaskStatus::Running));
    }

    #[test]
    fn test_run_status_terminal_states_are_final() {
        assert!(!RunStatus::Completed.can_transition_to(&RunStatus::Failed));
        assert!(!RunStatus::Failed.can_transition_to(&RunStatus::Executing));
        assert!(!RunStatus::Cancelled.can_transition_to(&RunStatus::Executing));
        assert!(RunStatus::Executing.can_transition_to(&RunStatus::Failed));
        assert!(
            RunStatus::Paused(PauseReason::AwaitingCheckpoint).can_transition_to(&RunStatus::Cancelled)
        );
    }

    #[test]
    fn test_run_status_serialization() {
        let status = RunStatus::Paused(PauseReason::NeedsRescope);
        let json = serde_json::to_string(&status).unwrap();
        assert_eq!(json, r#"{"state":"paused","reason":"needs_rescope"}"#);
        assert_eq!(status.to_string(), "paused(needs_rescope)");
    }
}
