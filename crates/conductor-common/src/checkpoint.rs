//! Checkpoint records and the resolutions a human can give.

use crate::ids::{CheckpointId, PhaseId, TaskId};
use crate::plan::CheckpointRequirement;
use crate::request::ClassifiedRequest;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointKind {
    Informational,
    Review,
    TerminalSummary,
    Clarification,
}

impl CheckpointKind {
    pub fn from_requirement(req: CheckpointRequirement) -> Option<Self> {
        match req {
            CheckpointRequirement::None => None,
            CheckpointRequirement::Informational => Some(Self::Informational),
            CheckpointRequirement::Review => Some(Self::Review),
            CheckpointRequirement::TerminalSummary => Some(Self::TerminalSummary),
            CheckpointRequirement::Clarification => Some(Self::Clarification),
        }
    }

    pub fn is_blocking(&self) -> bool {
        !matches!(self, Self::Informational)
    }
}

impl fmt::Display for CheckpointKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CheckpointKind::Informational => write!(f, "informational"),
            CheckpointKind::Review => write!(f, "review"),
            CheckpointKind::TerminalSummary => write!(f, "terminal_summary"),
            CheckpointKind::Clarification => write!(f, "clarification"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    #[default]
    Pending,
    Approved,
    Rejected,
    ModifyRequested,
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Decision::Pending => write!(f, "pending"),
            Decision::Approved => write!(f, "approved"),
            Decision::Rejected => write!(f, "rejected"),
            Decision::ModifyRequested => write!(f, "modify_requested"),
        }
    }
}

/// A human-approval barrier raised after a phase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub id: CheckpointId,
    pub phase: PhaseId,
    pub kind: CheckpointKind,
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default)]
    pub decision: Decision,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    pub raised_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,
    /// Replaced by a newer checkpoint for the same phase (after a re-plan or
    /// rerun)
    #[serde(default)]
    pub superseded: bool,
}

impl Checkpoint {
    pub fn is_pending(&self) -> bool {
        self.decision == Decision::Pending
    }
}

/// Human answer to a paused run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Resolution {
    Approve {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        note: Option<String>,
    },
    Reject {
        reason: String,
    },
    /// Re-run one task of the checkpointed phase with instructions attached
    Modify {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        task: Option<TaskId>,
        instructions: String,
    },
    /// Answer to a rejection; becomes a revision of the rejected phase
    Clarify {
        text: String,
    },
    /// Adopt a new classification and re-plan the remaining phases
    Reclassify {
        request: ClassifiedRequest,
    },
    Cancel,
}

impl Resolution {
    pub fn approve() -> Self {
        Self::Approve { note: None }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Resolution::Approve { .. } => "approve",
            Resolution::Reject { .. } => "reject",
            Resolution::Modify { .. } => "modify",
            Resolution::Clarify { .. } => "clarify",
            Resolution::Reclassify { .. } => "reclassify",
            Resolution::Cancel => "cancel",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_from_requirement() {
        assert_eq!(CheckpointKind::from_requirement(CheckpointRequirement::None), None);
        assert_eq!(
            CheckpointKind::from_requirement(CheckpointRequirement::Review),
            Some(CheckpointKind::Review)
        );
        assert!(!CheckpointKind::Informational.is_blocking());
        assert!(CheckpointKind::TerminalSummary.is_blocking());
    }

    #[test]
    fn test_resolution_serializes_with_action_tag() {
        let json = serde_json::to_string(&Resolution::Reject {
            reason: "too coupled".into(),
        })
        .unwrap();
        assert_eq!(json, r#"{"action":"reject","reason":"too coupled"}"#);

        let parsed: Resolution = serde_json::from_str(r#"{"action":"cancel"}"#).unwrap();
        assert_eq!(parsed, Resolution::Cancel);
        assert_eq!(parsed.name(), "cancel");
    }
}
