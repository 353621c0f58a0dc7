//! Identifier newtypes.
//!
//! Every id that crosses a component boundary gets its own type so that a
//! task id can never be passed where an artifact id is expected.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Unique identifier of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(Uuid);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// First eight characters, used in compact listings.
    pub fn short(&self) -> String {
        self.0.to_string()[..8].to_string()
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for RunId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }
    };
}

string_id!(
    /// Stable phase name within a plan (e.g. `requirements`).
    PhaseId
);
string_id!(
    /// Task id, `<phase>.<producer>` for planned tasks.
    TaskId
);
string_id!(
    /// Declared artifact schema identifier (e.g. `architecture.design`).
    SchemaId
);
string_id!(
    /// Content address of a stored artifact.
    ArtifactId
);
string_id!(
    /// Checkpoint id, `cp-<phase>-<n>`.
    CheckpointId
);

impl TaskId {
    /// Id of a planned task.
    pub fn planned(phase: &PhaseId, producer: &str) -> Self {
        Self(format!("{}.{}", phase, producer))
    }

    /// Id of the `n`th revision of `base`.
    pub fn revision(base: &TaskId, n: u32) -> Self {
        Self(format!("{}~r{}", base.root(), n))
    }

    /// The planned task a revision chain starts from.
    pub fn root(&self) -> TaskId {
        let root = self.0.split('~').next().unwrap_or(&self.0);
        Self(root.to_string())
    }
}

impl CheckpointId {
    pub fn for_phase(phase: &PhaseId, n: usize) -> Self {
        Self(format!("cp-{}-{}", phase, n))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_id_roundtrips_through_display() {
        let id = RunId::new();
        let parsed: RunId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
        assert_eq!(id.short().len(), 8);
    }

    #[test]
    fn test_planned_task_id() {
        let id = TaskId::planned(&PhaseId::new("generation"), "backend-developer");
        assert_eq!(id.as_str(), "generation.backend-developer");
    }

    #[test]
    fn test_revision_ids_share_root() {
        let base = TaskId::new("architecture.architect");
        let r1 = TaskId::revision(&base, 1);
        assert_eq!(r1.as_str(), "architecture.architect~r1");
        let r2 = TaskId::revision(&r1, 2);
        assert_eq!(r2.as_str(), "architecture.architect~r2");
        assert_eq!(r2.root(), base);
    }

    #[test]
    fn test_string_ids_serialize_transparently() {
        let id = PhaseId::new("research");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"research\"");
    }
}
