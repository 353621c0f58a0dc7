//! Artifacts: immutable typed outputs of tasks.

use crate::ids::{ArtifactId, PhaseId, SchemaId, TaskId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationStatus {
    #[default]
    Validated,
    /// Stored by the engine itself (modification requests), not by a worker
    Supplied,
}

/// A stored task output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    pub id: ArtifactId,
    pub schema: SchemaId,
    pub producer: TaskId,
    pub phase: PhaseId,
    pub version: u32,
    pub payload: Value,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub validation: ValidationStatus,
}

impl Artifact {
    pub fn payload_bytes(&self) -> usize {
        serde_json::to_vec(&self.payload).map(|v| v.len()).unwrap_or(0)
    }

    pub fn summary(&self) -> ArtifactSummary {
        let keys = match &self.payload {
            Value::Object(map) => map.keys().cloned().collect(),
            _ => Vec::new(),
        };
        ArtifactSummary {
            id: self.id.clone(),
            schema: self.schema.clone(),
            producer: self.producer.clone(),
            phase: self.phase.clone(),
            version: self.version,
            payload_bytes: self.payload_bytes(),
            keys,
            created_at: self.created_at,
        }
    }
}

/// Compact view of an artifact, used for review summaries and listings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactSummary {
    pub id: ArtifactId,
    pub schema: SchemaId,
    pub producer: TaskId,
    pub phase: PhaseId,
    pub version: u32,
    pub payload_bytes: usize,
    /// Top-level payload keys when the payload is an object
    pub keys: Vec<String>,
    pub created_at: DateTime<Utc>,
}

impl ArtifactSummary {
    pub fn one_line(&self) -> String {
        let keys = if self.keys.is_empty() {
            String::new()
        } else {
            format!(" [{}]", self.keys.join(", "))
        };
        format!(
            "{} v{} from {} ({} bytes){}",
            self.schema, self.version, self.producer, self.payload_bytes, keys
        )
    }
}

/// What a worker hands back on success.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerOutput {
    pub schema: SchemaId,
    pub payload: Value,
}

impl WorkerOutput {
    pub fn new(schema: impl Into<SchemaId>, payload: Value) -> Self {
        Self {
            schema: schema.into(),
            payload,
        }
    }
}
