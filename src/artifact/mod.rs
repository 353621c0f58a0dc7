//! Content-addressed artifact store, one per run.
//!
//! Artifacts live at `runs/<run-id>/artifacts/<artifact-id>.json`. They are
//! immutable: a correction is stored as a new version under the same
//! producer and schema.

use crate::errors::{EngineError, EngineResult};
use chrono::Utc;
use conductor_common::{
    Artifact, ArtifactId, ArtifactSummary, PhaseId, SchemaId, TaskId, ValidationStatus,
};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

pub const ARTIFACTS_DIR: &str = "artifacts";

/// Length of the hex artifact id.
const ID_LEN: usize = 32;

/// Content address of an artifact.
pub fn content_address(producer: &TaskId, schema: &SchemaId, version: u32, payload: &Value) -> ArtifactId {
    let mut hasher = Sha256::new();
    hasher.update(producer.as_str().as_bytes());
    hasher.update([0u8]);
    hasher.update(schema.as_str().as_bytes());
    hasher.update([0u8]);
    hasher.update(version.to_be_bytes());
    hasher.update([0u8]);
    hasher.update(payload.to_string().as_bytes());
    let digest = hex::encode(hasher.finalize());
    ArtifactId::new(&digest[..ID_LEN])
}

pub struct ArtifactStore {
    dir: PathBuf,
    index: Mutex<HashMap<ArtifactId, ArtifactSummary>>,
}

impl ArtifactStore {
    /// Open the store under `run_dir`, indexing what is already on disk.
    pub fn open(run_dir: &Path) -> EngineResult<Self> {
        let dir = run_dir.join(ARTIFACTS_DIR);
        fs::create_dir_all(&dir).map_err(|e| EngineError::io(&dir, e))?;

        let mut index = HashMap::new();
        for entry in fs::read_dir(&dir).map_err(|e| EngineError::io(&dir, e))? {
            let path = entry.map_err(|e| EngineError::io(&dir, e))?.path();
            match path.extension().and_then(|e| e.to_str()) {
                Some("json") => {
                    let artifact = read_artifact(&path)?;
                    index.insert(artifact.id.clone(), artifact.summary());
                }
                Some("tmp") => {
                    // Leftover of an interrupted write; never became visible
                    let _ = fs::remove_file(&path);
                }
                _ => {}
            }
        }

        Ok(Self {
            dir,
            index: Mutex::new(index),
        })
    }

    /// Build an artifact with its content address filled in.
    pub fn build(
        producer: &TaskId,
        phase: &PhaseId,
        schema: &SchemaId,
        version: u32,
        payload: Value,
        validation: ValidationStatus,
    ) -> Artifact {
        Artifact {
            id: content_address(producer, schema, version, &payload),
            schema: schema.clone(),
            producer: producer.clone(),
            phase: phase.clone(),
            version,
            payload,
            created_at: Utc::now(),
            validation,
        }
    }

    /// Persist an artifact. Fails if this producer already stored this
    /// schema at this version.
    pub fn put(&self, artifact: &Artifact) -> EngineResult<ArtifactId> {
        let mut index = self.index.lock().map_err(|_| EngineError::LockPoisoned)?;

        let exists = index.values().any(|s| {
            s.producer == artifact.producer
                && s.schema == artifact.schema
                && s.version == artifact.version
        });
        if exists {
            return Err(EngineError::ArtifactExists {
                producer: artifact.producer.clone(),
                schema: artifact.schema.clone(),
                version: artifact.version,
            });
        }

        let path = self.path_for(&artifact.id);
        let tmp = path.with_extension("json.tmp");
        let json = serde_json::to_vec_pretty(artifact)?;
        write_synced(&tmp, &json)?;
        fs::rename(&tmp, &path).map_err(|e| EngineError::io(&path, e))?;
        sync_dir(&self.dir);

        index.insert(artifact.id.clone(), artifact.summary());
        tracing::debug!(
            artifact = %artifact.id,
            producer = %artifact.producer,
            version = artifact.version,
            "Artifact stored"
        );
        Ok(artifact.id.clone())
    }

    pub fn get(&self, id: &ArtifactId) -> EngineResult<Artifact> {
        let path = self.path_for(id);
        if !path.exists() {
            return Err(EngineError::ArtifactNotFound(id.clone()));
        }
        read_artifact(&path)
    }

    pub fn get_summary(&self, id: &ArtifactId) -> EngineResult<ArtifactSummary> {
        let index = self.index.lock().map_err(|_| EngineError::LockPoisoned)?;
        index
            .get(id)
            .cloned()
            .ok_or_else(|| EngineError::ArtifactNotFound(id.clone()))
    }

    pub fn contains(&self, id: &ArtifactId) -> EngineResult<bool> {
        let index = self.index.lock().map_err(|_| EngineError::LockPoisoned)?;
        Ok(index.contains_key(id))
    }

    /// Version the next artifact from `producer` with `schema` must use.
    pub fn next_version(&self, producer: &TaskId, schema: &SchemaId) -> EngineResult<u32> {
        Ok(self
            .latest(producer, schema)?
            .map(|s| s.version + 1)
            .unwrap_or(1))
    }

    /// Highest stored version from `producer` with `schema`.
    pub fn latest(&self, producer: &TaskId, schema: &SchemaId) -> EngineResult<Option<ArtifactSummary>> {
        let index = self.index.lock().map_err(|_| EngineError::LockPoisoned)?;
        Ok(index
            .values()
            .filter(|s| &s.producer == producer && &s.schema == schema)
            .max_by_key(|s| s.version)
            .cloned())
    }

    /// All artifacts, oldest first.
    pub fn list(&self) -> EngineResult<Vec<ArtifactSummary>> {
        let index = self.index.lock().map_err(|_| EngineError::LockPoisoned)?;
        let mut all: Vec<ArtifactSummary> = index.values().cloned().collect();
        all.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.producer.cmp(&b.producer))
                .then_with(|| a.version.cmp(&b.version))
        });
        Ok(all)
    }

    fn path_for(&self, id: &ArtifactId) -> PathBuf {
        self.dir.join(format!("{}.json", id))
    }
}

/// Read one artifact of the run in `run_dir` without opening a store.
pub fn load(run_dir: &Path, id: &ArtifactId) -> EngineResult<Artifact> {
    let path = run_dir.join(ARTIFACTS_DIR).join(format!("{}.json", id));
    if !path.exists() {
        return Err(EngineError::ArtifactNotFound(id.clone()));
    }
    read_artifact(&path)
}

fn read_artifact(path: &Path) -> EngineResult<Artifact> {
    let content = fs::read(path).map_err(|e| EngineError::io(path, e))?;
    Ok(serde_json::from_slice(&content)?)
}

/// Write `bytes` to `path` and flush them to disk before returning.
fn write_synced(path: &Path, bytes: &[u8]) -> EngineResult<()> {
    let mut file = File::create(path).map_err(|e| EngineError::io(path, e))?;
    file.write_all(bytes).map_err(|e| EngineError::io(path, e))?;
    file.sync_all().map_err(|e| EngineError::io(path, e))
}

/// Persist a rename into `dir`. Not every platform can open a directory.
fn sync_dir(dir: &Path) {
    if let Err(e) = File::open(dir).and_then(|d| d.sync_all()) {
        tracing::debug!(dir = %dir.display(), error = %e, "Could not sync artifact directory");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    fn design(version: u32, payload: Value) -> Artifact {
        ArtifactStore::build(
            &TaskId::new("architecture.architect"),
            &PhaseId::new("architecture"),
            &SchemaId::new("architecture.design"),
            version,
            payload,
            ValidationStatus::Validated,
        )
    }

    #[test]
    fn test_load_without_store() {
        let dir = tempdir().unwrap();
        let store = ArtifactStore::open(dir.path()).unwrap();
        let id = store.put(&design(1, json!("v1"))).unwrap();
        assert_eq!(load(dir.path(), &id).unwrap().version, 1);
        assert!(matches!(
            load(dir.path(), &ArtifactId::new("missing")),
            Err(EngineError::ArtifactNotFound(_))
        ));
    }

    #[test]
    fn test_put_then_get() {
        let dir = tempdir().unwrap();
        let store = ArtifactStore::open(dir.path()).unwrap();
        let artifact = design(1, json!({"modules": ["api"]}));
        let id = store.put(&artifact).unwrap();
        assert_eq!(store.get(&id).unwrap(), artifact);
        assert_eq!(store.get_summary(&id).unwrap().keys, vec!["modules"]);
    }

    #[test]
    fn test_put_leaves_only_the_final_file() {
        let dir = tempdir().unwrap();
        let store = ArtifactStore::open(dir.path()).unwrap();
        let id = store.put(&design(1, json!({"components": 2}))).unwrap();

        let names: Vec<String> = fs::read_dir(dir.path().join(ARTIFACTS_DIR))
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec![format!("{}.json", id)]);

        let on_disk = read_artifact(&dir.path().join(ARTIFACTS_DIR).join(format!("{}.json", id))).unwrap();
        assert_eq!(on_disk.payload, json!({"components": 2}));
    }

    #[test]
    fn test_duplicate_version_is_rejected() {
        let dir = tempdir().unwrap();
        let store = ArtifactStore::open(dir.path()).unwrap();
        store.put(&design(1, json!({"a": 1}))).unwrap();
        let err = store.put(&design(1, json!({"a": 2}))).unwrap_err();
        assert!(matches!(err, EngineError::ArtifactExists { version: 1, .. }));
    }

    #[test]
    fn test_versions_advance() {
        let dir = tempdir().unwrap();
        let store = ArtifactStore::open(dir.path()).unwrap();
        let producer = TaskId::new("architecture.architect");
        let schema = SchemaId::new("architecture.design");
        assert_eq!(store.next_version(&producer, &schema).unwrap(), 1);
        store.put(&design(1, json!({"a": 1}))).unwrap();
        store.put(&design(2, json!({"a": 2}))).unwrap();
        assert_eq!(store.next_version(&producer, &schema).unwrap(), 3);
        assert_eq!(store.latest(&producer, &schema).unwrap().unwrap().version, 2);
        assert_eq!(store.list().unwrap().len(), 2);
    }

    #[test]
    fn test_missing_artifact() {
        let dir = tempdir().unwrap();
        let store = ArtifactStore::open(dir.path()).unwrap();
        let missing = ArtifactId::new("nope");
        assert!(matches!(
            store.get(&missing),
            Err(EngineError::ArtifactNotFound(_))
        ));
        assert!(matches!(
            store.get_summary(&missing),
            Err(EngineError::ArtifactNotFound(_))
        ));
    }

    #[test]
    fn test_reopen_rebuilds_index() {
        let dir = tempdir().unwrap();
        let id = {
            let store = ArtifactStore::open(dir.path()).unwrap();
            store.put(&design(1, json!({"a": 1}))).unwrap()
        };
        let store = ArtifactStore::open(dir.path()).unwrap();
        assert!(store.contains(&id).unwrap());
        assert_eq!(store.list().unwrap().len(), 1);
    }

    #[test]
    fn test_content_address_depends_on_payload_and_version() {
        let p = TaskId::new("t");
        let s = SchemaId::new("s");
        let a = content_address(&p, &s, 1, &json!({"x": 1}));
        assert_eq!(a, content_address(&p, &s, 1, &json!({"x": 1})));
        assert_ne!(a, content_address(&p, &s, 2, &json!({"x": 1})));
        assert_ne!(a, content_address(&p, &s, 1, &json!({"x": 2})));
        assert_eq!(a.as_str().len(), 32);
    }
}
