//! State Manager: the single writer of a run's state.
//!
//! Every transition is appended to the event log (and flushed) before the
//! in-memory record changes, and the record is then snapshotted to
//! `run.json`. The snapshot is only a cache: on open, any events newer than
//! the snapshot are replayed, and a missing snapshot is rebuilt from the log.

pub mod record;
pub mod snapshot;

pub use record::{Readiness, RunRecord, TaskState};
pub use snapshot::{PhaseView, RunSnapshot, TaskView};

use crate::errors::{EngineError, EngineResult};
use crate::events::EventLog;
use conductor_common::{ClassifiedRequest, Event, RunId, Transition};
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

pub const SNAPSHOT_FILE: &str = "run.json";
pub const LOCK_FILE: &str = "run.lock";

struct Inner {
    record: RunRecord,
    log: EventLog,
}

pub struct StateManager {
    run_id: RunId,
    run_dir: PathBuf,
    inner: Mutex<Inner>,
    // Held for the manager's lifetime; dropping it releases the lock
    _lock: File,
}

impl StateManager {
    /// Create the directory and first event of a new run.
    pub fn create(runs_dir: &Path, run_id: RunId, request: ClassifiedRequest) -> EngineResult<Self> {
        let run_dir = runs_dir.join(run_id.to_string());
        fs::create_dir_all(&run_dir).map_err(|e| EngineError::io(&run_dir, e))?;
        let lock = acquire_lock(&run_dir, run_id)?;

        let mut log = EventLog::open(&run_dir, run_id)?;
        if log.head() != 0 {
            return Err(EngineError::InvalidTransition(format!(
                "run {} already has events",
                run_id
            )));
        }
        let event = log.append(Transition::RunCreated { run_id, request })?;
        let record = RunRecord::from_created(&event)?;
        write_snapshot(&run_dir, &record)?;

        tracing::info!(run_id = %run_id, "Run created");
        Ok(Self {
            run_id,
            run_dir,
            inner: Mutex::new(Inner { record, log }),
            _lock: lock,
        })
    }

    /// Open an existing run, recovering the record from snapshot and log.
    pub fn open(runs_dir: &Path, run_id: RunId) -> EngineResult<Self> {
        let run_dir = runs_dir.join(run_id.to_string());
        if !run_dir.join(crate::events::EVENTS_FILE).exists() {
            return Err(EngineError::RunNotFound(run_id));
        }
        let lock = acquire_lock(&run_dir, run_id)?;
        let log = EventLog::open(&run_dir, run_id)?;

        let record = match read_snapshot(&run_dir) {
            Ok(Some(mut record)) if record.event_head <= log.head() => {
                let newer = EventLog::read_from(&run_dir, record.event_head)?;
                if !newer.is_empty() {
                    tracing::info!(run_id = %run_id, events = newer.len(), "Replaying events newer than snapshot");
                }
                for event in &newer {
                    record.apply(event)?;
                }
                record
            }
            Ok(_) => {
                tracing::warn!(run_id = %run_id, "Snapshot missing or ahead of log; rebuilding from events");
                RunRecord::replay(&EventLog::read_all(&run_dir)?)?
            }
            Err(e) => {
                tracing::warn!(run_id = %run_id, error = %e, "Unreadable snapshot; rebuilding from events");
                RunRecord::replay(&EventLog::read_all(&run_dir)?)?
            }
        };
        write_snapshot(&run_dir, &record)?;

        Ok(Self {
            run_id,
            run_dir,
            inner: Mutex::new(Inner { record, log }),
            _lock: lock,
        })
    }

    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    /// Validate, persist and apply a transition.
    ///
    /// The event is durable before the new state is visible to any reader.
    pub fn apply(&self, transition: Transition) -> EngineResult<Event> {
        let mut inner = self.lock()?;
        let event = inner.log.prepare(transition);
        let mut next = inner.record.clone();
        next.apply(&event)?;
        inner.log.write(&event)?;
        inner.record = next;

        if let Err(e) = write_snapshot(&self.run_dir, &inner.record) {
            // The log already holds the event; the next open replays it
            tracing::warn!(run_id = %self.run_id, error = %e, "Failed to write run snapshot");
        }
        Ok(event)
    }

    /// A copy of the current record.
    pub fn record(&self) -> EngineResult<RunRecord> {
        Ok(self.lock()?.record.clone())
    }

    /// Read the current record without copying it.
    pub fn with_record<R>(&self, f: impl FnOnce(&RunRecord) -> R) -> EngineResult<R> {
        Ok(f(&self.lock()?.record))
    }

    pub fn snapshot(&self, max_retries: u32) -> EngineResult<RunSnapshot> {
        self.with_record(|r| RunSnapshot::from_record(r, max_retries))
    }

    pub fn events(&self) -> EngineResult<Vec<Event>> {
        let _guard = self.lock()?;
        EventLog::read_all(&self.run_dir)
    }

    fn lock(&self) -> EngineResult<MutexGuard<'_, Inner>> {
        self.inner.lock().map_err(|_| EngineError::LockPoisoned)
    }
}

/// Ids of all runs under `runs_dir`.
pub fn list_run_ids(runs_dir: &Path) -> EngineResult<Vec<RunId>> {
    if !runs_dir.exists() {
        return Ok(Vec::new());
    }
    let mut ids = Vec::new();
    for entry in fs::read_dir(runs_dir).map_err(|e| EngineError::io(runs_dir, e))? {
        let entry = entry.map_err(|e| EngineError::io(runs_dir, e))?;
        if let Some(id) = entry
            .file_name()
            .to_str()
            .and_then(|name| name.parse::<RunId>().ok())
        {
            ids.push(id);
        }
    }
    ids.sort();
    Ok(ids)
}

/// Read a run's record without taking its lock (for listings and
/// inspection of runs another process may be driving).
pub fn peek_record(runs_dir: &Path, run_id: RunId) -> EngineResult<RunRecord> {
    let run_dir = runs_dir.join(run_id.to_string());
    if !run_dir.join(crate::events::EVENTS_FILE).exists() {
        return Err(EngineError::RunNotFound(run_id));
    }
    if let Ok(Some(mut record)) = read_snapshot(&run_dir) {
        for event in EventLog::read_from(&run_dir, record.event_head)? {
            record.apply(&event)?;
        }
        return Ok(record);
    }
    RunRecord::replay(&EventLog::read_all(&run_dir)?)
}

fn acquire_lock(run_dir: &Path, run_id: RunId) -> EngineResult<File> {
    let path = run_dir.join(LOCK_FILE);
    let file = OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(&path)
        .map_err(|e| EngineError::io(&path, e))?;
    file.try_lock_exclusive()
        .map_err(|_| EngineError::RunLocked(run_id))?;
    Ok(file)
}

fn read_snapshot(run_dir: &Path) -> EngineResult<Option<RunRecord>> {
    let path = run_dir.join(SNAPSHOT_FILE);
    if !path.exists() {
        return Ok(None);
    }
    let content = fs::read(&path).map_err(|e| EngineError::io(&path, e))?;
    Ok(Some(serde_json::from_slice(&content)?))
}

fn write_snapshot(run_dir: &Path, record: &RunRecord) -> EngineResult<()> {
    let path = run_dir.join(SNAPSHOT_FILE);
    let tmp = run_dir.join(format!("{}.tmp", SNAPSHOT_FILE));
    let json = serde_json::to_vec_pretty(record)?;
    fs::write(&tmp, json).map_err(|e| EngineError::io(&tmp, e))?;
    fs::rename(&tmp, &path).map_err(|e| EngineError::io(&path, e))?;
    Ok(())
}
