//! Append-only, per-run event log (`events.jsonl`).
//!
//! One JSON object per line. Every append is flushed to disk before it
//! returns; the State Manager relies on that for write-ahead ordering.

use crate::errors::{EngineError, EngineResult};
use chrono::Utc;
use conductor_common::{Event, RunId, Transition};
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

pub const EVENTS_FILE: &str = "events.jsonl";

pub struct EventLog {
    path: PathBuf,
    run_id: RunId,
    file: File,
    head: u64,
}

impl EventLog {
    /// Open (or create) the log in `run_dir`.
    ///
    /// A torn trailing line left by a crash mid-append is cut off so new
    /// events start on a clean line.
    pub fn open(run_dir: &Path, run_id: RunId) -> EngineResult<Self> {
        let path = run_dir.join(EVENTS_FILE);
        let (events, valid_len) = read_events(&path)?;
        let head = events.last().map(|e| e.seq).unwrap_or(0);

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| EngineError::io(&path, e))?;

        let on_disk = file.metadata().map_err(|e| EngineError::io(&path, e))?.len();
        if on_disk > valid_len {
            tracing::warn!(
                run_id = %run_id,
                dropped_bytes = on_disk - valid_len,
                "Truncating torn event log tail"
            );
            file.set_len(valid_len)
                .map_err(|e| EngineError::io(&path, e))?;
        }

        Ok(Self {
            path,
            run_id,
            file,
            head,
        })
    }

    /// Sequence number of the last durable event (0 when empty).
    pub fn head(&self) -> u64 {
        self.head
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append a transition and flush it to disk.
    pub fn append(&mut self, transition: Transition) -> EngineResult<Event> {
        let event = self.prepare(transition);
        self.write(&event)?;
        Ok(event)
    }

    /// Build the next event without writing it.
    pub fn prepare(&self, transition: Transition) -> Event {
        Event {
            seq: self.head + 1,
            timestamp: Utc::now(),
            subject: transition.subject(self.run_id),
            transition,
        }
    }

    /// Write a prepared event. It must be the next in sequence.
    pub fn write(&mut self, event: &Event) -> EngineResult<()> {
        if event.seq != self.head + 1 {
            return Err(EngineError::InvalidTransition(format!(
                "event seq {} does not follow head {}",
                event.seq, self.head
            )));
        }
        let mut line = serde_json::to_vec(event)?;
        line.push(b'\n');

        self.file
            .write_all(&line)
            .map_err(|e| EngineError::io(&self.path, e))?;
        self.file
            .sync_data()
            .map_err(|e| EngineError::io(&self.path, e))?;

        self.head = event.seq;
        tracing::trace!(run_id = %self.run_id, seq = event.seq, kind = event.kind(), "Event appended");
        Ok(())
    }

    /// All events in `run_dir`, in sequence order.
    pub fn read_all(run_dir: &Path) -> EngineResult<Vec<Event>> {
        Ok(read_events(&run_dir.join(EVENTS_FILE))?.0)
    }

    /// Events with `seq > after`.
    pub fn read_from(run_dir: &Path, after: u64) -> EngineResult<Vec<Event>> {
        Ok(Self::read_all(run_dir)?
            .into_iter()
            .filter(|e| e.seq > after)
            .collect())
    }
}

/// Parse the log, returning the events and the byte length of the intact
/// prefix. A missing file is an empty log.
fn read_events(path: &Path) -> EngineResult<(Vec<Event>, u64)> {
    if !path.exists() {
        return Ok((Vec::new(), 0));
    }
    let content = fs::read(path).map_err(|e| EngineError::io(path, e))?;

    let mut events: Vec<Event> = Vec::new();
    let mut offset = 0usize;
    while offset < content.len() {
        let Some(end) = content[offset..].iter().position(|b| *b == b'\n') else {
            // Unterminated tail: the append never completed
            break;
        };
        let line = &content[offset..offset + end];
        offset += end + 1;
        if line.iter().all(|b| b.is_ascii_whitespace()) {
            continue;
        }
        let event: Event = serde_json::from_slice(line)?;
        if let Some(last) = events.last()
            && event.seq <= last.seq
        {
            return Err(EngineError::InvalidTransition(format!(
                "event log {} is out of order at seq {}",
                path.display(),
                event.seq
            )));
        }
        events.push(event);
    }

    let valid_len = if content.ends_with(b"\n") || content.is_empty() {
        content.len()
    } else {
        content.iter().rposition(|b| *b == b'\n').map_or(0, |p| p + 1)
    };
    Ok((events, valid_len as u64))
}

#[cfg(test)]
mod tests {
    use super::*;
    use conductor_common::{PhaseId, TaskId};
    use tempfile::tempdir;

    fn started(task: &str) -> Transition {
        Transition::TaskStarted {
            task: TaskId::new(task),
            attempt: 1,
        }
    }

    #[test]
    fn test_sequence_starts_at_one_and_increases() {
        let dir = tempdir().unwrap();
        let mut log = EventLog::open(dir.path(), RunId::new()).unwrap();
        assert_eq!(log.head(), 0);
        let e1 = log.append(started("a.x")).unwrap();
        let e2 = log.append(started("a.y")).unwrap();
        assert_eq!(e1.seq, 1);
        assert_eq!(e2.seq, 2);
        assert_eq!(log.head(), 2);
    }

    #[test]
    fn test_reopen_continues_sequence() {
        let dir = tempdir().unwrap();
        let run_id = RunId::new();
        {
            let mut log = EventLog::open(dir.path(), run_id).unwrap();
            log.append(started("a.x")).unwrap();
        }
        let mut log = EventLog::open(dir.path(), run_id).unwrap();
        assert_eq!(log.head(), 1);
        assert_eq!(log.append(started("a.y")).unwrap().seq, 2);

        let events = EventLog::read_all(dir.path()).unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].kind(), "task_started");
    }

    #[test]
    fn test_read_from_filters_by_seq() {
        let dir = tempdir().unwrap();
        let mut log = EventLog::open(dir.path(), RunId::new()).unwrap();
        for _ in 0..3 {
            log.append(Transition::PhaseEntered {
                phase: PhaseId::new("requirements"),
                index: 0,
            })
            .unwrap();
        }
        let tail = EventLog::read_from(dir.path(), 1).unwrap();
        assert_eq!(tail.iter().map(|e| e.seq).collect::<Vec<_>>(), vec![2, 3]);
    }

    #[test]
    fn test_torn_tail_is_truncated() {
        let dir = tempdir().unwrap();
        let run_id = RunId::new();
        {
            let mut log = EventLog::open(dir.path(), run_id).unwrap();
            log.append(started("a.x")).unwrap();
        }
        let path = dir.path().join(EVENTS_FILE);
        let mut f = OpenOptions::new().append(true).open(&path).unwrap();
        f.write_all(b"{\"seq\":2,\"timest").unwrap();
        drop(f);

        let mut log = EventLog::open(dir.path(), run_id).unwrap();
        assert_eq!(log.head(), 1);
        assert_eq!(log.append(started("a.y")).unwrap().seq, 2);
        assert_eq!(EventLog::read_all(dir.path()).unwrap().len(), 2);
    }

    #[test]
    fn test_write_rejects_out_of_sequence_event() {
        let dir = tempdir().unwrap();
        let mut log = EventLog::open(dir.path(), RunId::new()).unwrap();
        let mut event = log.prepare(started("a.x"));
        event.seq = 5;
        assert!(log.write(&event).is_err());
        assert_eq!(log.head(), 0);
    }

    #[test]
    fn test_missing_log_reads_empty() {
        let dir = tempdir().unwrap();
        assert!(EventLog::read_all(dir.path()).unwrap().is_empty());
    }
}
