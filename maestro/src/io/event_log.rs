//! Append-only controller event log at `.maestro/state/events.jsonl`.
//!
//! One [`ControllerEvent`] per line. The log is written after every tick and
//! is the source for `maestro events --replay` and for resuming when the
//! snapshot lags behind.

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::warn;

use crate::model::ControllerEvent;

#[derive(Debug, Clone)]
pub struct EventLog {
    path: PathBuf,
}

impl EventLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append events in order. An empty slice does not touch the file.
    pub fn append(&self, events: &[ControllerEvent]) -> Result<()> {
        if events.is_empty() {
            return Ok(());
        }
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create directory {}", parent.display()))?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("open event log {}", self.path.display()))?;
        for event in events {
            let line = serde_json::to_string(event).context("serialize controller event")?;
            writeln!(file, "{line}")
                .with_context(|| format!("append event log {}", self.path.display()))?;
        }
        file.flush()
            .with_context(|| format!("flush event log {}", self.path.display()))?;
        Ok(())
    }

    /// Atomically replace the whole log with `events`.
    pub fn rewrite(&self, events: &[ControllerEvent]) -> Result<()> {
        let mut buf = String::new();
        for event in events {
            buf.push_str(&serde_json::to_string(event).context("serialize controller event")?);
            buf.push('\n');
        }
        super::write_atomic(&self.path, &buf)
    }

    /// Read every well-formed event. Malformed lines (for example a torn
    /// final write) are skipped with a warning.
    pub fn read_all(&self) -> Result<Vec<ControllerEvent>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let file = File::open(&self.path)
            .with_context(|| format!("open event log {}", self.path.display()))?;
        let mut events = Vec::new();
        for (index, line) in BufReader::new(file).lines().enumerate() {
            let line = line.with_context(|| format!("read event log {}", self.path.display()))?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<ControllerEvent>(&line) {
                Ok(event) => events.push(event),
                Err(err) => warn!(line = index + 1, error = %err, "skipping malformed event"),
            }
        }
        Ok(events)
    }

    /// Highest event seq on disk, if any.
    pub fn last_seq(&self) -> Result<Option<u64>> {
        Ok(self.read_all()?.iter().map(|e| e.seq).max())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{State, TriggerCode, TriggerRole};
    use crate::store::DataStore;

    #[test]
    fn append_then_read_preserves_order() {
        let temp = tempfile::tempdir().expect("tempdir");
        let log = EventLog::new(temp.path().join("state").join("events.jsonl"));
        let mut store = DataStore::new("x");
        store.append_event("controller", "task_started", "go");
        store.append_switch_event(
            State::Init,
            State::Plan,
            TriggerRole::Controller,
            TriggerCode::NoPendingSubtasks,
            "empty",
        );

        log.append(&store.events()[..1]).expect("first append");
        log.append(&store.events()[1..]).expect("second append");

        let events = log.read_all().expect("read");
        assert_eq!(events, store.events());
        assert_eq!(log.last_seq().expect("seq"), Some(store.events()[1].seq));
    }

    #[test]
    fn malformed_lines_are_skipped() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("events.jsonl");
        let mut store = DataStore::new("x");
        store.append_event("controller", "task_started", "go");
        let log = EventLog::new(&path);
        log.append(store.events()).expect("append");
        let mut file = OpenOptions::new().append(true).open(&path).expect("open");
        writeln!(file, "{{\"seq\": 9, \"trunc").expect("write torn line");

        let events = log.read_all().expect("read");
        assert_eq!(events.len(), 1);
    }

    #[test]
    fn missing_log_reads_empty() {
        let temp = tempfile::tempdir().expect("tempdir");
        let log = EventLog::new(temp.path().join("none.jsonl"));
        assert!(log.read_all().expect("read").is_empty());
        assert_eq!(log.last_seq().expect("seq"), None);
    }
}
