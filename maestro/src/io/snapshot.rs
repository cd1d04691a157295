//! Controller snapshot at `.maestro/state/snapshot.json`.
//!
//! A snapshot holds everything needed to continue a task in a new process:
//! the record store, the controller state and the monitor counters.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::core::monitor::MonitorState;
use crate::state_machine::ControllerState;
use crate::store::DataStore;

pub const SNAPSHOT_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub version: u32,
    pub store: DataStore,
    pub controller: ControllerState,
    #[serde(default)]
    pub monitor: MonitorState,
}

impl Snapshot {
    pub fn new(store: DataStore, controller: ControllerState, monitor: MonitorState) -> Self {
        Self {
            version: SNAPSHOT_VERSION,
            store,
            controller,
            monitor,
        }
    }
}

pub fn load_snapshot(path: &Path) -> Result<Snapshot> {
    debug!(path = %path.display(), "loading snapshot");
    let contents =
        fs::read_to_string(path).with_context(|| format!("read snapshot {}", path.display()))?;
    let snapshot: Snapshot = serde_json::from_str(&contents)
        .with_context(|| format!("parse snapshot {}", path.display()))?;
    if snapshot.version != SNAPSHOT_VERSION {
        bail!(
            "unsupported snapshot version {} in {} (expected {SNAPSHOT_VERSION})",
            snapshot.version,
            path.display()
        );
    }
    Ok(snapshot)
}

/// Atomically write a snapshot to disk (temp file + rename).
pub fn write_snapshot(path: &Path, snapshot: &Snapshot) -> Result<()> {
    debug!(
        path = %path.display(),
        state = %snapshot.controller.current_state,
        next_seq = snapshot.store.next_seq(),
        "writing snapshot"
    );
    let mut buf = serde_json::to_string_pretty(snapshot).context("serialize snapshot")?;
    buf.push('\n');
    super::write_atomic(path, &buf)
}
