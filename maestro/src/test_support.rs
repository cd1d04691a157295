//! Test-only helpers for building stores, actions, scripted controllers and
//! throwaway workspaces.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tempfile::TempDir;

use crate::controller::{Controller, TickReport};
use crate::core::action::{ActionPayload, HardwareAction, MouseButton};
use crate::core::types::{AssigneeRole, State};
use crate::io::config::MaestroConfig;
use crate::io::init::{InitOptions, MaestroPaths, init_workspace};
use crate::model::SubtaskDraft;
use crate::roles::scripted::{RoleScript, ScriptHandles, ScriptedWorkerStep};
use crate::store::DataStore;

/// Operator subtask draft with an empty description.
pub fn draft(title: &str) -> SubtaskDraft {
    SubtaskDraft::new(title, AssigneeRole::Operator)
}

/// Left click without an element description.
pub fn click(x: i32, y: i32) -> ActionPayload {
    ActionPayload::Hardware(HardwareAction::Click {
        x,
        y,
        button: MouseButton::Left,
        clicks: 1,
        element_description: None,
    })
}

/// Left click that only differs from [`click`] in its free-text description.
pub fn click_described(x: i32, y: i32, description: &str) -> ActionPayload {
    ActionPayload::Hardware(HardwareAction::Click {
        x,
        y,
        button: MouseButton::Left,
        clicks: 1,
        element_description: Some(description.to_string()),
    })
}

/// Worker reply proposing a click at `(x, 100)`.
pub fn act_click(x: i32) -> ScriptedWorkerStep {
    ScriptedWorkerStep::act(click(x, 100))
}

/// Store with `titles` queued as operator subtasks, nothing current yet.
pub fn store_with_subtasks(objective: &str, titles: &[&str]) -> DataStore {
    let mut store = DataStore::new(objective);
    store.enqueue_subtasks(titles.iter().map(|t| draft(t)).collect());
    store
}

/// Fresh in-memory controller over `titles` driven by `script`.
pub fn scripted_controller(
    script: RoleScript,
    titles: &[&str],
    config: &MaestroConfig,
) -> (Controller, ScriptHandles) {
    let (roles, handles) = script.into_roles();
    let store = store_with_subtasks("file the quarterly expense report", titles);
    (Controller::new(store, roles, config), handles)
}

/// Initial state followed by the state after each tick.
pub fn state_trace(reports: &[TickReport]) -> Vec<State> {
    let mut states = vec![reports.first().map_or(State::Init, |r| r.from)];
    states.extend(reports.iter().map(|r| r.status.current_state));
    states
}

/// Temporary directory with an initialized `.maestro/` layout.
pub struct TestWorkspace {
    dir: TempDir,
    pub paths: MaestroPaths,
}

impl TestWorkspace {
    pub fn new() -> Result<Self> {
        let dir = tempfile::tempdir().context("create temp workspace")?;
        let paths = init_workspace(dir.path(), &InitOptions { force: false })?;
        Ok(Self { dir, paths })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Write `script` as JSON under the workspace root and return its path.
    pub fn write_script(&self, name: &str, script: &RoleScript) -> Result<PathBuf> {
        let path = self.dir.path().join(name);
        let contents = serde_json::to_string_pretty(script).context("serialize role script")?;
        fs::write(&path, contents).with_context(|| format!("write {}", path.display()))?;
        Ok(path)
    }
}
