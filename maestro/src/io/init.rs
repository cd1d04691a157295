//! Initialization helpers for `.maestro/` scaffolding.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};

use super::config::{MaestroConfig, write_config};

const MAESTRO_GITIGNORE: &str = "state/\ntasks/\n";

/// All canonical paths within `.maestro/` for a workspace root.
#[derive(Debug, Clone)]
pub struct MaestroPaths {
    pub root: PathBuf,
    pub maestro_dir: PathBuf,
    pub state_dir: PathBuf,
    pub gitignore_path: PathBuf,
    pub config_path: PathBuf,
    pub snapshot_path: PathBuf,
    pub events_path: PathBuf,
}

impl MaestroPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let maestro_dir = root.join(".maestro");
        Self::with_state_dir(root, maestro_dir.join("state"))
    }

    /// Paths for one task managed by the multi-task service, stored under
    /// `.maestro/tasks/<task_id>/` and sharing the workspace config.
    pub fn for_task(root: impl Into<PathBuf>, task_id: &str) -> Self {
        let root = root.into();
        let state_dir = root.join(".maestro").join("tasks").join(task_id);
        Self::with_state_dir(root, state_dir)
    }

    fn with_state_dir(root: PathBuf, state_dir: PathBuf) -> Self {
        let maestro_dir = root.join(".maestro");
        Self {
            gitignore_path: maestro_dir.join(".gitignore"),
            config_path: maestro_dir.join("config.toml"),
            snapshot_path: state_dir.join("snapshot.json"),
            events_path: state_dir.join("events.jsonl"),
            root,
            maestro_dir,
            state_dir,
        }
    }
}

/// Options for `init_workspace`.
#[derive(Debug, Clone)]
pub struct InitOptions {
    /// If true, overwrite existing maestro-owned files.
    pub force: bool,
}

/// Create `.maestro/` scaffolding in `root` with a default config.
///
/// Fails if `.maestro/` already exists unless `options.force` is set. With
/// `force`, the config is reset and any saved task state is removed.
pub fn init_workspace(root: &Path, options: &InitOptions) -> Result<MaestroPaths> {
    let paths = MaestroPaths::new(root);
    if paths.maestro_dir.exists() && !options.force {
        return Err(anyhow!(
            "maestro init: .maestro already exists (use --force to overwrite)"
        ));
    }
    if paths.maestro_dir.exists() && !paths.maestro_dir.is_dir() {
        return Err(anyhow!(
            "maestro init: .maestro exists but is not a directory"
        ));
    }

    if paths.state_dir.exists() {
        fs::remove_dir_all(&paths.state_dir)
            .with_context(|| format!("remove {}", paths.state_dir.display()))?;
    }
    fs::create_dir_all(&paths.state_dir)
        .with_context(|| format!("create directory {}", paths.state_dir.display()))?;
    fs::write(&paths.gitignore_path, MAESTRO_GITIGNORE)
        .with_context(|| format!("write file {}", paths.gitignore_path.display()))?;
    write_config(&paths.config_path, &MaestroConfig::default())?;

    Ok(paths)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::config::load_config;

    #[test]
    fn init_creates_layout_with_default_config() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = init_workspace(temp.path(), &InitOptions { force: false }).expect("init");
        assert!(paths.state_dir.is_dir());
        assert!(paths.gitignore_path.is_file());
        assert_eq!(
            load_config(&paths.config_path).expect("config"),
            MaestroConfig::default()
        );
    }

    #[test]
    fn init_refuses_existing_without_force() {
        let temp = tempfile::tempdir().expect("tempdir");
        init_workspace(temp.path(), &InitOptions { force: false }).expect("first init");
        let err = init_workspace(temp.path(), &InitOptions { force: false })
            .expect_err("second init");
        assert!(err.to_string().contains("--force"));
    }

    #[test]
    fn force_clears_saved_state() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = init_workspace(temp.path(), &InitOptions { force: false }).expect("init");
        fs::write(&paths.snapshot_path, "{}").expect("write snapshot");
        init_workspace(temp.path(), &InitOptions { force: true }).expect("force init");
        assert!(!paths.snapshot_path.exists());
    }

    #[test]
    fn task_paths_live_under_tasks_dir() {
        let paths = MaestroPaths::for_task("/work", "abc");
        assert_eq!(
            paths.snapshot_path,
            PathBuf::from("/work/.maestro/tasks/abc/snapshot.json")
        );
        assert_eq!(paths.config_path, PathBuf::from("/work/.maestro/config.toml"));
    }
}
