//! Multi-task service: runs one controller per task on its own thread.
//!
//! Each task gets a bounded progress broadcast (slow subscribers lose the
//! oldest events and observe `Lagged`), a `watch` channel holding the latest
//! [`StatusReport`], and its own cancellation token. Tasks share only the
//! immutable configuration.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;

use anyhow::{Context, Result, anyhow};
use tokio::sync::{broadcast, watch};
use tracing::info;

use crate::controller::{CancellationToken, Controller, LoopOutcome, StatusReport, TickReport};
use crate::io::config::MaestroConfig;
use crate::io::init::MaestroPaths;
use crate::model::SubtaskDraft;
use crate::roles::Roles;
use crate::store::DataStore;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Progress {
    Tick(Box<TickReport>),
    Finished(StatusReport),
}

/// Caller-side handle for one running task.
#[derive(Debug)]
pub struct TaskHandle {
    task_id: String,
    progress_tx: broadcast::Sender<Progress>,
    progress: broadcast::Receiver<Progress>,
    status: watch::Receiver<StatusReport>,
    cancel: CancellationToken,
    thread: JoinHandle<Result<LoopOutcome>>,
}

impl TaskHandle {
    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    /// Receiver created before the task started; sees every event that fits
    /// in the queue.
    pub fn progress(&mut self) -> &mut broadcast::Receiver<Progress> {
        &mut self.progress
    }

    /// Additional receiver; only sees events sent after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<Progress> {
        self.progress_tx.subscribe()
    }

    pub fn status(&self) -> StatusReport {
        self.status.borrow().clone()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.thread.is_finished()
    }

    /// Wait for the task thread and return its loop outcome.
    pub fn join(self) -> Result<LoopOutcome> {
        self.thread
            .join()
            .map_err(|_| anyhow!("task {} thread panicked", self.task_id))?
    }
}

#[derive(Debug)]
struct TaskEntry {
    status: watch::Receiver<StatusReport>,
    cancel: CancellationToken,
}

#[derive(Debug)]
pub struct TaskService {
    config: Arc<MaestroConfig>,
    workspace: Option<PathBuf>,
    tasks: Mutex<HashMap<String, TaskEntry>>,
}

impl TaskService {
    pub fn new(config: MaestroConfig) -> Self {
        Self {
            config: Arc::new(config),
            workspace: None,
            tasks: Mutex::new(HashMap::new()),
        }
    }

    /// Persist each task under `<root>/.maestro/tasks/<task_id>/`.
    pub fn with_workspace(mut self, root: impl Into<PathBuf>) -> Self {
        self.workspace = Some(root.into());
        self
    }

    pub fn config(&self) -> &MaestroConfig {
        &self.config
    }

    /// Start a task on a dedicated thread. An empty `subtasks` list makes the
    /// controller plan from scratch.
    pub fn submit(
        &self,
        objective: impl Into<String>,
        subtasks: Vec<SubtaskDraft>,
        roles: Roles,
    ) -> Result<TaskHandle> {
        let mut store = DataStore::new(objective);
        store.enqueue_subtasks(subtasks);
        let task_id = store.task().id.clone();

        let cancel = CancellationToken::new();
        let mut controller =
            Controller::new(store, roles, &self.config).with_cancellation(cancel.clone());
        if let Some(root) = &self.workspace {
            controller = controller.persist_to(MaestroPaths::for_task(root, &task_id))?;
        }

        let (progress_tx, progress) =
            broadcast::channel(self.config.controller.progress_queue_capacity);
        let (status_tx, status) = watch::channel(controller.status());
        let max_ticks = self.config.controller.max_ticks;
        let thread_tx = progress_tx.clone();
        let thread = std::thread::Builder::new()
            .name(format!("maestro-{}", &task_id[..8.min(task_id.len())]))
            .spawn(move || {
                let outcome = controller.run_with(max_ticks, |report| {
                    status_tx.send_replace(report.status.clone());
                    // No receivers is fine; progress is best-effort.
                    let _ = thread_tx.send(Progress::Tick(Box::new(report.clone())));
                });
                let final_status = controller.status();
                status_tx.send_replace(final_status.clone());
                let _ = thread_tx.send(Progress::Finished(final_status));
                outcome
            })
            .context("spawn task thread")?;

        info!(task = %task_id, "task submitted");
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                task_id.clone(),
                TaskEntry {
                    status: status.clone(),
                    cancel: cancel.clone(),
                },
            );
        Ok(TaskHandle {
            task_id,
            progress_tx,
            progress,
            status,
            cancel,
            thread,
        })
    }

    pub fn status(&self, task_id: &str) -> Option<StatusReport> {
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(task_id)
            .map(|entry| entry.status.borrow().clone())
    }

    /// Request cancellation. Returns `false` for an unknown task id.
    pub fn cancel(&self, task_id: &str) -> bool {
        match self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(task_id)
        {
            Some(entry) => {
                entry.cancel.cancel();
                true
            }
            None => false,
        }
    }

    pub fn task_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        ids.sort();
        ids
    }
}
