//! Collaborator abstractions the controller delegates to.
//!
//! The controller never talks to a model or a desktop directly. Planning,
//! action generation, execution and quality evaluation sit behind the traits
//! below so the control loop can be driven by scripted doubles in tests and by
//! real backends in production.

pub mod scripted;

use serde::{Deserialize, Serialize};

use crate::core::action::ActionPayload;
use crate::core::monitor::ExecErrorKind;
use crate::core::types::GateTrigger;
use crate::model::{Command, Subtask, SubtaskDraft};
use crate::store::DataStore;

/// Why the manager is being asked to plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanScenario {
    /// Produce a fresh plan for the remaining objective.
    Replan,
    /// Gather missing information; the output notes are kept on the task.
    Supplement,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanOutput {
    #[serde(default)]
    pub subtasks: Vec<SubtaskDraft>,
    #[serde(default)]
    pub notes: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerOutput {
    /// Raw decision text; parsed into a `WorkerDecision` by the controller.
    pub decision: String,
    #[serde(default)]
    pub action: Option<ActionPayload>,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub pre_screenshot_id: Option<String>,
    #[serde(default)]
    pub pre_screenshot_analysis: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecOutcome {
    pub success: bool,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub error_kind: Option<ExecErrorKind>,
    #[serde(default)]
    pub latency_ms: Option<u64>,
}

impl ExecOutcome {
    pub fn succeeded() -> Self {
        Self {
            success: true,
            error: None,
            error_kind: None,
            latency_ms: None,
        }
    }

    pub fn failed(kind: ExecErrorKind, error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            error_kind: Some(kind),
            latency_ms: None,
        }
    }

    /// Failure category; a failure without an explicit kind counts as `Other`.
    pub fn failure_kind(&self) -> Option<ExecErrorKind> {
        if self.success {
            None
        } else {
            Some(self.error_kind.unwrap_or(ExecErrorKind::Other))
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateVerdict {
    /// Raw decision text; normalized and validated by `core::gate`.
    pub decision: String,
    #[serde(default)]
    pub notes: String,
}

pub trait Manager {
    fn plan(&mut self, store: &DataStore, scenario: PlanScenario) -> anyhow::Result<PlanOutput>;
}

pub trait Worker {
    fn process(&mut self, store: &DataStore, subtask: &Subtask) -> anyhow::Result<WorkerOutput>;
}

/// Dispatches one command. An `Err` is treated as an execution failure.
pub trait Executor {
    fn execute(&mut self, subtask: &Subtask, command: &Command) -> anyhow::Result<ExecOutcome>;
}

pub trait Evaluator {
    /// `subtask` is `None` for the task-wide final check.
    fn check(
        &mut self,
        store: &DataStore,
        trigger: GateTrigger,
        subtask: Option<&Subtask>,
    ) -> anyhow::Result<GateVerdict>;
}

/// The four collaborators one controller runs with.
pub struct Roles {
    pub manager: Box<dyn Manager + Send>,
    pub worker: Box<dyn Worker + Send>,
    pub executor: Box<dyn Executor + Send>,
    pub evaluator: Box<dyn Evaluator + Send>,
}

impl Roles {
    pub fn new(
        manager: impl Manager + Send + 'static,
        worker: impl Worker + Send + 'static,
        executor: impl Executor + Send + 'static,
        evaluator: impl Evaluator + Send + 'static,
    ) -> Self {
        Self {
            manager: Box::new(manager),
            worker: Box::new(worker),
            executor: Box::new(executor),
            evaluator: Box::new(evaluator),
        }
    }
}

impl std::fmt::Debug for Roles {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Roles").finish_non_exhaustive()
    }
}
