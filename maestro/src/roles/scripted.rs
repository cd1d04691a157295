//! Queue-driven collaborators.
//!
//! Each scripted role replays predetermined replies in order and records the
//! calls it received. Handles are cheap clones over shared state, so a test
//! can hand one clone to the controller and keep another to inspect calls or
//! to [`ScriptHandle::assert_drained`] once the run finishes.
//!
//! The same types back `maestro run --script`, which loads a [`RoleScript`]
//! from JSON.

use std::collections::VecDeque;
use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::action::ActionPayload;
use crate::core::monitor::ExecErrorKind;
use crate::core::types::GateTrigger;
use crate::model::{Command, Subtask, SubtaskDraft};
use crate::roles::{
    Evaluator, ExecOutcome, Executor, GateVerdict, Manager, PlanOutput, PlanScenario, Roles,
    Worker, WorkerOutput,
};
use crate::store::DataStore;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScriptedPlan {
    pub subtasks: Vec<SubtaskDraft>,
    pub notes: Option<String>,
    /// Return this error instead of a plan.
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScriptedWorkerStep {
    pub decision: String,
    pub action: Option<ActionPayload>,
    pub message: String,
    pub error: Option<String>,
    /// Panic with this message instead of replying.
    pub panic: Option<String>,
    /// Sleep before replying.
    pub delay_ms: Option<u64>,
}

impl ScriptedWorkerStep {
    pub fn decide(decision: &str) -> Self {
        Self {
            decision: decision.to_string(),
            ..Self::default()
        }
    }

    pub fn act(action: ActionPayload) -> Self {
        Self {
            decision: "worker_generate_action".to_string(),
            action: Some(action),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScriptedExec {
    pub success: bool,
    pub error: Option<String>,
    pub error_kind: Option<ExecErrorKind>,
    pub latency_ms: Option<u64>,
    /// Return `Err` from the executor instead of an outcome.
    pub raise: Option<String>,
    /// Block for this long before replying.
    pub delay_ms: Option<u64>,
}

impl Default for ScriptedExec {
    fn default() -> Self {
        Self {
            success: true,
            error: None,
            error_kind: None,
            latency_ms: None,
            raise: None,
            delay_ms: None,
        }
    }
}

impl ScriptedExec {
    pub fn fail(kind: ExecErrorKind, error: &str) -> Self {
        Self {
            success: false,
            error: Some(error.to_string()),
            error_kind: Some(kind),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScriptedGate {
    pub decision: String,
    pub notes: String,
    pub error: Option<String>,
    pub delay_ms: Option<u64>,
}

impl ScriptedGate {
    pub fn decide(decision: &str) -> Self {
        Self {
            decision: decision.to_string(),
            ..Self::default()
        }
    }
}

/// One evaluator invocation as seen by the scripted evaluator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GateCall {
    pub trigger: GateTrigger,
    pub subtask_id: Option<String>,
}

#[derive(Debug)]
struct ScriptState<T, C> {
    replies: VecDeque<T>,
    calls: Vec<C>,
}

/// Shared reply queue for one scripted role.
#[derive(Debug)]
pub struct ScriptHandle<T, C> {
    role: &'static str,
    inner: Arc<Mutex<ScriptState<T, C>>>,
}

impl<T, C> Clone for ScriptHandle<T, C> {
    fn clone(&self) -> Self {
        Self {
            role: self.role,
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T, C: Clone> ScriptHandle<T, C> {
    fn with_role(role: &'static str, replies: Vec<T>) -> Self {
        Self {
            role,
            inner: Arc::new(Mutex::new(ScriptState {
                replies: replies.into(),
                calls: Vec::new(),
            })),
        }
    }

    fn next_reply(&self, call: C) -> Option<T> {
        let mut state = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        state.calls.push(call);
        state.replies.pop_front()
    }

    pub fn remaining(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replies
            .len()
    }

    pub fn calls(&self) -> Vec<C> {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .calls
            .clone()
    }

    pub fn assert_drained(&self) -> Result<()> {
        match self.remaining() {
            0 => Ok(()),
            n => Err(anyhow!("scripted {} has {n} unused replies", self.role)),
        }
    }
}

pub type ScriptedManager = ScriptHandle<ScriptedPlan, PlanScenario>;
pub type ScriptedWorker = ScriptHandle<ScriptedWorkerStep, String>;
pub type ScriptedExecutor = ScriptHandle<ScriptedExec, String>;
pub type ScriptedEvaluator = ScriptHandle<ScriptedGate, GateCall>;

impl ScriptedManager {
    pub fn new(plans: Vec<ScriptedPlan>) -> Self {
        Self::with_role("manager", plans)
    }
}

impl ScriptedWorker {
    pub fn new(steps: Vec<ScriptedWorkerStep>) -> Self {
        Self::with_role("worker", steps)
    }
}

impl ScriptedExecutor {
    /// Replies in order, then succeeds once the queue is empty.
    pub fn new(outcomes: Vec<ScriptedExec>) -> Self {
        Self::with_role("executor", outcomes)
    }
}

impl ScriptedEvaluator {
    pub fn new(verdicts: Vec<ScriptedGate>) -> Self {
        Self::with_role("evaluator", verdicts)
    }
}

fn pause(delay_ms: Option<u64>) {
    if let Some(ms) = delay_ms {
        std::thread::sleep(Duration::from_millis(ms));
    }
}

impl Manager for ScriptedManager {
    fn plan(&mut self, _store: &DataStore, scenario: PlanScenario) -> Result<PlanOutput> {
        let reply = self
            .next_reply(scenario)
            .ok_or_else(|| anyhow!("scripted manager has no reply left for {scenario:?}"))?;
        if let Some(error) = reply.error {
            return Err(anyhow!(error));
        }
        Ok(PlanOutput {
            subtasks: reply.subtasks,
            notes: reply.notes,
        })
    }
}

impl Worker for ScriptedWorker {
    fn process(&mut self, _store: &DataStore, subtask: &Subtask) -> Result<WorkerOutput> {
        let reply = self
            .next_reply(subtask.id.clone())
            .ok_or_else(|| anyhow!("scripted worker has no reply left for {}", subtask.id))?;
        pause(reply.delay_ms);
        if let Some(message) = reply.panic {
            panic!("{message}");
        }
        if let Some(error) = reply.error {
            return Err(anyhow!(error));
        }
        Ok(WorkerOutput {
            decision: reply.decision,
            action: reply.action,
            message: reply.message,
            pre_screenshot_id: None,
            pre_screenshot_analysis: None,
        })
    }
}

impl Executor for ScriptedExecutor {
    fn execute(&mut self, _subtask: &Subtask, command: &Command) -> Result<ExecOutcome> {
        let Some(reply) = self.next_reply(command.id.clone()) else {
            return Ok(ExecOutcome::succeeded());
        };
        pause(reply.delay_ms);
        if let Some(error) = reply.raise {
            return Err(anyhow!(error));
        }
        Ok(ExecOutcome {
            success: reply.success,
            error: reply.error,
            error_kind: reply.error_kind,
            latency_ms: reply.latency_ms,
        })
    }
}

impl Evaluator for ScriptedEvaluator {
    fn check(
        &mut self,
        _store: &DataStore,
        trigger: GateTrigger,
        subtask: Option<&Subtask>,
    ) -> Result<GateVerdict> {
        let call = GateCall {
            trigger,
            subtask_id: subtask.map(|s| s.id.clone()),
        };
        let reply = self
            .next_reply(call)
            .ok_or_else(|| anyhow!("scripted evaluator has no reply left for {trigger}"))?;
        pause(reply.delay_ms);
        if let Some(error) = reply.error {
            return Err(anyhow!(error));
        }
        Ok(GateVerdict {
            decision: reply.decision,
            notes: reply.notes,
        })
    }
}

/// Replies for all four roles, loadable from JSON.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoleScript {
    pub plans: Vec<ScriptedPlan>,
    pub worker: Vec<ScriptedWorkerStep>,
    pub executor: Vec<ScriptedExec>,
    pub evaluator: Vec<ScriptedGate>,
}

/// Inspection handles for a script turned into [`Roles`].
#[derive(Debug, Clone)]
pub struct ScriptHandles {
    pub manager: ScriptedManager,
    pub worker: ScriptedWorker,
    pub executor: ScriptedExecutor,
    pub evaluator: ScriptedEvaluator,
}

impl ScriptHandles {
    pub fn assert_drained(&self) -> Result<()> {
        self.manager.assert_drained()?;
        self.worker.assert_drained()?;
        self.executor.assert_drained()?;
        self.evaluator.assert_drained()
    }
}

impl RoleScript {
    pub fn load(path: &Path) -> Result<Self> {
        let contents =
            fs::read_to_string(path).with_context(|| format!("read script {}", path.display()))?;
        serde_json::from_str(&contents).with_context(|| format!("parse script {}", path.display()))
    }

    pub fn into_roles(self) -> (Roles, ScriptHandles) {
        let handles = ScriptHandles {
            manager: ScriptedManager::new(self.plans),
            worker: ScriptedWorker::new(self.worker),
            executor: ScriptedExecutor::new(self.executor),
            evaluator: ScriptedEvaluator::new(self.evaluator),
        };
        let roles = Roles::new(
            handles.manager.clone(),
            handles.worker.clone(),
            handles.executor.clone(),
            handles.evaluator.clone(),
        );
        (roles, handles)
    }
}
