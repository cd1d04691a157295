//! Records held by the [`DataStore`](crate::store::DataStore).
//!
//! Records reference each other by id only. Every record carries the
//! store-wide `seq` it was created at so "newer than" questions never depend
//! on wall-clock timestamps.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::action::ActionPayload;
use crate::core::types::{
    AssigneeRole, ExecStatus, GateDecision, GateTrigger, State, SubtaskStatus, TaskStatus,
    TriggerCode, TriggerRole, WorkerDecision,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub objective: String,
    pub status: TaskStatus,
    #[serde(default)]
    pub current_subtask_id: Option<String>,
    #[serde(default)]
    pub pending_subtask_ids: VecDeque<String>,
    #[serde(default)]
    pub history_subtask_ids: Vec<String>,
    #[serde(default)]
    pub step_num: u32,
    #[serde(default)]
    pub plan_num: u32,
    #[serde(default)]
    pub supplement_notes: Vec<String>,
    /// Human-readable reason attached when the task reaches a terminal status.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReasonEntry {
    pub at: DateTime<Utc>,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subtask {
    pub id: String,
    pub seq: u64,
    pub task_id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub assignee_role: AssigneeRole,
    pub status: SubtaskStatus,
    #[serde(default)]
    pub attempt_no: u32,
    #[serde(default)]
    pub reasons_history: Vec<ReasonEntry>,
    #[serde(default)]
    pub command_trace_ids: Vec<String>,
    #[serde(default)]
    pub gate_check_ids: Vec<String>,
    #[serde(default)]
    pub last_reason_text: Option<String>,
    #[serde(default)]
    pub last_gate_decision: Option<GateDecision>,
    pub created_at: DateTime<Utc>,
}

/// Planner output for one subtask, before the store assigns ids.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubtaskDraft {
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub assignee_role: AssigneeRole,
}

impl SubtaskDraft {
    pub fn new(title: impl Into<String>, assignee_role: AssigneeRole) -> Self {
        Self {
            title: title.into(),
            description: String::new(),
            assignee_role,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    pub id: String,
    pub seq: u64,
    pub task_id: String,
    pub subtask_id: String,
    pub assignee_role: AssigneeRole,
    #[serde(default)]
    pub action: Option<ActionPayload>,
    /// `None` when the worker's raw decision could not be parsed, or for
    /// corrective commands issued by the execution monitor.
    #[serde(default)]
    pub worker_decision: Option<WorkerDecision>,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub pre_screenshot_id: Option<String>,
    #[serde(default)]
    pub pre_screenshot_analysis: Option<String>,
    #[serde(default)]
    pub exec_status: Option<ExecStatus>,
    #[serde(default)]
    pub exec_message: Option<String>,
    #[serde(default)]
    pub is_patch: bool,
    pub created_at: DateTime<Utc>,
}

/// Input for [`DataStore::record_command`](crate::store::DataStore::record_command).
#[derive(Debug, Clone, Default)]
pub struct NewCommand {
    pub subtask_id: String,
    pub action: Option<ActionPayload>,
    pub worker_decision: Option<WorkerDecision>,
    pub message: String,
    pub pre_screenshot_id: Option<String>,
    pub pre_screenshot_analysis: Option<String>,
    pub is_patch: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateCheck {
    pub id: String,
    pub seq: u64,
    pub task_id: String,
    /// Absent for the task-wide final check.
    #[serde(default)]
    pub subtask_id: Option<String>,
    pub trigger: GateTrigger,
    pub decision: GateDecision,
    #[serde(default)]
    pub notes: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SwitchRecord {
    pub from: State,
    pub to: State,
    pub role: TriggerRole,
    pub details: String,
    pub code: TriggerCode,
}

/// Append-only audit entry. Events carrying a [`SwitchRecord`] are enough to
/// reconstruct the controller state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControllerEvent {
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    pub module: String,
    pub event_type: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub switch: Option<SwitchRecord>,
}
