//! In-memory record store for a single task.
//!
//! The store is the only owner of task, subtask, command, gate check and event
//! records. Handlers mutate it through the methods below so that queue
//! membership, sequence numbers and status transitions stay consistent.

use std::fmt;

use anyhow::{Context, Result, anyhow, bail};
use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::core::types::{
    ExecStatus, GateDecision, GateTrigger, State, SubtaskStatus, TaskStatus, TriggerCode,
    TriggerRole,
};
use crate::model::{
    Command, ControllerEvent, GateCheck, NewCommand, ReasonEntry, Subtask, SubtaskDraft,
    SwitchRecord, Task,
};

/// Subtask status change that would move a subtask backwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IllegalSubtaskTransition {
    pub subtask_id: String,
    pub from: SubtaskStatus,
    pub to: SubtaskStatus,
}

impl fmt::Display for IllegalSubtaskTransition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "subtask {} cannot move from {} to {}",
            self.subtask_id, self.from, self.to
        )
    }
}

impl std::error::Error for IllegalSubtaskTransition {}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataStore {
    task: Task,
    #[serde(default)]
    subtasks: Vec<Subtask>,
    #[serde(default)]
    commands: Vec<Command>,
    #[serde(default)]
    gate_checks: Vec<GateCheck>,
    #[serde(default)]
    events: Vec<ControllerEvent>,
    next_seq: u64,
}

impl DataStore {
    pub fn new(objective: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            task: Task {
                id: uuid::Uuid::new_v4().to_string(),
                objective: objective.into(),
                status: TaskStatus::Created,
                current_subtask_id: None,
                pending_subtask_ids: Default::default(),
                history_subtask_ids: Vec::new(),
                step_num: 0,
                plan_num: 0,
                supplement_notes: Vec::new(),
                outcome_message: None,
                created_at: now,
                updated_at: now,
            },
            subtasks: Vec::new(),
            commands: Vec::new(),
            gate_checks: Vec::new(),
            events: Vec::new(),
            next_seq: 1,
        }
    }

    fn bump_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }

    fn touch(&mut self) {
        self.task.updated_at = Utc::now();
    }

    /// Sequence number the next record will receive.
    pub fn next_seq(&self) -> u64 {
        self.next_seq
    }

    // ---- task --------------------------------------------------------------

    pub fn task(&self) -> &Task {
        &self.task
    }

    pub fn set_task_status(&mut self, status: TaskStatus) {
        if self.task.status != status {
            tracing::debug!(from = %self.task.status, to = %status, "task status");
            self.task.status = status;
            self.touch();
        }
    }

    /// Set a terminal status together with the reason surfaced to callers.
    pub fn finish_task(&mut self, status: TaskStatus, message: impl Into<String>) {
        self.set_task_status(status);
        self.task.outcome_message = Some(message.into());
    }

    pub fn increment_step(&mut self) -> u32 {
        self.task.step_num += 1;
        self.touch();
        self.task.step_num
    }

    pub fn increment_plan(&mut self) -> u32 {
        self.task.plan_num += 1;
        self.touch();
        self.task.plan_num
    }

    pub fn push_supplement_note(&mut self, note: impl Into<String>) {
        self.task.supplement_notes.push(note.into());
        self.touch();
    }

    // ---- subtasks ----------------------------------------------------------

    pub fn subtasks(&self) -> &[Subtask] {
        &self.subtasks
    }

    pub fn subtask(&self, id: &str) -> Option<&Subtask> {
        self.subtasks.iter().find(|s| s.id == id)
    }

    fn subtask_mut(&mut self, id: &str) -> Result<&mut Subtask> {
        self.subtasks
            .iter_mut()
            .find(|s| s.id == id)
            .ok_or_else(|| anyhow!("unknown subtask {id}"))
    }

    pub fn current_subtask(&self) -> Option<&Subtask> {
        self.task
            .current_subtask_id
            .as_deref()
            .and_then(|id| self.subtask(id))
    }

    pub fn pending_subtasks(&self) -> impl Iterator<Item = &Subtask> {
        self.task
            .pending_subtask_ids
            .iter()
            .filter_map(|id| self.subtask(id))
    }

    pub fn has_pending_subtasks(&self) -> bool {
        !self.task.pending_subtask_ids.is_empty()
    }

    /// Append drafts to the back of the pending queue with status `ready`.
    pub fn enqueue_subtasks(&mut self, drafts: Vec<SubtaskDraft>) -> Vec<String> {
        let mut ids = Vec::with_capacity(drafts.len());
        for draft in drafts {
            let seq = self.bump_seq();
            let id = format!("subtask-{seq:04}");
            self.subtasks.push(Subtask {
                id: id.clone(),
                seq,
                task_id: self.task.id.clone(),
                title: draft.title,
                description: draft.description,
                assignee_role: draft.assignee_role,
                status: SubtaskStatus::Ready,
                attempt_no: 0,
                reasons_history: Vec::new(),
                command_trace_ids: Vec::new(),
                gate_check_ids: Vec::new(),
                last_reason_text: None,
                last_gate_decision: None,
                created_at: Utc::now(),
            });
            self.task.pending_subtask_ids.push_back(id.clone());
            ids.push(id);
        }
        self.touch();
        ids
    }

    /// Pop the head of the pending queue into `current` and mark it pending.
    ///
    /// Fails if a current subtask is still set; callers archive it first.
    pub fn advance_to_next_subtask(&mut self) -> Result<Option<String>> {
        if let Some(current) = &self.task.current_subtask_id {
            bail!("cannot advance while subtask {current} is still current");
        }
        let Some(id) = self.task.pending_subtask_ids.pop_front() else {
            return Ok(None);
        };
        self.set_subtask_status(&id, SubtaskStatus::Pending)?;
        self.task.current_subtask_id = Some(id.clone());
        self.touch();
        Ok(Some(id))
    }

    /// Move the current subtask into history. A still-pending subtask
    /// becomes stale since nothing will work on it again.
    pub fn archive_current_subtask(&mut self) -> Result<Option<String>> {
        let Some(id) = self.task.current_subtask_id.clone() else {
            return Ok(None);
        };
        if self
            .subtask(&id)
            .is_some_and(|s| s.status == SubtaskStatus::Pending)
        {
            self.set_subtask_status(&id, SubtaskStatus::Stale)?;
        }
        self.task.current_subtask_id = None;
        self.task.history_subtask_ids.push(id.clone());
        self.touch();
        Ok(Some(id))
    }

    /// Replace the whole remaining plan: archive current, stale every queued
    /// subtask, then enqueue the new drafts.
    pub fn replace_plan(&mut self, drafts: Vec<SubtaskDraft>) -> Result<Vec<String>> {
        self.archive_current_subtask()?;
        let queued: Vec<String> = self.task.pending_subtask_ids.drain(..).collect();
        for id in queued {
            self.set_subtask_status(&id, SubtaskStatus::Stale)?;
            self.task.history_subtask_ids.push(id);
        }
        Ok(self.enqueue_subtasks(drafts))
    }

    pub fn set_subtask_status(&mut self, id: &str, status: SubtaskStatus) -> Result<()> {
        let subtask = self.subtask_mut(id)?;
        if !subtask.status.can_transition_to(status) {
            return Err(IllegalSubtaskTransition {
                subtask_id: id.to_string(),
                from: subtask.status,
                to: status,
            }
            .into());
        }
        subtask.status = status;
        Ok(())
    }

    pub fn record_subtask_reason(&mut self, id: &str, text: impl Into<String>) -> Result<()> {
        let text = text.into();
        let subtask = self.subtask_mut(id)?;
        subtask.reasons_history.push(ReasonEntry {
            at: Utc::now(),
            text: text.clone(),
        });
        subtask.last_reason_text = Some(text);
        Ok(())
    }

    pub fn record_worker_attempt(&mut self, id: &str) -> Result<u32> {
        let subtask = self.subtask_mut(id)?;
        subtask.attempt_no += 1;
        Ok(subtask.attempt_no)
    }

    // ---- commands ----------------------------------------------------------

    pub fn commands(&self) -> &[Command] {
        &self.commands
    }

    pub fn command(&self, id: &str) -> Option<&Command> {
        self.commands.iter().find(|c| c.id == id)
    }

    pub fn record_command(&mut self, new: NewCommand) -> Result<String> {
        let role = self
            .subtask(&new.subtask_id)
            .map(|s| s.assignee_role)
            .ok_or_else(|| anyhow!("cannot record command for unknown subtask {}", new.subtask_id))?;
        let seq = self.bump_seq();
        let id = format!("command-{seq:04}");
        self.commands.push(Command {
            id: id.clone(),
            seq,
            task_id: self.task.id.clone(),
            subtask_id: new.subtask_id.clone(),
            assignee_role: role,
            action: new.action,
            worker_decision: new.worker_decision,
            message: new.message,
            pre_screenshot_id: new.pre_screenshot_id,
            pre_screenshot_analysis: new.pre_screenshot_analysis,
            exec_status: None,
            exec_message: None,
            is_patch: new.is_patch,
            created_at: Utc::now(),
        });
        self.subtask_mut(&new.subtask_id)?
            .command_trace_ids
            .push(id.clone());
        Ok(id)
    }

    /// Record the execution outcome. Each command executes at most once.
    pub fn update_command_exec(
        &mut self,
        id: &str,
        status: ExecStatus,
        message: Option<String>,
    ) -> Result<()> {
        let command = self
            .commands
            .iter_mut()
            .find(|c| c.id == id)
            .ok_or_else(|| anyhow!("unknown command {id}"))?;
        if command.exec_status.is_some() {
            bail!("command {id} was already executed");
        }
        command.exec_status = Some(status);
        command.exec_message = message;
        Ok(())
    }

    pub fn commands_for_subtask(&self, subtask_id: &str) -> Vec<&Command> {
        self.commands
            .iter()
            .filter(|c| c.subtask_id == subtask_id)
            .collect()
    }

    pub fn latest_command_for_subtask(&self, subtask_id: &str) -> Option<&Command> {
        self.commands
            .iter()
            .rev()
            .find(|c| c.subtask_id == subtask_id)
    }

    /// Number of commands created after `seq`, across all subtasks.
    pub fn commands_after_seq(&self, seq: u64) -> usize {
        self.commands.iter().filter(|c| c.seq > seq).count()
    }

    // ---- gate checks -------------------------------------------------------

    pub fn gate_checks(&self) -> &[GateCheck] {
        &self.gate_checks
    }

    pub fn record_gate_check(
        &mut self,
        subtask_id: Option<&str>,
        trigger: GateTrigger,
        decision: GateDecision,
        notes: impl Into<String>,
    ) -> Result<String> {
        if let Some(id) = subtask_id {
            self.subtask(id)
                .with_context(|| format!("cannot record gate check for unknown subtask {id}"))?;
        }
        let seq = self.bump_seq();
        let id = format!("gate-{seq:04}");
        self.gate_checks.push(GateCheck {
            id: id.clone(),
            seq,
            task_id: self.task.id.clone(),
            subtask_id: subtask_id.map(str::to_string),
            trigger,
            decision,
            notes: notes.into(),
            created_at: Utc::now(),
        });
        if let Some(subtask_id) = subtask_id {
            let subtask = self.subtask_mut(subtask_id)?;
            subtask.gate_check_ids.push(id.clone());
            subtask.last_gate_decision = Some(decision);
        }
        Ok(id)
    }

    pub fn latest_gate_check(&self) -> Option<&GateCheck> {
        self.gate_checks.last()
    }

    pub fn latest_gate_check_for_subtask(&self, subtask_id: &str) -> Option<&GateCheck> {
        self.gate_checks
            .iter()
            .rev()
            .find(|g| g.subtask_id.as_deref() == Some(subtask_id))
    }

    // ---- events ------------------------------------------------------------

    pub fn events(&self) -> &[ControllerEvent] {
        &self.events
    }

    pub fn events_after(&self, seq: u64) -> &[ControllerEvent] {
        let start = self.events.partition_point(|e| e.seq <= seq);
        &self.events[start..]
    }

    pub fn append_event(
        &mut self,
        module: &str,
        event_type: &str,
        message: impl Into<String>,
    ) -> u64 {
        self.push_event(module, event_type, message.into(), None)
    }

    pub fn append_switch_event(
        &mut self,
        from: State,
        to: State,
        role: TriggerRole,
        code: TriggerCode,
        details: impl Into<String>,
    ) -> u64 {
        let details = details.into();
        let message = format!("{from} -> {to} ({code})");
        self.push_event(
            "state_machine",
            "state_switch",
            message,
            Some(SwitchRecord {
                from,
                to,
                role,
                details,
                code,
            }),
        )
    }

    fn push_event(
        &mut self,
        module: &str,
        event_type: &str,
        message: String,
        switch: Option<SwitchRecord>,
    ) -> u64 {
        let seq = self.bump_seq();
        self.events.push(ControllerEvent {
            seq,
            timestamp: Utc::now(),
            module: module.to_string(),
            event_type: event_type.to_string(),
            message,
            switch,
        });
        seq
    }
}
