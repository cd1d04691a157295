//! Controller state and the single place where it changes.
//!
//! Handlers and rules never assign the current state directly. They produce a
//! [`Transition`] and the [`StateMachine`] applies it, updating the trigger
//! fields and appending a `state_switch` event to the store. Those events are
//! sufficient to rebuild the controller state with [`replay_controller_state`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::core::rules::{RuleEffect, RuleEngine, RuleVerdict};
use crate::core::types::{State, SubtaskStatus, TaskStatus, TriggerCode, TriggerRole};
use crate::model::ControllerEvent;
use crate::store::DataStore;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControllerState {
    pub current_state: State,
    pub state_start_time: DateTime<Utc>,
    pub state_switch_count: u64,
    #[serde(default)]
    pub last_trigger_role: Option<TriggerRole>,
    #[serde(default)]
    pub last_trigger_details: Option<String>,
    #[serde(default)]
    pub last_trigger_code: Option<TriggerCode>,
}

impl Default for ControllerState {
    fn default() -> Self {
        Self {
            current_state: State::Init,
            state_start_time: Utc::now(),
            state_switch_count: 0,
            last_trigger_role: None,
            last_trigger_details: None,
            last_trigger_code: None,
        }
    }
}

/// Requested move to `next`, with the audit fields recorded on the switch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transition {
    pub next: State,
    pub role: TriggerRole,
    pub code: TriggerCode,
    pub details: String,
}

impl Transition {
    pub fn new(next: State, role: TriggerRole, code: TriggerCode, details: impl Into<String>) -> Self {
        Self {
            next,
            role,
            code,
            details: details.into(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct StateMachine {
    state: ControllerState,
}

impl StateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_state(state: ControllerState) -> Self {
        Self { state }
    }

    pub fn current_state(&self) -> State {
        self.state.current_state
    }

    pub fn controller_state(&self) -> &ControllerState {
        &self.state
    }

    /// Return to `INIT` with a zeroed switch counter.
    pub fn reset(&mut self) {
        self.state = ControllerState::default();
    }

    /// Apply a transition. Returns `false` (and records nothing) when the
    /// target equals the current state.
    pub fn switch(&mut self, store: &mut DataStore, transition: &Transition) -> bool {
        let from = self.state.current_state;
        if transition.next == from {
            debug!(state = %from, code = %transition.code, "switch to same state ignored");
            return false;
        }
        store.append_switch_event(
            from,
            transition.next,
            transition.role,
            transition.code,
            transition.details.clone(),
        );
        self.state.current_state = transition.next;
        self.state.state_start_time = Utc::now();
        self.state.state_switch_count += 1;
        self.state.last_trigger_role = Some(transition.role);
        self.state.last_trigger_code = Some(transition.code);
        self.state.last_trigger_details = Some(transition.details.clone());
        info!(
            from = %from,
            to = %transition.next,
            role = %transition.role,
            code = %transition.code,
            "state switch"
        );
        true
    }

    /// Evaluate the rule engine against the post-handler state and apply the
    /// first verdict, if any. A rule always wins over the handler's choice.
    pub fn apply_rules(
        &mut self,
        store: &mut DataStore,
        rules: &RuleEngine,
        now: DateTime<Utc>,
    ) -> Option<RuleVerdict> {
        let verdict = rules.evaluate(store, self.state.current_state, now)?;
        match &verdict.effect {
            RuleEffect::None => {}
            RuleEffect::RejectTask => {
                let mut message = verdict.details.clone();
                if let Some(gate) = store.latest_gate_check() {
                    if !gate.notes.is_empty() {
                        message = format!("{message}; last gate notes: {}", gate.notes);
                    }
                }
                store.finish_task(TaskStatus::Rejected, message);
            }
            RuleEffect::RejectSubtask { subtask_id } => {
                let applied = store
                    .set_subtask_status(subtask_id, SubtaskStatus::Rejected)
                    .and_then(|()| store.record_subtask_reason(subtask_id, verdict.details.clone()));
                if let Err(err) = applied {
                    tracing::warn!(subtask = %subtask_id, error = %err, "rule effect not applied");
                }
            }
        }
        store.append_event(
            "rules",
            "rule_fired",
            format!("{}: {}", verdict.code, verdict.details),
        );
        self.switch(
            store,
            &Transition::new(
                verdict.state,
                TriggerRole::Rule,
                verdict.code,
                verdict.details.clone(),
            ),
        );
        Some(verdict)
    }

    pub fn should_exit_loop(&self, store: &DataStore) -> bool {
        store.task().status.ends_loop()
    }
}

/// Rebuild the controller state by folding `state_switch` events in order.
///
/// Returns `None` when the log holds no switch events. `state_start_time` is
/// taken from the last switch event's timestamp.
pub fn replay_controller_state(events: &[ControllerEvent]) -> Option<ControllerState> {
    let mut state: Option<ControllerState> = None;
    for event in events {
        let Some(switch) = &event.switch else {
            continue;
        };
        let current = state.get_or_insert_with(|| ControllerState {
            current_state: switch.from,
            state_start_time: event.timestamp,
            ..ControllerState::default()
        });
        current.current_state = switch.to;
        current.state_start_time = event.timestamp;
        current.state_switch_count += 1;
        current.last_trigger_role = Some(switch.role);
        current.last_trigger_code = Some(switch.code);
        current.last_trigger_details = Some(switch.details.clone());
    }
    state
}
