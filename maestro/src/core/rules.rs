//! Rule engine: guard rails evaluated after every handler.
//!
//! Rules are pure functions of the store, the current state and a clock
//! reading. Task-level rules run first and end the task; state-level rules
//! only redirect the current subtask. The first rule that fires wins.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::types::{State, SubtaskStatus, TriggerCode};
use crate::store::DataStore;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuleConfig {
    /// The task is rejected once `plan_num` exceeds this value.
    pub plan_number_limit: u32,
    /// The task is rejected once `step_num` reaches this value.
    pub max_steps: u32,
    /// Commands since the last gate check that force a periodic check.
    pub first_quality_check_min_commands: usize,
    /// Trailing identical worker actions that force a quality check.
    /// Monitor patch commands are not counted.
    pub repeated_action_min_consecutive: usize,
    /// Commands on one subtask beyond which it is rejected and replanned.
    pub replan_long_execution_threshold: usize,
    /// Optional wall-clock budget for the whole task.
    pub max_runtime_secs: Option<u64>,
}

impl Default for RuleConfig {
    fn default() -> Self {
        Self {
            plan_number_limit: 10,
            max_steps: 50,
            first_quality_check_min_commands: 5,
            repeated_action_min_consecutive: 3,
            replan_long_execution_threshold: 20,
            max_runtime_secs: None,
        }
    }
}

/// Store mutation a rule requires before the forced switch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RuleEffect {
    None,
    RejectTask,
    RejectSubtask { subtask_id: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleVerdict {
    pub state: State,
    pub code: TriggerCode,
    pub details: String,
    pub effect: RuleEffect,
}

#[derive(Debug, Clone, Default)]
pub struct RuleEngine {
    config: RuleConfig,
}

impl RuleEngine {
    pub fn new(config: RuleConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RuleConfig {
        &self.config
    }

    /// Task rules, then state rules.
    pub fn evaluate(
        &self,
        store: &DataStore,
        current: State,
        now: DateTime<Utc>,
    ) -> Option<RuleVerdict> {
        self.check_task_rules(store, current, now)
            .or_else(|| self.check_state_rules(store, current))
    }

    pub fn check_task_rules(
        &self,
        store: &DataStore,
        current: State,
        now: DateTime<Utc>,
    ) -> Option<RuleVerdict> {
        if current == State::Done {
            return None;
        }
        let task = store.task();

        if task.status.is_terminal() {
            return Some(RuleVerdict {
                state: State::Done,
                code: TriggerCode::RuleTaskCompleted,
                details: format!("task is already {}", task.status),
                effect: RuleEffect::None,
            });
        }
        if task.plan_num > self.config.plan_number_limit {
            return Some(reject_task(
                TriggerCode::RulePlanLimitExceeded,
                format!(
                    "plan count {} exceeds limit {}",
                    task.plan_num, self.config.plan_number_limit
                ),
            ));
        }
        if task.step_num >= self.config.max_steps {
            return Some(reject_task(
                TriggerCode::RuleStepLimitExceeded,
                format!(
                    "step count {} reached limit {}",
                    task.step_num, self.config.max_steps
                ),
            ));
        }
        if let Some(limit) = self.config.max_runtime_secs {
            let elapsed = (now - task.created_at).num_seconds().max(0) as u64;
            if elapsed >= limit {
                return Some(reject_task(
                    TriggerCode::RuleRuntimeExceeded,
                    format!("runtime {elapsed}s reached limit {limit}s"),
                ));
            }
        }
        None
    }

    pub fn check_state_rules(&self, store: &DataStore, current: State) -> Option<RuleVerdict> {
        if matches!(
            current,
            State::QualityCheck | State::FinalCheck | State::Done
        ) {
            return None;
        }
        let subtask = store.current_subtask()?;
        if subtask.status != SubtaskStatus::Pending {
            return None;
        }
        self.quality_check_cadence(store, &subtask.id)
            .or_else(|| self.repeated_action(store, &subtask.id))
            .or_else(|| self.long_execution(store, &subtask.id))
    }

    fn quality_check_cadence(&self, store: &DataStore, subtask_id: &str) -> Option<RuleVerdict> {
        let since_gate = match store.latest_gate_check() {
            Some(gate) => store.commands_after_seq(gate.seq),
            None => store.commands_for_subtask(subtask_id).len(),
        };
        if since_gate < self.config.first_quality_check_min_commands {
            return None;
        }
        Some(RuleVerdict {
            state: State::QualityCheck,
            code: TriggerCode::RuleQualityCheckCadence,
            details: format!("{since_gate} commands since the last quality check"),
            effect: RuleEffect::None,
        })
    }

    fn repeated_action(&self, store: &DataStore, subtask_id: &str) -> Option<RuleVerdict> {
        let n = self.config.repeated_action_min_consecutive;
        if n < 2 {
            return None;
        }
        let commands: Vec<_> = store
            .commands_for_subtask(subtask_id)
            .into_iter()
            .filter(|c| !c.is_patch)
            .collect();
        if commands.len() < n {
            return None;
        }
        let tail = &commands[commands.len() - n..];
        let first = tail[0].action.as_ref()?;
        let all_same = tail
            .iter()
            .all(|c| c.action.as_ref().is_some_and(|a| a.structurally_eq(first)));
        if !all_same {
            return None;
        }
        let newest = tail[n - 1].seq;
        if store
            .latest_gate_check_for_subtask(subtask_id)
            .is_some_and(|gate| gate.seq > newest)
        {
            return None;
        }
        Some(RuleVerdict {
            state: State::QualityCheck,
            code: TriggerCode::RuleRepeatedAction,
            details: format!("last {n} actions were identical: {first}"),
            effect: RuleEffect::None,
        })
    }

    fn long_execution(&self, store: &DataStore, subtask_id: &str) -> Option<RuleVerdict> {
        let count = store.commands_for_subtask(subtask_id).len();
        if count <= self.config.replan_long_execution_threshold {
            return None;
        }
        Some(RuleVerdict {
            state: State::Plan,
            code: TriggerCode::RuleLongExecution,
            details: format!(
                "{count} commands on {subtask_id} exceed {}",
                self.config.replan_long_execution_threshold
            ),
            effect: RuleEffect::RejectSubtask {
                subtask_id: subtask_id.to_string(),
            },
        })
    }
}

fn reject_task(code: TriggerCode, details: String) -> RuleVerdict {
    RuleVerdict {
        state: State::Done,
        code,
        details,
        effect: RuleEffect::RejectTask,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::action::{ActionPayload, HardwareAction, MouseButton};
    use crate::core::types::{AssigneeRole, GateDecision, GateTrigger, TaskStatus};
    use crate::model::{NewCommand, SubtaskDraft};

    fn click(x: i32, desc: &str) -> ActionPayload {
        ActionPayload::Hardware(HardwareAction::Click {
            x,
            y: 10,
            button: MouseButton::Left,
            clicks: 1,
            element_description: Some(desc.to_string()),
        })
    }

    fn started_store() -> (DataStore, String) {
        let mut store = DataStore::new("objective");
        store.enqueue_subtasks(vec![SubtaskDraft::new("a", AssigneeRole::Operator)]);
        let id = store
            .advance_to_next_subtask()
            .expect("advance")
            .expect("queued");
        store.set_task_status(TaskStatus::Pending);
        (store, id)
    }

    fn add_command(store: &mut DataStore, subtask_id: &str, action: ActionPayload) {
        store
            .record_command(NewCommand {
                subtask_id: subtask_id.to_string(),
                action: Some(action),
                ..NewCommand::default()
            })
            .expect("record command");
    }

    #[test]
    fn step_limit_rejects_task() {
        let (mut store, _) = started_store();
        for _ in 0..50 {
            store.increment_step();
        }
        let verdict = RuleEngine::default()
            .check_task_rules(&store, State::GetAction, Utc::now())
            .expect("rule fires");
        assert_eq!(verdict.state, State::Done);
        assert_eq!(verdict.code, TriggerCode::RuleStepLimitExceeded);
        assert_eq!(verdict.effect, RuleEffect::RejectTask);
    }

    #[test]
    fn plan_limit_fires_only_above_limit() {
        let (mut store, _) = started_store();
        let engine = RuleEngine::default();
        for _ in 0..10 {
            store.increment_plan();
        }
        assert!(
            engine
                .check_task_rules(&store, State::Plan, Utc::now())
                .is_none()
        );
        store.increment_plan();
        let verdict = engine
            .check_task_rules(&store, State::Plan, Utc::now())
            .expect("rule fires");
        assert_eq!(verdict.code, TriggerCode::RulePlanLimitExceeded);
    }

    #[test]
    fn task_rules_are_silent_in_done() {
        let (mut store, _) = started_store();
        store.set_task_status(TaskStatus::Rejected);
        assert!(
            RuleEngine::default()
                .check_task_rules(&store, State::Done, Utc::now())
                .is_none()
        );
    }

    #[test]
    fn terminal_task_outside_done_is_forced_to_done() {
        let (mut store, _) = started_store();
        store.set_task_status(TaskStatus::Fulfilled);
        let verdict = RuleEngine::default()
            .check_task_rules(&store, State::GetAction, Utc::now())
            .expect("rule fires");
        assert_eq!(verdict.code, TriggerCode::RuleTaskCompleted);
        assert_eq!(verdict.state, State::Done);
    }

    #[test]
    fn runtime_limit_uses_supplied_clock() {
        let (store, _) = started_store();
        let engine = RuleEngine::new(RuleConfig {
            max_runtime_secs: Some(60),
            ..RuleConfig::default()
        });
        let now = store.task().created_at;
        assert!(engine.check_task_rules(&store, State::GetAction, now).is_none());
        let later = now + chrono::Duration::seconds(61);
        let verdict = engine
            .check_task_rules(&store, State::GetAction, later)
            .expect("rule fires");
        assert_eq!(verdict.code, TriggerCode::RuleRuntimeExceeded);
    }

    #[test]
    fn cadence_counts_commands_since_last_gate() {
        let (mut store, id) = started_store();
        let engine = RuleEngine::default();
        for x in 0..4 {
            add_command(&mut store, &id, click(x, "b"));
        }
        assert!(engine.check_state_rules(&store, State::GetAction).is_none());
        add_command(&mut store, &id, click(99, "b"));
        let verdict = engine
            .check_state_rules(&store, State::GetAction)
            .expect("cadence fires");
        assert_eq!(verdict.code, TriggerCode::RuleQualityCheckCadence);

        store
            .record_gate_check(
                Some(&id),
                GateTrigger::PeriodicCheck,
                GateDecision::GateContinue,
                "",
            )
            .expect("gate");
        assert!(engine.check_state_rules(&store, State::GetAction).is_none());
    }

    #[test]
    fn state_rules_skip_quality_check_state() {
        let (mut store, id) = started_store();
        for x in 0..6 {
            add_command(&mut store, &id, click(x, "b"));
        }
        let engine = RuleEngine::default();
        assert!(
            engine
                .check_state_rules(&store, State::QualityCheck)
                .is_none()
        );
        assert!(engine.check_state_rules(&store, State::Done).is_none());
    }

    #[test]
    fn repeated_actions_ignore_descriptions() {
        let (mut store, id) = started_store();
        add_command(&mut store, &id, click(5, "Save"));
        add_command(&mut store, &id, click(5, "the save button"));
        add_command(&mut store, &id, click(5, "save (again)"));
        let verdict = RuleEngine::default()
            .check_state_rules(&store, State::GetAction)
            .expect("repeat fires");
        assert_eq!(verdict.code, TriggerCode::RuleRepeatedAction);
        assert_eq!(verdict.state, State::QualityCheck);
    }

    #[test]
    fn repeated_actions_skip_monitor_patches() {
        let (mut store, id) = started_store();
        add_command(&mut store, &id, click(5, "Save"));
        add_command(&mut store, &id, click(5, "Save"));
        store
            .record_command(NewCommand {
                subtask_id: id.clone(),
                action: Some(ActionPayload::Hardware(HardwareAction::Scroll {
                    x: 960,
                    y: 540,
                    clicks: -3,
                    horizontal: false,
                    element_description: None,
                })),
                is_patch: true,
                ..NewCommand::default()
            })
            .expect("patch");
        let engine = RuleEngine::default();
        assert!(engine.check_state_rules(&store, State::GetAction).is_none());

        add_command(&mut store, &id, click(5, "Save"));
        let verdict = engine
            .check_state_rules(&store, State::ExecuteAction)
            .expect("repeat fires across the patch");
        assert_eq!(verdict.code, TriggerCode::RuleRepeatedAction);
    }

    #[test]
    fn evaluate_is_pure() {
        let (mut store, id) = started_store();
        for _ in 0..3 {
            add_command(&mut store, &id, click(5, "Save"));
        }
        let before = store.clone();
        let engine = RuleEngine::default();
        let now = Utc::now();
        let first = engine.evaluate(&store, State::ExecuteAction, now);
        let second = engine.evaluate(&store, State::ExecuteAction, now);
        assert!(first.is_some());
        assert_eq!(first, second);
        assert_eq!(store, before);
    }

    #[test]
    fn repeated_rule_is_satisfied_by_a_newer_gate() {
        let (mut store, id) = started_store();
        for _ in 0..3 {
            add_command(&mut store, &id, click(5, "Save"));
        }
        store
            .record_gate_check(
                Some(&id),
                GateTrigger::PeriodicCheck,
                GateDecision::GateContinue,
                "",
            )
            .expect("gate");
        assert!(
            RuleEngine::default()
                .check_state_rules(&store, State::GetAction)
                .is_none()
        );
    }

    #[test]
    fn long_execution_rejects_subtask() {
        let (mut store, id) = started_store();
        let engine = RuleEngine::new(RuleConfig {
            first_quality_check_min_commands: 1000,
            ..RuleConfig::default()
        });
        for x in 0..21 {
            add_command(&mut store, &id, click(x, "b"));
        }
        let verdict = engine
            .check_state_rules(&store, State::GetAction)
            .expect("long execution fires");
        assert_eq!(verdict.code, TriggerCode::RuleLongExecution);
        assert_eq!(verdict.state, State::Plan);
        assert_eq!(
            verdict.effect,
            RuleEffect::RejectSubtask { subtask_id: id }
        );
    }

    #[test]
    fn no_state_rule_without_pending_current_subtask() {
        let store = DataStore::new("objective");
        assert!(
            RuleEngine::default()
                .check_state_rules(&store, State::GetAction)
                .is_none()
        );
    }
}
