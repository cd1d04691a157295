//! Loop-level harness tests for full controller lifecycle scenarios.
//!
//! These tests drive `Controller::run_with` with scripted collaborators and
//! check the state sequence, rule overrides and final task status.

use maestro::controller::{LoopStop, TickReport};
use maestro::core::invariants::validate_invariants;
use maestro::core::monitor::{ExecutionMonitor, MonitorConfig, MonitorDecision, StepObservation};
use maestro::core::types::{
    ExecStatus, GateDecision, GateTrigger, State, SubtaskStatus, TaskStatus, TriggerCode,
};
use maestro::io::config::MaestroConfig;
use maestro::roles::PlanScenario;
use maestro::roles::scripted::{
    GateCall, RoleScript, ScriptedExec, ScriptedGate, ScriptedPlan, ScriptedWorkerStep,
};
use maestro::test_support::{
    act_click, click_described, draft, scripted_controller, state_trace,
};

/// Happy path over a single subtask:
///
/// ```text
/// INIT -> GET_ACTION -> EXECUTE_ACTION -> GET_ACTION -> QUALITY_CHECK -> FINAL_CHECK -> DONE
/// ```
#[test]
fn single_subtask_runs_to_fulfilled() {
    let script = RoleScript {
        worker: vec![act_click(40), ScriptedWorkerStep::decide("worker_done")],
        evaluator: vec![
            ScriptedGate::decide("gate_done"),
            ScriptedGate::decide("gate_done"),
        ],
        ..RoleScript::default()
    };
    let (mut controller, handles) =
        scripted_controller(script, &["open the expense form"], &MaestroConfig::default());

    let mut reports: Vec<TickReport> = Vec::new();
    let outcome = controller
        .run_with(20, |r| reports.push(r.clone()))
        .expect("run");

    assert_eq!(
        state_trace(&reports),
        vec![
            State::Init,
            State::GetAction,
            State::ExecuteAction,
            State::GetAction,
            State::QualityCheck,
            State::FinalCheck,
            State::Done,
        ]
    );
    assert_eq!(outcome.stop, LoopStop::Finished(TaskStatus::Fulfilled));
    assert_eq!(outcome.status.step_num, 1);
    assert!(reports.iter().all(|r| r.rule.is_none()));
    handles.assert_drained().expect("script drained");

    let store = controller.store();
    let subtask = &store.subtasks()[0];
    assert_eq!(subtask.status, SubtaskStatus::Fulfilled);
    assert_eq!(
        handles.evaluator.calls(),
        vec![
            GateCall {
                trigger: GateTrigger::WorkerSuccess,
                subtask_id: Some(subtask.id.clone()),
            },
            GateCall {
                trigger: GateTrigger::FinalCheck,
                subtask_id: None,
            },
        ]
    );
    assert!(validate_invariants(store).is_empty());
}

#[test]
fn worker_failure_rejects_subtask_and_replans() {
    let script = RoleScript {
        worker: vec![ScriptedWorkerStep::decide("worker_fail")],
        plans: vec![ScriptedPlan {
            subtasks: vec![draft("retry via the web portal")],
            ..ScriptedPlan::default()
        }],
        ..RoleScript::default()
    };
    let (mut controller, handles) =
        scripted_controller(script, &["open the desktop client"], &MaestroConfig::default());

    let outcome = controller.execute_single_step(2).expect("two ticks");
    assert_eq!(outcome.status.current_state, State::Plan);
    assert_eq!(outcome.status.plan_num, 0);
    let first = controller.store().subtasks()[0].clone();
    assert_eq!(first.status, SubtaskStatus::Rejected);
    assert_eq!(
        controller.controller_state().last_trigger_code,
        Some(TriggerCode::WorkerFail)
    );

    let outcome = controller.execute_single_step(1).expect("plan tick");
    assert_eq!(outcome.status.plan_num, 1);
    assert_eq!(outcome.status.current_state, State::GetAction);
    let store = controller.store();
    assert!(store.task().history_subtask_ids.contains(&first.id));
    let current = store.current_subtask().expect("new current subtask");
    assert_eq!(current.title, "retry via the web portal");
    assert_eq!(handles.manager.remaining(), 0);
    assert!(validate_invariants(store).is_empty());
}

#[test]
fn fifth_command_since_last_gate_forces_quality_check() {
    let script = RoleScript {
        worker: (0..5).map(|i| act_click(100 + i * 50)).collect(),
        evaluator: vec![ScriptedGate::decide("gate_continue")],
        ..RoleScript::default()
    };
    let (mut controller, handles) =
        scripted_controller(script, &["fill in line items"], &MaestroConfig::default());

    let mut reports: Vec<TickReport> = Vec::new();
    controller
        .run_with(11, |r| reports.push(r.clone()))
        .expect("run");

    // Ticks 2, 4, 6, 8 and 10 create commands; only the fifth trips the rule.
    for report in &reports[..9] {
        assert!(report.rule.is_none(), "tick {} fired early", report.tick);
    }
    let forced = &reports[9];
    assert_eq!(forced.handler.next, State::ExecuteAction);
    let rule = forced.rule.as_ref().expect("cadence rule");
    assert_eq!(rule.code, TriggerCode::RuleQualityCheckCadence);
    assert_eq!(forced.status.current_state, State::QualityCheck);

    assert_eq!(reports[10].status.current_state, State::ExecuteAction);
    assert_eq!(
        handles.evaluator.calls()[0].trigger,
        GateTrigger::PeriodicCheck
    );
}

#[test]
fn repeated_identical_actions_force_quality_check() {
    let script = RoleScript {
        worker: vec![
            ScriptedWorkerStep::act(click_described(300, 200, "Submit button")),
            ScriptedWorkerStep::act(click_described(300, 200, "the submit button")),
            ScriptedWorkerStep::act(click_described(300, 200, "blue Submit")),
        ],
        ..RoleScript::default()
    };
    let (mut controller, _handles) =
        scripted_controller(script, &["submit the form"], &MaestroConfig::default());

    let mut reports: Vec<TickReport> = Vec::new();
    controller
        .run_with(6, |r| reports.push(r.clone()))
        .expect("run");

    // The second identical click is answered with a monitor scroll patch,
    // which does not break the run of worker actions.
    assert_eq!(reports[4].handler.code, TriggerCode::ActionPatched);
    assert!(reports[..5].iter().all(|r| r.rule.is_none()));
    let commands = controller.store().commands();
    assert_eq!(commands.len(), 4);
    assert!(commands[2].is_patch);

    let last = reports.last().expect("six ticks");
    assert_eq!(last.handler.next, State::ExecuteAction);
    assert_eq!(
        last.rule.as_ref().map(|r| r.code),
        Some(TriggerCode::RuleRepeatedAction)
    );
    assert_eq!(last.status.current_state, State::QualityCheck);
}

#[test]
fn monitor_escalates_third_identical_action_to_replan() {
    let mut monitor = ExecutionMonitor::new(MonitorConfig::default());
    let descriptions = ["Submit button", "the submit button", "blue Submit"];
    let decisions: Vec<MonitorDecision> = descriptions
        .iter()
        .enumerate()
        .map(|(i, desc)| {
            let action = click_described(300, 200, desc);
            let step_id = format!("command-{i}");
            monitor
                .classify(&StepObservation {
                    step_id: &step_id,
                    subtask_id: "subtask-0001",
                    action: Some(&action),
                    failure: None,
                    worker_failed: false,
                    latency_ms: Some(20),
                })
                .decision
        })
        .collect();
    assert_eq!(
        decisions,
        vec![
            MonitorDecision::Continue,
            MonitorDecision::Patch,
            MonitorDecision::Replan,
        ]
    );
}

#[test]
fn step_limit_rejects_task_mid_subtask() {
    let script = RoleScript {
        worker: vec![act_click(10), act_click(20)],
        ..RoleScript::default()
    };
    let mut config = MaestroConfig::default();
    config.rules.max_steps = 2;
    let (mut controller, handles) = scripted_controller(script, &["export the ledger"], &config);

    let mut reports: Vec<TickReport> = Vec::new();
    let outcome = controller
        .run_with(50, |r| reports.push(r.clone()))
        .expect("run");

    assert_eq!(outcome.stop, LoopStop::Finished(TaskStatus::Rejected));
    assert_eq!(outcome.ticks, 5);
    let last = reports.last().expect("ticks");
    assert_eq!(last.handler.next, State::GetAction);
    assert_eq!(
        last.rule.as_ref().map(|r| r.code),
        Some(TriggerCode::RuleStepLimitExceeded)
    );
    assert_eq!(outcome.status.current_state, State::Done);
    assert_eq!(outcome.status.step_num, 2);
    assert!(
        outcome
            .status
            .outcome_message
            .as_deref()
            .is_some_and(|m| m.contains("step count 2"))
    );
    handles.worker.assert_drained().expect("worker drained");
}

#[test]
fn plan_limit_rejects_task_after_repeated_empty_plans() {
    let script = RoleScript {
        plans: vec![ScriptedPlan::default(); 3],
        ..RoleScript::default()
    };
    let mut config = MaestroConfig::default();
    config.rules.plan_number_limit = 2;
    let (mut controller, handles) = scripted_controller(script, &[], &config);

    let mut reports: Vec<TickReport> = Vec::new();
    let outcome = controller
        .run_with(50, |r| reports.push(r.clone()))
        .expect("run");

    assert_eq!(outcome.stop, LoopStop::Finished(TaskStatus::Rejected));
    assert_eq!(outcome.ticks, 6);
    assert_eq!(outcome.status.plan_num, 3);
    assert_eq!(
        reports.last().and_then(|r| r.rule.as_ref()).map(|r| r.code),
        Some(TriggerCode::RulePlanLimitExceeded)
    );
    handles.assert_drained().expect("script drained");
}

#[test]
fn cancellation_between_ticks_ends_in_done() {
    let script = RoleScript {
        worker: vec![act_click(10), act_click(20)],
        ..RoleScript::default()
    };
    let (mut controller, _handles) =
        scripted_controller(script, &["print the report"], &MaestroConfig::default());
    let token = controller.cancellation_token();

    let outcome = controller
        .run_with(50, |r| {
            if r.tick == 2 {
                token.cancel();
            }
        })
        .expect("run");

    assert_eq!(outcome.stop, LoopStop::Cancelled);
    assert_eq!(outcome.ticks, 2);
    assert_eq!(outcome.status.task_status, TaskStatus::Cancelled);
    assert_eq!(outcome.status.current_state, State::Done);
    assert_eq!(outcome.status.last_trigger_code, Some(TriggerCode::Cancelled));
}

#[test]
fn slow_worker_times_out_and_recovers_to_plan() {
    let script = RoleScript {
        worker: vec![ScriptedWorkerStep {
            delay_ms: Some(1_200),
            ..ScriptedWorkerStep::decide("worker_done")
        }],
        ..RoleScript::default()
    };
    let mut config = MaestroConfig::default();
    config.controller.handler_timeout_secs = 1;
    let (mut controller, _handles) = scripted_controller(script, &["wait for sync"], &config);

    let outcome = controller.execute_single_step(2).expect("two ticks");
    assert_eq!(outcome.status.current_state, State::Plan);
    assert_eq!(outcome.status.last_trigger_code, Some(TriggerCode::HandlerTimeout));
    assert!(
        controller
            .store()
            .events()
            .iter()
            .any(|e| e.event_type == "handler_error")
    );
    // The late reply was discarded, so no command was recorded.
    assert!(controller.store().commands().is_empty());
}

#[test]
fn panicking_worker_recovers_to_plan() {
    let script = RoleScript {
        worker: vec![ScriptedWorkerStep {
            panic: Some("screen capture crashed".to_string()),
            ..ScriptedWorkerStep::default()
        }],
        plans: vec![ScriptedPlan {
            subtasks: vec![draft("restart the capture service")],
            ..ScriptedPlan::default()
        }],
        ..RoleScript::default()
    };
    let (mut controller, _handles) =
        scripted_controller(script, &["capture the screen"], &MaestroConfig::default());

    let outcome = controller.execute_single_step(3).expect("three ticks");
    assert_eq!(outcome.status.current_state, State::GetAction);
    assert_eq!(outcome.status.plan_num, 1);
    let error = controller
        .store()
        .events()
        .iter()
        .find(|e| e.event_type == "handler_error")
        .expect("handler_error event");
    assert!(error.message.contains("screen capture crashed"));
    assert!(validate_invariants(controller.store()).is_empty());
}

#[test]
fn gate_decision_outside_allow_list_is_treated_as_fail() {
    let script = RoleScript {
        worker: vec![ScriptedWorkerStep::decide("worker_done")],
        evaluator: vec![ScriptedGate::decide("gate_continue")],
        ..RoleScript::default()
    };
    let (mut controller, _handles) =
        scripted_controller(script, &["check totals"], &MaestroConfig::default());

    let outcome = controller.execute_single_step(3).expect("three ticks");
    assert_eq!(outcome.status.current_state, State::Plan);
    assert_eq!(
        outcome.status.last_trigger_code,
        Some(TriggerCode::GateDecisionInvalid)
    );
    let store = controller.store();
    let gate = store.latest_gate_check().expect("gate recorded");
    assert_eq!(gate.trigger, GateTrigger::WorkerSuccess);
    assert!(gate.notes.contains("invalid gate decision"));
    assert!(validate_invariants(store).is_empty());
}

#[test]
fn slow_executor_cannot_run_past_step_limit() {
    let script = RoleScript {
        worker: vec![act_click(10)],
        executor: vec![ScriptedExec {
            delay_ms: Some(1_200),
            ..ScriptedExec::default()
        }],
        ..RoleScript::default()
    };
    let mut config = MaestroConfig::default();
    config.rules.max_steps = 1;
    config.controller.handler_timeout_secs = 1;
    let (mut controller, _handles) = scripted_controller(script, &["print the invoice"], &config);

    let mut reports: Vec<TickReport> = Vec::new();
    let outcome = controller
        .run_with(10, |r| reports.push(r.clone()))
        .expect("run");

    assert_eq!(outcome.stop, LoopStop::Finished(TaskStatus::Rejected));
    assert_eq!(outcome.ticks, 3);
    assert_eq!(outcome.status.step_num, 1);
    let last = reports.last().expect("ticks");
    assert_eq!(last.handler.code, TriggerCode::HandlerTimeout);
    assert_eq!(
        last.rule.as_ref().map(|r| r.code),
        Some(TriggerCode::RuleStepLimitExceeded)
    );
    assert_eq!(
        controller.store().commands()[0].exec_status,
        Some(ExecStatus::Error)
    );
}

/// ```text
/// INIT -> GET_ACTION -> SUPPLEMENT -> PLAN -> GET_ACTION
/// ```
#[test]
fn worker_supplement_collects_notes_then_replans() {
    let script = RoleScript {
        worker: vec![ScriptedWorkerStep {
            message: "which cost centre?".to_string(),
            ..ScriptedWorkerStep::decide("worker_supplement")
        }],
        plans: vec![
            ScriptedPlan {
                notes: Some("cost centre is 4410".to_string()),
                ..ScriptedPlan::default()
            },
            ScriptedPlan {
                subtasks: vec![draft("enter cost centre 4410")],
                ..ScriptedPlan::default()
            },
        ],
        ..RoleScript::default()
    };
    let (mut controller, handles) =
        scripted_controller(script, &["file the receipt"], &MaestroConfig::default());

    let mut reports: Vec<TickReport> = Vec::new();
    let outcome = controller
        .run_with(4, |r| reports.push(r.clone()))
        .expect("run");

    assert_eq!(
        state_trace(&reports),
        vec![
            State::Init,
            State::GetAction,
            State::Supplement,
            State::Plan,
            State::GetAction,
        ]
    );
    assert_eq!(reports[2].handler.code, TriggerCode::SupplementCollected);
    assert_eq!(outcome.status.plan_num, 2);
    let store = controller.store();
    assert_eq!(store.task().supplement_notes, vec!["cost centre is 4410".to_string()]);
    assert_eq!(
        store.current_subtask().map(|s| s.title.as_str()),
        Some("enter cost centre 4410")
    );
    assert_eq!(
        handles.manager.calls(),
        vec![PlanScenario::Supplement, PlanScenario::Replan]
    );
    assert!(validate_invariants(store).is_empty());
}

#[test]
fn failed_supplement_still_moves_on_to_plan() {
    let script = RoleScript {
        worker: vec![ScriptedWorkerStep::decide("worker_supplement")],
        plans: vec![ScriptedPlan {
            error: Some("knowledge base unavailable".to_string()),
            ..ScriptedPlan::default()
        }],
        ..RoleScript::default()
    };
    let (mut controller, _handles) =
        scripted_controller(script, &["file the receipt"], &MaestroConfig::default());

    let mut reports: Vec<TickReport> = Vec::new();
    controller
        .run_with(3, |r| reports.push(r.clone()))
        .expect("run");

    let supplement = &reports[2];
    assert_eq!(supplement.from, State::Supplement);
    assert_eq!(supplement.handler.code, TriggerCode::SupplementError);
    assert_eq!(supplement.status.current_state, State::Plan);
    let store = controller.store();
    assert!(store.task().supplement_notes.is_empty());
    assert!(
        store
            .events()
            .iter()
            .any(|e| e.event_type == "supplement_error"
                && e.message.contains("knowledge base unavailable"))
    );
}

/// ```text
/// GET_ACTION -(stale)-> QUALITY_CHECK -(continue)-> EXECUTE_ACTION -> GET_ACTION
///            -(stale)-> QUALITY_CHECK -(supplement)-> SUPPLEMENT
/// ```
#[test]
fn stale_progress_is_checked_as_worker_stale() {
    let script = RoleScript {
        worker: vec![
            ScriptedWorkerStep::decide("worker_stale_progress"),
            ScriptedWorkerStep::decide("worker_stale_progress"),
        ],
        evaluator: vec![
            ScriptedGate::decide("gate_continue"),
            ScriptedGate::decide("gate_supplement"),
        ],
        ..RoleScript::default()
    };
    let (mut controller, handles) =
        scripted_controller(script, &["wait for the upload"], &MaestroConfig::default());

    let mut reports: Vec<TickReport> = Vec::new();
    controller
        .run_with(6, |r| reports.push(r.clone()))
        .expect("run");

    assert_eq!(
        state_trace(&reports),
        vec![
            State::Init,
            State::GetAction,
            State::QualityCheck,
            State::ExecuteAction,
            State::GetAction,
            State::QualityCheck,
            State::Supplement,
        ]
    );
    assert_eq!(reports[2].handler.code, TriggerCode::GateContinue);
    assert_eq!(reports[3].handler.code, TriggerCode::NoPendingAction);
    assert_eq!(reports[5].handler.code, TriggerCode::GateSupplement);
    assert!(reports.iter().all(|r| r.rule.is_none()));
    assert!(
        handles
            .evaluator
            .calls()
            .iter()
            .all(|c| c.trigger == GateTrigger::WorkerStale)
    );
    assert_eq!(controller.store().task().step_num, 0);
    handles.assert_drained().expect("script drained");
}

#[test]
fn gate_fail_rejects_subtask_and_replans() {
    let script = RoleScript {
        worker: vec![act_click(40), ScriptedWorkerStep::decide("worker_done")],
        evaluator: vec![ScriptedGate {
            notes: "totals do not match".to_string(),
            ..ScriptedGate::decide("gate_fail")
        }],
        plans: vec![ScriptedPlan {
            subtasks: vec![draft("recompute the totals")],
            ..ScriptedPlan::default()
        }],
        ..RoleScript::default()
    };
    let (mut controller, handles) =
        scripted_controller(script, &["reconcile the ledger"], &MaestroConfig::default());

    let mut reports: Vec<TickReport> = Vec::new();
    controller
        .run_with(6, |r| reports.push(r.clone()))
        .expect("run");

    let gate = &reports[4];
    assert_eq!(gate.from, State::QualityCheck);
    assert_eq!(gate.handler.code, TriggerCode::GateFail);
    assert_eq!(gate.status.current_state, State::Plan);
    assert_eq!(reports[5].status.current_state, State::GetAction);

    let store = controller.store();
    let first = &store.subtasks()[0];
    assert_eq!(first.status, SubtaskStatus::Rejected);
    assert!(
        first
            .last_reason_text
            .as_deref()
            .is_some_and(|r| r.contains("totals do not match"))
    );
    assert_eq!(store.gate_checks()[0].decision, GateDecision::GateFail);
    assert_eq!(
        store.current_subtask().map(|s| s.title.as_str()),
        Some("recompute the totals")
    );
    handles.assert_drained().expect("script drained");
    assert!(validate_invariants(store).is_empty());
}

#[test]
fn long_running_subtask_is_rejected_by_rule() {
    let script = RoleScript {
        worker: vec![act_click(10), act_click(60), act_click(110)],
        ..RoleScript::default()
    };
    let mut config = MaestroConfig::default();
    config.rules.replan_long_execution_threshold = 2;
    let (mut controller, _handles) = scripted_controller(script, &["scan the archive"], &config);

    let mut reports: Vec<TickReport> = Vec::new();
    controller
        .run_with(6, |r| reports.push(r.clone()))
        .expect("run");

    assert!(reports[..5].iter().all(|r| r.rule.is_none()));
    let last = &reports[5];
    assert_eq!(last.handler.next, State::ExecuteAction);
    assert_eq!(
        last.rule.as_ref().map(|r| r.code),
        Some(TriggerCode::RuleLongExecution)
    );
    assert_eq!(last.status.current_state, State::Plan);
    assert_eq!(
        controller.store().subtasks()[0].status,
        SubtaskStatus::Rejected
    );
}
