//! Per-state handlers and the table that dispatches them.
//!
//! A handler does the work of exactly one state and returns the
//! [`Transition`] it wants. Handlers never switch state themselves; the
//! controller applies the transition and then lets the rule engine override
//! it. A handler that fails, times out or panics is turned into a recovery
//! transition by [`HandlerTable::dispatch`], so one bad tick never stops the
//! loop.

use std::collections::BTreeMap;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::time::{Duration, Instant};

use anyhow::{Result, anyhow};
use tracing::{debug, instrument, warn};

use crate::controller::ControllerConfig;
use crate::core::action::ActionPayload;
use crate::core::budget::{CollaboratorTimeout, run_bounded};
use crate::core::gate;
use crate::core::monitor::{ExecErrorKind, ExecutionMonitor, Resolution, StepObservation};
use crate::core::types::{
    ExecStatus, GateDecision, GateTrigger, State, SubtaskStatus, TaskStatus, TriggerCode,
    TriggerRole, WorkerDecision,
};
use crate::model::{Command, NewCommand, Subtask};
use crate::roles::{ExecOutcome, PlanScenario, Roles};
use crate::state_machine::{ControllerState, Transition};
use crate::store::DataStore;

/// The state requires a current subtask but none is set or it is not pending.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MissingCurrentSubtask {
    pub state: State,
}

impl fmt::Display for MissingCurrentSubtask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} requires a pending current subtask", self.state)
    }
}

impl std::error::Error for MissingCurrentSubtask {}

/// Everything a handler may read or mutate during one tick.
pub struct HandlerContext<'a> {
    pub store: &'a mut DataStore,
    pub roles: &'a mut Roles,
    pub monitor: &'a mut ExecutionMonitor,
    pub config: &'a ControllerConfig,
    pub controller: &'a ControllerState,
}

impl HandlerContext<'_> {
    fn timeout(&self) -> Duration {
        Duration::from_secs(self.config.handler_timeout_secs)
    }
}

pub type HandlerFn = fn(&mut HandlerContext<'_>) -> Result<Transition>;

/// State-to-handler mapping. Defaults to the standard handler set.
#[derive(Clone)]
pub struct HandlerTable {
    handlers: BTreeMap<State, HandlerFn>,
}

impl fmt::Debug for HandlerTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.handlers.keys()).finish()
    }
}

impl Default for HandlerTable {
    fn default() -> Self {
        let mut handlers: BTreeMap<State, HandlerFn> = BTreeMap::new();
        handlers.insert(State::Init, handle_init);
        handlers.insert(State::GetAction, handle_get_action);
        handlers.insert(State::ExecuteAction, handle_execute_action);
        handlers.insert(State::QualityCheck, handle_quality_check);
        handlers.insert(State::Plan, handle_plan);
        handlers.insert(State::Supplement, handle_supplement);
        handlers.insert(State::FinalCheck, handle_final_check);
        handlers.insert(State::Done, handle_done);
        Self { handlers }
    }
}

impl HandlerTable {
    /// Replace the handler for `state`, returning the previous one.
    pub fn register(&mut self, state: State, handler: HandlerFn) -> Option<HandlerFn> {
        self.handlers.insert(state, handler)
    }

    /// Run the handler for `state`. Never fails: errors become recovery
    /// transitions and are recorded as `handler_error` events.
    #[instrument(skip_all, fields(state = %state))]
    pub fn dispatch(&self, state: State, ctx: &mut HandlerContext<'_>) -> Transition {
        let Some(handler) = self.handlers.get(&state).copied() else {
            let err = anyhow!("no handler registered for {state}");
            return recover(state, ctx.store, &err, TriggerCode::MissingHandler);
        };
        match catch_unwind(AssertUnwindSafe(|| handler(ctx))) {
            Ok(Ok(transition)) => transition,
            Ok(Err(err)) => {
                let code = if err.downcast_ref::<CollaboratorTimeout>().is_some() {
                    TriggerCode::HandlerTimeout
                } else if err.downcast_ref::<MissingCurrentSubtask>().is_some() {
                    TriggerCode::MissingCurrentSubtask
                } else {
                    TriggerCode::HandlerError
                };
                recover(state, ctx.store, &err, code)
            }
            Err(payload) => {
                let message = payload
                    .downcast_ref::<String>()
                    .cloned()
                    .or_else(|| payload.downcast_ref::<&str>().map(|s| (*s).to_string()))
                    .unwrap_or_else(|| "non-string panic payload".to_string());
                let err = anyhow!("handler panicked: {message}");
                recover(state, ctx.store, &err, TriggerCode::HandlerPanic)
            }
        }
    }
}

/// PLAN recovers to INIT so a broken planner cannot loop on itself; every
/// other state recovers to PLAN.
fn recover(state: State, store: &mut DataStore, err: &anyhow::Error, code: TriggerCode) -> Transition {
    let next = if state == State::Plan {
        State::Init
    } else {
        State::Plan
    };
    let subtask = store
        .task()
        .current_subtask_id
        .clone()
        .unwrap_or_else(|| "-".to_string());
    let details = format!("{state} failed on subtask {subtask}: {err:#}");
    warn!(state = %state, code = %code, error = %format!("{err:#}"), "handler failed; recovering");
    store.append_event("handlers", "handler_error", details.clone());
    Transition::new(next, TriggerRole::Controller, code, details)
}

fn current_pending_subtask(store: &DataStore, state: State) -> Result<Subtask> {
    store
        .current_subtask()
        .filter(|s| s.status == SubtaskStatus::Pending)
        .cloned()
        .ok_or_else(|| MissingCurrentSubtask { state }.into())
}

// ---- INIT -------------------------------------------------------------------

pub fn handle_init(ctx: &mut HandlerContext<'_>) -> Result<Transition> {
    if let Some(current) = ctx.store.current_subtask() {
        if current.status == SubtaskStatus::Pending {
            let details = format!("resuming {}", current.id);
            return Ok(Transition::new(
                State::GetAction,
                TriggerRole::Controller,
                TriggerCode::ResumeCurrentSubtask,
                details,
            ));
        }
        ctx.store.archive_current_subtask()?;
    }
    match ctx.store.advance_to_next_subtask()? {
        Some(id) => {
            ctx.store.set_task_status(TaskStatus::Pending);
            Ok(Transition::new(
                State::GetAction,
                TriggerRole::Controller,
                TriggerCode::SubtaskAdvanced,
                format!("advanced to {id}"),
            ))
        }
        None => Ok(Transition::new(
            State::Plan,
            TriggerRole::Controller,
            TriggerCode::NoPendingSubtasks,
            "no pending subtasks",
        )),
    }
}

// ---- GET_ACTION -------------------------------------------------------------

#[instrument(skip_all)]
pub fn handle_get_action(ctx: &mut HandlerContext<'_>) -> Result<Transition> {
    let subtask = current_pending_subtask(ctx.store, State::GetAction)?;
    ctx.store.record_worker_attempt(&subtask.id)?;
    let timeout = ctx.timeout();
    let store: &DataStore = ctx.store;
    let worker = &mut ctx.roles.worker;
    let output = run_bounded(TriggerRole::Worker, timeout, || {
        worker.process(store, &subtask)
    })?;

    let decision = output.decision.parse::<WorkerDecision>().ok();
    let command_id = ctx.store.record_command(NewCommand {
        subtask_id: subtask.id.clone(),
        action: output.action.clone(),
        worker_decision: decision,
        message: output.message.clone(),
        pre_screenshot_id: output.pre_screenshot_id.clone(),
        pre_screenshot_analysis: output.pre_screenshot_analysis.clone(),
        is_patch: false,
    })?;
    debug!(subtask = %subtask.id, command = %command_id, decision = ?decision, "worker replied");

    let reason = |prefix: &str| {
        if output.message.is_empty() {
            prefix.to_string()
        } else {
            format!("{prefix}: {}", output.message)
        }
    };
    let transition = match decision {
        Some(WorkerDecision::WorkerGenerateAction) => Transition::new(
            State::ExecuteAction,
            TriggerRole::Worker,
            TriggerCode::WorkerGenerateAction,
            format!("{command_id} ready for execution"),
        ),
        Some(WorkerDecision::WorkerDone) => Transition::new(
            State::QualityCheck,
            TriggerRole::Worker,
            TriggerCode::WorkerDone,
            reason("worker reports subtask done"),
        ),
        Some(WorkerDecision::WorkerStaleProgress) => {
            let text = reason("worker reports stale progress");
            ctx.store.record_subtask_reason(&subtask.id, text.clone())?;
            Transition::new(
                State::QualityCheck,
                TriggerRole::Worker,
                TriggerCode::WorkerStaleProgress,
                text,
            )
        }
        Some(WorkerDecision::WorkerSupplement) => {
            let text = reason("worker needs more information");
            ctx.store.record_subtask_reason(&subtask.id, text.clone())?;
            Transition::new(
                State::Supplement,
                TriggerRole::Worker,
                TriggerCode::WorkerSupplement,
                text,
            )
        }
        Some(WorkerDecision::WorkerFail) => {
            let text = reason("worker failed");
            ctx.store.record_subtask_reason(&subtask.id, text.clone())?;
            ctx.store
                .set_subtask_status(&subtask.id, SubtaskStatus::Rejected)?;
            let classification = ctx.monitor.classify(&StepObservation {
                step_id: &command_id,
                subtask_id: &subtask.id,
                action: None,
                failure: None,
                worker_failed: true,
                latency_ms: None,
            });
            debug!(decision = ?classification.decision, "monitor on worker failure");
            Transition::new(
                State::Plan,
                TriggerRole::Worker,
                TriggerCode::WorkerFail,
                format!("{text} (monitor: {})", classification.reason),
            )
        }
        None => {
            let text = format!("unrecognized worker decision '{}'", output.decision);
            ctx.store.record_subtask_reason(&subtask.id, text.clone())?;
            Transition::new(
                State::Plan,
                TriggerRole::Worker,
                TriggerCode::WorkerNoDecision,
                text,
            )
        }
    };
    Ok(transition)
}

// ---- EXECUTE_ACTION ---------------------------------------------------------

/// Dispatch one command and record its outcome. Executor errors and role
/// mismatches become failed outcomes; only a timeout propagates as a handler
/// error, after the step is counted and the command marked as failed. A
/// mismatched payload is never sent and does not count as a step.
fn dispatch_command(
    ctx: &mut HandlerContext<'_>,
    subtask: &Subtask,
    command: &Command,
    action: &ActionPayload,
) -> Result<(ExecOutcome, u64)> {
    if let Err(mismatch) = action.check_role(subtask.assignee_role) {
        let outcome = ExecOutcome::failed(ExecErrorKind::Other, mismatch.to_string());
        ctx.store
            .update_command_exec(&command.id, ExecStatus::Error, outcome.error.clone())?;
        return Ok((outcome, 0));
    }
    let timeout = ctx.timeout();
    let executor = &mut ctx.roles.executor;
    let started = Instant::now();
    let result = run_bounded(TriggerRole::Executor, timeout, || {
        Ok(executor
            .execute(subtask, command)
            .unwrap_or_else(|err| ExecOutcome::failed(ExecErrorKind::Other, format!("{err:#}"))))
    });
    let outcome = match result {
        Ok(outcome) => outcome,
        Err(err) => {
            // A late executor still ran the action.
            if err.downcast_ref::<CollaboratorTimeout>().is_some() {
                ctx.store.increment_step();
                ctx.store
                    .update_command_exec(&command.id, ExecStatus::Error, Some(format!("{err:#}")))?;
            }
            return Err(err);
        }
    };
    let measured = started.elapsed().as_millis() as u64;
    let latency = outcome.latency_ms.unwrap_or(measured);
    let status = if outcome.success {
        ExecStatus::Success
    } else {
        ExecStatus::Error
    };
    ctx.store.increment_step();
    ctx.store
        .update_command_exec(&command.id, status, outcome.error.clone())?;
    Ok((outcome, latency))
}

#[instrument(skip_all)]
pub fn handle_execute_action(ctx: &mut HandlerContext<'_>) -> Result<Transition> {
    let subtask = current_pending_subtask(ctx.store, State::ExecuteAction)?;
    let pending = ctx
        .store
        .latest_command_for_subtask(&subtask.id)
        .filter(|c| c.exec_status.is_none())
        .and_then(|c| c.action.clone().map(|action| (c.clone(), action)));
    let Some((command, action)) = pending else {
        return Ok(Transition::new(
            State::GetAction,
            TriggerRole::Controller,
            TriggerCode::NoPendingAction,
            format!("no unexecuted action for {}", subtask.id),
        ));
    };

    let (outcome, latency) = dispatch_command(ctx, &subtask, &command, &action)?;
    let observation = StepObservation {
        step_id: &command.id,
        subtask_id: &subtask.id,
        action: Some(&action),
        failure: outcome.failure_kind(),
        worker_failed: false,
        latency_ms: Some(latency),
    };
    let classification = ctx.monitor.classify(&observation);
    debug!(command = %command.id, decision = ?classification.decision, reason = %classification.reason, "monitor");

    match ctx.monitor.resolve(classification, &observation) {
        Resolution::Continue => {
            let (code, details) = if outcome.success {
                (TriggerCode::ActionExecuted, format!("{} executed: {action}", command.id))
            } else {
                (
                    TriggerCode::ExecutionFailed,
                    format!(
                        "{} failed: {}",
                        command.id,
                        outcome.error.as_deref().unwrap_or("unknown error")
                    ),
                )
            };
            Ok(Transition::new(State::GetAction, TriggerRole::Executor, code, details))
        }
        Resolution::Patch { action: patch, reason } => {
            let patch_payload = ActionPayload::Hardware(patch);
            let patch_id = ctx.store.record_command(NewCommand {
                subtask_id: subtask.id.clone(),
                action: Some(patch_payload.clone()),
                worker_decision: None,
                message: format!("monitor patch: {reason}"),
                is_patch: true,
                ..NewCommand::default()
            })?;
            let patch_command = ctx
                .store
                .command(&patch_id)
                .cloned()
                .ok_or_else(|| anyhow!("patch command {patch_id} missing after insert"))?;
            let (patch_outcome, _) = dispatch_command(ctx, &subtask, &patch_command, &patch_payload)?;
            Ok(Transition::new(
                State::GetAction,
                TriggerRole::Monitor,
                TriggerCode::ActionPatched,
                format!(
                    "{reason}; applied {patch_payload} ({})",
                    if patch_outcome.success { "ok" } else { "failed" }
                ),
            ))
        }
        Resolution::Replan { reason } => Ok(Transition::new(
            State::Plan,
            TriggerRole::Monitor,
            TriggerCode::MonitorReplan,
            reason,
        )),
    }
}

// ---- QUALITY_CHECK ----------------------------------------------------------

/// Trigger scene implied by the code that led into the quality check.
pub fn gate_trigger_for(code: Option<TriggerCode>) -> GateTrigger {
    match code {
        Some(TriggerCode::WorkerDone) => GateTrigger::WorkerSuccess,
        Some(TriggerCode::WorkerStaleProgress) => GateTrigger::WorkerStale,
        _ => GateTrigger::PeriodicCheck,
    }
}

fn gate_notes(notes: &str, violation: Option<&gate::GateContractViolation>) -> String {
    match violation {
        Some(violation) if notes.is_empty() => format!("invalid gate decision: {violation}"),
        Some(violation) => format!("{notes} (invalid gate decision: {violation})"),
        None => notes.to_string(),
    }
}

#[instrument(skip_all)]
pub fn handle_quality_check(ctx: &mut HandlerContext<'_>) -> Result<Transition> {
    let subtask = current_pending_subtask(ctx.store, State::QualityCheck)?;
    let trigger = gate_trigger_for(ctx.controller.last_trigger_code);
    let timeout = ctx.timeout();
    let store: &DataStore = ctx.store;
    let evaluator = &mut ctx.roles.evaluator;
    let verdict = run_bounded(TriggerRole::Evaluator, timeout, || {
        evaluator.check(store, trigger, Some(&subtask))
    })?;

    let resolved = gate::resolve(trigger, &verdict.decision);
    let notes = gate_notes(&verdict.notes, resolved.violation.as_ref());
    let gate_id =
        ctx.store
            .record_gate_check(Some(&subtask.id), trigger, resolved.decision, notes.clone())?;
    debug!(gate = %gate_id, trigger = %trigger, decision = %resolved.decision, "gate recorded");

    match resolved.decision {
        GateDecision::GateDone => {
            ctx.store
                .set_subtask_status(&subtask.id, SubtaskStatus::Fulfilled)?;
            ctx.store.archive_current_subtask()?;
            match ctx.store.advance_to_next_subtask()? {
                Some(next) => Ok(Transition::new(
                    State::GetAction,
                    TriggerRole::Evaluator,
                    TriggerCode::GateDone,
                    format!("{} fulfilled; advanced to {next}", subtask.id),
                )),
                None => Ok(Transition::new(
                    State::FinalCheck,
                    TriggerRole::Evaluator,
                    TriggerCode::AllSubtasksDone,
                    format!("{} fulfilled; no subtasks left", subtask.id),
                )),
            }
        }
        GateDecision::GateFail => {
            let code = if resolved.violation.is_some() {
                TriggerCode::GateDecisionInvalid
            } else {
                TriggerCode::GateFail
            };
            let text = if notes.is_empty() {
                "quality gate failed".to_string()
            } else {
                format!("quality gate failed: {notes}")
            };
            ctx.store.record_subtask_reason(&subtask.id, text.clone())?;
            ctx.store
                .set_subtask_status(&subtask.id, SubtaskStatus::Rejected)?;
            Ok(Transition::new(State::Plan, TriggerRole::Evaluator, code, text))
        }
        GateDecision::GateSupplement => {
            ctx.store
                .record_subtask_reason(&subtask.id, format!("gate requested supplement: {notes}"))?;
            Ok(Transition::new(
                State::Supplement,
                TriggerRole::Evaluator,
                TriggerCode::GateSupplement,
                notes,
            ))
        }
        GateDecision::GateContinue => Ok(Transition::new(
            State::ExecuteAction,
            TriggerRole::Evaluator,
            TriggerCode::GateContinue,
            notes,
        )),
    }
}

// ---- PLAN / SUPPLEMENT ------------------------------------------------------

#[instrument(skip_all)]
pub fn handle_plan(ctx: &mut HandlerContext<'_>) -> Result<Transition> {
    let plan_num = ctx.store.increment_plan();
    let timeout = ctx.timeout();
    let store: &DataStore = ctx.store;
    let manager = &mut ctx.roles.manager;
    let output = run_bounded(TriggerRole::Manager, timeout, || {
        manager.plan(store, PlanScenario::Replan)
    })?;

    let ids = ctx.store.replace_plan(output.subtasks)?;
    if let Some(notes) = output.notes.filter(|n| !n.is_empty()) {
        ctx.store
            .append_event("handlers", "plan_notes", notes);
    }
    if ids.is_empty() {
        return Ok(Transition::new(
            State::Init,
            TriggerRole::Manager,
            TriggerCode::PlanEmpty,
            format!("plan #{plan_num} produced no subtasks"),
        ));
    }
    let first = ctx
        .store
        .advance_to_next_subtask()?
        .ok_or_else(|| anyhow!("plan #{plan_num} queued subtasks but none could be advanced"))?;
    ctx.store.set_task_status(TaskStatus::Pending);
    Ok(Transition::new(
        State::GetAction,
        TriggerRole::Manager,
        TriggerCode::PlanCreated,
        format!("plan #{plan_num}: {} subtasks, starting {first}", ids.len()),
    ))
}

#[instrument(skip_all)]
pub fn handle_supplement(ctx: &mut HandlerContext<'_>) -> Result<Transition> {
    let plan_num = ctx.store.increment_plan();
    let timeout = ctx.timeout();
    let store: &DataStore = ctx.store;
    let manager = &mut ctx.roles.manager;
    let result = run_bounded(TriggerRole::Manager, timeout, || {
        manager.plan(store, PlanScenario::Supplement)
    });
    match result {
        Ok(output) => {
            let notes = output.notes.unwrap_or_default();
            if !notes.is_empty() {
                ctx.store.push_supplement_note(notes.clone());
            }
            Ok(Transition::new(
                State::Plan,
                TriggerRole::Manager,
                TriggerCode::SupplementCollected,
                format!("supplement #{plan_num} collected: {notes}"),
            ))
        }
        Err(err) => {
            let details = format!("supplement #{plan_num} failed: {err:#}");
            ctx.store
                .append_event("handlers", "supplement_error", details.clone());
            Ok(Transition::new(
                State::Plan,
                TriggerRole::Manager,
                TriggerCode::SupplementError,
                details,
            ))
        }
    }
}

// ---- FINAL_CHECK / DONE -----------------------------------------------------

#[instrument(skip_all)]
pub fn handle_final_check(ctx: &mut HandlerContext<'_>) -> Result<Transition> {
    let current_pending = ctx
        .store
        .current_subtask()
        .is_some_and(|s| s.status == SubtaskStatus::Pending);
    if current_pending || ctx.store.has_pending_subtasks() {
        if !current_pending {
            ctx.store.archive_current_subtask()?;
            ctx.store.advance_to_next_subtask()?;
        }
        return Ok(Transition::new(
            State::GetAction,
            TriggerRole::Controller,
            TriggerCode::PendingSubtasksReappeared,
            "pending subtasks appeared before the final check",
        ));
    }

    let timeout = ctx.timeout();
    let store: &DataStore = ctx.store;
    let evaluator = &mut ctx.roles.evaluator;
    let verdict = run_bounded(TriggerRole::Evaluator, timeout, || {
        evaluator.check(store, GateTrigger::FinalCheck, None)
    })?;
    let resolved = gate::resolve(GateTrigger::FinalCheck, &verdict.decision);
    let notes = gate_notes(&verdict.notes, resolved.violation.as_ref());
    ctx.store
        .record_gate_check(None, GateTrigger::FinalCheck, resolved.decision, notes.clone())?;

    if resolved.decision == GateDecision::GateDone {
        let message = if notes.is_empty() {
            "final check passed".to_string()
        } else {
            notes
        };
        ctx.store.finish_task(TaskStatus::Fulfilled, message.clone());
        return Ok(Transition::new(
            State::Done,
            TriggerRole::Evaluator,
            TriggerCode::FinalCheckPassed,
            message,
        ));
    }
    let code = if resolved.violation.is_some() {
        TriggerCode::GateDecisionInvalid
    } else {
        TriggerCode::FinalCheckFailed
    };
    Ok(Transition::new(State::Plan, TriggerRole::Evaluator, code, notes))
}

pub fn handle_done(ctx: &mut HandlerContext<'_>) -> Result<Transition> {
    Ok(Transition::new(
        State::Done,
        TriggerRole::Controller,
        TriggerCode::TaskTerminal,
        format!("task is {}", ctx.store.task().status),
    ))
}
