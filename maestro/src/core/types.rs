//! Closed vocabularies shared by the control loop.
//!
//! These enums are persisted in snapshots and in the controller event log, so
//! their serialized names must stay stable across releases.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Controller states. `Init` is the entry state and `Done` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum State {
    Init,
    GetAction,
    ExecuteAction,
    QualityCheck,
    Plan,
    Supplement,
    FinalCheck,
    Done,
}

impl State {
    pub const ALL: [State; 8] = [
        State::Init,
        State::GetAction,
        State::ExecuteAction,
        State::QualityCheck,
        State::Plan,
        State::Supplement,
        State::FinalCheck,
        State::Done,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            State::Init => "INIT",
            State::GetAction => "GET_ACTION",
            State::ExecuteAction => "EXECUTE_ACTION",
            State::QualityCheck => "QUALITY_CHECK",
            State::Plan => "PLAN",
            State::Supplement => "SUPPLEMENT",
            State::FinalCheck => "FINAL_CHECK",
            State::Done => "DONE",
        }
    }

    pub fn is_terminal(self) -> bool {
        self == State::Done
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle of the task as a whole.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Created,
    Pending,
    OnHold,
    Fulfilled,
    Rejected,
    Cancelled,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Created => "created",
            TaskStatus::Pending => "pending",
            TaskStatus::OnHold => "on_hold",
            TaskStatus::Fulfilled => "fulfilled",
            TaskStatus::Rejected => "rejected",
            TaskStatus::Cancelled => "cancelled",
        }
    }

    /// True once no further work will be scheduled for the task.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Fulfilled | TaskStatus::Rejected | TaskStatus::Cancelled
        )
    }

    /// True for the two statuses that end the controller loop normally.
    pub fn ends_loop(self) -> bool {
        matches!(self, TaskStatus::Fulfilled | TaskStatus::Rejected)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle of a single subtask.
///
/// Moves forward only: `ready -> pending -> {fulfilled | rejected | stale}`.
/// Queued subtasks that are discarded by a replan go `ready -> stale`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubtaskStatus {
    Ready,
    Pending,
    Fulfilled,
    Rejected,
    Stale,
}

impl SubtaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SubtaskStatus::Ready => "ready",
            SubtaskStatus::Pending => "pending",
            SubtaskStatus::Fulfilled => "fulfilled",
            SubtaskStatus::Rejected => "rejected",
            SubtaskStatus::Stale => "stale",
        }
    }

    pub fn is_final(self) -> bool {
        matches!(
            self,
            SubtaskStatus::Fulfilled | SubtaskStatus::Rejected | SubtaskStatus::Stale
        )
    }

    pub fn can_transition_to(self, next: SubtaskStatus) -> bool {
        match (self, next) {
            (a, b) if a == b => true,
            (SubtaskStatus::Ready, SubtaskStatus::Pending | SubtaskStatus::Stale) => true,
            (
                SubtaskStatus::Pending,
                SubtaskStatus::Fulfilled | SubtaskStatus::Rejected | SubtaskStatus::Stale,
            ) => true,
            _ => false,
        }
    }
}

impl fmt::Display for SubtaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Role a subtask is assigned to. Each role owns one action payload shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssigneeRole {
    Operator,
    Analyst,
    Technician,
}

impl AssigneeRole {
    pub fn as_str(self) -> &'static str {
        match self {
            AssigneeRole::Operator => "operator",
            AssigneeRole::Analyst => "analyst",
            AssigneeRole::Technician => "technician",
        }
    }
}

impl fmt::Display for AssigneeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Decision reported by a worker after processing the current subtask.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerDecision {
    WorkerDone,
    WorkerFail,
    WorkerSupplement,
    WorkerStaleProgress,
    WorkerGenerateAction,
}

impl WorkerDecision {
    pub fn as_str(self) -> &'static str {
        match self {
            WorkerDecision::WorkerDone => "worker_done",
            WorkerDecision::WorkerFail => "worker_fail",
            WorkerDecision::WorkerSupplement => "worker_supplement",
            WorkerDecision::WorkerStaleProgress => "worker_stale_progress",
            WorkerDecision::WorkerGenerateAction => "worker_generate_action",
        }
    }
}

impl fmt::Display for WorkerDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when a raw worker decision cannot be mapped to a variant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownWorkerDecision(pub String);

impl fmt::Display for UnknownWorkerDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unrecognized worker decision '{}'", self.0)
    }
}

impl std::error::Error for UnknownWorkerDecision {}

impl FromStr for WorkerDecision {
    type Err = UnknownWorkerDecision;

    /// Accepts `worker_done`, `WORKER-DONE`, `done`, `stale progress`, ...
    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let token: String = raw
            .trim()
            .trim_matches(|c: char| c == '"' || c == '\'' || c == '`' || c == '.')
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() {
                    c.to_ascii_lowercase()
                } else {
                    '_'
                }
            })
            .collect();
        let token = token.strip_prefix("worker_").unwrap_or(&token);
        match token {
            "done" => Ok(WorkerDecision::WorkerDone),
            "fail" | "failed" => Ok(WorkerDecision::WorkerFail),
            "supplement" => Ok(WorkerDecision::WorkerSupplement),
            "stale_progress" | "stale" => Ok(WorkerDecision::WorkerStaleProgress),
            "generate_action" | "action" => Ok(WorkerDecision::WorkerGenerateAction),
            _ => Err(UnknownWorkerDecision(raw.to_string())),
        }
    }
}

/// Quality gate verdict after normalization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateDecision {
    GateDone,
    GateFail,
    GateSupplement,
    GateContinue,
}

impl GateDecision {
    pub const ALL: [GateDecision; 4] = [
        GateDecision::GateDone,
        GateDecision::GateFail,
        GateDecision::GateSupplement,
        GateDecision::GateContinue,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            GateDecision::GateDone => "gate_done",
            GateDecision::GateFail => "gate_fail",
            GateDecision::GateSupplement => "gate_supplement",
            GateDecision::GateContinue => "gate_continue",
        }
    }
}

impl fmt::Display for GateDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Scene that caused a quality gate evaluation. Scopes the allowed decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateTrigger {
    WorkerSuccess,
    WorkerStale,
    PeriodicCheck,
    FinalCheck,
}

impl GateTrigger {
    pub fn as_str(self) -> &'static str {
        match self {
            GateTrigger::WorkerSuccess => "worker_success",
            GateTrigger::WorkerStale => "worker_stale",
            GateTrigger::PeriodicCheck => "periodic_check",
            GateTrigger::FinalCheck => "final_check",
        }
    }
}

impl fmt::Display for GateTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which party caused a state transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerRole {
    Controller,
    Rule,
    Manager,
    Worker,
    Executor,
    Evaluator,
    Monitor,
}

impl TriggerRole {
    pub fn as_str(self) -> &'static str {
        match self {
            TriggerRole::Controller => "controller",
            TriggerRole::Rule => "rule",
            TriggerRole::Manager => "manager",
            TriggerRole::Worker => "worker",
            TriggerRole::Executor => "executor",
            TriggerRole::Evaluator => "evaluator",
            TriggerRole::Monitor => "monitor",
        }
    }
}

impl fmt::Display for TriggerRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Audit tag explaining why a transition happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerCode {
    // INIT
    SubtaskAdvanced,
    ResumeCurrentSubtask,
    NoPendingSubtasks,
    // GET_ACTION
    WorkerDone,
    WorkerGenerateAction,
    WorkerStaleProgress,
    WorkerFail,
    WorkerSupplement,
    WorkerNoDecision,
    // EXECUTE_ACTION
    ActionExecuted,
    ExecutionFailed,
    ActionPatched,
    NoPendingAction,
    MonitorReplan,
    // QUALITY_CHECK
    GateDone,
    AllSubtasksDone,
    GateFail,
    GateSupplement,
    GateContinue,
    GateDecisionInvalid,
    // PLAN / SUPPLEMENT
    PlanCreated,
    PlanEmpty,
    SupplementCollected,
    SupplementError,
    // FINAL_CHECK
    FinalCheckPassed,
    FinalCheckFailed,
    PendingSubtasksReappeared,
    // DONE
    TaskTerminal,
    // Rule engine
    RulePlanLimitExceeded,
    RuleStepLimitExceeded,
    RuleRuntimeExceeded,
    RuleTaskCompleted,
    RuleQualityCheckCadence,
    RuleRepeatedAction,
    RuleLongExecution,
    // Recovery
    HandlerError,
    HandlerTimeout,
    HandlerPanic,
    MissingHandler,
    MissingCurrentSubtask,
    Cancelled,
}

impl TriggerCode {
    pub fn as_str(self) -> &'static str {
        match self {
            TriggerCode::SubtaskAdvanced => "subtask_advanced",
            TriggerCode::ResumeCurrentSubtask => "resume_current_subtask",
            TriggerCode::NoPendingSubtasks => "no_pending_subtasks",
            TriggerCode::WorkerDone => "worker_done",
            TriggerCode::WorkerGenerateAction => "worker_generate_action",
            TriggerCode::WorkerStaleProgress => "worker_stale_progress",
            TriggerCode::WorkerFail => "worker_fail",
            TriggerCode::WorkerSupplement => "worker_supplement",
            TriggerCode::WorkerNoDecision => "worker_no_decision",
            TriggerCode::ActionExecuted => "action_executed",
            TriggerCode::ExecutionFailed => "execution_failed",
            TriggerCode::ActionPatched => "action_patched",
            TriggerCode::NoPendingAction => "no_pending_action",
            TriggerCode::MonitorReplan => "monitor_replan",
            TriggerCode::GateDone => "gate_done",
            TriggerCode::AllSubtasksDone => "all_subtasks_done",
            TriggerCode::GateFail => "gate_fail",
            TriggerCode::GateSupplement => "gate_supplement",
            TriggerCode::GateContinue => "gate_continue",
            TriggerCode::GateDecisionInvalid => "gate_decision_invalid",
            TriggerCode::PlanCreated => "plan_created",
            TriggerCode::PlanEmpty => "plan_empty",
            TriggerCode::SupplementCollected => "supplement_collected",
            TriggerCode::SupplementError => "supplement_error",
            TriggerCode::FinalCheckPassed => "final_check_passed",
            TriggerCode::FinalCheckFailed => "final_check_failed",
            TriggerCode::PendingSubtasksReappeared => "pending_subtasks_reappeared",
            TriggerCode::TaskTerminal => "task_terminal",
            TriggerCode::RulePlanLimitExceeded => "rule_plan_limit_exceeded",
            TriggerCode::RuleStepLimitExceeded => "rule_step_limit_exceeded",
            TriggerCode::RuleRuntimeExceeded => "rule_runtime_exceeded",
            TriggerCode::RuleTaskCompleted => "rule_task_completed",
            TriggerCode::RuleQualityCheckCadence => "rule_quality_check_cadence",
            TriggerCode::RuleRepeatedAction => "rule_repeated_action",
            TriggerCode::RuleLongExecution => "rule_long_execution",
            TriggerCode::HandlerError => "handler_error",
            TriggerCode::HandlerTimeout => "handler_timeout",
            TriggerCode::HandlerPanic => "handler_panic",
            TriggerCode::MissingHandler => "missing_handler",
            TriggerCode::MissingCurrentSubtask => "missing_current_subtask",
            TriggerCode::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for TriggerCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of dispatching a command to the executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecStatus {
    Success,
    Error,
}
