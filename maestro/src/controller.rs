//! The controller loop: one handler, one switch, one rule pass per tick.
//!
//! A tick dispatches the handler for the current state, applies the
//! transition it returns, checks for cancellation, lets the rule engine
//! override the result and finally checkpoints. [`Controller::run_with`]
//! repeats ticks until the task is fulfilled or rejected, the caller cancels,
//! or the tick budget runs out.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use crate::core::monitor::ExecutionMonitor;
use crate::core::rules::{RuleEngine, RuleVerdict};
use crate::core::types::{State, TaskStatus, TriggerCode, TriggerRole};
use crate::handlers::{HandlerContext, HandlerTable};
use crate::io::config::MaestroConfig;
use crate::io::event_log::EventLog;
use crate::io::init::MaestroPaths;
use crate::io::snapshot::{Snapshot, load_snapshot, write_snapshot};
use crate::roles::Roles;
use crate::state_machine::{ControllerState, StateMachine, Transition, replay_controller_state};
use crate::store::DataStore;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// Budget for a single collaborator call, in seconds.
    pub handler_timeout_secs: u64,
    /// Write the snapshot and event log after every tick.
    pub checkpoint_every_tick: bool,
    /// Upper bound on ticks for `execute_main_loop`.
    pub max_ticks: u32,
    /// Progress events buffered per subscriber before the oldest are dropped.
    pub progress_queue_capacity: usize,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            handler_timeout_secs: 300,
            checkpoint_every_tick: true,
            max_ticks: 500,
            progress_queue_capacity: 64,
        }
    }
}

/// Shared cancellation flag. Cloning shares the flag.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Point-in-time view of a task for status queries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusReport {
    pub task_id: String,
    pub objective: String,
    pub current_state: State,
    pub task_status: TaskStatus,
    pub step_num: u32,
    pub plan_num: u32,
    pub current_subtask_id: Option<String>,
    pub pending_subtasks: usize,
    pub state_switch_count: u64,
    pub last_trigger_code: Option<TriggerCode>,
    pub outcome_message: Option<String>,
}

impl StatusReport {
    pub fn capture(store: &DataStore, controller: &ControllerState) -> Self {
        let task = store.task();
        Self {
            task_id: task.id.clone(),
            objective: task.objective.clone(),
            current_state: controller.current_state,
            task_status: task.status,
            step_num: task.step_num,
            plan_num: task.plan_num,
            current_subtask_id: task.current_subtask_id.clone(),
            pending_subtasks: task.pending_subtask_ids.len(),
            state_switch_count: controller.state_switch_count,
            last_trigger_code: controller.last_trigger_code,
            outcome_message: task.outcome_message.clone(),
        }
    }
}

/// What happened during one tick.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TickReport {
    pub tick: u32,
    pub from: State,
    pub handler: Transition,
    pub rule: Option<RuleVerdict>,
    pub cancelled: bool,
    pub status: StatusReport,
}

/// Reason why `run_with` stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopStop {
    /// The task reached `fulfilled` or `rejected`.
    Finished(TaskStatus),
    /// The cancellation token was triggered.
    Cancelled,
    /// The requested number of ticks ran without finishing the task.
    TickLimit { ticks: u32 },
}

/// Summary of a loop invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopOutcome {
    pub ticks: u32,
    pub stop: LoopStop,
    pub status: StatusReport,
}

#[derive(Debug)]
struct Persistence {
    paths: MaestroPaths,
    log: EventLog,
    persisted_seq: u64,
}

pub struct Controller {
    store: DataStore,
    machine: StateMachine,
    rules: RuleEngine,
    handlers: HandlerTable,
    roles: Roles,
    monitor: ExecutionMonitor,
    config: ControllerConfig,
    cancel: CancellationToken,
    persistence: Option<Persistence>,
    ticks: u32,
}

impl Controller {
    pub fn new(mut store: DataStore, roles: Roles, config: &MaestroConfig) -> Self {
        store.append_event(
            "controller",
            "controller_started",
            format!("objective: {}", store.task().objective),
        );
        Self {
            store,
            machine: StateMachine::new(),
            rules: RuleEngine::new(config.rules.clone()),
            handlers: HandlerTable::default(),
            roles,
            monitor: ExecutionMonitor::new(config.monitor.clone()),
            config: config.controller.clone(),
            cancel: CancellationToken::new(),
            persistence: None,
            ticks: 0,
        }
    }

    /// Continue a task from the snapshot at `paths`.
    ///
    /// The snapshot is authoritative. If its controller state disagrees with
    /// a replay of its own events the replayed state wins, and the on-disk
    /// event log is rewritten to match the snapshot's events.
    pub fn resume(paths: MaestroPaths, roles: Roles, config: &MaestroConfig) -> Result<Self> {
        let snapshot = load_snapshot(&paths.snapshot_path)
            .with_context(|| format!("resume from {}", paths.state_dir.display()))?;
        let mut controller_state = snapshot.controller;
        if let Some(replayed) = replay_controller_state(snapshot.store.events()) {
            if replayed.current_state != controller_state.current_state
                || replayed.state_switch_count != controller_state.state_switch_count
            {
                warn!(
                    snapshot = %controller_state.current_state,
                    replayed = %replayed.current_state,
                    "snapshot controller state disagrees with its events; using replay"
                );
                controller_state = replayed;
            }
        }

        let log = EventLog::new(&paths.events_path);
        let on_disk = log.last_seq()?.unwrap_or(0);
        let in_store = snapshot.store.events().last().map_or(0, |e| e.seq);
        if on_disk != in_store {
            warn!(on_disk, in_store, "event log out of step with snapshot; rewriting");
            log.rewrite(snapshot.store.events())?;
        }

        let mut store = snapshot.store;
        store.append_event(
            "controller",
            "controller_resumed",
            format!("resumed in {}", controller_state.current_state),
        );
        info!(task = %store.task().id, state = %controller_state.current_state, "resuming task");
        Ok(Self {
            store,
            machine: StateMachine::from_state(controller_state),
            rules: RuleEngine::new(config.rules.clone()),
            handlers: HandlerTable::default(),
            roles,
            monitor: ExecutionMonitor::with_state(config.monitor.clone(), snapshot.monitor),
            config: config.controller.clone(),
            cancel: CancellationToken::new(),
            persistence: Some(Persistence {
                paths,
                log,
                persisted_seq: in_store,
            }),
            ticks: 0,
        })
    }

    pub fn with_handlers(mut self, handlers: HandlerTable) -> Self {
        self.handlers = handlers;
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Checkpoint to `paths` from now on, starting with an immediate write.
    pub fn persist_to(mut self, paths: MaestroPaths) -> Result<Self> {
        let log = EventLog::new(&paths.events_path);
        log.rewrite(&[])?;
        self.persistence = Some(Persistence {
            paths,
            log,
            persisted_seq: 0,
        });
        self.checkpoint()?;
        Ok(self)
    }

    pub fn store(&self) -> &DataStore {
        &self.store
    }

    pub fn controller_state(&self) -> &ControllerState {
        self.machine.controller_state()
    }

    pub fn monitor(&self) -> &ExecutionMonitor {
        &self.monitor
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn status(&self) -> StatusReport {
        StatusReport::capture(&self.store, self.machine.controller_state())
    }

    /// Append unpersisted events to the log, then atomically replace the
    /// snapshot. No-op without persistence.
    pub fn checkpoint(&mut self) -> Result<()> {
        let Some(persistence) = &mut self.persistence else {
            return Ok(());
        };
        let fresh = self.store.events_after(persistence.persisted_seq);
        persistence.log.append(fresh)?;
        if let Some(last) = fresh.last() {
            persistence.persisted_seq = last.seq;
        }
        let snapshot = Snapshot::new(
            self.store.clone(),
            self.machine.controller_state().clone(),
            self.monitor.state().clone(),
        );
        write_snapshot(&persistence.paths.snapshot_path, &snapshot)
    }

    fn apply_cancellation(&mut self) {
        if self.store.task().status == TaskStatus::Cancelled {
            return;
        }
        let from = self.machine.current_state();
        info!(task = %self.store.task().id, state = %from, "task cancelled");
        self.store
            .finish_task(TaskStatus::Cancelled, format!("cancelled during {from}"));
        self.store
            .append_event("controller", "task_cancelled", format!("cancelled during {from}"));
        self.machine.switch(
            &mut self.store,
            &Transition::new(
                State::Done,
                TriggerRole::Controller,
                TriggerCode::Cancelled,
                "cancellation requested",
            ),
        );
    }

    /// Run one tick.
    #[instrument(skip_all, fields(tick = self.ticks + 1, state = %self.machine.current_state()))]
    pub fn tick(&mut self) -> Result<TickReport> {
        self.ticks += 1;
        let from = self.machine.current_state();
        let handler = {
            let mut ctx = HandlerContext {
                store: &mut self.store,
                roles: &mut self.roles,
                monitor: &mut self.monitor,
                config: &self.config,
                controller: self.machine.controller_state(),
            };
            self.handlers.dispatch(from, &mut ctx)
        };
        self.machine.switch(&mut self.store, &handler);

        let cancelled = self.cancel.is_cancelled();
        let rule = if cancelled {
            self.apply_cancellation();
            None
        } else {
            self.machine
                .apply_rules(&mut self.store, &self.rules, Utc::now())
        };

        if self.config.checkpoint_every_tick || cancelled {
            self.checkpoint()?;
        }
        Ok(TickReport {
            tick: self.ticks,
            from,
            handler,
            rule,
            cancelled,
            status: self.status(),
        })
    }

    /// Run up to `max_ticks` ticks, calling `on_tick` after each one.
    pub fn run_with<F: FnMut(&TickReport)>(
        &mut self,
        max_ticks: u32,
        mut on_tick: F,
    ) -> Result<LoopOutcome> {
        let mut ticks = 0u32;
        let stop = loop {
            if self.machine.should_exit_loop(&self.store) {
                break LoopStop::Finished(self.store.task().status);
            }
            if self.cancel.is_cancelled() {
                self.apply_cancellation();
                break LoopStop::Cancelled;
            }
            if self.store.task().status == TaskStatus::Cancelled {
                break LoopStop::Cancelled;
            }
            if ticks >= max_ticks {
                break LoopStop::TickLimit { ticks };
            }
            let report = self.tick()?;
            ticks += 1;
            on_tick(&report);
        };
        self.checkpoint()?;
        info!(ticks, stop = ?stop, "controller loop stopped");
        Ok(LoopOutcome {
            ticks,
            stop,
            status: self.status(),
        })
    }

    /// Run at most `steps` ticks.
    pub fn execute_single_step(&mut self, steps: u32) -> Result<LoopOutcome> {
        self.run_with(steps, |_| {})
    }

    /// Run until the task finishes, is cancelled, or `max_ticks` is reached.
    pub fn execute_main_loop(&mut self) -> Result<LoopOutcome> {
        self.run_with(self.config.max_ticks, |_| {})
    }
}

impl std::fmt::Debug for Controller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Controller")
            .field("task", &self.store.task().id)
            .field("state", &self.machine.current_state())
            .field("ticks", &self.ticks)
            .finish_non_exhaustive()
    }
}
