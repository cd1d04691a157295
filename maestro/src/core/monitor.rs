//! Execution monitor: classifies each executed step and chooses between
//! continuing, a small corrective patch, or escalating to a replan.
//!
//! Patch budgets are tracked per step and per subtask and only grow, so a
//! subtask can never be patched forever.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::core::action::{ActionPayload, HardwareAction};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub max_patches_per_step: u32,
    pub max_patches_per_subtask: u32,
    /// Consecutive non element-not-found failures that force a replan.
    pub consecutive_failure_replan: u32,
    /// Identical consecutive actions that trigger a patch.
    pub identical_action_patch: u32,
    /// Identical consecutive actions that force a replan.
    pub identical_action_replan: u32,
    pub latency_spike_ms: u64,
    pub patch_wait_ms: u64,
    pub patch_scroll_clicks: i32,
    pub screen_width: i32,
    pub screen_height: i32,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            max_patches_per_step: 1,
            max_patches_per_subtask: 3,
            consecutive_failure_replan: 2,
            identical_action_patch: 2,
            identical_action_replan: 3,
            latency_spike_ms: 10_000,
            patch_wait_ms: 1_500,
            patch_scroll_clicks: -3,
            screen_width: 1920,
            screen_height: 1080,
        }
    }
}

/// Executor failure category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecErrorKind {
    ElementNotFound,
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MonitorDecision {
    Continue,
    Patch,
    Replan,
}

/// What the monitor sees of one executed step.
#[derive(Debug, Clone, Copy)]
pub struct StepObservation<'a> {
    pub step_id: &'a str,
    pub subtask_id: &'a str,
    pub action: Option<&'a ActionPayload>,
    pub failure: Option<ExecErrorKind>,
    pub worker_failed: bool,
    pub latency_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    pub decision: MonitorDecision,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Continue,
    Patch {
        action: HardwareAction,
        reason: String,
    },
    Replan {
        reason: String,
    },
}

/// Serializable monitor counters; persisted with the controller snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorState {
    pub subtask_id: Option<String>,
    pub consecutive_failures: u32,
    pub last_action: Option<ActionPayload>,
    pub identical_run: u32,
    pub patches_per_step: BTreeMap<String, u32>,
    pub patches_per_subtask: BTreeMap<String, u32>,
}

#[derive(Debug, Clone, Default)]
pub struct ExecutionMonitor {
    config: MonitorConfig,
    state: MonitorState,
}

impl ExecutionMonitor {
    pub fn new(config: MonitorConfig) -> Self {
        Self {
            config,
            state: MonitorState::default(),
        }
    }

    pub fn with_state(config: MonitorConfig, state: MonitorState) -> Self {
        Self { config, state }
    }

    pub fn state(&self) -> &MonitorState {
        &self.state
    }

    pub fn patches_used_for_step(&self, step_id: &str) -> u32 {
        self.state
            .patches_per_step
            .get(step_id)
            .copied()
            .unwrap_or(0)
    }

    pub fn patches_used_for_subtask(&self, subtask_id: &str) -> u32 {
        self.state
            .patches_per_subtask
            .get(subtask_id)
            .copied()
            .unwrap_or(0)
    }

    /// Record a step and classify it. REPLAN outranks PATCH outranks CONTINUE.
    pub fn classify(&mut self, obs: &StepObservation<'_>) -> Classification {
        if self.state.subtask_id.as_deref() != Some(obs.subtask_id) {
            self.state.subtask_id = Some(obs.subtask_id.to_string());
            self.state.consecutive_failures = 0;
            self.state.last_action = None;
            self.state.identical_run = 0;
        }

        let mut verdicts: Vec<(MonitorDecision, String)> = Vec::new();

        if obs.worker_failed {
            verdicts.push((MonitorDecision::Replan, "worker reported failure".to_string()));
        }

        match obs.failure {
            Some(ExecErrorKind::ElementNotFound) => {
                self.state.consecutive_failures = 0;
                verdicts.push((MonitorDecision::Patch, "element not found".to_string()));
            }
            Some(ExecErrorKind::Other) => {
                self.state.consecutive_failures += 1;
                if self.state.consecutive_failures >= self.config.consecutive_failure_replan {
                    verdicts.push((
                        MonitorDecision::Replan,
                        format!(
                            "{} consecutive execution failures",
                            self.state.consecutive_failures
                        ),
                    ));
                }
            }
            None => self.state.consecutive_failures = 0,
        }

        if let Some(action) = obs.action {
            let repeated = self
                .state
                .last_action
                .as_ref()
                .is_some_and(|last| last.structurally_eq(action));
            self.state.identical_run = if repeated {
                self.state.identical_run + 1
            } else {
                1
            };
            self.state.last_action = Some(action.clone());
            let run = self.state.identical_run;
            if run >= self.config.identical_action_replan {
                verdicts.push((
                    MonitorDecision::Replan,
                    format!("{run} identical actions in a row"),
                ));
            } else if run >= self.config.identical_action_patch {
                verdicts.push((
                    MonitorDecision::Patch,
                    format!("{run} identical actions in a row"),
                ));
            }
        }

        if let Some(latency) = obs.latency_ms {
            if latency >= self.config.latency_spike_ms {
                verdicts.push((MonitorDecision::Patch, format!("latency spike {latency}ms")));
            }
        }

        verdicts
            .into_iter()
            .max_by_key(|(decision, _)| *decision)
            .map(|(decision, reason)| Classification { decision, reason })
            .unwrap_or(Classification {
                decision: MonitorDecision::Continue,
                reason: "step looks healthy".to_string(),
            })
    }

    /// Turn a classification into an action, spending patch budget.
    pub fn resolve(
        &mut self,
        classification: Classification,
        obs: &StepObservation<'_>,
    ) -> Resolution {
        match classification.decision {
            MonitorDecision::Continue => Resolution::Continue,
            MonitorDecision::Replan => Resolution::Replan {
                reason: classification.reason,
            },
            MonitorDecision::Patch => {
                let step_used = self.patches_used_for_step(obs.step_id);
                let subtask_used = self.patches_used_for_subtask(obs.subtask_id);
                if step_used >= self.config.max_patches_per_step
                    || subtask_used >= self.config.max_patches_per_subtask
                {
                    return Resolution::Replan {
                        reason: format!(
                            "{}; patch budget exhausted ({step_used}/{} step, {subtask_used}/{} subtask)",
                            classification.reason,
                            self.config.max_patches_per_step,
                            self.config.max_patches_per_subtask
                        ),
                    };
                }
                *self
                    .state
                    .patches_per_step
                    .entry(obs.step_id.to_string())
                    .or_default() += 1;
                *self
                    .state
                    .patches_per_subtask
                    .entry(obs.subtask_id.to_string())
                    .or_default() += 1;
                Resolution::Patch {
                    action: self.patch_action(obs.action),
                    reason: classification.reason,
                }
            }
        }
    }

    /// Scroll at screen center, or wait if the last action already scrolled.
    fn patch_action(&self, last: Option<&ActionPayload>) -> HardwareAction {
        if last.is_some_and(ActionPayload::is_scroll) {
            HardwareAction::Wait {
                duration_ms: self.config.patch_wait_ms,
            }
        } else {
            HardwareAction::Scroll {
                x: self.config.screen_width / 2,
                y: self.config.screen_height / 2,
                clicks: self.config.patch_scroll_clicks,
                horizontal: false,
                element_description: None,
            }
        }
    }
}
