//! Controller configuration stored under `.maestro/config.toml`.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::controller::ControllerConfig;
use crate::core::monitor::MonitorConfig;
use crate::core::rules::RuleConfig;

/// Maestro configuration (TOML).
///
/// This file is intended to be edited by humans. Missing fields default to
/// the values in each section's `Default` impl.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct MaestroConfig {
    /// Guard-rail thresholds for the rule engine.
    pub rules: RuleConfig,
    /// Patch budgets and escalation thresholds for the execution monitor.
    pub monitor: MonitorConfig,
    pub controller: ControllerConfig,
}

impl MaestroConfig {
    pub fn validate(&self) -> Result<()> {
        let rules = &self.rules;
        if rules.max_steps == 0 {
            return Err(anyhow!("rules.max_steps must be > 0"));
        }
        if rules.first_quality_check_min_commands == 0 {
            return Err(anyhow!("rules.first_quality_check_min_commands must be > 0"));
        }
        if rules.repeated_action_min_consecutive < 2 {
            return Err(anyhow!("rules.repeated_action_min_consecutive must be >= 2"));
        }
        if rules.max_runtime_secs == Some(0) {
            return Err(anyhow!("rules.max_runtime_secs must be > 0 when set"));
        }

        let monitor = &self.monitor;
        if monitor.consecutive_failure_replan == 0 {
            return Err(anyhow!("monitor.consecutive_failure_replan must be > 0"));
        }
        if monitor.identical_action_patch < 2 {
            return Err(anyhow!("monitor.identical_action_patch must be >= 2"));
        }
        if monitor.identical_action_replan <= monitor.identical_action_patch {
            return Err(anyhow!(
                "monitor.identical_action_replan must exceed monitor.identical_action_patch"
            ));
        }
        if monitor.screen_width <= 0 || monitor.screen_height <= 0 {
            return Err(anyhow!("monitor screen size must be positive"));
        }

        let controller = &self.controller;
        if controller.handler_timeout_secs == 0 {
            return Err(anyhow!("controller.handler_timeout_secs must be > 0"));
        }
        if controller.max_ticks == 0 {
            return Err(anyhow!("controller.max_ticks must be > 0"));
        }
        if controller.progress_queue_capacity == 0 {
            return Err(anyhow!("controller.progress_queue_capacity must be > 0"));
        }
        Ok(())
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `MaestroConfig::default()`.
pub fn load_config(path: &Path) -> Result<MaestroConfig> {
    if !path.exists() {
        let cfg = MaestroConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: MaestroConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("validate {}", path.display()))?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &MaestroConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    super::write_atomic(path, &buf)
}
