//! Typed action payloads produced by workers and consumed by the executor.
//!
//! Each assignee role owns exactly one payload shape. The executor boundary
//! checks [`ActionPayload::check_role`] before dispatching anything.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::core::types::AssigneeRole;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MouseButton {
    #[default]
    Left,
    Right,
    Middle,
}

fn one() -> u32 {
    1
}

/// Primitive operator actions against the desktop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HardwareAction {
    Click {
        x: i32,
        y: i32,
        #[serde(default)]
        button: MouseButton,
        #[serde(default = "one")]
        clicks: u32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        element_description: Option<String>,
    },
    TypeText {
        text: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        x: Option<i32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        y: Option<i32>,
        #[serde(default)]
        press_enter: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        element_description: Option<String>,
    },
    Scroll {
        x: i32,
        y: i32,
        clicks: i32,
        #[serde(default)]
        horizontal: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        element_description: Option<String>,
    },
    Drag {
        start_x: i32,
        start_y: i32,
        end_x: i32,
        end_y: i32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        starting_description: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ending_description: Option<String>,
    },
    Hotkey {
        keys: Vec<String>,
    },
    Wait {
        duration_ms: u64,
    },
    OpenApp {
        name: String,
    },
}

impl HardwareAction {
    /// Copy with free-text element descriptions cleared.
    pub fn structural(&self) -> HardwareAction {
        let mut copy = self.clone();
        match &mut copy {
            HardwareAction::Click {
                element_description,
                ..
            }
            | HardwareAction::TypeText {
                element_description,
                ..
            }
            | HardwareAction::Scroll {
                element_description,
                ..
            } => *element_description = None,
            HardwareAction::Drag {
                starting_description,
                ending_description,
                ..
            } => {
                *starting_description = None;
                *ending_description = None;
            }
            HardwareAction::Hotkey { .. }
            | HardwareAction::Wait { .. }
            | HardwareAction::OpenApp { .. } => {}
        }
        copy
    }

    pub fn is_scroll(&self) -> bool {
        matches!(self, HardwareAction::Scroll { .. })
    }
}

impl fmt::Display for HardwareAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HardwareAction::Click { x, y, clicks, .. } => write!(f, "click({x},{y})x{clicks}"),
            HardwareAction::TypeText { text, .. } => write!(f, "type({} chars)", text.len()),
            HardwareAction::Scroll { x, y, clicks, .. } => write!(f, "scroll({x},{y},{clicks})"),
            HardwareAction::Drag {
                start_x,
                start_y,
                end_x,
                end_y,
                ..
            } => write!(f, "drag({start_x},{start_y}->{end_x},{end_y})"),
            HardwareAction::Hotkey { keys } => write!(f, "hotkey({})", keys.join("+")),
            HardwareAction::Wait { duration_ms } => write!(f, "wait({duration_ms}ms)"),
            HardwareAction::OpenApp { name } => write!(f, "open({name})"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeBlock {
    pub language: String,
    pub source: String,
}

/// Action payload owned by a command. Adjacently tagged by `kind`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload", rename_all = "snake_case")]
pub enum ActionPayload {
    Hardware(HardwareAction),
    Code {
        blocks: Vec<CodeBlock>,
    },
    Analysis {
        summary: String,
        #[serde(default)]
        findings: Vec<String>,
    },
}

/// Payload kind does not belong to the subtask's assignee role.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PayloadRoleMismatch {
    pub expected: AssigneeRole,
    pub found: AssigneeRole,
}

impl fmt::Display for PayloadRoleMismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} payload cannot be dispatched for a {} subtask",
            self.found, self.expected
        )
    }
}

impl std::error::Error for PayloadRoleMismatch {}

impl ActionPayload {
    /// Role whose worker produces this payload shape.
    pub fn role(&self) -> AssigneeRole {
        match self {
            ActionPayload::Hardware(_) => AssigneeRole::Operator,
            ActionPayload::Code { .. } => AssigneeRole::Technician,
            ActionPayload::Analysis { .. } => AssigneeRole::Analyst,
        }
    }

    pub fn check_role(&self, expected: AssigneeRole) -> Result<(), PayloadRoleMismatch> {
        let found = self.role();
        if found == expected {
            Ok(())
        } else {
            Err(PayloadRoleMismatch { expected, found })
        }
    }

    /// Equality that ignores free-text element descriptions.
    pub fn structurally_eq(&self, other: &ActionPayload) -> bool {
        match (self, other) {
            (ActionPayload::Hardware(a), ActionPayload::Hardware(b)) => {
                a.structural() == b.structural()
            }
            _ => self == other,
        }
    }

    pub fn is_scroll(&self) -> bool {
        matches!(self, ActionPayload::Hardware(action) if action.is_scroll())
    }
}

impl fmt::Display for ActionPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActionPayload::Hardware(action) => action.fmt(f),
            ActionPayload::Code { blocks } => write!(f, "code({} blocks)", blocks.len()),
            ActionPayload::Analysis { findings, .. } => {
                write!(f, "analysis({} findings)", findings.len())
            }
        }
    }
}
