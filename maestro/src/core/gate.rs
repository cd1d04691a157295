//! Quality gate decision contract.
//!
//! Evaluators return free text. [`resolve`] extracts one decision token,
//! checks it against the allow-list for the trigger, and falls back to
//! `gate_fail` with an explanatory note when either step fails.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::LazyLock;

use regex::Regex;

use crate::core::types::{GateDecision, GateTrigger};

static DECISION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:gate[\s_-]*)?(done|fail(?:ed|ure)?|supplement|continue)\b").unwrap()
});

/// Decisions an evaluator may return for a given trigger.
pub fn allowed_decisions(trigger: GateTrigger) -> &'static [GateDecision] {
    use GateDecision::{GateContinue, GateDone, GateFail, GateSupplement};
    match trigger {
        GateTrigger::WorkerSuccess => &[GateDone, GateFail],
        GateTrigger::WorkerStale => &[GateContinue, GateFail, GateSupplement],
        GateTrigger::PeriodicCheck => &[GateDone, GateFail, GateSupplement, GateContinue],
        GateTrigger::FinalCheck => &[GateDone, GateFail],
    }
}

pub fn is_allowed(trigger: GateTrigger, decision: GateDecision) -> bool {
    allowed_decisions(trigger).contains(&decision)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateContractViolation {
    /// No decision token, or more than one distinct token.
    Unparsable { raw: String },
    /// A valid token that is not allowed for the trigger.
    OutOfScope {
        trigger: GateTrigger,
        decision: GateDecision,
    },
}

impl fmt::Display for GateContractViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GateContractViolation::Unparsable { raw } => {
                write!(f, "could not parse a gate decision from '{raw}'")
            }
            GateContractViolation::OutOfScope { trigger, decision } => {
                write!(f, "{decision} is not allowed for a {trigger} check")
            }
        }
    }
}

impl std::error::Error for GateContractViolation {}

/// Extract exactly one decision token from evaluator text.
pub fn normalize_decision(raw: &str) -> Option<GateDecision> {
    let found: BTreeSet<&'static str> = DECISION_RE
        .captures_iter(raw)
        .filter_map(|caps| caps.get(1))
        .map(|token| {
            let token = token.as_str().to_ascii_lowercase();
            if token.starts_with("fail") {
                "fail"
            } else if token == "done" {
                "done"
            } else if token == "supplement" {
                "supplement"
            } else {
                "continue"
            }
        })
        .collect();
    if found.len() != 1 {
        return None;
    }
    match found.into_iter().next()? {
        "done" => Some(GateDecision::GateDone),
        "fail" => Some(GateDecision::GateFail),
        "supplement" => Some(GateDecision::GateSupplement),
        _ => Some(GateDecision::GateContinue),
    }
}

pub fn validate(trigger: GateTrigger, raw: &str) -> Result<GateDecision, GateContractViolation> {
    let decision = normalize_decision(raw).ok_or_else(|| GateContractViolation::Unparsable {
        raw: raw.trim().to_string(),
    })?;
    if !is_allowed(trigger, decision) {
        return Err(GateContractViolation::OutOfScope { trigger, decision });
    }
    Ok(decision)
}

/// Decision to record, plus the contract violation that forced a fallback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedGate {
    pub decision: GateDecision,
    pub violation: Option<GateContractViolation>,
}

pub fn resolve(trigger: GateTrigger, raw: &str) -> ResolvedGate {
    match validate(trigger, raw) {
        Ok(decision) => ResolvedGate {
            decision,
            violation: None,
        },
        Err(violation) => ResolvedGate {
            decision: GateDecision::GateFail,
            violation: Some(violation),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_prefixed_and_bare_tokens() {
        assert_eq!(normalize_decision("gate_done"), Some(GateDecision::GateDone));
        assert_eq!(
            normalize_decision("Decision: GATE-SUPPLEMENT, need the invoice id"),
            Some(GateDecision::GateSupplement)
        );
        assert_eq!(
            normalize_decision("The subtask failed."),
            Some(GateDecision::GateFail)
        );
        assert_eq!(normalize_decision("continue"), Some(GateDecision::GateContinue));
    }

    #[test]
    fn ambiguous_or_empty_text_is_unparsable() {
        assert_eq!(normalize_decision("done or fail, not sure"), None);
        assert_eq!(normalize_decision("looks good to me"), None);
        assert_eq!(normalize_decision(""), None);
    }

    #[test]
    fn final_check_rejects_continue() {
        let err = validate(GateTrigger::FinalCheck, "gate_continue").expect_err("not allowed");
        assert_eq!(
            err,
            GateContractViolation::OutOfScope {
                trigger: GateTrigger::FinalCheck,
                decision: GateDecision::GateContinue,
            }
        );
    }

    #[test]
    fn worker_stale_rejects_done() {
        assert!(validate(GateTrigger::WorkerStale, "gate_done").is_err());
        assert_eq!(
            validate(GateTrigger::WorkerStale, "gate_supplement"),
            Ok(GateDecision::GateSupplement)
        );
    }

    #[test]
    fn periodic_check_allows_everything() {
        for decision in GateDecision::ALL {
            assert!(is_allowed(GateTrigger::PeriodicCheck, decision));
        }
    }

    #[test]
    fn violations_resolve_to_gate_fail() {
        let resolved = resolve(GateTrigger::WorkerSuccess, "gate_supplement");
        assert_eq!(resolved.decision, GateDecision::GateFail);
        assert!(resolved.violation.is_some());

        let resolved = resolve(GateTrigger::WorkerSuccess, "gate_done");
        assert_eq!(resolved.decision, GateDecision::GateDone);
        assert!(resolved.violation.is_none());
    }
}
