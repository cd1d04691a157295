//! Time budget helpers for bounded collaborator calls.

use std::fmt;
use std::time::{Duration, Instant};

use anyhow::{Result, anyhow};

use crate::core::types::TriggerRole;

/// Return the remaining time budget until the provided deadline.
pub fn remaining_budget(deadline: Instant) -> Result<Duration> {
    let remaining = deadline
        .checked_duration_since(Instant::now())
        .unwrap_or(Duration::from_secs(0));
    if remaining.is_zero() {
        return Err(anyhow!("collaborator budget exhausted"));
    }
    Ok(remaining)
}

/// A collaborator returned after its deadline; its result was discarded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollaboratorTimeout {
    pub role: TriggerRole,
    pub limit: Duration,
    pub elapsed: Duration,
}

impl fmt::Display for CollaboratorTimeout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} call exceeded its {}s budget (took {}ms)",
            self.role,
            self.limit.as_secs_f64(),
            self.elapsed.as_millis()
        )
    }
}

impl std::error::Error for CollaboratorTimeout {}

/// Run a synchronous collaborator call under a deadline.
///
/// Collaborators are blocking trait objects, so the call always runs to
/// completion; a result that arrives after the deadline is replaced by
/// [`CollaboratorTimeout`].
pub fn run_bounded<T>(
    role: TriggerRole,
    limit: Duration,
    call: impl FnOnce() -> Result<T>,
) -> Result<T> {
    let started = Instant::now();
    let deadline = started + limit;
    let value = call();
    if remaining_budget(deadline).is_err() {
        tracing::warn!(role = %role, limit_ms = limit.as_millis() as u64, "discarding late collaborator result");
        return Err(CollaboratorTimeout {
            role,
            limit,
            elapsed: started.elapsed(),
        }
        .into());
    }
    value
}
