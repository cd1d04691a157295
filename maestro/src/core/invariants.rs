//! Structural invariants of a [`DataStore`] that the type system cannot express.

use std::collections::HashMap;

use crate::core::gate;
use crate::core::types::{GateTrigger, SubtaskStatus, TaskStatus};
use crate::store::DataStore;

/// Check store invariants and return one message per violation:
/// - Every subtask sits in exactly one of current, pending queue or history
/// - Queued subtasks are `ready`; archived subtasks are final
/// - Sequence numbers are strictly increasing per collection
/// - Commands and gate checks reference known subtasks
/// - Recorded gate decisions respect the allow-list of their trigger
pub fn validate_invariants(store: &DataStore) -> Vec<String> {
    let mut errors = Vec::new();
    let task = store.task();

    let mut placements: HashMap<&str, usize> = HashMap::new();
    let placed = task
        .current_subtask_id
        .iter()
        .chain(task.pending_subtask_ids.iter())
        .chain(task.history_subtask_ids.iter());
    for id in placed {
        *placements.entry(id.as_str()).or_default() += 1;
        if store.subtask(id).is_none() {
            errors.push(format!("task references unknown subtask '{id}'"));
        }
    }
    for subtask in store.subtasks() {
        match placements.get(subtask.id.as_str()) {
            Some(1) => {}
            Some(n) => errors.push(format!("{}: placed {n} times", subtask.id)),
            None => errors.push(format!("{}: not in current, pending or history", subtask.id)),
        }
    }

    if let Some(current) = store.current_subtask() {
        if !matches!(
            current.status,
            SubtaskStatus::Pending | SubtaskStatus::Rejected
        ) {
            errors.push(format!(
                "{}: current subtask has status {}",
                current.id, current.status
            ));
        }
    }
    for subtask in store.pending_subtasks() {
        if subtask.status != SubtaskStatus::Ready {
            errors.push(format!(
                "{}: queued subtask has status {}",
                subtask.id, subtask.status
            ));
        }
    }
    for id in &task.history_subtask_ids {
        if let Some(subtask) = store.subtask(id) {
            if !subtask.status.is_final() {
                errors.push(format!(
                    "{}: archived subtask has status {}",
                    subtask.id, subtask.status
                ));
            }
        }
    }

    if task.status == TaskStatus::Fulfilled
        && (task.current_subtask_id.is_some() || !task.pending_subtask_ids.is_empty())
    {
        errors.push("fulfilled task still has open subtasks".to_string());
    }

    check_increasing("subtasks", store.subtasks().iter().map(|s| s.seq), &mut errors);
    check_increasing("commands", store.commands().iter().map(|c| c.seq), &mut errors);
    check_increasing(
        "gate checks",
        store.gate_checks().iter().map(|g| g.seq),
        &mut errors,
    );
    check_increasing("events", store.events().iter().map(|e| e.seq), &mut errors);

    for command in store.commands() {
        match store.subtask(&command.subtask_id) {
            None => errors.push(format!(
                "{}: unknown subtask '{}'",
                command.id, command.subtask_id
            )),
            Some(subtask) if !subtask.command_trace_ids.contains(&command.id) => {
                errors.push(format!("{}: missing from {} trace", command.id, subtask.id));
            }
            Some(_) => {}
        }
    }

    for check in store.gate_checks() {
        if !gate::is_allowed(check.trigger, check.decision) {
            errors.push(format!(
                "{}: {} is not allowed for {}",
                check.id, check.decision, check.trigger
            ));
        }
        match (&check.subtask_id, check.trigger) {
            (Some(_), GateTrigger::FinalCheck) => {
                errors.push(format!("{}: final check bound to a subtask", check.id));
            }
            (None, trigger) if trigger != GateTrigger::FinalCheck => {
                errors.push(format!("{}: {trigger} check without a subtask", check.id));
            }
            (Some(id), _) if store.subtask(id).is_none() => {
                errors.push(format!("{}: unknown subtask '{id}'", check.id));
            }
            _ => {}
        }
    }

    errors
}

fn check_increasing(label: &str, seqs: impl Iterator<Item = u64>, errors: &mut Vec<String>) {
    let mut last = 0;
    for seq in seqs {
        if seq <= last {
            errors.push(format!("{label}: seq {seq} does not follow {last}"));
        }
        last = seq;
    }
}
