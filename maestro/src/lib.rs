//! Orchestration controller for LLM-driven desktop automation.
//!
//! A task is decomposed into subtasks by a planner, each subtask is driven
//! by a worker that proposes actions, an executor applies them and a quality
//! gate decides when a subtask is done. The controller ties these together
//! as an explicit state machine with guard-rail rules. The architecture
//! enforces a strict separation:
//!
//! - **[`core`]**: Pure, deterministic logic (rules, gate contract, monitor).
//!   No I/O, fully testable in isolation.
//! - **[`io`]**: Side-effecting operations (config, snapshots, event log).
//! - **[`roles`]**: Collaborator traits plus scripted implementations.
//!
//! Orchestration modules ([`handlers`], [`state_machine`], [`controller`],
//! [`service`]) coordinate core logic with collaborators and persistence.

pub mod controller;
pub mod core;
pub mod exit_codes;
pub mod handlers;
pub mod io;
pub mod logging;
pub mod model;
pub mod roles;
pub mod service;
pub mod state_machine;
pub mod store;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
