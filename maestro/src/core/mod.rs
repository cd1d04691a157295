//! Deterministic, pure logic shared by the controller.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests.

pub mod action;
pub mod budget;
pub mod gate;
pub mod invariants;
pub mod monitor;
pub mod rules;
pub mod types;
