//! Stable exit codes for maestro CLI commands.

/// Command succeeded; for `run`, the task was fulfilled.
pub const OK: i32 = 0;
/// Invalid layout, config, script or snapshot, or any other error.
pub const INVALID: i32 = 1;
/// The task finished as rejected.
pub const REJECTED: i32 = 2;
/// The task was cancelled or stopped before finishing.
pub const INCOMPLETE: i32 = 3;
