//! Diagnostic tracing for the controller.
//!
//! Tracing output goes to stderr and is never part of the task record. The
//! audit trail lives in the controller event log (`io/event_log`), which is
//! written regardless of the filter below.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Filter used when `RUST_LOG` is unset.
const DEFAULT_FILTER: &str = "warn";

/// Install the stderr subscriber.
///
/// Thread names are included so lines from concurrently running tasks
/// (threads named `maestro-<task>`) can be told apart.
///
/// ```bash
/// RUST_LOG=maestro::handlers=debug maestro run --objective "..." --script script.json
/// ```
pub fn init() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_thread_names(true)
                .compact(),
        )
        .init();
}
