//! Diagnostic tracing for the stash library, CLI, and server.
//!
//! Tracing is operator-facing only. The durable record of what a run did lives
//! in the history store as run steps, messages, and events.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Install a stderr subscriber filtered by `RUST_LOG`, else `default_directives`.
///
/// Safe to call more than once; later calls are ignored.
///
/// ```bash
/// RUST_LOG=stash=debug stash send --root . "create notes.md"
/// ```
pub fn init_with_default(default_directives: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directives));

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .try_init();
}

/// CLI default: warnings only unless `RUST_LOG` says otherwise.
pub fn init() {
    init_with_default("warn");
}
