//! Diagnostic tracing for the stagehand CLI.
//!
//! Operator-facing results go to stdout; everything emitted here goes to
//! stderr and never ends up in the record store.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Env var consulted before `RUST_LOG`.
pub const LOG_ENV: &str = "STAGEHAND_LOG";

/// Initialize the tracing subscriber.
///
/// Reads `STAGEHAND_LOG`, then `RUST_LOG`. Defaults to `warn` if neither is set
/// or parses. Output: stderr, compact format.
///
/// # Example
/// ```bash
/// STAGEHAND_LOG=stagehand=debug stagehand run-queue
/// ```
pub fn init() {
    let filter = EnvFilter::try_from_env(LOG_ENV)
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("warn"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .init();
}
