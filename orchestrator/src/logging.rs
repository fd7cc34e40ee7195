//! Development-time tracing for the orchestrator.
//!
//! # Separation of Concerns
//!
//! - **Tracing (this module)**: diagnostics via `RUST_LOG`, written to stderr.
//!   Not persisted and not part of the product output.
//!
//! - **Sprint artifacts (`io/sprint_log`)**: `tasks.json`, `verification.log`
//!   and `report.json` under the project's sprint directory. Always written,
//!   unaffected by `RUST_LOG`.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Install the global subscriber.
///
/// `RUST_LOG` wins when set. Otherwise the filter is `warn`, raised to
/// `orchestrator=info` when `verbose` is true so stage progress is visible.
///
/// # Example
/// ```bash
/// RUST_LOG=orchestrator=debug orchestrator sprint demo --sprint 1
/// ```
pub fn init(verbose: bool) {
    let fallback = if verbose {
        "warn,orchestrator=info"
    } else {
        "warn"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));

    // A second init (tests, embedding) keeps the first subscriber.
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .try_init();
}
