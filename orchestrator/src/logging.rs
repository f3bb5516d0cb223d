//! Diagnostic tracing for the orchestrator.
//!
//! # Separation of Concerns
//!
//! - **Tracing (this module)**: diagnostics via `RUST_LOG`, written to stderr.
//!   Not persisted and never part of a terminal payload.
//!
//! - **Product records (`io/checkpoint`, `io/world_store`)**: checkpoints, the
//!   tool invocation log and turn summaries under `.orchestrator/`. Always
//!   written, unaffected by `RUST_LOG`.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Install the global subscriber. Call once, from `main`.
///
/// Reads `RUST_LOG`; defaults to `warn`. Compact format on stderr so stdout
/// stays reserved for JSON payloads.
///
/// # Example
/// ```bash
/// RUST_LOG=orchestrator=debug orchestrator run my-run:chat "total wages?"
/// ```
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;

    // The only test in this binary that touches the global subscriber.
    #[test]
    fn init_installs_the_global_subscriber() {
        init();
        assert!(tracing::dispatcher::has_been_set());
    }
}
