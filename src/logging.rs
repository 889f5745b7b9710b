//! Diagnostic log stream setup.
//!
//! Operator-facing progress goes to stdout via `println!`; everything else
//! (subprocess invocations, captured output, triage decisions) goes through
//! `tracing` to stderr. Filtered with `ROOTSTRAP_LOG` (standard EnvFilter
//! syntax), default `warn`.

use tracing_subscriber::EnvFilter;

pub const LOG_ENV: &str = "ROOTSTRAP_LOG";

/// Install the global subscriber. Call once, before any build work.
pub fn init() {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("warn"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}
