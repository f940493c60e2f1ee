//! Tracing initialization for the agent binary
//!
//! Structured logging with `tracing`; the filter comes from `RUST_LOG` with a
//! sensible default. Kept in the common crate so integration tests and the
//! binary share one setup path.

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Initialize the global tracing subscriber
///
/// Uses `RUST_LOG` when set, otherwise `info` for tain crates and `warn` for
/// everything else. Safe to call once per process; subsequent calls are
/// ignored.
pub fn init() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("warn,tain_agent=info,tain_sync=info,tain_mirrors=info"));

    let _ = tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .try_init();
}
