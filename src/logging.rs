//! Structured logging setup.
//!
//! Installed once from each binary's `main`. Honors `RUST_LOG`, defaulting to
//! `info` for this crate and `warn` for dependencies.

use tracing_subscriber::EnvFilter;

pub fn init() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("warn,bq2=info"));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}
