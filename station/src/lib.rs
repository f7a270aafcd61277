//! Observatory-side glue for the pointing corrector.
//!
//! Device selection for the command-line tools, a simulated observatory for
//! running the loop without hardware, and operator-facing reporting.

pub mod devices;
pub mod report;
pub mod simulated;

/// Install the `tracing` subscriber used by the binaries.
///
/// Honors `RUST_LOG`, defaulting to `info`. `log` records from the library
/// crates are forwarded to the same subscriber.
pub fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
