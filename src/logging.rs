//! Tracing initialization helper, mirroring the teacher's use of
//! `tracing-subscriber` for process-wide structured logging.

use tracing_subscriber::EnvFilter;

/// Installs a global `tracing` subscriber reading filter directives from
/// `RUST_LOG`, defaulting to `info` when unset. Safe to call once per process.
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
