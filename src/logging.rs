//! Logging initialization.

use env_logger::Env;

/// Initialize the global logger.
///
/// Honors `RUST_LOG`, defaulting to `info`. Safe to call more than once;
/// repeated calls are no-ops.
pub fn init() {
    let _ = env_logger::Builder::from_env(Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .try_init();
}
