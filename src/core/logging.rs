//! Logging initialization and utilities

/// Initialize the logging system
///
/// Uses env_logger with default filter level of `info`.
/// Override with RUST_LOG environment variable, e.g.
/// `RUST_LOG=terra::streaming=debug`.
///
/// # Example
/// ```
/// terra::core::logging::init();
/// log::info!("World streaming started");
/// ```
pub fn init() {
    // A host application may already own the logger; that is not an error here.
    let _ = env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or("info")
    )
    .format_timestamp_millis()
    .try_init();
}

/// Initialize logging for unit tests (captured by the test harness).
#[cfg(test)]
pub(crate) fn init_test() {
    let _ = env_logger::builder().is_test(true).try_init();
}
