//! Logging initialization

/// Initialize the logging system
///
/// Uses env_logger with default filter level of `info`.
/// Override with RUST_LOG environment variable.
///
/// # Example
/// ```
/// rtgeom::core::logging::init();
/// log::info!("Geometry manager started");
/// ```
pub fn init() {
    // Tests and tools may call this more than once.
    let _ = env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or("info")
    ).try_init();
}
