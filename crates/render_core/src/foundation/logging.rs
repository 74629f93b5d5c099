//! Logging utilities and structured logging support

pub use log::{debug, info, warn, error, trace};

/// Initialize the logging system from the `RUST_LOG` environment variable
pub fn init() {
    env_logger::init();
}

/// Initialize the logging system with an explicit filter such as `"render_core=debug"`
///
/// Safe to call more than once; later calls are ignored.
pub fn init_with_filter(filter: &str) {
    match env_logger::Builder::new()
        .parse_filters(filter)
        .format_timestamp_millis()
        .try_init()
    {
        Ok(()) => log::debug!("Logger initialized with filter '{filter}'"),
        Err(e) => log::debug!("Logger already installed, filter '{filter}' ignored: {e}"),
    }
}
