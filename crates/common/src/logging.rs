//! Logging setup and configuration

use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Levels accepted by [`setup_logging`] and the `[logging]` config section
pub const VALID_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// Setup tracing subscriber for the application
///
/// `RUST_LOG` takes precedence over `default_level`.
pub fn setup_logging(default_level: &str) -> crate::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_level))
        .map_err(|e| crate::Error::Logging(format!("Invalid log filter: {}", e)))?;

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .try_init()
        .map_err(|e| crate::Error::Logging(format!("Subscriber already installed: {}", e)))?;

    Ok(())
}

/// Map a libusb-style debug level (0 none .. 4 debug) to a tracing filter level
pub fn level_for_debug(debug_level: u8) -> &'static str {
    match debug_level {
        0 | 1 => "error",
        2 => "warn",
        3 => "info",
        _ => "debug",
    }
}
