//! Common utilities for lusb
//!
//! Ambient pieces shared by the host library and the `lusb` tool:
//! configuration, logging setup, the shared error type and test helpers.

pub mod config;
pub mod error;
pub mod logging;
pub mod test_utils;

pub use config::LusbConfig;
pub use error::{Error, Result};
pub use logging::setup_logging;
