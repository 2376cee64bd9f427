//! Logging setup over `tracing-subscriber`

pub mod setup;

pub use setup::{LoggingConfig, log_welcome, parse_log_level, setup_logging};
