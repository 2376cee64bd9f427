//! Shared infrastructure for the callrelay workspace
//!
//! - [`logging`]: `tracing-subscriber` setup
//! - [`config`]: layered defaults / TOML / environment loading
//! - [`tasks`]: cancellable task groups with bounded shutdown
//! - [`redact`]: masking of caller identifiers in logs

pub mod config;
pub mod errors;
pub mod logging;
pub mod redact;
pub mod tasks;

pub use config::{ConfigSource, load_config};
pub use errors::{Error, Result};
pub use logging::{LoggingConfig, log_welcome, setup_logging};
pub use redact::{mask_email, mask_phone};
pub use tasks::{ShutdownReport, TaskGroup};
