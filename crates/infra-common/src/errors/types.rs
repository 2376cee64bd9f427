use thiserror::Error;

/// Result type for infrastructure operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by the shared infrastructure layer
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration could not be loaded or deserialized
    #[error("Configuration error: {0}")]
    Config(String),

    /// The global tracing subscriber could not be installed
    #[error("Logging error: {0}")]
    Logging(String),
}

impl Error {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }
}

impl From<config::ConfigError> for Error {
    fn from(err: config::ConfigError) -> Self {
        Error::Config(err.to_string())
    }
}
