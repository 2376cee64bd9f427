use crate::errors::types::{Error, Result};
use std::str::FromStr;
use tracing::Level;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::{EnvFilter, fmt};

/// How the relay process writes its logs
///
/// Built once at startup by the binary; library crates only emit events.
#[derive(Debug, Clone, PartialEq)]
pub struct LoggingConfig {
    /// Baseline level, refined by `RUST_LOG` directives
    pub level: Level,
    /// One JSON object per line, with the current `call` span attached
    pub json: bool,
    /// Source file and line on every event
    pub file_info: bool,
    /// Emit span open/close events (one pair per call)
    pub log_spans: bool,
    /// Colour escape codes; off when logs go to a collector
    pub ansi: bool,
    /// Name printed by [`log_welcome`]
    pub app_name: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: Level::INFO,
            json: false,
            file_info: false,
            log_spans: false,
            ansi: true,
            app_name: "callrelay".to_string(),
        }
    }
}

impl LoggingConfig {
    pub fn new(level: Level, app_name: impl Into<String>) -> Self {
        LoggingConfig {
            level,
            app_name: app_name.into(),
            ..Default::default()
        }
    }

    /// JSON lines output; also turns colour off
    pub fn with_json(mut self) -> Self {
        self.json = true;
        self.ansi = false;
        self
    }

    pub fn with_file_info(mut self) -> Self {
        self.file_info = true;
        self
    }

    pub fn with_spans(mut self) -> Self {
        self.log_spans = true;
        self
    }

    pub fn without_ansi(mut self) -> Self {
        self.ansi = false;
        self
    }

    fn span_events(&self) -> FmtSpan {
        if self.log_spans {
            FmtSpan::NEW | FmtSpan::CLOSE
        } else {
            FmtSpan::NONE
        }
    }
}

/// Install the global subscriber
///
/// Fails with [`Error::Logging`] if one is already installed.
pub fn setup_logging(config: LoggingConfig) -> Result<()> {
    let filter = EnvFilter::from_default_env().add_directive(config.level.into());

    let builder = fmt::Subscriber::builder()
        .with_env_filter(filter)
        .with_span_events(config.span_events())
        .with_ansi(config.ansi)
        .with_file(config.file_info)
        .with_line_number(config.file_info);

    let installed = if config.json {
        builder.json().with_current_span(true).try_init()
    } else {
        builder.try_init()
    };

    installed.map_err(|e| Error::Logging(e.to_string()))
}

/// Parse a level name such as `debug` or `WARN`
pub fn parse_log_level(level: &str) -> Result<Level> {
    Level::from_str(level.trim()).map_err(|_| Error::Config(format!("invalid log level: {}", level)))
}

pub fn log_welcome(app_name: &str, version: &str) {
    tracing::info!(app = app_name, version, "starting");
}
