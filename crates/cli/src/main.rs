//! callrelay: relay carrier media streams through a realtime speech engine

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use callrelay_infra_common::logging::parse_log_level;
use callrelay_infra_common::{ConfigSource, LoggingConfig, log_welcome, setup_logging};
use callrelay_session_core::{
    FunctionRegistry, Orchestrator, RelayConfig, ToolError, WsEngineConnector, WsTelephonyListener, handler_fn,
};
use clap::{Parser, Subcommand};
use serde_json::Value;
use tracing::{info, warn};

const METRICS_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Parser)]
#[command(name = "callrelay", version, about = "Voice agent call relay")]
struct Cli {
    /// TOML configuration file
    #[arg(short, long, global = true, env = "CALLRELAY_CONFIG")]
    config: Option<PathBuf>,

    /// Minimum log level
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Log as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Accept media streams and relay them until interrupted
    Serve {
        /// Address for the media stream WebSocket listener
        #[arg(short, long, default_value = "0.0.0.0:8080", env = "CALLRELAY_LISTEN")]
        listen: String,

        /// Engine API key, taking precedence over the configuration file
        #[arg(long, env = "OPENAI_API_KEY", hide_env_values = true)]
        api_key: Option<String>,
    },
    /// Print the effective configuration as TOML
    PrintConfig,
}

fn load_config(path: Option<&PathBuf>) -> Result<RelayConfig> {
    let mut source = ConfigSource::defaults();
    if let Some(path) = path {
        source = source.with_file(path);
    }
    RelayConfig::load(&source.with_env()).context("invalid configuration")
}

/// Handlers for functions with no business backend wired in
///
/// Each call resolves to an `unavailable` error so the agent can tell the
/// caller instead of waiting out the function timeout.
fn unavailable_functions(config: &RelayConfig) -> FunctionRegistry {
    let mut registry = FunctionRegistry::new();
    for &name in &config.functions.enabled {
        registry.register(
            name,
            handler_fn(move |_ctx, _args| async move {
                Err::<Value, _>(ToolError::Unavailable(format!("no backend configured for {}", name)))
            }),
        );
    }
    registry
}

async fn serve(mut config: RelayConfig, listen: &str, api_key: Option<String>) -> Result<()> {
    if let Some(key) = api_key {
        config.engine.api_key = key;
    }
    if config.engine.api_key.is_empty() {
        warn!("no engine API key configured; engine connections will likely be refused");
    }

    let grace = config.relay.shutdown_grace();
    let functions = unavailable_functions(&config);
    let orchestrator = Orchestrator::new(config, functions, Arc::new(WsEngineConnector::new()))?;
    let listener = WsTelephonyListener::bind(listen).await?;
    info!(addr = %listener.local_addr()?, "accepting media streams");

    let server = {
        let orchestrator = orchestrator.clone();
        tokio::spawn(async move { orchestrator.serve(Arc::new(listener)).await })
    };

    let mut metrics = tokio::time::interval(METRICS_INTERVAL);
    metrics.tick().await;
    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                signal.context("cannot listen for interrupt")?;
                break;
            }
            _ = metrics.tick() => {
                let snapshot = orchestrator.metrics();
                info!(
                    active = snapshot.active_sessions,
                    engine_connections = snapshot.engine_connections,
                    function_pending = snapshot.function_pending_sessions,
                    interrupted = snapshot.interrupted_sessions,
                    "relay metrics"
                );
            }
        }
    }

    info!("interrupt received, draining calls");
    orchestrator.shutdown(grace * 2).await;
    server.await.context("listener task failed")??;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::PrintConfig => {
            let mut config = load_config(cli.config.as_ref())?;
            if !config.engine.api_key.is_empty() {
                config.engine.api_key = "<redacted>".to_string();
            }
            print!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
        Command::Serve { listen, api_key } => {
            let mut logging = LoggingConfig::new(parse_log_level(&cli.log_level)?, "callrelay");
            if cli.json_logs {
                logging = logging.with_json();
            }
            setup_logging(logging)?;
            log_welcome("callrelay", env!("CARGO_PKG_VERSION"));

            let config = load_config(cli.config.as_ref())?;
            serve(config, &listen, api_key).await
        }
    }
}
