//! # Session-Core
//!
//! Per-call session orchestration between a carrier's media stream and a
//! realtime speech engine.
//!
//! This crate provides:
//! - One [`CallSession`] per call with a strict lifecycle state machine
//! - Bidirectional audio relay over bounded, drop-oldest queues
//! - Barge-in handling that flushes agent audio when the caller speaks
//! - Dispatch of engine tool calls to registered business functions
//! - A process-wide [`SessionRegistry`] plus point-in-time metrics
//! - WebSocket and in-memory transports for both peers
//!
//! ## Architecture
//!
//! Each session runs four relay tasks (a reader and a writer per peer) and
//! a supervisor. All per-call state lives behind one lock in the session;
//! the registry is the only structure shared across calls.

pub mod config;
pub mod errors;
pub mod events;
pub mod functions;
pub mod metrics;
pub mod orchestrator;
pub mod protocol;
pub mod registry;
pub mod relay;
pub mod session;
pub mod transport;
pub mod turn;
pub mod types;

pub use config::{EngineConfig, FunctionsConfig, RelayConfig, RelaySettings, TurnConfig, VadSource};
pub use errors::{Result, SessionError};
pub use events::{EventBus, SessionEvent, SessionEventSubscriber};
pub use functions::{
    ArgValue, Arguments, FunctionCallRequest, FunctionCallStatus, FunctionDispatcher, FunctionName,
    FunctionRegistry, ToolContext, ToolError, ToolHandler, handler_fn,
};
pub use metrics::MetricsSnapshot;
pub use orchestrator::Orchestrator;
pub use registry::SessionRegistry;
pub use session::CallSession;
pub use transport::{
    Connection, EngineConnector, MemoryDialer, MemoryEngineConnector, MemoryPeer, MemoryTelephonyTransport,
    TelephonyTransport, WsEngineConnector, WsTelephonyListener,
};
pub use types::{
    CallId, CallState, CallSummary, CallerMetadata, Peer, SessionSnapshot, Speaker, TerminationReason,
};

/// Version information for the session library
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
