//! Peer connections
//!
//! Both peers exchange JSON text frames, so a connection is a pair of text
//! halves: a [`FrameSource`] read by the session's reader task and a
//! [`FrameSink`] owned by its writer task. [`memory`] provides channel-backed
//! connections for tests and embedding; [`websocket`] the real thing.

use async_trait::async_trait;

use crate::config::EngineConfig;
use crate::errors::Result;

pub mod memory;
pub mod websocket;

pub use memory::{MemoryDialer, MemoryEngineConnector, MemoryPeer, MemoryTelephonyTransport};
pub use websocket::{WsEngineConnector, WsTelephonyListener};

/// Inbound half of a connection
#[async_trait]
pub trait FrameSource: Send {
    /// Next text frame; `Ok(None)` once the peer has closed
    async fn recv(&mut self) -> Result<Option<String>>;
}

/// Outbound half of a connection
#[async_trait]
pub trait FrameSink: Send {
    async fn send(&mut self, text: String) -> Result<()>;

    /// Close the connection; closing twice is harmless
    async fn close(&mut self) -> Result<()>;
}

/// Both halves of one peer connection
pub struct Connection {
    pub source: Box<dyn FrameSource>,
    pub sink: Box<dyn FrameSink>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection").finish_non_exhaustive()
    }
}

/// Opens the engine side of a session
#[async_trait]
pub trait EngineConnector: Send + Sync {
    async fn connect(&self, config: &EngineConfig) -> Result<Connection>;
}

/// Source of inbound telephony media streams
#[async_trait]
pub trait TelephonyTransport: Send + Sync {
    /// Wait for the next media stream; `Ok(None)` when the transport is done
    async fn accept(&self) -> Result<Option<Connection>>;
}
