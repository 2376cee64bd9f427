//! In-process connections over unbounded channels

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::{Mutex, mpsc};

use super::{Connection, EngineConnector, FrameSink, FrameSource, TelephonyTransport};
use crate::config::EngineConfig;
use crate::errors::{Result, SessionError};
use crate::types::Peer;

struct ChannelSource {
    rx: mpsc::UnboundedReceiver<String>,
}

#[async_trait]
impl FrameSource for ChannelSource {
    async fn recv(&mut self) -> Result<Option<String>> {
        Ok(self.rx.recv().await)
    }
}

struct ChannelSink {
    peer: Peer,
    tx: Option<mpsc::UnboundedSender<String>>,
}

#[async_trait]
impl FrameSink for ChannelSink {
    async fn send(&mut self, text: String) -> Result<()> {
        let tx = self
            .tx
            .as_ref()
            .ok_or_else(|| SessionError::disconnect(self.peer, "connection closed"))?;
        tx.send(text)
            .map_err(|_| SessionError::disconnect(self.peer, "remote end dropped"))
    }

    async fn close(&mut self) -> Result<()> {
        self.tx = None;
        Ok(())
    }
}

/// The far end of an in-memory connection
///
/// Plays the carrier or the engine in tests: whatever it sends the session
/// reads, whatever the session writes it receives.
#[derive(Debug)]
pub struct MemoryPeer {
    tx: Option<mpsc::UnboundedSender<String>>,
    rx: mpsc::UnboundedReceiver<String>,
}

impl MemoryPeer {
    /// Send a raw text frame; false once this end or the session closed
    pub fn send(&self, text: impl Into<String>) -> bool {
        match &self.tx {
            Some(tx) => tx.send(text.into()).is_ok(),
            None => false,
        }
    }

    pub fn send_json<T: Serialize>(&self, value: &T) -> bool {
        match serde_json::to_string(value) {
            Ok(text) => self.send(text),
            Err(_) => false,
        }
    }

    /// Next frame written by the session; `None` once it closed its side
    pub async fn recv(&mut self) -> Option<String> {
        self.rx.recv().await
    }

    /// Next frame decoded as `T`; undecodable frames are skipped
    pub async fn recv_json<T: DeserializeOwned>(&mut self) -> Option<T> {
        while let Some(text) = self.rx.recv().await {
            if let Ok(value) = serde_json::from_str(&text) {
                return Some(value);
            }
        }
        None
    }

    pub fn try_recv(&mut self) -> Option<String> {
        self.rx.try_recv().ok()
    }

    /// Close this end; the session sees an orderly close
    pub fn close(&mut self) {
        self.tx = None;
    }

    pub fn is_closed(&self) -> bool {
        self.tx.as_ref().is_none_or(|tx| tx.is_closed())
    }
}

/// Create a connected pair: the session's [`Connection`] and its far end
pub fn pair(peer: Peer) -> (Connection, MemoryPeer) {
    let (to_session, from_peer) = mpsc::unbounded_channel();
    let (to_peer, from_session) = mpsc::unbounded_channel();
    let connection = Connection {
        source: Box::new(ChannelSource { rx: from_peer }),
        sink: Box::new(ChannelSink {
            peer,
            tx: Some(to_peer),
        }),
    };
    let far_end = MemoryPeer {
        tx: Some(to_session),
        rx: from_session,
    };
    (connection, far_end)
}

/// Engine connector handing the far end of every connection to the test
#[derive(Debug)]
pub struct MemoryEngineConnector {
    peers: mpsc::UnboundedSender<MemoryPeer>,
    refuse: AtomicBool,
    connects: AtomicUsize,
}

impl MemoryEngineConnector {
    /// Returns the connector and the stream of engine-side peers it creates
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<MemoryPeer>) {
        let (peers, rx) = mpsc::unbounded_channel();
        let connector = Arc::new(Self {
            peers,
            refuse: AtomicBool::new(false),
            connects: AtomicUsize::new(0),
        });
        (connector, rx)
    }

    /// Make every subsequent connect attempt fail
    pub fn set_refusing(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::SeqCst);
    }

    /// Connect attempts so far, refused ones included
    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EngineConnector for MemoryEngineConnector {
    async fn connect(&self, _config: &EngineConfig) -> Result<Connection> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if self.refuse.load(Ordering::SeqCst) {
            return Err(SessionError::handshake("connection refused"));
        }
        let (connection, far_end) = pair(Peer::Engine);
        self.peers
            .send(far_end)
            .map_err(|_| SessionError::handshake("engine endpoint gone"))?;
        Ok(connection)
    }
}

/// Telephony transport fed by a [`MemoryDialer`]
#[derive(Debug)]
pub struct MemoryTelephonyTransport {
    incoming: Mutex<mpsc::UnboundedReceiver<Connection>>,
}

/// Places calls into a [`MemoryTelephonyTransport`]
#[derive(Debug, Clone)]
pub struct MemoryDialer {
    outgoing: mpsc::UnboundedSender<Connection>,
}

impl MemoryTelephonyTransport {
    pub fn new() -> (Self, MemoryDialer) {
        let (outgoing, incoming) = mpsc::unbounded_channel();
        (
            Self {
                incoming: Mutex::new(incoming),
            },
            MemoryDialer { outgoing },
        )
    }
}

impl MemoryDialer {
    /// Open a media stream; `None` if the transport is gone
    pub fn dial(&self) -> Option<MemoryPeer> {
        let (connection, far_end) = pair(Peer::Telephony);
        self.outgoing.send(connection).ok().map(|_| far_end)
    }
}

#[async_trait]
impl TelephonyTransport for MemoryTelephonyTransport {
    async fn accept(&self) -> Result<Option<Connection>> {
        Ok(self.incoming.lock().await.recv().await)
    }
}
