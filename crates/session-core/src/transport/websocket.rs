//! WebSocket transports for both peers

use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use http::HeaderValue;
use http::header::AUTHORIZATION;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tracing::{debug, info, warn};

use super::{Connection, EngineConnector, FrameSink, FrameSource, TelephonyTransport};
use crate::config::EngineConfig;
use crate::errors::{Result, SessionError};
use crate::types::Peer;

struct WsSource<S> {
    peer: Peer,
    stream: SplitStream<WebSocketStream<S>>,
}

#[async_trait]
impl<S> FrameSource for WsSource<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn recv(&mut self) -> Result<Option<String>> {
        loop {
            match self.stream.next().await {
                Some(Ok(Message::Text(text))) => return Ok(Some(text.as_str().to_owned())),
                Some(Ok(Message::Binary(data))) => {
                    debug!(peer = %self.peer, len = data.len(), "ignoring binary frame");
                }
                Some(Ok(Message::Close(frame))) => {
                    debug!(peer = %self.peer, ?frame, "close frame received");
                    return Ok(None);
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(SessionError::disconnect(self.peer, e.to_string())),
                None => return Ok(None),
            }
        }
    }
}

struct WsSink<S> {
    peer: Peer,
    sink: SplitSink<WebSocketStream<S>, Message>,
    closed: bool,
}

#[async_trait]
impl<S> FrameSink for WsSink<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn send(&mut self, text: String) -> Result<()> {
        if self.closed {
            return Err(SessionError::disconnect(self.peer, "connection closed"));
        }
        self.sink
            .send(Message::Text(text.into()))
            .await
            .map_err(|e| SessionError::disconnect(self.peer, e.to_string()))
    }

    async fn close(&mut self) -> Result<()> {
        if std::mem::replace(&mut self.closed, true) {
            return Ok(());
        }
        self.sink
            .close()
            .await
            .map_err(|e| SessionError::disconnect(self.peer, e.to_string()))
    }
}

fn split<S>(peer: Peer, ws: WebSocketStream<S>) -> Connection
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (sink, stream) = ws.split();
    Connection {
        source: Box::new(WsSource { peer, stream }),
        sink: Box::new(WsSink {
            peer,
            sink,
            closed: false,
        }),
    }
}

/// Dials the realtime engine over TLS WebSocket
#[derive(Debug, Default, Clone)]
pub struct WsEngineConnector;

impl WsEngineConnector {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl EngineConnector for WsEngineConnector {
    async fn connect(&self, config: &EngineConfig) -> Result<Connection> {
        let mut request = config
            .endpoint()
            .into_client_request()
            .map_err(|e| SessionError::handshake(format!("invalid engine url: {}", e)))?;

        let headers = request.headers_mut();
        if !config.api_key.is_empty() {
            let bearer = HeaderValue::from_str(&format!("Bearer {}", config.api_key))
                .map_err(|_| SessionError::handshake("api key is not a valid header value"))?;
            headers.insert(AUTHORIZATION, bearer);
        }
        headers.insert("openai-beta", HeaderValue::from_static("realtime=v1"));

        let (ws, response) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(|e| SessionError::handshake(e.to_string()))?;
        debug!(status = %response.status(), url = %config.url, "engine connection open");
        Ok(split(Peer::Engine, ws))
    }
}

/// Default bound on the WebSocket upgrade of one accepted TCP connection
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Accepts carrier media streams on a TCP port
///
/// Upgrades run as their own tasks, each bounded by the handshake timeout,
/// so a client that connects and never upgrades does not hold up the
/// streams behind it.
pub struct WsTelephonyListener {
    listener: TcpListener,
    handshake_timeout: Duration,
    handshakes: Mutex<JoinSet<Option<Connection>>>,
}

impl fmt::Debug for WsTelephonyListener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WsTelephonyListener")
            .field("local_addr", &self.listener.local_addr().ok())
            .field("handshake_timeout", &self.handshake_timeout)
            .finish_non_exhaustive()
    }
}

impl WsTelephonyListener {
    pub async fn bind(addr: impl ToSocketAddrs) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| SessionError::config(format!("cannot bind media stream listener: {}", e)))?;
        if let Ok(addr) = listener.local_addr() {
            info!(%addr, "media stream listener bound");
        }
        Ok(Self {
            listener,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            handshakes: Mutex::new(JoinSet::new()),
        })
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener
            .local_addr()
            .map_err(|e| SessionError::config(e.to_string()))
    }
}

async fn upgrade(tcp: TcpStream, remote: SocketAddr, timeout: Duration) -> Option<Connection> {
    match tokio::time::timeout(timeout, tokio_tungstenite::accept_async(tcp)).await {
        Ok(Ok(ws)) => {
            debug!(%remote, "media stream connected");
            Some(split(Peer::Telephony, ws))
        }
        Ok(Err(e)) => {
            warn!(%remote, error = %e, "websocket handshake failed");
            None
        }
        Err(_) => {
            warn!(%remote, ?timeout, "websocket handshake timed out");
            None
        }
    }
}

enum Accepted {
    Tcp(TcpStream, SocketAddr),
    Upgraded(Option<Connection>),
}

#[async_trait]
impl TelephonyTransport for WsTelephonyListener {
    async fn accept(&self) -> Result<Option<Connection>> {
        let mut handshakes = self.handshakes.lock().await;
        loop {
            let accepted = tokio::select! {
                tcp = self.listener.accept() => {
                    let (tcp, remote) = tcp.map_err(|e| SessionError::disconnect(Peer::Telephony, e.to_string()))?;
                    Accepted::Tcp(tcp, remote)
                }
                Some(joined) = handshakes.join_next(), if !handshakes.is_empty() => match joined {
                    Ok(connection) => Accepted::Upgraded(connection),
                    Err(e) => {
                        warn!(error = %e, "websocket handshake task failed");
                        Accepted::Upgraded(None)
                    }
                },
            };
            match accepted {
                Accepted::Tcp(tcp, remote) => {
                    handshakes.spawn(upgrade(tcp, remote, self.handshake_timeout));
                }
                Accepted::Upgraded(Some(connection)) => return Ok(Some(connection)),
                Accepted::Upgraded(None) => {}
            }
        }
    }
}
