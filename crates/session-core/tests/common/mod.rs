//! Shared harness for the session integration tests
//!
//! Plays both peers over in-memory connections: the test drives the
//! carrier side through a [`MemoryPeer`] and answers for the engine through
//! the peer handed out by [`MemoryEngineConnector`].

#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use callrelay_codec_core::encode_payload;
use callrelay_session_core::transport::FrameSink;
use callrelay_session_core::transport::memory::pair;
use callrelay_session_core::{
    ArgValue, CallId, CallSession, CallState, CallerMetadata, Connection, EngineConfig, EngineConnector, FunctionName,
    FunctionRegistry, MemoryEngineConnector, MemoryPeer, Orchestrator, Peer, RelayConfig, ToolError, handler_fn,
};
use serde_json::{Value, json};
use tokio::sync::{mpsc, watch};

/// Upper bound for any single wait; generous so paused-clock tests are not
/// cut short before the timer under test fires
pub const WAIT: Duration = Duration::from_secs(60);

pub const STREAM_SID: &str = "MZ00000000000000000000000000000001";

pub fn test_config() -> RelayConfig {
    let mut config = RelayConfig::default();
    config.engine.api_key = "sk-test".into();
    config.engine.greeting = None;
    config
}

/// Handlers for every function, answering from fixed data
pub fn stub_functions() -> FunctionRegistry {
    FunctionRegistry::new()
        .with(
            FunctionName::LookupOrder,
            handler_fn(|_ctx, args| async move {
                match args.str("order_id") {
                    Some("ABC123") => Ok(json!({"status": "Delivered"})),
                    Some(other) => Err(ToolError::NotFound(format!("order {}", other))),
                    None => Err(ToolError::Invalid("order_id missing".into())),
                }
            }),
        )
        .with(
            FunctionName::TransferToHuman,
            handler_fn(|_ctx, _args| async { Err::<Value, _>(ToolError::Unavailable("no agents on shift".into())) }),
        )
        .with(
            FunctionName::CheckProductAvailability,
            handler_fn(|_ctx, args| async move {
                let quantity = match args.get("quantity") {
                    Some(ArgValue::Integer(n)) => *n,
                    _ => 1,
                };
                Ok(json!({"product": args.str("product_name"), "in_stock": quantity <= 5}))
            }),
        )
        .with(
            FunctionName::CreateTicket,
            handler_fn(|ctx, _args| async move { Ok(json!({"ticket_id": format!("T-{}", ctx.function_call_id)})) }),
        )
}

pub fn caller() -> CallerMetadata {
    CallerMetadata {
        from: Some("+15551234567".into()),
        to: Some("+15557654321".into()),
        ..CallerMetadata::default()
    }
}

pub struct Harness {
    pub orchestrator: Orchestrator,
    pub connector: Arc<MemoryEngineConnector>,
    pub engines: mpsc::UnboundedReceiver<MemoryPeer>,
}

pub struct Call {
    pub session: CallSession,
    pub caller: MemoryPeer,
    pub engine: MemoryPeer,
}

impl Harness {
    pub fn new(config: RelayConfig, functions: FunctionRegistry) -> Self {
        let (connector, engines) = MemoryEngineConnector::new();
        let orchestrator = Orchestrator::new(config, functions, connector.clone()).expect("valid config");
        Self {
            orchestrator,
            connector,
            engines,
        }
    }

    /// Like [`Harness::new`], with the memory connector wrapped by `wrap`
    pub fn with_connector(
        config: RelayConfig,
        functions: FunctionRegistry,
        wrap: impl FnOnce(Arc<MemoryEngineConnector>) -> Arc<dyn EngineConnector>,
    ) -> Self {
        let (connector, engines) = MemoryEngineConnector::new();
        let orchestrator = Orchestrator::new(config, functions, wrap(connector.clone())).expect("valid config");
        Self {
            orchestrator,
            connector,
            engines,
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(test_config(), stub_functions())
    }

    /// Next engine connection opened by any session
    pub async fn next_engine(&mut self) -> MemoryPeer {
        tokio::time::timeout(WAIT, self.engines.recv())
            .await
            .expect("engine connection in time")
            .expect("connector alive")
    }

    /// Create a session and complete negotiation for it
    pub async fn negotiate(&mut self, call_id: &str) -> (CallSession, MemoryPeer) {
        let session = self
            .orchestrator
            .create_session(CallId::new(call_id), caller())
            .expect("session created");
        let mut engine = self.next_engine().await;
        expect_type(&mut engine, "session.update").await;
        assert!(engine.send_json(&json!({"type": "session.updated"})));
        let state = tokio::time::timeout(WAIT, session.wait_for_state(|s| s == CallState::Active))
            .await
            .expect("session active in time");
        assert_eq!(state, CallState::Active);
        (session, engine)
    }

    /// Active session with the carrier's media stream attached and started
    pub async fn start_call(&mut self, call_id: &str) -> Call {
        let (session, engine) = self.negotiate(call_id).await;
        let (connection, caller) = pair(Peer::Telephony);
        session.attach_telephony(connection, None).await.expect("telephony attached");
        assert!(caller.send_json(&start_event(STREAM_SID, call_id)));
        eventually(|| session.snapshot().stream_sid.is_some()).await;
        Call {
            session,
            caller,
            engine,
        }
    }
}

/// Holds back writes to the engine while shut, like a peer that stopped
/// reading
pub struct Valve {
    open: watch::Sender<bool>,
    blocked: AtomicUsize,
}

impl Valve {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            open: watch::Sender::new(true),
            blocked: AtomicUsize::new(0),
        })
    }

    pub fn shut(&self) {
        self.open.send_replace(false);
    }

    pub fn open(&self) {
        self.open.send_replace(true);
    }

    /// Sends currently waiting for the valve to open
    pub fn blocked(&self) -> usize {
        self.blocked.load(Ordering::SeqCst)
    }
}

struct ValveSink {
    inner: Box<dyn FrameSink>,
    valve: Arc<Valve>,
    close_hangs: bool,
}

#[async_trait]
impl FrameSink for ValveSink {
    async fn send(&mut self, text: String) -> callrelay_session_core::Result<()> {
        let mut open = self.valve.open.subscribe();
        if !*open.borrow_and_update() {
            self.valve.blocked.fetch_add(1, Ordering::SeqCst);
            let _ = open.wait_for(|open| *open).await;
            self.valve.blocked.fetch_sub(1, Ordering::SeqCst);
        }
        self.inner.send(text).await
    }

    async fn close(&mut self) -> callrelay_session_core::Result<()> {
        if self.close_hangs {
            std::future::pending::<()>().await;
        }
        self.inner.close().await
    }
}

/// Memory engine connector whose sinks go through a [`Valve`]
pub struct ValveConnector {
    inner: Arc<MemoryEngineConnector>,
    valve: Arc<Valve>,
    close_hangs: bool,
}

impl ValveConnector {
    pub fn new(inner: Arc<MemoryEngineConnector>, valve: Arc<Valve>) -> Self {
        Self {
            inner,
            valve,
            close_hangs: false,
        }
    }

    /// Sinks whose close never completes
    pub fn with_hanging_close(mut self) -> Self {
        self.close_hangs = true;
        self
    }
}

#[async_trait]
impl EngineConnector for ValveConnector {
    async fn connect(&self, config: &EngineConfig) -> callrelay_session_core::Result<Connection> {
        let connection = self.inner.connect(config).await?;
        Ok(valve_sink(connection, self.valve.clone(), self.close_hangs))
    }
}

fn valve_sink(connection: Connection, valve: Arc<Valve>, close_hangs: bool) -> Connection {
    let Connection { source, sink } = connection;
    Connection {
        source,
        sink: Box::new(ValveSink {
            inner: sink,
            valve,
            close_hangs,
        }),
    }
}

/// Route a connection's writes through `valve`
pub fn through_valve(connection: Connection, valve: Arc<Valve>) -> Connection {
    valve_sink(connection, valve, false)
}

/// Poll `condition` until it holds
pub async fn eventually(condition: impl Fn() -> bool) {
    tokio::time::timeout(WAIT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition reached in time");
}

/// Receive frames until one whose `field` equals `value`, skipping others
async fn expect_field(peer: &mut MemoryPeer, field: &str, value: &str) -> Value {
    tokio::time::timeout(WAIT, async {
        loop {
            let frame: Value = peer.recv_json().await.expect("peer still open");
            if frame[field] == value {
                return frame;
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("no {} '{}' received", field, value))
}

/// Next engine command of the given `type`
pub async fn expect_type(engine: &mut MemoryPeer, kind: &str) -> Value {
    expect_field(engine, "type", kind).await
}

/// Next telephony command of the given `event`
pub async fn expect_event(caller: &mut MemoryPeer, event: &str) -> Value {
    expect_field(caller, "event", event).await
}

/// Drain a peer until the session closes its side
pub async fn drain(peer: &mut MemoryPeer) -> Vec<Value> {
    tokio::time::timeout(WAIT, async {
        let mut frames = Vec::new();
        while let Some(text) = peer.recv().await {
            if let Ok(value) = serde_json::from_str(&text) {
                frames.push(value);
            }
        }
        frames
    })
    .await
    .expect("peer closed in time")
}

pub fn start_event(stream_sid: &str, call_sid: &str) -> Value {
    json!({
        "event": "start",
        "streamSid": stream_sid,
        "start": {
            "streamSid": stream_sid,
            "callSid": call_sid,
            "accountSid": "AC0000",
            "tracks": ["inbound"],
            "customParameters": {"from": "+15551234567", "to": "+15557654321"}
        }
    })
}

pub fn media_event(payload: &[u8]) -> Value {
    json!({
        "event": "media",
        "streamSid": STREAM_SID,
        "media": {"track": "inbound", "payload": encode_payload(payload)}
    })
}

pub fn audio_delta(response_id: &str, audio: &[u8]) -> Value {
    json!({
        "type": "response.audio.delta",
        "response_id": response_id,
        "delta": encode_payload(audio)
    })
}

pub fn function_call(call_id: &str, name: &str, arguments: Value) -> Value {
    json!({
        "type": "response.function_call_arguments.done",
        "call_id": call_id,
        "name": name,
        "arguments": arguments.to_string()
    })
}

/// Decoded payload of a telephony `media` command or engine append
pub fn payload_of(frame: &Value) -> Vec<u8> {
    let encoded = frame["media"]["payload"]
        .as_str()
        .or_else(|| frame["audio"].as_str())
        .expect("audio payload");
    callrelay_codec_core::decode_payload(encoded).expect("valid base64").to_vec()
}
