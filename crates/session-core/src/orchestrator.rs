//! Session orchestrator
//!
//! Entry point for the process: owns the registry, the function dispatcher
//! and the engine connector, creates one [`CallSession`] per inbound call
//! and routes carrier media streams to them.
//!
//! ```no_run
//! use std::sync::Arc;
//! use callrelay_session_core::{
//!     FunctionRegistry, Orchestrator, RelayConfig, WsEngineConnector, WsTelephonyListener,
//! };
//!
//! # async fn run(functions: FunctionRegistry) -> callrelay_session_core::Result<()> {
//! let orchestrator = Orchestrator::new(RelayConfig::default(), functions, Arc::new(WsEngineConnector::new()))?;
//! let listener = WsTelephonyListener::bind("0.0.0.0:8080").await?;
//! orchestrator.serve(Arc::new(listener)).await
//! # }
//! ```

use std::sync::Arc;
use std::time::Duration;

use callrelay_codec_core::{AudioFormat, FrameCodec};
use callrelay_infra_common::mask_phone;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span, warn};

use crate::config::RelayConfig;
use crate::errors::{Result, SessionError};
use crate::events::{EventBus, SessionEvent, SessionEventSubscriber};
use crate::functions::{FunctionDispatcher, FunctionRegistry};
use crate::metrics::MetricsSnapshot;
use crate::protocol::telephony::{self, StreamStart, TelephonyEvent};
use crate::registry::SessionRegistry;
use crate::session::{CallSession, supervisor};
use crate::transport::{Connection, EngineConnector, TelephonyTransport};
use crate::types::{CallId, CallerMetadata, Peer, SessionSnapshot, TerminationReason};

#[derive(Clone)]
pub struct Orchestrator {
    config: Arc<RelayConfig>,
    dispatcher: Arc<FunctionDispatcher>,
    connector: Arc<dyn EngineConnector>,
    registry: Arc<SessionRegistry>,
    events: EventBus,
    codec: FrameCodec,
    shutdown: CancellationToken,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("sessions", &self.registry.snapshot_count())
            .field("codec", &self.codec)
            .finish()
    }
}

impl Orchestrator {
    /// Validate the configuration and bind function handlers
    ///
    /// Fails if any enabled function has no handler in `functions`.
    pub fn new(
        config: RelayConfig,
        functions: FunctionRegistry,
        connector: Arc<dyn EngineConnector>,
    ) -> Result<Self> {
        config.validate()?;
        let dispatcher = FunctionDispatcher::new(
            functions,
            config.functions.enabled.clone(),
            config.functions.timeout(),
        )?;
        let codec = FrameCodec::new(AudioFormat::engine(config.engine.audio_format))?;
        info!(
            engine = %config.engine.url,
            format = %config.engine.audio_format.as_str(),
            functions = dispatcher.advertised().len(),
            "orchestrator ready"
        );
        Ok(Self {
            config: Arc::new(config),
            dispatcher: Arc::new(dispatcher),
            connector,
            registry: Arc::new(SessionRegistry::new()),
            events: EventBus::new(),
            codec,
            shutdown: CancellationToken::new(),
        })
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    /// Register a session for a new call and start connecting to the engine
    ///
    /// Telephony may be attached at any point afterwards; caller audio is
    /// not relayed before the session is active.
    pub fn create_session(&self, call_id: CallId, caller: CallerMetadata) -> Result<CallSession> {
        if self.shutdown.is_cancelled() {
            return Err(SessionError::invalid_state("orchestrator is shutting down"));
        }
        let session = CallSession::new(
            call_id.clone(),
            caller.clone(),
            self.config.clone(),
            self.codec,
            self.dispatcher.clone(),
            self.events.clone(),
        );
        let session = self.registry.create(call_id.clone(), session)?;

        info!(
            call_id = %call_id,
            from = %caller.from.as_deref().map(mask_phone).unwrap_or_default(),
            "session created"
        );
        self.events.publish(SessionEvent::Created {
            call_id: call_id.clone(),
            caller,
        });

        let span = info_span!("call", call_id = %call_id);
        tokio::spawn(
            supervisor::run(session.clone(), self.connector.clone(), self.registry.clone()).instrument(span),
        );
        Ok(session)
    }

    /// Attach a media stream to an existing session
    pub async fn attach_telephony(&self, call_id: &CallId, connection: Connection) -> Result<()> {
        self.registry.get(call_id)?.attach_telephony(connection, None).await
    }

    /// Route a fresh media stream by its `start` event
    ///
    /// The stream joins the session registered for its call sid, or a new
    /// session is created for it.
    pub async fn accept_stream(&self, connection: Connection) -> Result<CallSession> {
        let Connection { mut source, sink } = connection;
        let timeout = self.config.engine.negotiation_timeout();
        let limit = self.config.relay.max_protocol_violations;

        let start = tokio::time::timeout(timeout, async {
            let mut violations = 0;
            loop {
                let text = source
                    .recv()
                    .await?
                    .ok_or_else(|| SessionError::disconnect(Peer::Telephony, "closed before start"))?;
                match telephony::decode(&text) {
                    Ok(TelephonyEvent::Start { start }) => return Ok::<StreamStart, SessionError>(start),
                    Ok(event) => debug!(event = event.name(), "event before stream start skipped"),
                    Err(e) => {
                        violations += 1;
                        warn!(error = %e, "malformed message before stream start");
                        if violations >= limit {
                            return Err(e);
                        }
                    }
                }
            }
        })
        .await
        .map_err(|_| SessionError::protocol_violation(Peer::Telephony, "no start event"))??;

        let call_id = start
            .call_sid
            .clone()
            .map(CallId::from)
            .unwrap_or_else(CallId::generate);
        let session = match self.registry.get(&call_id) {
            Ok(existing) if !existing.snapshot().telephony_attached => existing,
            Ok(_) => return Err(SessionError::already_exists(call_id.as_str())),
            Err(_) => self.create_session(call_id, start.caller_metadata())?,
        };
        session.attach_telephony(Connection { source, sink }, Some(start)).await?;
        Ok(session)
    }

    /// Accept media streams until the transport ends or shutdown begins
    pub async fn serve(&self, transport: Arc<dyn TelephonyTransport>) -> Result<()> {
        loop {
            let accepted = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                accepted = transport.accept() => accepted?,
            };
            let Some(connection) = accepted else {
                debug!("telephony transport ended");
                break;
            };
            let orchestrator = self.clone();
            tokio::spawn(async move {
                if let Err(e) = orchestrator.accept_stream(connection).await {
                    warn!(error = %e, "media stream rejected");
                }
            });
        }
        Ok(())
    }

    /// Hang up one call; false if it was already ending
    pub fn hangup(&self, call_id: &CallId) -> Result<bool> {
        Ok(self.registry.get(call_id)?.terminate(TerminationReason::Hangup))
    }

    /// Terminate every live session, returning how many were told to stop
    pub fn terminate_all(&self) -> usize {
        self.registry
            .sessions()
            .iter()
            .filter(|session| session.terminate(TerminationReason::Shutdown))
            .count()
    }

    /// Stop accepting calls, end all sessions and wait for them to close
    pub async fn shutdown(&self, grace: Duration) {
        self.shutdown.cancel();
        let terminated = self.terminate_all();
        info!(terminated, "orchestrator shutting down");

        let sessions = self.registry.sessions();
        let closing = futures::future::join_all(sessions.iter().map(|session| session.closed()));
        if tokio::time::timeout(grace, closing).await.is_err() {
            warn!(remaining = self.registry.snapshot_count(), "sessions still open after shutdown grace");
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        MetricsSnapshot::from_registry(&self.registry)
    }

    pub fn session(&self, call_id: &CallId) -> Result<SessionSnapshot> {
        Ok(self.registry.get(call_id)?.snapshot())
    }

    pub fn get(&self, call_id: &CallId) -> Result<CallSession> {
        self.registry.get(call_id)
    }

    pub fn subscribe(&self) -> SessionEventSubscriber {
        self.events.subscribe()
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }
}
