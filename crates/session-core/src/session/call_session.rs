//! Call session handle and shared block

use std::fmt;
use std::sync::Arc;

use callrelay_codec_core::{AudioFrame, EnergyVad, EnergyVadConfig, FrameCodec};
use callrelay_infra_common::TaskGroup;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info};

use super::state::SessionState;
use crate::config::{RelayConfig, VadSource};
use crate::errors::{Result, SessionError};
use crate::events::{EventBus, SessionEvent};
use crate::functions::FunctionDispatcher;
use crate::protocol::telephony::StreamStart;
use crate::protocol::{EngineCommand, TelephonyCommand};
use crate::relay::{FrameQueue, OutboundItem};
use crate::transport::{Connection, FrameSink};
use crate::types::{CallId, CallState, CallerMetadata, SessionSnapshot, TerminationReason};

type SinkSlot = tokio::sync::Mutex<Option<Box<dyn FrameSink>>>;

/// Everything the session's tasks share
pub(crate) struct SessionShared {
    pub call_id: CallId,
    pub config: Arc<RelayConfig>,
    pub state: Mutex<SessionState>,
    state_tx: watch::Sender<CallState>,
    /// Caller audio, converted to the engine format
    pub to_engine: FrameQueue<AudioFrame>,
    /// Agent audio and marks, in telephony format
    pub to_caller: FrameQueue<OutboundItem>,
    pub engine_control: mpsc::UnboundedSender<EngineCommand>,
    pub caller_control: mpsc::UnboundedSender<TelephonyCommand>,
    engine_control_rx: Mutex<Option<mpsc::UnboundedReceiver<EngineCommand>>>,
    caller_control_rx: Mutex<Option<mpsc::UnboundedReceiver<TelephonyCommand>>>,
    pub engine_sink: SinkSlot,
    pub telephony_sink: SinkSlot,
    pub tasks: TaskGroup,
    pub codec: FrameCodec,
    pub dispatcher: Arc<FunctionDispatcher>,
    pub events: EventBus,
    /// Relay-side detector, present when the relay performs VAD
    pub vad: Mutex<Option<EnergyVad>>,
}

impl SessionShared {
    /// Record a transition that already happened under the state lock
    pub fn announce(&self, old_state: CallState, new_state: CallState) {
        self.state_tx.send_replace(new_state);
        self.events.publish(SessionEvent::StateChanged {
            call_id: self.call_id.clone(),
            old_state,
            new_state,
        });
        debug!(call_id = %self.call_id, from = %old_state, to = %new_state, "session state changed");
    }

    /// Transition and announce; false if the state machine refused
    pub fn advance(&self, next: CallState) -> bool {
        let mut state = self.state.lock();
        match state.transition(next) {
            Some(previous) => {
                self.announce(previous, next);
                true
            }
            None => false,
        }
    }

    /// Enter `Terminating` once; later triggers are ignored
    pub fn terminate(&self, reason: TerminationReason) -> bool {
        {
            let mut state = self.state.lock();
            let previous = state.state;
            if !state.begin_termination(reason.clone()) {
                debug!(call_id = %self.call_id, %reason, "termination already in progress");
                return false;
            }
            self.announce(previous, CallState::Terminating);
        }
        info!(call_id = %self.call_id, %reason, "session terminating");
        self.to_engine.close();
        self.to_caller.close();
        self.tasks.cancel_all();
        true
    }

    pub fn is_ending(&self) -> bool {
        self.state.lock().state.is_ending()
    }

    pub fn take_engine_control(&self) -> Option<mpsc::UnboundedReceiver<EngineCommand>> {
        self.engine_control_rx.lock().take()
    }

    pub fn take_caller_control(&self) -> Option<mpsc::UnboundedReceiver<TelephonyCommand>> {
        self.caller_control_rx.lock().take()
    }

    /// Queue a command for the engine writer
    pub fn send_engine(&self, command: EngineCommand) {
        if self.engine_control.send(command).is_err() {
            debug!(call_id = %self.call_id, "engine writer gone, command dropped");
        }
    }

    /// Queue a command for the telephony writer
    pub fn send_caller(&self, command: TelephonyCommand) {
        if self.caller_control.send(command).is_err() {
            debug!(call_id = %self.call_id, "telephony writer gone, command dropped");
        }
    }

    pub fn subscribe_state(&self) -> watch::Receiver<CallState> {
        self.state_tx.subscribe()
    }
}

/// Handle to one call session
///
/// Cheap to clone; all clones refer to the same session.
#[derive(Clone)]
pub struct CallSession {
    pub(crate) shared: Arc<SessionShared>,
}

impl fmt::Debug for CallSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallSession")
            .field("call_id", &self.shared.call_id)
            .field("state", &self.state())
            .finish()
    }
}

impl CallSession {
    pub(crate) fn new(
        call_id: CallId,
        caller: CallerMetadata,
        config: Arc<RelayConfig>,
        codec: FrameCodec,
        dispatcher: Arc<FunctionDispatcher>,
        events: EventBus,
    ) -> Self {
        let (state_tx, _) = watch::channel(CallState::Initiating);
        let (engine_control, engine_control_rx) = mpsc::unbounded_channel();
        let (caller_control, caller_control_rx) = mpsc::unbounded_channel();
        let capacity = config.relay.max_buffered_frames;
        let vad = match config.turn.vad_source {
            VadSource::Telephony => Some(EnergyVad::new(EnergyVadConfig {
                threshold: config.turn.energy_threshold,
                onset_frames: config.turn.onset_frames,
                hangover_frames: config.turn.hangover_frames,
            })),
            VadSource::Engine => None,
        };

        let shared = SessionShared {
            state: Mutex::new(SessionState::new(call_id.clone(), caller)),
            state_tx,
            to_engine: FrameQueue::new(capacity),
            to_caller: FrameQueue::new(capacity),
            engine_control,
            caller_control,
            engine_control_rx: Mutex::new(Some(engine_control_rx)),
            caller_control_rx: Mutex::new(Some(caller_control_rx)),
            engine_sink: tokio::sync::Mutex::new(None),
            telephony_sink: tokio::sync::Mutex::new(None),
            tasks: TaskGroup::new(format!("call-{}", call_id)),
            codec,
            dispatcher,
            events,
            vad: Mutex::new(vad),
            config,
            call_id,
        };
        Self {
            shared: Arc::new(shared),
        }
    }

    pub fn call_id(&self) -> &CallId {
        &self.shared.call_id
    }

    pub fn state(&self) -> CallState {
        self.shared.state.lock().state
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.shared.state.lock().snapshot()
    }

    pub fn caller(&self) -> CallerMetadata {
        self.shared.state.lock().caller.clone()
    }

    /// Request termination; returns false if it was already requested
    pub fn terminate(&self, reason: TerminationReason) -> bool {
        self.shared.terminate(reason)
    }

    /// Wait until the session's state satisfies `predicate`
    ///
    /// Returns the matching state, or `Closed` if the session closed first.
    pub async fn wait_for_state(&self, predicate: impl Fn(CallState) -> bool) -> CallState {
        let mut rx = self.shared.subscribe_state();
        let result = rx
            .wait_for(|state| predicate(*state) || *state == CallState::Closed)
            .await
            .map(|state| *state);
        result.unwrap_or(CallState::Closed)
    }

    /// Wait until the session has fully closed
    pub async fn closed(&self) {
        self.wait_for_state(|state| state == CallState::Closed).await;
    }

    /// Attach the caller's media stream
    ///
    /// `start` is the stream's `start` event when the caller of this method
    /// already consumed it to route the stream.
    pub async fn attach_telephony(&self, connection: Connection, start: Option<StreamStart>) -> Result<()> {
        let shared = &self.shared;
        {
            let mut state = shared.state.lock();
            if state.state.is_ending() {
                return Err(SessionError::invalid_state(format!(
                    "cannot attach telephony to {} session",
                    state.state
                )));
            }
            if state.telephony_attached {
                return Err(SessionError::invalid_state("telephony already attached"));
            }
            state.telephony_attached = true;
        }
        let control = shared
            .take_caller_control()
            .ok_or_else(|| SessionError::invalid_state("telephony writer already started"))?;

        let Connection { source, sink } = connection;
        *shared.telephony_sink.lock().await = Some(sink);

        if let Some(start) = start {
            super::tasks::apply_stream_start(shared, &start);
        }

        let reader = super::tasks::telephony_reader(shared.clone(), source);
        shared.tasks.spawn("telephony-reader", reader);
        let writer = super::tasks::telephony_writer(shared.clone(), control);
        shared.tasks.spawn("telephony-writer", writer);
        debug!(call_id = %shared.call_id, "telephony attached");
        Ok(())
    }
}
