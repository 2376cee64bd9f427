//! Relay tasks: one reader and one writer per peer
//!
//! Readers decode frames, update state under the session lock and push
//! into the outbound queues. Writers drain their peer's control channel
//! ahead of its audio queue and re-check the session state before every
//! send, so nothing reaches a peer once the session is terminating.

use std::sync::Arc;

use callrelay_codec_core::{
    AgentAudioStream, AudioFrame, Direction, FrameSplitter, TELEPHONY_FRAME_BYTES, VadTransition, decode_payload,
    encode_payload,
};
use chrono::Utc;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use super::call_session::SessionShared;
use super::state::PendingFunction;
use crate::config::VadSource;
use crate::events::SessionEvent;
use crate::functions::{FunctionCallRequest, Prepared, ToolContext};
use crate::protocol::engine::{self, EngineEvent};
use crate::protocol::telephony::{self, StreamStart, TelephonyEvent};
use crate::protocol::{EngineCommand, TelephonyCommand};
use crate::relay::OutboundItem;
use crate::transport::FrameSource;
use crate::turn::{self, FlushPlan};
use crate::types::{CallState, Peer, Speaker, TerminationReason};

enum Flow {
    Continue,
    Stop,
}

/// Count a malformed message and end the session past the limit
fn protocol_violation(shared: &SessionShared, peer: Peer, details: String) -> Flow {
    let count = shared.state.lock().record_violation(peer);
    let limit = shared.config.relay.max_protocol_violations;
    warn!(call_id = %shared.call_id, %peer, count, %details, "dropping malformed message");
    if count >= limit {
        shared.terminate(TerminationReason::ProtocolViolation(format!(
            "{} consecutive malformed messages from {}",
            count, peer
        )));
        return Flow::Stop;
    }
    Flow::Continue
}

// ---------------------------------------------------------------------------
// Telephony side
// ---------------------------------------------------------------------------

pub(crate) fn apply_stream_start(shared: &SessionShared, start: &StreamStart) {
    let metadata = start.caller_metadata();
    let mut state = shared.state.lock();
    if state.stream_sid.as_deref() != Some(start.stream_sid.as_str()) {
        debug!(call_id = %shared.call_id, stream_sid = %start.stream_sid, "media stream started");
    }
    state.stream_sid = Some(start.stream_sid.clone());
    if state.caller.from.is_none() {
        state.caller.from = metadata.from;
    }
    if state.caller.to.is_none() {
        state.caller.to = metadata.to;
    }
    state.caller.stream_sid = metadata.stream_sid;
    state.caller.custom_parameters.extend(metadata.custom_parameters);
}

pub(crate) async fn telephony_reader(shared: Arc<SessionShared>, mut source: Box<dyn FrameSource>) {
    loop {
        let text = match source.recv().await {
            Ok(Some(text)) => text,
            Ok(None) => {
                debug!(call_id = %shared.call_id, "telephony connection closed");
                shared.terminate(TerminationReason::TelephonyClosed);
                break;
            }
            Err(e) => {
                warn!(call_id = %shared.call_id, error = %e, "telephony connection failed");
                shared.terminate(TerminationReason::TelephonyClosed);
                break;
            }
        };

        let flow = match telephony::decode(&text) {
            Ok(event) => handle_telephony_event(&shared, event),
            Err(e) => protocol_violation(&shared, Peer::Telephony, e.to_string()),
        };
        if matches!(flow, Flow::Stop) {
            break;
        }
    }
}

fn handle_telephony_event(shared: &Arc<SessionShared>, event: TelephonyEvent) -> Flow {
    match event {
        TelephonyEvent::Connected => {
            trace!(call_id = %shared.call_id, "media stream connected");
        }
        TelephonyEvent::Start { start } => apply_stream_start(shared, &start),
        TelephonyEvent::Media { media } => {
            let payload = match decode_payload(&media.payload) {
                Ok(payload) => payload,
                Err(e) => return protocol_violation(shared, Peer::Telephony, e.to_string()),
            };
            relay_caller_audio(shared, payload);
        }
        TelephonyEvent::Mark { mark } => {
            let mut state = shared.state.lock();
            if state.pending_mark.as_deref() == Some(mark.name.as_str()) {
                state.pending_mark = None;
                state.outbound_audio = false;
                trace!(call_id = %shared.call_id, mark = %mark.name, "agent playback finished");
            }
        }
        TelephonyEvent::Dtmf { dtmf } => {
            debug!(call_id = %shared.call_id, digit = %dtmf.digit, "dtmf received");
        }
        TelephonyEvent::Stop => {
            info!(call_id = %shared.call_id, "media stream stopped by carrier");
            shared.terminate(TerminationReason::TelephonyStopped);
            return Flow::Stop;
        }
    }
    shared.state.lock().clear_violations(Peer::Telephony);
    Flow::Continue
}

fn relay_caller_audio(shared: &Arc<SessionShared>, payload: bytes::Bytes) {
    if shared.config.turn.vad_source == VadSource::Telephony {
        let samples = shared.codec.telephony_samples(&payload);
        let transition = shared.vad.lock().as_mut().and_then(|vad| vad.process(&samples));
        match transition {
            Some(VadTransition::SpeechStarted) => speech_started(shared),
            Some(VadTransition::SpeechStopped) => {
                speech_stopped(shared);
                // engine turn detection is off; close the caller's turn
                if shared.state.lock().state.is_relaying() {
                    shared.send_engine(EngineCommand::CommitAudio);
                    shared.send_engine(EngineCommand::create_response());
                }
            }
            None => {}
        }
    }

    let converted = match shared.codec.telephony_to_engine(payload) {
        Ok(converted) => converted,
        Err(e) => {
            warn!(call_id = %shared.call_id, error = %e, "dropping caller frame");
            return;
        }
    };

    let mut state = shared.state.lock();
    let sequence = state.counters.from_caller;
    state.counters.from_caller += 1;
    if !state.state.is_relaying() {
        trace!(call_id = %shared.call_id, state = %state.state, "caller audio before relay start dropped");
        return;
    }
    shared
        .to_engine
        .push(AudioFrame::new(Direction::CallerToAgent, converted, sequence));
}

pub(crate) async fn telephony_writer(shared: Arc<SessionShared>, mut control: mpsc::UnboundedReceiver<TelephonyCommand>) {
    loop {
        let (command, generation) = tokio::select! {
            biased;
            command = control.recv() => match command {
                Some(command) => (command, None),
                None => break,
            },
            item = shared.to_caller.pop() => match item {
                Some(item) => {
                    let generation = item.generation();
                    match outbound_command(&shared, item) {
                        Some(command) => (command, Some(generation)),
                        None => continue,
                    }
                }
                None => break,
            },
        };

        if shared.is_ending() {
            break;
        }
        let is_media = matches!(command, TelephonyCommand::Media { .. });
        let text = match command.encode() {
            Ok(text) => text,
            Err(e) => {
                warn!(call_id = %shared.call_id, error = %e, "cannot encode telephony command");
                continue;
            }
        };

        let sent = {
            let mut sink = shared.telephony_sink.lock().await;
            // a barge-in may have landed while waiting for the sink
            if let Some(generation) = generation {
                if !still_current(&shared, generation, is_media) {
                    continue;
                }
            }
            match sink.as_mut() {
                Some(sink) => sink.send(text).await,
                None => break,
            }
        };
        match sent {
            Ok(()) if is_media => shared.state.lock().counters.to_caller += 1,
            Ok(()) => {}
            Err(e) => {
                warn!(call_id = %shared.call_id, error = %e, "telephony send failed");
                shared.terminate(TerminationReason::TelephonyClosed);
                break;
            }
        }
    }
}

/// Whether agent output of `generation` may still be written, counting a
/// discarded media frame as flushed
fn still_current(shared: &SessionShared, generation: u64, is_media: bool) -> bool {
    let mut state = shared.state.lock();
    if turn::is_current(&state, generation) {
        return true;
    }
    if is_media {
        state.counters.flushed += 1;
    }
    false
}

/// Turn a queued item into a command, or drop it if stale
fn outbound_command(shared: &SessionShared, item: OutboundItem) -> Option<TelephonyCommand> {
    let mut state = shared.state.lock();
    if !turn::is_current(&state, item.generation()) {
        if matches!(item, OutboundItem::Audio { .. }) {
            state.counters.flushed += 1;
        }
        return None;
    }
    let Some(stream_sid) = state.stream_sid.clone() else {
        trace!(call_id = %shared.call_id, "no stream sid yet, agent frame dropped");
        return None;
    };
    Some(match item {
        OutboundItem::Audio { frame, .. } => TelephonyCommand::media(stream_sid, encode_payload(&frame.payload)),
        OutboundItem::Mark { name, .. } => TelephonyCommand::mark(stream_sid, name),
    })
}

// ---------------------------------------------------------------------------
// Engine side
// ---------------------------------------------------------------------------

/// Agent audio of one response generation on its way to 20 ms frames
struct AgentAudio {
    stream: AgentAudioStream,
    splitter: FrameSplitter,
    generation: u64,
}

impl AgentAudio {
    fn new(shared: &SessionShared) -> Self {
        Self {
            stream: AgentAudioStream::new(shared.codec),
            splitter: FrameSplitter::new(TELEPHONY_FRAME_BYTES),
            generation: 0,
        }
    }

    /// Drop partial audio left over from an interrupted generation
    fn sync(&mut self, generation: u64) {
        if self.generation != generation {
            self.reset();
            self.generation = generation;
        }
    }

    fn reset(&mut self) {
        self.stream.reset();
        self.splitter.clear();
    }
}

pub(crate) async fn engine_reader(shared: Arc<SessionShared>, mut source: Box<dyn FrameSource>) {
    let mut agent_audio = AgentAudio::new(&shared);

    loop {
        let text = match source.recv().await {
            Ok(Some(text)) => text,
            Ok(None) => {
                engine_lost(&shared, "engine connection closed");
                break;
            }
            Err(e) => {
                engine_lost(&shared, &e.to_string());
                break;
            }
        };

        let event = match engine::decode(&text) {
            Ok(event) => event,
            Err(e) => {
                if matches!(protocol_violation(&shared, Peer::Engine, e.to_string()), Flow::Stop) {
                    break;
                }
                continue;
            }
        };
        shared.state.lock().clear_violations(Peer::Engine);

        match event {
            EngineEvent::SessionCreated => debug!(call_id = %shared.call_id, "engine session created"),
            EngineEvent::SessionUpdated => session_updated(&shared),
            EngineEvent::ResponseCreated { response_id } => {
                trace!(call_id = %shared.call_id, ?response_id, "response started");
                shared.state.lock().response_active = true;
            }
            EngineEvent::AudioDelta { delta, .. } => {
                if let Err(details) = relay_agent_audio(&shared, &mut agent_audio, &delta) {
                    if matches!(protocol_violation(&shared, Peer::Engine, details), Flow::Stop) {
                        break;
                    }
                }
            }
            EngineEvent::AudioDone { .. } => finish_agent_audio(&shared, &mut agent_audio),
            EngineEvent::ResponseDone { response_id } => {
                trace!(call_id = %shared.call_id, ?response_id, "response done");
                shared.state.lock().response_active = false;
            }
            EngineEvent::FunctionCall { call_id, name, arguments } => {
                handle_function_call(&shared, call_id, name, arguments);
            }
            EngineEvent::SpeechStarted => {
                if shared.config.turn.vad_source == VadSource::Engine {
                    speech_started(&shared);
                }
            }
            EngineEvent::SpeechStopped => {
                if shared.config.turn.vad_source == VadSource::Engine {
                    speech_stopped(&shared);
                }
            }
            EngineEvent::OutputAudioCleared => flush_acknowledged(&shared),
            EngineEvent::AgentTranscript { transcript } => publish_transcript(&shared, Speaker::Agent, transcript),
            EngineEvent::CallerTranscript { transcript } => publish_transcript(&shared, Speaker::Caller, transcript),
            EngineEvent::ItemCreated { item } => {
                if let Some((role, text)) = engine::message_text(&item) {
                    debug!(call_id = %shared.call_id, role, text, "conversation item");
                }
            }
            EngineEvent::Error { code, message } => {
                warn!(call_id = %shared.call_id, ?code, %message, "engine reported error");
            }
            EngineEvent::Unknown(kind) => debug!(call_id = %shared.call_id, %kind, "ignoring engine event"),
        }
    }
}

fn engine_lost(shared: &SessionShared, details: &str) {
    let negotiating = matches!(shared.state.lock().state, CallState::Initiating | CallState::Negotiating);
    let reason = if negotiating {
        TerminationReason::UpstreamUnavailable
    } else {
        TerminationReason::EngineClosed
    };
    debug!(call_id = %shared.call_id, details, "engine connection lost");
    shared.terminate(reason);
}

fn session_updated(shared: &SessionShared) {
    if !shared.advance(CallState::Active) {
        debug!(call_id = %shared.call_id, "session parameters updated");
        return;
    }
    info!(call_id = %shared.call_id, "session active");
    if let Some(greeting) = &shared.config.engine.greeting {
        shared.send_engine(EngineCommand::greeting(greeting.clone()));
    }
}

fn relay_agent_audio(shared: &SessionShared, agent_audio: &mut AgentAudio, delta: &str) -> Result<(), String> {
    let raw = decode_payload(delta).map_err(|e| e.to_string())?;

    let mut state = shared.state.lock();
    agent_audio.sync(state.generation);
    if state.state != CallState::Active {
        // audio of a cancelled response still arriving
        if state.state == CallState::Interrupted {
            state.counters.flushed += 1;
        }
        return Ok(());
    }
    let audio = agent_audio.stream.convert(raw).map_err(|e| e.to_string())?;
    let generation = state.generation;
    for payload in agent_audio.splitter.push(&audio) {
        let sequence = state.counters.from_engine;
        state.counters.from_engine += 1;
        let frame = AudioFrame::new(Direction::AgentToCaller, payload, sequence);
        shared.to_caller.push(OutboundItem::Audio { frame, generation });
        state.outbound_audio = true;
    }
    Ok(())
}

fn finish_agent_audio(shared: &SessionShared, agent_audio: &mut AgentAudio) {
    let mut state = shared.state.lock();
    if state.state != CallState::Active || state.generation != agent_audio.generation {
        agent_audio.reset();
        return;
    }
    let generation = state.generation;
    if let Some(payload) = agent_audio.splitter.flush() {
        let sequence = state.counters.from_engine;
        state.counters.from_engine += 1;
        let frame = AudioFrame::new(Direction::AgentToCaller, payload, sequence);
        shared.to_caller.push(OutboundItem::Audio { frame, generation });
        state.outbound_audio = true;
    }
    agent_audio.stream.reset();
    if state.outbound_audio {
        let name = state.next_mark();
        shared.to_caller.push(OutboundItem::Mark { name, generation });
    }
}

fn publish_transcript(shared: &SessionShared, speaker: Speaker, text: String) {
    if text.is_empty() {
        return;
    }
    debug!(call_id = %shared.call_id, ?speaker, text = %text, "transcript");
    shared.events.publish(SessionEvent::Transcript {
        call_id: shared.call_id.clone(),
        speaker,
        text,
    });
}

pub(crate) async fn engine_writer(shared: Arc<SessionShared>, mut control: mpsc::UnboundedReceiver<EngineCommand>) {
    loop {
        let (command, is_audio) = tokio::select! {
            biased;
            command = control.recv() => match command {
                Some(command) => (command, false),
                None => break,
            },
            frame = shared.to_engine.pop() => match frame {
                Some(frame) => (EngineCommand::AppendAudio { audio: encode_payload(&frame.payload) }, true),
                None => break,
            },
        };

        {
            let state = shared.state.lock();
            if state.state.is_ending() {
                break;
            }
            if is_audio && !state.state.is_relaying() {
                continue;
            }
        }

        let text = match command.encode() {
            Ok(text) => text,
            Err(e) => {
                warn!(call_id = %shared.call_id, error = %e, "cannot encode engine command");
                continue;
            }
        };
        if !is_audio {
            trace!(call_id = %shared.call_id, kind = command.kind(), "sending engine command");
        }

        let sent = {
            let mut sink = shared.engine_sink.lock().await;
            match sink.as_mut() {
                Some(sink) => sink.send(text).await,
                None => break,
            }
        };
        match sent {
            Ok(()) if is_audio => shared.state.lock().counters.to_engine += 1,
            Ok(()) => {}
            Err(e) => {
                engine_lost(&shared, &e.to_string());
                break;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Turn-taking
// ---------------------------------------------------------------------------

fn speech_started(shared: &Arc<SessionShared>) {
    let plan = {
        let mut state = shared.state.lock();
        let plan = turn::on_speech_started(&mut state);
        if let Some(plan) = plan {
            let purged = shared.to_caller.purge_where(|item| item.generation() < plan.generation);
            state.counters.flushed += purged as u64;
            shared.announce(CallState::Active, CallState::Interrupted);
            if let Some(stream_sid) = state.stream_sid.clone() {
                shared.send_caller(TelephonyCommand::clear(stream_sid));
            }
        }
        plan
    };
    if let Some(plan) = plan {
        apply_flush(shared, plan);
    }
}

fn apply_flush(shared: &Arc<SessionShared>, plan: FlushPlan) {
    if plan.cancel_response {
        shared.send_engine(EngineCommand::CancelResponse);
    }
    shared.send_engine(EngineCommand::ClearOutputAudio);

    let watchdog = shared.clone();
    let timeout = shared.config.turn.flush_ack_timeout();
    shared.tasks.spawn("flush-watchdog", async move {
        tokio::time::sleep(timeout).await;
        let mut state = watchdog.state.lock();
        if turn::force_resume(&mut state, plan.generation) {
            watchdog.announce(CallState::Interrupted, CallState::Active);
        }
    });
}

fn speech_stopped(shared: &SessionShared) {
    turn::on_speech_stopped(&shared.state.lock());
}

fn flush_acknowledged(shared: &SessionShared) {
    let mut state = shared.state.lock();
    if turn::on_flush_ack(&mut state) {
        shared.announce(CallState::Interrupted, CallState::Active);
    } else {
        trace!(call_id = %shared.call_id, "flush acknowledgement outside interruption");
    }
}

// ---------------------------------------------------------------------------
// Function calls
// ---------------------------------------------------------------------------

fn handle_function_call(shared: &Arc<SessionShared>, call_id: String, name: String, arguments: String) {
    let prepared = shared.dispatcher.prepare(&call_id, &name, &arguments);
    let caller = {
        let mut state = shared.state.lock();
        if state.state.is_ending() {
            return;
        }
        if state.pending.contains_key(&call_id) {
            warn!(call_id = %shared.call_id, function_call_id = %call_id, "duplicate function call ignored");
            return;
        }
        state.functions_issued += 1;
        state.pending.insert(
            call_id.clone(),
            PendingFunction {
                name: name.clone(),
                arguments,
                issued_at: Utc::now(),
            },
        );
        state.caller.clone()
    };
    info!(call_id = %shared.call_id, function = %name, function_call_id = %call_id, "function call");

    match prepared {
        Prepared::Rejected(request) => {
            warn!(call_id = %shared.call_id, function = %name, "function call rejected");
            complete_function(shared, request);
        }
        Prepared::Ready(call) => {
            let ctx = ToolContext {
                call_id: shared.call_id.clone(),
                function_call_id: call_id.clone(),
                caller,
            };
            let task_shared = shared.clone();
            shared.tasks.spawn(format!("function-{}", call_id), async move {
                let request = task_shared.dispatcher.execute(ctx, call).await;
                complete_function(&task_shared, request);
            });
        }
    }
}

/// Deliver a resolved call to the engine, unless it is no longer wanted
///
/// Runs under the state lock so results reach the engine writer in
/// completion order.
fn complete_function(shared: &SessionShared, request: FunctionCallRequest) {
    {
        let mut state = shared.state.lock();
        if state.state.is_ending() || state.pending.remove(&request.call_id).is_none() {
            debug!(
                call_id = %shared.call_id,
                function_call_id = %request.call_id,
                "discarding late function result"
            );
            return;
        }
        for command in request.result_commands() {
            shared.send_engine(command);
        }
    }
    if let Some(err) = request.error() {
        debug!(call_id = %shared.call_id, error = %err, "function result is an error");
    }
    shared.events.publish(SessionEvent::FunctionCompleted {
        call_id: shared.call_id.clone(),
        function_call_id: request.call_id.clone(),
        name: request.name.clone(),
        status: request.status,
    });
}
