//! Per-session lifecycle driver
//!
//! Opens the engine connection, negotiates, waits for the session to be
//! terminated and then tears it down. Connecting is bounded by the
//! negotiation timeout and closing each peer by the shutdown grace. Runs
//! outside the session's task group so it survives the cancellation it
//! waits for.

use std::sync::Arc;

use tracing::{debug, info, warn};

use super::call_session::CallSession;
use super::tasks;
use crate::errors::SessionError;
use crate::events::SessionEvent;
use crate::protocol::{EngineCommand, SessionParameters};
use crate::registry::SessionRegistry;
use crate::transport::EngineConnector;
use crate::types::{CallState, TerminationReason};

pub(crate) async fn run(session: CallSession, connector: Arc<dyn EngineConnector>, registry: Arc<SessionRegistry>) {
    let shared = session.shared.clone();
    let token = shared.tasks.token();
    let config = shared.config.clone();

    let connected = tokio::select! {
        biased;
        _ = token.cancelled() => None,
        result = tokio::time::timeout(config.engine.negotiation_timeout(), connector.connect(&config.engine)) => {
            Some(result.unwrap_or_else(|_| Err(SessionError::handshake("engine did not answer in time"))))
        }
    };

    match connected {
        Some(Ok(connection)) => {
            *shared.engine_sink.lock().await = Some(connection.sink);
            shared.state.lock().engine_connected = true;
            if shared.advance(CallState::Negotiating) {
                if let Some(control) = shared.take_engine_control() {
                    shared
                        .tasks
                        .spawn("engine-reader", tasks::engine_reader(shared.clone(), connection.source));
                    shared.tasks.spawn("engine-writer", tasks::engine_writer(shared.clone(), control));
                }
                let parameters =
                    SessionParameters::from_config(&config.engine, &config.turn, shared.dispatcher.tool_schemas());
                shared.send_engine(EngineCommand::session_update(parameters));
                debug!(call_id = %shared.call_id, "session parameters sent");
            }
        }
        Some(Err(e)) => {
            warn!(call_id = %shared.call_id, error = %e, "engine connection failed");
            shared.terminate(TerminationReason::UpstreamUnavailable);
        }
        None => {}
    }

    if !token.is_cancelled() {
        let negotiated = tokio::time::timeout(
            config.engine.negotiation_timeout(),
            session.wait_for_state(|state| state != CallState::Negotiating),
        )
        .await;
        if negotiated.is_err() {
            warn!(call_id = %shared.call_id, "engine did not confirm session parameters in time");
            shared.terminate(TerminationReason::NegotiationTimeout);
        }
    }

    token.cancelled().await;

    let report = shared.tasks.shutdown(config.relay.shutdown_grace()).await;
    if report.aborted > 0 {
        warn!(call_id = %shared.call_id, aborted = report.aborted, "relay tasks aborted at shutdown");
    }

    for (peer, slot) in [("engine", &shared.engine_sink), ("telephony", &shared.telephony_sink)] {
        let sink = slot.lock().await.take();
        if let Some(mut sink) = sink {
            match tokio::time::timeout(config.relay.shutdown_grace(), sink.close()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => debug!(call_id = %shared.call_id, peer, error = %e, "close failed"),
                Err(_) => warn!(call_id = %shared.call_id, peer, "peer did not take the close in time, dropping it"),
            }
        }
    }
    shared.state.lock().engine_connected = false;

    registry.remove(&shared.call_id);
    shared.advance(CallState::Closed);

    let summary = shared
        .state
        .lock()
        .summary(shared.to_engine.dropped(), shared.to_caller.dropped());
    info!(
        call_id = %shared.call_id,
        duration_secs = summary.duration_secs,
        reason = ?summary.reason,
        functions = summary.functions_issued,
        interruptions = summary.interruptions,
        "session closed"
    );
    shared.events.publish(SessionEvent::Closed { summary });
}
