//! Session lifecycle: negotiation, termination paths and registry hygiene

mod common;

use std::sync::Arc;

use callrelay_session_core::transport::memory::pair;
use callrelay_session_core::{
    CallId, CallState, MemoryTelephonyTransport, Peer, SessionError, SessionEvent, TerminationReason,
};
use common::*;
use pretty_assertions::assert_eq;
use serde_json::json;

#[tokio::test]
async fn test_negotiation_reaches_active() {
    let mut harness = Harness::with_defaults();
    let session = harness
        .orchestrator
        .create_session(CallId::new("CA1"), caller())
        .unwrap();
    assert_eq!(session.state(), CallState::Initiating);

    let mut engine = harness.next_engine().await;
    let update = expect_type(&mut engine, "session.update").await;
    assert_eq!(session.state(), CallState::Negotiating);
    assert_eq!(update["session"]["input_audio_format"], "g711_ulaw");
    assert_eq!(update["session"]["output_audio_format"], "g711_ulaw");
    assert_eq!(update["session"]["turn_detection"]["type"], "server_vad");
    assert_eq!(update["session"]["tools"].as_array().map(Vec::len), Some(4));
    assert_eq!(update["session"]["tool_choice"], "auto");

    engine.send_json(&json!({"type": "session.created"}));
    engine.send_json(&json!({"type": "session.updated"}));
    let state = tokio::time::timeout(WAIT, session.wait_for_state(|s| s == CallState::Active))
        .await
        .unwrap();
    assert_eq!(state, CallState::Active);

    let snapshot = harness.orchestrator.session(&CallId::new("CA1")).unwrap();
    assert!(snapshot.engine_connected);
    assert!(!snapshot.telephony_attached);
}

#[tokio::test]
async fn test_greeting_requested_once_active() {
    let mut config = test_config();
    config.engine.greeting = Some("Say hello.".into());
    let mut harness = Harness::new(config, stub_functions());
    let (_session, mut engine) = harness.negotiate("CA1").await;

    let greeting = expect_type(&mut engine, "response.create").await;
    assert_eq!(greeting["response"]["instructions"], "Say hello.");
    assert_eq!(greeting["response"]["modalities"], json!(["audio"]));
}

#[tokio::test]
async fn test_duplicate_create_rejected() {
    let mut harness = Harness::with_defaults();
    let mut call = harness.start_call("CA1").await;

    let err = harness
        .orchestrator
        .create_session(CallId::new("CA1"), caller())
        .unwrap_err();
    assert!(matches!(err, SessionError::RegistryConflict { .. }));
    assert_eq!(harness.connector.connect_count(), 1);

    // the original session keeps relaying
    assert_eq!(call.session.state(), CallState::Active);
    call.caller.send_json(&media_event(&[0x7f; 160]));
    let append = expect_type(&mut call.engine, "input_audio_buffer.append").await;
    assert_eq!(payload_of(&append), vec![0x7f; 160]);
    assert_eq!(harness.orchestrator.registry().snapshot_count(), 1);
}

#[tokio::test]
async fn test_caller_audio_before_active_is_dropped() {
    let mut harness = Harness::with_defaults();
    let session = harness
        .orchestrator
        .create_session(CallId::new("CA1"), caller())
        .unwrap();
    let mut engine = harness.next_engine().await;
    expect_type(&mut engine, "session.update").await;

    let (connection, caller_peer) = pair(Peer::Telephony);
    session.attach_telephony(connection, None).await.unwrap();
    caller_peer.send_json(&media_event(&[0x01; 160]));
    caller_peer.send_json(&start_event(STREAM_SID, "CA1"));
    eventually(|| session.snapshot().stream_sid.is_some()).await;

    engine.send_json(&json!({"type": "session.updated"}));
    session.wait_for_state(|s| s == CallState::Active).await;
    caller_peer.send_json(&media_event(&[0x02; 160]));

    let append = expect_type(&mut engine, "input_audio_buffer.append").await;
    assert_eq!(payload_of(&append), vec![0x02; 160]);
}

#[tokio::test]
async fn test_telephony_close_with_pending_function() {
    let (started_tx, mut started_rx) = tokio::sync::mpsc::unbounded_channel();
    let functions = stub_functions().with(
        callrelay_session_core::FunctionName::LookupOrder,
        callrelay_session_core::handler_fn(move |_ctx, _args| {
            let started = started_tx.clone();
            async move {
                let _ = started.send(());
                std::future::pending::<()>().await;
                Ok::<_, callrelay_session_core::ToolError>(json!({"status": "Delivered"}))
            }
        }),
    );
    let mut harness = Harness::new(test_config(), functions);
    let mut events = harness.orchestrator.subscribe();
    let Call {
        session,
        mut caller,
        mut engine,
    } = harness.start_call("CA1").await;

    engine.send_json(&function_call("f1", "lookup_order", json!({"order_id": "ABC123"})));
    tokio::time::timeout(WAIT, started_rx.recv()).await.unwrap().unwrap();
    let snapshot = session.snapshot();
    assert!(snapshot.is_function_pending());
    assert_eq!(harness.orchestrator.metrics().function_pending_sessions, 1);

    caller.close();
    tokio::time::timeout(WAIT, session.closed()).await.unwrap();

    let mut transitions = Vec::new();
    let summary = loop {
        match events.receive().await.unwrap() {
            SessionEvent::StateChanged { new_state, .. } => transitions.push(new_state),
            SessionEvent::Closed { summary } => break summary,
            _ => {}
        }
    };
    assert_eq!(
        transitions,
        vec![CallState::Negotiating, CallState::Active, CallState::Terminating, CallState::Closed]
    );
    assert_eq!(summary.reason, Some(TerminationReason::TelephonyClosed));
    assert_eq!(summary.functions_issued, 1);

    let leftovers = drain(&mut engine).await;
    assert!(
        leftovers.iter().all(|f| f["type"] != "conversation.item.create"),
        "function result delivered after close"
    );
    assert!(matches!(
        harness.orchestrator.session(&CallId::new("CA1")),
        Err(SessionError::NotFound { .. })
    ));
    assert_eq!(harness.orchestrator.metrics().active_sessions, 0);
}

#[tokio::test]
async fn test_carrier_stop_ends_session() {
    let mut harness = Harness::with_defaults();
    let mut call = harness.start_call("CA1").await;

    call.caller.send_json(&json!({"event": "stop", "streamSid": STREAM_SID}));
    tokio::time::timeout(WAIT, call.session.closed()).await.unwrap();

    let snapshot = call.session.snapshot();
    assert_eq!(snapshot.state, CallState::Closed);
    assert_eq!(snapshot.termination_reason, Some(TerminationReason::TelephonyStopped));
    assert!(!snapshot.engine_connected);
    drain(&mut call.engine).await;
    drain(&mut call.caller).await;
    assert!(!harness.orchestrator.registry().contains(&CallId::new("CA1")));
}

#[tokio::test]
async fn test_engine_close_ends_session() {
    let mut harness = Harness::with_defaults();
    let mut call = harness.start_call("CA1").await;

    call.engine.close();
    tokio::time::timeout(WAIT, call.session.closed()).await.unwrap();
    assert_eq!(
        call.session.snapshot().termination_reason,
        Some(TerminationReason::EngineClosed)
    );
    drain(&mut call.caller).await;
}

#[tokio::test]
async fn test_refused_engine_connection() {
    let harness = Harness::with_defaults();
    harness.connector.set_refusing(true);
    let session = harness
        .orchestrator
        .create_session(CallId::new("CA1"), caller())
        .unwrap();

    tokio::time::timeout(WAIT, session.closed()).await.unwrap();
    assert_eq!(
        session.snapshot().termination_reason,
        Some(TerminationReason::UpstreamUnavailable)
    );
    assert_eq!(harness.orchestrator.registry().snapshot_count(), 0);

    // the id is free again
    harness.connector.set_refusing(false);
    assert!(harness.orchestrator.create_session(CallId::new("CA1"), caller()).is_ok());
}

#[tokio::test(start_paused = true)]
async fn test_negotiation_timeout() {
    let mut harness = Harness::with_defaults();
    let session = harness
        .orchestrator
        .create_session(CallId::new("CA1"), caller())
        .unwrap();
    let mut engine = harness.next_engine().await;
    expect_type(&mut engine, "session.update").await;

    let started = tokio::time::Instant::now();
    tokio::time::timeout(WAIT, session.closed()).await.unwrap();
    assert!(started.elapsed() >= harness.orchestrator.config().engine.negotiation_timeout());
    assert_eq!(
        session.snapshot().termination_reason,
        Some(TerminationReason::NegotiationTimeout)
    );
}

#[tokio::test]
async fn test_repeated_malformed_frames_terminate() {
    let mut config = test_config();
    config.relay.max_protocol_violations = 3;
    let mut harness = Harness::new(config, stub_functions());
    let mut call = harness.start_call("CA1").await;

    // a good frame resets the count
    call.caller.send("not json");
    call.caller.send(r#"{"event":"bogus"}"#);
    call.caller.send_json(&json!({"event": "dtmf", "dtmf": {"digit": "5"}}));
    call.caller.send(r#"{"no_event":true}"#);
    call.caller.send_json(&media_event(&[0x55; 160]));
    expect_type(&mut call.engine, "input_audio_buffer.append").await;
    assert_eq!(call.session.state(), CallState::Active);

    for _ in 0..3 {
        call.caller.send("{{{");
    }
    tokio::time::timeout(WAIT, call.session.closed()).await.unwrap();
    assert!(matches!(
        call.session.snapshot().termination_reason,
        Some(TerminationReason::ProtocolViolation(_))
    ));
}

#[tokio::test]
async fn test_engine_error_event_is_not_fatal() {
    let mut harness = Harness::with_defaults();
    let mut call = harness.start_call("CA1").await;

    call.engine.send_json(&json!({
        "type": "error",
        "error": {"type": "invalid_request_error", "code": "response_cancel_not_active", "message": "no active response"}
    }));
    call.engine.send_json(&json!({"type": "rate_limits.updated", "rate_limits": []}));
    call.engine.send_json(&audio_delta("resp_1", &[0x44; 160]));
    expect_event(&mut call.caller, "media").await;
    assert_eq!(call.session.state(), CallState::Active);
}

#[tokio::test]
async fn test_served_stream_routes_by_call_sid() {
    let mut harness = Harness::with_defaults();
    let (transport, dialer) = MemoryTelephonyTransport::new();
    let server = {
        let orchestrator = harness.orchestrator.clone();
        tokio::spawn(async move { orchestrator.serve(Arc::new(transport)).await })
    };

    let mut carrier = dialer.dial().unwrap();
    carrier.send_json(&json!({"event": "connected", "protocol": "Call", "version": "1.0.0"}));
    carrier.send_json(&start_event(STREAM_SID, "CA77"));

    let mut engine = harness.next_engine().await;
    expect_type(&mut engine, "session.update").await;
    engine.send_json(&json!({"type": "session.updated"}));

    let session = harness.orchestrator.get(&CallId::new("CA77")).unwrap();
    session.wait_for_state(|s| s == CallState::Active).await;
    assert_eq!(session.caller().from.as_deref(), Some("+15551234567"));
    assert_eq!(session.snapshot().stream_sid.as_deref(), Some(STREAM_SID));

    carrier.send_json(&media_event(&[0x10; 160]));
    expect_type(&mut engine, "input_audio_buffer.append").await;
    engine.send_json(&audio_delta("resp_1", &[0x20; 160]));
    let media = expect_event(&mut carrier, "media").await;
    assert_eq!(media["streamSid"], STREAM_SID);

    harness.orchestrator.shutdown(WAIT).await;
    assert_eq!(
        session.snapshot().termination_reason,
        Some(TerminationReason::Shutdown)
    );
    assert!(server.await.unwrap().is_ok());
    assert!(harness.orchestrator.create_session(CallId::new("CA78"), caller()).is_err());
}

#[tokio::test]
async fn test_hangup_and_metrics() {
    let mut harness = Harness::with_defaults();
    let first = harness.start_call("CA1").await;
    let second = harness.start_call("CA2").await;

    let metrics = harness.orchestrator.metrics();
    assert_eq!(metrics.active_sessions, 2);
    assert_eq!(metrics.engine_connections, 2);
    assert_eq!(metrics.interrupted_sessions, 0);

    assert!(harness.orchestrator.hangup(&CallId::new("CA1")).unwrap());
    assert!(!harness.orchestrator.hangup(&CallId::new("CA1")).unwrap_or(false));
    tokio::time::timeout(WAIT, first.session.closed()).await.unwrap();
    assert!(matches!(
        harness.orchestrator.hangup(&CallId::new("CA1")),
        Err(SessionError::NotFound { .. })
    ));
    assert_eq!(harness.orchestrator.metrics().active_sessions, 1);
    assert_eq!(
        first.session.snapshot().termination_reason,
        Some(TerminationReason::Hangup)
    );

    assert_eq!(harness.orchestrator.terminate_all(), 1);
    tokio::time::timeout(WAIT, second.session.closed()).await.unwrap();
    assert_eq!(harness.orchestrator.metrics(), Default::default());
}
