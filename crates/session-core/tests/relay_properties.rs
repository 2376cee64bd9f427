//! Property tests over whole sessions

mod common;

use std::collections::HashSet;

use callrelay_session_core::{CallId, SessionError};
use common::*;
use proptest::prelude::*;

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

/// Send `count` caller frames and return the order the engine saw them in
async fn relay_caller_frames(count: usize) -> Vec<usize> {
    let mut config = test_config();
    config.relay.max_buffered_frames = 1024;
    let mut harness = Harness::new(config, stub_functions());
    let mut call = harness.start_call("CA1").await;

    for i in 0..count {
        let mut frame = vec![0xff; 160];
        frame[0] = (i % 256) as u8;
        frame[1] = (i / 256) as u8;
        assert!(call.caller.send_json(&media_event(&frame)));
    }

    let mut seen = Vec::with_capacity(count);
    while seen.len() < count {
        let append = expect_type(&mut call.engine, "input_audio_buffer.append").await;
        let payload = payload_of(&append);
        seen.push(payload[0] as usize + payload[1] as usize * 256);
    }
    seen
}

#[derive(Debug, Clone)]
enum Op {
    Create(u8),
    Hangup(u8),
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![(0u8..4).prop_map(Op::Create), (0u8..4).prop_map(Op::Hangup)]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn prop_caller_frames_keep_their_order(count in 0usize..300) {
        let seen = runtime().block_on(relay_caller_frames(count));
        let expected: Vec<usize> = (0..count).collect();
        prop_assert_eq!(seen, expected);
    }

    #[test]
    fn prop_registry_count_tracks_live_sessions(ops in prop::collection::vec(op(), 0..16)) {
        runtime().block_on(async move {
            let mut config = test_config();
            config.engine.negotiation_timeout_ms = 600_000;
            let harness = Harness::new(config, stub_functions());
            let orchestrator = &harness.orchestrator;
            let mut live = HashSet::new();

            for op in ops {
                match op {
                    Op::Create(n) => {
                        let id = CallId::new(format!("CA{}", n));
                        let created = orchestrator.create_session(id, caller());
                        assert_eq!(created.is_ok(), live.insert(n));
                    }
                    Op::Hangup(n) => {
                        let id = CallId::new(format!("CA{}", n));
                        match orchestrator.get(&id) {
                            Ok(session) => {
                                assert!(live.remove(&n));
                                assert!(orchestrator.hangup(&id).unwrap());
                                // a second hangup is a no-op
                                assert!(!orchestrator.hangup(&id).unwrap_or(false));
                                tokio::time::timeout(WAIT, session.closed()).await.unwrap();
                            }
                            Err(SessionError::NotFound { .. }) => assert!(!live.contains(&n)),
                            Err(e) => panic!("unexpected error {}", e),
                        }
                    }
                }
                assert_eq!(orchestrator.registry().snapshot_count(), live.len());
                assert_eq!(orchestrator.metrics().active_sessions, live.len());
            }
        });
    }
}
