//! Tool calls issued by the engine mid-call

mod common;

use std::time::Duration;

use callrelay_session_core::{
    CallId, CallerMetadata, FunctionCallStatus, FunctionDispatcher, FunctionName, SessionEvent, ToolContext,
    ToolError, handler_fn,
};
use common::*;
use pretty_assertions::assert_eq;
use serde_json::{Value, json};
use strum::IntoEnumIterator;

/// Parse the `output` string of a `function_call_output` item
fn output_of(item_create: &Value) -> Value {
    assert_eq!(item_create["item"]["type"], "function_call_output");
    serde_json::from_str(item_create["item"]["output"].as_str().expect("output string")).expect("output is JSON")
}

#[tokio::test]
async fn test_lookup_order_result_reaches_engine() {
    let mut harness = Harness::with_defaults();
    let mut events = harness.orchestrator.subscribe();
    let mut call = harness.start_call("CA1").await;

    call.engine
        .send_json(&function_call("f1", "lookup_order", json!({"order_id": "ABC123"})));
    let item = expect_type(&mut call.engine, "conversation.item.create").await;
    assert_eq!(item["item"]["call_id"], "f1");
    assert_eq!(output_of(&item), json!({"status": "Delivered"}));
    expect_type(&mut call.engine, "response.create").await;

    let completed = loop {
        if let SessionEvent::FunctionCompleted {
            function_call_id,
            name,
            status,
            ..
        } = events.receive().await.unwrap()
        {
            break (function_call_id, name, status);
        }
    };
    assert_eq!(completed, ("f1".to_string(), "lookup_order".to_string(), FunctionCallStatus::Completed));
    assert!(!call.session.snapshot().is_function_pending());
}

#[tokio::test]
async fn test_identical_calls_yield_identical_results() {
    let mut harness = Harness::with_defaults();
    let mut call = harness.start_call("CA1").await;
    let args = json!({"product_name": "Widget", "quantity": 3});

    call.engine
        .send_json(&function_call("f1", "check_product_availability", args.clone()));
    let first = expect_type(&mut call.engine, "conversation.item.create").await;
    call.engine
        .send_json(&function_call("f2", "check_product_availability", args));
    let second = expect_type(&mut call.engine, "conversation.item.create").await;

    assert_eq!(first["item"]["call_id"], "f1");
    assert_eq!(second["item"]["call_id"], "f2");
    assert_eq!(output_of(&first), output_of(&second));
    assert_eq!(output_of(&first), json!({"product": "Widget", "in_stock": true}));
}

#[tokio::test]
async fn test_failures_become_error_results() {
    let mut harness = Harness::with_defaults();
    let mut call = harness.start_call("CA1").await;

    let cases = [
        (function_call("f1", "cancel_subscription", json!({})), "unsupported_function"),
        (function_call("f2", "create_ticket", json!({"issue_type": "billing"})), "invalid_arguments"),
        (
            json!({"type": "response.function_call_arguments.done", "call_id": "f3", "name": "lookup_order", "arguments": "{not json"}),
            "invalid_arguments",
        ),
        (
            function_call("f4", "transfer_to_human", json!({"reason": "angry", "customer_context": "refund"})),
            "unavailable",
        ),
        (function_call("f5", "lookup_order", json!({"order_id": "ZZZ"})), "not_found"),
    ];

    for (event, kind) in cases {
        let call_id = event["call_id"].clone();
        call.engine.send_json(&event);
        let item = expect_type(&mut call.engine, "conversation.item.create").await;
        assert_eq!(item["item"]["call_id"], call_id);
        assert_eq!(output_of(&item)["error"]["kind"], kind, "call {}", call_id);
        // the engine gets to answer the caller either way
        expect_type(&mut call.engine, "response.create").await;
    }

    let snapshot = call.session.snapshot();
    assert_eq!(snapshot.state, callrelay_session_core::CallState::Active);
    assert_eq!(snapshot.pending_functions, 0);
}

#[tokio::test]
async fn test_create_ticket_sees_its_call_id() {
    let mut harness = Harness::with_defaults();
    let mut call = harness.start_call("CA1").await;

    call.engine.send_json(&function_call(
        "call_abc",
        "create_ticket",
        json!({"issue_type": "billing", "description": "charged twice", "priority": "high"}),
    ));
    let item = expect_type(&mut call.engine, "conversation.item.create").await;
    assert_eq!(output_of(&item), json!({"ticket_id": "T-call_abc"}));
}

#[tokio::test(start_paused = true)]
async fn test_stalled_function_times_out_once() {
    let functions = stub_functions().with(
        FunctionName::LookupOrder,
        handler_fn(|_ctx, _args| async {
            std::future::pending::<()>().await;
            Ok::<_, ToolError>(Value::Null)
        }),
    );
    let mut harness = Harness::new(test_config(), functions);
    let timeout = harness.orchestrator.config().functions.timeout();
    let mut call = harness.start_call("CA1").await;

    let issued_at = tokio::time::Instant::now();
    call.engine
        .send_json(&function_call("f1", "lookup_order", json!({"order_id": "ABC123"})));
    let item = expect_type(&mut call.engine, "conversation.item.create").await;
    assert!(issued_at.elapsed() >= timeout);
    assert_eq!(item["item"]["call_id"], "f1");
    assert_eq!(output_of(&item)["error"]["kind"], "timed_out");
    expect_type(&mut call.engine, "response.create").await;
    assert_eq!(call.session.snapshot().pending_functions, 0);

    tokio::time::sleep(timeout * 3).await;
    while let Some(text) = call.engine.try_recv() {
        let frame: Value = serde_json::from_str(&text).unwrap();
        assert_ne!(frame["type"], "conversation.item.create", "second result for a timed out call");
    }
}

#[tokio::test]
async fn test_duplicate_function_call_id_ignored() {
    let (release_tx, release_rx) = tokio::sync::watch::channel(false);
    let functions = stub_functions().with(
        FunctionName::CreateTicket,
        handler_fn(move |ctx, _args| {
            let mut release = release_rx.clone();
            async move {
                let _ = release.wait_for(|go| *go).await;
                Ok::<_, ToolError>(json!({"ticket_id": format!("T-{}", ctx.function_call_id)}))
            }
        }),
    );
    let mut harness = Harness::new(test_config(), functions);
    let mut call = harness.start_call("CA1").await;
    let args = json!({"issue_type": "billing", "description": "charged twice"});

    call.engine.send_json(&function_call("f1", "create_ticket", args.clone()));
    call.engine.send_json(&function_call("f1", "create_ticket", args));
    eventually(|| call.session.snapshot().pending_functions == 1).await;
    // let the duplicate be read before releasing the handler
    call.engine.send_json(&audio_delta("resp_1", &[0x44; 160]));
    expect_event(&mut call.caller, "media").await;
    release_tx.send_replace(true);

    expect_type(&mut call.engine, "conversation.item.create").await;
    expect_type(&mut call.engine, "response.create").await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    while let Some(text) = call.engine.try_recv() {
        let frame: Value = serde_json::from_str(&text).unwrap();
        assert_ne!(frame["type"], "conversation.item.create");
    }
}

#[tokio::test]
async fn test_dispatcher_is_deterministic() {
    let advertised: Vec<FunctionName> = FunctionName::iter().collect();
    let dispatcher = FunctionDispatcher::new(stub_functions(), advertised, Duration::from_secs(1)).unwrap();
    let ctx = ToolContext {
        call_id: CallId::new("CA1"),
        function_call_id: "f1".into(),
        caller: CallerMetadata::default(),
    };

    for (name, args) in [
        ("lookup_order", r#"{"order_id":"ABC123"}"#),
        ("lookup_order", r#"{"order_id":"nope"}"#),
        ("check_product_availability", r#"{"product_name":"Widget","quantity":9}"#),
        ("transfer_to_human", r#"{"reason":"r","customer_context":"c"}"#),
    ] {
        let first = dispatcher.dispatch(ctx.clone(), name, args).await;
        let second = dispatcher.dispatch(ctx.clone(), name, args).await;
        assert_eq!(first.status, second.status);
        assert_eq!(first.output(), second.output());
        assert_eq!(first.result_commands(), second.result_commands());
    }
}
