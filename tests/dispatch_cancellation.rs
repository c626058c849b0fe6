//! Exercises per-call cancellation from outside the crate: cancelling one
//! in-flight tool call must not affect a sibling call dispatched in the same
//! batch (P6).

use open_agent::{Dispatcher, Hooks, Tool, ToolCall, ToolRegistry};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn per_call_cancellation_does_not_affect_sibling_calls() {
    let waits = Tool::new("waits", "waits for cancellation", json!({}), |_args| async move {
        tokio::time::sleep(Duration::from_secs(10)).await;
        Ok(json!({}))
    });
    let fast = Tool::new("fast", "returns immediately", json!({}), |_args| async move {
        Ok(json!({ "ok": true }))
    });

    let mut registry = ToolRegistry::new();
    registry.register(waits);
    registry.register(fast);
    let dispatcher = Arc::new(Dispatcher::new(
        Arc::new(registry),
        Arc::new(Hooks::new()),
        Duration::from_secs(5),
    ));

    let calls = vec![
        ToolCall {
            tool_call_id: "call-to-cancel".to_string(),
            name: "waits".to_string(),
            input: json!({}),
        },
        ToolCall {
            tool_call_id: "call-fine".to_string(),
            name: "fast".to_string(),
            input: json!({}),
        },
    ];

    let d = dispatcher.clone();
    let canceller = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(d.cancel_call("call-to-cancel"));
    });

    let turn_token = CancellationToken::new();
    let results = dispatcher.dispatch(&calls, vec![], &turn_token).await;
    canceller.await.unwrap();

    assert_eq!(results.len(), 2);
    assert!(results[0].is_error());
    assert!(!results[1].is_error());
    assert_eq!(results[1].llm_content, "{\"ok\":true}");
}

#[tokio::test]
async fn cancelling_an_unknown_call_id_is_a_harmless_no_op() {
    let dispatcher = Dispatcher::new(
        Arc::new(ToolRegistry::new()),
        Arc::new(Hooks::new()),
        Duration::from_secs(5),
    );
    assert!(!dispatcher.cancel_call("no-such-call"));
}
