//! End-to-end exercises of the conversation engine from outside the crate,
//! against a scripted LLM backend: no real model server involved, but every
//! other component (log, dispatcher, tool registry, budget) is the real
//! thing, driven only through `open_agent`'s public API.

use async_trait::async_trait;
use open_agent::{
    ContentBlock, Dispatcher, Engine, Error, Hooks, LlmRequest, LlmResponse, LlmService,
    MessageLog, MessageType, StopReason, TextBlock, Tool, ToolRegistry, ToolUseBlock, TurnOutcome,
    Usage,
};
use serde_json::json;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// A backend that replays a fixed script of responses, one per call.
struct ScriptedLlm {
    responses: Mutex<Vec<open_agent::Result<LlmResponse>>>,
}

impl ScriptedLlm {
    fn new(mut responses: Vec<open_agent::Result<LlmResponse>>) -> Self {
        responses.reverse();
        Self {
            responses: Mutex::new(responses),
        }
    }
}

#[async_trait]
impl LlmService for ScriptedLlm {
    async fn do_request(&self, _request: LlmRequest) -> open_agent::Result<LlmResponse> {
        let mut guard = self.responses.lock().await;
        guard
            .pop()
            .unwrap_or_else(|| Err(Error::other("scripted LLM ran out of responses")))
    }

    fn token_context_window(&self) -> u32 {
        128_000
    }
}

fn text_response(text: &str, usage: Usage) -> LlmResponse {
    LlmResponse {
        content: vec![ContentBlock::Text(TextBlock::new(text))],
        stop_reason: StopReason::EndTurn,
        usage,
    }
}

fn tool_call_response(calls: Vec<(&str, &str, serde_json::Value)>) -> LlmResponse {
    LlmResponse {
        content: calls
            .into_iter()
            .map(|(id, name, input)| ContentBlock::ToolUse(ToolUseBlock::new(id, name, input)))
            .collect(),
        stop_reason: StopReason::ToolUse,
        usage: Usage::new(20, 10, 0, 0, 0.002),
    }
}

fn build_engine(
    llm: ScriptedLlm,
    tools: Vec<Tool>,
    max_dollars: f64,
) -> (Arc<Engine>, Arc<MessageLog>) {
    let mut registry = ToolRegistry::new();
    for t in tools {
        registry.register(t);
    }
    let registry = Arc::new(registry);
    let hooks = Arc::new(Hooks::new());
    let dispatcher = Arc::new(Dispatcher::new(
        registry.clone(),
        hooks,
        std::time::Duration::from_secs(5),
    ));
    let log = Arc::new(MessageLog::new(Uuid::new_v4()));
    let engine = Arc::new(Engine::new(
        Arc::new(llm),
        registry,
        dispatcher,
        log.clone(),
        max_dollars,
    ));
    (engine, log)
}

#[tokio::test]
async fn simple_question_ends_turn_on_first_response() {
    let (engine, log) = build_engine(
        ScriptedLlm::new(vec![Ok(text_response(
            "Paris is the capital of France.",
            Usage::default(),
        ))]),
        vec![],
        0.0,
    );

    let conversation_id = Uuid::new_v4();
    let token = CancellationToken::new();
    let outcome = engine
        .run_turn(
            conversation_id,
            "You are helpful.",
            "What's the capital of France?",
            &token,
        )
        .await
        .expect("turn should succeed");
    assert_eq!(outcome, TurnOutcome::Ended);

    let messages = log.slice(0, None).await;
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0].kind, MessageType::User);
    assert_eq!(messages[1].kind, MessageType::Agent);
    assert!(messages[1].end_of_turn);
}

#[tokio::test]
async fn parallel_tool_calls_reassemble_in_original_order_through_the_engine() {
    let slow = Tool::new("slow", "sleeps then answers", json!({}), |_args| async move {
        tokio::time::sleep(std::time::Duration::from_millis(40)).await;
        Ok(json!({ "who": "slow" }))
    });
    let fast = Tool::new("fast", "answers immediately", json!({}), |_args| async move {
        Ok(json!({ "who": "fast" }))
    });

    let (engine, log) = build_engine(
        ScriptedLlm::new(vec![
            Ok(tool_call_response(vec![
                ("call-1", "slow", json!({})),
                ("call-2", "fast", json!({})),
            ])),
            Ok(text_response("done", Usage::default())),
        ]),
        vec![slow, fast],
        0.0,
    );

    let conversation_id = Uuid::new_v4();
    let token = CancellationToken::new();
    engine
        .run_turn(conversation_id, "sys", "go", &token)
        .await
        .expect("turn should succeed");

    let messages = log.slice(0, None).await;
    let tool_messages: Vec<_> = messages
        .iter()
        .filter(|m| m.kind == MessageType::Tool)
        .collect();
    assert_eq!(tool_messages.len(), 2);
    assert_eq!(tool_messages[0].tool_call_id.as_deref(), Some("call-1"));
    assert_eq!(tool_messages[1].tool_call_id.as_deref(), Some("call-2"));
}

#[tokio::test]
async fn ends_turn_tool_stops_loop_without_a_final_model_round_trip() {
    let commit = Tool::new("commit", "commits and ends the turn", json!({}), |_args| async move {
        Ok(json!({ "committed": true }))
    })
    .with_ends_turn(true);

    let (engine, _log) = build_engine(
        ScriptedLlm::new(vec![Ok(tool_call_response(vec![("call-1", "commit", json!({}))]))]),
        vec![commit],
        0.0,
    );

    let conversation_id = Uuid::new_v4();
    let token = CancellationToken::new();
    let outcome = engine
        .run_turn(conversation_id, "sys", "commit this", &token)
        .await
        .expect("turn should succeed");

    assert_eq!(outcome, TurnOutcome::EndedByTool);
}

#[tokio::test]
async fn zero_budget_never_blocks_even_with_large_reported_cost() {
    let (engine, _log) = build_engine(
        ScriptedLlm::new(vec![Ok(text_response(
            "ok",
            Usage::new(1_000_000, 1_000_000, 0, 0, 999.0),
        ))]),
        vec![],
        0.0,
    );

    let conversation_id = Uuid::new_v4();
    let token = CancellationToken::new();
    engine
        .run_turn(conversation_id, "sys", "hi", &token)
        .await
        .expect("zero budget disables the check entirely");
}

#[tokio::test]
async fn budget_exceeded_is_logged_and_returned() {
    let expensive = || text_response("ok", Usage::new(0, 0, 0, 0, 5.0));
    let (engine, log) = build_engine(
        ScriptedLlm::new(vec![Ok(expensive()), Ok(expensive())]),
        vec![],
        1.0,
    );

    let conversation_id = Uuid::new_v4();
    let token = CancellationToken::new();

    engine
        .run_turn(conversation_id, "sys", "first turn", &token)
        .await
        .expect("first turn is under budget");

    let err = engine
        .run_turn(conversation_id, "sys", "second turn", &token)
        .await
        .expect_err("second turn should exceed the dollar ceiling");
    assert!(matches!(err, Error::BudgetExceeded { .. }));

    let messages = log.slice(0, None).await;
    assert!(messages.iter().any(|m| m.kind == MessageType::Error));
}

#[tokio::test]
async fn stream_resume_replays_then_continues_from_a_given_index() {
    use futures::StreamExt;
    use open_agent::LogEvent;

    let (engine, log) = build_engine(
        ScriptedLlm::new(vec![Ok(text_response("hi", Usage::default()))]),
        vec![],
        0.0,
    );
    let conversation_id = Uuid::new_v4();
    let token = CancellationToken::new();
    engine
        .run_turn(conversation_id, "sys", "hello", &token)
        .await
        .expect("turn should succeed");

    // Reconnect from idx 1: only the assistant reply should be replayed.
    let mut stream = log.subscribe(1).await;
    let replayed = stream.next().await.expect("should replay the tail");
    match replayed {
        LogEvent::Message(msg) => assert_eq!(msg.idx, 1),
        other => panic!("expected a replayed message, got {other:?}"),
    }

    tokio::spawn(async move {
        engine
            .run_turn(conversation_id, "sys", "again", &CancellationToken::new())
            .await
            .unwrap();
    });

    let next = stream.next().await.expect("should see the new turn's user message");
    assert!(matches!(next, LogEvent::Message(m) if m.idx == 2));
}
