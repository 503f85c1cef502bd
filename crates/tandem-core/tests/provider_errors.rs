//! Configuration and transport failures leave the conversation untouched.


use fixtures::{
    echo_tools, engine_for, engine_with_config, error_sse, mock_provider_config, sse_response,
    tool_call_sse,
};
use tandem_core::{EngineError, GenerationState, Message, Role, SessionEvent, ToolMap};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

#[tokio::test]
async fn unknown_provider_rejects_before_any_request() {
    // No server is mounted: resolution must fail before any network call.
    let (engine, _data_dir) = engine_for("http://127.0.0.1:9");
    engine.add_message("p1", Message::user("hi")).await;

    let err = engine.start_generation("p1", "nope/x").await.unwrap_err();
    assert_eq!(err.to_string(), "Provider \"nope\" not found");

    let session = engine.get_session("p1").await.unwrap();
    let messages = session.messages();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].role, Role::User);
    assert_eq!(session.generation_state(), GenerationState::Idle);
}

#[tokio::test]
async fn model_enumeration_is_enforced_when_configured() {
    let mut config = mock_provider_config("http://127.0.0.1:9");
    if let Some(provider) = config.providers.get_mut("mock") {
        provider.models = vec!["listed-model".to_string()];
    }
    let (engine, _data_dir) = engine_with_config(config);
    engine.add_message("p1", Message::user("hi")).await;

    let err = engine
        .start_generation("p1", "mock/unlisted")
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::ModelNotFound { .. }));
    assert_eq!(
        err.to_string(),
        "Model \"unlisted\" not found for provider \"mock\""
    );
    assert_eq!(engine.get_session("p1").await.unwrap().messages().len(), 1);
}

#[tokio::test]
async fn http_error_surfaces_as_transport_failure() {
    let mock_server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(
            ResponseTemplate::new(500)
                .set_body_string(r#"{"error":{"type":"server_error","message":"kaput"}}"#),
        )
        .expect(1)
        .mount(&mock_server)
        .await;

    let (engine, _data_dir) = engine_for(&mock_server.uri());
    let mut rx = engine.subscribe("p1");
    engine.add_message("p1", Message::user("hi")).await;

    let err = engine
        .start_generation("p1", "mock/test-model")
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Transport(_)));
    assert_eq!(err.to_string(), "HTTP 500: kaput");

    let session = engine.get_session("p1").await.unwrap();
    assert_eq!(session.messages().len(), 1);
    assert_eq!(session.generation_state(), GenerationState::Idle);

    let mut saw_failure = false;
    while let Ok(event) = rx.try_recv() {
        if let SessionEvent::GenerationFailed { error, .. } = &*event {
            assert!(error.contains("HTTP 500"));
            saw_failure = true;
        }
    }
    assert!(saw_failure);
}

#[tokio::test]
async fn midstream_error_commits_no_partial_assistant_message() {
    let mock_server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(sse_response(&error_sse(
            "partial answer",
            "overloaded_error",
            "server busy",
        )))
        .expect(1)
        .mount(&mock_server)
        .await;

    let (engine, _data_dir) = engine_for(&mock_server.uri());
    engine.add_message("p1", Message::user("hi")).await;

    let err = engine
        .start_generation("p1", "mock/test-model")
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Transport(_)));
    assert!(err.to_string().contains("overloaded_error"));

    // The streamed prefix is discarded, not committed.
    let session = engine.get_session("p1").await.unwrap();
    assert_eq!(session.messages().len(), 1);
    assert!(session.streaming_message().is_none());
    assert_eq!(session.generation_state(), GenerationState::Idle);
}

#[tokio::test]
async fn iteration_cap_stops_runaway_tool_loops() {
    let mock_server = MockServer::start().await;
    // Every round asks for another tool call, forever.
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(sse_response(&tool_call_sse("call_loop", "echo", "{}")))
        .mount(&mock_server)
        .await;

    let mut config = mock_provider_config(&mock_server.uri());
    config.max_iterations = 3;
    let (engine, _data_dir) = engine_with_config(config);
    engine
        .load_session("p1", echo_tools(), ToolMap::new())
        .await;
    engine.add_message("p1", Message::user("loop")).await;

    let err = engine
        .start_generation("p1", "mock/test-model")
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::MaxIterationsExceeded(3)));
    assert_eq!(
        err.to_string(),
        "Generation exceeded the maximum of 3 iterations"
    );

    // Everything appended before the cap is preserved:
    // user + 3 rounds of (assistant tool-call turn + tool result).
    let session = engine.get_session("p1").await.unwrap();
    assert_eq!(session.messages().len(), 7);
    assert_eq!(session.generation_state(), GenerationState::Idle);
    assert!(session.streaming_message().is_none());
}
