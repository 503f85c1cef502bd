//! Generation orchestrator: the bounded request → stream → tool loop.
//!
//! One call to [`run_generation`] drives a whole generation for a session
//! that already holds the lease. The loop requests a stream, folds deltas
//! through the accumulator while publishing snapshots, and either finalizes
//! the assistant turn or executes the requested tools in call order before
//! looping. Cancellation is cooperative: the token is observed at every
//! suspension point and never interrupts synchronous tool code.

use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::ProviderConfig;
use crate::core::accumulator::StreamingAccumulator;
use crate::core::engine::SessionEngine;
use crate::core::events::SessionEvent;
use crate::error::EngineError;
use crate::providers::{ChatRequest, DeltaStream};
use crate::session::{GenerationState, Message, Session, ToolCall};

enum StreamOutcome {
    Completed(Message),
    Cancelled,
}

pub(crate) async fn run_generation(
    engine: &SessionEngine,
    session: &Arc<Session>,
    provider: &ProviderConfig,
    model: &str,
    cancel: CancellationToken,
) -> Result<Message, EngineError> {
    let max_iterations = engine.config().max_iterations;

    for iteration in 0..max_iterations {
        if cancel.is_cancelled() {
            return cancelled(engine, session).await;
        }
        session.advance_generation_state(GenerationState::Requesting);
        debug!(
            project_id = session.project_id(),
            iteration, "requesting model stream"
        );

        let request = build_request(engine, session, provider, model);
        let stream = tokio::select! {
            biased;
            () = cancel.cancelled() => return cancelled(engine, session).await,
            result = engine.transport().stream_chat(request) => match result {
                Ok(stream) => stream,
                Err(err) => return failed(engine, session, err.into()).await,
            },
        };

        let draft = match consume_stream(engine, session, stream, &cancel).await {
            Ok(StreamOutcome::Completed(draft)) => draft,
            Ok(StreamOutcome::Cancelled) => return cancelled(engine, session).await,
            Err(err) => return failed(engine, session, err).await,
        };

        if !draft.has_tool_calls() {
            return finalize(engine, session, draft).await;
        }

        // The assistant turn carrying the calls is committed before any tool
        // runs, so the conversation always explains the tool output that
        // follows it.
        let tool_calls = draft.tool_calls.clone().unwrap_or_default();
        engine.append_message(session, draft).await;
        session.advance_generation_state(GenerationState::ExecutingTools);

        for call in &tool_calls {
            if cancel.is_cancelled() {
                return cancelled(engine, session).await;
            }
            let Some(content) = execute_tool_call(session, call, &cancel, engine).await else {
                return cancelled(engine, session).await;
            };
            engine
                .append_message(session, Message::tool_result(&call.id, content))
                .await;
        }

        session.begin_next_round();
    }

    failed(
        engine,
        session,
        EngineError::MaxIterationsExceeded(max_iterations),
    )
    .await
}

fn build_request(
    engine: &SessionEngine,
    session: &Session,
    provider: &ProviderConfig,
    model: &str,
) -> ChatRequest {
    ChatRequest {
        base_url: provider.base_url.clone(),
        api_key: provider.effective_api_key(),
        extra_headers: provider.extra_headers.clone(),
        model: model.to_string(),
        messages: session.messages(),
        tools: session.tool_definitions(),
        system_prompt: engine.config().system_prompt.clone(),
    }
}

async fn consume_stream(
    engine: &SessionEngine,
    session: &Session,
    mut stream: DeltaStream,
    cancel: &CancellationToken,
) -> Result<StreamOutcome, EngineError> {
    let mut acc = StreamingAccumulator::new();

    loop {
        let item = tokio::select! {
            biased;
            () = cancel.cancelled() => return Ok(StreamOutcome::Cancelled),
            item = stream.next() => item,
        };
        match item {
            Some(Ok(delta)) => {
                acc.apply(&delta);
                let draft = acc.draft().clone();
                let event = SessionEvent::StreamingUpdate {
                    project_id: session.project_id().to_string(),
                    content: draft.content.clone(),
                    reasoning_content: draft.reasoning_content.clone(),
                    tool_calls: draft.tool_calls.clone().unwrap_or_default(),
                };
                session.update_streaming(draft);
                engine.events().send_streaming(event);
            }
            Some(Err(err)) => return Err(err.into()),
            None => return Ok(StreamOutcome::Completed(acc.into_message())),
        }
    }
}

/// Runs one tool call, downgrading every failure to conversational content.
///
/// Returns `None` only when cancellation interrupts the wait on the tool's
/// future.
async fn execute_tool_call(
    session: &Session,
    call: &ToolCall,
    cancel: &CancellationToken,
    engine: &SessionEngine,
) -> Option<String> {
    let Some(tool) = session.find_tool(&call.name) else {
        warn!(
            project_id = session.project_id(),
            tool = %call.name,
            "model requested unknown tool"
        );
        return Some(format!("Tool \"{}\" not found", call.name));
    };

    let arguments: Value = if call.arguments.trim().is_empty() {
        Value::Object(serde_json::Map::new())
    } else {
        match serde_json::from_str(&call.arguments) {
            Ok(value) => value,
            Err(err) => {
                return Some(format!(
                    "Invalid tool arguments for \"{}\": {err}",
                    call.name
                ));
            }
        }
    };

    debug!(
        project_id = session.project_id(),
        tool = %call.name,
        id = %call.id,
        "executing tool"
    );
    let timeout = engine.config().tool_timeout();
    let execution = run_with_timeout(tool.execute(arguments), timeout, &call.name);
    let result = tokio::select! {
        biased;
        () = cancel.cancelled() => return None,
        result = execution => result,
    };

    Some(match result {
        Ok(content) => content,
        Err(err) => format!("Tool \"{}\" failed: {err}", call.name),
    })
}

async fn run_with_timeout(
    execution: impl Future<Output = anyhow::Result<String>>,
    timeout: Option<Duration>,
    tool_name: &str,
) -> anyhow::Result<String> {
    match timeout {
        Some(limit) => match tokio::time::timeout(limit, execution).await {
            Ok(result) => result,
            Err(_) => Err(anyhow::anyhow!(
                "tool \"{tool_name}\" timed out after {}s",
                limit.as_secs()
            )),
        },
        None => execution.await,
    }
}

async fn finalize(
    engine: &SessionEngine,
    session: &Arc<Session>,
    draft: Message,
) -> Result<Message, EngineError> {
    engine.append_message(session, draft.clone()).await;
    session.end_generation();
    debug!(project_id = session.project_id(), "generation finished");
    engine
        .events()
        .send(SessionEvent::GenerationFinished {
            project_id: session.project_id().to_string(),
            message: draft.clone(),
        })
        .await;
    Ok(draft)
}

async fn failed(
    engine: &SessionEngine,
    session: &Session,
    err: EngineError,
) -> Result<Message, EngineError> {
    session.end_generation();
    warn!(
        project_id = session.project_id(),
        error = %err,
        "generation failed"
    );
    engine
        .events()
        .send(SessionEvent::GenerationFailed {
            project_id: session.project_id().to_string(),
            error: err.to_string(),
        })
        .await;
    Err(err)
}

async fn cancelled(engine: &SessionEngine, session: &Session) -> Result<Message, EngineError> {
    session.end_generation();
    debug!(project_id = session.project_id(), "generation cancelled");
    engine
        .events()
        .send(SessionEvent::GenerationCancelled {
            project_id: session.project_id().to_string(),
        })
        .await;
    Err(EngineError::Cancelled)
}
