//! Session state: per-project conversation history plus generation status.
//!
//! A [`Session`] owns the ordered message log and the state of the single
//! generation that may be running against it. Mutation goes through small
//! helpers that keep the streaming-message invariant checkable: the draft is
//! present exactly while the generation is streaming or executing tools.

pub mod store;

use std::fmt;
use std::sync::{Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex as AsyncMutex;
use tokio_util::sync::CancellationToken;

use crate::tools::{SharedTool, ToolDefinition, ToolMap};

/// Message author role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A model-requested tool invocation carried by an assistant message.
///
/// `arguments` holds the accumulated JSON text exactly as streamed; it is
/// parsed to a value only at execution time.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: String,
}

/// One entry of a session's conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    /// User-visible text. May be empty while only reasoning or tool calls
    /// are present.
    #[serde(default)]
    pub content: String,
    /// Chain-of-thought text, kept separate from the answer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning_content: Option<String>,
    /// Present only on assistant messages that request tool execution.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
    /// Present only on tool-role messages, correlating the output to the
    /// call that produced it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl Message {
    fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            reasoning_content: None,
            tool_calls: None,
            tool_call_id: None,
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    /// Creates a tool-role message carrying one tool's output.
    pub fn tool_result(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            tool_call_id: Some(tool_call_id.into()),
            ..Self::new(Role::Tool, content)
        }
    }

    pub fn has_tool_calls(&self) -> bool {
        self.tool_calls.as_ref().is_some_and(|calls| !calls.is_empty())
    }
}

/// State of the generation slot of one session.
///
/// `Idle` is the unlocked state; anything else means a generation holds the
/// session's lease. Completion and failure are instantaneous transitions
/// back to `Idle`, not states of their own.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum GenerationState {
    #[default]
    Idle,
    Requesting,
    Streaming,
    ExecutingTools,
    Cancelling,
}

impl fmt::Display for GenerationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            GenerationState::Idle => "idle",
            GenerationState::Requesting => "requesting",
            GenerationState::Streaming => "streaming",
            GenerationState::ExecutingTools => "executing_tools",
            GenerationState::Cancelling => "cancelling",
        };
        f.write_str(label)
    }
}

struct SessionState {
    messages: Vec<Message>,
    streaming_message: Option<Message>,
    generation_state: GenerationState,
    cancel: Option<CancellationToken>,
}

/// Per-project conversational state plus generation status.
///
/// Identity is the project id; the tool maps are fixed for the session's
/// lifetime. Cheap to share behind an `Arc`.
pub struct Session {
    project_id: String,
    tools: ToolMap,
    custom_tools: ToolMap,
    state: Mutex<SessionState>,
    /// Serializes background persistence writes for this session.
    persist_lock: AsyncMutex<()>,
}

impl Session {
    pub(crate) fn new(
        project_id: impl Into<String>,
        tools: ToolMap,
        custom_tools: ToolMap,
        messages: Vec<Message>,
    ) -> Self {
        Self {
            project_id: project_id.into(),
            tools,
            custom_tools,
            state: Mutex::new(SessionState {
                messages,
                streaming_message: None,
                generation_state: GenerationState::Idle,
                cancel: None,
            }),
            persist_lock: AsyncMutex::new(()),
        }
    }

    pub(crate) fn persist_lock(&self) -> &AsyncMutex<()> {
        &self.persist_lock
    }

    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    /// Snapshot of the conversation in insertion order.
    pub fn messages(&self) -> Vec<Message> {
        self.lock().messages.clone()
    }

    pub fn message_count(&self) -> usize {
        self.lock().messages.len()
    }

    /// Snapshot of the draft currently being streamed, if any.
    pub fn streaming_message(&self) -> Option<Message> {
        self.lock().streaming_message.clone()
    }

    pub fn generation_state(&self) -> GenerationState {
        self.lock().generation_state
    }

    /// Looks a tool up by the name the model used, built-ins first.
    pub(crate) fn find_tool(&self, name: &str) -> Option<&SharedTool> {
        self.tools
            .get(name)
            .or_else(|| self.custom_tools.get(name))
    }

    /// Tool schemas advertised to the model, in deterministic order.
    pub(crate) fn tool_definitions(&self) -> Vec<ToolDefinition> {
        crate::tools::collect_definitions(&self.tools, &self.custom_tools)
    }

    pub(crate) fn push_message(&self, message: Message) {
        self.lock().messages.push(message);
    }

    /// Claims the generation lease, installing the cancellation token.
    ///
    /// Fails if another generation already holds the session.
    pub(crate) fn try_begin_generation(
        &self,
        token: CancellationToken,
    ) -> Result<(), crate::error::EngineError> {
        let mut state = self.lock();
        if state.generation_state != GenerationState::Idle {
            return Err(crate::error::EngineError::GenerationInProgress(
                self.project_id.clone(),
            ));
        }
        state.generation_state = GenerationState::Requesting;
        state.cancel = Some(token);
        Ok(())
    }

    /// Moves toward `next` unless a cancel request already won the race.
    pub(crate) fn advance_generation_state(&self, next: GenerationState) {
        let mut state = self.lock();
        if state.generation_state != GenerationState::Cancelling {
            state.generation_state = next;
        }
    }

    /// Records a new streaming snapshot, entering the Streaming state on the
    /// first delta of a round.
    pub(crate) fn update_streaming(&self, draft: Message) {
        let mut state = self.lock();
        if state.generation_state == GenerationState::Requesting {
            state.generation_state = GenerationState::Streaming;
        }
        state.streaming_message = Some(draft);
    }

    /// Discards the round's draft and returns to Requesting for the next
    /// provider round-trip.
    pub(crate) fn begin_next_round(&self) {
        let mut state = self.lock();
        state.streaming_message = None;
        if state.generation_state != GenerationState::Cancelling {
            state.generation_state = GenerationState::Requesting;
        }
    }

    /// Releases the generation lease: the draft is dropped and the session
    /// returns to Idle.
    pub(crate) fn end_generation(&self) {
        let mut state = self.lock();
        state.streaming_message = None;
        state.generation_state = GenerationState::Idle;
        state.cancel = None;
    }

    /// Flags the running generation for cancellation and fires its token.
    ///
    /// Returns false when no generation is running.
    pub(crate) fn request_cancel(&self) -> bool {
        let token = {
            let mut state = self.lock();
            if state.generation_state == GenerationState::Idle {
                return false;
            }
            state.generation_state = GenerationState::Cancelling;
            state.cancel.clone()
        };
        if let Some(token) = token {
            token.cancel();
        }
        true
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SessionState> {
        // Recover rather than propagate: the state is plain data and a
        // panicked writer cannot leave it torn beyond what the generation
        // failure path already handles.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock();
        f.debug_struct("Session")
            .field("project_id", &self.project_id)
            .field("messages", &state.messages.len())
            .field("generation_state", &state.generation_state)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> Session {
        Session::new("p1", ToolMap::new(), ToolMap::new(), Vec::new())
    }

    #[test]
    fn fresh_session_is_idle_and_empty() {
        let session = session();
        assert_eq!(session.project_id(), "p1");
        assert_eq!(session.generation_state(), GenerationState::Idle);
        assert!(session.streaming_message().is_none());
        assert!(session.messages().is_empty());
    }

    #[test]
    fn generation_lease_is_exclusive() {
        let session = session();
        session
            .try_begin_generation(CancellationToken::new())
            .unwrap();
        let err = session
            .try_begin_generation(CancellationToken::new())
            .unwrap_err();
        assert!(err.to_string().contains("already in progress"));
    }

    #[test]
    fn end_generation_clears_draft_and_lease() {
        let session = session();
        session
            .try_begin_generation(CancellationToken::new())
            .unwrap();
        session.update_streaming(Message::assistant("partial"));
        assert_eq!(session.generation_state(), GenerationState::Streaming);
        assert!(session.streaming_message().is_some());

        session.end_generation();
        assert_eq!(session.generation_state(), GenerationState::Idle);
        assert!(session.streaming_message().is_none());
        // The lease is free again.
        session
            .try_begin_generation(CancellationToken::new())
            .unwrap();
    }

    #[test]
    fn cancel_request_wins_over_state_advances() {
        let session = session();
        let token = CancellationToken::new();
        session.try_begin_generation(token.clone()).unwrap();
        assert!(session.request_cancel());
        assert!(token.is_cancelled());
        assert_eq!(session.generation_state(), GenerationState::Cancelling);

        // Racing transitions from the generation task must not clobber the
        // cancel flag.
        session.advance_generation_state(GenerationState::ExecutingTools);
        session.update_streaming(Message::assistant("late"));
        assert_eq!(session.generation_state(), GenerationState::Cancelling);
    }

    #[test]
    fn request_cancel_without_generation_is_rejected() {
        let session = session();
        assert!(!session.request_cancel());
        assert_eq!(session.generation_state(), GenerationState::Idle);
    }

    #[test]
    fn message_serialization_skips_absent_fields() {
        let json = serde_json::to_string(&Message::user("hi")).unwrap();
        assert_eq!(json, r#"{"role":"user","content":"hi"}"#);

        let tool = serde_json::to_string(&Message::tool_result("call_1", "ok")).unwrap();
        assert!(tool.contains(r#""tool_call_id":"call_1""#));
        assert!(tool.contains(r#""role":"tool""#));
    }
}
