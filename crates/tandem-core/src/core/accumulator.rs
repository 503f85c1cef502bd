//! Streaming accumulator: folds provider deltas into one draft message.

use crate::providers::{StreamDelta, ToolCallDelta};
use crate::session::{Message, ToolCall};

/// Folds incremental model output into a single draft assistant message.
///
/// Content and reasoning grow by concatenation; the reasoning field is
/// created on the first non-empty fragment. Tool-call fragments merge by
/// correlation id in arrival order, and a fragment without an id extends the
/// most recently started call. Duplicate deltas are a caller bug and are not
/// deduplicated here.
#[derive(Debug)]
pub struct StreamingAccumulator {
    draft: Message,
}

impl StreamingAccumulator {
    pub fn new() -> Self {
        Self {
            draft: Message::assistant(String::new()),
        }
    }

    /// Merges one delta into the draft.
    pub fn apply(&mut self, delta: &StreamDelta) {
        if let Some(text) = &delta.content {
            self.draft.content.push_str(text);
        }
        if let Some(reasoning) = &delta.reasoning
            && !reasoning.is_empty()
        {
            self.draft
                .reasoning_content
                .get_or_insert_with(String::new)
                .push_str(reasoning);
        }
        for fragment in &delta.tool_calls {
            self.merge_tool_call(fragment);
        }
    }

    fn merge_tool_call(&mut self, fragment: &ToolCallDelta) {
        let calls = self.draft.tool_calls.get_or_insert_with(Vec::new);
        let index = match &fragment.id {
            Some(id) => match calls.iter().position(|call| &call.id == id) {
                Some(index) => index,
                None => {
                    calls.push(ToolCall {
                        id: id.clone(),
                        ..ToolCall::default()
                    });
                    calls.len() - 1
                }
            },
            None => {
                // A fragment before any call started has nothing to attach to.
                if calls.is_empty() {
                    return;
                }
                calls.len() - 1
            }
        };
        let call = &mut calls[index];
        if let Some(name) = &fragment.name {
            call.name.push_str(name);
        }
        if let Some(arguments) = &fragment.arguments {
            call.arguments.push_str(arguments);
        }
    }

    /// The current draft.
    pub fn draft(&self) -> &Message {
        &self.draft
    }

    pub fn has_tool_calls(&self) -> bool {
        self.draft.has_tool_calls()
    }

    /// Consumes the accumulator, yielding the finished message.
    pub fn into_message(mut self) -> Message {
        if self
            .draft
            .tool_calls
            .as_ref()
            .is_some_and(Vec::is_empty)
        {
            self.draft.tool_calls = None;
        }
        self.draft
    }
}

impl Default for StreamingAccumulator {
    fn default() -> Self {
        Self::new()
    }
}
