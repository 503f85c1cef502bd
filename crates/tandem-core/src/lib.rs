//! Session and generation engine for AI-assisted coding.
//!
//! Tandem keeps one conversation per project, drives streaming model calls
//! through configured providers, and runs a bounded tool-calling loop until
//! the model produces a final answer. A UI layer consumes ordered
//! per-project events and the request/response API on [`SessionEngine`].

pub mod config;
pub mod core;
pub mod error;
pub mod logging;
pub mod providers;
pub mod session;
pub mod tools;

pub use crate::config::Config;
pub use crate::core::engine::SessionEngine;
pub use crate::core::events::{EventRx, SessionEvent};
pub use crate::error::EngineError;
pub use crate::providers::{ChatRequest, ChatTransport, HttpChatTransport, ProviderError};
pub use crate::session::store::{FileMessageStore, MessageStore, StoreError};
pub use crate::session::{GenerationState, Message, Role, Session, ToolCall};
pub use crate::tools::{SharedTool, Tool, ToolDefinition, ToolMap};
