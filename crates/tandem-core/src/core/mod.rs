//! Engine core: orchestrator, accumulator, events.

pub mod accumulator;
pub(crate) mod agent;
pub mod engine;
pub mod events;

pub use accumulator::StreamingAccumulator;
pub use engine::SessionEngine;
pub use events::{DEFAULT_EVENT_CHANNEL_CAPACITY, EventBus, EventRx, SessionEvent};
