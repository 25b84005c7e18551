mod client;
mod events;

pub use client::UpstreamClient;
pub use events::{EventParser, StreamEvent, ThinkingPhase, ToolCallOut};
