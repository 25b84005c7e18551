//! Token-count estimation. The gateway treats counting as an opaque,
//! pluggable concern: handlers see only the [`TokenEstimator`] trait.

use castor_schema::anthropic::MessagesRequest;
use castor_schema::openai::ChatMessage;
use serde::Serialize;

pub trait TokenEstimator: Send + Sync {
    fn count_text(&self, text: &str) -> u32;

    /// True when counts are heuristic rather than tokenizer-exact; surfaced
    /// as the `fallback` field of the count endpoints.
    fn is_fallback(&self) -> bool {
        true
    }
}

/// Character-class heuristic: ~4 ASCII chars per token, wide glyphs one each.
#[derive(Debug, Default)]
pub struct HeuristicEstimator;

impl TokenEstimator for HeuristicEstimator {
    fn count_text(&self, text: &str) -> u32 {
        let mut ascii = 0u32;
        let mut wide = 0u32;
        for c in text.chars() {
            if c.is_ascii() {
                ascii += 1;
            } else {
                wide += 1;
            }
        }
        ascii.div_ceil(4) + wide
    }
}

/// Per-message framing overhead.
const MESSAGE_OVERHEAD: u32 = 4;

pub fn count_openai_messages(estimator: &dyn TokenEstimator, messages: &[ChatMessage]) -> u32 {
    messages
        .iter()
        .map(|message| {
            let text = message
                .content
                .as_ref()
                .map(|content| content.joined_text())
                .unwrap_or_default();
            estimator.count_text(&text) + MESSAGE_OVERHEAD
        })
        .sum()
}

pub fn count_anthropic_request(estimator: &dyn TokenEstimator, request: &MessagesRequest) -> u32 {
    let system = request
        .system
        .as_ref()
        .map(|system| estimator.count_text(&system.joined_text()))
        .unwrap_or_default();
    let messages: u32 = request
        .messages
        .iter()
        .map(|message| {
            let text = serde_json::to_string(&message.content).unwrap_or_default();
            estimator.count_text(&text) + MESSAGE_OVERHEAD
        })
        .sum();
    system + messages
}

/// Tool schemas are accounted separately, by serialized JSON size.
pub fn count_tool_schema<T: Serialize>(tools: &[T]) -> u32 {
    let bytes = serde_json::to_vec(tools).map(|b| b.len()).unwrap_or(0);
    (bytes as u32).div_ceil(4)
}
