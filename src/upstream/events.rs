//! Normalization of the upstream chunk stream into dispatcher events.
//!
//! The parser is a small state machine: it tracks whether the model is
//! currently emitting reasoning parts, and accumulates tool calls until the
//! upstream reports a finish reason for the turn.

use castor_schema::upstream::StreamChunk;
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThinkingPhase {
    Start,
    Mid,
    End,
}

/// One normalized event, ready for re-framing into either client dialect.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Text { delta: String },
    Thinking { delta: String, phase: ThinkingPhase },
    ToolCalls(Vec<ToolCallOut>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ToolCallOut {
    pub id: String,
    pub name: String,
    /// JSON-encoded argument object, stringified at emission time.
    pub arguments: String,
}

#[derive(Debug, Default)]
pub struct EventParser {
    thinking: bool,
    pending_calls: Vec<ToolCallOut>,
    call_seq: u32,
}

impl EventParser {
    /// Consumes one parsed upstream chunk and returns the events it yields,
    /// in order.
    pub fn feed(&mut self, chunk: &StreamChunk) -> Vec<StreamEvent> {
        let mut out = Vec::new();
        let Some(candidate) = chunk
            .response
            .as_ref()
            .and_then(|body| body.candidates.first())
        else {
            return out;
        };

        let parts = candidate
            .content
            .as_ref()
            .map(|content| content.parts.as_slice())
            .unwrap_or_default();

        for part in parts {
            if part.thought == Some(true) {
                if !self.thinking {
                    out.push(StreamEvent::Thinking {
                        delta: String::new(),
                        phase: ThinkingPhase::Start,
                    });
                    self.thinking = true;
                }
                out.push(StreamEvent::Thinking {
                    delta: part.text.clone().unwrap_or_default(),
                    phase: ThinkingPhase::Mid,
                });
                continue;
            }

            if let Some(text) = &part.text {
                self.close_thinking(&mut out);

                let mut delta = text.clone();
                if let Some(signature) = &part.thought_signature {
                    delta.push_str(&format!("<!-- thought_signature: {signature} -->"));
                }
                if let Some(inline) = &part.inline_data {
                    delta.push_str(&format!(
                        "![Generated Image](data:{};base64,{})",
                        inline.mime_type, inline.data
                    ));
                }
                out.push(StreamEvent::Text { delta });
                continue;
            }

            if let Some(inline) = &part.inline_data {
                self.close_thinking(&mut out);
                out.push(StreamEvent::Text {
                    delta: format!(
                        "![Generated Image](data:{};base64,{})",
                        inline.mime_type, inline.data
                    ),
                });
                continue;
            }

            if let Some(call) = &part.function_call {
                self.call_seq += 1;
                let id = call
                    .id
                    .clone()
                    .unwrap_or_else(|| format!("call_{}", self.call_seq));
                self.pending_calls.push(ToolCallOut {
                    id,
                    name: call.name.clone(),
                    arguments: stringify_args(&call.args),
                });
            }
        }

        if candidate.finish_reason.is_some() && !self.pending_calls.is_empty() {
            self.close_thinking(&mut out);
            out.push(StreamEvent::ToolCalls(std::mem::take(&mut self.pending_calls)));
        }

        out
    }

    /// EOF: closes a dangling reasoning block so client framings stay valid.
    pub fn finish(&mut self) -> Vec<StreamEvent> {
        let mut out = Vec::new();
        self.close_thinking(&mut out);
        out
    }

    fn close_thinking(&mut self, out: &mut Vec<StreamEvent>) {
        if self.thinking {
            out.push(StreamEvent::Thinking {
                delta: String::new(),
                phase: ThinkingPhase::End,
            });
            self.thinking = false;
        }
    }
}

fn stringify_args(args: &Value) -> String {
    serde_json::to_string(args).unwrap_or_else(|_| "{}".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn chunk(value: serde_json::Value) -> StreamChunk {
        serde_json::from_value(value).unwrap()
    }

    fn text_chunk(text: &str) -> StreamChunk {
        chunk(json!({
            "response": {"candidates": [{"content": {"role": "model", "parts": [{"text": text}]}}]}
        }))
    }

    #[test]
    fn plain_text_passes_through() {
        let mut parser = EventParser::default();
        assert_eq!(
            parser.feed(&text_chunk("hi")),
            vec![StreamEvent::Text {
                delta: "hi".to_string()
            }]
        );
    }

    #[test]
    fn thinking_opens_once_and_closes_on_text() {
        let mut parser = EventParser::default();

        let first = parser.feed(&chunk(json!({
            "response": {"candidates": [{"content": {"parts": [{"thought": true, "text": "hmm"}]}}]}
        })));
        assert_eq!(
            first,
            vec![
                StreamEvent::Thinking {
                    delta: String::new(),
                    phase: ThinkingPhase::Start
                },
                StreamEvent::Thinking {
                    delta: "hmm".to_string(),
                    phase: ThinkingPhase::Mid
                },
            ]
        );

        let second = parser.feed(&chunk(json!({
            "response": {"candidates": [{"content": {"parts": [{"thought": true, "text": "more"}]}}]}
        })));
        assert_eq!(
            second,
            vec![StreamEvent::Thinking {
                delta: "more".to_string(),
                phase: ThinkingPhase::Mid
            }]
        );

        let third = parser.feed(&text_chunk("answer"));
        assert_eq!(
            third,
            vec![
                StreamEvent::Thinking {
                    delta: String::new(),
                    phase: ThinkingPhase::End
                },
                StreamEvent::Text {
                    delta: "answer".to_string()
                },
            ]
        );
    }

    #[test]
    fn signature_and_image_are_appended_to_the_text_delta() {
        let mut parser = EventParser::default();
        let events = parser.feed(&chunk(json!({
            "response": {"candidates": [{"content": {"parts": [{
                "text": "see: ",
                "thoughtSignature": "SIG",
                "inlineData": {"mimeType": "image/png", "data": "aGk="}
            }]}}]}
        })));
        let StreamEvent::Text { delta } = &events[0] else {
            panic!("expected text event");
        };
        assert_eq!(
            delta,
            "see: <!-- thought_signature: SIG -->![Generated Image](data:image/png;base64,aGk=)"
        );
    }

    #[test]
    fn tool_calls_accumulate_until_finish_reason() {
        let mut parser = EventParser::default();

        let none = parser.feed(&chunk(json!({
            "response": {"candidates": [{"content": {"parts": [
                {"functionCall": {"id": "t1", "name": "lookup", "args": {"q": "x"}}}
            ]}}]}
        })));
        assert!(none.is_empty());

        let flushed = parser.feed(&chunk(json!({
            "response": {"candidates": [{"finishReason": "STOP"}]}
        })));
        assert_eq!(
            flushed,
            vec![StreamEvent::ToolCalls(vec![ToolCallOut {
                id: "t1".to_string(),
                name: "lookup".to_string(),
                arguments: "{\"q\":\"x\"}".to_string(),
            }])]
        );

        // Accumulator resets after the flush.
        assert!(parser.feed(&chunk(json!({
            "response": {"candidates": [{"finishReason": "STOP"}]}
        })))
        .is_empty());
    }

    #[test]
    fn missing_call_id_gets_a_sequence_fallback() {
        let mut parser = EventParser::default();
        parser.feed(&chunk(json!({
            "response": {"candidates": [{"content": {"parts": [
                {"functionCall": {"name": "lookup", "args": {}}}
            ]}}]}
        })));
        let events = parser.feed(&chunk(json!({
            "response": {"candidates": [{"finishReason": "STOP"}]}
        })));
        let StreamEvent::ToolCalls(calls) = &events[0] else {
            panic!("expected tool calls");
        };
        assert_eq!(calls[0].id, "call_1");
    }

    #[test]
    fn finish_closes_dangling_thinking() {
        let mut parser = EventParser::default();
        parser.feed(&chunk(json!({
            "response": {"candidates": [{"content": {"parts": [{"thought": true, "text": "x"}]}}]}
        })));
        assert_eq!(
            parser.finish(),
            vec![StreamEvent::Thinking {
                delta: String::new(),
                phase: ThinkingPhase::End
            }]
        );
        assert!(parser.finish().is_empty());
    }
}
