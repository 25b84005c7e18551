//! Anthropic-dialect response framing, streaming and buffered.
//!
//! Streaming event order: `message_start`; a text content block (index 0)
//! opened on first text; `tool_use` blocks at indices ≥ 1, each closed
//! immediately; `content_block_stop` for the text block; `message_delta`
//! with the stop reason and usage; finally `message_stop`. Every path —
//! including an in-band `error` event — closes any open text block first and
//! ends with the terminator, so block pairs always balance.

use crate::error::GatewayError;
use crate::server::guards::auth::Authorized;
use crate::store::logbuf::LogBuffer;
use crate::tokens::TokenEstimator;
use crate::upstream::{StreamEvent, ThinkingPhase, ToolCallOut, UpstreamClient};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use castor_schema::anthropic::{MessagesResponse, ResponseBlock, Usage};
use serde_json::{Value, json};
use std::convert::Infallible;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::StreamExt as _;
use tokio_stream::wrappers::ReceiverStream;
use tracing::warn;

const FRAME_QUEUE: usize = 32;

#[derive(Debug, Clone)]
pub(super) struct MessageMeta {
    pub id: String,
    pub model: String,
    pub input_tokens: u32,
    /// Client-requested stop sequences, for stop_reason classification.
    pub stop_sequences: Vec<String>,
    /// Client-requested output cap, for `max_tokens` classification.
    pub max_tokens: Option<u32>,
}

pub(super) fn build_stream_response(
    upstream_resp: reqwest::Response,
    meta: MessageMeta,
    estimator: Arc<dyn TokenEstimator>,
    logs: Arc<LogBuffer>,
    auth: &Authorized,
) -> Response {
    let (tx, rx) = mpsc::channel::<Event>(FRAME_QUEUE);
    tokio::spawn(drive_stream(upstream_resp, meta, estimator, logs, tx));

    let stream = ReceiverStream::new(rx).map(Ok::<_, Infallible>);
    let mut resp = Sse::new(stream).keep_alive(KeepAlive::default()).into_response();
    auth.apply_headers(resp.headers_mut());
    resp
}

async fn drive_stream(
    upstream_resp: reqwest::Response,
    meta: MessageMeta,
    estimator: Arc<dyn TokenEstimator>,
    logs: Arc<LogBuffer>,
    tx: mpsc::Sender<Event>,
) {
    let (ev_tx, mut ev_rx) = mpsc::channel::<StreamEvent>(FRAME_QUEUE);
    let pump = tokio::spawn(UpstreamClient::pump_events(upstream_resp, ev_tx));

    let start = json!({
        "type": "message_start",
        "message": {
            "id": meta.id,
            "type": "message",
            "role": "assistant",
            "model": meta.model,
            "content": [],
            "stop_reason": null,
            "stop_sequence": null,
            "usage": {"input_tokens": meta.input_tokens, "output_tokens": 0}
        }
    });
    if send(&tx, "message_start", &start).await.is_err() {
        pump.abort();
        return;
    }

    let mut text_open = false;
    let mut next_block = 1usize;
    let mut saw_tool_calls = false;
    let mut output = String::new();

    while let Some(event) = ev_rx.recv().await {
        let text = match event {
            StreamEvent::Text { delta } => delta,
            StreamEvent::Thinking { delta, phase } => match phase {
                ThinkingPhase::Start => "<think>".to_string(),
                ThinkingPhase::Mid => delta,
                ThinkingPhase::End => "</think>".to_string(),
            },
            StreamEvent::ToolCalls(calls) => {
                saw_tool_calls = true;
                for call in calls {
                    let input = match parse_call_input(&call) {
                        Ok(input) => input,
                        Err(e) => {
                            warn!("anthropic stream: undecodable tool arguments: {e}");
                            logs.clone().record("error", format!("messages stream aborted: {e}")).await;
                            if text_open {
                                let _ = close_text_block(&tx).await;
                            }
                            let _ = send_error(&tx, &e).await;
                            let _ = send(&tx, "message_stop", &json!({"type": "message_stop"})).await;
                            pump.abort();
                            return;
                        }
                    };
                    let ok = emit_tool_block(&tx, next_block, &call, &input).await;
                    next_block += 1;
                    if ok.is_err() {
                        pump.abort();
                        return;
                    }
                }
                continue;
            }
        };

        if text.is_empty() {
            continue;
        }
        output.push_str(&text);

        if !text_open {
            text_open = true;
            let open = json!({
                "type": "content_block_start",
                "index": 0,
                "content_block": {"type": "text", "text": ""}
            });
            if send(&tx, "content_block_start", &open).await.is_err() {
                pump.abort();
                return;
            }
        }
        let delta = json!({
            "type": "content_block_delta",
            "index": 0,
            "delta": {"type": "text_delta", "text": text}
        });
        if send(&tx, "content_block_delta", &delta).await.is_err() {
            pump.abort();
            return;
        }
    }

    let outcome = match pump.await {
        Ok(outcome) => outcome,
        Err(e) => Err(GatewayError::UpstreamInterrupted(e.to_string())),
    };

    if let Err(e) = outcome {
        warn!("anthropic stream interrupted: {e}");
        logs.record("error", format!("messages stream interrupted: {e}")).await;
        if text_open {
            let _ = close_text_block(&tx).await;
        }
        let _ = send_error(&tx, &e).await;
        let _ = send(&tx, "message_stop", &json!({"type": "message_stop"})).await;
        return;
    }

    if text_open && close_text_block(&tx).await.is_err() {
        return;
    }

    let output_tokens = estimator.count_text(&output);
    let (stop_reason, stop_sequence) = classify_stop(&meta, saw_tool_calls, &output, output_tokens);
    let message_delta = json!({
        "type": "message_delta",
        "delta": {"stop_reason": stop_reason, "stop_sequence": stop_sequence},
        "usage": {"input_tokens": meta.input_tokens, "output_tokens": output_tokens}
    });
    if send(&tx, "message_delta", &message_delta).await.is_err() {
        return;
    }
    let _ = send(&tx, "message_stop", &json!({"type": "message_stop"})).await;
}

/// Buffered (non-streaming) message from the full event list. Tool-argument
/// decode failures surface as 400 here, before anything reaches the client.
pub(super) fn build_message(
    events: &[StreamEvent],
    meta: &MessageMeta,
    estimator: &dyn TokenEstimator,
) -> Result<MessagesResponse, GatewayError> {
    let mut output = String::new();
    let mut blocks: Vec<ResponseBlock> = Vec::new();
    let mut saw_tool_calls = false;

    for event in events {
        match event {
            StreamEvent::Text { delta } => output.push_str(delta),
            StreamEvent::Thinking { delta, phase } => match phase {
                ThinkingPhase::Start => output.push_str("<think>"),
                ThinkingPhase::Mid => output.push_str(delta),
                ThinkingPhase::End => output.push_str("</think>"),
            },
            StreamEvent::ToolCalls(calls) => {
                saw_tool_calls = true;
                for call in calls {
                    blocks.push(ResponseBlock::ToolUse {
                        id: call.id.clone(),
                        name: call.name.clone(),
                        input: parse_call_input(call)?,
                    });
                }
            }
        }
    }

    if !output.is_empty() {
        blocks.insert(
            0,
            ResponseBlock::Text {
                text: output.clone(),
            },
        );
    }

    let output_tokens = estimator.count_text(&output);
    let (stop_reason, stop_sequence) = classify_stop(meta, saw_tool_calls, &output, output_tokens);

    let mut message = MessagesResponse::new(meta.id.clone(), meta.model.clone());
    message.content = blocks;
    message.stop_reason = Some(stop_reason.to_string());
    message.stop_sequence = stop_sequence;
    message.usage = Usage {
        input_tokens: meta.input_tokens,
        output_tokens,
    };
    Ok(message)
}

fn parse_call_input(call: &ToolCallOut) -> Result<Value, GatewayError> {
    serde_json::from_str(&call.arguments)
        .map_err(|e| GatewayError::ToolArgsParse(format!("tool `{}`: {e}", call.name)))
}

/// Resolution order: tool_use, stop_sequence, max_tokens, end_turn.
fn classify_stop(
    meta: &MessageMeta,
    saw_tool_calls: bool,
    output: &str,
    output_tokens: u32,
) -> (&'static str, Option<String>) {
    if saw_tool_calls {
        return ("tool_use", None);
    }
    if let Some(matched) = meta
        .stop_sequences
        .iter()
        .find(|sequence| !sequence.is_empty() && output.ends_with(sequence.as_str()))
    {
        return ("stop_sequence", Some(matched.clone()));
    }
    if let Some(cap) = meta.max_tokens
        && output_tokens >= cap
    {
        return ("max_tokens", None);
    }
    ("end_turn", None)
}

async fn close_text_block(tx: &mpsc::Sender<Event>) -> Result<(), ()> {
    let stop = json!({"type": "content_block_stop", "index": 0});
    send(tx, "content_block_stop", &stop).await
}

async fn emit_tool_block(
    tx: &mpsc::Sender<Event>,
    index: usize,
    call: &ToolCallOut,
    input: &Value,
) -> Result<(), ()> {
    let open = json!({
        "type": "content_block_start",
        "index": index,
        "content_block": {"type": "tool_use", "id": call.id, "name": call.name, "input": input}
    });
    send(tx, "content_block_start", &open).await?;
    let close = json!({"type": "content_block_stop", "index": index});
    send(tx, "content_block_stop", &close).await
}

async fn send_error(tx: &mpsc::Sender<Event>, error: &GatewayError) -> Result<(), ()> {
    let payload = json!({
        "type": "error",
        "error": {"type": "api_error", "message": error.to_string()}
    });
    send(tx, "error", &payload).await
}

async fn send(tx: &mpsc::Sender<Event>, event_name: &str, payload: &Value) -> Result<(), ()> {
    let event = Event::default()
        .event(event_name)
        .json_data(payload)
        .map_err(|e| {
            warn!("failed to serialize SSE payload: {e}");
        })?;
    tx.send(event).await.map_err(|_| ())
}
