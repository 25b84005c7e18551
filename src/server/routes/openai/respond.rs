//! OpenAI-dialect response framing, streaming and buffered.
//!
//! Streaming frame order: content/tool_call deltas, one finish-reason chunk,
//! one usage-only chunk, then the literal `[DONE]` line. Errors mid-stream
//! become a final content delta, and the `[DONE]` terminator is emitted on
//! every path so the stream is always well-formed.

use crate::server::guards::auth::Authorized;
use crate::store::logbuf::LogBuffer;
use crate::tokens::TokenEstimator;
use crate::upstream::{StreamEvent, ThinkingPhase, ToolCallOut, UpstreamClient};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use castor_schema::openai::{
    AssistantMessage, ChatChunk, ChatCompletion, Choice, Delta, ToolCall, ToolFunctionCall, Usage,
};
use serde::Serialize;
use std::convert::Infallible;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::StreamExt as _;
use tokio_stream::wrappers::ReceiverStream;
use tracing::warn;

/// Bounded frame queue: the upstream read loop blocks when the client reads
/// slowly instead of buffering the whole response.
const FRAME_QUEUE: usize = 32;

#[derive(Debug, Clone)]
pub(super) struct CompletionMeta {
    pub id: String,
    pub created: i64,
    pub model: String,
    pub prompt_tokens: u32,
}

impl CompletionMeta {
    fn chunk(&self) -> ChatChunk {
        ChatChunk::new(&self.id, self.created, &self.model)
    }
}

pub(super) fn build_stream_response(
    upstream_resp: reqwest::Response,
    meta: CompletionMeta,
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
    meta: CompletionMeta,
    estimator: Arc<dyn TokenEstimator>,
    logs: Arc<LogBuffer>,
    tx: mpsc::Sender<Event>,
) {
    let (ev_tx, mut ev_rx) = mpsc::channel::<StreamEvent>(FRAME_QUEUE);
    let pump = tokio::spawn(UpstreamClient::pump_events(upstream_resp, ev_tx));

    let mut saw_tool_calls = false;
    let mut output = String::new();

    while let Some(event) = ev_rx.recv().await {
        let chunk = match event {
            StreamEvent::Text { delta } => {
                output.push_str(&delta);
                meta.chunk().with_delta(content_delta(delta), None)
            }
            StreamEvent::Thinking { delta, phase } => {
                let text = frame_thinking(delta, phase);
                output.push_str(&text);
                meta.chunk().with_delta(content_delta(text), None)
            }
            StreamEvent::ToolCalls(calls) => {
                saw_tool_calls = true;
                let delta = Delta {
                    tool_calls: Some(calls.into_iter().map(openai_tool_call).collect()),
                    ..Delta::default()
                };
                meta.chunk().with_delta(delta, None)
            }
        };

        if send_json(&tx, &chunk).await.is_err() {
            // Client went away; stop reading upstream.
            pump.abort();
            return;
        }
    }

    let outcome = match pump.await {
        Ok(outcome) => outcome,
        Err(e) => Err(crate::error::GatewayError::UpstreamInterrupted(e.to_string())),
    };

    match outcome {
        Ok(()) => {
            let finish = if saw_tool_calls { "tool_calls" } else { "stop" };
            let finish_chunk = meta.chunk().with_delta(Delta::default(), Some(finish));
            if send_json(&tx, &finish_chunk).await.is_err() {
                return;
            }

            let usage_chunk = meta
                .chunk()
                .with_usage(usage(&meta, estimator.as_ref(), &output));
            if send_json(&tx, &usage_chunk).await.is_err() {
                return;
            }
        }
        Err(e) => {
            warn!("openai stream interrupted: {e}");
            logs.record("error", format!("chat stream interrupted: {e}")).await;
            let error_chunk = meta
                .chunk()
                .with_delta(content_delta(format!("错误: {e}")), None);
            if send_json(&tx, &error_chunk).await.is_err() {
                return;
            }
        }
    }

    let _ = tx.send(Event::default().data("[DONE]")).await;
}

/// Buffered (non-streaming) completion from the full event list.
pub(super) fn build_completion(
    events: &[StreamEvent],
    meta: &CompletionMeta,
    estimator: &dyn TokenEstimator,
) -> ChatCompletion {
    let mut output = String::new();
    let mut tool_calls: Vec<ToolCall> = Vec::new();

    for event in events {
        match event {
            StreamEvent::Text { delta } => output.push_str(delta),
            StreamEvent::Thinking { delta, phase } => {
                output.push_str(&frame_thinking(delta.clone(), *phase));
            }
            StreamEvent::ToolCalls(calls) => {
                tool_calls.extend(calls.iter().cloned().map(openai_tool_call));
            }
        }
    }

    let finish_reason = if tool_calls.is_empty() { "stop" } else { "tool_calls" };
    ChatCompletion {
        id: meta.id.clone(),
        object: "chat.completion".to_string(),
        created: meta.created,
        model: meta.model.clone(),
        choices: vec![Choice {
            index: 0,
            message: AssistantMessage {
                role: "assistant".to_string(),
                content: (!output.is_empty()).then(|| output.clone()),
                tool_calls: (!tool_calls.is_empty()).then_some(tool_calls),
            },
            finish_reason: finish_reason.to_string(),
        }],
        usage: Some(usage(meta, estimator, &output)),
    }
}

/// Reasoning deltas reach OpenAI clients as `<think>…</think>` text.
fn frame_thinking(delta: String, phase: ThinkingPhase) -> String {
    match phase {
        ThinkingPhase::Start => "<think>".to_string(),
        ThinkingPhase::Mid => delta,
        ThinkingPhase::End => "</think>".to_string(),
    }
}

fn content_delta(content: String) -> Delta {
    Delta {
        content: Some(content),
        ..Delta::default()
    }
}

fn openai_tool_call(call: ToolCallOut) -> ToolCall {
    ToolCall {
        id: call.id,
        kind: "function".to_string(),
        function: ToolFunctionCall {
            name: call.name,
            arguments: call.arguments,
        },
    }
}

fn usage(meta: &CompletionMeta, estimator: &dyn TokenEstimator, output: &str) -> Usage {
    let completion_tokens = estimator.count_text(output);
    Usage {
        prompt_tokens: meta.prompt_tokens,
        completion_tokens,
        total_tokens: meta.prompt_tokens + completion_tokens,
    }
}

async fn send_json<T: Serialize>(
    tx: &mpsc::Sender<Event>,
    payload: &T,
) -> Result<(), ()> {
    let event = Event::default().json_data(payload).map_err(|e| {
        warn!("failed to serialize SSE payload: {e}");
    })?;
    tx.send(event).await.map_err(|_| ())
}
