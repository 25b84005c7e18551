use super::respond::{MessageMeta, build_message, build_stream_response};
use crate::error::GatewayError;
use crate::server::guards::auth::authorize;
use crate::server::router::GatewayState;
use crate::server::routes::send_with_rotation;
use crate::tokens::{count_anthropic_request, count_tool_schema};
use crate::translate::{
    EnvelopeContext, GenerationParams, build_envelope, build_generation_config,
    contents_from_anthropic, tools_from_anthropic,
};
use crate::upstream::UpstreamClient;
use axum::{
    Json,
    extract::State,
    http::HeaderMap,
    response::{IntoResponse, Response},
};
use castor_schema::anthropic::{MessageContent, MessagesRequest};
use serde_json::json;
use uuid::Uuid;

const SHORT_PROBE_CHARS: usize = 20;

pub async fn messages_handler(
    State(state): State<GatewayState>,
    headers: HeaderMap,
    Json(request): Json<MessagesRequest>,
) -> Result<Response, GatewayError> {
    if request.messages.is_empty() {
        return Err(GatewayError::InvalidRequest(
            "messages must be a non-empty array".to_string(),
        ));
    }
    if request.model.is_empty() {
        return Err(GatewayError::InvalidRequest(
            "model is required".to_string(),
        ));
    }
    let auth = authorize(&state, &headers).await?;

    let contents = contents_from_anthropic(&request)?;
    let tools = match request.tools.as_deref() {
        Some(tools) => tools_from_anthropic(tools)?,
        None => Vec::new(),
    };
    let generation = build_generation_config(
        &GenerationParams {
            temperature: request.temperature,
            top_p: request.top_p,
            top_k: request.top_k,
            max_tokens: request.max_tokens,
        },
        &request.model,
        &state.config.defaults,
    );

    let (project_id, session_id) = state.identity.get(&auth.api_key);
    let envelope = build_envelope(
        &EnvelopeContext {
            project_id,
            session_id,
            model: request.model.clone(),
            user_agent: state.config.api.user_agent.clone(),
            system_instruction: state.config.system_instruction.clone(),
            system_text: request.system.as_ref().map(|system| system.joined_text()),
        },
        contents,
        tools,
        generation,
    );

    let input_tokens = count_anthropic_request(state.estimator.as_ref(), &request)
        + request
            .tools
            .as_deref()
            .map(count_tool_schema)
            .unwrap_or_default();
    let meta = MessageMeta {
        id: format!("msg_{}", Uuid::new_v4().simple()),
        model: request.model.clone(),
        input_tokens,
        stop_sequences: request.stop_sequences.clone().unwrap_or_default(),
        max_tokens: request.max_tokens,
    };

    let stream = request.stream.unwrap_or_else(|| !is_short_probe(&request));
    let upstream_resp = send_with_rotation(&state, &envelope).await?;

    if stream {
        Ok(build_stream_response(
            upstream_resp,
            meta,
            state.estimator.clone(),
            state.logs.clone(),
            &auth,
        ))
    } else {
        let events = UpstreamClient::collect_events(upstream_resp).await?;
        let message = build_message(&events, &meta, state.estimator.as_ref())?;
        let mut resp = Json(message).into_response();
        auth.apply_headers(resp.headers_mut());
        Ok(resp)
    }
}

pub async fn count_tokens_handler(
    State(state): State<GatewayState>,
    headers: HeaderMap,
    Json(request): Json<MessagesRequest>,
) -> Result<Response, GatewayError> {
    let auth = authorize(&state, &headers).await?;

    let input_tokens = count_anthropic_request(state.estimator.as_ref(), &request)
        + request
            .tools
            .as_deref()
            .map(count_tool_schema)
            .unwrap_or_default();

    let mut resp = Json(json!({
        "input_tokens": input_tokens,
        "model": request.model,
        "fallback": state.estimator.is_fallback(),
    }))
    .into_response();
    auth.apply_headers(resp.headers_mut());
    Ok(resp)
}

fn is_short_probe(request: &MessagesRequest) -> bool {
    request.messages.len() == 1
        && match &request.messages[0].content {
            MessageContent::Text(text) => text.chars().count() < SHORT_PROBE_CHARS,
            MessageContent::Blocks(_) => false,
        }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_text_message_is_a_probe() {
        let request: MessagesRequest = serde_json::from_value(json!({
            "model": "claude-sonnet-4-5",
            "messages": [{"role": "user", "content": "ping"}]
        }))
        .unwrap();
        assert!(is_short_probe(&request));
    }

    #[test]
    fn block_content_is_never_a_probe() {
        let request: MessagesRequest = serde_json::from_value(json!({
            "model": "claude-sonnet-4-5",
            "messages": [{"role": "user", "content": [{"type": "text", "text": "hi"}]}]
        }))
        .unwrap();
        assert!(!is_short_probe(&request));
    }
}
