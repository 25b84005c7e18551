use super::respond::{CompletionMeta, build_completion, build_stream_response};
use crate::error::GatewayError;
use crate::server::guards::auth::authorize;
use crate::server::router::GatewayState;
use crate::server::routes::send_with_rotation;
use crate::tokens::{count_openai_messages, count_tool_schema};
use crate::translate::{
    EnvelopeContext, GenerationParams, build_envelope, build_generation_config,
    contents_from_openai, tools_from_openai,
};
use crate::upstream::UpstreamClient;
use axum::{
    Json,
    extract::State,
    http::HeaderMap,
    response::{IntoResponse, Response},
};
use castor_schema::openai::{ChatRequest, ModelList};
use chrono::Utc;
use serde_json::json;
use uuid::Uuid;

/// Requests shorter than this, with `stream` unset, are downgraded to
/// non-streaming. Upstream health probes send tiny single messages and choke
/// on SSE; this quirk keeps them working.
const SHORT_PROBE_CHARS: usize = 20;

pub async fn chat_completions_handler(
    State(state): State<GatewayState>,
    headers: HeaderMap,
    Json(request): Json<ChatRequest>,
) -> Result<Response, GatewayError> {
    if request.messages.is_empty() {
        return Err(GatewayError::InvalidRequest(
            "messages must be a non-empty array".to_string(),
        ));
    }
    let auth = authorize(&state, &headers).await?;

    let contents = contents_from_openai(&request.messages)?;
    let tools = match request.tools.as_deref() {
        Some(tools) => tools_from_openai(tools)?,
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
            system_text: None,
        },
        contents,
        tools,
        generation,
    );

    let prompt_tokens = count_openai_messages(state.estimator.as_ref(), &request.messages)
        + request
            .tools
            .as_deref()
            .map(count_tool_schema)
            .unwrap_or_default();
    let meta = CompletionMeta {
        id: format!("chatcmpl-{}", Uuid::new_v4()),
        created: Utc::now().timestamp(),
        model: request.model.clone(),
        prompt_tokens,
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
        let completion = build_completion(&events, &meta, state.estimator.as_ref());
        let mut resp = Json(completion).into_response();
        auth.apply_headers(resp.headers_mut());
        Ok(resp)
    }
}

pub async fn models_handler(
    State(state): State<GatewayState>,
    headers: HeaderMap,
) -> Result<Response, GatewayError> {
    let auth = authorize(&state, &headers).await?;

    let cred = state.pool.get_token().await?;
    let models = match state.upstream.fetch_models(&cred.access_token).await {
        Ok(models) => models,
        Err(GatewayError::CredentialForbidden) => {
            let next = state.pool.on_upstream_forbidden(&cred.refresh_token).await?;
            state.upstream.fetch_models(&next.access_token).await?
        }
        Err(e) => return Err(e),
    };

    let list = ModelList::from_model_ids(
        models.model_ids().map(str::to_string),
        Utc::now().timestamp(),
    );
    let mut resp = Json(list).into_response();
    auth.apply_headers(resp.headers_mut());
    Ok(resp)
}

pub async fn count_tokens_handler(
    State(state): State<GatewayState>,
    headers: HeaderMap,
    Json(request): Json<ChatRequest>,
) -> Result<Response, GatewayError> {
    let auth = authorize(&state, &headers).await?;

    let prompt_tokens = count_openai_messages(state.estimator.as_ref(), &request.messages)
        + request
            .tools
            .as_deref()
            .map(count_tool_schema)
            .unwrap_or_default();

    let mut resp = Json(json!({
        "object": "tokens",
        "model": request.model,
        "fallback": state.estimator.is_fallback(),
        "prompt_tokens": prompt_tokens,
        "completion_tokens": 0,
        "total_tokens": prompt_tokens,
    }))
    .into_response();
    auth.apply_headers(resp.headers_mut());
    Ok(resp)
}

fn is_short_probe(request: &ChatRequest) -> bool {
    request.messages.len() == 1
        && request.messages[0]
            .content
            .as_ref()
            .map(|content| content.joined_text().chars().count())
            .unwrap_or(0)
            < SHORT_PROBE_CHARS
}
