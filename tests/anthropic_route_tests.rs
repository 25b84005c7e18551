use axum::{
    Json, Router,
    body::{Body, Bytes, to_bytes},
    extract::State,
    http::{Request, StatusCode, header},
    routing::post,
};
use castor::config::Config;
use castor::pool::Credential;
use castor::server::router::{GatewayState, gateway_router};
use castor::store::DataDir;
use serde_json::{Value, json};
use std::sync::{Arc, Mutex};
use tokio::net::TcpListener;
use tower::ServiceExt;
use url::Url;

#[derive(Clone, Default)]
struct CaptureState {
    bodies: Arc<Mutex<Vec<Value>>>,
}

fn temp_data_root(tag: &str) -> std::path::PathBuf {
    std::env::temp_dir().join(format!(
        "castor-anthropic-route-{tag}-{}-{}",
        std::process::id(),
        chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default()
    ))
}

async fn spawn_test_server(app: Router) -> Url {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind listener");
    let addr = listener.local_addr().expect("local addr");
    let base = Url::parse(&format!("http://{}", addr)).expect("valid base url");

    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("server run");
    });

    base
}

fn sse_body(lines: &[Value]) -> String {
    let mut body = String::new();
    for line in lines {
        body.push_str("data: ");
        body.push_str(&line.to_string());
        body.push_str("\n\n");
    }
    body
}

async fn capturing_upstream(
    State(capture): State<CaptureState>,
    Json(body): Json<Value>,
) -> impl axum::response::IntoResponse {
    capture.bodies.lock().unwrap().push(body);
    let stream = sse_body(&[
        json!({"response": {"candidates": [{"content": {"role": "model", "parts": [{"text": "a photo"}]}}]}}),
        json!({"response": {"candidates": [{"content": {"role": "model", "parts": [
            {"functionCall": {"id": "t9", "name": "annotate", "args": {"label": "cat"}}}
        ]}}]}}),
        json!({"response": {"candidates": [{"finishReason": "STOP"}]}}),
    ]);
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/event-stream")],
        stream,
    )
}

async fn build_state(tag: &str, upstream_base: &Url) -> (GatewayState, String) {
    let data = DataDir::open(temp_data_root(tag)).await.unwrap();
    let cred = Credential {
        access_token: "at-test".to_string(),
        refresh_token: "rt-test".to_string(),
        expires_in_seconds: 3_600,
        issued_at_ms: chrono::Utc::now().timestamp_millis(),
        enabled: true,
        email: None,
        display_name: None,
    };
    data.accounts::<Vec<Credential>>()
        .store(&vec![cred])
        .await
        .unwrap();

    let mut cfg = Config::default();
    cfg.api.url = upstream_base.join("/upstream:stream").unwrap();
    cfg.api.models_url = upstream_base.join("/upstream:models").unwrap();
    cfg.api.host = upstream_base.join("/token").unwrap();
    cfg.system_instruction = "base instruction".to_string();

    let state = GatewayState::initialize(cfg, &data).await.unwrap();
    let key = state.keys.create(None, None, None).await.unwrap().key;
    (state, key)
}

#[tokio::test]
async fn image_turn_reaches_upstream_as_one_user_content() {
    let capture = CaptureState::default();
    let upstream = Router::new()
        .route("/upstream:stream", post(capturing_upstream))
        .with_state(capture.clone());
    let base = spawn_test_server(upstream).await;
    let (state, key) = build_state("payload", &base).await;
    let app = gateway_router(state);

    let request_body = json!({
        "model": "claude-sonnet-4-5",
        "stream": false,
        "system": "be accurate",
        "messages": [{"role": "user", "content": [
            {"type": "text", "text": "describe"},
            {"type": "image", "source": {"type": "base64", "media_type": "image/png", "data": "aGVsbG8="}}
        ]}]
    });
    let resp = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/anthropic/v1/messages")
                .header("x-api-key", &key)
                .header("content-type", "application/json")
                .body(Body::from(request_body.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let captured = capture.bodies.lock().unwrap().clone();
    assert_eq!(captured.len(), 1);
    let envelope = &captured[0];

    // Identity fields from the cache.
    assert!(envelope["project"].as_str().unwrap().contains('-'));
    assert!(envelope["request"]["sessionId"].as_str().unwrap().starts_with('-'));
    assert!(envelope["requestId"].as_str().unwrap().starts_with("agent-"));

    // System text lands in the instruction and as the leading user turn.
    let instruction = envelope["request"]["systemInstruction"]["parts"][0]["text"]
        .as_str()
        .unwrap();
    assert_eq!(instruction, "base instruction\nbe accurate");

    let contents = envelope["request"]["contents"].as_array().unwrap();
    assert_eq!(contents.len(), 2);
    assert_eq!(contents[0]["parts"][0]["text"], "be accurate");

    let image_turn = &contents[1];
    assert_eq!(image_turn["role"], "user");
    let parts = image_turn["parts"].as_array().unwrap();
    assert_eq!(parts.len(), 2);
    assert_eq!(parts[0]["text"], "describe");
    assert_eq!(
        parts[1]["inlineData"],
        json!({"mimeType": "image/png", "data": "aGVsbG8="})
    );
}

#[tokio::test]
async fn streaming_messages_frame_events_in_order() {
    let capture = CaptureState::default();
    let upstream = Router::new()
        .route("/upstream:stream", post(capturing_upstream))
        .with_state(capture);
    let base = spawn_test_server(upstream).await;
    let (state, key) = build_state("framing", &base).await;
    let app = gateway_router(state);

    let request_body = json!({
        "model": "claude-sonnet-4-5",
        "stream": true,
        "messages": [{"role": "user", "content": "annotate the photo"}]
    });
    let resp = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/anthropic/v1/messages")
                .header("x-api-key", &key)
                .header("content-type", "application/json")
                .body(Body::from(request_body.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let body = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    let body = String::from_utf8(body.to_vec()).unwrap();

    let event_names: Vec<&str> = body
        .lines()
        .filter_map(|line| line.strip_prefix("event: "))
        .collect();
    assert_eq!(
        event_names,
        vec![
            "message_start",
            "content_block_start",
            "content_block_delta",
            "content_block_start",
            "content_block_stop",
            "content_block_stop",
            "message_delta",
            "message_stop",
        ]
    );

    let payloads: Vec<Value> = body
        .lines()
        .filter_map(|line| line.strip_prefix("data: "))
        .map(|data| serde_json::from_str(data).unwrap())
        .collect();

    assert_eq!(payloads[0]["type"], "message_start");
    assert_eq!(payloads[0]["message"]["role"], "assistant");

    // Index 0 is the text block, the tool block sits at index 1.
    assert_eq!(payloads[1]["index"], 0);
    assert_eq!(payloads[1]["content_block"]["type"], "text");
    assert_eq!(payloads[2]["delta"]["text"], "a photo");
    assert_eq!(payloads[3]["index"], 1);
    assert_eq!(payloads[3]["content_block"]["type"], "tool_use");
    assert_eq!(payloads[3]["content_block"]["input"], json!({"label": "cat"}));

    let delta = payloads
        .iter()
        .find(|p| p["type"] == "message_delta")
        .unwrap();
    assert_eq!(delta["delta"]["stop_reason"], "tool_use");
    assert!(delta["usage"]["output_tokens"].as_u64().unwrap() > 0);
}

/// Upstream stub that streams one text chunk and then dies mid-body.
async fn interrupted_upstream() -> axum::response::Response {
    let first = format!(
        "data: {}\n\n",
        json!({"response": {"candidates": [{"content": {"role": "model", "parts": [{"text": "partial answer"}]}}]}})
    );
    let chunks = tokio_stream::iter(vec![
        Ok::<Bytes, std::io::Error>(Bytes::from(first)),
        Err(std::io::Error::other("connection reset")),
    ]);
    axum::response::Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/event-stream")
        .body(Body::from_stream(chunks))
        .unwrap()
}

#[tokio::test]
async fn interrupted_stream_closes_open_text_block_before_error() {
    let upstream = Router::new().route("/upstream:stream", post(interrupted_upstream));
    let base = spawn_test_server(upstream).await;
    let (state, key) = build_state("interrupt", &base).await;
    let app = gateway_router(state);

    let request_body = json!({
        "model": "claude-sonnet-4-5",
        "stream": true,
        "messages": [{"role": "user", "content": "tell me something long"}]
    });
    let resp = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/anthropic/v1/messages")
                .header("x-api-key", &key)
                .header("content-type", "application/json")
                .body(Body::from(request_body.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let body = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    let body = String::from_utf8(body.to_vec()).unwrap();

    // The open text block is closed before the error, and the stream still
    // ends with exactly one terminator.
    let event_names: Vec<&str> = body
        .lines()
        .filter_map(|line| line.strip_prefix("event: "))
        .collect();
    assert_eq!(
        event_names,
        vec![
            "message_start",
            "content_block_start",
            "content_block_delta",
            "content_block_stop",
            "error",
            "message_stop",
        ]
    );

    let payloads: Vec<Value> = body
        .lines()
        .filter_map(|line| line.strip_prefix("data: "))
        .map(|data| serde_json::from_str(data).unwrap())
        .collect();
    assert_eq!(payloads[2]["delta"]["text"], "partial answer");
    assert_eq!(payloads[3]["type"], "content_block_stop");
    assert_eq!(payloads[3]["index"], 0);
    assert_eq!(payloads[4]["type"], "error");
    assert_eq!(payloads[4]["error"]["type"], "api_error");
    assert_eq!(payloads.last().unwrap()["type"], "message_stop");
}

#[tokio::test]
async fn model_is_required() {
    let capture = CaptureState::default();
    let upstream = Router::new()
        .route("/upstream:stream", post(capturing_upstream))
        .with_state(capture);
    let base = spawn_test_server(upstream).await;
    let (state, key) = build_state("nomodel", &base).await;
    let app = gateway_router(state);

    let resp = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/anthropic/v1/messages")
                .header("x-api-key", &key)
                .header("content-type", "application/json")
                .body(Body::from(
                    json!({"messages": [{"role": "user", "content": "hi"}]}).to_string(),
                ))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn count_tokens_reports_input_tokens() {
    let capture = CaptureState::default();
    let upstream = Router::new()
        .route("/upstream:stream", post(capturing_upstream))
        .with_state(capture);
    let base = spawn_test_server(upstream).await;
    let (state, key) = build_state("tokens", &base).await;
    let app = gateway_router(state);

    let resp = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/anthropic/v1/messages/count_tokens")
                .header("x-api-key", &key)
                .header("content-type", "application/json")
                .body(Body::from(
                    json!({
                        "model": "claude-sonnet-4-5",
                        "messages": [{"role": "user", "content": "hello over there"}]
                    })
                    .to_string(),
                ))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(resp.status(), StatusCode::OK);
    let body = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    let counted: Value = serde_json::from_slice(&body).unwrap();
    assert!(counted["input_tokens"].as_u64().unwrap() > 0);
    assert_eq!(counted["model"], "claude-sonnet-4-5");
    assert_eq!(counted["fallback"], true);
}
