use crate::config::Config;
use crate::error::GatewayError;
use crate::identity::IdentityCache;
use crate::keys::KeyStore;
use crate::pool::{CredentialPool, TokenEndpoint};
use crate::store::DataDir;
use crate::store::logbuf::LogBuffer;
use crate::tokens::{HeuristicEstimator, TokenEstimator};
use crate::upstream::UpstreamClient;

use axum::{
    Router,
    extract::{DefaultBodyLimit, Request, State},
    http::{HeaderName, HeaderValue, StatusCode, header::USER_AGENT},
    middleware::{self, Next},
    response::Response,
    routing::{get, post},
};
use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use rand::RngCore as _;
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, warn};

const MAX_REQUEST_ID_LEN: usize = 128;
const X_REQUEST_ID: HeaderName = HeaderName::from_static("x-request-id");

/// All mutable gateway state, owned here and borrowed by handlers.
#[derive(Clone)]
pub struct GatewayState {
    pub config: Arc<Config>,
    pub pool: Arc<CredentialPool>,
    pub keys: Arc<KeyStore>,
    pub identity: Arc<IdentityCache>,
    pub logs: Arc<LogBuffer>,
    pub upstream: Arc<UpstreamClient>,
    pub estimator: Arc<dyn TokenEstimator>,
}

impl GatewayState {
    /// Wires every component up from configuration and the data directory.
    pub async fn initialize(config: Config, data: &DataDir) -> Result<Self, GatewayError> {
        let endpoint = TokenEndpoint::new(
            config.api.host.clone(),
            config.oauth.client_id.clone(),
            config.oauth.client_secret.clone(),
        );
        let pool = CredentialPool::load(data.accounts(), endpoint).await?;
        let keys = KeyStore::load(data.api_keys()).await?;
        let upstream = UpstreamClient::new(&config.api);

        Ok(Self {
            config: Arc::new(config),
            pool: Arc::new(pool),
            keys: Arc::new(keys),
            identity: Arc::new(IdentityCache::new()),
            logs: Arc::new(LogBuffer::new(data.app_logs())),
            upstream: Arc::new(upstream),
            estimator: Arc::new(HeuristicEstimator),
        })
    }

    /// Starts the periodic flush tasks. Call exactly once at boot; dropping
    /// the returned guard cancels them (used on shutdown).
    pub fn spawn_background_tasks(&self) -> BackgroundTasks {
        BackgroundTasks {
            handles: vec![
                self.keys.clone().spawn_flush_task(),
                self.logs.clone().spawn_flush_task(),
            ],
        }
    }

    /// Final write-out before exit.
    pub async fn flush_all(&self) {
        if let Err(e) = self.keys.flush().await {
            warn!("final api key flush failed: {e}");
        }
        if let Err(e) = self.logs.flush().await {
            warn!("final app log flush failed: {e}");
        }
    }
}

pub struct BackgroundTasks {
    handles: Vec<tokio::task::JoinHandle<()>>,
}

impl Drop for BackgroundTasks {
    fn drop(&mut self) {
        for handle in &self.handles {
            handle.abort();
        }
    }
}

fn generate_request_id() -> String {
    // 96 bits => 16 chars base64url (no padding).
    let mut bytes = [0u8; 12];
    rand::rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

async fn not_found_handler() -> StatusCode {
    StatusCode::NOT_FOUND
}

async fn access_log(State(state): State<GatewayState>, req: Request, next: Next) -> Response {
    let method = req.method().clone();
    let uri = req.uri().clone();

    let request_id = req
        .headers()
        .get(X_REQUEST_ID)
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.is_empty() && value.len() <= MAX_REQUEST_ID_LEN)
        .map(str::to_string)
        .unwrap_or_else(generate_request_id);

    let user_agent = req
        .headers()
        .get(USER_AGENT)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("-")
        .to_string();

    let start = Instant::now();
    let mut resp = next.run(req).await;

    // Always reflect `x-request-id` for correlation.
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        resp.headers_mut().insert(X_REQUEST_ID, value);
    }

    let status = resp.status();
    let latency_ms = start.elapsed().as_millis() as u64;
    let path = uri.path();

    // For SSE responses the latency is time-to-first-byte, not stream length.
    let line = format!(
        "| {:>3} | {} | {:^7} | {} | {}ms | {}",
        status.as_u16(),
        request_id,
        method.as_str(),
        path,
        latency_ms,
        user_agent
    );
    let level = if status.is_server_error() {
        error!("{line}");
        "error"
    } else if status.is_client_error() {
        warn!("{line}");
        "warn"
    } else {
        info!("{line}");
        "info"
    };
    state.logs.clone().record(level, line).await;

    resp
}

pub fn gateway_router(state: GatewayState) -> Router {
    let max_body = state.config.security.max_request_size;
    Router::new()
        .route(
            "/v1/chat/completions",
            post(crate::server::routes::openai::chat_completions_handler),
        )
        .route(
            "/v1/chat/completions/count_tokens",
            post(crate::server::routes::openai::count_tokens_handler),
        )
        .route(
            "/v1/models",
            get(crate::server::routes::openai::models_handler),
        )
        .route(
            "/anthropic/v1/messages",
            post(crate::server::routes::anthropic::messages_handler),
        )
        .route(
            "/anthropic/v1/messages/count_tokens",
            post(crate::server::routes::anthropic::count_tokens_handler),
        )
        .fallback(not_found_handler)
        .layer(DefaultBodyLimit::max(max_body))
        .with_state(state.clone())
        .layer(middleware::from_fn_with_state(state, access_log))
}
