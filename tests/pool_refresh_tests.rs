use axum::{
    Json, Router,
    extract::State,
    http::{HeaderMap, StatusCode},
    routing::post,
};
use castor::error::GatewayError;
use castor::pool::{Credential, CredentialPool, TokenEndpoint};
use castor::store::{DataDir, JsonFile};
use serde_json::{Value, json};
use std::sync::{Arc, Mutex};
use tokio::net::TcpListener;
use url::Url;

#[derive(Clone, Default)]
struct CaptureState {
    forms: Arc<Mutex<Vec<String>>>,
    /// Status override per refresh token, keyed by the submitted token value.
    rejects: Arc<Mutex<Vec<(String, u16)>>>,
}

async fn token_handler(
    State(capture): State<CaptureState>,
    _headers: HeaderMap,
    body: String,
) -> (StatusCode, Json<Value>) {
    capture.forms.lock().unwrap().push(body.clone());

    let submitted_token = url::form_urlencoded::parse(body.as_bytes())
        .find(|(k, _)| k == "refresh_token")
        .map(|(_, v)| v.into_owned())
        .unwrap_or_default();

    let reject = capture
        .rejects
        .lock()
        .unwrap()
        .iter()
        .find(|(token, _)| *token == submitted_token)
        .map(|(_, status)| *status);
    if let Some(status) = reject {
        return (
            StatusCode::from_u16(status).unwrap(),
            Json(json!({"error": "invalid_grant"})),
        );
    }

    (
        StatusCode::OK,
        Json(json!({
            "access_token": format!("fresh-{submitted_token}"),
            "expires_in": 3599,
            "token_type": "Bearer"
        })),
    )
}

async fn spawn_token_server(capture: CaptureState) -> Url {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind listener");
    let addr = listener.local_addr().expect("local addr");
    let app = Router::new()
        .route("/token", post(token_handler))
        .with_state(capture);
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("server run");
    });
    Url::parse(&format!("http://{}/token", addr)).expect("valid url")
}

fn expired(tag: &str) -> Credential {
    Credential {
        access_token: String::new(),
        refresh_token: format!("rt-{tag}"),
        expires_in_seconds: 0,
        issued_at_ms: 0,
        enabled: true,
        email: None,
        display_name: None,
    }
}

async fn temp_accounts(
    tag: &str,
    creds: &[Credential],
) -> (JsonFile<Vec<Credential>>, std::path::PathBuf) {
    let root = std::env::temp_dir().join(format!(
        "castor-pool-refresh-{tag}-{}-{}",
        std::process::id(),
        chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default()
    ));
    let dir = DataDir::open(root).await.unwrap();
    let file = dir.accounts();
    file.store(&creds.to_vec()).await.unwrap();
    let path = file.path().to_path_buf();
    (file, path)
}

#[tokio::test]
async fn refresh_posts_the_expected_form_grant() {
    let capture = CaptureState::default();
    let token_url = spawn_token_server(capture.clone()).await;
    let (file, _path) = temp_accounts("form", &[expired("a")]).await;
    let endpoint = TokenEndpoint::new(token_url, "client-1".to_string(), "secret-1".to_string());
    let pool = CredentialPool::load(file, endpoint).await.unwrap();

    let cred = pool.get_token().await.unwrap();
    assert_eq!(cred.access_token, "fresh-rt-a");
    assert!(cred.expires_in_seconds > 0);

    let forms = capture.forms.lock().unwrap().clone();
    assert_eq!(forms.len(), 1);
    let fields: Vec<(String, String)> = url::form_urlencoded::parse(forms[0].as_bytes())
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    assert!(fields.contains(&("grant_type".to_string(), "refresh_token".to_string())));
    assert!(fields.contains(&("refresh_token".to_string(), "rt-a".to_string())));
    assert!(fields.contains(&("client_id".to_string(), "client-1".to_string())));
    assert!(fields.contains(&("client_secret".to_string(), "secret-1".to_string())));
}

#[tokio::test]
async fn refreshed_token_is_persisted_and_reused() {
    let capture = CaptureState::default();
    let token_url = spawn_token_server(capture.clone()).await;
    let (file, path) = temp_accounts("persist", &[expired("a")]).await;
    let endpoint = TokenEndpoint::new(token_url, "id".to_string(), "secret".to_string());
    let pool = CredentialPool::load(file, endpoint).await.unwrap();

    pool.get_token().await.unwrap();
    // Second call sees the fresh token in memory; no second refresh happens.
    pool.get_token().await.unwrap();
    assert_eq!(capture.forms.lock().unwrap().len(), 1);

    // And the refreshed state made it to disk.
    let on_disk: Vec<Credential> =
        serde_json::from_slice(&tokio::fs::read(&path).await.unwrap()).unwrap();
    assert_eq!(on_disk[0].access_token, "fresh-rt-a");
}

#[tokio::test]
async fn provider_403_disables_credential_and_rotation_moves_on() {
    let capture = CaptureState::default();
    capture
        .rejects
        .lock()
        .unwrap()
        .push(("rt-a".to_string(), 403));
    let token_url = spawn_token_server(capture.clone()).await;
    let (file, _path) = temp_accounts("forbidden", &[expired("a"), expired("b")]).await;
    let endpoint = TokenEndpoint::new(token_url, "id".to_string(), "secret".to_string());
    let pool = CredentialPool::load(file, endpoint).await.unwrap();

    // First pick hits the disabled grant, rotates, and lands on `b`.
    let cred = pool.get_token().await.unwrap();
    assert_eq!(cred.access_token, "fresh-rt-b");

    let snapshot = pool.usage_snapshot().await;
    assert!(!snapshot.credentials[0].enabled);
    assert!(snapshot.credentials[1].enabled);

    // The disabled grant is never tried again.
    let before = capture.forms.lock().unwrap().len();
    pool.get_token().await.unwrap();
    let after = capture.forms.lock().unwrap().len();
    assert_eq!(before, after);
}

#[tokio::test]
async fn transient_provider_error_skips_to_the_next_credential() {
    let capture = CaptureState::default();
    capture
        .rejects
        .lock()
        .unwrap()
        .push(("rt-a".to_string(), 400));
    let token_url = spawn_token_server(capture.clone()).await;
    let (file, _path) = temp_accounts("transient", &[expired("a"), expired("b")]).await;
    let endpoint = TokenEndpoint::new(token_url, "id".to_string(), "secret".to_string());
    let pool = CredentialPool::load(file, endpoint).await.unwrap();

    let cred = pool.get_token().await.unwrap();
    assert_eq!(cred.access_token, "fresh-rt-b");

    // A 400 is transient: the credential stays enabled for future rounds.
    let snapshot = pool.usage_snapshot().await;
    assert!(snapshot.credentials[0].enabled);
}

#[tokio::test]
async fn all_credentials_failing_reports_no_credentials() {
    let capture = CaptureState::default();
    {
        let mut rejects = capture.rejects.lock().unwrap();
        rejects.push(("rt-a".to_string(), 403));
        rejects.push(("rt-b".to_string(), 403));
    }
    let token_url = spawn_token_server(capture.clone()).await;
    let (file, _path) = temp_accounts("exhausted", &[expired("a"), expired("b")]).await;
    let endpoint = TokenEndpoint::new(token_url, "id".to_string(), "secret".to_string());
    let pool = CredentialPool::load(file, endpoint).await.unwrap();

    assert!(matches!(
        pool.get_token().await,
        Err(GatewayError::NoCredentials)
    ));
}
