pub mod anthropic;
pub mod openai;

use crate::error::GatewayError;
use crate::server::router::GatewayState;
use castor_schema::upstream::UpstreamEnvelope;
use tracing::warn;

/// One upstream POST, with a single retry on another credential when the
/// first one comes back 403. A second 403 surfaces as account-disabled.
pub(crate) async fn send_with_rotation(
    state: &GatewayState,
    envelope: &UpstreamEnvelope,
) -> Result<reqwest::Response, GatewayError> {
    let cred = state.pool.get_token().await?;
    match state.upstream.start_stream(&cred.access_token, envelope).await {
        Err(GatewayError::CredentialForbidden) => {
            warn!("upstream rejected the credential; rotating and retrying once");
            state
                .logs
                .clone()
                .record(
                    "warn",
                    "upstream returned 403; credential disabled, retrying with the next one",
                )
                .await;
            let next = state.pool.on_upstream_forbidden(&cred.refresh_token).await?;
            state.upstream.start_stream(&next.access_token, envelope).await
        }
        other => other,
    }
}
