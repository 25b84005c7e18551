mod gateway;
mod oauth;

pub use gateway::{ApiErrorBody, ApiErrorObject, GatewayError};
pub use oauth::OauthError;

/// Whether an error is worth retrying on the same resource.
pub trait IsRetryable {
    fn is_retryable(&self) -> bool;
}
