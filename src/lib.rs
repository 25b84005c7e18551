pub mod config;
pub mod error;
pub mod identity;
pub mod keys;
pub mod pool;
pub mod server;
pub mod store;
pub mod tokens;
pub mod translate;
pub mod upstream;

pub use error::GatewayError;
pub use pool::Credential;
pub use server::router::{GatewayState, gateway_router};
