//! Wire dialects spoken by the castor gateway.
//!
//! Three schemas, kept in separate modules:
//! - [`openai`]: the Chat Completions dialect accepted on `/v1/*`.
//! - [`anthropic`]: the Messages dialect accepted on `/anthropic/v1/*`.
//! - [`upstream`]: the generate-content dialect of the backend the gateway
//!   fronts. This is the hub format; both client dialects translate into it.

pub mod anthropic;
pub mod openai;
pub mod upstream;
