mod handlers;
mod respond;

pub use handlers::{count_tokens_handler, messages_handler};
