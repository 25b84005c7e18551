mod handlers;
mod respond;

pub use handlers::{chat_completions_handler, count_tokens_handler, models_handler};
