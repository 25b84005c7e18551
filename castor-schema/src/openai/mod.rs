mod chat_request;
mod chat_response;
mod model_list;

pub use chat_request::{
    ChatMessage, ChatRequest, ContentPart, ImageUrl, MessageContent, ToolCall, ToolDefinition,
    ToolFunction, ToolFunctionCall,
};
pub use chat_response::{
    AssistantMessage, ChatChunk, ChatCompletion, Choice, ChunkChoice, Delta, Usage,
};
pub use model_list::{Model, ModelList};
