mod messages_request;
mod messages_response;

pub use messages_request::{
    AnthropicTool, ContentBlock, ImageSource, Message, MessageContent, MessagesRequest,
    SystemPrompt,
};
pub use messages_response::{MessagesResponse, ResponseBlock, Usage};
