mod content;
mod generation;
mod model_list;
mod request;
mod response;
mod tool;

pub use content::{Content, FunctionCall, FunctionResponse, InlineData, Part};
pub use generation::{GenerationConfig, ThinkingConfig};
pub use model_list::UpstreamModelList;
pub use request::{GenerateRequest, SystemInstruction, UpstreamEnvelope};
pub use response::{Candidate, ResponseBody, StreamChunk, UsageMetadata};
pub use tool::{FunctionCallingConfig, FunctionDeclaration, Tool, ToolConfig};
