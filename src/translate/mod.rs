//! Three-way schema conversion with the upstream dialect as the hub.

pub mod anthropic;
pub mod generation;
pub mod openai;
pub mod tools;

pub use anthropic::contents_from_anthropic;
pub use generation::{GenerationParams, build_generation_config, wire_model_name};
pub use openai::{contents_from_openai, strip_thought_signature};
pub use tools::{tools_from_anthropic, tools_from_openai};

use castor_schema::upstream::{
    Content, GenerateRequest, GenerationConfig, SystemInstruction, Tool, ToolConfig,
    UpstreamEnvelope,
};
use uuid::Uuid;

/// Everything the envelope needs besides the translated contents.
#[derive(Debug, Clone)]
pub struct EnvelopeContext {
    pub project_id: String,
    pub session_id: String,
    /// Client-visible model name; the wire name is derived from it.
    pub model: String,
    pub user_agent: String,
    /// Configured instruction prepended to every request.
    pub system_instruction: String,
    /// Extra system text from the Anthropic `system` field, if any.
    pub system_text: Option<String>,
}

pub fn build_envelope(
    ctx: &EnvelopeContext,
    contents: Vec<Content>,
    tools: Vec<Tool>,
    generation_config: GenerationConfig,
) -> UpstreamEnvelope {
    let mut instruction = ctx.system_instruction.clone();
    if let Some(system_text) = ctx.system_text.as_deref().filter(|t| !t.is_empty()) {
        instruction.push('\n');
        instruction.push_str(system_text);
    }

    let tool_config = (!tools.is_empty()).then(ToolConfig::validated);

    UpstreamEnvelope {
        project: ctx.project_id.clone(),
        request_id: format!("agent-{}", Uuid::new_v4()),
        request: GenerateRequest {
            contents,
            system_instruction: Some(SystemInstruction::from_text(instruction)),
            tools,
            tool_config,
            generation_config: Some(generation_config),
            session_id: Some(ctx.session_id.clone()),
        },
        model: wire_model_name(&ctx.model),
        user_agent: ctx.user_agent.clone(),
    }
}
