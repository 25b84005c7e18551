//! Anthropic Messages → upstream contents.

use crate::error::GatewayError;
use castor_schema::anthropic::{ContentBlock, Message, MessageContent, MessagesRequest};
use castor_schema::upstream::{Content, FunctionCall, FunctionResponse, Part};
use serde_json::{Value, json};

pub fn contents_from_anthropic(request: &MessagesRequest) -> Result<Vec<Content>, GatewayError> {
    let mut contents: Vec<Content> = Vec::new();

    if let Some(system) = &request.system {
        let text = system.joined_text();
        if !text.is_empty() {
            contents.push(Content::user(vec![Part::text(text)]));
        }
    }

    for message in &request.messages {
        match message.role.as_str() {
            "assistant" => contents.push(Content::model(assistant_parts(message)?)),
            "user" => contents.push(Content::user(user_parts(&contents, message)?)),
            other => {
                return Err(GatewayError::InvalidRequest(format!(
                    "unsupported message role: {other}"
                )));
            }
        }
    }
    Ok(contents)
}

fn assistant_parts(message: &Message) -> Result<Vec<Part>, GatewayError> {
    let mut parts = Vec::new();
    match &message.content {
        MessageContent::Text(text) => parts.push(Part::text(text)),
        MessageContent::Blocks(blocks) => {
            for block in blocks {
                match block {
                    ContentBlock::Text { text } => parts.push(Part::text(text)),
                    ContentBlock::ToolUse { id, name, input } => {
                        parts.push(Part::function_call(FunctionCall {
                            id: Some(id.clone()),
                            name: name.clone(),
                            // The raw input travels untouched under `query`.
                            args: json!({ "query": input }),
                        }));
                    }
                    ContentBlock::Image { source } => {
                        parts.push(Part::inline_data(media_type(&source.media_type), source.data.clone()));
                    }
                    ContentBlock::ToolResult { .. } => {
                        return Err(GatewayError::InvalidRequest(
                            "tool_result blocks belong to user messages".to_string(),
                        ));
                    }
                }
            }
        }
    }
    Ok(parts)
}

fn user_parts(prior: &[Content], message: &Message) -> Result<Vec<Part>, GatewayError> {
    let mut parts = Vec::new();
    match &message.content {
        MessageContent::Text(text) => parts.push(Part::text(text)),
        MessageContent::Blocks(blocks) => {
            for block in blocks {
                match block {
                    ContentBlock::Text { text } => parts.push(Part::text(text)),
                    ContentBlock::Image { source } => {
                        parts.push(Part::inline_data(media_type(&source.media_type), source.data.clone()));
                    }
                    ContentBlock::ToolResult {
                        tool_use_id,
                        id,
                        content,
                        ..
                    } => {
                        let call_id = tool_use_id.clone().or_else(|| id.clone());
                        let name = call_id
                            .as_deref()
                            .and_then(|call_id| resolve_call_name(prior, call_id))
                            .unwrap_or_default();
                        parts.push(Part::function_response(FunctionResponse {
                            id: call_id,
                            name,
                            response: json!({ "output": textify(content) }),
                        }));
                    }
                    ContentBlock::ToolUse { .. } => {
                        return Err(GatewayError::InvalidRequest(
                            "tool_use blocks belong to assistant messages".to_string(),
                        ));
                    }
                }
            }
        }
    }
    Ok(parts)
}

fn media_type(declared: &str) -> String {
    if declared.is_empty() {
        "image/png".to_string()
    } else {
        declared.to_string()
    }
}

fn resolve_call_name(contents: &[Content], call_id: &str) -> Option<String> {
    contents.iter().rev().find_map(|content| {
        content.parts.iter().rev().find_map(|part| {
            part.function_call
                .as_ref()
                .filter(|call| call.id.as_deref() == Some(call_id))
                .map(|call| call.name.clone())
        })
    })
}

/// Tool-result content arrives as a string, a block list, or arbitrary JSON.
fn textify(content: &Value) -> String {
    match content {
        Value::String(text) => text.clone(),
        Value::Array(blocks) => blocks
            .iter()
            .map(|block| match block.get("text").and_then(Value::as_str) {
                Some(text) => text.to_string(),
                None => block.to_string(),
            })
            .collect::<Vec<_>>()
            .join("\n"),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}
