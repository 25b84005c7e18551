//! OpenAI Chat Completions → upstream contents.

use crate::error::GatewayError;
use castor_schema::openai::{ChatMessage, ContentPart, MessageContent};
use castor_schema::upstream::{Content, FunctionCall, FunctionResponse, Part};
use serde_json::json;

const SIGNATURE_OPEN: &str = "<!-- thought_signature: ";
const SIGNATURE_CLOSE: &str = " -->";

pub fn contents_from_openai(messages: &[ChatMessage]) -> Result<Vec<Content>, GatewayError> {
    let mut contents: Vec<Content> = Vec::new();
    for message in messages {
        match message.role.as_str() {
            "system" | "user" => {
                let parts = user_parts(message.content.as_ref())?;
                if !parts.is_empty() {
                    contents.push(Content::user(parts));
                }
            }
            "assistant" => push_assistant(&mut contents, message),
            "tool" => push_tool_response(&mut contents, message),
            other => {
                return Err(GatewayError::InvalidRequest(format!(
                    "unsupported message role: {other}"
                )));
            }
        }
    }
    Ok(contents)
}

/// Text parts accumulate into a single upstream text part; each data-URL
/// image becomes its own `inlineData` part.
fn user_parts(content: Option<&MessageContent>) -> Result<Vec<Part>, GatewayError> {
    let mut parts: Vec<Part> = Vec::new();
    let mut text_index: Option<usize> = None;

    let mut append_text = |parts: &mut Vec<Part>, text: &str| {
        match text_index {
            Some(idx) => {
                if let Some(existing) = parts[idx].text.as_mut() {
                    existing.push_str(text);
                }
            }
            None => {
                parts.push(Part::text(text));
                text_index = Some(parts.len() - 1);
            }
        }
    };

    match content {
        None => {}
        Some(MessageContent::Text(text)) => append_text(&mut parts, text),
        Some(MessageContent::Parts(list)) => {
            for part in list {
                match part {
                    ContentPart::Text { text } => append_text(&mut parts, text),
                    ContentPart::ImageUrl { image_url } => {
                        if let Some((mime, data)) = parse_data_url(&image_url.url) {
                            parts.push(Part::inline_data(mime, data));
                        }
                    }
                }
            }
        }
    }
    Ok(parts)
}

fn push_assistant(contents: &mut Vec<Content>, message: &ChatMessage) {
    let text = message
        .content
        .as_ref()
        .map(MessageContent::joined_text)
        .unwrap_or_default();
    let has_text = !text.is_empty();

    let call_parts: Vec<Part> = message
        .tool_calls
        .iter()
        .flatten()
        .map(|call| {
            Part::function_call(FunctionCall {
                id: Some(call.id.clone()),
                name: call.function.name.clone(),
                // The arguments string is embedded as-is under `query`.
                args: json!({ "query": call.function.arguments }),
            })
        })
        .collect();

    // A tool-call-only assistant turn continues the previous model turn when
    // one exists: the model already spoke, now it names its calls.
    if !call_parts.is_empty() && !has_text {
        if let Some(last) = contents
            .last_mut()
            .filter(|content| content.role.as_deref() == Some("model"))
        {
            last.parts.extend(call_parts);
            return;
        }
    }

    let mut parts = Vec::new();
    if has_text {
        let (clean, signature) = strip_thought_signature(&text);
        let mut part = Part::text(clean);
        part.thought_signature = signature;
        parts.push(part);
    }
    parts.extend(call_parts);
    if !parts.is_empty() {
        contents.push(Content::model(parts));
    }
}

fn push_tool_response(contents: &mut Vec<Content>, message: &ChatMessage) {
    let call_id = message.tool_call_id.clone();
    let name = call_id
        .as_deref()
        .and_then(|id| resolve_call_name(contents, id))
        .or_else(|| message.name.clone())
        .unwrap_or_default();
    let output = message
        .content
        .as_ref()
        .map(MessageContent::joined_text)
        .unwrap_or_default();

    let part = Part::function_response(FunctionResponse {
        id: call_id,
        name,
        response: json!({ "output": output }),
    });

    // Consecutive tool results collapse into one user turn.
    if let Some(last) = contents.last_mut().filter(|content| {
        content.role.as_deref() == Some("user")
            && content.parts.iter().any(|p| p.function_response.is_some())
    }) {
        last.parts.push(part);
        return;
    }
    contents.push(Content::user(vec![part]));
}

/// Walks backward to the `functionCall` this result answers.
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

/// Splits `"text<!-- thought_signature: X -->"` into `("text", Some("X"))`.
pub fn strip_thought_signature(text: &str) -> (String, Option<String>) {
    let Some(open) = text.find(SIGNATURE_OPEN) else {
        return (text.to_string(), None);
    };
    let after = &text[open + SIGNATURE_OPEN.len()..];
    let Some(close) = after.find(SIGNATURE_CLOSE) else {
        return (text.to_string(), None);
    };

    let signature = after[..close].to_string();
    let mut clean = String::with_capacity(text.len());
    clean.push_str(&text[..open]);
    clean.push_str(&after[close + SIGNATURE_CLOSE.len()..]);
    (clean, Some(signature))
}

/// `data:image/<fmt>;base64,<data>` → `("image/<fmt>", "<data>")`.
fn parse_data_url(url: &str) -> Option<(String, String)> {
    let rest = url.strip_prefix("data:")?;
    let (mime, data) = rest.split_once(";base64,")?;
    if !mime.starts_with("image/") {
        return None;
    }
    Some((mime.to_string(), data.to_string()))
}
