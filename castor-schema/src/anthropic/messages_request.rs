use serde::{Deserialize, Serialize};
use serde_json::Value;

/// An incoming Messages request.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct MessagesRequest {
    #[serde(default)]
    pub model: String,

    #[serde(default)]
    pub messages: Vec<Message>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub system: Option<SystemPrompt>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<AnthropicTool>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_k: Option<u32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_sequences: Option<Vec<String>>,
}

/// The system prompt: a bare string or a list of text blocks.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
pub enum SystemPrompt {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

impl SystemPrompt {
    pub fn joined_text(&self) -> String {
        match self {
            SystemPrompt::Text(text) => text.clone(),
            SystemPrompt::Blocks(blocks) => blocks
                .iter()
                .filter_map(|block| match block {
                    ContentBlock::Text { text } => Some(text.as_str()),
                    _ => None,
                })
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Message {
    pub role: String,
    pub content: MessageContent,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

/// One typed content block. Unknown block types fail loudly rather than
/// silently dropping caller data.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    Image {
        source: ImageSource,
    },
    ToolUse {
        id: String,
        name: String,
        #[serde(default)]
        input: Value,
    },
    ToolResult {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tool_use_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        #[serde(default)]
        content: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        is_error: Option<bool>,
    },
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ImageSource {
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub media_type: String,
    #[serde(default)]
    pub data: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AnthropicTool {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_schema: Option<Value>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn blocks_parse_with_type_tags() {
        let message: Message = serde_json::from_value(json!({
            "role": "user",
            "content": [
                {"type": "text", "text": "describe"},
                {"type": "image", "source": {"type": "base64", "media_type": "image/png", "data": "aGk="}},
                {"type": "tool_result", "tool_use_id": "t1", "content": "ok"}
            ]
        }))
        .unwrap();

        let MessageContent::Blocks(blocks) = &message.content else {
            panic!("expected block content");
        };
        assert_eq!(blocks.len(), 3);
        assert!(matches!(&blocks[1], ContentBlock::Image { source } if source.media_type == "image/png"));
    }

    #[test]
    fn tool_use_input_is_preserved_verbatim() {
        let block: ContentBlock = serde_json::from_value(json!({
            "type": "tool_use",
            "id": "t1",
            "name": "lookup",
            "input": {"city": "Berlin", "unit": "c"}
        }))
        .unwrap();
        let ContentBlock::ToolUse { input, .. } = block else {
            panic!("expected tool_use");
        };
        assert_eq!(input, json!({"city": "Berlin", "unit": "c"}));
    }

    #[test]
    fn system_prompt_accepts_string_and_blocks() {
        let text: SystemPrompt = serde_json::from_value(json!("be terse")).unwrap();
        assert_eq!(text.joined_text(), "be terse");

        let blocks: SystemPrompt = serde_json::from_value(json!([
            {"type": "text", "text": "a"},
            {"type": "text", "text": "b"}
        ]))
        .unwrap();
        assert_eq!(blocks.joined_text(), "a\nb");
    }
}
