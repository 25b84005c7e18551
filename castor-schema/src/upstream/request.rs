use super::content::Content;
use super::generation::GenerationConfig;
use super::tool::{Tool, ToolConfig};
use serde::{Deserialize, Serialize};

/// The inner generate-content request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateRequest {
    pub contents: Vec<Content>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_instruction: Option<SystemInstruction>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<Tool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_config: Option<ToolConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub generation_config: Option<GenerationConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

/// The upstream wants the system instruction as a user-role content.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemInstruction {
    pub role: String,
    pub parts: Vec<super::Part>,
}

impl SystemInstruction {
    pub fn from_text(text: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            parts: vec![super::Part::text(text)],
        }
    }
}

/// The outer envelope POSTed to the streaming endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpstreamEnvelope {
    pub project: String,
    pub request_id: String,
    pub request: GenerateRequest,
    pub model: String,
    pub user_agent: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn envelope_serializes_expected_shape() {
        let envelope = UpstreamEnvelope {
            project: "brisk-otter-a1b2c".to_string(),
            request_id: "agent-00000000-0000-4000-8000-000000000000".to_string(),
            request: GenerateRequest {
                contents: vec![Content::user(vec![super::super::Part::text("hi")])],
                system_instruction: Some(SystemInstruction::from_text("be terse")),
                session_id: Some("-42".to_string()),
                ..GenerateRequest::default()
            },
            model: "gemini-2.5-pro".to_string(),
            user_agent: "cloudcode/1.0".to_string(),
        };

        let value = serde_json::to_value(&envelope).unwrap();
        assert_eq!(value["project"], "brisk-otter-a1b2c");
        assert_eq!(value["requestId"], "agent-00000000-0000-4000-8000-000000000000");
        assert_eq!(value["request"]["sessionId"], "-42");
        assert_eq!(
            value["request"]["systemInstruction"],
            json!({"role": "user", "parts": [{"text": "be terse"}]})
        );
        assert_eq!(value["model"], "gemini-2.5-pro");
        assert_eq!(value["userAgent"], "cloudcode/1.0");
    }
}
