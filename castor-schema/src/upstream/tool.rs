use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A group of callable functions advertised to the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tool {
    pub function_declarations: Vec<FunctionDeclaration>,
}

/// One callable function: name, prose description, JSON-schema parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionDeclaration {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parameters: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolConfig {
    pub function_calling_config: FunctionCallingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionCallingConfig {
    pub mode: String,
}

impl ToolConfig {
    /// The only mode the gateway forwards.
    pub fn validated() -> Self {
        Self {
            function_calling_config: FunctionCallingConfig {
                mode: "VALIDATED".to_string(),
            },
        }
    }
}
