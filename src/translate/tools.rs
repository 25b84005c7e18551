//! Tool-schema normalization into upstream `functionDeclarations`.

use crate::error::GatewayError;
use castor_schema::anthropic::AnthropicTool;
use castor_schema::openai::ToolDefinition;
use castor_schema::upstream::{FunctionDeclaration, Tool};
use serde_json::Value;

/// Upper bound on advertised tools per request.
pub const MAX_TOOLS: usize = 32;
/// Upper bound on one tool's serialized parameter schema.
pub const MAX_PARAMETERS_BYTES: usize = 50 * 1024;

/// Schema keys never forwarded upstream.
const STRIPPED_KEYS: [&str; 3] = ["$schema", "__proto__", "prototype"];

pub fn tools_from_openai(tools: &[ToolDefinition]) -> Result<Vec<Tool>, GatewayError> {
    let declarations = tools
        .iter()
        .map(|tool| {
            if tool.kind != "function" {
                return Err(GatewayError::ToolSchemaInvalid(format!(
                    "unsupported tool type: {}",
                    tool.kind
                )));
            }
            declaration(
                &tool.function.name,
                &tool.function.description,
                tool.function.parameters.clone(),
            )
        })
        .collect::<Result<Vec<_>, _>>()?;
    bundle(declarations)
}

pub fn tools_from_anthropic(tools: &[AnthropicTool]) -> Result<Vec<Tool>, GatewayError> {
    let declarations = tools
        .iter()
        .map(|tool| declaration(&tool.name, &tool.description, tool.input_schema.clone()))
        .collect::<Result<Vec<_>, _>>()?;
    bundle(declarations)
}

fn declaration(
    name: &str,
    description: &str,
    parameters: Option<Value>,
) -> Result<FunctionDeclaration, GatewayError> {
    if name.trim().is_empty() {
        return Err(GatewayError::ToolSchemaInvalid(
            "tool name must be non-empty".to_string(),
        ));
    }

    let parameters = parameters.map(|mut schema| {
        sanitize_schema(&mut schema);
        schema
    });
    if let Some(schema) = &parameters {
        let serialized_len = serde_json::to_vec(schema).map(|b| b.len()).unwrap_or(0);
        if serialized_len > MAX_PARAMETERS_BYTES {
            return Err(GatewayError::ToolSchemaInvalid(format!(
                "tool `{name}` parameter schema exceeds {MAX_PARAMETERS_BYTES} bytes"
            )));
        }
    }

    Ok(FunctionDeclaration {
        name: name.to_string(),
        description: description.to_string(),
        parameters,
    })
}

fn bundle(declarations: Vec<FunctionDeclaration>) -> Result<Vec<Tool>, GatewayError> {
    if declarations.len() > MAX_TOOLS {
        return Err(GatewayError::ToolSchemaInvalid(format!(
            "too many tools: {} (limit {MAX_TOOLS})",
            declarations.len()
        )));
    }
    if declarations.is_empty() {
        return Ok(Vec::new());
    }
    Ok(vec![Tool {
        function_declarations: declarations,
    }])
}

/// Removes disallowed keys at every level of the schema.
fn sanitize_schema(value: &mut Value) {
    match value {
        Value::Object(map) => {
            for key in STRIPPED_KEYS {
                map.remove(key);
            }
            for nested in map.values_mut() {
                sanitize_schema(nested);
            }
        }
        Value::Array(items) => {
            for item in items {
                sanitize_schema(item);
            }
        }
        _ => {}
    }
}
