//! Generation-config derivation and model-name mapping.

use crate::config::GenerationDefaults;
use castor_schema::upstream::{GenerationConfig, ThinkingConfig};

/// Internal sentinel tokens the upstream must never echo back.
pub const STOP_SENTINELS: [&str; 5] = [
    "<|user|>",
    "<|bot|>",
    "<|context_request|>",
    "<|endoftext|>",
    "<|assistant|>",
];

pub const THINKING_BUDGET: u32 = 1024;

/// Models that run in thinking mode without the `-thinking` suffix rule.
const THINKING_MODELS: [&str; 1] = ["gemini-2.5-flash-thinking"];

/// The one model whose wire name keeps its `-thinking` suffix.
const KEEP_SUFFIX_MODELS: [&str; 1] = ["gemini-2.5-flash-thinking"];

/// Caller-supplied sampling knobs, shared by both client dialects.
#[derive(Debug, Clone, Default)]
pub struct GenerationParams {
    pub temperature: Option<f64>,
    pub top_p: Option<f64>,
    pub top_k: Option<u32>,
    pub max_tokens: Option<u32>,
}

pub fn is_thinking_model(model: &str) -> bool {
    model.ends_with("-thinking") || THINKING_MODELS.contains(&model)
}

fn is_claude_family(model: &str) -> bool {
    model.starts_with("claude")
}

/// The model name actually sent upstream.
pub fn wire_model_name(model: &str) -> String {
    if KEEP_SUFFIX_MODELS.contains(&model) {
        return model.to_string();
    }
    model
        .strip_suffix("-thinking")
        .unwrap_or(model)
        .to_string()
}

pub fn build_generation_config(
    params: &GenerationParams,
    model: &str,
    defaults: &GenerationDefaults,
) -> GenerationConfig {
    let thinking = is_thinking_model(model);

    let top_p = if thinking && is_claude_family(model) {
        // Claude thinking requests reject topP.
        None
    } else {
        Some(params.top_p.unwrap_or(defaults.top_p))
    };

    GenerationConfig {
        temperature: Some(params.temperature.unwrap_or(defaults.temperature)),
        top_p,
        top_k: Some(params.top_k.unwrap_or(defaults.top_k)),
        max_output_tokens: Some(params.max_tokens.unwrap_or(defaults.max_tokens)),
        candidate_count: Some(1),
        stop_sequences: STOP_SENTINELS.iter().map(|s| s.to_string()).collect(),
        thinking_config: thinking.then_some(ThinkingConfig {
            include_thoughts: true,
            thinking_budget: THINKING_BUDGET,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn defaults() -> GenerationDefaults {
        GenerationDefaults {
            temperature: 1.0,
            top_p: 0.95,
            top_k: 64,
            max_tokens: 4096,
        }
    }

    #[test]
    fn defaults_fill_missing_params() {
        let config = build_generation_config(&GenerationParams::default(), "gemini-2.5-pro", &defaults());
        assert_eq!(config.temperature, Some(1.0));
        assert_eq!(config.top_p, Some(0.95));
        assert_eq!(config.top_k, Some(64));
        assert_eq!(config.max_output_tokens, Some(4096));
        assert_eq!(config.candidate_count, Some(1));
        assert_eq!(config.stop_sequences.len(), STOP_SENTINELS.len());
        assert!(config.thinking_config.is_none());
    }

    #[test]
    fn thinking_suffix_enables_thinking_config() {
        let config = build_generation_config(
            &GenerationParams::default(),
            "gemini-2.5-pro-thinking",
            &defaults(),
        );
        assert_eq!(
            config.thinking_config,
            Some(ThinkingConfig {
                include_thoughts: true,
                thinking_budget: THINKING_BUDGET
            })
        );
        assert!(config.top_p.is_some());
    }

    #[test]
    fn claude_thinking_drops_top_p() {
        let config = build_generation_config(
            &GenerationParams::default(),
            "claude-sonnet-4-5-thinking",
            &defaults(),
        );
        assert!(config.thinking_config.is_some());
        assert!(config.top_p.is_none());
    }

    #[test]
    fn wire_name_strips_thinking_suffix_except_whitelist() {
        assert_eq!(wire_model_name("claude-sonnet-4-5-thinking"), "claude-sonnet-4-5");
        assert_eq!(wire_model_name("gemini-2.5-pro"), "gemini-2.5-pro");
        assert_eq!(
            wire_model_name("gemini-2.5-flash-thinking"),
            "gemini-2.5-flash-thinking"
        );
    }
}
