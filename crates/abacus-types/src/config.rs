use serde::{Deserialize, Serialize};

use crate::sandbox::SandboxOptions;

/// Per-session settings, validated by the host before the session starts
/// and immutable while a turn is in flight.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AiChatConfig {
    /// Base URL of an OpenAI-compatible chat completion endpoint, including
    /// any API version path segment the provider requires.
    pub endpoint: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    pub model: String,
    #[serde(default = "default_context_window_tokens")]
    pub context_window_tokens: u32,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_turn_timeout_ms")]
    pub turn_timeout_ms: u64,
    #[serde(default = "default_max_rounds")]
    pub max_rounds: u32,
    /// Cumulative wall-clock cap across all of a turn's executions.
    #[serde(default = "default_sandbox_budget_ms")]
    pub sandbox_budget_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub sandbox: SandboxOptions,
}

fn default_context_window_tokens() -> u32 {
    32_768
}

fn default_max_retries() -> u32 {
    3
}

fn default_turn_timeout_ms() -> u64 {
    300_000
}

fn default_max_rounds() -> u32 {
    10
}

fn default_sandbox_budget_ms() -> u64 {
    120_000
}

impl AiChatConfig {
    pub fn new(endpoint: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            api_key: None,
            model: model.into(),
            context_window_tokens: default_context_window_tokens(),
            max_retries: default_max_retries(),
            turn_timeout_ms: default_turn_timeout_ms(),
            max_rounds: default_max_rounds(),
            sandbox_budget_ms: default_sandbox_budget_ms(),
            temperature: None,
            sandbox: SandboxOptions::default(),
        }
    }
}
