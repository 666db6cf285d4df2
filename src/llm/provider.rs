//! Inference provider settings: endpoint, model and sampling parameters.
//!
//! Only one provider is wired up: Groq's OpenAI-compatible chat-completions
//! endpoint serving a vision-capable Llama model.

use std::time::Duration;

pub const GROQ_ENDPOINT: &str = "https://api.groq.com/openai/v1/chat/completions";
pub const MODEL: &str = "meta-llama/llama-4-scout-17b-16e-instruct";
pub const MAX_TOKENS: u32 = 1500;
pub const TEMPERATURE: f32 = 0.7;

/// Environment variable that overrides the stored credential.
pub const API_KEY_ENV: &str = "GROQ_API_KEY";

/// Local request budget: 50 requests per hour.
pub const RATE_LIMIT_MAX_REQUESTS: u32 = 50;
pub const RATE_LIMIT_WINDOW: Duration = Duration::from_secs(3600);

/// Prompt used when the caller passes an empty one.
pub const DEFAULT_PROMPT: &str = "Analyze this image and provide insights";

#[derive(Debug, Clone)]
pub struct ProviderConfig {
    pub endpoint: String,
    pub model: String,
    pub max_tokens: u32,
    pub temperature: f32,
    pub rate_limit_max_requests: u32,
    pub rate_limit_window: Duration,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            endpoint: GROQ_ENDPOINT.to_string(),
            model: MODEL.to_string(),
            max_tokens: MAX_TOKENS,
            temperature: TEMPERATURE,
            rate_limit_max_requests: RATE_LIMIT_MAX_REQUESTS,
            rate_limit_window: RATE_LIMIT_WINDOW,
        }
    }
}
