//! Remote analysis client: one HTTP call per analysis.
//!
//! Order of checks matters: the credential is checked first, then the local
//! rate limit, and only then is the network touched. Nothing is retried here;
//! a caller that wants to try again simply calls `analyze` again.

use std::sync::{Arc, Mutex, PoisonError};

use super::provider::{ProviderConfig, DEFAULT_PROMPT};
use super::rate_limit::{RateLimited, RateLimiter};
use super::types::{AnalysisResult, ChatRequest, ChatResponse};
use crate::capture::EncodedImage;
use crate::error::WorkflowError;

/// Where the API key comes from. Read on every call so a key saved
/// mid-session is picked up without a restart.
pub trait CredentialSource: Send + Sync {
    fn api_key(&self) -> Option<String>;
}

impl CredentialSource for Option<String> {
    fn api_key(&self) -> Option<String> {
        self.clone()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AnalysisError {
    #[error("Groq API key not configured")]
    MissingCredential,
    #[error(transparent)]
    RateLimited(#[from] RateLimited),
    #[error("network error: {0}")]
    Network(String),
    #[error("API request failed: {status} - {body}")]
    Remote { status: u16, body: String },
}

impl From<AnalysisError> for WorkflowError {
    fn from(err: AnalysisError) -> Self {
        match err {
            AnalysisError::MissingCredential => WorkflowError::MissingCredential,
            AnalysisError::RateLimited(limit) => WorkflowError::RateLimit {
                max_requests: limit.max_requests,
                retry_after_secs: limit.retry_after.as_secs(),
            },
            AnalysisError::Network(reason) => WorkflowError::Network { reason },
            AnalysisError::Remote { status, body } => WorkflowError::Remote { status, body },
        }
    }
}

pub struct AnalysisClient {
    http: reqwest::Client,
    config: ProviderConfig,
    credentials: Arc<dyn CredentialSource>,
    limiter: Mutex<RateLimiter>,
}

impl AnalysisClient {
    pub fn new(config: ProviderConfig, credentials: Arc<dyn CredentialSource>) -> Self {
        let limiter = RateLimiter::new(config.rate_limit_max_requests, config.rate_limit_window);
        Self {
            http: reqwest::Client::new(),
            config,
            credentials,
            limiter: Mutex::new(limiter),
        }
    }

    pub fn config(&self) -> &ProviderConfig {
        &self.config
    }

    /// Ask the vision model about `image`.
    pub async fn analyze(
        &self,
        image: &EncodedImage,
        prompt: &str,
    ) -> Result<AnalysisResult, AnalysisError> {
        let api_key = self
            .credentials
            .api_key()
            .filter(|k| !k.trim().is_empty())
            .ok_or(AnalysisError::MissingCredential)?;

        self.limiter
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .try_acquire()
            .inspect_err(|e| log::warn!("[LLM] {}", e))?;

        let prompt = if prompt.trim().is_empty() {
            DEFAULT_PROMPT
        } else {
            prompt
        };

        log::info!("[LLM] Model: {}", self.config.model);
        log::info!(
            "[LLM] Image: {} {}x{} ({} bytes), prompt: {} chars",
            image.format.mime_type(),
            image.width,
            image.height,
            image.byte_size,
            prompt.len()
        );

        let start = std::time::Instant::now();
        let body = ChatRequest::vision(
            &self.config.model,
            prompt,
            &image.data_url,
            self.config.max_tokens,
            self.config.temperature,
        );

        let response = self
            .http
            .post(&self.config.endpoint)
            .bearer_auth(&api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                log::error!("[LLM] HTTP request failed: {}", e);
                AnalysisError::Network(e.to_string())
            })?;

        let status = response.status();
        log::info!(
            "[LLM] API response status: {} after {}ms",
            status,
            start.elapsed().as_millis()
        );

        let text = response.text().await.map_err(|e| {
            log::error!("[LLM] Failed to read response body: {}", e);
            AnalysisError::Network(e.to_string())
        })?;

        if !status.is_success() {
            log::error!("[LLM] API returned {}: {}", status, text);
            return Err(AnalysisError::Remote {
                status: status.as_u16(),
                body: text,
            });
        }

        let envelope: ChatResponse = serde_json::from_str(&text).map_err(|e| {
            log::error!("[LLM] Unreadable response envelope: {}", e);
            AnalysisError::Remote {
                status: status.as_u16(),
                body: format!("unreadable response: {}", e),
            }
        })?;

        let result = envelope.into_result().ok_or_else(|| AnalysisError::Remote {
            status: status.as_u16(),
            body: "response contained no choices".to_string(),
        })?;

        if let Some(usage) = &result.usage {
            log::info!(
                "[LLM] Tokens: {} prompt + {} completion = {}",
                usage.prompt_tokens,
                usage.completion_tokens,
                usage.total_tokens
            );
        }
        log::info!(
            "[LLM] Analysis complete: {} chars in {}ms",
            result.analysis.len(),
            start.elapsed().as_millis()
        );
        Ok(result)
    }
}
