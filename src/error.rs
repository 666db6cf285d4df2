//! Error taxonomy carried across context boundaries.
//!
//! Every request over the runtime channel resolves to
//! `Result<Reply, WorkflowError>`. Component errors (capture, crop, LLM,
//! toggle delivery, storage) convert into this type so the receiving context
//! can present them without knowing which component failed.

use serde::{Deserialize, Serialize};

use crate::browser::TabId;

#[derive(Debug, Clone, PartialEq, thiserror::Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum WorkflowError {
    #[error("No tab found{}", .tab_id.map(|id| format!(" with id {}", id)).unwrap_or_else(|| ": no tab ID provided".to_string()))]
    NoTab { tab_id: Option<TabId> },

    #[error("Selection overlay in tab {tab_id} not ready after {attempts} attempts. Refresh the page and try again.")]
    OverlayUnavailable { tab_id: TabId, attempts: u32 },

    #[error("Failed to capture screenshot: {reason}")]
    Capture { reason: String },

    #[error("Failed to crop screenshot: {reason}")]
    Crop { reason: String },

    #[error("Encoded image is {encoded_bytes} bytes, over the {limit} byte limit")]
    SizeBudget { encoded_bytes: usize, limit: usize },

    #[error("Groq API key not configured")]
    MissingCredential,

    #[error("Rate limit of {max_requests} requests exceeded. Try again in {retry_after_secs}s.")]
    RateLimit {
        max_requests: u32,
        retry_after_secs: u64,
    },

    #[error("Network error: {reason}")]
    Network { reason: String },

    #[error("API request failed: {status} - {body}")]
    Remote { status: u16, body: String },

    #[error("Storage error: {reason}")]
    Storage { reason: String },

    #[error("Message channel error: {reason}")]
    Channel { reason: String },
}

impl WorkflowError {
    pub(crate) fn channel(reason: impl Into<String>) -> Self {
        Self::Channel {
            reason: reason.into(),
        }
    }
}
