//! Conversation window context.
//!
//! A window opens on one handoff: the captured image and its first analysis.
//! Follow-up questions about the same image go back through the background
//! router's `analyzeImage` action. The session keeps the ordered transcript;
//! drawing it is someone else's job.

use std::sync::Arc;

use serde::Serialize;

use crate::capture::EncodedImage;
use crate::channel::RuntimeChannel;
use crate::error::WorkflowError;
use crate::handoff::{actions, track_quietly, HandoffRecord, LocalStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Turn {
    pub role: Role,
    pub text: String,
}

pub struct ConversationSession {
    channel: RuntimeChannel,
    store: Arc<LocalStore>,
    handoff_id: String,
    image: EncodedImage,
    transcript: Vec<Turn>,
}

impl ConversationSession {
    /// Take the handoff the window was opened for and start a session on it.
    /// `Ok(None)` when there is nothing to show.
    pub fn open(
        channel: RuntimeChannel,
        store: Arc<LocalStore>,
        handoff_id: &str,
    ) -> Result<Option<Self>, WorkflowError> {
        let Some(record) = store.take_handoff(handoff_id)? else {
            log::warn!("[CHAT] No image data found for {}", handoff_id);
            return Ok(None);
        };
        Self::from_record(channel, store, record).map(Some)
    }

    fn from_record(
        channel: RuntimeChannel,
        store: Arc<LocalStore>,
        record: HandoffRecord,
    ) -> Result<Self, WorkflowError> {
        let image = EncodedImage::from_data_url(&record.image_data).map_err(|e| {
            WorkflowError::Storage {
                reason: format!("handoff {} has unusable image data: {}", record.id, e),
            }
        })?;
        log::info!(
            "[CHAT] Opened on {} ({}x{} {})",
            record.id,
            image.width,
            image.height,
            image.format.mime_type()
        );
        Ok(Self {
            channel,
            store,
            handoff_id: record.id,
            image,
            transcript: vec![Turn {
                role: Role::Assistant,
                text: record.analysis,
            }],
        })
    }

    pub fn handoff_id(&self) -> &str {
        &self.handoff_id
    }

    pub fn image(&self) -> &EncodedImage {
        &self.image
    }

    /// The first analysis, shown when the window opens.
    pub fn initial_analysis(&self) -> &str {
        self.transcript
            .first()
            .map(|t| t.text.as_str())
            .unwrap_or_default()
    }

    pub fn transcript(&self) -> &[Turn] {
        &self.transcript
    }

    /// Ask a follow-up about the image. Blank prompts are ignored and return
    /// `Ok(None)`. A failed request leaves the question in the transcript
    /// without an answer, so the user can see what failed and ask again.
    pub async fn ask(&mut self, prompt: &str) -> Result<Option<String>, WorkflowError> {
        let prompt = prompt.trim();
        if prompt.is_empty() {
            return Ok(None);
        }
        self.transcript.push(Turn {
            role: Role::User,
            text: prompt.to_string(),
        });
        track_quietly(&self.store, actions::CHAT_MESSAGE_SENT);

        let result = self
            .channel
            .analyze_image(self.image.clone(), prompt)
            .await
            .inspect_err(|e| log::error!("[CHAT] {}", e))?;
        self.transcript.push(Turn {
            role: Role::Assistant,
            text: result.analysis.clone(),
        });
        Ok(Some(result.analysis))
    }
}
