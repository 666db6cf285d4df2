//! Cross-context message channel.
//!
//! The page, background and window contexts share no memory. They talk by
//! sending tagged requests (`action` discriminator) to the background
//! router and awaiting exactly one typed reply each.
//!
//! A handler that needs to do async work moves the [`Replier`] into the task
//! doing that work and answers when it finishes. The requester keeps waiting
//! until then; it never sees an empty early reply. If a handler drops the
//! replier without answering, the requester gets a `Channel` error.

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};

use crate::browser::TabId;
use crate::capture::EncodedImage;
use crate::error::WorkflowError;
use crate::geometry::SelectionRect;
use crate::llm::AnalysisResult;

/// Requests understood by the background router.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum Request {
    /// Flip selection mode for a tab. Without an explicit id the sender's
    /// tab is used, then the active tab.
    ToggleCaptureMode {
        #[serde(default)]
        tab_id: Option<TabId>,
    },
    /// Capture the selected region of a tab (the sender's tab by default).
    CaptureScreenshot {
        #[serde(default)]
        tab_id: Option<TabId>,
        selection: SelectionRect,
    },
    AnalyzeImage { image: EncodedImage, prompt: String },
    /// Hand one image + analysis pair to a new conversation window.
    OpenChatWindow { image: EncodedImage, analysis: String },
    /// The sender's overlay closed itself (Escape or a finished drag).
    /// `revision` orders this against toggle acks.
    CaptureModeEnded { revision: u64 },
}

impl Request {
    pub fn action(&self) -> &'static str {
        match self {
            Request::ToggleCaptureMode { .. } => "toggleCaptureMode",
            Request::CaptureScreenshot { .. } => "captureScreenshot",
            Request::AnalyzeImage { .. } => "analyzeImage",
            Request::OpenChatWindow { .. } => "openChatWindow",
            Request::CaptureModeEnded { .. } => "captureModeEnded",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "reply", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum Reply {
    Toggled { tab_id: TabId, active: bool },
    Captured { image: EncodedImage },
    Analyzed { result: AnalysisResult },
    WindowOpened { handoff_id: String },
    CaptureModeSynced { tab_id: TabId, active: bool },
}

pub type Response = Result<Reply, WorkflowError>;

/// Answers one request. Consumed on use.
#[derive(Debug)]
pub struct Replier(oneshot::Sender<Response>);

impl Replier {
    pub fn send(self, response: Response) {
        if self.0.send(response).is_err() {
            log::debug!("[ROUTER] Requester went away before the reply arrived");
        }
    }
}

/// One request in flight, with the identity of the page that sent it.
#[derive(Debug)]
pub struct Envelope {
    pub sender_tab: Option<TabId>,
    pub request: Request,
    pub reply: Replier,
}

/// Handle for sending requests to the background router. Cheap to clone;
/// every context gets its own copy.
#[derive(Debug, Clone)]
pub struct RuntimeChannel {
    tx: mpsc::Sender<Envelope>,
    sender_tab: Option<TabId>,
}

impl RuntimeChannel {
    pub fn new(buffer: usize) -> (Self, mpsc::Receiver<Envelope>) {
        let (tx, rx) = mpsc::channel(buffer);
        (
            Self {
                tx,
                sender_tab: None,
            },
            rx,
        )
    }

    /// A copy whose requests are stamped as coming from `tab_id`'s page.
    pub fn for_tab(&self, tab_id: TabId) -> Self {
        Self {
            tx: self.tx.clone(),
            sender_tab: Some(tab_id),
        }
    }

    pub fn sender_tab(&self) -> Option<TabId> {
        self.sender_tab
    }

    pub async fn send_message(&self, request: Request) -> Response {
        let (reply_tx, reply_rx) = oneshot::channel();
        let envelope = Envelope {
            sender_tab: self.sender_tab,
            request,
            reply: Replier(reply_tx),
        };
        self.tx
            .send(envelope)
            .await
            .map_err(|_| WorkflowError::channel("background context is not running"))?;
        reply_rx
            .await
            .map_err(|_| WorkflowError::channel("request dropped without a response"))?
    }

    pub async fn toggle_capture_mode(&self, tab_id: Option<TabId>) -> Result<bool, WorkflowError> {
        match self
            .send_message(Request::ToggleCaptureMode { tab_id })
            .await?
        {
            Reply::Toggled { active, .. } => Ok(active),
            other => Err(unexpected("toggleCaptureMode", &other)),
        }
    }

    pub async fn capture_screenshot(
        &self,
        selection: SelectionRect,
    ) -> Result<EncodedImage, WorkflowError> {
        match self
            .send_message(Request::CaptureScreenshot {
                tab_id: None,
                selection,
            })
            .await?
        {
            Reply::Captured { image } => Ok(image),
            other => Err(unexpected("captureScreenshot", &other)),
        }
    }

    pub async fn analyze_image(
        &self,
        image: EncodedImage,
        prompt: &str,
    ) -> Result<AnalysisResult, WorkflowError> {
        match self
            .send_message(Request::AnalyzeImage {
                image,
                prompt: prompt.to_string(),
            })
            .await?
        {
            Reply::Analyzed { result } => Ok(result),
            other => Err(unexpected("analyzeImage", &other)),
        }
    }

    pub async fn open_chat_window(
        &self,
        image: EncodedImage,
        analysis: String,
    ) -> Result<String, WorkflowError> {
        match self
            .send_message(Request::OpenChatWindow { image, analysis })
            .await?
        {
            Reply::WindowOpened { handoff_id } => Ok(handoff_id),
            other => Err(unexpected("openChatWindow", &other)),
        }
    }

    /// Tell the router this page's overlay closed on its own. Returns the
    /// state the router now holds for the tab.
    pub async fn capture_mode_ended(&self, revision: u64) -> Result<bool, WorkflowError> {
        match self
            .send_message(Request::CaptureModeEnded { revision })
            .await?
        {
            Reply::CaptureModeSynced { active, .. } => Ok(active),
            other => Err(unexpected("captureModeEnded", &other)),
        }
    }
}

fn unexpected(action: &str, reply: &Reply) -> WorkflowError {
    WorkflowError::channel(format!("unexpected reply to {}: {:?}", action, reply))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn requests_are_tagged_by_action() {
        let req = Request::CaptureScreenshot {
            tab_id: Some(3),
            selection: SelectionRect::new(1.0, 2.0, 30.0, 40.0, 2.0),
        };
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["action"], "captureScreenshot");
        assert_eq!(json["action"], req.action());
        assert_eq!(json["tabId"], 3);
        assert_eq!(json["selection"]["devicePixelRatio"], 2.0);

        let parsed: Request =
            serde_json::from_str(r#"{"action": "toggleCaptureMode"}"#).unwrap();
        assert_eq!(parsed, Request::ToggleCaptureMode { tab_id: None });
    }

    #[test]
    fn close_report_carries_its_revision() {
        let json = serde_json::to_value(Request::CaptureModeEnded { revision: 42 }).unwrap();
        assert_eq!(json["action"], "captureModeEnded");
        assert_eq!(json["revision"], 42);

        let reply: Reply =
            serde_json::from_str(r#"{"reply": "captureModeSynced", "tabId": 2, "active": false}"#)
                .unwrap();
        assert_eq!(
            reply,
            Reply::CaptureModeSynced {
                tab_id: 2,
                active: false
            }
        );
    }

    #[tokio::test]
    async fn deferred_reply_reaches_the_requester() {
        let (channel, mut rx) = RuntimeChannel::new(4);
        let page = channel.for_tab(5);

        let router = tokio::spawn(async move {
            let envelope = rx.recv().await.unwrap();
            assert_eq!(envelope.sender_tab, Some(5));
            // Answer later, from another task.
            tokio::spawn(async move {
                tokio::task::yield_now().await;
                envelope.reply.send(Ok(Reply::Toggled {
                    tab_id: 5,
                    active: true,
                }));
            });
        });

        assert_eq!(page.toggle_capture_mode(None).await, Ok(true));
        router.await.unwrap();
    }

    #[tokio::test]
    async fn dropped_replier_is_a_channel_error() {
        let (channel, mut rx) = RuntimeChannel::new(1);
        tokio::spawn(async move {
            let envelope = rx.recv().await.unwrap();
            drop(envelope);
        });
        let err = channel.toggle_capture_mode(Some(1)).await.unwrap_err();
        assert!(matches!(err, WorkflowError::Channel { .. }));
    }

    #[tokio::test]
    async fn closed_router_is_a_channel_error() {
        let (channel, rx) = RuntimeChannel::new(1);
        drop(rx);
        let err = channel.toggle_capture_mode(Some(1)).await.unwrap_err();
        assert!(matches!(err, WorkflowError::Channel { .. }));
    }
}
