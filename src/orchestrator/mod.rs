//! Context orchestrator: the background router.
//!
//! One long-lived task per browser session. It receives every cross-context
//! request, owns the per-tab toggle state and hands the slow work (capture,
//! analysis, window handoff) to spawned tasks that answer the request when
//! they finish. The router itself never awaits I/O, so requests from
//! different tabs never wait on each other.
//!
//!   - toggle.rs - toggle bookkeeping and overlay-readiness backoff

mod toggle;

pub use toggle::{deliver_with_backoff, RetryPolicy, ToggleBook, ToggleError};

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::browser::{OverlayAck, TabDirectory, TabId};
use crate::capture::{capture_and_crop, CaptureConfig, CaptureSource, EncodedImage};
use crate::channel::{Envelope, Replier, Reply, Request, RuntimeChannel};
use crate::error::WorkflowError;
use crate::geometry::SelectionRect;
use crate::handoff::{actions, track_quietly, HandoffRecord, LocalStore};
use crate::llm::AnalysisClient;

const REQUEST_BUFFER: usize = 64;

/// Opens the conversation window for a stored handoff.
pub trait WindowLauncher: Send + Sync {
    fn open_conversation_window(&self, handoff_id: &str) -> Result<(), String>;
}

/// Hands the id to whatever plays the window context.
impl WindowLauncher for mpsc::UnboundedSender<String> {
    fn open_conversation_window(&self, handoff_id: &str) -> Result<(), String> {
        self.send(handoff_id.to_string())
            .map_err(|_| "conversation window context is not running".to_string())
    }
}

pub struct Orchestrator {
    tabs: Arc<TabDirectory>,
    source: Arc<dyn CaptureSource>,
    analysis: Arc<AnalysisClient>,
    store: Arc<LocalStore>,
    launcher: Arc<dyn WindowLauncher>,
    capture: CaptureConfig,
    retry: RetryPolicy,
}

impl Orchestrator {
    /// Frames are grabbed from `tabs` unless another source is set.
    pub fn new(
        tabs: Arc<TabDirectory>,
        analysis: Arc<AnalysisClient>,
        store: Arc<LocalStore>,
        launcher: Arc<dyn WindowLauncher>,
    ) -> Self {
        Self {
            source: tabs.clone(),
            tabs,
            analysis,
            store,
            launcher,
            capture: CaptureConfig::default(),
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_capture_source(mut self, source: Arc<dyn CaptureSource>) -> Self {
        self.source = source;
        self
    }

    pub fn with_capture_config(mut self, config: CaptureConfig) -> Self {
        self.capture = config;
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry = policy;
        self
    }

    /// Start the router. Must be called from within a tokio runtime.
    pub fn spawn(self) -> OrchestratorHandle {
        let (channel, requests) = RuntimeChannel::new(REQUEST_BUFFER);
        let cancel = CancellationToken::new();
        let (settled_tx, settled_rx) = mpsc::channel(REQUEST_BUFFER);
        let router = Router {
            services: Arc::new(self),
            toggles: ToggleBook::new(),
            settled_tx,
            cancel: cancel.clone(),
        };
        let join = tokio::spawn(router.run(requests, settled_rx));
        log::info!("[ROUTER] Started");
        OrchestratorHandle {
            channel,
            cancel,
            join,
        }
    }
}

/// Owner's handle on a running router.
pub struct OrchestratorHandle {
    channel: RuntimeChannel,
    cancel: CancellationToken,
    join: JoinHandle<()>,
}

impl OrchestratorHandle {
    /// The channel other contexts use to reach the router.
    pub fn channel(&self) -> &RuntimeChannel {
        &self.channel
    }

    /// Stop routing and cancel pending toggle deliveries.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        if let Err(e) = self.join.await {
            log::error!("[ROUTER] Router task failed: {}", e);
        }
    }
}

/// Outcome of one toggle delivery, reported back to the router.
struct Settled {
    tab_id: TabId,
    requested: bool,
    outcome: Result<OverlayAck, ToggleError>,
    reply: Replier,
}

impl Settled {
    /// The router is gone: answer directly, nothing can be committed anymore.
    fn abandon(self) {
        let error = match self.outcome {
            Err(e) => e.into(),
            Ok(_) => WorkflowError::channel("background context stopped"),
        };
        self.reply.send(Err(error));
    }
}

struct Router {
    services: Arc<Orchestrator>,
    toggles: ToggleBook<Replier>,
    settled_tx: mpsc::Sender<Settled>,
    cancel: CancellationToken,
}

impl Router {
    async fn run(
        mut self,
        mut requests: mpsc::Receiver<Envelope>,
        mut settled: mpsc::Receiver<Settled>,
    ) {
        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                Some(done) = settled.recv() => self.settle(done),
                envelope = requests.recv() => match envelope {
                    Some(envelope) => self.route(envelope),
                    None => break,
                },
            }
        }

        // Deliveries still in flight answer their requesters themselves once
        // the channel is closed; drain the ones that already reported.
        settled.close();
        while let Ok(done) = settled.try_recv() {
            done.abandon();
        }
        log::info!("[ROUTER] Stopped");
    }

    fn route(&mut self, envelope: Envelope) {
        let Envelope {
            sender_tab,
            request,
            reply,
        } = envelope;
        log::debug!(
            "[ROUTER] {} from tab {:?}",
            request.action(),
            sender_tab
        );

        match request {
            Request::ToggleCaptureMode { tab_id } => {
                // Explicit id, then the sending page, then the focused tab
                // (keyboard shortcut path).
                let target = tab_id
                    .or(sender_tab)
                    .or_else(|| self.services.tabs.active_tab());
                match target {
                    Some(tab_id) if self.services.tabs.contains(tab_id) => {
                        if let Some(reply) = self.toggles.enqueue(tab_id, reply) {
                            self.start_toggle(tab_id, reply);
                        } else {
                            log::debug!("[TOGGLE] Tab {} toggle queued", tab_id);
                        }
                    }
                    Some(tab_id) => {
                        self.toggles.forget(tab_id);
                        reply.send(Err(WorkflowError::NoTab {
                            tab_id: Some(tab_id),
                        }));
                    }
                    None => reply.send(Err(WorkflowError::NoTab { tab_id: None })),
                }
            }
            Request::CaptureScreenshot { tab_id, selection } => match tab_id.or(sender_tab) {
                Some(tab_id) => {
                    tokio::spawn(capture(self.services.clone(), tab_id, selection, reply));
                }
                None => reply.send(Err(WorkflowError::NoTab { tab_id: None })),
            },
            Request::AnalyzeImage { image, prompt } => {
                tokio::spawn(analyze(self.services.clone(), image, prompt, reply));
            }
            Request::OpenChatWindow { image, analysis } => {
                tokio::spawn(open_window(self.services.clone(), image, analysis, reply));
            }
            Request::CaptureModeEnded { revision } => match sender_tab {
                Some(tab_id) => {
                    if self.toggles.commit(tab_id, false, revision) {
                        log::info!("[TOGGLE] Tab {} overlay closed itself", tab_id);
                    } else {
                        log::debug!(
                            "[TOGGLE] Tab {} stale close report (revision {})",
                            tab_id,
                            revision
                        );
                    }
                    reply.send(Ok(Reply::CaptureModeSynced {
                        tab_id,
                        active: self.toggles.state(tab_id),
                    }));
                }
                None => reply.send(Err(WorkflowError::NoTab { tab_id: None })),
            },
        }
    }

    fn start_toggle(&self, tab_id: TabId, reply: Replier) {
        let requested = self.toggles.flipped(tab_id);
        let services = self.services.clone();
        let settled_tx = self.settled_tx.clone();
        let cancel = self.cancel.child_token();

        tokio::spawn(async move {
            let outcome = deliver_with_backoff(
                &services.tabs,
                tab_id,
                requested,
                services.retry,
                &cancel,
            )
            .await;
            let settled = Settled {
                tab_id,
                requested,
                outcome,
                reply,
            };
            if let Err(mpsc::error::SendError(settled)) = settled_tx.send(settled).await {
                settled.abandon();
            }
        });
    }

    fn settle(&mut self, done: Settled) {
        let Settled {
            tab_id,
            requested,
            outcome,
            reply,
        } = done;

        match outcome {
            Ok(ack) => {
                // The overlay is the authority: it may refuse to arm while a
                // capture is still running.
                self.toggles.commit(tab_id, ack.active, ack.revision);
                if ack.active != requested {
                    log::info!(
                        "[TOGGLE] Tab {} overlay reports {} after request {}",
                        tab_id,
                        ack.active,
                        requested
                    );
                }
                log::info!("[TOGGLE] Tab {} capture mode {}", tab_id, ack.active);
                reply.send(Ok(Reply::Toggled {
                    tab_id,
                    active: ack.active,
                }));
            }
            Err(e) => {
                log::warn!("[TOGGLE] Tab {}: {}", tab_id, e);
                if matches!(e, ToggleError::NoTab(_)) {
                    self.toggles.forget(tab_id);
                }
                reply.send(Err(e.into()));
            }
        }

        if let Some(next) = self.toggles.advance(tab_id) {
            self.start_toggle(tab_id, next);
        }
    }
}

async fn capture(
    services: Arc<Orchestrator>,
    tab_id: TabId,
    selection: SelectionRect,
    reply: Replier,
) {
    let result = capture_and_crop(services.source.clone(), tab_id, selection, services.capture)
        .await
        .map_err(WorkflowError::from);
    match result {
        Ok(image) => {
            track_quietly(&services.store, actions::SCREENSHOT_CAPTURED);
            reply.send(Ok(Reply::Captured { image }));
        }
        Err(e) => {
            log::error!("[CAPTURE] Tab {}: {}", tab_id, e);
            reply.send(Err(e));
        }
    }
}

async fn analyze(services: Arc<Orchestrator>, image: EncodedImage, prompt: String, reply: Replier) {
    match services.analysis.analyze(&image, &prompt).await {
        Ok(result) => {
            track_quietly(&services.store, actions::AI_ANALYSIS_SUCCESS);
            reply.send(Ok(Reply::Analyzed { result }));
        }
        Err(e) => {
            log::error!("[LLM] Analysis failed: {}", e);
            reply.send(Err(e.into()));
        }
    }
}

/// Persist the handoff, then open the window. A window that fails to open
/// is logged and the request still succeeds; the handoff stays stored under
/// its id so a window opened for it later can still take it.
async fn open_window(
    services: Arc<Orchestrator>,
    image: EncodedImage,
    analysis: String,
    reply: Replier,
) {
    let record = HandoffRecord::new(&image, analysis);
    if let Err(e) = services.store.put_handoff(&record) {
        log::error!("[HANDOFF] {}", e);
        reply.send(Err(e.into()));
        return;
    }
    if let Err(e) = services.launcher.open_conversation_window(&record.id) {
        log::error!("[HANDOFF] Failed to open conversation window: {}", e);
    }
    reply.send(Ok(Reply::WindowOpened {
        handoff_id: record.id,
    }));
}
