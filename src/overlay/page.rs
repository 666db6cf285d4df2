//! Page-context runtime for the selection overlay.
//!
//! A [`PageScope`] lives exactly as long as one page load. Injecting the
//! overlay spawns the page task and registers its command port with the tab
//! directory; injecting again returns the same handle. User input arrives as
//! [`PageEvent`]s, background commands arrive on the port, and the rendered
//! state is published on a `watch` channel.
//!
//! When the overlay closes on its own (escape, a finished drag) the page
//! tells the background before publishing the new view, so the next toggle
//! is computed from the closed state.

use std::sync::OnceLock;

use tokio::sync::{mpsc, watch};
use tokio::time::Instant;

use super::{GestureOutcome, OverlayView, SelectionOverlay};
use crate::browser::{NoSuchTab, OverlayPort, PageCommand, TabDirectory, TabId};
use crate::channel::RuntimeChannel;
use crate::error::WorkflowError;
use crate::geometry::{LogicalPoint, SelectionRect};

/// Prompt used for the first analysis of every selection.
pub const WORKFLOW_PROMPT: &str =
    "Analyze this image and provide detailed insights about what you see.";

const COMMAND_BUFFER: usize = 8;
const EVENT_BUFFER: usize = 64;

/// Raw user input inside the page, in logical viewport coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PageEvent {
    PointerDown(LogicalPoint),
    PointerMove(LogicalPoint),
    PointerUp(LogicalPoint),
    Escape,
    /// The page's device pixel ratio changed (zoom, moved to another display).
    DevicePixelRatio(f64),
}

/// The page's side of an injected overlay.
#[derive(Debug, Clone)]
pub struct OverlayHandle {
    events: mpsc::Sender<PageEvent>,
    view: watch::Receiver<OverlayView>,
}

impl OverlayHandle {
    /// Feed one input event to the overlay. Returns false once the page is gone.
    pub async fn dispatch(&self, event: PageEvent) -> bool {
        self.events.send(event).await.is_ok()
    }

    pub fn view(&self) -> OverlayView {
        self.view.borrow().clone()
    }

    /// Wait until the published view satisfies `pred`. `None` if the page
    /// task ended first.
    pub async fn wait_for(
        &self,
        mut pred: impl FnMut(&OverlayView) -> bool,
    ) -> Option<OverlayView> {
        let mut rx = self.view.clone();
        let view = rx.wait_for(|v| pred(v)).await.ok()?;
        Some(view.clone())
    }
}

/// Per-page-load scope holding the single overlay of that page.
#[derive(Debug)]
pub struct PageScope {
    tab_id: TabId,
    device_pixel_ratio: f64,
    overlay: OnceLock<OverlayHandle>,
}

impl PageScope {
    pub fn new(tab_id: TabId, device_pixel_ratio: f64) -> Self {
        Self {
            tab_id,
            device_pixel_ratio,
            overlay: OnceLock::new(),
        }
    }

    pub fn tab_id(&self) -> TabId {
        self.tab_id
    }

    pub fn overlay(&self) -> Option<&OverlayHandle> {
        self.overlay.get()
    }

    /// Initialize the overlay for this page load. Later calls are no-ops that
    /// return the existing handle. Must be called from within a tokio runtime.
    pub fn inject_overlay(
        &self,
        tabs: &TabDirectory,
        channel: &RuntimeChannel,
    ) -> Result<&OverlayHandle, NoSuchTab> {
        if let Some(handle) = self.overlay.get() {
            log::debug!("[OVERLAY] Tab {} already initialized", self.tab_id);
            return Ok(handle);
        }
        if !tabs.contains(self.tab_id) {
            return Err(NoSuchTab(self.tab_id));
        }

        Ok(self.overlay.get_or_init(|| {
            let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_BUFFER);
            let (event_tx, event_rx) = mpsc::channel(EVENT_BUFFER);
            let (view_tx, view_rx) = watch::channel(OverlayView::hidden());

            let page = PageTask {
                tab_id: self.tab_id,
                overlay: SelectionOverlay::new(self.device_pixel_ratio),
                commands: cmd_rx,
                events: event_rx,
                channel: channel.for_tab(self.tab_id),
                view: view_tx,
            };
            tokio::spawn(page.run());

            if let Err(e) = tabs.register_overlay(self.tab_id, OverlayPort::new(cmd_tx)) {
                log::warn!("[OVERLAY] Could not register overlay: {}", e);
            }
            log::info!("[OVERLAY] Initialized in tab {}", self.tab_id);

            OverlayHandle {
                events: event_tx,
                view: view_rx,
            }
        }))
    }
}

struct PageTask {
    tab_id: TabId,
    overlay: SelectionOverlay,
    commands: mpsc::Receiver<PageCommand>,
    events: mpsc::Receiver<PageEvent>,
    channel: RuntimeChannel,
    view: watch::Sender<OverlayView>,
}

impl PageTask {
    async fn run(mut self) {
        // Terminal outcome of each dispatched workflow: None on success.
        let (done_tx, mut done_rx) = mpsc::channel::<Option<String>>(1);
        let mut commands_open = true;
        let mut events_open = true;

        loop {
            let banner_deadline = self.overlay.banner_deadline();
            tokio::select! {
                cmd = self.commands.recv(), if commands_open => match cmd {
                    Some(PageCommand::SetActive { active, ack }) => {
                        self.overlay.set_active(active);
                        let _ = ack.send(self.overlay.ack());
                    }
                    None => commands_open = false,
                },
                event = self.events.recv(), if events_open => match event {
                    Some(event) => {
                        let was_active = self.overlay.is_active();
                        let selection = self.handle_event(event);
                        if was_active && !self.overlay.is_active() {
                            self.report_closed().await;
                        }
                        if let Some(selection) = selection {
                            tokio::spawn(dispatch_workflow(
                                self.channel.clone(),
                                selection,
                                done_tx.clone(),
                            ));
                        }
                    }
                    None => events_open = false,
                },
                Some(error) = done_rx.recv() => {
                    if let Some(message) = &error {
                        log::warn!("[OVERLAY] Tab {}: {}", self.tab_id, message);
                    }
                    self.overlay.finish_workflow(error, Instant::now());
                }
                _ = tokio::time::sleep_until(banner_deadline.unwrap_or_else(Instant::now)),
                    if banner_deadline.is_some() =>
                {
                    self.overlay.dismiss_expired_banner(Instant::now());
                }
                else => break,
            }

            self.view.send_replace(self.overlay.view());

            if !commands_open && !events_open && !self.overlay.workflow_pending() {
                break;
            }
        }
        log::debug!("[OVERLAY] Page task for tab {} finished", self.tab_id);
    }

    fn handle_event(&mut self, event: PageEvent) -> Option<SelectionRect> {
        match event {
            PageEvent::PointerDown(at) => self.overlay.pointer_down(at),
            PageEvent::PointerMove(at) => {
                self.overlay.pointer_move(at);
            }
            PageEvent::PointerUp(at) => {
                if let GestureOutcome::Selected(selection) = self.overlay.pointer_up(at) {
                    return Some(selection);
                }
            }
            PageEvent::Escape => self.overlay.cancel(),
            PageEvent::DevicePixelRatio(ratio) => self.overlay.set_device_pixel_ratio(ratio),
        }
        None
    }

    async fn report_closed(&self) {
        let revision = self.overlay.revision();
        if let Err(e) = self.channel.capture_mode_ended(revision).await {
            log::debug!("[OVERLAY] Tab {}: close not reported: {}", self.tab_id, e);
        }
    }
}

async fn dispatch_workflow(
    channel: RuntimeChannel,
    selection: SelectionRect,
    done: mpsc::Sender<Option<String>>,
) {
    let outcome = run_workflow(&channel, selection).await;
    let error = match outcome {
        Ok(handoff_id) => {
            log::info!("[OVERLAY] Result window opened (handoff {})", handoff_id);
            None
        }
        Err(e) => Some(e.to_string()),
    };
    let _ = done.send(error).await;
}

/// capture → analyze → open the conversation window, stopping at the first error.
async fn run_workflow(
    channel: &RuntimeChannel,
    selection: SelectionRect,
) -> Result<String, WorkflowError> {
    let image = channel.capture_screenshot(selection).await?;
    let result = channel.analyze_image(image.clone(), WORKFLOW_PROMPT).await?;
    channel.open_chat_window(image, result.analysis).await
}
