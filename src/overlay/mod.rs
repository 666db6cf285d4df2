//! Selection overlay: the drag-to-select gesture inside a page.
//!
//! `Inactive → Armed → Dragging → Inactive`. The state machine here is pure:
//! it turns pointer and keyboard events into at most one [`SelectionRect`]
//! per gesture and describes what the page should show. The page runtime
//! (page.rs) feeds it events and carries selections to the background.
//!
//! The overlay never sees the captured image.

mod page;

pub use page::{OverlayHandle, PageEvent, PageScope, WORKFLOW_PROMPT};

use std::sync::atomic::{AtomicU64, Ordering};

use tokio::time::{Duration, Instant};

use crate::browser::OverlayAck;
use crate::geometry::{LogicalPoint, LogicalRect, SelectionRect};

/// Shown while the overlay is armed.
pub const INSTRUCTIONS: &str =
    "Click and drag to select an area for AI analysis. Press ESC to cancel.";

/// How long an error banner stays up.
pub const ERROR_BANNER_TTL: Duration = Duration::from_secs(3);

/// Shared by every overlay in the process, so a page loaded after a
/// navigation never reuses an older page's numbers.
static NEXT_REVISION: AtomicU64 = AtomicU64::new(1);

fn next_revision() -> u64 {
    NEXT_REVISION.fetch_add(1, Ordering::Relaxed)
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SelectionState {
    Inactive,
    Armed,
    Dragging {
        origin: LogicalPoint,
        current: LogicalPoint,
    },
}

/// Result of a pointer-up.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum GestureOutcome {
    /// No drag was in progress.
    Ignored,
    /// Drag smaller than the threshold on some axis; treated as a click.
    Discarded,
    Selected(SelectionRect),
}

/// The full-viewport capture surface.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Surface {
    Hidden,
    /// Crosshair surface plus instruction banner.
    Armed,
    /// Armed surface with the live selection rectangle.
    Selecting(LogicalRect),
}

/// Everything the page shows for the overlay at one instant.
#[derive(Debug, Clone, PartialEq)]
pub struct OverlayView {
    pub surface: Surface,
    /// Instruction banner, up while the surface is.
    pub instructions: Option<&'static str>,
    /// Loading indicator while a capture workflow is in flight.
    pub loading: bool,
    /// Transient, auto-dismissing error banner.
    pub error_banner: Option<String>,
}

impl OverlayView {
    pub fn hidden() -> Self {
        Self {
            surface: Surface::Hidden,
            instructions: None,
            loading: false,
            error_banner: None,
        }
    }
}

#[derive(Debug, Clone)]
struct Banner {
    message: String,
    expires_at: Instant,
}

#[derive(Debug)]
pub struct SelectionOverlay {
    state: SelectionState,
    device_pixel_ratio: f64,
    workflow_pending: bool,
    banner: Option<Banner>,
    revision: u64,
}

impl SelectionOverlay {
    pub fn new(device_pixel_ratio: f64) -> Self {
        Self {
            state: SelectionState::Inactive,
            device_pixel_ratio,
            workflow_pending: false,
            banner: None,
            revision: next_revision(),
        }
    }

    pub fn state(&self) -> SelectionState {
        self.state
    }

    pub fn is_active(&self) -> bool {
        !matches!(self.state, SelectionState::Inactive)
    }

    pub fn workflow_pending(&self) -> bool {
        self.workflow_pending
    }

    /// Bumped on every open and close.
    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn ack(&self) -> OverlayAck {
        OverlayAck {
            active: self.is_active(),
            revision: self.revision,
        }
    }

    /// Page zoom changed; applies to selections finished from now on.
    pub fn set_device_pixel_ratio(&mut self, ratio: f64) {
        self.device_pixel_ratio = ratio;
    }

    fn close(&mut self) {
        self.state = SelectionState::Inactive;
        self.revision = next_revision();
    }

    /// Apply an arm/disarm command; returns whether the overlay is active afterwards.
    ///
    /// Arming an armed overlay is a no-op, so repeated commands never stack
    /// surfaces. Arming is refused while a previous capture is still pending.
    pub fn set_active(&mut self, active: bool) -> bool {
        if active {
            match self.state {
                SelectionState::Inactive if self.workflow_pending => {
                    log::info!("[OVERLAY] Capture still in progress, not arming");
                }
                SelectionState::Inactive => {
                    self.state = SelectionState::Armed;
                    self.revision = next_revision();
                    log::info!("[OVERLAY] Armed");
                }
                _ => {}
            }
        } else if self.is_active() {
            self.close();
            log::info!("[OVERLAY] Disarmed");
        }
        self.is_active()
    }

    pub fn pointer_down(&mut self, at: LogicalPoint) {
        if self.state == SelectionState::Armed {
            self.state = SelectionState::Dragging {
                origin: at,
                current: at,
            };
        }
    }

    /// Track the drag; returns the rectangle to draw.
    pub fn pointer_move(&mut self, at: LogicalPoint) -> Option<LogicalRect> {
        match &mut self.state {
            SelectionState::Dragging { origin, current } => {
                *current = at;
                Some(LogicalRect::from_corners(*origin, at))
            }
            _ => None,
        }
    }

    /// End the drag. The overlay closes either way; only a drag of at least
    /// the threshold size on both axes produces a selection.
    pub fn pointer_up(&mut self, at: LogicalPoint) -> GestureOutcome {
        let SelectionState::Dragging { origin, .. } = self.state else {
            return GestureOutcome::Ignored;
        };
        self.close();

        let rect = LogicalRect::from_corners(origin, at);
        if rect.is_below_threshold() {
            log::info!(
                "[OVERLAY] Selection {}x{} below threshold, discarded",
                rect.width,
                rect.height
            );
            return GestureOutcome::Discarded;
        }

        self.workflow_pending = true;
        GestureOutcome::Selected(SelectionRect::from_logical(rect, self.device_pixel_ratio))
    }

    /// Escape: drop the gesture, emit nothing.
    pub fn cancel(&mut self) {
        if self.is_active() {
            self.close();
            log::info!("[OVERLAY] Cancelled");
        }
    }

    /// The dispatched workflow reached a terminal response.
    pub fn finish_workflow(&mut self, error: Option<String>, now: Instant) {
        self.workflow_pending = false;
        if let Some(message) = error {
            self.banner = Some(Banner {
                message,
                expires_at: now + ERROR_BANNER_TTL,
            });
        }
    }

    pub fn banner_deadline(&self) -> Option<Instant> {
        self.banner.as_ref().map(|b| b.expires_at)
    }

    pub fn dismiss_expired_banner(&mut self, now: Instant) {
        if self.banner.as_ref().is_some_and(|b| now >= b.expires_at) {
            self.banner = None;
        }
    }

    pub fn view(&self) -> OverlayView {
        let surface = match self.state {
            SelectionState::Inactive => Surface::Hidden,
            SelectionState::Armed => Surface::Armed,
            SelectionState::Dragging { origin, current } => {
                Surface::Selecting(LogicalRect::from_corners(origin, current))
            }
        };
        OverlayView {
            surface,
            instructions: (surface != Surface::Hidden).then_some(INSTRUCTIONS),
            loading: self.workflow_pending,
            error_banner: self.banner.as_ref().map(|b| b.message.clone()),
        }
    }
}
