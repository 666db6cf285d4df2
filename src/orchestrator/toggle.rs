//! Toggle delivery: per-tab ordering and overlay-readiness backoff.
//!
//! A toggle is committed only after the overlay has acknowledged it, and what
//! gets committed is the state the overlay reports, so a failed delivery
//! leaves the tab's state untouched. Toggles for the same tab run one at a
//! time; later ones wait in a FIFO and compute their target state from the
//! committed state when their turn comes.
//!
//! Every commit carries the overlay revision it was observed at. Overlays
//! also close on their own and report it; a report older than what is
//! already committed is dropped.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::browser::{NoSuchTab, OverlayAck, TabDirectory, TabId};
use crate::error::WorkflowError;

/// Bounded fixed-interval retry while a freshly loaded page sets up its overlay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub interval: Duration,
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(500),
            max_attempts: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ToggleError {
    #[error("no tab with id {0}")]
    NoTab(TabId),
    #[error("overlay in tab {tab_id} not ready after {attempts} attempts")]
    Unavailable { tab_id: TabId, attempts: u32 },
    #[error("delivery to tab {tab_id} cancelled after {attempts} attempts")]
    Cancelled { tab_id: TabId, attempts: u32 },
}

impl From<ToggleError> for WorkflowError {
    fn from(err: ToggleError) -> Self {
        match err {
            ToggleError::NoTab(tab_id) => WorkflowError::NoTab {
                tab_id: Some(tab_id),
            },
            ToggleError::Unavailable { tab_id, attempts }
            | ToggleError::Cancelled { tab_id, attempts } => {
                WorkflowError::OverlayUnavailable { tab_id, attempts }
            }
        }
    }
}

impl From<NoSuchTab> for ToggleError {
    fn from(NoSuchTab(tab_id): NoSuchTab) -> Self {
        ToggleError::NoTab(tab_id)
    }
}

/// Send `active` to the tab's overlay, waiting for it to come up if needed.
///
/// Returns the overlay's ack: its state after applying the command.
pub async fn deliver_with_backoff(
    tabs: &TabDirectory,
    tab_id: TabId,
    active: bool,
    policy: RetryPolicy,
    cancel: &CancellationToken,
) -> Result<OverlayAck, ToggleError> {
    let max_attempts = policy.max_attempts.max(1);

    for attempt in 1..=max_attempts {
        if let Some(port) = tabs.overlay_port(tab_id)? {
            match port.set_active(active).await {
                Ok(ack) => {
                    if attempt > 1 {
                        log::info!(
                            "[TOGGLE] Tab {} overlay ready after {} attempts",
                            tab_id,
                            attempt
                        );
                    }
                    return Ok(ack);
                }
                Err(e) => log::debug!("[TOGGLE] Tab {}: {}", tab_id, e),
            }
        }

        if attempt == max_attempts {
            break;
        }
        log::debug!(
            "[TOGGLE] Tab {} overlay not ready (attempt {}/{}), retrying in {}ms",
            tab_id,
            attempt,
            max_attempts,
            policy.interval.as_millis()
        );
        tokio::select! {
            _ = cancel.cancelled() => {
                return Err(ToggleError::Cancelled { tab_id, attempts: attempt });
            }
            _ = tokio::time::sleep(policy.interval) => {}
        }
    }

    log::warn!(
        "[TOGGLE] Tab {} overlay unavailable after {} attempts",
        tab_id,
        max_attempts
    );
    Err(ToggleError::Unavailable {
        tab_id,
        attempts: max_attempts,
    })
}

/// Committed toggle state plus the toggles waiting behind an in-flight one.
///
/// Generic over the waiter so the bookkeeping is independent of how replies
/// are delivered.
#[derive(Debug)]
pub struct ToggleBook<W> {
    states: HashMap<TabId, (bool, u64)>,
    waiting: HashMap<TabId, VecDeque<W>>,
}

impl<W> Default for ToggleBook<W> {
    fn default() -> Self {
        Self {
            states: HashMap::new(),
            waiting: HashMap::new(),
        }
    }
}

impl<W> ToggleBook<W> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self, tab_id: TabId) -> bool {
        self.states
            .get(&tab_id)
            .map(|&(active, _)| active)
            .unwrap_or(false)
    }

    /// The state a toggle started now would request.
    pub fn flipped(&self, tab_id: TabId) -> bool {
        !self.state(tab_id)
    }

    /// Register a toggle. Returns the waiter back if it may start right away;
    /// otherwise it is queued behind the in-flight one.
    pub fn enqueue(&mut self, tab_id: TabId, waiter: W) -> Option<W> {
        match self.waiting.get_mut(&tab_id) {
            Some(queue) => {
                queue.push_back(waiter);
                None
            }
            None => {
                self.waiting.insert(tab_id, VecDeque::new());
                Some(waiter)
            }
        }
    }

    /// Record `active` as observed at overlay `revision`. Returns false, and
    /// changes nothing, when a newer observation is already committed.
    pub fn commit(&mut self, tab_id: TabId, active: bool, revision: u64) -> bool {
        match self.states.get(&tab_id) {
            Some(&(_, seen)) if seen > revision => false,
            _ => {
                self.states.insert(tab_id, (active, revision));
                true
            }
        }
    }

    /// Finish the in-flight toggle; returns the next waiter to start, if any.
    pub fn advance(&mut self, tab_id: TabId) -> Option<W> {
        let next = self.waiting.get_mut(&tab_id).and_then(VecDeque::pop_front);
        if next.is_none() {
            self.waiting.remove(&tab_id);
        }
        next
    }

    pub fn forget(&mut self, tab_id: TabId) {
        self.states.remove(&tab_id);
    }
}
