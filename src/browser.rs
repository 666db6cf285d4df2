//! Tab directory: the host browser's view of open tabs.
//!
//! Tracks each tab's URL, its currently rendered content (what a visible-tab
//! grab would return) and the command port of the overlay injected into the
//! current page load. Navigating a tab drops its overlay port, because the
//! new page has to inject its own overlay.
//!
//! The directory is also the pipeline's capture source.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::{mpsc, oneshot};

use crate::capture::{CaptureError, CaptureSource};

pub type TabId = u32;

/// URL prefixes of browser-internal pages that cannot be captured.
const RESTRICTED_PREFIXES: &[&str] = &[
    "chrome://",
    "edge://",
    "about:",
    "extension://",
    "chrome-extension://",
];

pub fn is_restricted_url(url: &str) -> bool {
    RESTRICTED_PREFIXES.iter().any(|p| url.starts_with(p))
}

/// The overlay's state after it applied a command.
///
/// `revision` grows every time an overlay opens or closes, in any page, so
/// the background can tell which of two reports about a tab is newer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OverlayAck {
    pub active: bool,
    pub revision: u64,
}

/// Commands the background context sends into a page's overlay.
#[derive(Debug)]
pub enum PageCommand {
    /// Arm or disarm the overlay.
    SetActive {
        active: bool,
        ack: oneshot::Sender<OverlayAck>,
    },
}

#[derive(Debug, thiserror::Error)]
#[error("overlay port closed")]
pub struct PortClosed;

#[derive(Debug, thiserror::Error)]
#[error("no tab with id {0}")]
pub struct NoSuchTab(pub TabId);

/// Sending half of an overlay's command channel.
#[derive(Debug, Clone)]
pub struct OverlayPort {
    tx: mpsc::Sender<PageCommand>,
}

impl OverlayPort {
    pub fn new(tx: mpsc::Sender<PageCommand>) -> Self {
        Self { tx }
    }

    /// Deliver an arm/disarm command and wait for the page to acknowledge it.
    pub async fn set_active(&self, active: bool) -> Result<OverlayAck, PortClosed> {
        let (ack, ack_rx) = oneshot::channel();
        self.tx
            .send(PageCommand::SetActive { active, ack })
            .await
            .map_err(|_| PortClosed)?;
        ack_rx.await.map_err(|_| PortClosed)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

struct TabEntry {
    url: String,
    content: Option<Arc<Vec<u8>>>,
    overlay: Option<OverlayPort>,
}

#[derive(Default)]
struct Tabs {
    entries: HashMap<TabId, TabEntry>,
    active: Option<TabId>,
}

/// Thread-safe registry of open tabs.
#[derive(Default)]
pub struct TabDirectory {
    inner: Mutex<Tabs>,
}

impl TabDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    fn tabs(&self) -> std::sync::MutexGuard<'_, Tabs> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Open a tab and make it the active one.
    pub fn open_tab(&self, tab_id: TabId, url: &str) {
        let mut tabs = self.tabs();
        tabs.entries.insert(
            tab_id,
            TabEntry {
                url: url.to_string(),
                content: None,
                overlay: None,
            },
        );
        tabs.active = Some(tab_id);
        log::debug!("[TABS] Opened tab {} at {}", tab_id, url);
    }

    /// Load a new page in an existing tab. The previous page's overlay and
    /// rendered content go away with it.
    pub fn navigate(&self, tab_id: TabId, url: &str) -> Result<(), NoSuchTab> {
        let mut tabs = self.tabs();
        let entry = tabs.entries.get_mut(&tab_id).ok_or(NoSuchTab(tab_id))?;
        entry.url = url.to_string();
        entry.content = None;
        entry.overlay = None;
        log::debug!("[TABS] Tab {} navigated to {}", tab_id, url);
        Ok(())
    }

    pub fn close_tab(&self, tab_id: TabId) {
        let mut tabs = self.tabs();
        tabs.entries.remove(&tab_id);
        if tabs.active == Some(tab_id) {
            tabs.active = None;
        }
    }

    /// Focus another tab.
    pub fn set_active_tab(&self, tab_id: TabId) -> Result<(), NoSuchTab> {
        let mut tabs = self.tabs();
        if !tabs.entries.contains_key(&tab_id) {
            return Err(NoSuchTab(tab_id));
        }
        tabs.active = Some(tab_id);
        Ok(())
    }

    pub fn active_tab(&self) -> Option<TabId> {
        self.tabs().active
    }

    pub fn contains(&self, tab_id: TabId) -> bool {
        self.tabs().entries.contains_key(&tab_id)
    }

    pub fn url(&self, tab_id: TabId) -> Option<String> {
        self.tabs().entries.get(&tab_id).map(|e| e.url.clone())
    }

    /// Replace what the tab currently renders (a lossless PNG of the viewport).
    pub fn set_visible_content(&self, tab_id: TabId, png: Vec<u8>) -> Result<(), NoSuchTab> {
        let mut tabs = self.tabs();
        let entry = tabs.entries.get_mut(&tab_id).ok_or(NoSuchTab(tab_id))?;
        entry.content = Some(Arc::new(png));
        Ok(())
    }

    /// Called by a page when its overlay finishes initializing.
    pub fn register_overlay(&self, tab_id: TabId, port: OverlayPort) -> Result<(), NoSuchTab> {
        let mut tabs = self.tabs();
        let entry = tabs.entries.get_mut(&tab_id).ok_or(NoSuchTab(tab_id))?;
        entry.overlay = Some(port);
        log::debug!("[TABS] Overlay registered for tab {}", tab_id);
        Ok(())
    }

    /// The overlay port of the tab's current page, or `None` if that page has
    /// not initialized its overlay yet.
    pub fn overlay_port(&self, tab_id: TabId) -> Result<Option<OverlayPort>, NoSuchTab> {
        let tabs = self.tabs();
        let entry = tabs.entries.get(&tab_id).ok_or(NoSuchTab(tab_id))?;
        Ok(entry.overlay.clone().filter(|port| !port.is_closed()))
    }
}

impl CaptureSource for TabDirectory {
    fn grab_visible_frame(&self, tab_id: TabId) -> Result<Vec<u8>, CaptureError> {
        let tabs = self.tabs();
        let entry = tabs
            .entries
            .get(&tab_id)
            .ok_or(CaptureError::NoTab(tab_id))?;
        if is_restricted_url(&entry.url) {
            return Err(CaptureError::Restricted {
                url: entry.url.clone(),
            });
        }
        let content = entry
            .content
            .as_ref()
            .ok_or_else(|| CaptureError::Grab(format!("tab {} has nothing rendered", tab_id)))?;
        // A fresh copy per grab: frames are never shared between requests.
        Ok(content.as_ref().clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn internal_pages_are_restricted() {
        assert!(is_restricted_url("chrome://settings"));
        assert!(is_restricted_url("edge://newtab"));
        assert!(is_restricted_url("about:blank"));
        assert!(!is_restricted_url("https://example.com"));
    }

    #[test]
    fn grab_refuses_restricted_pages() {
        let tabs = TabDirectory::new();
        tabs.open_tab(1, "chrome://extensions");
        tabs.set_visible_content(1, vec![1, 2, 3]).unwrap();
        assert!(matches!(
            tabs.grab_visible_frame(1),
            Err(CaptureError::Restricted { .. })
        ));
    }

    #[test]
    fn grab_unknown_tab_fails() {
        let tabs = TabDirectory::new();
        assert!(matches!(tabs.grab_visible_frame(9), Err(CaptureError::NoTab(9))));
    }

    #[test]
    fn navigation_drops_the_overlay_port() {
        let tabs = TabDirectory::new();
        tabs.open_tab(1, "https://example.com");
        let (tx, _rx) = mpsc::channel(1);
        tabs.register_overlay(1, OverlayPort::new(tx)).unwrap();
        assert!(tabs.overlay_port(1).unwrap().is_some());

        tabs.navigate(1, "https://example.org").unwrap();
        assert!(tabs.overlay_port(1).unwrap().is_none());
    }

    #[test]
    fn closed_port_reads_as_not_ready() {
        let tabs = TabDirectory::new();
        tabs.open_tab(1, "https://example.com");
        let (tx, rx) = mpsc::channel(1);
        tabs.register_overlay(1, OverlayPort::new(tx)).unwrap();
        drop(rx);
        assert!(tabs.overlay_port(1).unwrap().is_none());
    }

    #[test]
    fn focus_moves_only_to_open_tabs() {
        let tabs = TabDirectory::new();
        tabs.open_tab(1, "https://a.test");
        tabs.open_tab(2, "https://b.test");
        tabs.set_active_tab(1).unwrap();
        assert_eq!(tabs.active_tab(), Some(1));
        assert!(tabs.set_active_tab(9).is_err());
        assert_eq!(tabs.active_tab(), Some(1));
    }

    #[test]
    fn closing_active_tab_clears_active() {
        let tabs = TabDirectory::new();
        tabs.open_tab(1, "https://a.test");
        tabs.open_tab(2, "https://b.test");
        assert_eq!(tabs.active_tab(), Some(2));
        tabs.close_tab(2);
        assert_eq!(tabs.active_tab(), None);
        assert!(tabs.contains(1));
    }
}
