//! Local storage scope: the image+analysis handoff and usage statistics.
//!
//! Stores JSON files under a data directory
//! (`~/.local/share/snapsight/` on Linux, `SNAPSIGHT_DATA_DIR` to override):
//!   - `handoffs/<id>.json` - one pending conversation-window handoff per capture
//!   - `usage-stats.json`   - `{ "YYYY-MM-DD": { "<action>": count } }`
//!
//! Each handoff is taken exactly once, by id: reading it also deletes it.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use chrono::{NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::capture::EncodedImage;
use crate::error::WorkflowError;

const HANDOFF_DIR: &str = "handoffs";
const USAGE_FILE: &str = "usage-stats.json";

/// Usage action names.
pub mod actions {
    pub const SCREENSHOT_CAPTURED: &str = "screenshot_captured";
    pub const AI_ANALYSIS_SUCCESS: &str = "ai_analysis_success";
    pub const CHAT_MESSAGE_SENT: &str = "chat_message_sent";
}

/// date → action → count
pub type UsageStats = BTreeMap<String, BTreeMap<String, u64>>;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("failed to access {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("corrupt or unserializable data in {}: {source}", .path.display())]
    Json {
        path: PathBuf,
        source: serde_json::Error,
    },
}

impl From<StorageError> for WorkflowError {
    fn from(err: StorageError) -> Self {
        WorkflowError::Storage {
            reason: err.to_string(),
        }
    }
}

/// One captured image and its first analysis, on its way to a conversation window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandoffRecord {
    pub image_data: String,
    pub analysis: String,
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
    pub id: String,
}

impl HandoffRecord {
    pub fn new(image: &EncodedImage, analysis: String) -> Self {
        let timestamp = Utc::now().timestamp_millis();
        Self {
            id: handoff_id(&image.data_url, &analysis, timestamp),
            image_data: image.data_url.clone(),
            analysis,
            timestamp,
        }
    }
}

/// First 16 hex chars of the SHA-256 over the image data URL, the analysis
/// and the timestamp.
fn handoff_id(data_url: &str, analysis: &str, timestamp: i64) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data_url.as_bytes());
    hasher.update(b"\0");
    hasher.update(analysis.as_bytes());
    hasher.update(timestamp.to_le_bytes());
    let hash = format!("{:x}", hasher.finalize());
    hash[..16].to_string()
}

/// Ids come from [`handoff_id`]; anything else never names a stored file.
fn is_handoff_id(id: &str) -> bool {
    id.len() == 16 && id.bytes().all(|b| b.is_ascii_hexdigit())
}

/// Default data directory.
pub fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("snapsight")
}

/// File-backed local store. Safe to share between tasks; every operation is
/// a whole-file read-modify-write under one lock.
#[derive(Debug)]
pub struct LocalStore {
    root: PathBuf,
    lock: Mutex<()>,
}

impl LocalStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn handoff_path(&self, id: &str) -> PathBuf {
        self.root.join(HANDOFF_DIR).join(format!("{}.json", id))
    }

    /// Store the handoff under its id. Handoffs of other captures are untouched.
    pub fn put_handoff(&self, record: &HandoffRecord) -> Result<(), StorageError> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        write_json(&self.handoff_path(&record.id), record)?;
        log::info!(
            "[HANDOFF] Stored {} ({} chars of image data)",
            record.id,
            record.image_data.len()
        );
        Ok(())
    }

    /// Take the handoff stored under `id`. A second call for the same id
    /// returns `None`.
    pub fn take_handoff(&self, id: &str) -> Result<Option<HandoffRecord>, StorageError> {
        if !is_handoff_id(id) {
            log::warn!("[HANDOFF] Ignoring malformed id {:?}", id);
            return Ok(None);
        }
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let path = self.handoff_path(id);
        let Some(record) = read_json::<HandoffRecord>(&path)? else {
            return Ok(None);
        };
        std::fs::remove_file(&path).map_err(|source| StorageError::Io {
            path: path.clone(),
            source,
        })?;
        log::info!("[HANDOFF] Took {}", record.id);
        Ok(Some(record))
    }

    /// Count one `action` for today (UTC). Returns the new count.
    pub fn track_usage(&self, action: &str) -> Result<u64, StorageError> {
        self.track_usage_on(Utc::now().date_naive(), action)
    }

    pub fn track_usage_on(&self, date: NaiveDate, action: &str) -> Result<u64, StorageError> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let path = self.root.join(USAGE_FILE);
        let mut stats: UsageStats = read_json(&path)?.unwrap_or_default();
        let count = stats
            .entry(date.format("%Y-%m-%d").to_string())
            .or_default()
            .entry(action.to_string())
            .or_insert(0);
        *count += 1;
        let count = *count;
        write_json(&path, &stats)?;
        Ok(count)
    }

    pub fn usage_stats(&self) -> Result<UsageStats, StorageError> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(read_json(&self.root.join(USAGE_FILE))?.unwrap_or_default())
    }
}

/// Tracking never fails the request it is counting; errors are only logged.
pub fn track_quietly(store: &LocalStore, action: &str) {
    if let Err(e) = store.track_usage(action) {
        log::warn!("[HANDOFF] Failed to track {}: {}", action, e);
    }
}

pub(crate) fn read_json<T: serde::de::DeserializeOwned>(
    path: &Path,
) -> Result<Option<T>, StorageError> {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(StorageError::Io {
                path: path.to_path_buf(),
                source,
            })
        }
    };
    serde_json::from_str(&raw)
        .map(Some)
        .map_err(|source| StorageError::Json {
            path: path.to_path_buf(),
            source,
        })
}

/// Write via a temp file + rename so readers never see a half-written file.
pub(crate) fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), StorageError> {
    let io_err = |source: std::io::Error| StorageError::Io {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(io_err)?;
    }
    let json = serde_json::to_string_pretty(value).map_err(|source| StorageError::Json {
        path: path.to_path_buf(),
        source,
    })?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, json).map_err(io_err)?;
    std::fs::rename(&tmp, path).map_err(io_err)
}
