//! Synced settings scope and runtime configuration.
//!
//! Settings live in `settings.json` under the config directory
//! (`~/.config/snapsight/` on Linux). Keys are camelCase:
//!   - `groqApiKey`      - the inference credential
//!   - `hasSeenWelcome`  - onboarding hint already shown
//! Unknown keys are preserved on save.
//!
//! Runtime tunables come from the environment (`SNAPSIGHT_*`), see
//! [`AppConfig::from_env`].

use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::capture::CaptureConfig;
use crate::handoff::{default_data_dir, read_json, write_json, StorageError};
use crate::llm::provider::API_KEY_ENV;
use crate::llm::{CredentialSource, ProviderConfig};
use crate::orchestrator::RetryPolicy;

const SETTINGS_FILE: &str = "settings.json";

static API_KEY_PATTERN: OnceLock<Regex> = OnceLock::new();

fn api_key_pattern() -> &'static Regex {
    API_KEY_PATTERN.get_or_init(|| Regex::new(r"^gsk_\S+$").expect("API key pattern is valid"))
}

/// Shape check for a Groq key, used where the user enters one.
pub fn validate_api_key(key: &str) -> bool {
    api_key_pattern().is_match(key.trim())
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Settings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub groq_api_key: Option<String>,
    #[serde(default)]
    pub has_seen_welcome: bool,
    #[serde(flatten)]
    pub other: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("Invalid API key format. Groq keys start with \"gsk_\".")]
    InvalidKey,
    #[error(transparent)]
    Storage(#[from] StorageError),
}

pub fn default_config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("snapsight")
}

#[derive(Debug, Clone)]
pub struct SettingsStore {
    path: PathBuf,
    env_override: Option<&'static str>,
}

impl SettingsStore {
    /// Store under `dir`; `GROQ_API_KEY` takes precedence over the saved key.
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            path: dir.as_ref().join(SETTINGS_FILE),
            env_override: Some(API_KEY_ENV),
        }
    }

    /// Ignore the environment and use only the saved key.
    pub fn without_env_override(mut self) -> Self {
        self.env_override = None;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> Result<Settings, StorageError> {
        Ok(read_json(&self.path)?.unwrap_or_default())
    }

    pub fn save(&self, settings: &Settings) -> Result<(), StorageError> {
        write_json(&self.path, settings)
    }

    /// Validate and persist the credential.
    pub fn save_api_key(&self, key: &str) -> Result<(), SettingsError> {
        let key = key.trim();
        if !validate_api_key(key) {
            return Err(SettingsError::InvalidKey);
        }
        let mut settings = self.load()?;
        settings.groq_api_key = Some(key.to_string());
        self.save(&settings)?;
        log::info!("[SETTINGS] API key saved ({} chars)", key.len());
        Ok(())
    }

    /// Mark onboarding as seen. Returns true the first time only.
    pub fn mark_welcome_seen(&self) -> Result<bool, StorageError> {
        let mut settings = self.load()?;
        if settings.has_seen_welcome {
            return Ok(false);
        }
        settings.has_seen_welcome = true;
        self.save(&settings)?;
        Ok(true)
    }
}

impl CredentialSource for SettingsStore {
    fn api_key(&self) -> Option<String> {
        if let Some(var) = self.env_override {
            if let Ok(key) = std::env::var(var) {
                if !key.trim().is_empty() {
                    return Some(key);
                }
            }
        }
        match self.load() {
            Ok(settings) => settings.groq_api_key.filter(|k| !k.trim().is_empty()),
            Err(e) => {
                log::warn!("[SETTINGS] Could not read credential: {}", e);
                None
            }
        }
    }
}

/// Everything tunable at startup.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub provider: ProviderConfig,
    pub overlay_retry: RetryPolicy,
    pub capture: CaptureConfig,
    pub data_dir: PathBuf,
    pub config_dir: PathBuf,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            provider: ProviderConfig::default(),
            overlay_retry: RetryPolicy::default(),
            capture: CaptureConfig::default(),
            data_dir: default_data_dir(),
            config_dir: default_config_dir(),
        }
    }
}

impl AppConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup. Unparseable values fall back to
    /// the default with a warning.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        let provider = &mut config.provider;

        if let Some(endpoint) = lookup("SNAPSIGHT_ENDPOINT") {
            provider.endpoint = endpoint;
        }
        if let Some(model) = lookup("SNAPSIGHT_MODEL") {
            provider.model = model;
        }
        provider.max_tokens = parse_or(&lookup, "SNAPSIGHT_MAX_TOKENS", provider.max_tokens);
        provider.temperature = parse_or(&lookup, "SNAPSIGHT_TEMPERATURE", provider.temperature);
        provider.rate_limit_max_requests = parse_or(
            &lookup,
            "SNAPSIGHT_RATE_LIMIT",
            provider.rate_limit_max_requests,
        );
        provider.rate_limit_window = Duration::from_secs(parse_or(
            &lookup,
            "SNAPSIGHT_RATE_WINDOW_SECS",
            provider.rate_limit_window.as_secs(),
        ));

        let retry = &mut config.overlay_retry;
        retry.interval = Duration::from_millis(parse_or(
            &lookup,
            "SNAPSIGHT_OVERLAY_RETRY_MS",
            retry.interval.as_millis() as u64,
        ));
        retry.max_attempts = parse_or(
            &lookup,
            "SNAPSIGHT_OVERLAY_RETRY_ATTEMPTS",
            retry.max_attempts,
        );

        if let Some(dir) = lookup("SNAPSIGHT_DATA_DIR") {
            config.data_dir = PathBuf::from(dir);
        }
        config
    }
}

fn parse_or<T: std::str::FromStr + Copy>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> T {
    match lookup(key) {
        Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
            log::warn!("[SETTINGS] Ignoring invalid {}={:?}", key, raw);
            default
        }),
        None => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn key_shape() {
        assert!(validate_api_key("gsk_abc123"));
        assert!(validate_api_key("  gsk_abc123\n"));
        assert!(!validate_api_key("gsk_"));
        assert!(!validate_api_key("sk-abc"));
        assert!(!validate_api_key("gsk_has space"));
        assert!(!validate_api_key(""));
    }

    #[test]
    fn save_key_rejects_bad_shape() {
        let dir = tempfile::tempdir().unwrap();
        let store = SettingsStore::new(dir.path()).without_env_override();
        assert!(matches!(
            store.save_api_key("not-a-key"),
            Err(SettingsError::InvalidKey)
        ));
        assert_eq!(store.api_key(), None);
    }

    #[test]
    fn saved_key_is_the_credential() {
        let dir = tempfile::tempdir().unwrap();
        let store = SettingsStore::new(dir.path()).without_env_override();
        store.save_api_key("gsk_test_key").unwrap();
        assert_eq!(store.api_key().as_deref(), Some("gsk_test_key"));
    }

    #[test]
    fn unknown_keys_survive_a_save() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(SETTINGS_FILE),
            r#"{"theme": "dark", "hasSeenWelcome": false}"#,
        )
        .unwrap();
        let store = SettingsStore::new(dir.path()).without_env_override();
        store.save_api_key("gsk_x").unwrap();

        let raw: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(store.path()).unwrap()).unwrap();
        assert_eq!(raw["theme"], "dark");
        assert_eq!(raw["groqApiKey"], "gsk_x");
    }

    #[test]
    fn environment_key_wins_over_the_saved_one() {
        assert_eq!(SettingsStore::new("unused").env_override, Some("GROQ_API_KEY"));

        // A variable no other test touches, so parallel tests are unaffected.
        const VAR: &str = "SNAPSIGHT_TEST_ENV_KEY_PRECEDENCE";
        let dir = tempfile::tempdir().unwrap();
        let mut store = SettingsStore::new(dir.path());
        store.env_override = Some(VAR);
        store.save_api_key("gsk_saved").unwrap();

        std::env::set_var(VAR, "gsk_from_env");
        assert_eq!(store.api_key().as_deref(), Some("gsk_from_env"));

        // Blank means unset.
        std::env::set_var(VAR, "   ");
        assert_eq!(store.api_key().as_deref(), Some("gsk_saved"));

        std::env::remove_var(VAR);
        assert_eq!(store.api_key().as_deref(), Some("gsk_saved"));
        assert_eq!(
            store.without_env_override().api_key().as_deref(),
            Some("gsk_saved")
        );
    }

    #[test]
    fn welcome_is_seen_once() {
        let dir = tempfile::tempdir().unwrap();
        let store = SettingsStore::new(dir.path());
        assert!(store.mark_welcome_seen().unwrap());
        assert!(!store.mark_welcome_seen().unwrap());
        assert!(store.load().unwrap().has_seen_welcome);
    }

    #[test]
    fn config_defaults() {
        let config = AppConfig::from_lookup(|_| None);
        assert_eq!(config.provider.max_tokens, 1500);
        assert_eq!(config.provider.rate_limit_max_requests, 50);
        assert_eq!(config.provider.rate_limit_window, Duration::from_secs(3600));
        assert_eq!(config.overlay_retry.interval, Duration::from_millis(500));
        assert_eq!(config.overlay_retry.max_attempts, 10);
    }

    #[test]
    fn config_overrides_and_bad_values() {
        let env: HashMap<&str, &str> = [
            ("SNAPSIGHT_MODEL", "other-model"),
            ("SNAPSIGHT_RATE_LIMIT", "3"),
            ("SNAPSIGHT_RATE_WINDOW_SECS", "60"),
            ("SNAPSIGHT_OVERLAY_RETRY_MS", "20"),
            ("SNAPSIGHT_MAX_TOKENS", "lots"),
            ("SNAPSIGHT_DATA_DIR", "/tmp/snapsight-test"),
        ]
        .into_iter()
        .collect();
        let config = AppConfig::from_lookup(|k| env.get(k).map(|v| v.to_string()));

        assert_eq!(config.provider.model, "other-model");
        assert_eq!(config.provider.rate_limit_max_requests, 3);
        assert_eq!(config.provider.rate_limit_window, Duration::from_secs(60));
        assert_eq!(config.overlay_retry.interval, Duration::from_millis(20));
        assert_eq!(config.provider.max_tokens, 1500);
        assert_eq!(config.data_dir, PathBuf::from("/tmp/snapsight-test"));
    }
}
