//! Application configuration management.
//!
//! This module handles loading and saving the application configuration:
//! backend endpoints, the credential storage backend, the route policy,
//! the presence mode and the session/presence timings.
//!
//! Configuration is stored at `~/.config/rewardboard/config.json`. Every
//! field has a default, so a missing or partial file is fine.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::auth::RefreshSettings;
use crate::gate::{GateSettings, RoutePolicy};
use crate::presence::{PollingSettings, PresenceMode, SubscriptionSettings};

/// Application name used for config/cache directory paths
const APP_NAME: &str = "rewardboard";

/// Config file name
const CONFIG_FILE: &str = "config.json";

pub const ENV_API_BASE_URL: &str = "REWARDBOARD_API_BASE_URL";
pub const ENV_WS_URL: &str = "REWARDBOARD_WS_URL";

/// Where credentials are persisted between runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    /// JSON file in the cache directory
    #[default]
    File,
    /// OS keychain
    Keyring,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PresenceKind {
    Polling,
    #[default]
    Subscription,
}

/// All delays in milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    pub request_timeout_ms: u64,
    pub refresh_startup_window_ms: u64,
    pub refresh_startup_retry_ms: u64,
    pub forced_logout_delay_ms: u64,
    pub gate_initial_delay_ms: u64,
    pub gate_redirect_delay_ms: u64,
    pub poll_initial_delay_ms: u64,
    pub poll_interval_ms: u64,
    pub activity_interval_ms: u64,
    pub reconnect_base_ms: u64,
    pub reconnect_max_ms: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: 30_000,
            refresh_startup_window_ms: 2_000,
            refresh_startup_retry_ms: 500,
            forced_logout_delay_ms: 5_000,
            gate_initial_delay_ms: 200,
            gate_redirect_delay_ms: 3_000,
            poll_initial_delay_ms: 1_000,
            poll_interval_ms: 10_000,
            activity_interval_ms: 30_000,
            reconnect_base_ms: 500,
            reconnect_max_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub api_base_url: String,
    /// Presence WebSocket endpoint; derived from `api_base_url` when unset
    pub ws_url: Option<String>,
    pub storage: StorageBackend,
    pub presence: PresenceKind,
    pub log_file: Option<PathBuf>,
    pub last_email: Option<String>,
    pub routes: RoutePolicy,
    pub timing: TimingConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_base_url: "http://localhost:8080".to_string(),
            ws_url: None,
            storage: StorageBackend::default(),
            presence: PresenceKind::default(),
            log_file: None,
            last_email: None,
            routes: RoutePolicy::default(),
            timing: TimingConfig::default(),
        }
    }
}

fn ms(value: u64) -> Duration {
    Duration::from_millis(value)
}

impl Config {
    /// Load the config file, then apply environment overrides.
    pub fn load() -> Result<Self> {
        let mut config = Self::load_file()?;
        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// The config file as stored, without environment overrides.
    pub fn load_file() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            serde_json::from_str(&contents)
                .with_context(|| format!("Invalid config file {}", path.display()))
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(path, contents)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        Ok(())
    }

    pub fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;
        Ok(config_dir.join(APP_NAME).join(CONFIG_FILE))
    }

    pub fn cache_dir(&self) -> Result<PathBuf> {
        let cache_dir = dirs::cache_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find cache directory"))?;
        Ok(cache_dir.join(APP_NAME))
    }

    /// Apply overrides from `lookup`, normally the process environment
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(url) = lookup(ENV_API_BASE_URL).filter(|v| !v.trim().is_empty()) {
            self.api_base_url = url.trim().to_string();
        }
        if let Some(url) = lookup(ENV_WS_URL).filter(|v| !v.trim().is_empty()) {
            self.ws_url = Some(url.trim().to_string());
        }
    }

    /// `http://host:8080/api` becomes `ws://host:8080/ws`, `https` becomes `wss`.
    pub fn ws_endpoint(&self) -> String {
        if let Some(ref url) = self.ws_url {
            return url.clone();
        }
        let base = self.api_base_url.trim_end_matches('/');
        let (scheme, rest) = if let Some(rest) = base.strip_prefix("https://") {
            ("wss", rest)
        } else if let Some(rest) = base.strip_prefix("http://") {
            ("ws", rest)
        } else {
            ("ws", base)
        };
        let authority = rest.split('/').next().unwrap_or(rest);
        format!("{}://{}/ws", scheme, authority)
    }

    pub fn request_timeout(&self) -> Duration {
        ms(self.timing.request_timeout_ms)
    }

    pub fn refresh_settings(&self) -> RefreshSettings {
        RefreshSettings {
            startup_window: ms(self.timing.refresh_startup_window_ms),
            startup_retry_delay: ms(self.timing.refresh_startup_retry_ms),
            forced_logout_delay: ms(self.timing.forced_logout_delay_ms),
        }
    }

    pub fn gate_settings(&self) -> GateSettings {
        GateSettings {
            initial_delay: ms(self.timing.gate_initial_delay_ms),
            redirect_delay: ms(self.timing.gate_redirect_delay_ms),
        }
    }

    pub fn polling_settings(&self) -> PollingSettings {
        PollingSettings {
            initial_delay: ms(self.timing.poll_initial_delay_ms),
            interval: ms(self.timing.poll_interval_ms),
        }
    }

    pub fn subscription_settings(&self) -> SubscriptionSettings {
        SubscriptionSettings {
            endpoint: self.ws_endpoint(),
            activity_interval: ms(self.timing.activity_interval_ms),
            backoff_base: ms(self.timing.reconnect_base_ms),
            backoff_max: ms(self.timing.reconnect_max_ms),
            ..SubscriptionSettings::default()
        }
    }

    pub fn presence_mode(&self) -> PresenceMode {
        match self.presence {
            PresenceKind::Polling => PresenceMode::Polling(self.polling_settings()),
            PresenceKind::Subscription => PresenceMode::Subscription(self.subscription_settings()),
        }
    }
}
