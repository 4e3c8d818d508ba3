use std::env;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

/// Setting names that select which server/project/environment the cache
/// talks to. Changing any of them requires a reconnect.
pub const CONNECTION_SETTINGS: &[&str] = &[
    "sdk_key",
    "base_uri",
    "stream_uri",
    "project",
    "env",
    "stream",
];

/// Connection settings for the flag cache (`[flagsync]` in flagsync.toml).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Server-side SDK key for the environment; authorizes flag reads and the stream.
    #[serde(default)]
    pub sdk_key: Option<String>,
    /// Management API access token; authorizes patches.
    #[serde(default)]
    pub api_token: Option<String>,
    #[serde(default = "default_base_uri")]
    pub base_uri: String,
    #[serde(default = "default_stream_uri")]
    pub stream_uri: String,
    #[serde(default)]
    pub project: Option<String>,
    #[serde(default)]
    pub env: Option<String>,
    /// When false the cache is filled once from a full fetch and never streams.
    #[serde(default = "default_stream")]
    pub stream: bool,
    #[serde(default = "default_initial_reconnect_delay_ms")]
    pub initial_reconnect_delay_ms: u64,
    #[serde(default = "default_max_reconnect_delay_ms")]
    pub max_reconnect_delay_ms: u64,
    /// Timeout for request/response calls. The stream itself has none.
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

// ── Default value functions ──────────────────────────

fn default_base_uri() -> String {
    "https://app.launchdarkly.com".to_string()
}

fn default_stream_uri() -> String {
    "https://stream.launchdarkly.com".to_string()
}

fn default_stream() -> bool {
    true
}

fn default_initial_reconnect_delay_ms() -> u64 {
    1_000
}

fn default_max_reconnect_delay_ms() -> u64 {
    30_000
}

fn default_request_timeout_ms() -> u64 {
    30_000
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            sdk_key: None,
            api_token: None,
            base_uri: default_base_uri(),
            stream_uri: default_stream_uri(),
            project: None,
            env: None,
            stream: default_stream(),
            initial_reconnect_delay_ms: default_initial_reconnect_delay_ms(),
            max_reconnect_delay_ms: default_max_reconnect_delay_ms(),
            request_timeout_ms: default_request_timeout_ms(),
        }
    }
}

fn non_empty(value: &Option<String>) -> bool {
    value.as_deref().is_some_and(|v| !v.trim().is_empty())
}

impl SyncConfig {
    /// Load configuration from the `[flagsync]` table of a TOML file, falling
    /// back to defaults if the file doesn't exist or cannot be parsed.
    pub fn load(path: &str) -> Self {
        #[derive(Deserialize)]
        struct FlagsyncToml {
            flagsync: Option<SyncConfig>,
        }

        match std::fs::read_to_string(path) {
            Ok(content) => match toml::from_str::<FlagsyncToml>(&content) {
                Ok(file) => file.flagsync.unwrap_or_default(),
                Err(e) => {
                    warn!(path, error = %e, "failed to parse config, using defaults");
                    Self::default()
                }
            },
            Err(_) => Self::default(),
        }
    }

    /// Apply `FLAGSYNC_*` environment variable overrides.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|name| env::var(name).ok());
    }

    /// Apply overrides from an arbitrary variable lookup.
    pub fn apply_overrides_from(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(val) = lookup("FLAGSYNC_SDK_KEY") {
            self.sdk_key = Some(val);
        }
        if let Some(val) = lookup("FLAGSYNC_API_TOKEN") {
            self.api_token = Some(val);
        }
        if let Some(val) = lookup("FLAGSYNC_BASE_URI") {
            self.base_uri = val;
        }
        if let Some(val) = lookup("FLAGSYNC_STREAM_URI") {
            self.stream_uri = val;
        }
        if let Some(val) = lookup("FLAGSYNC_PROJECT") {
            self.project = Some(val);
        }
        if let Some(val) = lookup("FLAGSYNC_ENV") {
            self.env = Some(val);
        }
        if let Some(val) = lookup("FLAGSYNC_STREAM") {
            match val.to_lowercase().as_str() {
                "1" | "true" | "on" => self.stream = true,
                "0" | "false" | "off" => self.stream = false,
                other => warn!(value = other, "unknown FLAGSYNC_STREAM value"),
            }
        }
    }

    /// Names of required connection settings that are missing or empty.
    pub fn missing_settings(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        if !non_empty(&self.sdk_key) {
            missing.push("sdk_key");
        }
        if self.base_uri.trim().is_empty() {
            missing.push("base_uri");
        }
        if self.stream && self.stream_uri.trim().is_empty() {
            missing.push("stream_uri");
        }
        if !non_empty(&self.project) {
            missing.push("project");
        }
        if !non_empty(&self.env) {
            missing.push("env");
        }
        missing
    }

    pub fn is_configured(&self) -> bool {
        self.missing_settings().is_empty()
    }

    pub fn initial_reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.initial_reconnect_delay_ms)
    }

    pub fn max_reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.max_reconnect_delay_ms.max(self.initial_reconnect_delay_ms))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn base_url(&self, path: &str) -> String {
        format!("{}{}", self.base_uri.trim_end_matches('/'), path)
    }

    pub fn stream_url(&self, path: &str) -> String {
        format!("{}{}", self.stream_uri.trim_end_matches('/'), path)
    }
}

/// Whether any of `changed` names a setting that needs a reconnect.
pub fn affects_connection(changed: &[&str]) -> bool {
    changed.iter().any(|name| CONNECTION_SETTINGS.contains(name))
}
