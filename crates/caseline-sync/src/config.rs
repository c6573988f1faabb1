//! # Sync Configuration
//!
//! Configuration management for the sync engine.
//!
//! ## Configuration Sources
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Configuration Priority                               │
//! │                                                                         │
//! │  1. Environment Variables (highest priority)                           │
//! │     CASELINE_SYNC_URL=wss://collab.example.org/sync                    │
//! │     CASELINE_USER_ID=analyst-7                                         │
//! │                                                                         │
//! │  2. TOML Config File                                                   │
//! │     ~/.config/caseline/sync.toml (Linux)                               │
//! │     ~/Library/Application Support/org.caseline.caseline/sync.toml      │
//! │                                                                         │
//! │  3. Default Values (lowest priority)                                   │
//! │     Engine constants from caseline-core                                │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Configuration File Format
//! ```toml
//! # sync.toml
//! [client]
//! user_id = "analyst-7"
//!
//! [connection]
//! url = "wss://collab.example.org/sync"
//! auth_token = "..."            # optional
//! connect_timeout_secs = 10
//! reconnect_delay_min_ms = 1000
//! reconnect_delay_max_secs = 30
//! reconnect_backoff = 1.5
//! ping_interval_secs = 30
//! pong_timeout_secs = 10
//!
//! [queue]
//! max_entries = 1000
//! retry_attempts = 3
//! batch_size = 50
//! flush_interval_secs = 5
//! ack_timeout_secs = 30
//!
//! [presence]
//! update_interval_secs = 30
//! timeout_secs = 60
//! ```

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use url::Url;

use caseline_core::validation::validate_user_id;

use crate::error::{SyncError, SyncResult};

// =============================================================================
// Client Settings
// =============================================================================

/// Identity of the local client.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClientSettings {
    /// Local user id. Operations carrying this origin are treated as echoes.
    #[serde(default)]
    pub user_id: String,
}

// =============================================================================
// Connection Settings
// =============================================================================

/// Coordination service connection and keepalive settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionSettings {
    /// WebSocket URL of the coordination service.
    /// `connect(None)` fails when this is unset.
    #[serde(default)]
    pub url: Option<String>,

    /// Token sent in an `auth` frame first on every connection.
    #[serde(default)]
    pub auth_token: Option<String>,

    /// Bound on the connect handshake (seconds).
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// First reconnect delay (milliseconds).
    #[serde(default = "default_reconnect_delay_min")]
    pub reconnect_delay_min_ms: u64,

    /// Reconnect delay cap (seconds).
    #[serde(default = "default_reconnect_delay_max")]
    pub reconnect_delay_max_secs: u64,

    /// Multiplier applied after each failed reconnect attempt.
    #[serde(default = "default_reconnect_backoff")]
    pub reconnect_backoff: f64,

    #[serde(default = "default_ping_interval")]
    pub ping_interval_secs: u64,

    #[serde(default = "default_pong_timeout")]
    pub pong_timeout_secs: u64,
}

fn default_connect_timeout() -> u64 {
    caseline_core::WS_CONNECT_TIMEOUT.as_secs()
}
fn default_reconnect_delay_min() -> u64 {
    caseline_core::WS_RECONNECT_DELAY_MIN.as_millis() as u64
}
fn default_reconnect_delay_max() -> u64 {
    caseline_core::WS_RECONNECT_DELAY_MAX.as_secs()
}
fn default_reconnect_backoff() -> f64 {
    caseline_core::WS_RECONNECT_BACKOFF
}
fn default_ping_interval() -> u64 {
    caseline_core::WS_PING_INTERVAL.as_secs()
}
fn default_pong_timeout() -> u64 {
    caseline_core::WS_PONG_TIMEOUT.as_secs()
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        ConnectionSettings {
            url: None,
            auth_token: None,
            connect_timeout_secs: default_connect_timeout(),
            reconnect_delay_min_ms: default_reconnect_delay_min(),
            reconnect_delay_max_secs: default_reconnect_delay_max(),
            reconnect_backoff: default_reconnect_backoff(),
            ping_interval_secs: default_ping_interval(),
            pong_timeout_secs: default_pong_timeout(),
        }
    }
}

// =============================================================================
// Queue Settings
// =============================================================================

/// Offline queue limits and flush cadence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueSettings {
    /// Cap on unacknowledged operations. Oldest are evicted first.
    #[serde(default = "default_queue_max")]
    pub max_entries: usize,

    /// Retries allowed before an operation is abandoned.
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,

    /// Operations sent per flush.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Period of the flush retry timer (seconds).
    #[serde(default = "default_flush_interval")]
    pub flush_interval_secs: u64,

    /// How long an in-flight operation may wait for its echo (seconds).
    #[serde(default = "default_ack_timeout")]
    pub ack_timeout_secs: u64,
}

fn default_queue_max() -> usize {
    caseline_core::OFFLINE_QUEUE_MAX
}
fn default_retry_attempts() -> u32 {
    caseline_core::SYNC_RETRY_ATTEMPTS
}
fn default_batch_size() -> usize {
    caseline_core::SYNC_BATCH_SIZE
}
fn default_flush_interval() -> u64 {
    caseline_core::QUEUE_FLUSH_INTERVAL.as_secs()
}
fn default_ack_timeout() -> u64 {
    caseline_core::SYNC_ACK_TIMEOUT.as_secs()
}

impl Default for QueueSettings {
    fn default() -> Self {
        QueueSettings {
            max_entries: default_queue_max(),
            retry_attempts: default_retry_attempts(),
            batch_size: default_batch_size(),
            flush_interval_secs: default_flush_interval(),
            ack_timeout_secs: default_ack_timeout(),
        }
    }
}

// =============================================================================
// Presence Settings
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresenceSettings {
    /// Broadcast debounce and sweep period (seconds).
    #[serde(default = "default_presence_interval")]
    pub update_interval_secs: u64,

    /// A record older than this is inactive (seconds).
    #[serde(default = "default_presence_timeout")]
    pub timeout_secs: u64,
}

fn default_presence_interval() -> u64 {
    caseline_core::PRESENCE_UPDATE_INTERVAL.as_secs()
}
fn default_presence_timeout() -> u64 {
    caseline_core::PRESENCE_TIMEOUT.as_secs()
}

impl Default for PresenceSettings {
    fn default() -> Self {
        PresenceSettings {
            update_interval_secs: default_presence_interval(),
            timeout_secs: default_presence_timeout(),
        }
    }
}

// =============================================================================
// Main Sync Configuration
// =============================================================================

/// Complete sync configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncConfig {
    #[serde(default)]
    pub client: ClientSettings,

    #[serde(default)]
    pub connection: ConnectionSettings,

    #[serde(default)]
    pub queue: QueueSettings,

    #[serde(default)]
    pub presence: PresenceSettings,
}

impl SyncConfig {
    /// Creates a config with defaults for the given local user.
    pub fn new(user_id: impl Into<String>) -> Self {
        SyncConfig {
            client: ClientSettings {
                user_id: user_id.into(),
            },
            ..Default::default()
        }
    }

    /// Sets the coordination service URL.
    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.connection.url = Some(url.into());
        self
    }

    /// Sets the authentication token.
    pub fn with_auth_token(mut self, token: impl Into<String>) -> Self {
        self.connection.auth_token = Some(token.into());
        self
    }

    /// Loads configuration from file, environment, and defaults.
    ///
    /// ## Load Order (later overrides earlier)
    /// 1. Default values
    /// 2. Config file (sync.toml)
    /// 3. Environment variables
    pub fn load(config_path: Option<PathBuf>) -> SyncResult<Self> {
        let mut config = Self::default();

        if let Some(path) = config_path.or_else(Self::default_config_path) {
            if path.exists() {
                info!(?path, "Loading sync config from file");
                let contents = std::fs::read_to_string(&path)?;
                config = toml::from_str(&contents)?;
            } else {
                debug!(?path, "Config file not found, using defaults");
            }
        }

        config.apply_env_overrides();
        config.validate()?;

        Ok(config)
    }

    /// Loads config or returns default if load fails.
    pub fn load_or_default(config_path: Option<PathBuf>) -> Self {
        Self::load(config_path).unwrap_or_else(|e| {
            warn!("Failed to load sync config: {}. Using defaults.", e);
            Self::default()
        })
    }

    /// Saves configuration to file.
    pub fn save(&self, config_path: Option<PathBuf>) -> SyncResult<()> {
        let path = config_path
            .or_else(Self::default_config_path)
            .ok_or_else(|| SyncError::ConfigSaveFailed("No config path available".into()))?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| SyncError::ConfigSaveFailed(e.to_string()))?;
        }

        let contents = toml::to_string_pretty(self)?;
        std::fs::write(&path, contents).map_err(|e| SyncError::ConfigSaveFailed(e.to_string()))?;

        info!(?path, "Sync config saved");
        Ok(())
    }

    /// Validates the configuration.
    pub fn validate(&self) -> SyncResult<()> {
        validate_user_id(&self.client.user_id)?;

        if let Some(ref url) = self.connection.url {
            validate_ws_url(url)?;
        }

        let connection = &self.connection;
        if !(connection.reconnect_backoff >= 1.0) {
            return Err(SyncError::InvalidConfig(format!(
                "reconnect_backoff must be at least 1.0, got {}",
                connection.reconnect_backoff
            )));
        }
        if connection.reconnect_delay_min_ms == 0 {
            return Err(SyncError::InvalidConfig(
                "reconnect_delay_min_ms must be greater than 0".into(),
            ));
        }
        if self.reconnect_delay_min() > self.reconnect_delay_max() {
            return Err(SyncError::InvalidConfig(
                "reconnect_delay_min_ms must not exceed reconnect_delay_max_secs".into(),
            ));
        }

        let positive = [
            ("connect_timeout_secs", connection.connect_timeout_secs),
            ("ping_interval_secs", connection.ping_interval_secs),
            ("pong_timeout_secs", connection.pong_timeout_secs),
            ("flush_interval_secs", self.queue.flush_interval_secs),
            ("ack_timeout_secs", self.queue.ack_timeout_secs),
            ("update_interval_secs", self.presence.update_interval_secs),
            ("timeout_secs", self.presence.timeout_secs),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(SyncError::InvalidConfig(format!(
                    "{} must be greater than 0",
                    name
                )));
            }
        }

        if self.queue.batch_size == 0 {
            return Err(SyncError::InvalidConfig(
                "batch_size must be greater than 0".into(),
            ));
        }
        if self.queue.max_entries == 0 {
            return Err(SyncError::InvalidConfig(
                "max_entries must be greater than 0".into(),
            ));
        }

        Ok(())
    }

    /// Applies environment variable overrides.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|key| std::env::var(key).ok());
    }

    /// Applies overrides from an arbitrary variable lookup.
    ///
    /// ## Variables
    /// - `CASELINE_USER_ID`
    /// - `CASELINE_SYNC_URL` (empty clears the URL)
    /// - `CASELINE_AUTH_TOKEN`
    /// - `CASELINE_CONNECT_TIMEOUT_SECS`
    /// - `CASELINE_QUEUE_MAX`
    pub fn apply_overrides_from<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(id) = lookup("CASELINE_USER_ID") {
            debug!(user_id = %id, "Overriding user ID from environment");
            self.client.user_id = id;
        }

        if let Some(url) = lookup("CASELINE_SYNC_URL") {
            if url.trim().is_empty() {
                debug!("Clearing sync URL from environment");
                self.connection.url = None;
            } else {
                debug!(url = %url, "Overriding sync URL from environment");
                self.connection.url = Some(url);
            }
        }

        if let Some(token) = lookup("CASELINE_AUTH_TOKEN") {
            self.connection.auth_token = Some(token);
        }

        if let Some(secs) = lookup("CASELINE_CONNECT_TIMEOUT_SECS") {
            match secs.parse::<u64>() {
                Ok(s) => self.connection.connect_timeout_secs = s,
                Err(_) => warn!(value = %secs, "Ignoring invalid CASELINE_CONNECT_TIMEOUT_SECS"),
            }
        }

        if let Some(max) = lookup("CASELINE_QUEUE_MAX") {
            match max.parse::<usize>() {
                Ok(m) => self.queue.max_entries = m,
                Err(_) => warn!(value = %max, "Ignoring invalid CASELINE_QUEUE_MAX"),
            }
        }
    }

    /// Returns the default config file path.
    pub fn default_config_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("org", "caseline", "caseline")
            .map(|dirs| dirs.config_dir().join("sync.toml"))
    }

    // =========================================================================
    // Convenience Methods
    // =========================================================================

    pub fn user_id(&self) -> &str {
        &self.client.user_id
    }

    pub fn url(&self) -> Option<&str> {
        self.connection.url.as_deref()
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connection.connect_timeout_secs)
    }

    pub fn reconnect_delay_min(&self) -> Duration {
        Duration::from_millis(self.connection.reconnect_delay_min_ms)
    }

    pub fn reconnect_delay_max(&self) -> Duration {
        Duration::from_secs(self.connection.reconnect_delay_max_secs)
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.connection.ping_interval_secs)
    }

    pub fn pong_timeout(&self) -> Duration {
        Duration::from_secs(self.connection.pong_timeout_secs)
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_secs(self.queue.flush_interval_secs)
    }

    pub fn ack_timeout(&self) -> Duration {
        Duration::from_secs(self.queue.ack_timeout_secs)
    }

    pub fn presence_interval(&self) -> Duration {
        Duration::from_secs(self.presence.update_interval_secs)
    }

    pub fn presence_timeout(&self) -> Duration {
        Duration::from_secs(self.presence.timeout_secs)
    }
}

/// Checks that `url` parses and uses the `ws` or `wss` scheme.
pub fn validate_ws_url(url: &str) -> SyncResult<()> {
    let parsed = Url::parse(url)?;
    match parsed.scheme() {
        "ws" | "wss" => Ok(()),
        other => Err(SyncError::InvalidUrl(format!(
            "Sync URL must use ws:// or wss://, got {}://",
            other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_match_engine_constants() {
        let config = SyncConfig::new("analyst-7");
        assert_eq!(config.reconnect_delay_min(), caseline_core::WS_RECONNECT_DELAY_MIN);
        assert_eq!(config.reconnect_delay_max(), caseline_core::WS_RECONNECT_DELAY_MAX);
        assert_eq!(config.ping_interval(), caseline_core::WS_PING_INTERVAL);
        assert_eq!(config.pong_timeout(), caseline_core::WS_PONG_TIMEOUT);
        assert_eq!(config.queue.max_entries, 1000);
        assert_eq!(config.queue.retry_attempts, 3);
        assert_eq!(config.queue.batch_size, 50);
        assert_eq!(config.presence_timeout(), caseline_core::PRESENCE_TIMEOUT);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = SyncConfig::new("analyst-7");

        config.client.user_id = "   ".to_string();
        assert!(matches!(config.validate(), Err(SyncError::Validation(_))));
        config.client.user_id = "analyst-7".to_string();

        config.connection.url = Some("http://collab.example.org".to_string());
        assert!(matches!(config.validate(), Err(SyncError::InvalidUrl(_))));

        config.connection.url = Some("not a url".to_string());
        assert!(matches!(config.validate(), Err(SyncError::InvalidUrl(_))));

        config.connection.url = Some("wss://collab.example.org/sync".to_string());
        assert!(config.validate().is_ok());

        config.connection.reconnect_backoff = 0.5;
        assert!(matches!(config.validate(), Err(SyncError::InvalidConfig(_))));
        config.connection.reconnect_backoff = 1.5;

        config.connection.reconnect_delay_min_ms = 60_000;
        assert!(matches!(config.validate(), Err(SyncError::InvalidConfig(_))));
        config.connection.reconnect_delay_min_ms = 1000;

        config.queue.batch_size = 0;
        assert!(config.validate().unwrap_err().is_config_error());
    }

    #[test]
    fn test_env_overrides() {
        let mut config = SyncConfig::new("analyst-7").with_url("ws://old.example.org");
        config.apply_overrides_from(lookup(&[
            ("CASELINE_USER_ID", "analyst-9"),
            ("CASELINE_AUTH_TOKEN", "secret"),
            ("CASELINE_CONNECT_TIMEOUT_SECS", "3"),
            ("CASELINE_QUEUE_MAX", "not-a-number"),
        ]));

        assert_eq!(config.user_id(), "analyst-9");
        assert_eq!(config.connection.auth_token.as_deref(), Some("secret"));
        assert_eq!(config.connect_timeout(), Duration::from_secs(3));
        assert_eq!(config.queue.max_entries, 1000);
        assert_eq!(config.url(), Some("ws://old.example.org"));

        config.apply_overrides_from(lookup(&[("CASELINE_SYNC_URL", "")]));
        assert_eq!(config.url(), None);
    }

    #[test]
    fn test_toml_partial_file_uses_defaults() {
        let config: SyncConfig = toml::from_str(
            r#"
            [client]
            user_id = "analyst-7"

            [connection]
            url = "wss://collab.example.org/sync"
            ping_interval_secs = 15
            "#,
        )
        .unwrap();

        assert_eq!(config.ping_interval(), Duration::from_secs(15));
        assert_eq!(config.pong_timeout(), Duration::from_secs(10));
        assert_eq!(config.queue.batch_size, 50);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("sync.toml");

        let config = SyncConfig::new("analyst-7").with_url("wss://collab.example.org/sync");
        config.save(Some(path.clone())).unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.contains("[client]"));
        assert!(contents.contains("[connection]"));

        let loaded: SyncConfig = toml::from_str(&contents).unwrap();
        assert_eq!(loaded.url(), Some("wss://collab.example.org/sync"));
        assert_eq!(loaded.user_id(), "analyst-7");
    }
}
