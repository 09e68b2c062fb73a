//! Configuration loading and persistence.
//!
//! `config.json` lives in the platform config directory (or
//! `CHATLINK_CONFIG_DIR`). Environment variables override file values; the
//! auth token is only ever taken from the environment and never written
//! to disk.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::connection::{ConnectionConfig, ReconnectPolicy};
use crate::constants;
use crate::dispatch::DispatchConfig;
use crate::model::SenderType;
use crate::transport::ws::http_to_ws_scheme;

const CONFIG_FILE: &str = "config.json";

/// Configuration for a chatlink client.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct ClientConfig {
    /// Base URL of the chat server (`http(s)://host[:port]`).
    pub server_url: String,
    /// WebSocket endpoint path on the server.
    pub socket_path: String,
    /// Bearer token - NOT serialized to disk.
    #[serde(skip)]
    pub token: Option<String>,
    /// Milliseconds between heartbeat pings.
    pub heartbeat_interval_ms: u64,
    /// Missed pongs before the connection is degraded.
    pub degraded_after_missed: u32,
    /// Missed pongs before the transport is dropped.
    pub force_close_after_missed: u32,
    /// First reconnect delay in milliseconds.
    pub reconnect_base_ms: u64,
    /// Reconnect delay growth factor.
    pub reconnect_multiplier: f64,
    /// Reconnect delay cap in milliseconds.
    pub reconnect_max_ms: u64,
    /// Failed reconnects before giving up.
    pub max_retry_attempts: u32,
    /// Add bounded random jitter to reconnect delays.
    pub reconnect_jitter: bool,
    /// Frames buffered while disconnected.
    pub outbound_buffer_capacity: usize,
    /// Delivery retries before a message is marked failed.
    pub dispatch_max_retries: u32,
    /// Delivery retry delay unit in milliseconds.
    pub dispatch_retry_delay_ms: u64,
    /// Maximum queued outbound messages.
    pub dispatch_queue_capacity: usize,
    /// Send over the socket first, REST only as fallback.
    pub socket_first: bool,
    /// Inbound event keys remembered for dedup.
    pub dedup_window: usize,
    /// History page size.
    pub page_size: usize,
    /// Collect telemetry counters.
    pub telemetry_enabled: bool,
    /// Sender type of messages authored on this client.
    pub local_sender: SenderType,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_url: "http://localhost:3000".to_string(),
            socket_path: "/ws".to_string(),
            token: None,
            heartbeat_interval_ms: constants::HEARTBEAT_INTERVAL.as_millis() as u64,
            degraded_after_missed: constants::DEGRADED_AFTER_MISSED,
            force_close_after_missed: constants::FORCE_CLOSE_AFTER_MISSED,
            reconnect_base_ms: constants::RECONNECT_BASE_DELAY.as_millis() as u64,
            reconnect_multiplier: constants::RECONNECT_MULTIPLIER,
            reconnect_max_ms: constants::RECONNECT_MAX_DELAY.as_millis() as u64,
            max_retry_attempts: constants::MAX_RETRY_ATTEMPTS,
            reconnect_jitter: false,
            outbound_buffer_capacity: constants::OUTBOUND_BUFFER_CAPACITY,
            dispatch_max_retries: constants::DISPATCH_MAX_RETRIES,
            dispatch_retry_delay_ms: constants::DISPATCH_RETRY_DELAY.as_millis() as u64,
            dispatch_queue_capacity: constants::DISPATCH_QUEUE_CAPACITY,
            socket_first: false,
            dedup_window: constants::RECENT_EVENT_WINDOW,
            page_size: constants::DEFAULT_PAGE_SIZE,
            telemetry_enabled: true,
            local_sender: SenderType::Agent,
        }
    }
}

impl ClientConfig {
    /// Returns the configuration directory path, creating it if necessary.
    ///
    /// `CHATLINK_CONFIG_DIR` wins; otherwise the platform config dir
    /// (`~/.config/chatlink` on Linux).
    pub fn config_dir() -> Result<PathBuf> {
        let dir = if let Ok(dir) = std::env::var("CHATLINK_CONFIG_DIR") {
            PathBuf::from(dir)
        } else {
            dirs::config_dir()
                .context("Could not determine config directory")?
                .join("chatlink")
        };
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create {}", dir.display()))?;
        Ok(dir)
    }

    /// Loads `config.json` from the config directory (defaults if absent),
    /// then applies environment overrides.
    pub fn load() -> Result<Self> {
        let path = Self::config_dir()?.join(CONFIG_FILE);
        let mut config = if path.exists() {
            Self::load_from(&path)?
        } else {
            Self::default()
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Loads a config file without environment overrides.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        serde_json::from_str(&content).with_context(|| format!("Invalid config in {}", path.display()))
    }

    /// Persists the configuration to the config directory.
    /// Note: the token is never written.
    pub fn save(&self) -> Result<PathBuf> {
        let path = Self::config_dir()?.join(CONFIG_FILE);
        self.save_to(&path)?;
        Ok(path)
    }

    /// Persists the configuration to `path` (owner read/write only on unix).
    pub fn save_to(&self, path: &Path) -> Result<()> {
        fs::write(path, serde_json::to_string_pretty(self)?)
            .with_context(|| format!("Failed to write {}", path.display()))?;

        #[cfg(unix)]
        fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;

        Ok(())
    }

    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Apply `CHATLINK_*` overrides from `lookup`. Unparseable values are
    /// ignored with a warning.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(server_url) = lookup("CHATLINK_SERVER_URL") {
            self.server_url = server_url;
        }

        // Token from env var only
        if let Some(token) = lookup("CHATLINK_TOKEN").filter(|t| !t.is_empty()) {
            self.token = Some(token);
        }

        if let Some(value) = lookup("CHATLINK_HEARTBEAT_MS") {
            match value.parse::<u64>() {
                Ok(ms) => self.heartbeat_interval_ms = ms,
                Err(_) => log::warn!("Ignoring invalid CHATLINK_HEARTBEAT_MS={value}"),
            }
        }

        if let Some(value) = lookup("CHATLINK_MAX_RETRY_ATTEMPTS") {
            match value.parse::<u32>() {
                Ok(n) => self.max_retry_attempts = n,
                Err(_) => log::warn!("Ignoring invalid CHATLINK_MAX_RETRY_ATTEMPTS={value}"),
            }
        }

        if let Some(value) = lookup("CHATLINK_SOCKET_FIRST") {
            match value.to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => self.socket_first = true,
                "0" | "false" | "no" | "off" => self.socket_first = false,
                _ => log::warn!("Ignoring invalid CHATLINK_SOCKET_FIRST={value}"),
            }
        }

        if let Some(value) = lookup("CHATLINK_PAGE_SIZE") {
            match value.parse::<usize>() {
                Ok(n) => self.page_size = n,
                Err(_) => log::warn!("Ignoring invalid CHATLINK_PAGE_SIZE={value}"),
            }
        }
    }

    /// Reject values the core cannot work with.
    pub fn validate(&self) -> Result<()> {
        let zero_checks = [
            ("heartbeat_interval_ms", self.heartbeat_interval_ms == 0),
            ("outbound_buffer_capacity", self.outbound_buffer_capacity == 0),
            ("dispatch_queue_capacity", self.dispatch_queue_capacity == 0),
            ("dedup_window", self.dedup_window == 0),
            ("page_size", self.page_size == 0),
            ("reconnect_base_ms", self.reconnect_base_ms == 0),
        ];
        if let Some((name, _)) = zero_checks.iter().find(|(_, is_zero)| *is_zero) {
            anyhow::bail!("{name} must be greater than zero");
        }
        if self.reconnect_multiplier.is_nan() || self.reconnect_multiplier < 1.0 {
            anyhow::bail!(
                "reconnect_multiplier must be >= 1.0 (got {})",
                self.reconnect_multiplier
            );
        }
        if self.reconnect_max_ms < self.reconnect_base_ms {
            anyhow::bail!(
                "reconnect_max_ms ({}) is below reconnect_base_ms ({})",
                self.reconnect_max_ms,
                self.reconnect_base_ms
            );
        }
        if self.force_close_after_missed < self.degraded_after_missed {
            anyhow::bail!("force_close_after_missed must be >= degraded_after_missed");
        }
        reqwest::Url::parse(&self.server_url)
            .with_context(|| format!("Invalid server_url {:?}", self.server_url))?;
        Ok(())
    }

    /// The canonical reconnect policy with this config's values.
    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            base: Duration::from_millis(self.reconnect_base_ms),
            multiplier: self.reconnect_multiplier,
            max_delay: Duration::from_millis(self.reconnect_max_ms),
            max_attempts: self.max_retry_attempts,
            jitter: self.reconnect_jitter,
        }
    }

    /// Connection manager tunables.
    pub fn connection_config(&self) -> ConnectionConfig {
        ConnectionConfig {
            heartbeat_interval: Duration::from_millis(self.heartbeat_interval_ms),
            degraded_after_missed: self.degraded_after_missed,
            force_close_after_missed: self.force_close_after_missed,
            reconnect: self.reconnect_policy(),
            buffer_capacity: self.outbound_buffer_capacity,
        }
    }

    /// Dispatch pipeline tunables.
    pub fn dispatch_config(&self) -> DispatchConfig {
        DispatchConfig {
            socket_first: self.socket_first,
            max_retries: self.dispatch_max_retries,
            retry_delay: Duration::from_millis(self.dispatch_retry_delay_ms),
            queue_capacity: self.dispatch_queue_capacity,
            ..DispatchConfig::default()
        }
    }

    /// WebSocket URL: server URL with a ws(s) scheme plus `socket_path`.
    pub fn socket_url(&self) -> String {
        let base = http_to_ws_scheme(self.server_url.trim_end_matches('/'));
        if self.socket_path.starts_with('/') {
            format!("{base}{}", self.socket_path)
        } else {
            format!("{base}/{}", self.socket_path)
        }
    }

    /// Base URL for REST calls.
    pub fn rest_base_url(&self) -> &str {
        self.server_url.trim_end_matches('/')
    }
}
