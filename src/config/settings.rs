//! Configuration settings for home-agent.

use crate::error::{GatewayError, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Prefix for environment variable overrides.
pub const ENV_PREFIX: &str = "HOME_AGENT_";

/// Root configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Settings {
    pub general: GeneralSettings,
    pub provider: ProviderSettings,
    pub catalog: CatalogSettings,
    pub retry: RetrySettings,
    pub traces: TraceSettings,
    pub server: ServerSettings,
}

/// General application settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralSettings {
    /// Directory for storing application data.
    pub data_dir: String,
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Default for GeneralSettings {
    fn default() -> Self {
        Self {
            data_dir: "~/.home-agent".to_string(),
            log_level: "info".to_string(),
        }
    }
}

/// Remote tool-provider connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderSettings {
    /// SSE endpoint of the tool provider (e.g. `http://homeassistant.local:8123/mcp_server/sse`).
    pub url: String,
    /// Bearer token sent when the session is opened.
    pub token: Option<String>,
    /// Timeout for establishing a session, including the handshake.
    pub connect_timeout_secs: u64,
    /// Timeout for a single tool call.
    pub call_timeout_secs: u64,
    /// Consecutive call timeouts after which the session is considered broken.
    pub max_consecutive_timeouts: u32,
}

impl Default for ProviderSettings {
    fn default() -> Self {
        Self {
            url: "http://homeassistant.local:8123/mcp_server/sse".to_string(),
            token: None,
            connect_timeout_secs: 30,
            call_timeout_secs: 60,
            max_consecutive_timeouts: 3,
        }
    }
}

/// Tool catalog refresh settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CatalogSettings {
    /// Seconds between periodic catalog refreshes.
    pub refresh_interval_secs: u64,
    /// Seconds to wait before retrying a failed refresh.
    pub refresh_cooldown_secs: u64,
}

impl Default for CatalogSettings {
    fn default() -> Self {
        Self {
            refresh_interval_secs: 30 * 60,
            refresh_cooldown_secs: 30,
        }
    }
}

/// Connection retry settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    /// Maximum number of connection attempts before giving up.
    pub max_attempts: u32,
    /// Delay before the second attempt; doubled for every following attempt.
    pub initial_delay_ms: u64,
    /// Upper bound for a single backoff delay.
    pub max_delay_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay_ms: 500,
            max_delay_ms: 30_000,
        }
    }
}

/// Execution trace storage settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TraceSettings {
    /// Capture agent-run traces.
    pub enabled: bool,
    /// Path to the SQLite trace database, relative to `general.data_dir` unless absolute.
    pub sqlite_path: String,
    /// Number of batches that may wait for the export worker.
    pub queue_capacity: usize,
}

impl Default for TraceSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            sqlite_path: "traces.db".to_string(),
            queue_capacity: 256,
        }
    }
}

/// HTTP API settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8099,
        }
    }
}

impl Settings {
    /// Load settings from the default configuration file.
    pub fn load() -> Result<Self> {
        Self::load_from(None)
    }

    /// Load settings from a specific path, or default location if None.
    ///
    /// Environment overrides are applied after the file is read.
    pub fn load_from(path: Option<&PathBuf>) -> Result<Self> {
        let config_path = match path {
            Some(p) => p.clone(),
            None => Self::default_config_path(),
        };

        let mut settings = if config_path.exists() {
            let content = std::fs::read_to_string(&config_path)?;
            toml::from_str(&content)?
        } else {
            Settings::default()
        };

        settings.apply_env(|key| std::env::var(key).ok());
        Ok(settings)
    }

    /// Apply `HOME_AGENT_*` overrides using the given lookup.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(&format!("{}{}", ENV_PREFIX, name)).filter(|v| !v.is_empty());

        if let Some(url) = var("PROVIDER_URL") {
            self.provider.url = url;
        }
        if let Some(token) = var("PROVIDER_TOKEN") {
            self.provider.token = Some(token);
        }
        if let Some(path) = var("TRACES_PATH") {
            self.traces.sqlite_path = path;
        }
    }

    /// Reject settings the gateway cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.provider.url.trim().is_empty() {
            return Err(GatewayError::Config("provider.url must be set".to_string()));
        }
        url::Url::parse(&self.provider.url)
            .map_err(|e| GatewayError::Config(format!("provider.url is invalid: {}", e)))?;
        if self.retry.max_attempts == 0 {
            return Err(GatewayError::Config(
                "retry.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.catalog.refresh_interval_secs == 0 || self.catalog.refresh_cooldown_secs == 0 {
            return Err(GatewayError::Config(
                "catalog refresh interval and cooldown must be positive".to_string(),
            ));
        }
        if self.traces.queue_capacity == 0 {
            return Err(GatewayError::Config(
                "traces.queue_capacity must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Save settings to a specific path.
    pub fn save_to(&self, path: &PathBuf) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content =
            toml::to_string_pretty(self).map_err(|e| GatewayError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Get the default configuration file path.
    pub fn default_config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("home-agent")
            .join("config.toml")
    }

    /// Expand shell variables in paths (e.g., ~).
    pub fn expand_path(path: &str) -> PathBuf {
        PathBuf::from(shellexpand::tilde(path).to_string())
    }

    /// Get the expanded data directory path.
    pub fn data_dir(&self) -> PathBuf {
        Self::expand_path(&self.general.data_dir)
    }

    /// Get the expanded trace database path.
    pub fn traces_path(&self) -> PathBuf {
        let path = Self::expand_path(&self.traces.sqlite_path);
        if path.is_relative() {
            self.data_dir().join(path)
        } else {
            path
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.provider.connect_timeout_secs)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.provider.call_timeout_secs)
    }
}
