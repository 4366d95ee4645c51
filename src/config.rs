//! Configuration loading from TOML files and environment variables.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::ConfigError;

/// Root configuration structure.
///
/// Immutable once handed to the engine; every component reads it, none
/// writes it.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub poll: PollConfig,
    #[serde(default)]
    pub connection: ConnectionConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Remote status service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// WebSocket endpoint (http/https are rewritten to ws/wss).
    #[serde(default)]
    pub endpoint: String,
    /// Bearer token sent in the hello message.
    #[serde(default)]
    pub auth_token: String,
    /// Human readable device name. Defaults to the hostname.
    #[serde(default = "default_device_name")]
    pub device_name: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            auth_token: String::new(),
            device_name: default_device_name(),
        }
    }
}

impl ServerConfig {
    /// Device id derived from the display name: lowercase, whitespace runs
    /// collapsed to `-`.
    pub fn device_id(&self) -> String {
        self.device_name
            .split_whitespace()
            .map(str::to_lowercase)
            .collect::<Vec<_>>()
            .join("-")
    }

    /// Endpoint rewritten to a WebSocket URL.
    pub fn websocket_url(&self) -> Result<String, ConfigError> {
        let endpoint = self.endpoint.trim();
        if endpoint.is_empty() {
            return Err(ConfigError::MissingEndpoint);
        }

        match endpoint.split_once("://") {
            None => Ok(format!("ws://{endpoint}")),
            Some((scheme, rest)) => match scheme.to_ascii_lowercase().as_str() {
                "ws" | "wss" => Ok(endpoint.to_string()),
                "http" => Ok(format!("ws://{rest}")),
                "https" => Ok(format!("wss://{rest}")),
                _ => Err(ConfigError::UnsupportedScheme(endpoint.to_string())),
            },
        }
    }
}

/// Activity sampling and normalization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollConfig {
    /// Poll interval in milliseconds.
    #[serde(default = "default_poll_interval_ms")]
    pub interval_ms: u64,
    /// How long a new active/locked value must persist before it is reported.
    #[serde(default = "default_debounce_window_ms")]
    pub debounce_window_ms: u64,
    /// Idle time after which the machine counts as not in use.
    #[serde(default = "default_idle_threshold_ms")]
    pub idle_threshold_ms: u64,
    /// Idle duration changes within the same bucket are not reported.
    #[serde(default = "default_idle_bucket_ms")]
    pub idle_bucket_ms: u64,
    /// How long unknown samples are tolerated before reporting `available = false`.
    #[serde(default = "default_unknown_grace_ms")]
    pub unknown_grace_ms: u64,
    /// Upper bound for one native probe call.
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_poll_interval_ms(),
            debounce_window_ms: default_debounce_window_ms(),
            idle_threshold_ms: default_idle_threshold_ms(),
            idle_bucket_ms: default_idle_bucket_ms(),
            unknown_grace_ms: default_unknown_grace_ms(),
            probe_timeout_ms: default_probe_timeout_ms(),
        }
    }
}

impl PollConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn debounce_window(&self) -> Duration {
        Duration::from_millis(self.debounce_window_ms)
    }

    pub fn unknown_grace(&self) -> Duration {
        Duration::from_millis(self.unknown_grace_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }
}

/// Connection keep-alive and reconnect policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    /// Silence from the server longer than this drops the connection.
    #[serde(default = "default_heartbeat_timeout_ms")]
    pub heartbeat_timeout_ms: u64,
    /// Budget for the graceful close on shutdown.
    #[serde(default = "default_close_timeout_ms")]
    pub close_timeout_ms: u64,
    #[serde(default = "default_backoff_min_ms")]
    pub backoff_min_ms: u64,
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
    /// Connected time after which the backoff resets to the minimum.
    #[serde(default = "default_backoff_stability_window_ms")]
    pub backoff_stability_window_ms: u64,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: default_connect_timeout_ms(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            heartbeat_timeout_ms: default_heartbeat_timeout_ms(),
            close_timeout_ms: default_close_timeout_ms(),
            backoff_min_ms: default_backoff_min_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            backoff_stability_window_ms: default_backoff_stability_window_ms(),
        }
    }
}

impl ConnectionConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }

    pub fn close_timeout(&self) -> Duration {
        Duration::from_millis(self.close_timeout_ms)
    }

    pub fn backoff_min(&self) -> Duration {
        Duration::from_millis(self.backoff_min_ms)
    }

    pub fn backoff_max(&self) -> Duration {
        Duration::from_millis(self.backoff_max_ms)
    }

    pub fn backoff_stability_window(&self) -> Duration {
        Duration::from_millis(self.backoff_stability_window_ms)
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Data directory for the event journal.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// Log level (trace, debug, info, warn, error).
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Write engine events to `<data_dir>/logs/*.jsonl`.
    #[serde(default = "default_journal")]
    pub journal: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            level: default_log_level(),
            journal: default_journal(),
        }
    }
}

impl LoggingConfig {
    /// Returns the logs directory path.
    pub fn logs_dir(&self) -> PathBuf {
        self.data_dir.join("logs")
    }
}

// Default value functions
fn default_device_name() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "desktop".to_string())
}

fn default_poll_interval_ms() -> u64 {
    2_000
}

fn default_debounce_window_ms() -> u64 {
    3_000
}

fn default_idle_threshold_ms() -> u64 {
    60_000
}

fn default_idle_bucket_ms() -> u64 {
    30_000
}

fn default_unknown_grace_ms() -> u64 {
    10_000
}

fn default_probe_timeout_ms() -> u64 {
    500
}

fn default_connect_timeout_ms() -> u64 {
    10_000
}

fn default_heartbeat_interval_ms() -> u64 {
    15_000
}

fn default_heartbeat_timeout_ms() -> u64 {
    45_000
}

fn default_close_timeout_ms() -> u64 {
    2_000
}

fn default_backoff_min_ms() -> u64 {
    1_000
}

fn default_backoff_max_ms() -> u64 {
    60_000
}

fn default_backoff_stability_window_ms() -> u64 {
    30_000
}

fn default_data_dir() -> PathBuf {
    dirs::home_dir()
        .map(|h| h.join(".presence-reporter"))
        .unwrap_or_else(|| PathBuf::from(".presence-reporter"))
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_journal() -> bool {
    true
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|source| ConfigError::Read {
            path: path.as_ref().display().to_string(),
            source,
        })?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// Load configuration with environment variable overrides.
    pub fn load(config_path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = if let Some(path) = config_path {
            Self::from_file(path)?
        } else {
            // Try default config locations
            let default_paths = [
                PathBuf::from("config/default.toml"),
                dirs::config_dir()
                    .map(|d| d.join("presence-reporter/config.toml"))
                    .unwrap_or_default(),
            ];

            let mut loaded = None;
            for path in &default_paths {
                if path.is_file() {
                    loaded = Some(Self::from_file(path)?);
                    break;
                }
            }
            loaded.unwrap_or_default()
        };

        config.apply_env_overrides(|key| std::env::var(key).ok());

        config.logging.data_dir = expand_tilde(&config.logging.data_dir);

        Ok(config)
    }

    /// Apply environment variable overrides from the given lookup.
    fn apply_env_overrides(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(val) = var("PRESENCE_ENDPOINT") {
            self.server.endpoint = val;
        }
        if let Some(val) = var("PRESENCE_AUTH_TOKEN") {
            self.server.auth_token = val;
        }
        if let Some(val) = var("PRESENCE_DEVICE_NAME") {
            self.server.device_name = val;
        }
        if let Some(v) = var("PRESENCE_POLL_INTERVAL_MS").and_then(|v| v.parse().ok()) {
            self.poll.interval_ms = v;
        }
        if let Some(v) = var("PRESENCE_DEBOUNCE_MS").and_then(|v| v.parse().ok()) {
            self.poll.debounce_window_ms = v;
        }
        if let Some(val) = var("PRESENCE_DATA_DIR") {
            self.logging.data_dir = PathBuf::from(val);
        }
        if let Some(val) = var("PRESENCE_LOG_LEVEL") {
            self.logging.level = val;
        }
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.server.websocket_url()?;

        let required = [
            ("poll.interval_ms", self.poll.interval_ms),
            ("poll.idle_threshold_ms", self.poll.idle_threshold_ms),
            ("poll.idle_bucket_ms", self.poll.idle_bucket_ms),
            ("poll.probe_timeout_ms", self.poll.probe_timeout_ms),
            ("connection.connect_timeout_ms", self.connection.connect_timeout_ms),
            ("connection.heartbeat_interval_ms", self.connection.heartbeat_interval_ms),
            ("connection.heartbeat_timeout_ms", self.connection.heartbeat_timeout_ms),
            ("connection.close_timeout_ms", self.connection.close_timeout_ms),
            ("connection.backoff_min_ms", self.connection.backoff_min_ms),
            ("connection.backoff_max_ms", self.connection.backoff_max_ms),
        ];
        if let Some((name, _)) = required.into_iter().find(|(_, v)| *v == 0) {
            return Err(ConfigError::ZeroDuration(name));
        }

        let c = &self.connection;
        if c.backoff_min_ms > c.backoff_max_ms {
            return Err(ConfigError::BackoffBounds {
                min: c.backoff_min_ms,
                max: c.backoff_max_ms,
            });
        }
        if c.heartbeat_timeout_ms <= c.heartbeat_interval_ms {
            return Err(ConfigError::HeartbeatTimeout {
                interval: c.heartbeat_interval_ms,
                timeout: c.heartbeat_timeout_ms,
            });
        }
        // Shutdown must finish within one heartbeat interval of the session.
        if c.close_timeout_ms > c.heartbeat_interval_ms {
            return Err(ConfigError::CloseTimeout {
                close: c.close_timeout_ms,
                interval: c.heartbeat_interval_ms,
            });
        }
        Ok(())
    }
}

/// Expand ~ to home directory.
fn expand_tilde(path: &Path) -> PathBuf {
    if let Some(rest) = path.to_str().and_then(|s| s.strip_prefix("~/")) {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    path.to_path_buf()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> Config {
        let mut config = Config::default();
        config.server.endpoint = "ws://localhost:9010/api/devices".to_string();
        config
    }

    #[test]
    fn defaults_validate_once_endpoint_is_set() {
        assert!(matches!(
            Config::default().validate(),
            Err(ConfigError::MissingEndpoint)
        ));
        valid().validate().unwrap();
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let config = Config::from_toml(
            r#"
            [server]
            endpoint = "https://status.example.com/ws"
            auth_token = "secret"
            device_name = "Work  Laptop"

            [poll]
            interval_ms = 500
            "#,
        )
        .unwrap();

        assert_eq!(config.poll.interval_ms, 500);
        assert_eq!(config.poll.debounce_window_ms, 3_000);
        assert_eq!(config.connection.backoff_max_ms, 60_000);
        assert_eq!(config.server.device_id(), "work-laptop");
        assert_eq!(
            config.server.websocket_url().unwrap(),
            "wss://status.example.com/ws"
        );
    }

    #[test]
    fn endpoint_schemes() {
        let mut server = ServerConfig::default();
        server.endpoint = "status.local:8080".into();
        assert_eq!(server.websocket_url().unwrap(), "ws://status.local:8080");
        server.endpoint = "http://status.local".into();
        assert_eq!(server.websocket_url().unwrap(), "ws://status.local");
        server.endpoint = "ftp://status.local".into();
        assert!(matches!(
            server.websocket_url(),
            Err(ConfigError::UnsupportedScheme(_))
        ));
    }

    #[test]
    fn rejects_zero_intervals() {
        let mut config = valid();
        config.poll.interval_ms = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ZeroDuration("poll.interval_ms"))
        ));
    }

    #[test]
    fn rejects_inverted_backoff_and_heartbeat() {
        let mut config = valid();
        config.connection.backoff_min_ms = 10_000;
        config.connection.backoff_max_ms = 5_000;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::BackoffBounds { .. })
        ));

        let mut config = valid();
        config.connection.heartbeat_timeout_ms = config.connection.heartbeat_interval_ms;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::HeartbeatTimeout { .. })
        ));
    }

    #[test]
    fn close_timeout_fits_in_heartbeat_interval() {
        let mut config = valid();
        config.connection.heartbeat_interval_ms = 1_000;
        config.connection.heartbeat_timeout_ms = 3_000;
        config.connection.close_timeout_ms = 2_000;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::CloseTimeout {
                close: 2_000,
                interval: 1_000
            })
        ));

        config.connection.close_timeout_ms = 1_000;
        config.validate().unwrap();
    }

    #[test]
    fn env_overrides_apply() {
        let mut config = valid();
        config.apply_env_overrides(|key| match key {
            "PRESENCE_AUTH_TOKEN" => Some("from-env".into()),
            "PRESENCE_POLL_INTERVAL_MS" => Some("750".into()),
            "PRESENCE_DEBOUNCE_MS" => Some("not-a-number".into()),
            _ => None,
        });
        assert_eq!(config.server.auth_token, "from-env");
        assert_eq!(config.poll.interval_ms, 750);
        assert_eq!(config.poll.debounce_window_ms, 3_000);
    }
}
